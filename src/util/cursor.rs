//! Opaque pagination cursors.
//!
//! A cursor wraps the underlying row offset in a versioned, base64-encoded
//! token. Callers must treat it as opaque; any token this module did not
//! produce decodes to [`MemoryBankError::InvalidCursor`].

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{MemoryBankError, Result};

const CURSOR_VERSION: &str = "v1";

/// Encode a row offset as an opaque cursor token.
#[must_use]
pub fn encode(offset: u64) -> String {
    URL_SAFE_NO_PAD.encode(format!("{CURSOR_VERSION}:{offset}"))
}

/// Decode a cursor token back to its row offset.
///
/// # Errors
///
/// Returns `InvalidCursor` for anything that is not a token produced by
/// [`encode`].
pub fn decode(cursor: &str) -> Result<u64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| MemoryBankError::InvalidCursor)?;
    let text = String::from_utf8(bytes).map_err(|_| MemoryBankError::InvalidCursor)?;
    let offset = text
        .strip_prefix(CURSOR_VERSION)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or(MemoryBankError::InvalidCursor)?;
    offset
        .parse::<u64>()
        .map_err(|_| MemoryBankError::InvalidCursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn round_trip() {
        for offset in [0, 1, 100, 165, u64::MAX] {
            assert_eq!(decode(&encode(offset)).unwrap(), offset);
        }
    }

    #[test]
    fn cursors_are_opaque() {
        assert!(!encode(100).contains("100"));
    }

    #[test]
    fn garbage_is_rejected() {
        for cursor in ["", "not-base64!", "djE6YWJj", "100", "djI6MTAw"] {
            let err = decode(cursor).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidCursor, "cursor: {cursor}");
        }
    }
}
