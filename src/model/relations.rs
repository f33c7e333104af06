//! The closed set of link relations.
//!
//! Canonical relation names, their inverses (a partial involution), and the
//! human-readable aliases accepted at the tool boundary. Everything below the
//! tool boundary operates on canonical names only.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// How a relation participates in the dependency subgraph used for cycle
/// detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyRole {
    /// Not a dependency edge.
    None,
    /// `from` depends on `to`.
    Forward,
    /// `to` depends on `from` (the stored edge points the other way).
    Reverse,
}

/// One entry in the relation table.
#[derive(Debug, Clone, Copy)]
pub struct RelationDef {
    pub canonical: &'static str,
    /// The canonical inverse, when one is declared.
    pub inverse: Option<&'static str>,
    /// Tool-boundary aliases resolving to this relation.
    pub aliases: &'static [&'static str],
    pub dependency: DependencyRole,
}

/// The fixed relation table, loaded once at startup.
pub static RELATIONS: &[RelationDef] = &[
    RelationDef {
        canonical: "depends_on",
        inverse: Some("blocks"),
        aliases: &["depends-on", "depends on", "requires", "is_blocked_by"],
        dependency: DependencyRole::Forward,
    },
    RelationDef {
        canonical: "blocks",
        inverse: Some("depends_on"),
        aliases: &["blocking", "is_blocking"],
        dependency: DependencyRole::Reverse,
    },
    RelationDef {
        canonical: "child_of",
        inverse: Some("parent_of"),
        aliases: &["child", "child-of", "child of"],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "parent_of",
        inverse: Some("child_of"),
        aliases: &["parent", "parent-of", "parent of"],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "subtask_of",
        inverse: Some("has_subtask"),
        aliases: &["subtask", "subtask-of"],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "has_subtask",
        inverse: Some("subtask_of"),
        aliases: &[],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "related_to",
        inverse: Some("related_to"),
        aliases: &["related", "related-to", "related to", "relates_to", "relates to"],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "duplicate_of",
        inverse: Some("has_duplicate"),
        aliases: &["duplicate", "duplicate-of"],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "has_duplicate",
        inverse: Some("duplicate_of"),
        aliases: &[],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "references",
        inverse: Some("referenced_by"),
        aliases: &["ref", "refers_to", "refers to"],
        dependency: DependencyRole::None,
    },
    RelationDef {
        canonical: "referenced_by",
        inverse: Some("references"),
        aliases: &[],
        dependency: DependencyRole::None,
    },
    // One-way: a mention does not imply the target knows about it.
    RelationDef {
        canonical: "mentions",
        inverse: None,
        aliases: &["mention"],
        dependency: DependencyRole::None,
    },
];

static BY_NAME: Lazy<HashMap<&'static str, &'static RelationDef>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for def in RELATIONS {
        map.insert(def.canonical, def);
        for alias in def.aliases {
            map.insert(*alias, def);
        }
    }
    map
});

/// Resolve a canonical name or alias. Matching is case-insensitive and
/// trims surrounding whitespace; unknown names return `None`.
#[must_use]
pub fn canonicalize(input: &str) -> Option<&'static str> {
    let normalized = input.trim().to_lowercase();
    BY_NAME.get(normalized.as_str()).map(|def| def.canonical)
}

/// Whether `name` is already a canonical relation.
#[must_use]
pub fn is_canonical(name: &str) -> bool {
    RELATIONS.iter().any(|def| def.canonical == name)
}

/// The declared inverse of a canonical relation.
#[must_use]
pub fn inverse_of(canonical: &str) -> Option<&'static str> {
    RELATIONS
        .iter()
        .find(|def| def.canonical == canonical)
        .and_then(|def| def.inverse)
}

/// How a canonical relation participates in the dependency subgraph.
#[must_use]
pub fn dependency_role(canonical: &str) -> DependencyRole {
    RELATIONS
        .iter()
        .find(|def| def.canonical == canonical)
        .map_or(DependencyRole::None, |def| def.dependency)
}

/// All canonical relation names.
#[must_use]
pub fn all_canonical() -> Vec<&'static str> {
    RELATIONS.iter().map(|def| def.canonical).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical() {
        assert_eq!(canonicalize("depends on"), Some("depends_on"));
        assert_eq!(canonicalize("REQUIRES"), Some("depends_on"));
        assert_eq!(canonicalize("  parent  "), Some("parent_of"));
        assert_eq!(canonicalize("related"), Some("related_to"));
        assert_eq!(canonicalize("ref"), Some("references"));
    }

    #[test]
    fn canonical_names_resolve_to_themselves() {
        for def in RELATIONS {
            assert_eq!(canonicalize(def.canonical), Some(def.canonical));
        }
    }

    #[test]
    fn unknown_relations_are_rejected() {
        assert_eq!(canonicalize("friend_of"), None);
        assert_eq!(canonicalize(""), None);
    }

    #[test]
    fn inverse_is_an_involution() {
        for def in RELATIONS {
            if let Some(inverse) = def.inverse {
                assert_eq!(
                    inverse_of(inverse),
                    Some(def.canonical),
                    "inverse of {} should map back",
                    def.canonical
                );
            }
        }
    }

    #[test]
    fn related_to_is_self_inverse() {
        assert_eq!(inverse_of("related_to"), Some("related_to"));
    }

    #[test]
    fn mentions_has_no_inverse() {
        assert_eq!(inverse_of("mentions"), None);
    }

    #[test]
    fn canonical_listing_is_complete() {
        let all = all_canonical();
        assert_eq!(all.len(), RELATIONS.len());
        assert!(all.contains(&"depends_on"));
        assert!(all.contains(&"mentions"));
        assert!(all.iter().all(|name| is_canonical(name)));
    }

    #[test]
    fn dependency_subgraph_has_both_directions() {
        assert_eq!(dependency_role("depends_on"), DependencyRole::Forward);
        assert_eq!(dependency_role("blocks"), DependencyRole::Reverse);
        assert_eq!(dependency_role("related_to"), DependencyRole::None);
    }
}
