//! The tool surface: a flat catalog of uniformly-shaped tool calls.
//!
//! Each [`Tool`] carries its name, description, JSON Schemas for input and
//! output, and a handler that funnels through the facade. Outputs always
//! include `active_branch` and either `data` or a typed `error`; errors are
//! returned, never thrown across the boundary.

pub mod catalog;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::bank::{BankResponse, StructuredMemoryBank};
use crate::error::{ErrorBody, MemoryBankError, Result};

type ToolHandler =
    Arc<dyn Fn(Arc<StructuredMemoryBank>, Value) -> BoxFuture<'static, ToolResponse> + Send + Sync>;

/// The uniform tool output envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub ok: bool,
    /// The branch the session was actually bound to when the result was
    /// produced (the requested branch on early failures).
    pub active_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ToolResponse {
    #[must_use]
    pub fn success<T: Serialize>(response: BankResponse<T>) -> Self {
        match serde_json::to_value(&response.data) {
            Ok(data) => Self {
                ok: true,
                active_branch: response.active_branch,
                data: Some(data),
                error: None,
            },
            Err(err) => Self::failure(
                &MemoryBankError::Fatal {
                    message: format!("result serialization failed: {err}"),
                },
                &response.active_branch,
            ),
        }
    }

    #[must_use]
    pub fn failure(error: &MemoryBankError, active_branch: &str) -> Self {
        Self {
            ok: false,
            active_branch: active_branch.to_string(),
            data: None,
            error: Some(error.to_body()),
        }
    }
}

/// Schema shape of every tool's output; used only for schema generation.
#[derive(Debug, Serialize, JsonSchema)]
struct ToolOutput<T> {
    ok: bool,
    active_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

/// One entry in the catalog.
pub struct Tool {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: RootSchema,
    pub output_schema: RootSchema,
    handler: ToolHandler,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Build a tool from a typed handler.
///
/// The handler's request type defines the input schema (unknown fields are
/// rejected by its serde derive); its success payload defines the `data`
/// half of the output schema.
pub(crate) fn tool<Req, T, F, Fut>(name: &'static str, description: &'static str, f: F) -> Tool
where
    Req: DeserializeOwned + JsonSchema + Send + 'static,
    T: Serialize + JsonSchema + Send + 'static,
    F: Fn(Arc<StructuredMemoryBank>, Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<BankResponse<T>>> + Send + 'static,
{
    let generator = || SchemaSettings::draft07().into_generator();
    let input_schema = generator().into_root_schema_for::<Req>();
    let output_schema = generator().into_root_schema_for::<ToolOutput<T>>();

    let handler: ToolHandler = Arc::new(move |bank, input| {
        let f = f.clone();
        Box::pin(async move {
            let branch_hint = requested_branch(&bank, &input);
            let request: Req = match serde_json::from_value(input) {
                Ok(request) => request,
                Err(err) => {
                    return ToolResponse::failure(
                        &MemoryBankError::Validation {
                            entity: format!("{name} input"),
                            reason: err.to_string(),
                        },
                        &branch_hint,
                    );
                }
            };

            match f(bank, request).await {
                Ok(response) => ToolResponse::success(response),
                Err(err) => ToolResponse::failure(&err, &branch_hint),
            }
        })
    });

    Tool {
        name,
        description,
        input_schema,
        output_schema,
        handler,
    }
}

/// A tool's published surface, without the handler.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: RootSchema,
    pub output_schema: RootSchema,
}

/// The catalog: name -> tool, plus dispatch with deadlines.
pub struct ToolCatalog {
    bank: Arc<StructuredMemoryBank>,
    tools: BTreeMap<&'static str, Tool>,
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ToolCatalog {
    #[must_use]
    pub fn new(bank: Arc<StructuredMemoryBank>) -> Self {
        let tools = catalog::build_tools()
            .into_iter()
            .map(|tool| (tool.name, tool))
            .collect();
        Self { bank, tools }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// The machine-readable surface dump agents consume instead of reading
    /// source code.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema.clone(),
                output_schema: tool.output_schema.clone(),
            })
            .collect()
    }

    /// Dispatch one tool call.
    ///
    /// `deadline` defaults to the configured call deadline. On expiry the
    /// call aborts at its next suspension point and reports a connection
    /// error; timeouts never produce `Fatal`.
    pub async fn invoke(&self, name: &str, input: Value, deadline: Option<Duration>) -> ToolResponse {
        let branch_hint = requested_branch(&self.bank, &input);

        let Some(tool) = self.tools.get(name) else {
            return ToolResponse::failure(
                &MemoryBankError::NotFound {
                    entity: "tool",
                    id: name.to_string(),
                },
                &branch_hint,
            );
        };

        let deadline = deadline.unwrap_or(self.bank.config().call_deadline_default);
        let call = (tool.handler)(Arc::clone(&self.bank), input);
        match tokio::time::timeout(deadline, call).await {
            Ok(response) => response,
            Err(_) => ToolResponse::failure(
                &MemoryBankError::Connection {
                    message: format!("{name} exceeded its {deadline:?} deadline"),
                    saturated: false,
                },
                &branch_hint,
            ),
        }
    }
}

fn requested_branch(bank: &StructuredMemoryBank, input: &Value) -> String {
    let requested = input.get("branch").and_then(Value::as_str);
    bank.resolve_branch(requested)
}
