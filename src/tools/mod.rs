//! Tool descriptors and call dispatch.
//!
//! [`ToolDispatcher`] turns a pilot's [`FunctionRef`]s into the tool
//! descriptors advertised to the remote planner, remembers which local
//! callable backs each advertised name, and executes the tool calls a paused
//! run asks for.  Dispatch never fails: whatever goes wrong while decoding
//! arguments or running the function is rendered into the output string the
//! planner receives.

pub mod builtins;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::{ToolCall, ToolOutput};
use crate::cache::KeyedCache;
use crate::error::{Error, Result};
use crate::functions::{FunctionRegistry, ResolvedFunction};
use crate::pilot::{FunctionKind, FunctionRef};

// ── Tool descriptors ────────────────────────────────────────

/// A tool as advertised on a remote assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolSpec {
    CodeInterpreter,
    FileSearch,
    Function {
        function: FunctionSpec,
    },
    /// Tool kinds this crate does not model.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolSpec {
    pub fn function_name(&self) -> Option<&str> {
        match self {
            ToolSpec::Function { function } => Some(function.name.as_str()),
            _ => None,
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────

/// Binds advertised function names to local callables and runs them.
pub struct ToolDispatcher {
    registry: Arc<FunctionRegistry>,
    bound: KeyedCache<String, Arc<ResolvedFunction>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self::with_retry_budget(registry, crate::cache::DEFAULT_RETRY_BUDGET)
    }

    pub fn with_retry_budget(registry: Arc<FunctionRegistry>, retry_budget: usize) -> Self {
        Self {
            registry,
            bound: KeyedCache::with_retry_budget(retry_budget),
        }
    }

    /// Build the descriptor for one function reference.
    ///
    /// Built-in kinds map to fixed descriptors.  Plain functions are
    /// resolved through the registry and advertised under [`tool_name`] of
    /// their dotted name, which is also the key a later tool call is
    /// dispatched by.  A name already bound to a different function is an
    /// error.
    pub fn build_tool(&self, function_ref: &FunctionRef) -> Result<ToolSpec> {
        match function_ref.kind {
            FunctionKind::FileSearch => return Ok(ToolSpec::FileSearch),
            FunctionKind::CodeInterpreter => return Ok(ToolSpec::CodeInterpreter),
            FunctionKind::Function => {}
        }

        let resolved = Arc::new(self.registry.resolve(&function_ref.method_full_name)?);
        let name = tool_name(&resolved.full_name);

        let bound = self.bound.get_or_add_with(name.clone(), || resolved.clone())?;
        if bound.full_name != resolved.full_name {
            return Err(Error::ToolNameConflict {
                name,
                bound: bound.full_name.clone(),
                requested: resolved.full_name.clone(),
            });
        }

        Ok(ToolSpec::Function {
            function: FunctionSpec {
                name,
                description: function_ref
                    .description
                    .clone()
                    .or_else(|| resolved.description.clone()),
                parameters: resolved.parameters.clone(),
            },
        })
    }

    /// Whether a callable is bound under `name`.
    pub fn is_bound(&self, name: &str) -> Result<bool> {
        Ok(self.bound.get(&name.to_string())?.is_some())
    }

    /// Execute one tool call.  Every failure becomes the output text.
    pub async fn invoke(&self, call: &ToolCall) -> ToolOutput {
        let output = match self.try_invoke(call).await {
            Ok(value) => render_value(value),
            Err(e) => {
                warn!(tool = %call.function_name, call_id = %call.call_id, "tool call failed: {e}");
                error_text(&e)
            }
        };
        ToolOutput {
            call_id: call.call_id.clone(),
            output,
        }
    }

    async fn try_invoke(&self, call: &ToolCall) -> Result<Value> {
        let function = self
            .bound
            .get(&call.function_name)?
            .ok_or_else(|| Error::ToolInvocation {
                name: call.function_name.clone(),
                message: "no local function is bound to this name".into(),
            })?;

        let args = parse_arguments(&call.arguments_json).map_err(|e| Error::ToolInvocation {
            name: call.function_name.clone(),
            message: format!("arguments are not valid JSON: {e}"),
        })?;

        debug!(tool = %function.full_name, call_id = %call.call_id, "invoking tool");

        // Run on its own task so a panicking handler cannot take the run down.
        let callable = function.callable.clone();
        let joined = tokio::spawn(async move { callable.call(args).await }).await;

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::ToolInvocation {
                name: call.function_name.clone(),
                message: format!("{e:#}"),
            }),
            Err(join) => Err(Error::ToolInvocation {
                name: call.function_name.clone(),
                message: if join.is_panic() {
                    "the function panicked".into()
                } else {
                    "the function was aborted".into()
                },
            }),
        }
    }
}

/// Longest function name the remote API accepts.
const MAX_TOOL_NAME_LEN: usize = 64;

/// Advertised name for a dotted function name: `Acme.Weather.GetWeather`
/// becomes `Acme_Weather_GetWeather`.  Characters outside `[A-Za-z0-9_-]`
/// are replaced with `_`, and overlong names keep their trailing part.
pub fn tool_name(full_name: &str) -> String {
    let name: String = full_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    match name.len().checked_sub(MAX_TOOL_NAME_LEN) {
        Some(excess) if excess > 0 => name[excess..].to_string(),
        _ => name,
    }
}

/// Output for a call the dispatcher refused to run.
pub fn refused(call: &ToolCall, reason: &str) -> ToolOutput {
    ToolOutput {
        call_id: call.call_id.clone(),
        output: json!({ "error": reason }).to_string(),
    }
}

fn parse_arguments(raw: &str) -> serde_json::Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

/// Strings go back verbatim, everything else as JSON text.
fn render_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn error_text(err: &Error) -> String {
    let message = match err {
        Error::ToolInvocation { message, .. } => message.clone(),
        other => other.to_string(),
    };
    json!({ "error": message }).to_string()
}
