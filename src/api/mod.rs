//! Remote assistant API abstraction.
//!
//! Defines the [`AssistantApi`] trait the rest of the crate talks to, the
//! resource types it exchanges, and the concrete HTTP implementation
//! ([`OpenAIAssistantsClient`]).  Only the fields the crate actually reads
//! are modelled; everything else in the remote payloads is ignored.

pub mod openai;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tools::ToolSpec;

pub use openai::OpenAIAssistantsClient;

/// Metadata key carrying the owning user on threads and assistants.
pub const USER_METADATA_KEY: &str = "User";

// ---------------------------------------------------------------------------
// Assistants
// ---------------------------------------------------------------------------

/// Everything needed to create or modify a remote assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantSpec {
    pub model: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_resources: Option<ToolResources>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_search: Option<FileSearchResources>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSearchResources {
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
}

/// `{"type": "json_object"}` or `{"type": "text"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

/// A remote assistant as returned by the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantObject {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AssistantObject {
    /// Names of the function tools this assistant advertises.
    pub fn function_names(&self) -> Vec<&str> {
        self.tools.iter().filter_map(ToolSpec::function_name).collect()
    }
}

// ---------------------------------------------------------------------------
// Threads and messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThreadObject {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ThreadObject {
    /// The user recorded in the thread metadata, if any.
    pub fn user(&self) -> Option<&str> {
        self.metadata.get(USER_METADATA_KEY).map(String::as_str)
    }
}

/// A message to append to a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: String,
    pub content: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageObject {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

impl MessageObject {
    /// Concatenated text parts; `None` when the message has no text.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text { text } => Some(text.value.as_str()),
                MessageContent::Other => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextContent {
    pub value: String,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Lifecycle of a run.  Anything the crate does not recognise is kept
/// verbatim in [`RunStatus::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
    Unknown(String),
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Expired => "expired",
            RunStatus::Unknown(s) => s,
        }
    }

    /// Still waiting on the remote side; nothing for us to do but poll.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling
        )
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => RunStatus::Queued,
            "in_progress" => RunStatus::InProgress,
            "requires_action" => RunStatus::RequiresAction,
            "cancelling" => RunStatus::Cancelling,
            "cancelled" => RunStatus::Cancelled,
            "failed" => RunStatus::Failed,
            "completed" => RunStatus::Completed,
            "expired" => RunStatus::Expired,
            _ => RunStatus::Unknown(s),
        }
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunObject {
    pub id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

impl RunObject {
    /// Tool calls the run is paused on (empty unless `RequiresAction`).
    pub fn required_tool_calls(&self) -> Vec<ToolCall> {
        self.required_action
            .as_ref()
            .map(|ra| {
                ra.submit_tool_outputs
                    .tool_calls
                    .iter()
                    .map(|tc| ToolCall {
                        call_id: tc.id.clone(),
                        function_name: tc.function.name.clone(),
                        arguments_json: tc.function.arguments.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequiredAction {
    pub submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitToolOutputs {
    #[serde(default)]
    pub tool_calls: Vec<RequiredToolCall>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequiredToolCall {
    pub id: String,
    pub function: RequiredFunction,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequiredFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// A request from a paused run to execute one local function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub call_id: String,
    pub function_name: String,
    pub arguments_json: String,
}

/// The result of one [`ToolCall`], submitted back to resume the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(rename = "tool_call_id")]
    pub call_id: String,
    pub output: String,
}

// ---------------------------------------------------------------------------
// AssistantApi trait
// ---------------------------------------------------------------------------

/// The remote operations the crate depends on.
///
/// List operations return the newest items first.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    async fn list_assistants(&self) -> Result<Vec<AssistantObject>>;
    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<AssistantObject>;
    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<AssistantObject>;
    async fn modify_assistant(
        &self,
        assistant_id: &str,
        spec: &AssistantSpec,
    ) -> Result<AssistantObject>;
    async fn delete_assistant(&self, assistant_id: &str) -> Result<bool>;

    async fn create_thread(
        &self,
        messages: &[NewMessage],
        metadata: &HashMap<String, String>,
    ) -> Result<ThreadObject>;
    async fn retrieve_thread(&self, thread_id: &str) -> Result<ThreadObject>;
    async fn delete_thread(&self, thread_id: &str) -> Result<bool>;

    async fn create_message(&self, thread_id: &str, message: &NewMessage)
        -> Result<MessageObject>;
    async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<MessageObject>>;

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunObject>;
    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject>;
    async fn list_runs(&self, thread_id: &str, limit: usize) -> Result<Vec<RunObject>>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunObject>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject>;
}

/// `{"User": user}` metadata map.
pub fn user_metadata(user: Option<&str>) -> HashMap<String, String> {
    HashMap::from([(USER_METADATA_KEY.to_string(), user.unwrap_or_default().to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_status_parses_known_and_unknown() {
        let run: RunObject = serde_json::from_value(json!({
            "id": "run_1",
            "thread_id": "thread_1",
            "assistant_id": "asst_1",
            "status": "requires_action",
            "required_action": {
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "GetWeather", "arguments": "{\"city\":\"Paris\"}" }
                    }]
                }
            }
        }))
        .unwrap();
        assert_eq!(run.status, RunStatus::RequiresAction);
        let calls = run.required_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, "call_1");
        assert_eq!(calls[0].function_name, "GetWeather");
        assert_eq!(calls[0].arguments_json, "{\"city\":\"Paris\"}");

        let odd: RunStatus = serde_json::from_value(json!("incomplete")).unwrap();
        assert_eq!(odd, RunStatus::Unknown("incomplete".into()));
        assert_eq!(odd.to_string(), "incomplete");
    }

    #[test]
    fn message_text_joins_text_parts_and_skips_others() {
        let msg: MessageObject = serde_json::from_value(json!({
            "id": "msg_1",
            "role": "assistant",
            "content": [
                { "type": "text", "text": { "value": "Hello", "annotations": [] } },
                { "type": "image_file", "image_file": { "file_id": "file_1" } },
                { "type": "text", "text": { "value": "Alice", "annotations": [] } }
            ]
        }))
        .unwrap();
        assert_eq!(msg.text().as_deref(), Some("Hello\nAlice"));

        let empty: MessageObject =
            serde_json::from_value(json!({ "id": "m", "role": "assistant", "content": [] }))
                .unwrap();
        assert_eq!(empty.text(), None);
    }

    #[test]
    fn tool_output_serializes_with_wire_name() {
        let out = ToolOutput {
            call_id: "call_1".into(),
            output: "22°C, sunny".into(),
        };
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!({ "tool_call_id": "call_1", "output": "22°C, sunny" })
        );
    }

    #[test]
    fn spec_omits_empty_optionals() {
        let spec = AssistantSpec {
            model: "gpt-4o".into(),
            name: "Master_alice".into(),
            description: None,
            instructions: "Be brief.".into(),
            tools: vec![ToolSpec::FileSearch],
            tool_resources: None,
            metadata: user_metadata(Some("alice")),
            response_format: Some(ResponseFormat::JsonObject),
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert!(v.get("description").is_none());
        assert!(v.get("tool_resources").is_none());
        assert_eq!(v["tools"], json!([{ "type": "file_search" }]));
        assert_eq!(v["metadata"]["User"], "alice");
        assert_eq!(v["response_format"], json!({ "type": "json_object" }));
    }
}
