//! High-level entry point tying the registry, the run coordinator and the
//! remote API together.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{user_metadata, AssistantApi, NewMessage, OpenAIAssistantsClient, ResponseFormat};
use crate::cache::DEFAULT_RETRY_BUDGET;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::functions::FunctionRegistry;
use crate::pilot::PilotDefinition;
use crate::registry::AssistantRegistry;
use crate::runs::{Answer, RunCoordinator, RunPolicy};
use crate::tools::ToolDispatcher;

pub const SUMMARY_ASSISTANT: &str = "SummaryAssistant";
pub const ASSUMPTION_ASSISTANT: &str = "AssumptionAssistant";

/// Messages summarized when the caller does not say otherwise.
pub const DEFAULT_SUMMARY_MESSAGES: usize = 10;

const SUMMARY_INSTRUCTIONS: &str = "\
Summarize the conversation you are given. Keep the key points, decisions and \
facts that later turns depend on; leave out greetings, small talk and anything \
repeated or off-topic. Write plain, well-ordered prose that is much shorter than \
the conversation but still gives another assistant enough context to continue it.";

const ASSUMPTION_INSTRUCTIONS: &str = r#"You route requests to AI pilots.
Each message contains a prompt followed by the JSON list of available pilots.
A pilot has a name, a description, instructions, a model and the functions it
can call. For every pilot, estimate how likely it is (0 to 100 percent) to
fulfil the prompt, taking into account whether it has the functions the task
needs. Always rate every pilot. Reply with JSON only, in this shape:
{"PilotAssumptions": [{"PilotName": "Weather", "ProbabilityInPercent": 90}]}"#;

/// One pilot's estimated fitness for a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PilotAssumption {
    pub pilot_name: String,
    pub probability_in_percent: f64,
}

#[derive(Deserialize)]
struct PilotAssumptions {
    #[serde(rename = "PilotAssumptions", default)]
    assumptions: Vec<PilotAssumption>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub run_policy: RunPolicy,
    pub retry_budget: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            run_policy: RunPolicy::default(),
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

pub struct PilotClient {
    api: Arc<dyn AssistantApi>,
    registry: AssistantRegistry,
    runs: RunCoordinator,
}

impl PilotClient {
    /// `functions` is consumed: registration is finished once the client
    /// exists.
    pub fn new(
        api: Arc<dyn AssistantApi>,
        functions: FunctionRegistry,
        pilots: Vec<PilotDefinition>,
        options: ClientOptions,
    ) -> Result<Self> {
        let dispatcher = Arc::new(ToolDispatcher::with_retry_budget(
            Arc::new(functions),
            options.retry_budget,
        ));
        let registry =
            AssistantRegistry::new(api.clone(), dispatcher.clone(), pilots, options.retry_budget)?;
        let runs = RunCoordinator::new(api.clone(), dispatcher.clone(), options.run_policy);
        Ok(Self {
            api,
            registry,
            runs,
        })
    }

    /// Build an HTTP-backed client from a loaded configuration.
    pub fn from_config(config: &Config, functions: FunctionRegistry) -> Result<Self> {
        let api = OpenAIAssistantsClient::with_config(
            config.resolve_api_key()?,
            config.base_url(),
            config.organization.clone(),
        )?;
        let options = ClientOptions {
            run_policy: config.run.policy(),
            retry_budget: config.cache.retry_budget,
        };
        Self::new(Arc::new(api), functions, config.pilots.clone(), options)
    }

    pub fn registry(&self) -> &AssistantRegistry {
        &self.registry
    }

    pub fn runs(&self) -> &RunCoordinator {
        &self.runs
    }

    // ── Conversations ───────────────────────────────────────

    /// Start a thread owned by `user` with `text` and answer it with the
    /// user's assistant for `pilot`.
    pub async fn ask_in_new_thread(
        &self,
        text: &str,
        pilot: &str,
        user: Option<&str>,
    ) -> Result<Answer> {
        self.ask_in_new_thread_with_cancel(text, pilot, user, &CancellationToken::new())
            .await
    }

    pub async fn ask_in_new_thread_with_cancel(
        &self,
        text: &str,
        pilot: &str,
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let assistant_id = self.registry.get_or_create(user, pilot).await?;
        let thread = self
            .api
            .create_thread(&[NewMessage::user(text)], &user_metadata(user))
            .await?;
        info!(thread_id = %thread.id, pilot, "thread started");
        self.runs
            .execute_with_cancel(&thread.id, &assistant_id, cancel)
            .await
    }

    /// Continue an existing thread.  Without `pilot` the assistant of the
    /// thread's most recent run answers.
    pub async fn ask(&self, text: &str, thread_id: &str, pilot: Option<&str>) -> Result<Answer> {
        self.ask_with_cancel(text, thread_id, pilot, &CancellationToken::new())
            .await
    }

    pub async fn ask_with_cancel(
        &self,
        text: &str,
        thread_id: &str,
        pilot: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let thread = self.api.retrieve_thread(thread_id).await?;
        let user = thread
            .user()
            .ok_or_else(|| Error::MissingThreadUser(thread_id.to_string()))?;

        let assistant_id = match pilot {
            Some(pilot) => self.registry.get_or_create(Some(user), pilot).await?,
            None => self.last_assistant(thread_id).await?,
        };

        self.api
            .create_message(thread_id, &NewMessage::user(text))
            .await?;
        self.runs
            .execute_with_cancel(thread_id, &assistant_id, cancel)
            .await
    }

    /// Run `assistant_id` on the thread as it is, without adding a message.
    pub async fn text_answer(&self, thread_id: &str, assistant_id: &str) -> Result<Answer> {
        self.runs.execute(thread_id, assistant_id).await
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        self.api.delete_thread(thread_id).await
    }

    async fn last_assistant(&self, thread_id: &str) -> Result<String> {
        let runs = self.api.list_runs(thread_id, 1).await?;
        runs.into_iter()
            .next()
            .map(|r| r.assistant_id)
            .ok_or_else(|| Error::NoPreviousRun(thread_id.to_string()))
    }

    // ── System assistants ───────────────────────────────────

    /// Summarize the last `message_count` messages of a thread.
    pub async fn conversation_summary(&self, thread_id: &str, message_count: usize) -> Result<Answer> {
        let mut messages = self.api.list_messages(thread_id, message_count).await?;
        messages.reverse();
        let conversation = messages
            .iter()
            .filter_map(|m| m.text().map(|t| format!("{}: {t}", m.role)))
            .collect::<Vec<_>>()
            .join("\n\n");
        if conversation.is_empty() {
            return Err(Error::Other(format!(
                "thread {thread_id} has no text messages to summarize"
            )));
        }

        let assistant_id = self
            .registry
            .get_or_create_system(SUMMARY_ASSISTANT, SUMMARY_INSTRUCTIONS, None)
            .await?;
        debug!(thread_id, messages = messages.len(), "summarizing conversation");
        self.with_temporary_thread(conversation, |tmp| async move {
            self.runs.execute(&tmp, &assistant_id).await
        })
        .await
    }

    /// Rate every registered pilot for `text`, best match first.
    pub async fn pilot_assumption(&self, text: &str) -> Result<Vec<PilotAssumption>> {
        let descriptions = serde_json::to_string(&self.registry.pilot_descriptions().await)?;
        let prompt = format!("Prompt: {text}\nAvailable pilots:\n{descriptions}");

        let assistant_id = self
            .registry
            .get_or_create_system(
                ASSUMPTION_ASSISTANT,
                ASSUMPTION_INSTRUCTIONS,
                Some(ResponseFormat::JsonObject),
            )
            .await?;
        let answer = self
            .with_temporary_thread(prompt, |tmp| async move {
                self.runs.execute(&tmp, &assistant_id).await
            })
            .await?;

        let decoded: PilotAssumptions = serde_json::from_str(&answer.text)?;
        let mut assumptions = decoded.assumptions;
        assumptions.sort_by(|a, b| b.probability_in_percent.total_cmp(&a.probability_in_percent));
        Ok(assumptions)
    }

    /// Like [`pilot_assumption`](Self::pilot_assumption) but with the
    /// context of an ongoing thread: a short summary plus its latest message.
    pub async fn pilot_assumption_in_thread(
        &self,
        text: &str,
        thread_id: &str,
    ) -> Result<Vec<PilotAssumption>> {
        let latest = self
            .api
            .list_messages(thread_id, 1)
            .await?
            .into_iter()
            .next()
            .and_then(|m| m.text())
            .unwrap_or_default();
        let summary = self.conversation_summary(thread_id, 4).await?;
        let context = format!(
            "Previous conversation:\n\nSummary: {}\n\nLast assistant message:\n\n{latest}",
            summary.text
        );
        self.pilot_assumption(&format!("{context}\n\n{text}")).await
    }

    /// Create a throwaway thread holding `content`, hand its id to `f`, and
    /// delete the thread afterwards whatever `f` returned.
    async fn with_temporary_thread<T, F, Fut>(&self, content: String, f: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let thread = self
            .api
            .create_thread(&[NewMessage::user(content)], &HashMap::new())
            .await?;
        let result = f(thread.id.clone()).await;
        if let Err(e) = self.api.delete_thread(&thread.id).await {
            warn!(thread_id = %thread.id, "failed to delete temporary thread: {e}");
        }
        result
    }

    // ── Pilot management ────────────────────────────────────

    pub async fn get_pilot(&self, name: &str) -> Result<Arc<PilotDefinition>> {
        self.registry.get_pilot(name).await
    }

    pub async fn add_pilot(&self, pilot: PilotDefinition) -> Result<()> {
        self.registry.add_pilot(pilot).await
    }

    pub async fn update_pilot(&self, pilot: PilotDefinition) -> Result<()> {
        self.registry.update_pilot(pilot).await
    }

    pub async fn delete_pilot(&self, name: &str) -> Result<()> {
        self.registry.delete_pilot(name).await
    }

    pub async fn pilots(&self) -> Vec<Arc<PilotDefinition>> {
        self.registry.pilots().await
    }

    /// Drop every cached assistant.  Tool bindings stay in place, so the
    /// client remains usable and rebuilds assistants on their next use.
    pub fn dispose(&self) -> Result<()> {
        self.registry.dispose()
    }
}
