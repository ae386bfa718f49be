//! Scripted in-memory stand-in for the remote assistant API.
//!
//! Runs follow a per-run script of steps.  `retrieve_run` moves a run one
//! step forward unless it is waiting on tool outputs; `submit_tool_outputs`
//! records the outputs and moves it forward.  Reaching `completed` appends
//! the scripted reply as an assistant message.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use pilotwire::api::{
    AssistantApi, AssistantObject, AssistantSpec, MessageObject, NewMessage, RunObject, RunStatus,
    ThreadObject, ToolOutput,
};
use pilotwire::error::{Error, Result};
use pilotwire::runs::RunPolicy;

#[derive(Debug, Clone)]
pub enum Step {
    Status(&'static str),
    /// Pause on these `(function name, arguments)` calls.
    Action(Vec<(&'static str, &'static str)>),
}

#[derive(Debug, Clone)]
pub struct RunScript {
    pub steps: Vec<Step>,
    pub reply: Option<String>,
}

impl RunScript {
    pub fn new(steps: Vec<Step>, reply: Option<&str>) -> Self {
        Self {
            steps,
            reply: reply.map(String::from),
        }
    }

    pub fn completes_with(reply: &str) -> Self {
        Self::new(
            vec![Step::Status("queued"), Step::Status("in_progress"), Step::Status("completed")],
            Some(reply),
        )
    }
}

struct ActiveRun {
    run: RunObject,
    script: RunScript,
    position: usize,
}

#[derive(Default)]
struct State {
    next_id: usize,
    assistants: Vec<AssistantObject>,
    threads: HashMap<String, ThreadObject>,
    /// Oldest first.
    messages: HashMap<String, Vec<MessageObject>>,
    runs: HashMap<String, ActiveRun>,
    /// Run ids per thread, oldest first.
    thread_runs: HashMap<String, Vec<String>>,
    scripts: VecDeque<RunScript>,
    created_specs: Vec<AssistantSpec>,
    modified: Vec<(String, AssistantSpec)>,
    deleted_assistants: Vec<String>,
    deleted_threads: Vec<String>,
    submitted: Vec<Vec<ToolOutput>>,
    cancelled_runs: Vec<String>,
    failing_deletes: HashSet<String>,
}

#[derive(Default)]
pub struct Counters {
    pub list_assistants: AtomicUsize,
    pub create_assistant: AtomicUsize,
    pub retrieve_assistant: AtomicUsize,
    pub retrieve_run: AtomicUsize,
    pub create_run: AtomicUsize,
}

#[derive(Default)]
pub struct FakeApi {
    state: Mutex<State>,
    pub counters: Counters,
    /// Delay inside `create_assistant`, to widen race windows.
    pub create_delay: Option<Duration>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            create_delay: Some(delay),
            ..Self::default()
        })
    }

    fn next_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}_{}", state.next_id)
    }

    /// Queue the script for the next created run.
    pub fn script_run(&self, script: RunScript) {
        self.state.lock().unwrap().scripts.push_back(script);
    }

    /// Pre-existing remote assistant (e.g. created by an earlier process).
    pub fn seed_assistant(&self, name: &str, user: &str, instructions: &str, model: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state, "asst");
        state.assistants.push(AssistantObject {
            id: id.clone(),
            name: Some(name.to_string()),
            model: model.to_string(),
            instructions: Some(instructions.to_string()),
            tools: Vec::new(),
            metadata: HashMap::from([("User".to_string(), user.to_string())]),
        });
        id
    }

    pub fn seed_thread(&self, metadata: HashMap<String, String>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state, "thread");
        state.threads.insert(
            id.clone(),
            ThreadObject {
                id: id.clone(),
                metadata,
            },
        );
        state.messages.insert(id.clone(), Vec::new());
        id
    }

    pub fn seed_message(&self, thread_id: &str, role: &str, text: &str) {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state, "msg");
        state
            .messages
            .entry(thread_id.to_string())
            .or_default()
            .push(text_message(id, role, text));
    }

    pub fn fail_delete_of(&self, assistant_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deletes
            .insert(assistant_id.to_string());
    }

    pub fn assistants(&self) -> Vec<AssistantObject> {
        self.state.lock().unwrap().assistants.clone()
    }

    pub fn created_specs(&self) -> Vec<AssistantSpec> {
        self.state.lock().unwrap().created_specs.clone()
    }

    pub fn modified(&self) -> Vec<(String, AssistantSpec)> {
        self.state.lock().unwrap().modified.clone()
    }

    pub fn deleted_assistants(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_assistants.clone()
    }

    pub fn deleted_threads(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_threads.clone()
    }

    pub fn live_threads(&self) -> usize {
        self.state.lock().unwrap().threads.len()
    }

    pub fn submitted(&self) -> Vec<Vec<ToolOutput>> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn cancelled_runs(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled_runs.clone()
    }

    pub fn messages(&self, thread_id: &str) -> Vec<MessageObject> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Put `active` into the state its current step describes.
    fn apply_step(state: &mut State, run_id: &str) {
        let Some(active) = state.runs.get_mut(run_id) else {
            return;
        };
        let step = active.script.steps[active.position].clone();
        match step {
            Step::Status(status) => {
                active.run.status = RunStatus::from(status.to_string());
                active.run.required_action = None;
            }
            Step::Action(calls) => {
                active.run.status = RunStatus::RequiresAction;
                let tool_calls: Vec<_> = calls
                    .iter()
                    .enumerate()
                    .map(|(i, (name, args))| {
                        json!({
                            "id": format!("call_{}_{i}", active.position),
                            "type": "function",
                            "function": { "name": name, "arguments": args }
                        })
                    })
                    .collect();
                active.run.required_action = Some(
                    serde_json::from_value(json!({
                        "type": "submit_tool_outputs",
                        "submit_tool_outputs": { "tool_calls": tool_calls }
                    }))
                    .unwrap(),
                );
            }
        }

        if active.run.status == RunStatus::Completed {
            if let Some(reply) = active.script.reply.take() {
                let thread_id = active.run.thread_id.clone();
                let id = Self::next_id(state, "msg");
                state
                    .messages
                    .entry(thread_id)
                    .or_default()
                    .push(text_message(id, "assistant", &reply));
            }
        }
    }

    fn advance(state: &mut State, run_id: &str) {
        if let Some(active) = state.runs.get_mut(run_id) {
            if active.position + 1 < active.script.steps.len() {
                active.position += 1;
            }
        }
        Self::apply_step(state, run_id);
    }
}

pub fn text_message(id: String, role: &str, text: &str) -> MessageObject {
    serde_json::from_value(json!({
        "id": id,
        "role": role,
        "content": [{ "type": "text", "text": { "value": text, "annotations": [] } }]
    }))
    .unwrap()
}

/// Fast polling for tests.
pub fn quick_policy() -> RunPolicy {
    RunPolicy {
        poll_interval: Duration::from_millis(1),
        wait_timeout: Duration::from_millis(50),
        max_run_duration: Duration::from_secs(5),
        max_polls: 500,
    }
}

fn not_found(what: &str, id: &str) -> Error {
    Error::Api {
        status: 404,
        message: format!("No {what} found with id '{id}'."),
    }
}

#[async_trait]
impl AssistantApi for FakeApi {
    async fn list_assistants(&self) -> Result<Vec<AssistantObject>> {
        self.counters.list_assistants.fetch_add(1, Ordering::SeqCst);
        let mut all = self.state.lock().unwrap().assistants.clone();
        all.reverse();
        Ok(all)
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<AssistantObject> {
        self.counters.create_assistant.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state, "asst");
        let assistant = AssistantObject {
            id,
            name: Some(spec.name.clone()),
            model: spec.model.clone(),
            instructions: Some(spec.instructions.clone()),
            tools: spec.tools.clone(),
            metadata: spec.metadata.clone(),
        };
        state.created_specs.push(spec.clone());
        state.assistants.push(assistant.clone());
        Ok(assistant)
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<AssistantObject> {
        self.counters.retrieve_assistant.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .assistants
            .iter()
            .find(|a| a.id == assistant_id)
            .cloned()
            .ok_or_else(|| not_found("assistant", assistant_id))
    }

    async fn modify_assistant(&self, assistant_id: &str, spec: &AssistantSpec) -> Result<AssistantObject> {
        let mut state = self.state.lock().unwrap();
        state.modified.push((assistant_id.to_string(), spec.clone()));
        let assistant = state
            .assistants
            .iter_mut()
            .find(|a| a.id == assistant_id)
            .ok_or_else(|| not_found("assistant", assistant_id))?;
        assistant.model = spec.model.clone();
        assistant.instructions = Some(spec.instructions.clone());
        assistant.tools = spec.tools.clone();
        Ok(assistant.clone())
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(assistant_id) {
            return Err(Error::Api {
                status: 500,
                message: format!("could not delete {assistant_id}"),
            });
        }
        let before = state.assistants.len();
        state.assistants.retain(|a| a.id != assistant_id);
        let deleted = state.assistants.len() < before;
        if deleted {
            state.deleted_assistants.push(assistant_id.to_string());
        }
        Ok(deleted)
    }

    async fn create_thread(
        &self,
        messages: &[NewMessage],
        metadata: &HashMap<String, String>,
    ) -> Result<ThreadObject> {
        let id = self.seed_thread(metadata.clone());
        for m in messages {
            self.seed_message(&id, &m.role, &m.content);
        }
        Ok(ThreadObject {
            id,
            metadata: metadata.clone(),
        })
    }

    async fn retrieve_thread(&self, thread_id: &str) -> Result<ThreadObject> {
        self.state
            .lock()
            .unwrap()
            .threads
            .get(thread_id)
            .cloned()
            .ok_or_else(|| not_found("thread", thread_id))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let deleted = state.threads.remove(thread_id).is_some();
        state.messages.remove(thread_id);
        if deleted {
            state.deleted_threads.push(thread_id.to_string());
        }
        Ok(deleted)
    }

    async fn create_message(&self, thread_id: &str, message: &NewMessage) -> Result<MessageObject> {
        if !self.state.lock().unwrap().threads.contains_key(thread_id) {
            return Err(not_found("thread", thread_id));
        }
        self.seed_message(thread_id, &message.role, &message.content);
        Ok(self.messages(thread_id).pop().unwrap())
    }

    async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<MessageObject>> {
        let mut messages = self.messages(thread_id);
        messages.reverse();
        messages.truncate(limit);
        Ok(messages)
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunObject> {
        self.counters.create_run.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.threads.contains_key(thread_id) {
            return Err(not_found("thread", thread_id));
        }
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| RunScript::completes_with("ok"));
        let id = Self::next_id(&mut state, "run");
        let run: RunObject = serde_json::from_value(json!({
            "id": id,
            "thread_id": thread_id,
            "assistant_id": assistant_id,
            "status": "queued"
        }))
        .unwrap();
        state.runs.insert(
            id.clone(),
            ActiveRun {
                run,
                script,
                position: 0,
            },
        );
        state
            .thread_runs
            .entry(thread_id.to_string())
            .or_default()
            .push(id.clone());
        Self::apply_step(&mut state, &id);
        Ok(state.runs[&id].run.clone())
    }

    async fn retrieve_run(&self, _thread_id: &str, run_id: &str) -> Result<RunObject> {
        self.counters.retrieve_run.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let waiting = match state.runs.get(run_id) {
            Some(active) => active.run.status == RunStatus::RequiresAction,
            None => return Err(not_found("run", run_id)),
        };
        if !waiting {
            Self::advance(&mut state, run_id);
        }
        Ok(state.runs[run_id].run.clone())
    }

    async fn list_runs(&self, thread_id: &str, limit: usize) -> Result<Vec<RunObject>> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<RunObject> = state
            .thread_runs
            .get(thread_id)
            .map(|ids| ids.iter().map(|id| state.runs[id].run.clone()).collect())
            .unwrap_or_default();
        runs.reverse();
        runs.truncate(limit);
        Ok(runs)
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunObject> {
        let mut state = self.state.lock().unwrap();
        if !state.runs.contains_key(run_id) {
            return Err(not_found("run", run_id));
        }
        state.submitted.push(outputs.to_vec());
        Self::advance(&mut state, run_id);
        Ok(state.runs[run_id].run.clone())
    }

    async fn cancel_run(&self, _thread_id: &str, run_id: &str) -> Result<RunObject> {
        let mut state = self.state.lock().unwrap();
        state.cancelled_runs.push(run_id.to_string());
        let active = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| not_found("run", run_id))?;
        active.run.status = RunStatus::Cancelling;
        Ok(active.run.clone())
    }
}

// ── Demo pilots and functions ───────────────────────────────

use pilotwire::client::{ClientOptions, PilotClient};
use pilotwire::functions::{typed, FunctionRegistry, NoArgs, ToolType};
use pilotwire::pilot::{FunctionRef, PilotDefinition};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WeatherArgs {
    pub city: String,
}

fn explode() -> anyhow::Result<String> {
    panic!("weather station on fire")
}

pub fn demo_functions() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register_type(
        ToolType::new("Demo", "Weather")
            .with_static(
                "GetWeather",
                typed(|args: WeatherArgs| async move {
                    if args.city == "Paris" {
                        Ok("22°C, sunny".to_string())
                    } else {
                        anyhow::bail!("no forecast for {}", args.city)
                    }
                })
                .with_description("Current weather for a city"),
            )
            .with_static("Explode", typed(|_: NoArgs| async move { explode() })),
    );
    pilotwire::tools::builtins::register(&mut registry);
    registry
}

pub fn demo_pilots() -> Vec<PilotDefinition> {
    vec![
        PilotDefinition::new("Master", "You are a helpful assistant.", "General questions"),
        PilotDefinition::new(
            "Weather",
            "Answer weather questions with the tools you have.",
            "Weather reports",
        )
        .with_function(FunctionRef::function("Demo.Weather.GetWeather"))
        .with_function(FunctionRef::function("Demo.Weather.Explode")),
    ]
}

pub fn demo_client(api: Arc<FakeApi>) -> PilotClient {
    demo_client_with_policy(api, quick_policy())
}

pub fn demo_client_with_policy(api: Arc<FakeApi>, run_policy: RunPolicy) -> PilotClient {
    let options = ClientOptions {
        run_policy,
        ..ClientOptions::default()
    };
    PilotClient::new(api, demo_functions(), demo_pilots(), options).unwrap()
}
