//! Drives a run from submission to its final answer.
//!
//! [`RunCoordinator::execute`] submits a run and then loops: wait while the
//! remote side is busy, service tool calls when the run pauses on them,
//! stop on a terminal status.  The loop is bounded by [`RunPolicy`] (total
//! duration and poll count) and can be cut short with a
//! [`CancellationToken`]; in both cases the remote run is cancelled on a
//! best-effort basis before the error is returned.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{AssistantApi, RunObject, RunStatus, ToolOutput};
use crate::error::{Error, Result};
use crate::tools::{self, ToolDispatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    /// Delay between two status polls.
    pub poll_interval: Duration,
    /// How long one wait lasts before handing back an unchanged status.
    pub wait_timeout: Duration,
    /// Total time a run may take, tool calls included.
    pub max_run_duration: Duration,
    /// Total number of status polls a run may use.
    pub max_polls: usize,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(120),
            max_run_duration: Duration::from_secs(600),
            max_polls: 2000,
        }
    }
}

/// The final text of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub text: String,
    pub thread_id: String,
    pub assistant_id: String,
}

/// Bookkeeping for one `execute` call.
struct RunBudget {
    started: Instant,
    polls: usize,
}

pub struct RunCoordinator {
    api: Arc<dyn AssistantApi>,
    dispatcher: Arc<ToolDispatcher>,
    policy: RunPolicy,
}

impl RunCoordinator {
    pub fn new(api: Arc<dyn AssistantApi>, dispatcher: Arc<ToolDispatcher>, policy: RunPolicy) -> Self {
        Self {
            api,
            dispatcher,
            policy,
        }
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    pub async fn execute(&self, thread_id: &str, assistant_id: &str) -> Result<Answer> {
        self.execute_with_cancel(thread_id, assistant_id, &CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        thread_id: &str,
        assistant_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let mut run = self.api.create_run(thread_id, assistant_id).await?;
        info!(run_id = %run.id, thread_id, assistant_id, "run submitted");

        let mut budget = RunBudget {
            started: Instant::now(),
            polls: 0,
        };

        loop {
            match run.status.clone() {
                RunStatus::Completed => {
                    info!(run_id = %run.id, elapsed_ms = budget.started.elapsed().as_millis() as u64, "run completed");
                    return self.answer(thread_id, assistant_id).await;
                }
                RunStatus::Cancelled | RunStatus::Failed | RunStatus::Expired => {
                    if let Some(e) = &run.last_error {
                        warn!(run_id = %run.id, code = %e.code, "run ended: {}", e.message);
                    }
                    return Err(Error::RunNotCompleted {
                        run_id: run.id,
                        status: run.status,
                    });
                }
                RunStatus::Unknown(status) => {
                    return Err(Error::UnknownRunStatus {
                        run_id: run.id.clone(),
                        status,
                    });
                }
                RunStatus::RequiresAction => {
                    self.ensure_live(thread_id, &run, &budget, cancel).await?;
                    let outputs = self.dispatch(assistant_id, &run).await?;
                    debug!(run_id = %run.id, outputs = outputs.len(), "submitting tool outputs");
                    run = self
                        .api
                        .submit_tool_outputs(thread_id, &run.id, &outputs)
                        .await?;
                }
                RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling => {
                    run = self.wait_for_change(thread_id, run, &mut budget, cancel).await?;
                }
            }
        }
    }

    /// Poll until the status differs from `run.status` or the per-wait
    /// timeout elapses; in the latter case the unchanged run is returned.
    async fn wait_for_change(
        &self,
        thread_id: &str,
        run: RunObject,
        budget: &mut RunBudget,
        cancel: &CancellationToken,
    ) -> Result<RunObject> {
        let wait_started = Instant::now();
        let mut current = run;
        loop {
            self.ensure_live(thread_id, &current, budget, cancel).await?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abandon(thread_id, &current.id).await;
                    return Err(Error::Cancelled { run_id: current.id });
                }
                _ = sleep(self.policy.poll_interval) => {}
            }

            budget.polls += 1;
            let polled = self.api.retrieve_run(thread_id, &current.id).await?;
            if polled.status != current.status {
                debug!(run_id = %polled.id, from = %current.status, to = %polled.status, "run status changed");
                return Ok(polled);
            }
            current = polled;

            if wait_started.elapsed() >= self.policy.wait_timeout {
                debug!(run_id = %current.id, status = %current.status, "wait timed out without a status change");
                return Ok(current);
            }
        }
    }

    /// Fail (after cancelling the remote run) once the caller has cancelled
    /// or a global ceiling is reached.
    async fn ensure_live(
        &self,
        thread_id: &str,
        run: &RunObject,
        budget: &RunBudget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            self.abandon(thread_id, &run.id).await;
            return Err(Error::Cancelled {
                run_id: run.id.clone(),
            });
        }

        let reason = if budget.started.elapsed() >= self.policy.max_run_duration {
            Some(format!(
                "exceeded the maximum run duration of {:?}",
                self.policy.max_run_duration
            ))
        } else if budget.polls >= self.policy.max_polls {
            Some(format!("exceeded the maximum of {} polls", self.policy.max_polls))
        } else {
            None
        };

        match reason {
            Some(reason) => {
                warn!(run_id = %run.id, "{reason}");
                self.abandon(thread_id, &run.id).await;
                Err(Error::RunTimedOut {
                    run_id: run.id.clone(),
                    reason,
                })
            }
            None => Ok(()),
        }
    }

    /// Run every requested tool call.  Calls to functions the assistant does
    /// not advertise are answered with an error instead of being executed.
    async fn dispatch(&self, assistant_id: &str, run: &RunObject) -> Result<Vec<ToolOutput>> {
        let calls = run.required_tool_calls();
        if calls.is_empty() {
            return Err(Error::Other(format!(
                "run {} requires action but requested no tool calls",
                run.id
            )));
        }

        let assistant = self.api.retrieve_assistant(assistant_id).await?;
        let advertised = assistant.function_names();

        let mut outputs = Vec::with_capacity(calls.len());
        for call in &calls {
            if advertised.contains(&call.function_name.as_str()) {
                outputs.push(self.dispatcher.invoke(call).await);
            } else {
                warn!(
                    run_id = %run.id,
                    tool = %call.function_name,
                    "refusing tool call the assistant does not advertise"
                );
                outputs.push(tools::refused(
                    call,
                    &format!(
                        "the function '{}' is not available to this assistant",
                        call.function_name
                    ),
                ));
            }
        }
        Ok(outputs)
    }

    async fn answer(&self, thread_id: &str, assistant_id: &str) -> Result<Answer> {
        let latest = self.api.list_messages(thread_id, 1).await?;
        let text = latest
            .first()
            .and_then(|m| m.text())
            .ok_or_else(|| Error::NoAnswer {
                thread_id: thread_id.to_string(),
            })?;
        Ok(Answer {
            text,
            thread_id: thread_id.to_string(),
            assistant_id: assistant_id.to_string(),
        })
    }

    async fn abandon(&self, thread_id: &str, run_id: &str) {
        match self.api.cancel_run(thread_id, run_id).await {
            Ok(_) => info!(run_id, "remote run cancelled"),
            Err(e) => warn!(run_id, "failed to cancel remote run: {e}"),
        }
    }
}
