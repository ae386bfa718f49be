//! OpenAI Assistants (v2) HTTP client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    AssistantApi, AssistantObject, AssistantSpec, MessageObject, NewMessage, RunObject,
    ThreadObject, ToolOutput,
};
use crate::error::{Error, Result};

/// Default base URL of the OpenAI REST API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Page size used when walking the assistant list.
const LIST_PAGE_SIZE: usize = 100;

/// Talks to the Assistants endpoints over HTTPS.
pub struct OpenAIAssistantsClient {
    api_key: String,
    base_url: String,
    organization: Option<String>,
    client: Client,
}

#[derive(Deserialize)]
struct ListPage<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Deserialize)]
struct Deleted {
    #[serde(default)]
    deleted: bool,
}

impl OpenAIAssistantsClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_config(api_key, DEFAULT_BASE_URL, None)
    }

    /// Create a client against a non-default endpoint (proxies, tests).
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        organization: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            organization,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2");
        if let Some(org) = &self.organization {
            req = req.header("OpenAI-Organization", org);
        }
        req
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }

    async fn list_newest<T: DeserializeOwned>(&self, path: &str, limit: usize) -> Result<Vec<T>> {
        let req = self
            .request(Method::GET, path)
            .query(&[("limit", limit.to_string()), ("order", "desc".to_string())]);
        let page: ListPage<T> = self.send(req).await?;
        Ok(page.data)
    }
}

#[async_trait]
impl AssistantApi for OpenAIAssistantsClient {
    async fn list_assistants(&self) -> Result<Vec<AssistantObject>> {
        let mut all = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut query = vec![
                ("limit", LIST_PAGE_SIZE.to_string()),
                ("order", "desc".to_string()),
            ];
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }
            let req = self.request(Method::GET, "assistants").query(&query);
            let page: ListPage<AssistantObject> = self.send(req).await?;
            all.extend(page.data);
            match page.last_id {
                Some(last) if page.has_more => after = Some(last),
                _ => break,
            }
        }
        debug!(count = all.len(), "listed assistants");
        Ok(all)
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<AssistantObject> {
        self.send(self.request(Method::POST, "assistants").json(spec))
            .await
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<AssistantObject> {
        self.send(self.request(Method::GET, &format!("assistants/{assistant_id}")))
            .await
    }

    async fn modify_assistant(
        &self,
        assistant_id: &str,
        spec: &AssistantSpec,
    ) -> Result<AssistantObject> {
        self.send(
            self.request(Method::POST, &format!("assistants/{assistant_id}"))
                .json(spec),
        )
        .await
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<bool> {
        let deleted: Deleted = self
            .send(self.request(Method::DELETE, &format!("assistants/{assistant_id}")))
            .await?;
        Ok(deleted.deleted)
    }

    async fn create_thread(
        &self,
        messages: &[NewMessage],
        metadata: &HashMap<String, String>,
    ) -> Result<ThreadObject> {
        let body = json!({ "messages": messages, "metadata": metadata });
        self.send(self.request(Method::POST, "threads").json(&body))
            .await
    }

    async fn retrieve_thread(&self, thread_id: &str) -> Result<ThreadObject> {
        self.send(self.request(Method::GET, &format!("threads/{thread_id}")))
            .await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let deleted: Deleted = self
            .send(self.request(Method::DELETE, &format!("threads/{thread_id}")))
            .await?;
        Ok(deleted.deleted)
    }

    async fn create_message(
        &self,
        thread_id: &str,
        message: &NewMessage,
    ) -> Result<MessageObject> {
        self.send(
            self.request(Method::POST, &format!("threads/{thread_id}/messages"))
                .json(message),
        )
        .await
    }

    async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<MessageObject>> {
        self.list_newest(&format!("threads/{thread_id}/messages"), limit)
            .await
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunObject> {
        let body = json!({ "assistant_id": assistant_id });
        self.send(
            self.request(Method::POST, &format!("threads/{thread_id}/runs"))
                .json(&body),
        )
        .await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject> {
        self.send(self.request(Method::GET, &format!("threads/{thread_id}/runs/{run_id}")))
            .await
    }

    async fn list_runs(&self, thread_id: &str, limit: usize) -> Result<Vec<RunObject>> {
        self.list_newest(&format!("threads/{thread_id}/runs"), limit)
            .await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunObject> {
        let body = json!({ "tool_outputs": outputs });
        self.send(
            self.request(
                Method::POST,
                &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            )
            .json(&body),
        )
        .await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject> {
        self.send(self.request(
            Method::POST,
            &format!("threads/{thread_id}/runs/{run_id}/cancel"),
        ))
        .await
    }
}
