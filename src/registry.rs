//! Resolves `(user, pilot)` pairs to remote assistants.
//!
//! Two caches back the registry:
//!
//! * `assistants` holds one [`CachedAssistant`] per key: the pilot it was
//!   built from plus the memoized remote specification.
//! * `assistant_ids` holds one `OnceCell` per key that is filled with the
//!   remote id exactly once.  Concurrent first requests for the same key
//!   share the cell, so only one of them ever talks to the remote side.
//!
//! Pilot mutations go through the registry so the caches stay consistent:
//! an update invalidates the memoized specifications (the next use pushes
//! the new one with a modify call), a delete evicts the entries and removes
//! the remote assistants.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::api::{
    user_metadata, AssistantApi, AssistantObject, AssistantSpec, ResponseFormat, USER_METADATA_KEY,
};
use crate::cache::KeyedCache;
use crate::error::{Error, Result};
use crate::pilot::{PilotDefinition, PilotDescription, DEFAULT_MODEL};
use crate::tools::ToolDispatcher;

/// `pilot_user`, the remote name of a user's assistant.
pub fn pilot_user_key(pilot: &str, user: Option<&str>) -> String {
    format!("{pilot}_{}", user.unwrap_or_default())
}

/// Upper-case the first character.
pub fn first_to_upper(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Appended to every user assistant's instructions.
pub fn use_name_prompt(user: &str) -> String {
    format!(
        "In the following conversation, address your conversational partner politely and only by \
         their first name. The full name is '{}'; take the first name from it and use it wherever \
         it reads naturally, so the conversation stays personal and respectful.",
        first_to_upper(user)
    )
}

/// Case-insensitive cache key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AssistantKey(String);

impl AssistantKey {
    pub fn new(pilot: &str, user: Option<&str>) -> Self {
        Self(pilot_user_key(pilot, user).to_lowercase())
    }

    /// Key of an assistant that is not bound to a user.
    pub fn system(name: &str) -> Self {
        Self(name.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AssistantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Cached assistant ────────────────────────────────────────

struct AssistantState {
    pilot: Arc<PilotDefinition>,
    spec: Option<Arc<AssistantSpec>>,
    needs_sync: bool,
}

/// A user's assistant as known locally.
pub struct CachedAssistant {
    key: AssistantKey,
    user: String,
    state: Mutex<AssistantState>,
}

impl PartialEq for CachedAssistant {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl CachedAssistant {
    pub fn new(user: Option<&str>, pilot: Arc<PilotDefinition>) -> Self {
        Self {
            key: AssistantKey::new(&pilot.name, user),
            user: user.unwrap_or_default().to_string(),
            state: Mutex::new(AssistantState {
                pilot,
                spec: None,
                needs_sync: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AssistantState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &AssistantKey {
        &self.key
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn pilot(&self) -> Arc<PilotDefinition> {
        self.lock().pilot.clone()
    }

    pub fn remote_name(&self) -> String {
        pilot_user_key(&self.lock().pilot.name, Some(&self.user))
    }

    /// The remote specification, built on first use.
    pub fn spec(&self) -> Arc<AssistantSpec> {
        let mut state = self.lock();
        if let Some(spec) = &state.spec {
            return spec.clone();
        }
        let spec = Arc::new(build_spec(&state.pilot, &self.user));
        state.spec = Some(spec.clone());
        spec
    }

    /// Point at a new pilot version and drop the memoized specification.
    pub fn invalidate(&self, pilot: Arc<PilotDefinition>) {
        let mut state = self.lock();
        state.pilot = pilot;
        state.spec = None;
        state.needs_sync = true;
    }

    /// Clear and return the pending-modify flag.
    pub fn take_needs_sync(&self) -> bool {
        std::mem::take(&mut self.lock().needs_sync)
    }

    fn mark_needs_sync(&self) {
        self.lock().needs_sync = true;
    }
}

fn build_spec(pilot: &PilotDefinition, user: &str) -> AssistantSpec {
    AssistantSpec {
        model: pilot.model.clone(),
        name: pilot_user_key(&pilot.name, Some(user)),
        description: (!pilot.description.is_empty()).then(|| pilot.description.clone()),
        instructions: format!("{}\n{}", pilot.instructions, use_name_prompt(user)),
        tools: pilot.tools().to_vec(),
        tool_resources: pilot.tool_resources(),
        metadata: user_metadata(Some(user)),
        response_format: pilot.is_json().then_some(ResponseFormat::JsonObject),
    }
}

fn named_like(assistant: &AssistantObject, name: &str) -> bool {
    assistant
        .name
        .as_deref()
        .is_some_and(|n| n.eq_ignore_ascii_case(name))
}

// ── Registry ────────────────────────────────────────────────

pub struct AssistantRegistry {
    api: Arc<dyn AssistantApi>,
    dispatcher: Arc<ToolDispatcher>,
    pilots: RwLock<Vec<Arc<PilotDefinition>>>,
    assistant_ids: KeyedCache<AssistantKey, Arc<OnceCell<String>>>,
    assistants: KeyedCache<AssistantKey, Arc<CachedAssistant>>,
}

impl AssistantRegistry {
    /// Compile every pilot's tools and take ownership of the set.
    pub fn new(
        api: Arc<dyn AssistantApi>,
        dispatcher: Arc<ToolDispatcher>,
        pilots: Vec<PilotDefinition>,
        retry_budget: usize,
    ) -> Result<Self> {
        let mut compiled: Vec<Arc<PilotDefinition>> = Vec::with_capacity(pilots.len());
        for mut pilot in pilots {
            if compiled.iter().any(|p| p.name.eq_ignore_ascii_case(&pilot.name)) {
                return Err(Error::DuplicatePilot(pilot.name));
            }
            pilot.compile_tools(&dispatcher)?;
            compiled.push(Arc::new(pilot));
        }
        info!(pilots = compiled.len(), "assistant registry ready");

        Ok(Self {
            api,
            dispatcher,
            pilots: RwLock::new(compiled),
            assistant_ids: KeyedCache::with_retry_budget(retry_budget),
            assistants: KeyedCache::with_retry_budget(retry_budget),
        })
    }

    pub fn api(&self) -> &Arc<dyn AssistantApi> {
        &self.api
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    /// Remote id of the assistant for `(user, pilot)`, creating it remotely
    /// on first use.
    pub async fn get_or_create(&self, user: Option<&str>, pilot_name: &str) -> Result<String> {
        let key = AssistantKey::new(pilot_name, user);
        let cached = self.cached_assistant(&key, user, pilot_name).await?;
        let cell = self
            .assistant_ids
            .get_or_add_with(key.clone(), || Arc::new(OnceCell::new()))?;

        if let Some(id) = cell.get() {
            debug!(key = ?key, assistant_id = %id, "assistant cache hit");
            if cached.take_needs_sync() {
                self.sync(id, &cached).await?;
            }
            return Ok(id.clone());
        }

        let id = cell
            .get_or_try_init(|| self.find_or_create(&cached))
            .await?;
        Ok(id.clone())
    }

    /// Remote id of an assistant that is not bound to a user or pilot.
    pub async fn get_or_create_system(
        &self,
        name: &str,
        instructions: &str,
        response_format: Option<ResponseFormat>,
    ) -> Result<String> {
        let cell = self
            .assistant_ids
            .get_or_add_with(AssistantKey::system(name), || Arc::new(OnceCell::new()))?;
        let id = cell
            .get_or_try_init(|| async {
                let existing = self.api.list_assistants().await?;
                if let Some(found) = existing.into_iter().find(|a| named_like(a, name)) {
                    debug!(name, assistant_id = %found.id, "reusing system assistant");
                    return Ok(found.id);
                }
                let spec = AssistantSpec {
                    model: DEFAULT_MODEL.to_string(),
                    name: name.to_string(),
                    description: None,
                    instructions: instructions.to_string(),
                    tools: Vec::new(),
                    tool_resources: None,
                    metadata: Default::default(),
                    response_format,
                };
                let created = self.api.create_assistant(&spec).await?;
                info!(name, assistant_id = %created.id, "created system assistant");
                Ok::<_, Error>(created.id)
            })
            .await?;
        Ok(id.clone())
    }

    async fn cached_assistant(
        &self,
        key: &AssistantKey,
        user: Option<&str>,
        pilot_name: &str,
    ) -> Result<Arc<CachedAssistant>> {
        if let Some(cached) = self.assistants.get(key)? {
            return Ok(cached);
        }
        let pilot = self.get_pilot(pilot_name).await?;
        let fresh = Arc::new(CachedAssistant::new(user, pilot));
        self.assistants.get_or_add_with(key.clone(), || fresh)
    }

    /// List remote assistants and reuse one with the expected name, else
    /// create it.
    async fn find_or_create(&self, cached: &CachedAssistant) -> Result<String> {
        let name = cached.remote_name();
        cached.take_needs_sync();
        let spec = cached.spec();

        let existing = self.api.list_assistants().await?;
        if let Some(found) = existing.into_iter().find(|a| named_like(a, &name)) {
            let stale = found.model != spec.model
                || found.instructions.as_deref() != Some(spec.instructions.as_str());
            if stale {
                self.api.modify_assistant(&found.id, &spec).await?;
                info!(name = %name, assistant_id = %found.id, "updated stale remote assistant");
            } else {
                debug!(name = %name, assistant_id = %found.id, "reusing remote assistant");
            }
            return Ok(found.id);
        }

        let created = self.api.create_assistant(&spec).await?;
        info!(name = %name, assistant_id = %created.id, "created remote assistant");
        Ok(created.id)
    }

    async fn sync(&self, id: &str, cached: &CachedAssistant) -> Result<()> {
        let spec = cached.spec();
        match self.api.modify_assistant(id, &spec).await {
            Ok(_) => {
                info!(name = %spec.name, assistant_id = %id, "pushed updated pilot to remote assistant");
                Ok(())
            }
            Err(e) => {
                cached.mark_needs_sync();
                Err(e)
            }
        }
    }

    // ── Pilot management ────────────────────────────────────

    pub async fn get_pilot(&self, name: &str) -> Result<Arc<PilotDefinition>> {
        self.pilots
            .read()
            .await
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| Error::PilotNotFound(name.to_string()))
    }

    pub async fn pilots(&self) -> Vec<Arc<PilotDefinition>> {
        self.pilots.read().await.clone()
    }

    pub async fn pilot_descriptions(&self) -> Vec<PilotDescription> {
        self.pilots
            .read()
            .await
            .iter()
            .map(|p| p.to_description())
            .collect()
    }

    pub async fn add_pilot(&self, mut pilot: PilotDefinition) -> Result<()> {
        pilot.compile_tools(&self.dispatcher)?;
        let mut pilots = self.pilots.write().await;
        if pilots.iter().any(|p| p.name.eq_ignore_ascii_case(&pilot.name)) {
            return Err(Error::DuplicatePilot(pilot.name));
        }
        info!(pilot = %pilot.name, "pilot added");
        pilots.push(Arc::new(pilot));
        Ok(())
    }

    /// Replace a pilot.  Assistants already built from it keep their remote
    /// id and receive the new specification on their next use; they are
    /// modified in place rather than deleted and recreated.
    pub async fn update_pilot(&self, mut pilot: PilotDefinition) -> Result<()> {
        pilot.compile_tools(&self.dispatcher)?;
        let pilot = Arc::new(pilot);
        {
            let mut pilots = self.pilots.write().await;
            let slot = pilots
                .iter_mut()
                .find(|p| p.name.eq_ignore_ascii_case(&pilot.name))
                .ok_or_else(|| Error::PilotNotFound(pilot.name.clone()))?;
            *slot = pilot.clone();
        }

        let mut invalidated = 0;
        for (_, cached) in self.assistants.entries() {
            if cached.pilot().name.eq_ignore_ascii_case(&pilot.name) {
                cached.invalidate(pilot.clone());
                invalidated += 1;
            }
        }
        info!(pilot = %pilot.name, invalidated, "pilot updated");
        Ok(())
    }

    /// Remove a pilot, evict every assistant built from it and delete those
    /// assistants remotely.  Remote failures are collected, not short-circuited.
    pub async fn delete_pilot(&self, name: &str) -> Result<()> {
        let pilot = {
            let mut pilots = self.pilots.write().await;
            let idx = pilots
                .iter()
                .position(|p| p.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| Error::PilotNotFound(name.to_string()))?;
            pilots.remove(idx)
        };

        let mut remote_ids: Vec<String> = Vec::new();
        for (key, cached) in self.assistants.entries() {
            if !cached.pilot().name.eq_ignore_ascii_case(&pilot.name) {
                continue;
            }
            if let Some(cell) = self.assistant_ids.get(&key)? {
                if let Some(id) = cell.get() {
                    remote_ids.push(id.clone());
                }
            }
            self.assistant_ids.remove_key(&key)?;
            self.assistants.remove_by_value(&cached)?;
        }

        let mut errors: Vec<Error> = Vec::new();

        // Assistants created by an earlier process are only known remotely.
        match self.api.list_assistants().await {
            Ok(remote) => {
                for assistant in remote {
                    let user = assistant.metadata.get(USER_METADATA_KEY).map(String::as_str);
                    let expected = pilot_user_key(&pilot.name, user);
                    if named_like(&assistant, &expected) && !remote_ids.contains(&assistant.id) {
                        remote_ids.push(assistant.id);
                    }
                }
            }
            Err(e) => errors.push(e),
        }

        for id in &remote_ids {
            match self.api.delete_assistant(id).await {
                Ok(true) => debug!(pilot = %pilot.name, assistant_id = %id, "remote assistant deleted"),
                Ok(false) => errors.push(Error::Other(format!(
                    "remote assistant {id} of pilot {} was not deleted",
                    pilot.name
                ))),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            info!(pilot = %pilot.name, assistants = remote_ids.len(), "pilot deleted");
            Ok(())
        } else {
            warn!(pilot = %pilot.name, failures = errors.len(), "pilot deleted with remote failures");
            Err(Error::Multiple(errors))
        }
    }

    /// Number of assistants currently cached.
    pub fn cached_assistants(&self) -> usize {
        self.assistants.len()
    }

    pub fn dispose(&self) -> Result<()> {
        self.assistants.dispose()?;
        self.assistant_ids.dispose()
    }
}
