//! Runtime service: sessions, model lifecycle and prompt registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::EngineConfig;
use crate::conversation::ConversationStore;
use crate::media::MediaNormalizer;
use crate::model::{LoadStatus, ModelLifecycle, ModelLoader};
use crate::prompt::{PromptRegistry, PromptTemplate, PromptUpdate};
use crate::runtime::types::{ConversationHistory, HealthReport, HealthStatus, DEFAULT_SESSION};

/// Failed load cycles after which an unloaded service reports `unhealthy`.
const UNHEALTHY_FAILURE_THRESHOLD: u32 = 3;

pub(crate) type SharedStore = Arc<Mutex<ConversationStore>>;

/// Conversational front-end around one model.
pub struct VlmService {
    pub(crate) config: EngineConfig,
    pub(crate) lifecycle: ModelLifecycle,
    pub(crate) normalizer: MediaNormalizer,
    pub(crate) prompts: RwLock<PromptRegistry>,
    sessions: RwLock<HashMap<String, SharedStore>>,
}

impl VlmService {
    pub fn new(config: EngineConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let normalizer = MediaNormalizer::new(config.media.clone());
        Self::with_normalizer(config, loader, normalizer)
    }

    pub fn with_normalizer(
        config: EngineConfig,
        loader: Arc<dyn ModelLoader>,
        normalizer: MediaNormalizer,
    ) -> Self {
        let lifecycle = ModelLifecycle::new(config.model_id.clone(), loader, config.load.clone());
        Self {
            config,
            lifecycle,
            normalizer,
            prompts: RwLock::new(PromptRegistry::default()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &ModelLifecycle {
        &self.lifecycle
    }

    pub async fn ensure_ready(&self) -> bool {
        self.lifecycle.ensure_ready().await
    }

    pub async fn load_status(&self) -> LoadStatus {
        self.lifecycle.status().await
    }

    pub(crate) async fn session(&self, session_id: &str) -> SharedStore {
        if let Some(store) = self.sessions.read().await.get(session_id) {
            return Arc::clone(store);
        }

        let mut sessions = self.sessions.write().await;
        let store = sessions.entry(session_id.to_string()).or_insert_with(|| {
            info!("Creating conversation session {session_id}");
            Arc::new(Mutex::new(ConversationStore::new(
                self.config.max_conversation_length,
            )))
        });
        Arc::clone(store)
    }

    async fn existing_session(&self, session_id: &str) -> Option<SharedStore> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Health without triggering a load.
    pub async fn health(&self) -> HealthReport {
        let status = self.lifecycle.status().await;
        let conversation_length = match self.existing_session(DEFAULT_SESSION).await {
            Some(store) => store.lock().await.len(),
            None => 0,
        };
        let sessions = self.sessions.read().await.len();

        let health = if status.is_loaded {
            HealthStatus::Healthy
        } else if status.consecutive_failures > UNHEALTHY_FAILURE_THRESHOLD {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status: health,
            state: status.state,
            loaded: status.is_loaded,
            model_name: status.model_name,
            last_error: status.last_error,
            load_attempts: status.load_attempts,
            consecutive_failures: status.consecutive_failures,
            conversation_length,
            sessions,
        }
    }

    /// Health after a readiness check, which may start a load.
    pub async fn check_health(&self) -> HealthReport {
        self.lifecycle.ensure_ready().await;
        self.health().await
    }

    /// Drop every turn of a session, releasing its media. Waits for any
    /// in-flight generation on that session.
    pub async fn clear_conversation(&self, session_id: &str) {
        if let Some(store) = self.existing_session(session_id).await {
            store.lock().await.clear();
            info!("Cleared conversation session {session_id}");
        }
    }

    pub async fn conversation_history(&self, session_id: &str) -> ConversationHistory {
        let max_length = self.config.max_conversation_length.max(1);
        match self.existing_session(session_id).await {
            Some(store) => {
                let store = store.lock().await;
                ConversationHistory {
                    conversation_history: store.history(),
                    length: store.len(),
                    max_length: store.max_length(),
                }
            }
            None => ConversationHistory {
                conversation_history: Vec::new(),
                length: 0,
                max_length,
            },
        }
    }

    pub async fn list_prompts(&self) -> std::collections::BTreeMap<String, String> {
        self.prompts.read().await.list()
    }

    pub async fn prompt_info(&self, name: &str) -> Option<PromptTemplate> {
        self.prompts.read().await.get_info(name).cloned()
    }

    pub async fn add_prompt(&self, name: impl Into<String>, prompt: PromptTemplate) -> bool {
        self.prompts.write().await.add(name, prompt)
    }

    pub async fn update_prompt(&self, name: &str, update: PromptUpdate) -> bool {
        self.prompts.write().await.update(name, update)
    }

    /// Release every session's media and unload the model.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, SharedStore)> = self.sessions.write().await.drain().collect();
        for (session_id, store) in sessions {
            store.lock().await.clear();
            info!("Released conversation session {session_id}");
        }
        self.lifecycle.unload().await;
    }
}
