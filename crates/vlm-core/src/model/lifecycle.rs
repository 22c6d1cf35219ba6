//! Model load state machine with bounded retries and backoff.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{LoadedModel, ModelLoader};
use crate::config::LoadConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadStatus {
    pub state: LoadState,
    pub is_loaded: bool,
    pub model_name: Option<String>,
    pub last_error: Option<String>,
    /// Load cycles started, not individual retries
    pub load_attempts: u64,
    /// Seconds since the Unix epoch
    pub last_load_attempt: Option<f64>,
    pub consecutive_failures: u32,
    /// Start of the last load cycle; the backoff window starts here
    #[serde(skip)]
    cycle_started: Option<Instant>,
}

impl Default for LoadStatus {
    fn default() -> Self {
        Self {
            state: LoadState::NotLoaded,
            is_loaded: false,
            model_name: None,
            last_error: None,
            load_attempts: 0,
            last_load_attempt: None,
            consecutive_failures: 0,
            cycle_started: None,
        }
    }
}

#[derive(Clone)]
pub struct ModelHandle {
    pub model_id: String,
    pub model: Arc<dyn LoadedModel>,
}

pub struct ModelLifecycle {
    model_id: String,
    loader: Arc<dyn ModelLoader>,
    config: LoadConfig,
    loaded: AtomicBool,
    handle: RwLock<Option<ModelHandle>>,
    status: RwLock<LoadStatus>,
    load_guard: Mutex<()>,
    /// Finished load cycles, bumped under `load_guard`
    cycles_finished: AtomicU64,
}

impl ModelLifecycle {
    pub fn new(model_id: impl Into<String>, loader: Arc<dyn ModelLoader>, config: LoadConfig) -> Self {
        Self {
            model_id: model_id.into(),
            loader,
            config,
            loaded: AtomicBool::new(false),
            handle: RwLock::new(None),
            status: RwLock::new(LoadStatus::default()),
            load_guard: Mutex::new(()),
            cycles_finished: AtomicU64::new(0),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> LoadStatus {
        self.status.read().await.clone()
    }

    pub async fn handle(&self) -> Option<ModelHandle> {
        if !self.is_loaded() {
            return None;
        }
        self.handle.read().await.clone()
    }

    /// Error reported to callers while the model is unavailable.
    pub async fn unavailable_error(&self) -> Error {
        let status = self.status.read().await;
        let reason = status
            .last_error
            .clone()
            .unwrap_or_else(|| "Model not loaded".to_string());
        Error::ServiceUnavailable(reason)
    }

    /// Readiness check. Loads the model unless it is already loaded or the
    /// previous load cycle failed and started less than `retry_delay` ago.
    pub async fn ensure_ready(&self) -> bool {
        if self.is_loaded() {
            return true;
        }

        {
            let status = self.status.read().await;
            let started = status.cycle_started.filter(|_| status.state == LoadState::Failed);
            if let Some(started) = started {
                if started.elapsed() < self.config.retry_delay {
                    debug!("Model load backoff active, skipping load attempt");
                    return false;
                }
            }
        }

        self.load().await
    }

    /// Run one load cycle of up to `max_retries` attempts. Callers that wait
    /// on a cycle already in flight share its outcome.
    pub async fn load(&self) -> bool {
        let seen_cycles = self.cycles_finished.load(Ordering::Acquire);
        let _guard = self.load_guard.lock().await;
        if self.is_loaded() {
            return true;
        }
        if self.cycles_finished.load(Ordering::Acquire) != seen_cycles {
            debug!("Concurrent load cycle failed, not starting another");
            return false;
        }

        {
            let mut status = self.status.write().await;
            status.state = LoadState::Loading;
            status.load_attempts += 1;
            status.cycle_started = Some(Instant::now());
            status.last_load_attempt = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs_f64());
        }

        let max_retries = self.config.max_retries.max(1);
        for attempt in 1..=max_retries {
            info!(
                "Loading model {} (attempt {attempt}/{max_retries})",
                self.model_id
            );
            let started = Instant::now();

            match self.load_once().await {
                Ok(model) => {
                    *self.handle.write().await = Some(ModelHandle {
                        model_id: self.model_id.clone(),
                        model,
                    });

                    let mut status = self.status.write().await;
                    status.state = LoadState::Loaded;
                    status.is_loaded = true;
                    status.model_name = Some(self.model_id.clone());
                    status.last_error = None;
                    status.consecutive_failures = 0;
                    self.loaded.store(true, Ordering::Release);
                    self.cycles_finished.fetch_add(1, Ordering::AcqRel);

                    info!(
                        "Model {} loaded in {:.1}s",
                        self.model_id,
                        started.elapsed().as_secs_f32()
                    );
                    return true;
                }
                Err(e) => {
                    warn!("Model load attempt {attempt}/{max_retries} failed: {e}");
                    self.status.write().await.last_error = Some(e.to_string());
                    if attempt < max_retries {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        let mut status = self.status.write().await;
        status.state = LoadState::Failed;
        status.is_loaded = false;
        status.consecutive_failures += 1;
        self.cycles_finished.fetch_add(1, Ordering::AcqRel);
        error!(
            "Failed to load model {} after {max_retries} attempts ({} consecutive failed cycles)",
            self.model_id, status.consecutive_failures
        );
        false
    }

    /// Drop the loaded model and return to `NotLoaded`.
    pub async fn unload(&self) {
        let _guard = self.load_guard.lock().await;
        self.loaded.store(false, Ordering::Release);
        let previous = self.handle.write().await.take();

        let mut status = self.status.write().await;
        status.state = LoadState::NotLoaded;
        status.is_loaded = false;
        if let Some(handle) = previous {
            info!("Unloaded model {}", handle.model_id);
        }
    }

    async fn load_once(&self) -> Result<Arc<dyn LoadedModel>> {
        let loader = Arc::clone(&self.loader);
        let model_id = self.model_id.clone();
        let task = tokio::task::spawn_blocking(move || loader.load(&model_id));

        // A timed-out task keeps running on the blocking pool; its result is discarded.
        match tokio::time::timeout(self.config.load_timeout, task).await {
            Err(_) => Err(Error::ModelLoadError(format!(
                "Model loading timed out after {:.0}s",
                self.config.load_timeout.as_secs_f32()
            ))),
            Ok(Err(e)) => Err(Error::ModelLoadError(format!("Model loading task failed: {e}"))),
            Ok(Ok(result)) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ActiveMedia;
    use crate::model::SamplingParams;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct EchoModel;

    impl LoadedModel for EchoModel {
        fn model_id(&self) -> &str {
            "echo"
        }

        fn apply_chat_template(&self, conversation: &str, _: usize, _: usize) -> Result<String> {
            Ok(conversation.to_string())
        }

        fn generate(&self, prompt: &str, _: &ActiveMedia, _: &SamplingParams) -> Result<String> {
            Ok(prompt.to_string())
        }

        fn stream_generate(
            &self,
            prompt: &str,
            _: &ActiveMedia,
            _: &SamplingParams,
            on_token: &mut dyn FnMut(&str) -> bool,
        ) -> Result<()> {
            on_token(prompt);
            Ok(())
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyLoader {
        failures: usize,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FlakyLoader {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ModelLoader for FlakyLoader {
        fn load(&self, _model_id: &str) -> Result<Arc<dyn LoadedModel>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if call < self.failures {
                return Err(Error::ModelLoadError(format!("boom #{call}")));
            }
            Ok(Arc::new(EchoModel))
        }
    }

    fn config(max_retries: usize, retry_delay_ms: u64) -> LoadConfig {
        LoadConfig {
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
            load_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn retries_within_one_cycle() {
        let loader = Arc::new(FlakyLoader::new(2));
        let lifecycle = ModelLifecycle::new("test", loader.clone(), config(3, 10));

        assert!(lifecycle.ensure_ready().await);

        let status = lifecycle.status().await;
        assert!(status.is_loaded);
        assert_eq!(status.state, LoadState::Loaded);
        assert_eq!(status.load_attempts, 1);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
        assert_eq!(status.model_name.as_deref(), Some("test"));
        assert_eq!(loader.calls(), 3);
        assert!(lifecycle.handle().await.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_back_off() {
        let loader = Arc::new(FlakyLoader::new(usize::MAX));
        let lifecycle = ModelLifecycle::new("test", loader.clone(), config(1, 150));

        assert!(!lifecycle.ensure_ready().await);
        let status = lifecycle.status().await;
        assert_eq!(status.state, LoadState::Failed);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.last_error.as_deref(), Some("Model loading failed: boom #0"));
        assert_eq!(loader.calls(), 1);

        // Inside the backoff window the loader is not touched.
        assert!(!lifecycle.ensure_ready().await);
        assert_eq!(loader.calls(), 1);
        assert!(matches!(
            lifecycle.unavailable_error().await,
            Error::ServiceUnavailable(_)
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!lifecycle.ensure_ready().await);
        assert_eq!(loader.calls(), 2);
        assert_eq!(lifecycle.status().await.consecutive_failures, 2);
        assert_eq!(lifecycle.status().await.load_attempts, 2);
    }

    #[tokio::test]
    async fn backoff_window_starts_with_the_cycle() {
        let loader = Arc::new(FlakyLoader::new(usize::MAX));
        let lifecycle = ModelLifecycle::new("test", loader.clone(), config(2, 100));

        // The in-cycle retry sleep already spends the whole window.
        assert!(!lifecycle.ensure_ready().await);
        assert_eq!(loader.calls(), 2);
        assert!(!lifecycle.ensure_ready().await);
        assert_eq!(loader.calls(), 4);
        assert_eq!(lifecycle.status().await.load_attempts, 2);
    }

    #[tokio::test]
    async fn slow_loads_time_out() {
        let loader = Arc::new(FlakyLoader {
            failures: 0,
            delay: Duration::from_millis(300),
            calls: AtomicUsize::new(0),
        });
        let lifecycle = ModelLifecycle::new(
            "test",
            loader,
            LoadConfig {
                max_retries: 1,
                retry_delay: Duration::from_millis(10),
                load_timeout: Duration::from_millis(30),
            },
        );

        assert!(!lifecycle.load().await);
        let status = lifecycle.status().await;
        assert!(!status.is_loaded);
        assert!(status.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn concurrent_loads_run_the_loader_once() {
        let loader = Arc::new(FlakyLoader {
            failures: 0,
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
        });
        let lifecycle = ModelLifecycle::new("test", loader.clone(), config(3, 10));

        let (a, b) = tokio::join!(lifecycle.load(), lifecycle.load());
        assert!(a && b);
        assert_eq!(loader.calls(), 1);
        assert_eq!(lifecycle.status().await.load_attempts, 1);
    }

    #[tokio::test]
    async fn waiters_share_a_failed_cycle() {
        let loader = Arc::new(FlakyLoader {
            failures: usize::MAX,
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
        });
        let lifecycle = ModelLifecycle::new("test", loader.clone(), config(1, 0));

        let (a, b) = tokio::join!(lifecycle.load(), lifecycle.load());
        assert!(!a && !b);
        assert_eq!(loader.calls(), 1);
        assert_eq!(lifecycle.status().await.consecutive_failures, 1);

        // A later call starts a fresh cycle.
        assert!(!lifecycle.load().await);
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn unload_returns_to_not_loaded() {
        let loader = Arc::new(FlakyLoader::new(0));
        let lifecycle = ModelLifecycle::new("test", loader, config(1, 0));

        assert!(lifecycle.ensure_ready().await);
        lifecycle.unload().await;

        assert!(!lifecycle.is_loaded());
        assert!(lifecycle.handle().await.is_none());
        assert_eq!(lifecycle.status().await.state, LoadState::NotLoaded);
        assert!(lifecycle.ensure_ready().await);
    }
}
