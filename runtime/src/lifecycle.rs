//! Staged model lifecycle.
//!
//! ```text
//! Unstarted → PluginInitializing → Downloading → ModelInitializing → Available
//!                     └──────────────┴──────────────┴──→ Failed
//! ```
//!
//! Each stage runs under the retry driver. A stage that exhausts its retry
//! budget moves the lifecycle to `Failed`: the runtime is cleaned up and the
//! lifecycle stops there. There is no automatic restart.

use crate::download::{DownloadProvider, ProgressCallback};
use crate::error::LifecycleError;
use crate::runtime::Runtime;
use common::platform::model_path_for_url;
use common::{InitializationParameters, RetryConfig};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use task_scheduler::run_with_retry;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    PluginInitializing,
    Downloading,
    ModelInitializing,
    Available,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Available | Self::Failed)
    }
}

/// Notified on the primary context after every state change.
pub type StateObserver = Arc<dyn Fn(LifecycleState) + Send + Sync>;

/// Where the model file comes from.
#[derive(Debug, Clone)]
pub struct ModelSource {
    /// Source URL; the local path is derived from it when `path` is unset
    pub url: Option<String>,
    pub path: Option<PathBuf>,
}

impl ModelSource {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            path: None,
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            url: None,
            path: Some(path.into()),
        }
    }
}

struct LifecycleInner {
    runtime: Runtime,
    downloader: Arc<dyn DownloadProvider>,
    url: Option<String>,
    model_path: PathBuf,
    params: InitializationParameters,
    retry: RetryConfig,
    model_prefix: String,
    state: watch::Sender<LifecycleState>,
    observers: Mutex<Vec<StateObserver>>,
    model_id: Mutex<Option<String>>,
    last_error: Mutex<Option<LifecycleError>>,
    progress: Mutex<Option<ProgressCallback>>,
}

/// Drives one model from nothing to available.
#[derive(Clone)]
pub struct ModelLifecycle {
    inner: Arc<LifecycleInner>,
}

impl std::fmt::Debug for ModelLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLifecycle")
            .field("state", &self.state())
            .field("model_path", &self.inner.model_path)
            .field("model_id", &self.model_id())
            .finish()
    }
}

impl ModelLifecycle {
    /// `params.model_path` is replaced by the resolved local path.
    pub fn new(
        runtime: Runtime,
        downloader: Arc<dyn DownloadProvider>,
        source: ModelSource,
        mut params: InitializationParameters,
    ) -> Self {
        let model_path = match (&source.path, &source.url) {
            (Some(path), _) => path.clone(),
            (None, Some(url)) => model_path_for_url(&runtime.settings().models_dir, url),
            (None, None) => PathBuf::from(&params.model_path),
        };
        params.model_path = model_path.to_string_lossy().into_owned();
        let retry = runtime.settings().retry;
        let (state, _) = watch::channel(LifecycleState::Unstarted);

        Self {
            inner: Arc::new(LifecycleInner {
                runtime,
                downloader,
                url: source.url,
                model_path,
                params,
                retry,
                model_prefix: crate::runtime::DEFAULT_MODEL_PREFIX.to_string(),
                state,
                observers: Mutex::new(Vec::new()),
                model_id: Mutex::new(None),
                last_error: Mutex::new(None),
                progress: Mutex::new(None),
            }),
        }
    }

    /// Override the retry budget used by every stage. Call before `start`.
    pub fn with_retry(self, retry: RetryConfig) -> Self {
        let inner = Arc::try_unwrap(self.inner).map(|mut inner| {
            inner.retry = retry;
            inner
        });
        match inner {
            Ok(inner) => Self {
                inner: Arc::new(inner),
            },
            Err(shared) => {
                warn!("Lifecycle already shared; retry override ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    pub fn model_id(&self) -> Option<String> {
        self.inner.model_id.lock().clone()
    }

    pub fn model_path(&self) -> &PathBuf {
        &self.inner.model_path
    }

    pub fn last_error(&self) -> Option<LifecycleError> {
        self.inner.last_error.lock().clone()
    }

    pub fn add_observer(&self, observer: StateObserver) {
        self.inner.observers.lock().push(observer);
    }

    pub fn set_download_progress(&self, progress: ProgressCallback) {
        *self.inner.progress.lock() = Some(progress);
    }

    /// Start the stages. Must be called from within a tokio runtime. The
    /// handle resolves to the terminal state.
    pub fn start(&self) -> JoinHandle<LifecycleState> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run().await })
    }

    /// Wait until the lifecycle is `Available` or `Failed`.
    pub async fn wait_terminal(&self) -> LifecycleState {
        let mut rx = self.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Shut the model down and release its id. Returns to `Unstarted`.
    pub async fn shutdown(&self) -> bool {
        let Some(model_id) = self.inner.model_id.lock().take() else {
            warn!("Shutdown requested with no initialized model");
            return false;
        };
        let ok = match self.inner.runtime.binding() {
            Some(binding) => {
                let (tx, rx) = oneshot::channel();
                binding.shutdown_model(
                    &model_id,
                    Box::new(move |ok| {
                        let _ = tx.send(ok);
                    }),
                );
                rx.await.unwrap_or(false)
            }
            None => false,
        };
        self.inner.runtime.remove_model_id(&model_id);
        info!("Model '{}' shut down: {}", model_id, ok);
        self.inner.transition(LifecycleState::Unstarted);
        ok
    }
}

impl LifecycleInner {
    fn transition(&self, state: LifecycleState) {
        self.state.send_replace(state);
        info!("Model lifecycle: {:?}", state);
        let observers = self.observers.lock().clone();
        for observer in observers {
            self.runtime.primary().post(move || observer(state));
        }
    }

    async fn run(self: Arc<Self>) -> LifecycleState {
        self.transition(LifecycleState::PluginInitializing);
        let runtime = self.runtime.clone();
        let loaded = run_with_retry(
            "initialize plugin",
            move |done| {
                runtime.initialize(done);
                Ok(())
            },
            self.retry,
        )
        .await;
        if !loaded {
            return self.fail(LifecycleError::PluginInitialization).await;
        }

        self.transition(LifecycleState::Downloading);
        let fetch = self.clone();
        let downloaded = run_with_retry(
            "download model",
            move |done| {
                if fetch.model_path.is_file() {
                    info!("Model file present at {}", fetch.model_path.display());
                    done(true);
                    return Ok(());
                }
                let Some(url) = fetch.url.clone() else {
                    anyhow::bail!(
                        "model file {} is missing and no URL is configured",
                        fetch.model_path.display()
                    );
                };
                let downloader = fetch.downloader.clone();
                let destination = fetch.model_path.clone();
                let progress = fetch.progress.lock().clone();
                tokio::spawn(async move {
                    let result = downloader.download(&url, &destination, progress).await;
                    if let Err(e) = &result {
                        warn!("Download attempt failed: {}", e);
                    }
                    done(result.is_ok() && destination.is_file());
                });
                Ok(())
            },
            self.retry,
        )
        .await;
        if !downloaded {
            return self.fail(LifecycleError::ModelUnavailable(self.model_path.clone())).await;
        }

        self.transition(LifecycleState::ModelInitializing);
        let model_id = self.runtime.register_model_id(Some(&self.model_prefix));
        *self.model_id.lock() = Some(model_id.clone());

        let init = self.clone();
        let init_id = model_id.clone();
        let initialized = run_with_retry(
            "initialize model",
            move |done| {
                let Some(binding) = init.runtime.binding() else {
                    anyhow::bail!("runtime lost its binding");
                };
                binding.initialize_model(&init_id, &init.params, done);
                Ok(())
            },
            self.retry,
        )
        .await;
        if !initialized {
            return self.fail(LifecycleError::ModelInitialization(model_id)).await;
        }

        self.transition(LifecycleState::Available);
        LifecycleState::Available
    }

    /// Shared failure handler: tear down so no half-initialized state
    /// lingers, then stop.
    async fn fail(&self, reason: LifecycleError) -> LifecycleState {
        error!("Model lifecycle failed: {}", reason);
        *self.last_error.lock() = Some(reason);
        // Cleanup shuts down and forgets every registered id, ours included
        self.model_id.lock().take();
        if !self.runtime.cleanup_async().await {
            debug!("No loaded backend to dispose");
        }
        self.transition(LifecycleState::Failed);
        LifecycleState::Failed
    }
}
