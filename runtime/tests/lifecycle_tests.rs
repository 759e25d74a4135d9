//! Staged model lifecycle: download, initialization, failure and shutdown.

mod support;

use async_trait::async_trait;
use common::{InitializationParameters, RetryBudget, RetryConfig};
use llmbridge_runtime::{
    DownloadError, DownloadProvider, LifecycleError, LifecycleState, ModelLifecycle, ModelSource,
    ProgressCallback, Runtime,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{test_settings, FakeBackend, SlowLoader, StaticLoader};
use task_scheduler::PrimaryContext;

const MODEL_URL: &str = "https://models.example.com/tiny.gguf";

/// Writes a few bytes to the destination, failing the first `failures` times.
struct FakeDownloader {
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FakeDownloader {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DownloadProvider for FakeDownloader {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<(), DownloadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        tokio::fs::create_dir_all(destination.parent().unwrap()).await?;
        tokio::fs::write(destination, b"GGUF").await?;
        if let Some(progress) = progress {
            progress(4, 4);
        }
        Ok(())
    }
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries: RetryBudget::Limited(max_retries),
        delay_ms: 5,
        backoff_multiplier: 1.0,
        max_delay_ms: Some(20),
    }
}

fn recorder(lifecycle: &ModelLifecycle) -> Arc<Mutex<Vec<LifecycleState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    lifecycle.add_observer(Arc::new(move |state: LifecycleState| sink.lock().unwrap().push(state)));
    seen
}

/// Observers run on the primary loop; give it a moment to catch up.
async fn settle(seen: &Mutex<Vec<LifecycleState>>, last: LifecycleState) {
    for _ in 0..200 {
        if seen.lock().unwrap().last() == Some(&last) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("observer never saw {:?}", last);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_reaches_available() {
    println!("\n🧪 Testing the full lifecycle...");

    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new();
    let (primary, main_loop) = PrimaryContext::new();
    tokio::spawn(main_loop.run());
    let runtime = Runtime::new(
        test_settings(dir.path()),
        StaticLoader::new(backend.clone()),
        primary,
    );

    let downloader = FakeDownloader::new(1);
    let lifecycle = ModelLifecycle::new(
        runtime.clone(),
        downloader.clone(),
        ModelSource::url(MODEL_URL),
        InitializationParameters::default(),
    )
    .with_retry(fast_retry(3));
    let seen = recorder(&lifecycle);
    let progress = Arc::new(AtomicUsize::new(0));
    let counter = progress.clone();
    lifecycle.set_download_progress(Arc::new(move |done: u64, _: u64| {
        counter.store(done as usize, Ordering::SeqCst);
    }));

    let state = lifecycle.start().await.unwrap();
    assert_eq!(state, LifecycleState::Available);
    settle(&seen, LifecycleState::Available).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            LifecycleState::PluginInitializing,
            LifecycleState::Downloading,
            LifecycleState::ModelInitializing,
            LifecycleState::Available,
        ]
    );
    assert_eq!(downloader.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(progress.load(Ordering::SeqCst), 4);
    assert!(lifecycle.model_path().starts_with(dir.path().join("Models")));
    assert!(lifecycle.model_path().is_file());
    assert_eq!(lifecycle.model_id().as_deref(), Some("model"));

    let init_call = format!("initialize_model:model:{}", lifecycle.model_path().display());
    assert!(backend.calls().contains(&init_call));

    println!("✅ Available after one failed download attempt");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_existing_file_skips_download() {
    println!("\n🧪 Testing a model file already on disk...");

    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("local.gguf");
    std::fs::write(&model, b"GGUF").unwrap();

    let (primary, main_loop) = PrimaryContext::new();
    tokio::spawn(main_loop.run());
    let runtime = Runtime::new(
        test_settings(dir.path()),
        StaticLoader::new(FakeBackend::new()),
        primary,
    );

    let downloader = FakeDownloader::new(0);
    let lifecycle = ModelLifecycle::new(
        runtime,
        downloader.clone(),
        ModelSource::path(&model),
        InitializationParameters::default(),
    );

    assert_eq!(lifecycle.start().await.unwrap(), LifecycleState::Available);
    assert_eq!(downloader.attempts.load(Ordering::SeqCst), 0);

    println!("✅ Download stage passed without fetching");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initialization_failure_cleans_up() {
    println!("\n🧪 Testing exhausted model initialization retries...");

    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new();
    backend.fail_next_initializations(usize::MAX);
    let (primary, main_loop) = PrimaryContext::new();
    tokio::spawn(main_loop.run());
    let runtime = Runtime::new(
        test_settings(dir.path()),
        StaticLoader::new(backend.clone()),
        primary,
    );

    let lifecycle = ModelLifecycle::new(
        runtime.clone(),
        FakeDownloader::new(0),
        ModelSource::url(MODEL_URL),
        InitializationParameters::default(),
    )
    .with_retry(fast_retry(1));
    let seen = recorder(&lifecycle);

    assert_eq!(lifecycle.start().await.unwrap(), LifecycleState::Failed);
    settle(&seen, LifecycleState::Failed).await;

    assert_eq!(
        lifecycle.last_error(),
        Some(LifecycleError::ModelInitialization("model".to_string()))
    );
    let attempts = backend
        .calls()
        .iter()
        .filter(|c| c.starts_with("initialize_model"))
        .count();
    assert_eq!(attempts, 2);

    // The runtime was torn down with the model's id
    assert!(!runtime.is_initialized());
    assert!(runtime.model_ids().is_empty());
    let disposed = backend.state.lock().unwrap().disposed.clone();
    assert_eq!(disposed, Some(vec!["model".to_string()]));
    assert!(lifecycle.model_id().is_none());

    println!("✅ Failed after {} attempts with the runtime cleaned up", attempts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_failure_stops_before_download() {
    println!("\n🧪 Testing backend load failure...");

    let dir = tempfile::tempdir().unwrap();
    let (primary, main_loop) = PrimaryContext::new();
    tokio::spawn(main_loop.run());
    let runtime = Runtime::new(
        test_settings(dir.path()),
        SlowLoader::failing(Duration::from_millis(1)),
        primary,
    );

    let downloader = FakeDownloader::new(0);
    let lifecycle = ModelLifecycle::new(
        runtime,
        downloader.clone(),
        ModelSource::url(MODEL_URL),
        InitializationParameters::default(),
    )
    .with_retry(fast_retry(2));

    let _handle = lifecycle.start();
    assert_eq!(lifecycle.wait_terminal().await, LifecycleState::Failed);
    assert_eq!(lifecycle.last_error(), Some(LifecycleError::PluginInitialization));
    assert_eq!(downloader.attempts.load(Ordering::SeqCst), 0);

    println!("✅ Failed in the plugin stage");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_file_without_url_fails() {
    println!("\n🧪 Testing a missing local model...");

    let dir = tempfile::tempdir().unwrap();
    let (primary, main_loop) = PrimaryContext::new();
    tokio::spawn(main_loop.run());
    let runtime = Runtime::new(
        test_settings(dir.path()),
        StaticLoader::new(FakeBackend::new()),
        primary,
    );

    let missing = dir.path().join("missing.gguf");
    let lifecycle = ModelLifecycle::new(
        runtime,
        FakeDownloader::new(0),
        ModelSource::path(&missing),
        InitializationParameters::default(),
    )
    .with_retry(fast_retry(0));

    assert_eq!(lifecycle.start().await.unwrap(), LifecycleState::Failed);
    assert_eq!(
        lifecycle.last_error(),
        Some(LifecycleError::ModelUnavailable(missing))
    );

    println!("✅ Missing file reported as unavailable");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_releases_model() {
    println!("\n🧪 Testing shutdown...");

    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new();
    let (primary, main_loop) = PrimaryContext::new();
    tokio::spawn(main_loop.run());
    let runtime = Runtime::new(
        test_settings(dir.path()),
        StaticLoader::new(backend.clone()),
        primary,
    );

    let lifecycle = ModelLifecycle::new(
        runtime.clone(),
        FakeDownloader::new(0),
        ModelSource::url(MODEL_URL),
        InitializationParameters::default(),
    );
    assert_eq!(lifecycle.start().await.unwrap(), LifecycleState::Available);

    assert!(lifecycle.shutdown().await);
    assert_eq!(lifecycle.state(), LifecycleState::Unstarted);
    assert!(runtime.model_ids().is_empty());
    assert!(backend.calls().contains(&"shutdown_model:model".to_string()));

    // Nothing left to shut down
    assert!(!lifecycle.shutdown().await);

    println!("✅ Model shut down and its id released");
}
