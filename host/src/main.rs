//! llmbridge - chat with a local model from the terminal.
//!
//! The host owns the primary context: every binding completion is posted
//! to it and drained on the main thread by a current-thread tokio runtime.

use anyhow::{Context, Result};
use clap::Parser;
use common::logging::init_tracing;
use common::{GenerationConfig, InitializationParameters, TokenCallback};
use llmbridge_runtime::{
    HttpDownloadProvider, LifecycleState, ModelLifecycle, ModelSource, ProgressCallback, Runtime,
    Session,
};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use task_scheduler::PrimaryContext;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

mod config;

use crate::config::CliArgs;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let settings = args.settings()?;
    init_tracing(&settings.log_level, args.json_logs);
    args.ensure_model_source()?;

    info!("Starting llmbridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Backend: {:?}", settings.backend.resolve());
    info!("Models directory: {}", settings.models_dir.display());

    let (primary, main_loop) = PrimaryContext::new();
    let pump = tokio::spawn(main_loop.run());
    let runtime = Runtime::with_platform_loader(settings, primary);

    let mut params = InitializationParameters::default();
    params.context.context_length = args.context_length();
    let lifecycle = ModelLifecycle::new(
        runtime.clone(),
        Arc::new(HttpDownloadProvider::new()),
        ModelSource {
            url: args.model_url.clone(),
            path: args.model_path.clone(),
        },
        params,
    );
    lifecycle.add_observer(Arc::new(|state: LifecycleState| {
        info!("Model state: {:?}", state);
    }));
    lifecycle.set_download_progress(progress_logger());

    let outcome = run(&args, &runtime, &lifecycle).await;

    if lifecycle.state() == LifecycleState::Available {
        lifecycle.shutdown().await;
    }
    if runtime.cleanup_async().await {
        debug!("Inference backend released");
    }
    pump.abort();
    outcome
}

async fn run(args: &CliArgs, runtime: &Runtime, lifecycle: &ModelLifecycle) -> Result<()> {
    let state = lifecycle.start().await.context("lifecycle task failed")?;
    if state != LifecycleState::Available {
        let reason = lifecycle
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("{:?}", state));
        anyhow::bail!("model is not available: {}", reason);
    }
    let model_id = lifecycle
        .model_id()
        .context("lifecycle finished without a model id")?;

    let session = Session::new(runtime.clone(), model_id);
    if !session.init_async(args.system.as_deref()).await {
        anyhow::bail!("failed to create the conversation contexts");
    }

    let result = match &args.prompt {
        Some(prompt) => answer(&session, prompt).await,
        None => chat(&session).await,
    };

    if !session.free_async().await {
        warn!("Conversation contexts were not released cleanly");
    }
    result
}

/// Log download progress at most once per 10%.
fn progress_logger() -> ProgressCallback {
    let last_decile = Arc::new(AtomicU64::new(u64::MAX));
    Arc::new(move |downloaded: u64, total: u64| {
        if total == 0 {
            debug!("Downloaded {} bytes", downloaded);
            return;
        }
        let decile = downloaded.saturating_mul(10) / total;
        if last_decile.swap(decile, Ordering::Relaxed) != decile {
            info!("Download {}% ({} / {} bytes)", decile * 10, downloaded, total);
        }
    })
}

/// Add `prompt` as a user turn and stream the reply to stdout. Ctrl-C
/// aborts the generation.
async fn answer(session: &Session, prompt: &str) -> Result<()> {
    if !session.add_turn_async("user", prompt).await {
        anyhow::bail!("failed to add the prompt to the conversation");
    }

    let on_token: TokenCallback = Arc::new(|token: &str| {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(token.as_bytes());
        let _ = stdout.flush();
    });

    let config = GenerationConfig::default();
    let generation = session.generate_async(&config, on_token);
    tokio::pin!(generation);
    let ok = tokio::select! {
        ok = &mut generation => ok,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting generation");
            session.abort();
            generation.await
        }
    };
    println!();

    if !ok {
        warn!("Generation did not complete");
    }
    Ok(())
}

async fn chat(session: &Session) -> Result<()> {
    println!("Type a message, /reset to start over, /history to show the conversation, /quit to leave.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                if session.reset_async().await {
                    println!("(conversation cleared)");
                } else {
                    warn!("Reset failed");
                }
            }
            "/history" => match session.get_input_context_async().await {
                Some(history) => {
                    for message in history.iter() {
                        println!("[{}] {}", message.role, message.content);
                    }
                }
                None => warn!("Could not read the conversation"),
            },
            prompt => answer(session, prompt).await?,
        }
    }
    Ok(())
}
