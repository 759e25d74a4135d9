//! Exponential-backoff retry around completion-callback operations.

use common::{invoke_guarded, Completion, RetryConfig};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Retry `operation` until it reports success or the budget runs out.
///
/// `operation` receives a completion callback and must eventually call it
/// with the attempt's outcome. Returning `Err`, panicking, or dropping the
/// completion without calling it all count as a failed attempt.
///
/// Exactly one of `on_success` / `on_failure` runs, once. Must be called
/// from within a tokio runtime.
pub fn execute_with_retry<Op, S, F>(
    name: impl Into<String>,
    operation: Op,
    on_success: S,
    on_failure: F,
    config: RetryConfig,
) -> JoinHandle<()>
where
    Op: FnMut(Completion<bool>) -> anyhow::Result<()> + Send + 'static,
    S: FnOnce() + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        if run_with_retry(&name, operation, config).await {
            invoke_guarded(&name, on_success);
        } else {
            invoke_guarded(&name, on_failure);
        }
    })
}

/// Async form of [`execute_with_retry`]: resolves to the final outcome.
pub async fn run_with_retry<Op>(name: &str, mut operation: Op, config: RetryConfig) -> bool
where
    Op: FnMut(Completion<bool>) -> anyhow::Result<()> + Send + 'static,
{
    let mut failures: u32 = 0;

    loop {
        let attempt = failures + 1;
        let (tx, rx) = oneshot::channel::<bool>();
        let completion: Completion<bool> = Box::new(move |ok| {
            let _ = tx.send(ok);
        });

        let started = match catch_unwind(AssertUnwindSafe(|| operation(completion))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("'{}' attempt {} failed to start: {:#}", name, attempt, e);
                false
            }
            Err(_) => {
                error!("'{}' attempt {} panicked", name, attempt);
                false
            }
        };

        // A completion dropped without being called reads as failure
        let ok = started && rx.await.unwrap_or(false);
        if ok {
            if failures > 0 {
                info!("'{}' succeeded on attempt {}", name, attempt);
            }
            return true;
        }

        failures += 1;
        if config.exhausted(failures) {
            error!("'{}' failed after {} attempt(s), giving up", name, failures);
            return false;
        }

        let delay = config.delay_for(failures);
        warn!(
            "'{}' attempt {} failed, retrying in {:?}",
            name, attempt, delay
        );
        tokio::time::sleep(delay).await;
    }
}
