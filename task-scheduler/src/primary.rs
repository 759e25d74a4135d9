//! The host's primary execution context.
//!
//! Background completions (native calls on the blocking pool, the sandbox
//! reply pump) never invoke user callbacks directly; they post them here,
//! and the host drains the loop from its main thread.

use common::{invoke_guarded, Completion};
use tokio::sync::mpsc;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle used to post work onto the primary context. Cheap to clone.
#[derive(Clone)]
pub struct PrimaryContext {
    tx: mpsc::UnboundedSender<Job>,
}

/// Receiving side, owned by whoever runs the main loop.
pub struct PrimaryLoop {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl std::fmt::Debug for PrimaryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryContext")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl PrimaryContext {
    pub fn new() -> (Self, PrimaryLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, PrimaryLoop { rx })
    }

    /// Queue `job` to run on the primary context.
    ///
    /// Returns `false` if the loop has been dropped; the job is discarded.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            debug!("Primary loop closed, dropping posted job");
            return false;
        }
        true
    }

    /// Wrap `callback` so that invoking it from any thread posts the call
    /// onto the primary context.
    pub fn wrap<T, F>(&self, callback: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let ctx = self.clone();
        Box::new(move |value: T| {
            ctx.post(move || callback(value));
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PrimaryLoop {
    /// Run every job queued so far without waiting. Returns how many ran.
    ///
    /// Jobs posted by the jobs themselves are also drained.
    pub fn pump(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            invoke_guarded("primary", job);
            ran += 1;
        }
        ran
    }

    /// Wait for the next job and run it. Returns `false` once every
    /// [`PrimaryContext`] handle is gone.
    pub async fn turn(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                invoke_guarded("primary", job);
                true
            }
            None => false,
        }
    }

    /// Run jobs until every sender is dropped.
    pub async fn run(mut self) {
        while self.turn().await {}
    }
}
