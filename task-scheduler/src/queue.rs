//! Per-session operation queue.
//!
//! State machine: `Idle → Processing(id) → Idle`. Only the operation whose
//! correlation id is current may advance the queue; completions carrying
//! any other id are stale and ignored.
//!
//! Actions run outside the internal lock. When an action completes
//! synchronously (its wrapped callback fires before it returns), the next
//! action is handed back to the thread already driving the queue instead
//! of being started recursively.

use common::{invoke_guarded, Completion};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Token pairing a submitted action with its completion.
pub type CorrelationId = u64;

/// Queued unit of work. Returning `Err` (or panicking) counts as an
/// immediate failed completion and advances the queue.
pub type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("operation {id} on queue '{queue}' failed: {source}")]
    ActionFailed {
        queue: String,
        id: CorrelationId,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation {id} on queue '{queue}' panicked: {message}")]
    ActionPanicked {
        queue: String,
        id: CorrelationId,
        message: String,
    },

    #[error("operation {id} on queue '{queue}' did not complete within {timeout:?}")]
    Stalled {
        queue: String,
        id: CorrelationId,
        timeout: Duration,
    },
}

struct Pending {
    id: CorrelationId,
    action: Action,
}

#[derive(Default)]
struct QueueState {
    next_id: CorrelationId,
    current: Option<CorrelationId>,
    waiting: VecDeque<Pending>,
    /// Admitted while another thread was driving; picked up by that thread
    handoff: Option<Pending>,
    driving: bool,
    failures: u64,
    /// Stall timer of the operation in flight
    watchdog: Option<JoinHandle<()>>,
}

struct QueueInner {
    name: String,
    stall_timeout: Option<Duration>,
    state: Mutex<QueueState>,
}

/// FIFO admitting at most one in-flight operation.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.name)
            .field("current", &state.current)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl OperationQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stall_timeout(name, None)
    }

    /// Create a queue with a watchdog.
    ///
    /// If the current operation has not advanced within `stall_timeout`,
    /// the watchdog logs an error and force-advances it. The watchdog needs
    /// a tokio runtime at admission time; without one it is skipped.
    pub fn with_stall_timeout(name: impl Into<String>, stall_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                stall_timeout,
                state: Mutex::new(QueueState {
                    next_id: 1,
                    ..Default::default()
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Issue a fresh correlation id. Ids are never reused within a queue.
    pub fn get_new_id(&self) -> CorrelationId {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Id of the operation currently in flight.
    pub fn current(&self) -> Option<CorrelationId> {
        self.inner.state.lock().current
    }

    pub fn is_idle(&self) -> bool {
        self.current().is_none()
    }

    /// Number of submitted operations not yet started.
    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock();
        state.waiting.len() + usize::from(state.handoff.is_some())
    }

    /// Operations that failed synchronously, panicked, or stalled.
    pub fn failures(&self) -> u64 {
        self.inner.state.lock().failures
    }

    /// Wrap `callback` so that it advances the queue after running.
    ///
    /// A panic inside `callback` is logged; the queue still advances.
    pub fn wrap_callback<T, F>(&self, id: CorrelationId, callback: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let queue = self.clone();
        Box::new(move |value: T| {
            invoke_guarded(&queue.inner.name, move || callback(value));
            queue.advance(id);
        })
    }

    /// Run `action` now if idle, otherwise enqueue it behind the others.
    pub fn submit<F>(&self, id: CorrelationId, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let pending = Pending {
            id,
            action: Box::new(action),
        };

        let start = {
            let mut state = self.inner.state.lock();
            if state.current.is_some() {
                debug!(
                    "Queue '{}': operation {} waiting behind {:?}",
                    self.inner.name, id, state.current
                );
                state.waiting.push_back(pending);
                None
            } else {
                Self::admit(&mut state, pending)
            }
        };

        if let Some(pending) = start {
            self.drive(pending);
        }
    }

    /// Mark `id` as completed and start the next operation, if any.
    ///
    /// A stale id (not the one in flight) is logged and ignored.
    pub fn advance(&self, id: CorrelationId) {
        let start = {
            let mut state = self.inner.state.lock();
            if state.current != Some(id) {
                warn!(
                    "Queue '{}': stale completion for operation {} (current: {:?})",
                    self.inner.name, id, state.current
                );
                return;
            }
            Self::finish_current(&mut state)
        };

        if let Some(pending) = start {
            self.drive(pending);
        }
    }

    fn admit(state: &mut QueueState, pending: Pending) -> Option<Pending> {
        state.current = Some(pending.id);
        if state.driving {
            state.handoff = Some(pending);
            None
        } else {
            state.driving = true;
            Some(pending)
        }
    }

    fn finish_current(state: &mut QueueState) -> Option<Pending> {
        state.current = None;
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.abort();
        }
        match state.waiting.pop_front() {
            Some(next) => Self::admit(state, next),
            None => None,
        }
    }

    fn drive(&self, first: Pending) {
        let mut next = Some(first);

        while let Some(Pending { id, action }) = next {
            self.arm_watchdog(id);

            let failure = match catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => None,
                Ok(Err(source)) => Some(QueueError::ActionFailed {
                    queue: self.inner.name.clone(),
                    id,
                    source,
                }),
                Err(payload) => Some(QueueError::ActionPanicked {
                    queue: self.inner.name.clone(),
                    id,
                    message: panic_message(payload.as_ref()),
                }),
            };

            let mut state = self.inner.state.lock();
            if let Some(err) = failure {
                error!("{}", err);
                state.failures += 1;
                // Still driving, so the next operation lands in `handoff`
                if state.current == Some(id) {
                    let started = Self::finish_current(&mut state);
                    debug_assert!(started.is_none());
                }
            }

            next = state.handoff.take();
            if next.is_none() {
                state.driving = false;
            }
        }
    }

    fn arm_watchdog(&self, id: CorrelationId) {
        let Some(timeout) = self.inner.stall_timeout else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(
                "Queue '{}': no tokio runtime, watchdog disabled for {}",
                self.inner.name, id
            );
            return;
        };

        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let watchdog = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let queue = OperationQueue { inner };
            if queue.current() == Some(id) {
                let err = QueueError::Stalled {
                    queue: queue.inner.name.clone(),
                    id,
                    timeout,
                };
                error!("{}", err);
                queue.inner.state.lock().failures += 1;
                queue.advance(id);
            }
        });

        let mut state = self.inner.state.lock();
        if state.current == Some(id) {
            if let Some(previous) = state.watchdog.replace(watchdog) {
                previous.abort();
            }
        } else {
            watchdog.abort();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let queue = OperationQueue::new("ids");
        let a = queue.get_new_id();
        let b = queue.get_new_id();
        assert!(b > a);
    }

    #[test]
    fn test_idle_queue_runs_action_synchronously() {
        let queue = OperationQueue::new("sync");
        let ran = Arc::new(StdMutex::new(false));

        let id = queue.get_new_id();
        let flag = ran.clone();
        queue.submit(id, move || {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        assert!(*ran.lock().unwrap());
        assert_eq!(queue.current(), Some(id));
        queue.advance(id);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_stale_advance_leaves_queue_untouched() {
        let queue = OperationQueue::new("stale");
        let first = queue.get_new_id();
        let second = queue.get_new_id();

        queue.submit(first, || Ok(()));
        queue.submit(second, || Ok(()));

        queue.advance(second);
        assert_eq!(queue.current(), Some(first));
        assert_eq!(queue.pending(), 1);

        queue.advance(first);
        assert_eq!(queue.current(), Some(second));
    }

    #[test]
    fn test_synchronous_completion_chain_does_not_recurse() {
        let queue = OperationQueue::new("chain");
        let count = Arc::new(StdMutex::new(0usize));

        // Block the queue so everything below is enqueued
        let gate = queue.get_new_id();
        queue.submit(gate, || Ok(()));

        for _ in 0..10_000 {
            let id = queue.get_new_id();
            let q = queue.clone();
            let count = count.clone();
            queue.submit(id, move || {
                *count.lock().unwrap() += 1;
                q.wrap_callback(id, |_: ()| {})(());
                Ok(())
            });
        }

        queue.advance(gate);
        assert_eq!(*count.lock().unwrap(), 10_000);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_completed_operations_do_not_leave_watchdogs_behind() {
        let queue =
            OperationQueue::with_stall_timeout("watchdog", Some(Duration::from_secs(300)));

        for _ in 0..100 {
            let id = queue.get_new_id();
            queue.submit(id, || Ok(()));
            assert!(queue.inner.state.lock().watchdog.is_some());
            queue.advance(id);
            assert!(queue.inner.state.lock().watchdog.is_none());
        }

        // A synchronous completion inside the action disarms it too
        let id = queue.get_new_id();
        let q = queue.clone();
        queue.submit(id, move || {
            q.advance(id);
            Ok(())
        });
        assert!(queue.is_idle());
        assert!(queue.inner.state.lock().watchdog.is_none());
    }
}
