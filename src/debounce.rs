use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Implemented by anything the debouncer can flush to disk. `cache` and `rate_limit`
/// each implement this over their own snapshot-and-serialize logic.
#[async_trait::async_trait]
pub trait Persist: Send + Sync {
    async fn persist_now(&self);
}

struct Inner {
    pending: bool,
    in_flight: bool,
    handle: Option<JoinHandle<()>>,
}

/// Coalesces bursts of mutations into a single write: at most one save in flight, at
/// most one more pending behind it. A mutation that lands while a save is already
/// running just sets the pending bit; the in-flight save picks up the latest state
/// once it finishes rather than the state as of when it started.
pub struct Debouncer {
    delay: Duration,
    inner: Mutex<Inner>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, inner: Mutex::new(Inner { pending: false, in_flight: false, handle: None }) })
    }

    /// Request a save. Returns immediately; the actual write happens on a spawned task
    /// after `delay` elapses, unless one is already scheduled or running.
    pub async fn schedule(self: &Arc<Self>, target: Arc<dyn Persist>) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight {
            inner.pending = true;
            return;
        }
        if inner.handle.is_some() {
            // Already waiting out the debounce window; it will see current state
            // when it fires.
            return;
        }

        let this = self.clone();
        inner.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            loop {
                {
                    let mut inner = this.inner.lock().await;
                    inner.pending = false;
                    inner.in_flight = true;
                    inner.handle = None;
                }
                target.persist_now().await;
                let mut inner = this.inner.lock().await;
                inner.in_flight = false;
                if !inner.pending {
                    break;
                }
            }
        }));
    }

    /// Cancels any pending debounce wait and writes immediately, waiting for the write
    /// to finish. Used for explicit `save_immediately()` calls and the best-effort
    /// flush on drop.
    pub async fn flush_now(&self, target: &Arc<dyn Persist>) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.handle.take() {
            handle.abort();
        }
        inner.pending = false;
        inner.in_flight = true;
        drop(inner);

        target.persist_now().await;

        self.inner.lock().await.in_flight = false;
    }
}
