use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

pub type RenewalFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Single-shot timer driving membership renewal. Arming replaces any pending arming, so there
///  is at most one pending callback at a time.
#[cfg_attr(test, automock)]
pub trait MembershipTimer: Send + Sync + 'static {
    /// Runs `callback` once after `interval`. It is fine to call `arm` from inside the callback.
    fn arm(&self, interval: Duration, callback: RenewalFuture);
    /// Prevents a pending callback from running. A callback that is already running is not
    ///  affected.
    fn disarm(&self);
}

/// One spawned tokio task per arming
#[derive(Default)]
pub struct TokioMembershipTimer {
    pending: Arc<Mutex<Option<(u64, JoinHandle<()>)>>>,
    generation: AtomicU64,
}

impl TokioMembershipTimer {
    pub fn new() -> TokioMembershipTimer {
        Default::default()
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.pending).is_some()
    }
}

impl MembershipTimer for TokioMembershipTimer {
    fn arm(&self, interval: Duration, callback: RenewalFuture) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("arming membership timer #{} for {:?}", generation, interval);

        let mut pending = lock(&self.pending);
        if let Some((_, handle)) = pending.take() {
            handle.abort();
        }

        let pending_slot = self.pending.clone();
        *pending = Some((generation, tokio::spawn(async move {
            time::sleep(interval).await;

            // Leave the slot before running the callback so that the callback can re-arm
            //  without aborting itself
            {
                let mut pending = lock(&pending_slot);
                match pending.as_ref() {
                    Some((g, _)) if *g == generation => *pending = None,
                    _ => return,
                }
            }
            callback.await;
        })));
    }

    fn disarm(&self) {
        if let Some((generation, handle)) = lock(&self.pending).take() {
            trace!("disarming membership timer #{}", generation);
            handle.abort();
        }
    }
}

impl Drop for TokioMembershipTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // the protected state stays consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
