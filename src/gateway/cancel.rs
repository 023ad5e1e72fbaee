use std::future::Future;
use std::io;

use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

/// Result of a bounded, interruptible wait on a socket. Hard I/O failures are reported
///  through the surrounding `io::Result` instead.
#[derive(Debug, Eq, PartialEq)]
pub enum PollOutcome<T> {
    Data(T),
    Timeout,
    Cancelled,
}

/// Sticky cancellation: once cancelled, every current and future watcher sees it
#[derive(Debug, Clone)]
pub struct CancelSignal {
    sender: watch::Sender<bool>,
}
impl Default for CancelSignal {
    fn default() -> Self {
        CancelSignal::new()
    }
}
impl CancelSignal {
    pub fn new() -> CancelSignal {
        let (sender, _) = watch::channel(false);
        CancelSignal { sender }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn watcher(&self) -> CancelWatcher {
        CancelWatcher {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelWatcher {
    receiver: watch::Receiver<bool>,
}
impl CancelWatcher {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// completes once the signal is cancelled
    pub async fn cancelled(&mut self) {
        // the sender lives in the CancelSignal, so an error means nobody can cancel anymore
        if self.receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Waits for `io` until `deadline`, giving up early if `cancel` fires
pub async fn poll_bounded<T>(io: impl Future<Output = io::Result<T>>, deadline: Instant, cancel: &mut CancelWatcher) -> io::Result<PollOutcome<T>> {
    if cancel.is_cancelled() {
        return Ok(PollOutcome::Cancelled);
    }

    tokio::select! {
        r = timeout_at(deadline, io) => match r {
            Ok(Ok(data)) => Ok(PollOutcome::Data(data)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(PollOutcome::Timeout),
        },
        _ = cancel.cancelled() => Ok(PollOutcome::Cancelled),
    }
}
