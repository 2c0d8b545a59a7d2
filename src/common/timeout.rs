use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{sleep, Sleep};

/// A resettable idle timer, armed only while a worker has a configured
/// idle duration and is serving.
///
/// Rearmed on every transition into `busy`, per spec §3's idle-timer
/// invariant; left disarmed (never polled to readiness) otherwise.
pub(crate) struct IdleTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    duration: Duration,
}

impl IdleTimer {
    pub(crate) fn new(duration: Duration) -> Self {
        IdleTimer {
            sleep: None,
            duration,
        }
    }

    /// Cancel any pending expiry and arm a fresh one starting now.
    pub(crate) fn rearm(&mut self) {
        self.sleep = Some(Box::pin(sleep(self.duration)));
    }

    /// Disarm the timer; it will never resolve until `rearm` is called again.
    pub(crate) fn disarm(&mut self) {
        self.sleep = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves once the timer expires. Safe to call (and cancel) from
    /// inside a `tokio::select!` arm guarded by [`IdleTimer::is_armed`].
    pub(crate) async fn expired(&mut self) {
        futures_util::future::poll_fn(|cx| self.poll_expired(cx)).await
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.sleep.as_mut() {
            Some(s) => s.as_mut().poll(cx).map(|()| {
                self.sleep = None;
            }),
            None => Poll::Pending,
        }
    }
}
