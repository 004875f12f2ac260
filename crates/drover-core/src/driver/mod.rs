//! Session drivers: subprocess ownership in two flavors.
//!
//! A driver owns exactly one subprocess. [`headless`] spawns a fresh
//! process per prompt and collects its output to exit; [`interactive`]
//! keeps a process alive under a pty and exchanges prompt/response turns
//! with it. Both feed the [`crate::matcher::StreamMatcher`] and report
//! completed turns as [`DriverReply`] values.

pub mod headless;
pub mod interactive;

use crate::error::FailureKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Where a driver currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Spawning,
    Ready,
    Writing,
    AwaitingPrompt,
    Closed,
    Failed(FailureKind),
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverState::Spawning => write!(f, "spawning"),
            DriverState::Ready => write!(f, "ready"),
            DriverState::Writing => write!(f, "writing"),
            DriverState::AwaitingPrompt => write!(f, "awaiting-prompt"),
            DriverState::Closed => write!(f, "closed"),
            DriverState::Failed(kind) => write!(f, "failed:{}", kind.token()),
        }
    }
}

/// One completed prompt/response turn, either flavor.
#[derive(Debug, Clone)]
pub struct DriverReply {
    /// Logical response text (clean view; interactive replies have the
    /// trailing prompt stripped).
    pub text: String,
    /// Raw bytes with ANSI preserved, for downstream rendering.
    pub raw: Vec<u8>,
    /// Latest resume token observed during the turn, if any.
    pub resume_token: Option<String>,
    /// Exit code for headless runs; interactive turns have none.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// Cooperative cancellation carried with each pending prompt.
///
/// Cloned handles share one flag; `cancelled()` resolves for every waiter
/// once `cancel()` has been called, including waiters that subscribe late.
#[derive(Clone, Default)]
#[derive(Debug)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default, Debug)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancelled. Registering before the flag check avoids the
    /// notify-then-wait race.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
