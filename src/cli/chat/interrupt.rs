use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exit status of a process stopped by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Routes Ctrl-C to the reply being streamed.
///
/// One listener is installed for the whole session. While a reply is in
/// flight a Ctrl-C cancels it; at any other time the process exits, as it
/// would without a handler.
#[derive(Clone, Default)]
pub struct InterruptRouter {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl InterruptRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening for Ctrl-C. Abort the handle when the session ends.
    pub fn listen(&self) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !router.interrupt() {
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        })
    }

    /// Token for the reply about to stream; Ctrl-C cancels it until [`end`](Self::end).
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot() = Some(token.clone());
        token
    }

    pub fn end(&self) {
        self.slot().take();
    }

    /// Cancel the reply in flight. Returns `false` when there is none.
    pub fn interrupt(&self) -> bool {
        match self.slot().take() {
            Some(token) => {
                debug!("Interrupt: cancelling reply");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
