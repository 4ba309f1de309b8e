//! Session cookie shared by every request of a source.
//!
//! Some sources answer 401/419 once their session cookie expires. Obtaining
//! a new cookie is the job of an external collaborator; the harvester only
//! marks the session stale and waits until [`SessionHandle::install`] is
//! called with a fresh value.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::error::AppError;
use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
struct SessionState {
    cookie: Option<String>,
    generation: u64,
    stale: bool,
}

/// Cloneable handle to the current session of one source.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<watch::Sender<SessionState>>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SessionHandle {
    pub fn new(cookie: Option<String>) -> Self {
        let (state, _) = watch::channel(SessionState {
            cookie,
            ..SessionState::default()
        });
        Self {
            state: Arc::new(state),
        }
    }

    /// Cookie header value of the current session, if any.
    pub fn cookie(&self) -> Option<String> {
        self.state.borrow().cookie.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.state.borrow().stale
    }

    /// Number of sessions installed since creation.
    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    /// Installs a fresh session and wakes every waiting request.
    pub fn install(&self, cookie: impl Into<String>) {
        let cookie = cookie.into();
        self.state.send_modify(|state| {
            state.cookie = Some(cookie);
            state.generation += 1;
            state.stale = false;
        });
        tracing::info!("New session installed");
    }

    /// Marks the session stale and waits up to `wait` for a new one.
    ///
    /// Returns `SessionExpired` if nothing was installed in time.
    pub async fn wait_for_refresh(&self, wait: Duration) -> Result<(), AppError> {
        let mut rx = self.state.subscribe();
        let seen = rx.borrow_and_update().generation;

        self.state.send_if_modified(|state| {
            let was_fresh = !state.stale;
            state.stale = true;
            was_fresh
        });

        match tokio::time::timeout(wait, rx.wait_for(|state| state.generation > seen)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    wait_secs = wait.as_secs(),
                    "No new session installed in time"
                );
                Err(AppError::SessionExpired)
            }
        }
    }
}
