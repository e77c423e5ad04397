//! Backing store lifecycle: provisioning, readiness and teardown.

pub mod controller;
pub mod provisioner;

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

pub use controller::{
    BackendTarget, LifecycleController, LifecycleSettings, OperationPermit, MAX_IN_FLIGHT,
};
pub use provisioner::{DockerProvisioner, Provisioner};

/// Readiness state of the backing store.
///
/// ```text
/// Uninitialized -> Provisioning -> HealthChecking -> Ready
/// Ready -> Degraded -> HealthChecking -> Ready
/// any -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Uninitialized,
    Provisioning,
    HealthChecking,
    Ready,
    Degraded,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Provisioning => "PROVISIONING",
            Self::HealthChecking => "HEALTH_CHECKING",
            Self::Ready => "READY",
            Self::Degraded => "DEGRADED",
            Self::Stopped => "STOPPED",
        }
    }

    /// Whether operations may be issued against the backend. A degraded
    /// backend still accepts operations until the degraded timeout expires.
    #[must_use]
    pub const fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one running backend.
///
/// Cloning is cheap. The readiness state is a live view of the
/// controller's state machine, so every clone observes transitions.
#[derive(Debug, Clone)]
pub struct BackingStoreHandle {
    endpoint: String,
    api_key: Option<String>,
    managed: bool,
    state: watch::Receiver<LifecycleState>,
}

impl BackingStoreHandle {
    pub(crate) fn new(
        endpoint: String,
        api_key: Option<String>,
        managed: bool,
        state: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            endpoint,
            api_key,
            managed,
            state,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Whether this process launched the backend and owns its teardown.
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.managed
    }

    /// Current readiness state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }
}

impl PartialEq for BackingStoreHandle {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.api_key == other.api_key
            && self.managed == other.managed
    }
}

impl Eq for BackingStoreHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::HealthChecking.to_string(), "HEALTH_CHECKING");
        assert_eq!(LifecycleState::Ready.to_string(), "READY");
    }

    #[test]
    fn test_serving_states() {
        assert!(LifecycleState::Ready.is_serving());
        assert!(LifecycleState::Degraded.is_serving());
        assert!(!LifecycleState::Provisioning.is_serving());
        assert!(!LifecycleState::Stopped.is_serving());
    }

    #[test]
    fn test_handle_observes_state_changes() {
        let (tx, rx) = watch::channel(LifecycleState::HealthChecking);
        let handle = BackingStoreHandle::new("http://127.0.0.1:6333".into(), None, true, rx);
        assert!(!handle.is_ready());
        tx.send_replace(LifecycleState::Ready);
        assert!(handle.is_ready());
        assert!(handle.is_managed());
    }

    #[test]
    fn test_handle_equality_ignores_state() {
        let (tx, rx) = watch::channel(LifecycleState::Ready);
        let a = BackingStoreHandle::new("http://db:6333".into(), None, false, rx.clone());
        let b = BackingStoreHandle::new("http://db:6333".into(), None, false, rx);
        tx.send_replace(LifecycleState::Degraded);
        assert_eq!(a, b);
    }
}
