//! Microphone permission tracking
//!
//! The gate caches the last known microphone authorization and keeps it
//! current from the platform's change notifications. Every session start
//! reads it; nothing retries on its behalf.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::HostTrait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Authorization state for a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionState {
    /// Not yet queried
    #[default]
    Unknown,
    /// User allowed access
    Granted,
    /// User or platform refused access
    Denied,
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
        }
    }
}

/// Errors reported by a permission provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum PermissionError {
    /// The platform cannot report this permission
    #[error("permission query not supported")]
    Unsupported,

    /// The query itself failed
    #[error("permission query failed: {0}")]
    Query(String),
}

/// Platform source of microphone permission
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Query the current microphone permission
    ///
    /// # Errors
    ///
    /// Returns error if the platform cannot answer
    async fn query_microphone(&self) -> Result<PermissionState, PermissionError>;

    /// Subscribe to permission changes, if the platform pushes them
    fn changes(&self) -> Option<mpsc::UnboundedReceiver<PermissionState>>;
}

/// Cached microphone permission shared by all components
#[derive(Clone)]
pub struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    microphone: Arc<watch::Sender<PermissionState>>,
}

impl PermissionGate {
    /// Create a gate in the `Unknown` state
    #[must_use]
    pub fn new(provider: Arc<dyn PermissionProvider>) -> Self {
        let (tx, _rx) = watch::channel(PermissionState::Unknown);
        Self {
            provider,
            microphone: Arc::new(tx),
        }
    }

    /// Ask the platform for the current microphone permission and cache it
    ///
    /// A failed query keeps the cached value.
    pub async fn query_microphone(&self) -> PermissionState {
        match self.provider.query_microphone().await {
            Ok(state) => {
                self.update(state);
                state
            }
            Err(e) => {
                tracing::warn!(error = %e, "microphone permission query failed");
                self.microphone()
            }
        }
    }

    /// Last known microphone permission
    #[must_use]
    pub fn microphone(&self) -> PermissionState {
        *self.microphone.borrow()
    }

    /// Whether a session may start
    #[must_use]
    pub fn require_granted(&self) -> bool {
        self.microphone() == PermissionState::Granted
    }

    /// Record that the platform refused microphone access mid-session
    pub fn revoke(&self) {
        self.update(PermissionState::Denied);
    }

    /// Watch permission changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PermissionState> {
        self.microphone.subscribe()
    }

    /// Forward platform change notifications into the cache
    ///
    /// Returns `None` when the provider does not push changes. The task ends
    /// when the provider stops sending or every gate clone is dropped.
    #[must_use]
    pub fn listen_for_changes(&self) -> Option<JoinHandle<()>> {
        let mut changes = self.provider.changes()?;
        let cache: Weak<watch::Sender<PermissionState>> = Arc::downgrade(&self.microphone);

        Some(tokio::spawn(async move {
            while let Some(state) = changes.recv().await {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.send_if_modified(|current| replace_if_changed(current, state));
            }
            tracing::debug!("permission change listener stopped");
        }))
    }

    fn update(&self, state: PermissionState) {
        self.microphone
            .send_if_modified(|current| replace_if_changed(current, state));
    }
}

fn replace_if_changed(current: &mut PermissionState, state: PermissionState) -> bool {
    if *current == state {
        return false;
    }
    tracing::info!(from = %current, to = %state, "microphone permission changed");
    *current = state;
    true
}

/// Fixed permission, for headless use and `--assume-mic-granted`
pub struct StaticPermissions(pub PermissionState);

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn query_microphone(&self) -> Result<PermissionState, PermissionError> {
        Ok(self.0)
    }

    fn changes(&self) -> Option<mpsc::UnboundedReceiver<PermissionState>> {
        None
    }
}

/// Desktop permission: granted while a default input device exists
pub struct InputDevicePermissions {
    poll_interval: Duration,
}

impl InputDevicePermissions {
    /// Create a provider polling every two seconds
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }

    fn probe() -> PermissionState {
        if cpal::default_host().default_input_device().is_some() {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        }
    }
}

impl Default for InputDevicePermissions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionProvider for InputDevicePermissions {
    async fn query_microphone(&self) -> Result<PermissionState, PermissionError> {
        tokio::task::spawn_blocking(Self::probe)
            .await
            .map_err(|e| PermissionError::Query(e.to_string()))
    }

    fn changes(&self) -> Option<mpsc::UnboundedReceiver<PermissionState>> {
        let (rx, _task) = poll_changes(self.poll_interval, Self::probe);
        Some(rx)
    }
}

/// Report each change in `probe`'s answer, checking every `period`
///
/// The task ends once the receiver is dropped.
fn poll_changes(
    period: Duration,
    probe: fn() -> PermissionState,
) -> (mpsc::UnboundedReceiver<PermissionState>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        let mut last = PermissionState::Unknown;
        loop {
            tokio::select! {
                biased;
                () = tx.closed() => break,
                _ = interval.tick() => {}
            }
            let Ok(state) = tokio::task::spawn_blocking(probe).await else {
                break;
            };
            if state != last {
                last = state;
                if tx.send(state).is_err() {
                    break;
                }
            }
        }
        tracing::debug!("microphone polling stopped");
    });

    (rx, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        state: PermissionState,
        changes: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PermissionState>>>,
    }

    #[async_trait]
    impl PermissionProvider for Scripted {
        async fn query_microphone(&self) -> Result<PermissionState, PermissionError> {
            Ok(self.state)
        }

        fn changes(&self) -> Option<mpsc::UnboundedReceiver<PermissionState>> {
            self.changes.lock().unwrap().take()
        }
    }

    struct Broken;

    #[async_trait]
    impl PermissionProvider for Broken {
        async fn query_microphone(&self) -> Result<PermissionState, PermissionError> {
            Err(PermissionError::Unsupported)
        }

        fn changes(&self) -> Option<mpsc::UnboundedReceiver<PermissionState>> {
            None
        }
    }

    #[tokio::test]
    async fn test_starts_unknown_and_caches_query() {
        let gate = PermissionGate::new(Arc::new(StaticPermissions(PermissionState::Granted)));
        assert_eq!(gate.microphone(), PermissionState::Unknown);
        assert!(!gate.require_granted());

        assert_eq!(gate.query_microphone().await, PermissionState::Granted);
        assert!(gate.require_granted());
    }

    #[tokio::test]
    async fn test_failed_query_keeps_cached_value() {
        let gate = PermissionGate::new(Arc::new(Broken));
        assert_eq!(gate.query_microphone().await, PermissionState::Unknown);
    }

    #[tokio::test]
    async fn test_revoke_sets_denied() {
        let gate = PermissionGate::new(Arc::new(StaticPermissions(PermissionState::Granted)));
        gate.query_microphone().await;
        gate.revoke();
        assert_eq!(gate.microphone(), PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_change_notifications_update_cache() {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = PermissionGate::new(Arc::new(Scripted {
            state: PermissionState::Unknown,
            changes: std::sync::Mutex::new(Some(rx)),
        }));
        let mut watcher = gate.subscribe();
        let handle = gate.listen_for_changes().expect("provider pushes changes");

        tx.send(PermissionState::Granted).unwrap();
        watcher
            .wait_for(|s| *s == PermissionState::Granted)
            .await
            .unwrap();
        assert!(gate.require_granted());

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_reports_changes_only() {
        let (mut rx, _task) = poll_changes(Duration::from_secs(2), || PermissionState::Granted);

        assert_eq!(rx.recv().await, Some(PermissionState::Granted));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_when_receiver_dropped() {
        let (mut rx, task) = poll_changes(Duration::from_secs(2), || PermissionState::Granted);
        assert_eq!(rx.recv().await, Some(PermissionState::Granted));

        // the state never changes again, so nothing is ever sent
        drop(rx);
        tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("polling kept running")
            .unwrap();
    }

    #[test]
    fn test_static_provider_has_no_change_stream() {
        assert!(StaticPermissions(PermissionState::Denied).changes().is_none());
    }
}
