//! Election Coordinator
//!
//! Owns this window's role. Leadership is whoever holds the listening port:
//! a refused follower connection means there is no leader, a failed bind
//! means there already is one.
//!
//! ```text
//!   Unelected ──start──▶ Follower ──unexpected close──▶ Electing ─┐
//!       │                   ▲                                      │
//!       └──(no leader)──▶ Leader ◀─────────────────────────────────┘
//! ```

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::follower::FollowerClient;
use crate::leader::LeaderServer;
use crate::registry::ProviderRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Unelected,
    Leader,
    Follower,
}

enum Role {
    Unelected,
    Leader(LeaderServer),
    Follower(FollowerClient),
}

impl Role {
    fn kind(&self) -> RoleKind {
        match self {
            Role::Unelected => RoleKind::Unelected,
            Role::Leader(_) => RoleKind::Leader,
            Role::Follower(_) => RoleKind::Follower,
        }
    }
}

struct Inner {
    window_id: String,
    registry: ProviderRegistry,
    config: BridgeConfig,
    role: Mutex<Role>,
    focused: AtomicBool,
    shutdown: CancellationToken,
    disconnect_tx: mpsc::UnboundedSender<()>,
    disconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

#[derive(Clone)]
pub struct ElectionCoordinator {
    inner: Arc<Inner>,
}

/// `window-<unix millis>-<6 random lowercase alphanumerics>`.
pub fn generate_window_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("window-{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

impl ElectionCoordinator {
    pub fn new(window_id: impl Into<String>, registry: ProviderRegistry, config: BridgeConfig) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                window_id: window_id.into(),
                registry,
                config,
                role: Mutex::new(Role::Unelected),
                focused: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                disconnect_tx,
                disconnect_rx: Mutex::new(Some(disconnect_rx)),
            }),
        }
    }

    pub fn window_id(&self) -> &str {
        &self.inner.window_id
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub async fn role(&self) -> RoleKind {
        self.inner.role.lock().await.kind()
    }

    /// Join an existing leader, or become the leader if none answers.
    ///
    /// A bind failure is returned and leaves this window unelected; it is not
    /// retried. Once [`stop`](Self::stop) has run the coordinator is spent.
    pub async fn start(&self) -> Result<RoleKind, BridgeError> {
        let inner = &self.inner;
        let mut role = inner.role.lock().await;
        if inner.shutdown.is_cancelled() {
            return Err(BridgeError::Stopped);
        }
        if !matches!(*role, Role::Unelected) {
            return Ok(role.kind());
        }

        *role = match try_follower(inner).await {
            Ok(follower) => Role::Follower(follower),
            Err(e) => {
                debug!(window_id = %inner.window_id, error = %e, "no leader answered");
                let leader =
                    LeaderServer::start(inner.window_id.clone(), inner.registry.clone(), &inner.config)
                        .await?;
                info!(window_id = %inner.window_id, "became leader");
                Role::Leader(leader)
            }
        };
        publish_focus(inner, &role).await;
        let kind = role.kind();
        drop(role);

        if let Some(rx) = inner.disconnect_rx.lock().await.take() {
            tokio::spawn(supervise(inner.clone(), rx));
        }
        Ok(kind)
    }

    /// Record window focus and forward it to the current role.
    pub async fn set_focused(&self, focused: bool) {
        self.inner.focused.store(focused, Ordering::SeqCst);
        let role = self.inner.role.lock().await;
        publish_focus(&self.inner, &role).await;
    }

    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let role = std::mem::replace(&mut *self.inner.role.lock().await, Role::Unelected);
        match role {
            Role::Leader(leader) => leader.stop().await,
            Role::Follower(follower) => follower.stop().await,
            Role::Unelected => {}
        }
        info!(window_id = %self.inner.window_id, "election coordinator stopped");
    }
}

async fn try_follower(inner: &Arc<Inner>) -> Result<FollowerClient, BridgeError> {
    let tx = inner.disconnect_tx.clone();
    let follower = FollowerClient::connect(
        inner.window_id.clone(),
        inner.registry.clone(),
        &inner.config,
        move || {
            let _ = tx.send(());
        },
    )
    .await?;
    info!(window_id = %inner.window_id, "became follower");
    Ok(follower)
}

async fn publish_focus(inner: &Inner, role: &Role) {
    let focused = inner.focused.load(Ordering::SeqCst);
    match role {
        Role::Leader(leader) if focused => leader.notify_focus(&inner.window_id).await,
        Role::Leader(leader) => leader.notify_blur(&inner.window_id).await,
        Role::Follower(follower) if focused => follower.notify_focus().await,
        Role::Follower(follower) => follower.notify_blur().await,
        Role::Unelected => {}
    }
}

/// Runs one re-election per follower disconnect until the coordinator stops.
async fn supervise(inner: Arc<Inner>, mut disconnects: mpsc::UnboundedReceiver<()>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            signal = disconnects.recv() => {
                if signal.is_none() {
                    break;
                }
                reelect(&inner).await;
            }
        }
    }
}

/// Jittered, then retried at a fixed interval with no cap until this window
/// is leader or follower again.
async fn reelect(inner: &Arc<Inner>) {
    {
        let mut role = inner.role.lock().await;
        if !matches!(*role, Role::Follower(_)) {
            return;
        }
        // The connection is already gone; dropping the client ends its tasks.
        *role = Role::Unelected;
    }

    let max_jitter = inner.config.reelection_jitter.as_millis() as u64;
    let jitter = Duration::from_millis(rand::rng().random_range(0..=max_jitter));
    info!(window_id = %inner.window_id, jitter_ms = jitter.as_millis() as u64, "leader lost, re-electing");
    tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        if inner.shutdown.is_cancelled() {
            return;
        }

        let elected = match LeaderServer::start(
            inner.window_id.clone(),
            inner.registry.clone(),
            &inner.config,
        )
        .await
        {
            Ok(leader) => {
                info!(window_id = %inner.window_id, attempt, "became leader");
                Some(Role::Leader(leader))
            }
            Err(e) => {
                debug!(attempt, error = %e, "could not take leadership, retrying");
                match try_follower(inner).await {
                    Ok(follower) => Some(Role::Follower(follower)),
                    Err(e) => {
                        debug!(attempt, error = %e, "could not join a leader, retrying");
                        None
                    }
                }
            }
        };

        if let Some(new_role) = elected {
            let mut role = inner.role.lock().await;
            if inner.shutdown.is_cancelled() {
                drop(role);
                match new_role {
                    Role::Leader(leader) => leader.stop().await,
                    Role::Follower(follower) => follower.stop().await,
                    Role::Unelected => {}
                }
                return;
            }
            *role = new_role;
            publish_focus(inner, &role).await;
            return;
        }

        if attempt % 50 == 0 {
            warn!(window_id = %inner.window_id, attempt, "still re-electing");
        }
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(inner.config.reelection_retry) => {}
        }
    }
}
