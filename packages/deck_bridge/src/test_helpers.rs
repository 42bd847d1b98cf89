use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::protocol::{CancelResult, RunResult, Slot, SlotStatus};
use crate::registry::{ProviderRegistration, ProviderRegistry, RegistrationHandle, SlotProvider};

/// Provider with a fixed slot list. `run` echoes the local id back as the
/// task id; `cancel` succeeds only when built with [`StaticProvider::cancellable`].
pub struct StaticProvider {
    pub id: String,
    pub slots: Vec<String>,
    pub active: Arc<AtomicBool>,
    pub can_cancel: bool,
}

impl StaticProvider {
    pub fn new(id: &str, slots: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            slots: slots.iter().map(|s| s.to_string()).collect(),
            active: Arc::new(AtomicBool::new(true)),
            can_cancel: false,
        }
    }

    pub fn cancellable(mut self) -> Self {
        self.can_cancel = true;
        self
    }
}

#[async_trait]
impl SlotProvider for StaticProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn slots(&self) -> Vec<Slot> {
        self.slots
            .iter()
            .map(|id| Slot {
                id: id.clone(),
                svg: format!("data:image/svg+xml,{id}"),
                status: SlotStatus::Idle,
            })
            .collect()
    }

    async fn run(&self, local_id: &str) -> RunResult {
        RunResult::started(local_id)
    }

    async fn cancel(&self, _local_id: &str) -> Option<CancelResult> {
        self.can_cancel.then(CancelResult::ok)
    }
}

pub async fn register_static(
    registry: &ProviderRegistry,
    provider: StaticProvider,
) -> RegistrationHandle {
    registry
        .register(|_| async move { Ok(ProviderRegistration::new(Arc::new(provider))) })
        .await
        .expect("register static provider")
}

/// Timings scaled for tests: the connect timeout is generous enough for a
/// loaded CI machine, and re-election retries quickly.
pub fn test_config(port: u16) -> BridgeConfig {
    BridgeConfig {
        port,
        follower_connect_timeout: Duration::from_millis(500),
        rpc_timeout: Duration::from_secs(5),
        reelection_jitter: Duration::from_millis(50),
        reelection_retry: Duration::from_millis(50),
    }
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}
