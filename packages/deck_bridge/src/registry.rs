//! Provider Registry
//!
//! Aggregates this process's slot providers into one ordered slot list,
//! routes run/cancel calls to the owning provider, and publishes two feeds:
//! a change feed (slots may differ) and a task-completion feed.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProvidersConfig;
use crate::error::CommandError;
use crate::protocol::{
    CancelResult, RunResult, Slot, SlotAddress, TaskCompleteEvent, TaskResult, composite_id,
};

/// A local source of runnable slots.
#[async_trait]
pub trait SlotProvider: Send + Sync {
    /// Stable id; must not contain `:`. Registering a second provider with
    /// the same id replaces the first.
    fn id(&self) -> &str;

    fn is_active(&self) -> bool {
        true
    }

    /// Current slots, with provider-local ids.
    fn slots(&self) -> Vec<Slot>;

    async fn run(&self, local_id: &str) -> RunResult;

    /// `None` means this provider cannot cancel.
    async fn cancel(&self, _local_id: &str) -> Option<CancelResult> {
        None
    }
}

/// Resource released when a provider is unregistered or replaced.
pub struct Cleanup(Box<dyn FnOnce() + Send + Sync>);

impl Cleanup {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn cancel_token(token: CancellationToken) -> Self {
        Self::new(move || token.cancel())
    }

    fn release(self) {
        (self.0)()
    }
}

/// What a provider factory hands back to the registry.
pub struct ProviderRegistration {
    pub provider: Arc<dyn SlotProvider>,
    pub cleanup: Vec<Cleanup>,
}

impl ProviderRegistration {
    pub fn new(provider: Arc<dyn SlotProvider>) -> Self {
        Self {
            provider,
            cleanup: Vec::new(),
        }
    }

    pub fn with_cleanup(mut self, cleanup: Cleanup) -> Self {
        self.cleanup.push(cleanup);
        self
    }
}

/// Handed to a provider factory so the provider can report changes.
#[derive(Clone)]
pub struct ProviderNotifiers {
    provider_id: Arc<OnceLock<String>>,
    change_tx: broadcast::Sender<()>,
    task_tx: broadcast::Sender<TaskCompleteEvent>,
}

impl ProviderNotifiers {
    pub fn notify_change(&self) {
        let _ = self.change_tx.send(());
    }

    /// Report that the task started for `local_id` has finished.
    pub fn notify_task_complete(&self, local_id: &str, result: TaskResult) {
        let Some(provider_id) = self.provider_id.get() else {
            warn!(local_id, "task completed before its provider finished registering");
            return;
        };
        let _ = self.task_tx.send(TaskCompleteEvent {
            slot_id: format!("{provider_id}:{local_id}"),
            result,
        });
    }
}

struct ProviderEntry {
    seq: u64,
    provider: Arc<dyn SlotProvider>,
    cleanup: Vec<Cleanup>,
}

struct RegistryInner {
    /// Registration order; replacement moves a provider to the end.
    entries: Vec<ProviderEntry>,
    next_seq: u64,
    config: ProvidersConfig,
}

#[derive(Clone)]
pub struct ProviderRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    change_tx: broadcast::Sender<()>,
    task_tx: broadcast::Sender<TaskCompleteEvent>,
}

/// Returned by [`ProviderRegistry::register`]; disposing removes the
/// provider, unless it has since been replaced by a newer registration.
pub struct RegistrationHandle {
    registry: ProviderRegistry,
    provider_id: String,
    seq: u64,
}

impl RegistrationHandle {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub async fn dispose(self) {
        let mut inner = self.registry.inner.lock().await;
        let Some(pos) = inner
            .entries
            .iter()
            .position(|e| e.seq == self.seq && e.provider.id() == self.provider_id)
        else {
            debug!(provider = %self.provider_id, "dispose of stale registration ignored");
            return;
        };
        let entry = inner.entries.remove(pos);
        entry.cleanup.into_iter().for_each(Cleanup::release);
        info!(provider = %self.provider_id, "provider unregistered");
        let _ = self.registry.change_tx.send(());
    }
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        let (task_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                entries: Vec::new(),
                next_seq: 0,
                config,
            })),
            change_tx,
            task_tx,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }

    pub fn subscribe_task_complete(&self) -> broadcast::Receiver<TaskCompleteEvent> {
        self.task_tx.subscribe()
    }

    /// Build a provider via `factory` and add it, replacing any provider
    /// with the same id. The replaced provider's cleanup runs first.
    pub async fn register<F, Fut>(&self, factory: F) -> anyhow::Result<RegistrationHandle>
    where
        F: FnOnce(ProviderNotifiers) -> Fut,
        Fut: Future<Output = anyhow::Result<ProviderRegistration>>,
    {
        let provider_id = Arc::new(OnceLock::new());
        let notifiers = ProviderNotifiers {
            provider_id: provider_id.clone(),
            change_tx: self.change_tx.clone(),
            task_tx: self.task_tx.clone(),
        };

        let ProviderRegistration { provider, cleanup } = factory(notifiers).await?;
        let id = provider.id().to_string();
        if id.is_empty() || id.contains(':') {
            cleanup.into_iter().for_each(Cleanup::release);
            anyhow::bail!("invalid provider id {id:?}: must be non-empty and contain no ':'");
        }
        let _ = provider_id.set(id.clone());

        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.entries.iter().position(|e| e.provider.id() == id) {
            let old = inner.entries.remove(pos);
            old.cleanup.into_iter().for_each(Cleanup::release);
            info!(provider = %id, "replacing existing provider");
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(ProviderEntry {
            seq,
            provider,
            cleanup,
        });
        info!(provider = %id, "provider registered");
        let _ = self.change_tx.send(());

        Ok(RegistrationHandle {
            registry: self.clone(),
            provider_id: id,
            seq,
        })
    }

    pub async fn provider_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .map(|e| e.provider.id().to_string())
            .collect()
    }

    /// Swap in new per-provider settings and tell subscribers slots may differ.
    pub async fn set_providers_config(&self, config: ProvidersConfig) {
        let mut inner = self.inner.lock().await;
        inner.config = config;
        let _ = self.change_tx.send(());
    }

    /// Slots of every enabled, active provider, ordered by configured
    /// `order` (unset sorts last, ties keep registration order), each
    /// provider truncated to its `max_slots`, ids rewritten to
    /// `windowId:providerId:localId`.
    pub async fn get_aggregated_slots(&self, window_id: &str) -> Vec<Slot> {
        let inner = self.inner.lock().await;

        let mut ordered: Vec<&ProviderEntry> = inner.entries.iter().collect();
        ordered.sort_by_key(|e| {
            inner
                .config
                .get(e.provider.id())
                .and_then(|c| c.order)
                .unwrap_or(i64::MAX)
        });

        let mut seen = HashSet::new();
        let mut aggregated = Vec::new();
        for entry in ordered {
            let provider_id = entry.provider.id();
            let settings = inner.config.get(provider_id);
            if settings.and_then(|c| c.enabled) == Some(false) {
                continue;
            }
            if !entry.provider.is_active() {
                continue;
            }
            let limit = settings.and_then(|c| c.max_slots).unwrap_or(usize::MAX);
            for slot in entry.provider.slots().into_iter().take(limit) {
                let id = composite_id(window_id, provider_id, &slot.id);
                if !seen.insert(id.clone()) {
                    debug!(slot = %id, "dropping duplicate slot id");
                    continue;
                }
                aggregated.push(Slot { id, ..slot });
            }
        }
        aggregated
    }

    async fn find(&self, provider_id: &str) -> Result<Arc<dyn SlotProvider>, CommandError> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.provider.id() == provider_id)
            .map(|e| e.provider.clone())
            .ok_or_else(|| CommandError::UnknownProvider(provider_id.to_string()))
    }

    /// Run the slot named by a composite id. The window segment is not
    /// checked here; routing to the right window is the caller's job.
    pub async fn run_command(&self, slot_data_id: &str) -> RunResult {
        let addr = match SlotAddress::parse(slot_data_id) {
            Ok(addr) => addr,
            Err(e) => return e.into(),
        };
        match self.find(addr.provider_id).await {
            Ok(provider) => provider.run(addr.local_id).await,
            Err(e) => e.into(),
        }
    }

    pub async fn cancel_command(&self, slot_data_id: &str) -> CancelResult {
        let addr = match SlotAddress::parse(slot_data_id) {
            Ok(addr) => addr,
            Err(e) => return e.into(),
        };
        let provider = match self.find(addr.provider_id).await {
            Ok(provider) => provider,
            Err(e) => return e.into(),
        };
        provider
            .cancel(addr.local_id)
            .await
            .unwrap_or_else(|| CommandError::CancelUnsupported.into())
    }
}
