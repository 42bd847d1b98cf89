use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::ProviderRegistry;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [server]
//                    port = 52400
//
//   env var:         DECK_SERVER__PORT=52400   (double underscore = nesting)
//
//   per provider:    [providers.npm-scripts]
//                    order = 0
//                    max_slots = 4

pub const DEFAULT_PORT: u16 = 52375;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub election: ElectionFileConfig,
    /// Per-provider display settings, keyed by provider id.
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Commands exposed by the built-in `commands` provider, keyed by local id.
    #[serde(default)]
    pub commands: BTreeMap<String, CommandFileConfig>,
}

/// Lives under `[server]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Election and RPC timing (lives under `[election]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectionFileConfig {
    #[serde(default = "default_follower_connect_timeout_ms")]
    pub follower_connect_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_reelection_jitter_ms")]
    pub reelection_jitter_ms: u64,
    #[serde(default = "default_reelection_retry_ms")]
    pub reelection_retry_ms: u64,
}

impl Default for ElectionFileConfig {
    fn default() -> Self {
        Self {
            follower_connect_timeout_ms: default_follower_connect_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            reelection_jitter_ms: default_reelection_jitter_ms(),
            reelection_retry_ms: default_reelection_retry_ms(),
        }
    }
}

/// Display settings for one provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// `Some(false)` hides the provider; anything else shows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Lower sorts first. Providers without an order sort last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slots: Option<usize>,
}

pub type ProvidersConfig = BTreeMap<String, ProviderConfig>;

/// A shell command exposed as a slot by the binary's `commands` provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandFileConfig {
    pub run: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_follower_connect_timeout_ms() -> u64 {
    100
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_reelection_jitter_ms() -> u64 {
    500
}
fn default_reelection_retry_ms() -> u64 {
    200
}

/// Build a figment that layers: defaults → config.toml → DECK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DECK_SERVER__PORT=52400`  →  `server.port = 52400`
///   `DECK_ELECTION__RPC_TIMEOUT_MS=2000`  →  `election.rpc_timeout_ms = 2000`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("DECK_").split("__"))
}

/// Re-read `[providers]` from the config directory and apply it to a live
/// registry, which tells subscribers the slot list may have changed.
pub async fn reload_providers(config_dir: &Path, registry: &ProviderRegistry) -> Result<()> {
    let fc: FileConfig = load_config(config_dir)
        .extract()
        .with_context(|| format!("Failed to reload config from {}", config_dir.display()))?;
    registry.set_providers_config(fc.providers).await;
    Ok(())
}

/// `<platform config dir>/deck-bridge`, e.g. `~/.config/deck-bridge`.
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("deck-bridge"))
        .context("Could not determine the user config directory")
}

// =============================================================================
// Runtime config (derived from FileConfig, used by the election and servers)
// =============================================================================

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Shared loopback port; whoever binds it is the leader.
    pub port: u16,
    /// How long a follower waits for the leader to ack `register`.
    pub follower_connect_timeout: Duration,
    /// How long the leader waits for a follower to answer an RPC.
    pub rpc_timeout: Duration,
    /// Upper bound of the random delay before re-election starts.
    pub reelection_jitter: Duration,
    /// Pause between failed re-election rounds.
    pub reelection_retry: Duration,
}

impl BridgeConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            port: fc.server.port,
            follower_connect_timeout: Duration::from_millis(
                fc.election.follower_connect_timeout_ms,
            ),
            rpc_timeout: Duration::from_millis(fc.election.rpc_timeout_ms),
            reelection_jitter: Duration::from_millis(fc.election.reelection_jitter_ms),
            reelection_retry: Duration::from_millis(fc.election.reelection_retry_ms),
        }
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{StaticProvider, register_static};

    #[test]
    fn test_election_defaults() {
        let c = BridgeConfig::default();
        assert_eq!(c.port, 52375);
        assert_eq!(c.follower_connect_timeout, Duration::from_millis(100));
        assert_eq!(c.rpc_timeout, Duration::from_secs(5));
        assert_eq!(c.reelection_jitter, Duration::from_millis(500));
        assert_eq!(c.reelection_retry, Duration::from_millis(200));
    }

    #[test]
    fn test_with_port_keeps_timings() {
        let c = BridgeConfig::with_port(40000);
        assert_eq!(c.port, 40000);
        assert_eq!(c.rpc_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, DEFAULT_PORT);
        assert!(fc.providers.is_empty());
        assert!(fc.commands.is_empty());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            r#"
[server]
port = 52400

[election]
rpc_timeout_ms = 1500

[providers.buildProvider]
order = 1

[providers.lintProvider]
order = 0
max_slots = 1

[providers.hidden]
enabled = false

[commands.test]
run = "cargo test"
label = "Test"
"#,
        )
        .unwrap();

        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, 52400);
        assert_eq!(fc.election.rpc_timeout_ms, 1500);
        assert_eq!(fc.election.follower_connect_timeout_ms, 100);
        assert_eq!(fc.providers["buildProvider"].order, Some(1));
        assert_eq!(fc.providers["lintProvider"].max_slots, Some(1));
        assert_eq!(fc.providers["hidden"].enabled, Some(false));
        assert_eq!(fc.commands["test"].run, "cargo test");
        assert_eq!(fc.commands["test"].label.as_deref(), Some("Test"));

        let rc = BridgeConfig::from_file(&fc);
        assert_eq!(rc.port, 52400);
        assert_eq!(rc.rpc_timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_reload_providers_applies_edits_and_fires_change() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::new(ProvidersConfig::new());
        register_static(&registry, StaticProvider::new("npm", &["build"])).await;
        let mut changes = registry.subscribe_changes();
        assert_eq!(registry.get_aggregated_slots("w1").await.len(), 1);

        std::fs::write(
            tmp.path().join("config.toml"),
            "[providers.npm]\nenabled = false\n",
        )
        .unwrap();
        reload_providers(tmp.path(), &registry).await.unwrap();

        assert!(changes.try_recv().is_ok());
        assert!(registry.get_aggregated_slots("w1").await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_providers_rejects_bad_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "[providers.npm\n").unwrap();
        let registry = ProviderRegistry::new(ProvidersConfig::new());
        assert!(reload_providers(tmp.path(), &registry).await.is_err());
    }
}
