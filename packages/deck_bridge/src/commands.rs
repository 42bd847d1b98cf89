//! Built-in provider that exposes shell commands from `[commands.<id>]` as
//! slots. Each run spawns `sh -c <run>`; cancel kills the child.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CommandFileConfig;
use crate::protocol::{CancelResult, RunResult, Slot, SlotStatus, TaskResult};
use crate::registry::{Cleanup, ProviderNotifiers, ProviderRegistration, SlotProvider};

pub const PROVIDER_ID: &str = "commands";

pub struct CommandsProvider {
    commands: BTreeMap<String, CommandFileConfig>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    /// Parent of every per-run token; cancelled when the provider is released.
    root: CancellationToken,
    notifiers: ProviderNotifiers,
}

impl CommandsProvider {
    /// Factory body for [`crate::registry::ProviderRegistry::register`].
    pub fn registration(
        commands: BTreeMap<String, CommandFileConfig>,
        notifiers: ProviderNotifiers,
    ) -> ProviderRegistration {
        let root = CancellationToken::new();
        let provider = Self {
            commands,
            running: Arc::new(Mutex::new(HashMap::new())),
            root: root.clone(),
            notifiers,
        };
        ProviderRegistration::new(Arc::new(provider)).with_cleanup(Cleanup::cancel_token(root))
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shell(run: &str) -> tokio::process::Command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(run)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SlotProvider for CommandsProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn is_active(&self) -> bool {
        !self.commands.is_empty()
    }

    fn slots(&self) -> Vec<Slot> {
        let running = self.running();
        self.commands
            .iter()
            .map(|(id, command)| {
                let is_running = running.contains_key(id);
                Slot {
                    id: id.clone(),
                    svg: render_svg(command.label.as_deref().unwrap_or(id), is_running),
                    status: if is_running {
                        SlotStatus::Running
                    } else {
                        SlotStatus::Idle
                    },
                }
            })
            .collect()
    }

    async fn run(&self, local_id: &str) -> RunResult {
        let Some(command) = self.commands.get(local_id) else {
            return RunResult::failed(format!("Unknown command: {local_id}"));
        };
        // One guard across check, spawn and insert so two runs cannot both start.
        let (mut child, token) = {
            let mut running = self.running();
            if running.contains_key(local_id) {
                return RunResult::failed("Command is already running");
            }

            let mut cmd = Self::shell(&command.run);
            if let Some(cwd) = &command.cwd {
                cmd.current_dir(cwd);
            }
            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(command = local_id, error = %e, "failed to spawn command");
                    return RunResult::failed(format!("Failed to start command: {e}"));
                }
            };

            let token = self.root.child_token();
            running.insert(local_id.to_string(), token.clone());
            (child, token)
        };
        self.notifiers.notify_change();
        info!(command = local_id, "command started");

        let task_id = local_id.to_string();
        let local_id = task_id.clone();
        let running = self.running.clone();
        let notifiers = self.notifiers.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => TaskResult::Success,
                    Ok(_) => TaskResult::Error,
                    Err(e) => {
                        warn!(command = %local_id, error = %e, "failed to wait for command");
                        TaskResult::Error
                    }
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(command = %local_id, error = %e, "failed to kill command");
                    }
                    TaskResult::Canceled
                }
            };
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&local_id);
            info!(command = %local_id, ?result, "command finished");
            notifiers.notify_task_complete(&local_id, result);
            notifiers.notify_change();
        });

        RunResult::started(task_id)
    }

    async fn cancel(&self, local_id: &str) -> Option<CancelResult> {
        let result = match self.running().get(local_id) {
            Some(token) => {
                token.cancel();
                CancelResult::ok()
            }
            None => CancelResult::failed("Command is not running"),
        };
        Some(result)
    }
}

/// A plain labelled tile as an SVG data URI.
fn render_svg(label: &str, running: bool) -> String {
    let fill = if running { "#2f7d32" } else { "#303030" };
    let label = label
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="144" height="144"><rect width="144" height="144" fill="{fill}"/><text x="72" y="80" font-size="20" fill="#ffffff" text-anchor="middle">{label}</text></svg>"##
    );
    format!("data:image/svg+xml,{}", svg.replace('#', "%23"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvidersConfig;
    use crate::registry::ProviderRegistry;
    use std::sync::OnceLock;
    use std::time::Duration;

    fn commands(entries: &[(&str, &str)]) -> BTreeMap<String, CommandFileConfig> {
        entries
            .iter()
            .map(|(id, run)| {
                (
                    id.to_string(),
                    CommandFileConfig {
                        run: run.to_string(),
                        label: None,
                        cwd: None,
                    },
                )
            })
            .collect()
    }

    async fn registry_with(entries: &[(&str, &str)]) -> ProviderRegistry {
        let registry = ProviderRegistry::new(ProvidersConfig::new());
        let commands = commands(entries);
        registry
            .register(|n| async move { Ok(CommandsProvider::registration(commands, n)) })
            .await
            .unwrap();
        registry
    }

    #[test]
    fn svg_escapes_label() {
        let svg = render_svg("a<b>&\"c\"", false);
        assert!(svg.starts_with("data:image/svg+xml,"));
        assert!(svg.contains("a&lt;b&gt;&amp;&quot;c&quot;"));
        assert!(!svg.contains('#'));
    }

    #[tokio::test]
    async fn lists_configured_commands_in_key_order() {
        let registry = registry_with(&[("test", "true"), ("build", "true")]).await;
        let slots = registry.get_aggregated_slots("w1").await;
        let ids: Vec<&str> = slots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["w1:commands:build", "w1:commands:test"]);
        assert!(slots.iter().all(|s| s.status == SlotStatus::Idle));
    }

    #[tokio::test]
    async fn unknown_command_fails() {
        let registry = registry_with(&[("build", "true")]).await;
        let result = registry.run_command("w1:commands:deploy").await;
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("Unknown command: deploy"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_reports_exit_status() {
        let registry = registry_with(&[("ok", "true"), ("bad", "exit 3")]).await;
        let mut tasks = registry.subscribe_task_complete();

        assert!(registry.run_command("w1:commands:ok").await.success);
        let event = tokio::time::timeout(Duration::from_secs(5), tasks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.slot_id, "commands:ok");
        assert_eq!(event.result, TaskResult::Success);

        assert!(registry.run_command("w1:commands:bad").await.success);
        let event = tokio::time::timeout(Duration::from_secs(5), tasks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.result, TaskResult::Error);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_start_only_once() {
        let provider: Arc<OnceLock<Arc<dyn SlotProvider>>> = Arc::new(OnceLock::new());
        let captured = provider.clone();
        let registry = ProviderRegistry::new(ProvidersConfig::new());
        let entries = commands(&[("sleep", "sleep 30")]);
        registry
            .register(|n| async move {
                let registration = CommandsProvider::registration(entries, n);
                let _ = captured.set(registration.provider.clone());
                Ok(registration)
            })
            .await
            .unwrap();
        let provider = provider.get().unwrap().clone();

        let runs: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.run("sleep").await })
            })
            .collect();
        let mut started = 0;
        for run in runs {
            if run.await.unwrap().success {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        assert!(provider.cancel("sleep").await.unwrap().success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_running_command() {
        let registry = registry_with(&[("sleep", "sleep 30")]).await;
        let mut tasks = registry.subscribe_task_complete();

        let run = registry.run_command("w1:commands:sleep").await;
        assert_eq!(run.task_id.as_deref(), Some("sleep"));
        let slots = registry.get_aggregated_slots("w1").await;
        assert_eq!(slots[0].status, SlotStatus::Running);

        let again = registry.run_command("w1:commands:sleep").await;
        assert!(!again.success);

        assert!(registry.cancel_command("w1:commands:sleep").await.success);
        let event = tokio::time::timeout(Duration::from_secs(5), tasks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.result, TaskResult::Canceled);

        let cancel = registry.cancel_command("w1:commands:sleep").await;
        assert_eq!(cancel.message.as_deref(), Some("Command is not running"));
    }
}
