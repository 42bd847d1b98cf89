//! Follower Client
//!
//! A window that lost the port race connects to the leader's `/ws/internal`,
//! registers its window id, and from then on:
//!
//! - forwards focus/blur and its registry's change and task-completion feeds
//! - answers the leader's `getSlots`/`run`/`cancel` against its own registry
//!
//! An unexpected close fires the disconnect callback once. [`FollowerClient::stop`]
//! closes without firing it.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::protocol::{FollowerMessage, LeaderMessage};
use crate::registry::ProviderRegistry;

enum Outbound {
    Frame(FollowerMessage),
    Close,
}

pub struct FollowerClient {
    window_id: String,
    out_tx: mpsc::Sender<Outbound>,
    /// Set by `stop` so the reader knows the close is ours.
    stopping: CancellationToken,
    writer: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl FollowerClient {
    /// Connect to the leader on `config.port` and register. Succeeds only once
    /// the leader acks within `config.follower_connect_timeout`.
    pub async fn connect<F>(
        window_id: impl Into<String>,
        registry: ProviderRegistry,
        config: &BridgeConfig,
        on_disconnect: F,
    ) -> Result<Self, BridgeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let window_id = window_id.into();
        let url = format!("ws://127.0.0.1:{}/ws/internal", config.port);

        let handshake = async {
            let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
            let (mut sink, mut stream) = ws.split();

            let register = FollowerMessage::Register {
                window_id: window_id.clone(),
            };
            let json = serde_json::to_string(&register)
                .map_err(|e| BridgeError::Protocol(e.to_string()))?;
            sink.send(Message::Text(json.into())).await?;

            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<LeaderMessage>(&text) {
                            Ok(LeaderMessage::Registered { .. }) => break,
                            Ok(other) => debug!(?other, "frame before registration ack"),
                            Err(e) => warn!(error = %e, "failed to parse leader message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(BridgeError::Protocol(
                            "leader closed the connection during registration".into(),
                        ));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                }
            }
            Ok::<_, BridgeError>((sink, stream))
        };

        let (mut sink, mut stream) =
            tokio::time::timeout(config.follower_connect_timeout, handshake)
                .await
                .map_err(|_| BridgeError::ConnectTimeout)??;
        info!(window_id = %window_id, port = config.port, "registered with leader");

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
        let stopping = CancellationToken::new();
        // Cancelled when the connection ends for any reason; stops the forwarders.
        let closed = CancellationToken::new();

        let writer = tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(message) => {
                        let Ok(json) = serde_json::to_string(&message) else {
                            continue;
                        };
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        let reader = {
            let window_id = window_id.clone();
            let registry = registry.clone();
            let out_tx = out_tx.clone();
            let stopping = stopping.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "leader socket error");
                            break;
                        }
                    };
                    match serde_json::from_str::<LeaderMessage>(&text) {
                        Ok(message) => {
                            handle_leader_message(message, &window_id, &registry, &out_tx).await
                        }
                        Err(e) => warn!(error = %e, "failed to parse leader message"),
                    }
                }

                closed.cancel();
                if stopping.is_cancelled() {
                    debug!(window_id = %window_id, "leader connection closed");
                } else {
                    warn!(window_id = %window_id, "lost connection to leader");
                    on_disconnect();
                }
            })
        };

        let changes = {
            let mut changes = registry.subscribe_changes();
            let window_id = window_id.clone();
            let out_tx = out_tx.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = closed.cancelled() => break,
                        event = changes.recv() => event,
                    };
                    match event {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            let change = FollowerMessage::Change {
                                window_id: window_id.clone(),
                            };
                            if out_tx.send(Outbound::Frame(change)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let tasks = {
            let mut tasks = registry.subscribe_task_complete();
            let window_id = window_id.clone();
            let out_tx = out_tx.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = closed.cancelled() => break,
                        event = tasks.recv() => event,
                    };
                    match event {
                        Ok(event) => {
                            let forward = FollowerMessage::TaskCompleteForward {
                                window_id: window_id.clone(),
                                slot_data_id: event.slot_id,
                                result: event.result,
                            };
                            if out_tx.send(Outbound::Frame(forward)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "task completion feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Ok(Self {
            window_id,
            out_tx,
            stopping,
            writer,
            background: vec![reader, changes, tasks],
        })
    }

    pub fn window_id(&self) -> &str {
        &self.window_id
    }

    async fn send(&self, message: FollowerMessage) {
        if self.out_tx.send(Outbound::Frame(message)).await.is_err() {
            debug!(window_id = %self.window_id, "leader connection already closed");
        }
    }

    pub async fn notify_focus(&self) {
        self.send(FollowerMessage::Focus {
            window_id: self.window_id.clone(),
        })
        .await
    }

    pub async fn notify_blur(&self) {
        self.send(FollowerMessage::Blur {
            window_id: self.window_id.clone(),
        })
        .await
    }

    /// Say goodbye and close. Never fires the disconnect callback.
    pub async fn stop(self) {
        info!(window_id = %self.window_id, "follower stopping");
        self.stopping.cancel();
        self.send(FollowerMessage::Disconnect {
            window_id: self.window_id.clone(),
        })
        .await;
        let _ = self.out_tx.send(Outbound::Close).await;

        let mut writer = self.writer;
        if tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        for task in self.background {
            task.abort();
        }
    }
}

async fn handle_leader_message(
    message: LeaderMessage,
    window_id: &str,
    registry: &ProviderRegistry,
    out_tx: &mpsc::Sender<Outbound>,
) {
    match message {
        LeaderMessage::GetSlots { request_id } => {
            let items = registry.get_aggregated_slots(window_id).await;
            debug!(request_id = %request_id, count = items.len(), "answering getSlots");
            let _ = out_tx
                .send(Outbound::Frame(FollowerMessage::SlotsResponse {
                    request_id,
                    items,
                }))
                .await;
        }
        // Run and cancel may take a while inside the provider; keep reading.
        LeaderMessage::Run {
            request_id,
            slot_data_id,
        } => {
            let registry = registry.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                debug!(request_id = %request_id, slot = %slot_data_id, "running for leader");
                let result = registry.run_command(&slot_data_id).await;
                let _ = out_tx
                    .send(Outbound::Frame(FollowerMessage::RunResponse {
                        request_id,
                        result,
                    }))
                    .await;
            });
        }
        LeaderMessage::Cancel {
            request_id,
            slot_data_id,
        } => {
            let registry = registry.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                debug!(request_id = %request_id, slot = %slot_data_id, "cancelling for leader");
                let result = registry.cancel_command(&slot_data_id).await;
                let _ = out_tx
                    .send(Outbound::Frame(FollowerMessage::CancelResponse {
                        request_id,
                        result,
                    }))
                    .await;
            });
        }
        LeaderMessage::Registered { .. } => {
            debug!("duplicate registration ack");
        }
    }
}
