use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::config::Credential;
use crate::protocol::{ClientCommand, DeviceMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the device socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Authenticated,
    Closed,
}

#[derive(Debug)]
pub enum NetEvent {
    Opened,
    Authenticated,
    AuthFailed,
    /// PCM16 frame received while authenticated.
    Binary(Bytes),
    Closed { reconnect_in: Duration },
}

#[derive(Debug)]
pub enum NetCommand {
    Send(ClientCommand),
    SendAudio(Bytes),
    /// Close the socket and stop reconnecting.
    Close,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub url: String,
    pub credential: Credential,
    pub reconnect_delay: Duration,
    pub keepalive: Duration,
}

/// Cloneable view of the link shared by the session controller and the poller.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<NetCommand>,
    state: watch::Receiver<LinkState>,
}

impl ConnectionHandle {
    pub fn new(cmd_tx: mpsc::Sender<NetCommand>, state: watch::Receiver<LinkState>) -> Self {
        Self { cmd_tx, state }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// The one readiness check every sender consults.
    pub fn is_ready_to_send(&self) -> bool {
        self.state() == LinkState::Authenticated
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Queue a control command. Returns false when not ready or the link is gone.
    pub async fn send_command(&self, cmd: ClientCommand) -> bool {
        if !self.is_ready_to_send() {
            log::warn!("Cannot send command: not connected");
            return false;
        }
        self.cmd_tx.send(NetCommand::Send(cmd)).await.is_ok()
    }

    pub async fn send_audio(&self, pcm: Bytes) -> bool {
        if !self.is_ready_to_send() {
            return false;
        }
        self.cmd_tx.send(NetCommand::SendAudio(pcm)).await.is_ok()
    }

    /// Close the socket for good; no reconnect follows.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(NetCommand::Close).await;
    }
}

enum LoopExit {
    Closed,
    Shutdown,
}

pub struct NetLink {
    config: LinkConfig,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
    state: watch::Sender<LinkState>,
}

impl NetLink {
    pub fn new(config: LinkConfig, tx: mpsc::Sender<NetEvent>) -> (Self, ConnectionHandle) {
        let (cmd_tx, rx_cmd) = mpsc::channel(256);
        let (state, state_rx) = watch::channel(LinkState::Closed);
        let link = Self {
            config,
            tx,
            rx_cmd,
            state,
        };
        (link, ConnectionHandle::new(cmd_tx, state_rx))
    }

    // 连接断开后固定延迟重连，直到收到 Close 或句柄全部释放
    pub async fn run(mut self) {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let exit = match self.connect_and_loop().await {
                Ok(exit) => exit,
                Err(e) => {
                    log::warn!("Connection error (attempt {}): {}", attempt, e);
                    LoopExit::Closed
                }
            };
            self.set_state(LinkState::Closed);

            if let LoopExit::Shutdown = exit {
                log::info!("Link shut down");
                break;
            }

            let delay = self.config.reconnect_delay;
            log::info!("Disconnected. Reconnecting in {:?}...", delay);
            if self.tx.send(NetEvent::Closed { reconnect_in: delay }).await.is_err() {
                break;
            }
            if !self.wait_reconnect().await {
                log::info!("Link shut down during reconnect delay");
                break;
            }
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    fn is_authenticated(&self) -> bool {
        *self.state.borrow() == LinkState::Authenticated
    }

    /// Sleep out the reconnect delay. Returns false if asked to shut down meanwhile.
    async fn wait_reconnect(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.rx_cmd.recv() => match cmd {
                    None | Some(NetCommand::Close) => return false,
                    Some(other) => log::debug!("Dropping {:?} while disconnected", other),
                }
            }
        }
    }

    // 进入连接和主循环，处理WebSocket消息和发送命令
    async fn connect_and_loop(&mut self) -> anyhow::Result<LoopExit> {
        self.set_state(LinkState::Connecting);
        let url = Url::parse(&self.config.url)?;
        log::info!("Connecting to {}...", url);

        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()));
        tokio::pin!(connect);
        let (ws_stream, _) = loop {
            tokio::select! {
                res = &mut connect => break res??,
                cmd = self.rx_cmd.recv() => match cmd {
                    None | Some(NetCommand::Close) => return Ok(LoopExit::Shutdown),
                    Some(other) => log::debug!("Dropping {:?} while connecting", other),
                }
            }
        };

        let (mut write, mut read) = ws_stream.split();
        self.set_state(LinkState::Open);
        log::info!("Connected to {}", url);
        if self.tx.send(NetEvent::Opened).await.is_err() {
            return Ok(LoopExit::Shutdown);
        }

        // 打开后立即发送一次认证
        let auth = ClientCommand::Auth {
            key: self.config.credential.clone(),
        };
        write.send(Message::Text(auth.to_json()?.into())).await?;

        let period = self.config.keepalive.max(Duration::from_secs(1));
        let mut keepalive = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match DeviceMessage::parse(text.as_str()) {
                                Ok(DeviceMessage::AuthSuccess) => {
                                    log::info!("Authentication successful");
                                    self.set_state(LinkState::Authenticated);
                                    if self.tx.send(NetEvent::Authenticated).await.is_err() {
                                        return Ok(LoopExit::Shutdown);
                                    }
                                }
                                Ok(DeviceMessage::AuthFailed) => {
                                    log::error!("Authentication failed");
                                    if self.tx.send(NetEvent::AuthFailed).await.is_err() {
                                        return Ok(LoopExit::Shutdown);
                                    }
                                    let _ = write.send(Message::Close(None)).await;
                                    return Ok(LoopExit::Closed);
                                }
                                Ok(DeviceMessage::AuthRequired) => {
                                    log::debug!("Device requested auth; key already sent for this attempt");
                                }
                                Ok(DeviceMessage::Other(kind)) => {
                                    log::debug!("Ignoring device message type '{}'", kind);
                                }
                                Err(e) => {
                                    log::warn!("Received invalid JSON: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if self.is_authenticated() {
                                if self.tx.send(NetEvent::Binary(data)).await.is_err() {
                                    return Ok(LoopExit::Shutdown);
                                }
                            } else {
                                log::debug!("Dropping {} audio bytes before authentication", data.len());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Device closed connection: {:?}", frame);
                            return Ok(LoopExit::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(LoopExit::Closed),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::Send(cmd)) => {
                            if self.is_authenticated() {
                                let text = cmd.to_json()?;
                                log::debug!("Sent command: {}", text);
                                write.send(Message::Text(text.into())).await?;
                            } else {
                                log::warn!("Cannot send {:?}: not authenticated", cmd);
                            }
                        }
                        Some(NetCommand::SendAudio(pcm)) => {
                            if self.is_authenticated() {
                                write.send(Message::Binary(pcm)).await?;
                            }
                        }
                        Some(NetCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(LoopExit::Shutdown);
                        }
                    }
                }
                _ = keepalive.tick() => {
                    write.send(Message::Ping(Bytes::new())).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_readiness_follows_state() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(LinkState::Open);
        let handle = ConnectionHandle::new(cmd_tx, state_rx);

        assert!(!handle.is_ready_to_send());
        state_tx.send_replace(LinkState::Authenticated);
        assert!(handle.is_ready_to_send());
        state_tx.send_replace(LinkState::Closed);
        assert!(!handle.is_ready_to_send());
    }

    #[tokio::test]
    async fn test_handle_refuses_commands_when_not_ready() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (_state_tx, state_rx) = watch::channel(LinkState::Open);
        let handle = ConnectionHandle::new(cmd_tx, state_rx);

        assert!(!handle.send_command(ClientCommand::Doorbell).await);
        assert!(!handle.send_audio(Bytes::from_static(&[0, 0])).await);
        assert!(cmd_rx.try_recv().is_err());
    }
}
