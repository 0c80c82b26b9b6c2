use crate::config::Config;
use crate::protocol::{ClientCommand, GainTarget, SessionMode};
use crate::session::StateEvent;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

/// UI → core command, one JSON object per datagram: `{"action": ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UiCommand {
    RequestMode { mode: SessionMode },
    Stop,
    SetGain { target: GainTarget, value: f32 },
    Doorbell,
    StartAlarm,
    StopAlarm,
    SetField { index: u32, icon: String, text: String },
    ClearField { index: u32 },
}

impl UiCommand {
    /// Device command for fire-and-forget actions; `None` for session control.
    pub fn device_command(&self) -> Option<ClientCommand> {
        match self {
            UiCommand::RequestMode { .. } | UiCommand::Stop | UiCommand::SetGain { .. } => None,
            UiCommand::Doorbell => Some(ClientCommand::Doorbell),
            UiCommand::StartAlarm => Some(ClientCommand::StartAlarm),
            UiCommand::StopAlarm => Some(ClientCommand::StopAlarm),
            UiCommand::SetField { index, icon, text } => Some(ClientCommand::SetField {
                index: *index,
                icon: icon.clone(),
                text: text.clone(),
            }),
            UiCommand::ClearField { index } => Some(ClientCommand::ClearField { index: *index }),
        }
    }
}

#[derive(Debug)]
pub enum UiEvent {
    Command(UiCommand),
}

pub struct UiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::Sender<UiEvent>,
    buffer_size: usize,
}

// UI进程和核心进程通过本地UDP通信，端口在配置中指定
impl UiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<UiEvent>) -> anyhow::Result<Self> {
        Self::bind(
            &format!("{}:{}", config.ui_local_ip, config.ui_local_port),
            format!("{}:{}", config.ui_remote_ip, config.ui_remote_port),
            config.ui_buffer_size,
            tx,
        )
        .await
    }

    pub async fn bind(
        local_addr: &str,
        target_addr: String,
        buffer_size: usize,
        tx: mpsc::Sender<UiEvent>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
            buffer_size,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let cmd = match serde_json::from_slice::<UiCommand>(&buf[..len]) {
                Ok(cmd) => cmd,
                Err(e) => {
                    log::warn!("Ignoring malformed UI command: {}", e);
                    continue;
                }
            };
            if self.tx.send(UiEvent::Command(cmd)).await.is_err() {
                log::info!("UI event receiver closed");
                break;
            }
        }
        Ok(())
    }

    pub async fn send_event(&self, event: &StateEvent) -> anyhow::Result<()> {
        let msg = serde_json::to_vec(event)?;
        self.socket.send_to(&msg, &self.target_addr).await?;
        Ok(())
    }

    /// 把会话状态事件转发给UI进程，直到发送端全部关闭
    pub async fn forward(&self, mut events: broadcast::Receiver<StateEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.send_event(&event).await {
                        log::warn!("Failed to send to UI: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("UI forwarder skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn parse(text: &str) -> UiCommand {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_parse_session_commands() {
        assert_eq!(
            parse(r#"{"action":"request_mode","mode":"full_duplex"}"#),
            UiCommand::RequestMode { mode: SessionMode::FullDuplex }
        );
        assert_eq!(parse(r#"{"action":"stop"}"#), UiCommand::Stop);
        assert_eq!(
            parse(r#"{"action":"set_gain","target":"speaker","value":2.0}"#),
            UiCommand::SetGain { target: GainTarget::Speaker, value: 2.0 }
        );
        assert!(serde_json::from_str::<UiCommand>(r#"{"action":"reboot"}"#).is_err());
    }

    #[test]
    fn test_device_command_mapping() {
        assert_eq!(parse(r#"{"action":"doorbell"}"#).device_command(), Some(ClientCommand::Doorbell));
        assert_eq!(
            parse(r#"{"action":"set_field","index":1,"icon":"mdi:home","text":"Away"}"#).device_command(),
            Some(ClientCommand::SetField { index: 1, icon: "mdi:home".into(), text: "Away".into() })
        );
        assert_eq!(
            parse(r#"{"action":"clear_field","index":3}"#).device_command(),
            Some(ClientCommand::ClearField { index: 3 })
        );
        assert_eq!(parse(r#"{"action":"stop"}"#).device_command(), None);
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let bridge = Arc::new(
            UiBridge::bind("127.0.0.1:0", peer.local_addr().unwrap().to_string(), 1024, tx)
                .await
                .unwrap(),
        );
        let addr = bridge.local_addr().unwrap();
        let runner = bridge.clone();
        tokio::spawn(async move { runner.run().await });

        peer.send_to(b"garbage", addr).await.unwrap();
        peer.send_to(br#"{"action":"request_mode","mode":"listen"}"#, addr).await.unwrap();
        let UiEvent::Command(cmd) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd, UiCommand::RequestMode { mode: SessionMode::Listen });

        bridge
            .send_event(&StateEvent::Notice { text: "Not connected".into(), ttl_ms: 5000 })
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value, json!({"type": "notice", "text": "Not connected", "ttl_ms": 5000}));
    }
}
