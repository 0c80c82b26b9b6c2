//! Loopback stand-in for the intercom device's audio socket.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use intercom_link::config::Credential;
use intercom_link::net_link::{LinkConfig, NetEvent};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

pub const AUTH_SUCCESS: &str = r#"{"type":"auth_success"}"#;
pub const AUTH_FAILED: &str = r#"{"type":"auth_failed"}"#;
pub const SECRET: &str = "s3cret";

/// What the fake device does on every connection.
#[derive(Clone, Default)]
pub struct DeviceScript {
    /// Sent right after the client's first message, before any auth reply.
    pub pre_auth: Vec<Message>,
    /// Reply to the auth message; `None` leaves the client waiting.
    pub reply: Option<&'static str>,
    pub post_auth: Vec<Message>,
    /// Close the socket once the script has been played.
    pub hang_up: bool,
    /// Only hang up on the first N connections; later ones stay open.
    pub hang_up_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Text(Value),
    Binary(Vec<u8>),
    Close,
}

pub struct FakeDevice {
    pub addr: SocketAddr,
    pub accepted: Arc<Mutex<Vec<Instant>>>,
    received: mpsc::UnboundedReceiver<(usize, Received)>,
}

impl FakeDevice {
    pub async fn spawn(script: DeviceScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let (tx, received) = mpsc::unbounded_channel();

        let accepted_log = accepted.clone();
        tokio::spawn(async move {
            let mut conn = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                accepted_log.lock().unwrap().push(Instant::now());
                tokio::spawn(serve(conn, ws, script.clone(), tx.clone()));
                conn += 1;
            }
        });

        Self {
            addr,
            accepted,
            received,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/audio_stream", self.addr)
    }

    pub async fn next(&mut self) -> (usize, Received) {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("device saw nothing")
            .expect("device task ended")
    }

    pub fn drain(&mut self) -> Vec<(usize, Received)> {
        let mut out = Vec::new();
        while let Ok(item) = self.received.try_recv() {
            out.push(item);
        }
        out
    }
}

async fn serve(
    conn: usize,
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    script: DeviceScript,
    tx: mpsc::UnboundedSender<(usize, Received)>,
) {
    let (mut write, mut read) = ws.split();
    let mut replied = false;

    while let Some(Ok(msg)) = read.next().await {
        let received = match msg {
            Message::Text(text) => Received::Text(serde_json::from_str(text.as_str()).unwrap()),
            Message::Binary(data) => Received::Binary(data.to_vec()),
            Message::Close(_) => Received::Close,
            _ => continue,
        };
        let closing = received == Received::Close;
        let _ = tx.send((conn, received));
        if closing {
            break;
        }

        if !replied {
            replied = true;
            for m in &script.pre_auth {
                let _ = write.send(m.clone()).await;
            }
            if let Some(reply) = script.reply {
                let _ = write.send(Message::text(reply)).await;
                for m in &script.post_auth {
                    let _ = write.send(m.clone()).await;
                }
            }
            if script.hang_up && script.hang_up_limit.map_or(true, |n| conn < n) {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

pub fn link_config(url: String, reconnect_delay: Duration) -> LinkConfig {
    LinkConfig {
        url,
        credential: Credential::new(SECRET),
        reconnect_delay,
        keepalive: Duration::from_secs(20),
    }
}

pub async fn next_event(rx: &mut mpsc::Receiver<NetEvent>) -> NetEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no link event")
        .expect("link task ended")
}
