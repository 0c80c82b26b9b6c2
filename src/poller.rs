//! Best-effort polling of the device status endpoint.
//!
//! The socket stays authoritative for session transitions; the poller only
//! keeps the local view honest about what the device itself is doing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::net_link::LinkState;
use crate::protocol::{SessionMode, StatusResponse, StreamingFlags};

const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Last polled snapshot of the device. Replaced wholesale on every fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteDeviceState {
    pub streaming: StreamingFlags,
    pub alarm_active: bool,
    pub doorbell_playing: bool,
    pub mic_gain: f32,
    pub speaker_gain: f32,
}

impl RemoteDeviceState {
    /// Alarm or doorbell holds the device.
    pub fn busy(&self) -> bool {
        self.alarm_active || self.doorbell_playing
    }

    /// Mode the device reports it is streaming, if any.
    pub fn active_mode(&self) -> SessionMode {
        if self.streaming.full_duplex {
            SessionMode::FullDuplex
        } else if self.streaming.listen {
            SessionMode::Listen
        } else if self.streaming.speak {
            SessionMode::Speak
        } else {
            SessionMode::Idle
        }
    }
}

impl From<StatusResponse> for RemoteDeviceState {
    fn from(resp: StatusResponse) -> Self {
        Self {
            streaming: resp.streaming,
            alarm_active: resp.audio.alarm_active,
            doorbell_playing: resp.audio.doorbell_playing,
            mic_gain: resp.audio.mic_gain,
            speaker_gain: resp.audio.speaker_gain,
        }
    }
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<RemoteDeviceState>;
}

pub struct HttpStatusSource {
    client: Client,
    url: String,
}

impl HttpStatusSource {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self) -> anyhow::Result<RemoteDeviceState> {
        let resp = self.client.get(&self.url).send().await?.error_for_status()?;
        let status: StatusResponse = resp.json().await?;
        Ok(status.into())
    }
}

pub struct Poller<S> {
    source: S,
    period: Duration,
    link: watch::Receiver<LinkState>,
    tx: mpsc::Sender<RemoteDeviceState>,
}

impl<S: StatusSource> Poller<S> {
    pub fn new(
        source: S,
        period: Duration,
        link: watch::Receiver<LinkState>,
        tx: mpsc::Sender<RemoteDeviceState>,
    ) -> Self {
        Self {
            source,
            period,
            link,
            tx,
        }
    }

    /// Fetch right after each authentication, then every `period` while it lasts.
    /// Returns when the link or the snapshot receiver goes away.
    pub async fn run(mut self) {
        loop {
            if self
                .link
                .wait_for(|s| *s == LinkState::Authenticated)
                .await
                .is_err()
            {
                return;
            }

            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *self.link.borrow() != LinkState::Authenticated {
                            break;
                        }
                        match self.source.fetch().await {
                            Ok(snapshot) => {
                                // 请求期间链路可能已断开
                                if *self.link.borrow() != LinkState::Authenticated {
                                    log::debug!("Link dropped during status poll, discarding result");
                                    break;
                                }
                                if self.tx.send(snapshot).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::debug!("Status poll failed: {:#}", e),
                        }
                    }
                    changed = self.link.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *self.link.borrow() != LinkState::Authenticated {
                            break;
                        }
                    }
                }
            }
        }
    }
}
