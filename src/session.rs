//! Session state machine.
//!
//! Owns the active streaming mode and everything that must change with it:
//! microphone capture, playback scheduling, and the start/stop control
//! messages. All inputs (UI commands, link events, capture frames, status
//! snapshots) are handled here one at a time on the main event loop, so no
//! handler ever sees a half-updated `Session`.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::audio::{CaptureFrame, CapturePipeline, MicrophoneError, PlaybackScheduler};
use crate::net_link::{ConnectionHandle, LinkState, NetEvent};
use crate::poller::RemoteDeviceState;
use crate::protocol::{ClientCommand, GainTarget, SessionMode};

const AUTH_FAILED_NOTICE: &str = "Authentication failed - check secret key";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,
    /// Carries the configured busy label.
    #[error("{0}")]
    DeviceBusy(String),
    #[error(transparent)]
    Microphone(#[from] MicrophoneError),
}

/// Who put the session into its current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Started from this client.
    Local,
    /// Adopted from a status snapshot (another operator, or the device).
    Observed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Session {
    pub mode: SessionMode,
    pub capture_enabled: bool,
    pub playback_enabled: bool,
}

impl Session {
    pub fn idle() -> Self {
        Self::default()
    }

    fn started(mode: SessionMode) -> Self {
        Self {
            mode,
            capture_enabled: mode.uses_microphone(),
            playback_enabled: mode.uses_speaker(),
        }
    }

    /// Observed sessions never open the microphone: that needs local intent.
    fn observed(mode: SessionMode) -> Self {
        Self {
            mode,
            capture_enabled: false,
            playback_enabled: mode.uses_speaker(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.mode != SessionMode::Idle
    }
}

/// Snapshot pushed to the UI on every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub connection: LinkState,
    pub mode: SessionMode,
    pub capture: bool,
    pub playback: bool,
    pub busy: bool,
    pub can_start: bool,
    pub can_stop: bool,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    Status(SessionView),
    /// Transient user-facing message; the UI hides it after `ttl_ms`.
    Notice { text: String, ttl_ms: u64 },
    Levels { bars: Vec<f32> },
    Gains { mic: f32, speaker: f32 },
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub busy_label: String,
    pub notice_ttl_ms: u64,
}

pub struct SessionController {
    connection: ConnectionHandle,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    session: Session,
    origin: SessionOrigin,
    remote: Option<RemoteDeviceState>,
    // Mode stopped locally that a lagging poll may still report as streaming.
    suppressed: Option<SessionMode>,
    settings: SessionSettings,
    events: broadcast::Sender<StateEvent>,
}

impl SessionController {
    pub fn new(
        connection: ConnectionHandle,
        capture: CapturePipeline,
        playback: PlaybackScheduler,
        settings: SessionSettings,
        events: broadcast::Sender<StateEvent>,
    ) -> Self {
        Self {
            connection,
            capture,
            playback,
            session: Session::idle(),
            origin: SessionOrigin::Local,
            remote: None,
            suppressed: None,
            settings,
            events,
        }
    }

    pub fn session(&self) -> Session {
        self.session
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub fn busy(&self) -> bool {
        self.remote.map(|r| r.busy()).unwrap_or(false)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_capturing()
    }

    pub fn view(&self) -> SessionView {
        let connection = self.connection.state();
        let busy = self.busy();
        let active = self.session.is_active();
        let label = match connection {
            LinkState::Connecting | LinkState::Open => "Connecting".to_string(),
            LinkState::Closed => "Disconnected".to_string(),
            LinkState::Authenticated if busy => self.settings.busy_label.clone(),
            LinkState::Authenticated if active => {
                self.session.mode.to_string().replace('_', " ").to_uppercase()
            }
            LinkState::Authenticated => "Connected".to_string(),
        };

        SessionView {
            connection,
            mode: self.session.mode,
            capture: self.session.capture_enabled,
            playback: self.session.playback_enabled,
            busy,
            can_start: connection == LinkState::Authenticated && !busy && !active,
            can_stop: active,
            label,
        }
    }

    // ======================== UI commands ========================

    /// Enter `mode`. `Idle` is the same as `stop()`.
    pub async fn request_mode(&mut self, mode: SessionMode) -> Result<(), SessionError> {
        if mode == SessionMode::Idle {
            self.stop().await;
            return Ok(());
        }
        if let Err(e) = self.check_can_start() {
            self.notice(&e);
            return Err(e);
        }
        if self.session.mode == mode {
            return Ok(());
        }
        if self.session.is_active() {
            self.end_session(true).await;
        }

        if mode.uses_microphone() {
            if let Err(e) = self.capture.start().await {
                let err = SessionError::from(e);
                log::warn!("Cannot start {}: {}", mode, err);
                self.notice(&err);
                self.publish();
                return Err(err);
            }
        }

        self.session = Session::started(mode);
        self.origin = SessionOrigin::Local;
        self.suppressed = None;
        if self.session.playback_enabled {
            self.playback.start();
        }
        if let Some(cmd) = mode.start_command() {
            self.connection.send_command(cmd).await;
        }
        log::info!(
            "Session started: mode={}, capture={}, playback={}",
            mode,
            self.session.capture_enabled,
            self.session.playback_enabled
        );
        self.publish();
        Ok(())
    }

    /// End the active session, telling the device if the link is still up.
    pub async fn stop(&mut self) {
        if self.session.is_active() {
            self.suppressed = Some(self.session.mode);
        }
        self.end_session(true).await;
    }

    /// Commit a gain change. The value is clamped to the device range.
    pub async fn set_gain(&mut self, target: GainTarget, value: f32) -> Result<(), SessionError> {
        let value = target.clamp(value);
        self.send_action(ClientCommand::set_gain(target, value)).await
    }

    /// Fire-and-forget device commands (doorbell, alarm, marquee fields, gains).
    pub async fn send_action(&mut self, cmd: ClientCommand) -> Result<(), SessionError> {
        if !self.connection.is_ready_to_send() {
            let err = SessionError::NotConnected;
            self.notice(&err);
            return Err(err);
        }
        self.connection.send_command(cmd).await;
        Ok(())
    }

    /// Stop streaming, release the microphone and close the link for good.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.capture.stop();
        self.connection.close().await;
    }

    // ======================== Inputs from the loop ========================

    pub async fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Opened => self.publish(),
            NetEvent::Authenticated => self.publish(),
            NetEvent::AuthFailed => {
                self.emit(StateEvent::Notice {
                    text: AUTH_FAILED_NOTICE.to_string(),
                    ttl_ms: self.settings.notice_ttl_ms,
                });
                self.publish();
            }
            NetEvent::Binary(pcm) => self.handle_device_audio(&pcm),
            NetEvent::Closed { reconnect_in } => {
                log::info!("Link closed; session reset, reconnect in {:?}", reconnect_in);
                // The last busy state stays in force until a fresh snapshot replaces it.
                self.suppressed = None;
                self.end_session(false).await;
                self.publish();
            }
        }
    }

    pub async fn handle_capture_frame(&mut self, frame: CaptureFrame) {
        if !self.session.capture_enabled {
            return;
        }
        let Some(pcm) = self.capture.accept(frame) else {
            return;
        };
        if self.connection.is_ready_to_send() {
            self.connection.send_audio(pcm).await;
        }
    }

    /// Apply a status snapshot. Never sends anything to the device.
    pub async fn handle_snapshot(&mut self, snapshot: RemoteDeviceState) {
        // A poll that raced a disconnect describes a link that no longer exists.
        if !self.connection.is_ready_to_send() {
            log::debug!("Dropping status snapshot: link not authenticated");
            return;
        }
        self.remote = Some(snapshot);
        self.emit(StateEvent::Gains {
            mic: snapshot.mic_gain,
            speaker: snapshot.speaker_gain,
        });

        let observed = snapshot.active_mode();
        if self.suppressed.is_some_and(|m| m != observed) {
            self.suppressed = None;
        }

        if snapshot.busy() {
            if self.session.is_active() {
                log::info!("Device busy, stopping {} session", self.session.mode);
                self.end_session(false).await;
            }
        } else if !self.session.is_active() {
            if observed != SessionMode::Idle && self.suppressed != Some(observed) {
                self.adopt(observed);
            }
        } else if self.origin == SessionOrigin::Observed && observed != self.session.mode {
            self.end_session(false).await;
            if observed != SessionMode::Idle {
                self.adopt(observed);
            }
        }

        self.publish();
    }

    // ======================== Internals ========================

    fn check_can_start(&self) -> Result<(), SessionError> {
        if !self.connection.is_ready_to_send() {
            return Err(SessionError::NotConnected);
        }
        if self.busy() {
            return Err(SessionError::DeviceBusy(self.settings.busy_label.clone()));
        }
        Ok(())
    }

    fn adopt(&mut self, mode: SessionMode) {
        log::info!("Device already streaming {}, adopting", mode);
        self.session = Session::observed(mode);
        self.origin = SessionOrigin::Observed;
        if self.session.playback_enabled {
            self.playback.start();
        }
    }

    async fn end_session(&mut self, send_stop: bool) {
        if !self.session.is_active() {
            return;
        }
        let mode = self.session.mode;
        self.capture.stop();
        self.playback.stop();
        self.session = Session::idle();
        self.origin = SessionOrigin::Local;

        if send_stop && self.connection.is_ready_to_send() {
            if let Some(cmd) = mode.stop_command() {
                self.connection.send_command(cmd).await;
            }
        }
        log::info!("Session stopped: mode={}", mode);
        self.publish();
    }

    fn handle_device_audio(&mut self, pcm: &[u8]) {
        if !self.session.playback_enabled {
            return;
        }
        if let Some(buf) = self.playback.enqueue(pcm) {
            self.emit(StateEvent::Levels { bars: buf.levels });
        }
    }

    fn notice(&self, err: &SessionError) {
        self.emit(StateEvent::Notice {
            text: err.to_string(),
            ttl_ms: self.settings.notice_ttl_ms,
        });
    }

    fn publish(&self) {
        self.emit(StateEvent::Status(self.view()));
    }

    fn emit(&self, event: StateEvent) {
        // No subscribers is fine; the UI may not be attached yet.
        let _ = self.events.send(event);
    }
}
