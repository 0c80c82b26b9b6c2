use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Shared secret sent in the `auth` handshake.
///
/// `Debug` is redacted so the key never ends up in a log line.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Device address: host, port and whether the transport is TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    /// `port == 0` selects the scheme default (80 for ws, 443 for wss).
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        let port = match port {
            0 if secure => 443,
            0 => 80,
            p => p,
        };
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// `host` or `host:port`; the port is omitted only for TLS on 443.
    fn authority(&self) -> String {
        if self.secure && self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.authority(), path)
    }

    pub fn status_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority(), path)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // 设备连接
    pub endpoint: Endpoint,
    pub secret_key: Credential,
    pub ws_path: &'static str,
    pub status_path: &'static str,

    // 音频设备
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub playback_period_size: usize,

    // 会话策略
    pub busy_label: &'static str,
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
    pub keepalive: Duration,
    pub notice_ttl_ms: u64,

    // UI 桥配置
    pub ui_local_ip: &'static str,
    pub ui_local_port: u16,
    pub ui_remote_ip: &'static str,
    pub ui_remote_port: u16,
    pub ui_buffer_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let port: u16 = env!("DEVICE_PORT")
            .parse()
            .map_err(|_| "Failed to parse DEVICE_PORT")?;
        let use_ssl: bool = env!("DEVICE_USE_SSL")
            .parse()
            .map_err(|_| "Failed to parse DEVICE_USE_SSL")?;

        Ok(Self {
            endpoint: Endpoint::new(env!("DEVICE_HOST"), port, use_ssl),
            secret_key: Credential::new(env!("DEVICE_SECRET_KEY")),
            ws_path: env!("DEVICE_WS_PATH"),
            status_path: env!("DEVICE_STATUS_PATH"),

            capture_device: env!("AUDIO_CAPTURE_DEVICE"),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE"),
            playback_period_size: env!("AUDIO_PLAYBACK_PERIOD_SIZE")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_PLAYBACK_PERIOD_SIZE")?,

            busy_label: env!("SESSION_BUSY_LABEL"),
            reconnect_delay: Duration::from_secs(
                env!("SESSION_RECONNECT_DELAY_SECS")
                    .parse()
                    .map_err(|_| "Failed to parse SESSION_RECONNECT_DELAY_SECS")?,
            ),
            poll_interval: Duration::from_secs(
                env!("SESSION_POLL_INTERVAL_SECS")
                    .parse()
                    .map_err(|_| "Failed to parse SESSION_POLL_INTERVAL_SECS")?,
            ),
            keepalive: Duration::from_secs(
                env!("SESSION_KEEPALIVE_SECS")
                    .parse()
                    .map_err(|_| "Failed to parse SESSION_KEEPALIVE_SECS")?,
            ),
            notice_ttl_ms: env!("SESSION_NOTICE_TTL_MS")
                .parse()
                .map_err(|_| "Failed to parse SESSION_NOTICE_TTL_MS")?,

            ui_local_ip: env!("UI_LOCAL_IP"),
            ui_local_port: env!("UI_LOCAL_PORT")
                .parse()
                .map_err(|_| "Failed to parse UI_LOCAL_PORT")?,
            ui_remote_ip: env!("UI_REMOTE_IP"),
            ui_remote_port: env!("UI_REMOTE_PORT")
                .parse()
                .map_err(|_| "Failed to parse UI_REMOTE_PORT")?,
            ui_buffer_size: env!("UI_BUFFER_SIZE")
                .parse()
                .map_err(|_| "Failed to parse UI_BUFFER_SIZE")?,
        })
    }

    pub fn ws_url(&self) -> String {
        self.endpoint.ws_url(self.ws_path)
    }

    pub fn status_url(&self) -> String {
        self.endpoint.status_url(self.status_path)
    }
}
