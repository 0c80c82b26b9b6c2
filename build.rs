use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    device: Device,
    audio: Audio,
    session: Session,
    ui: Ui,
}

#[derive(Deserialize)]
struct Device {
    host: String,
    port: u16,
    use_ssl: bool,
    secret_key: String,
    ws_path: String,
    status_path: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    playback_period_size: usize,
}

#[derive(Deserialize)]
struct Session {
    busy_label: String,
    reconnect_delay_secs: u64,
    poll_interval_secs: u64,
    keepalive_secs: u64,
    notice_ttl_ms: u64,
}

#[derive(Deserialize)]
struct Ui {
    local_ip: String,
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
    buffer_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 设备连接
    println!("cargo:rustc-env=DEVICE_HOST={}", config.device.host);
    println!("cargo:rustc-env=DEVICE_PORT={}", config.device.port);
    println!("cargo:rustc-env=DEVICE_USE_SSL={}", config.device.use_ssl);
    println!("cargo:rustc-env=DEVICE_SECRET_KEY={}", config.device.secret_key);
    println!("cargo:rustc-env=DEVICE_WS_PATH={}", config.device.ws_path);
    println!("cargo:rustc-env=DEVICE_STATUS_PATH={}", config.device.status_path);

    // 音频设备
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);

    // 会话策略
    println!("cargo:rustc-env=SESSION_BUSY_LABEL={}", config.session.busy_label);
    println!("cargo:rustc-env=SESSION_RECONNECT_DELAY_SECS={}", config.session.reconnect_delay_secs);
    println!("cargo:rustc-env=SESSION_POLL_INTERVAL_SECS={}", config.session.poll_interval_secs);
    println!("cargo:rustc-env=SESSION_KEEPALIVE_SECS={}", config.session.keepalive_secs);
    println!("cargo:rustc-env=SESSION_NOTICE_TTL_MS={}", config.session.notice_ttl_ms);

    // UI 桥配置
    println!("cargo:rustc-env=UI_LOCAL_IP={}", config.ui.local_ip);
    println!("cargo:rustc-env=UI_LOCAL_PORT={}", config.ui.local_port);
    println!("cargo:rustc-env=UI_REMOTE_IP={}", config.ui.remote_ip);
    println!("cargo:rustc-env=UI_REMOTE_PORT={}", config.ui.remote_port);
    println!("cargo:rustc-env=UI_BUFFER_SIZE={}", config.ui.buffer_size);
}
