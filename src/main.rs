use intercom_link::audio::{AlsaMicrophone, AlsaPlayback, CaptureFrame, CapturePipeline, PlaybackScheduler};
use intercom_link::config::Config;
use intercom_link::net_link::{LinkConfig, NetEvent, NetLink};
use intercom_link::poller::{HttpStatusSource, Poller, RemoteDeviceState};
use intercom_link::session::{SessionController, SessionSettings, StateEvent};
use intercom_link::ui_bridge::{UiBridge, UiCommand, UiEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!(
        "Intercom client for {} (status {})",
        config.ws_url(),
        config.status_url()
    );

    // 创建通道，用于组件间通信
    let (tx_net_event, mut rx_net_event) = mpsc::channel::<NetEvent>(100);
    let (tx_frames, mut rx_frames) = mpsc::channel::<CaptureFrame>(32);
    let (tx_snapshot, mut rx_snapshot) = mpsc::channel::<RemoteDeviceState>(8);
    let (tx_ui_event, mut rx_ui_event) = mpsc::channel::<UiEvent>(100);
    let (tx_state, _) = broadcast::channel::<StateEvent>(64);

    // 启动UI桥，优先启动以便显示连接状态
    let ui_bridge = Arc::new(UiBridge::new(&config, tx_ui_event).await?);
    let ui_runner = ui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = ui_runner.run().await {
            log::error!("UiBridge error: {}", e);
        }
    });
    let ui_forwarder = ui_bridge.clone();
    let state_rx = tx_state.subscribe();
    tokio::spawn(async move {
        ui_forwarder.forward(state_rx).await;
    });

    // 启动网络链接
    let (net_link, connection) = NetLink::new(
        LinkConfig {
            url: config.ws_url(),
            credential: config.secret_key.clone(),
            reconnect_delay: config.reconnect_delay,
            keepalive: config.keepalive,
        },
        tx_net_event,
    );
    let link_task = tokio::spawn(net_link.run());

    // 状态轮询，只在认证后运行
    let poller = Poller::new(
        HttpStatusSource::new(config.status_url())?,
        config.poll_interval,
        connection.subscribe(),
        tx_snapshot,
    );
    tokio::spawn(poller.run());

    // 音频设备
    let playback = AlsaPlayback::start(config.playback_device, config.playback_period_size)?;
    let capture = CapturePipeline::new(Box::new(AlsaMicrophone::new(config.capture_device)), tx_frames);

    let mut controller = SessionController::new(
        connection,
        capture,
        PlaybackScheduler::new(Box::new(playback)),
        SessionSettings {
            busy_label: config.busy_label.to_string(),
            notice_ttl_ms: config.notice_ttl_ms,
        },
        tx_state,
    );
    log::info!("Intercom core started");

    // 主事件循环：所有会话状态的修改都在这里串行完成
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            Some(event) = rx_net_event.recv() => {
                controller.handle_net_event(event).await;
            }
            Some(frame) = rx_frames.recv() => {
                controller.handle_capture_frame(frame).await;
            }
            Some(snapshot) = rx_snapshot.recv() => {
                controller.handle_snapshot(snapshot).await;
            }
            Some(UiEvent::Command(cmd)) = rx_ui_event.recv() => {
                log::debug!("UI command: {:?}", cmd);
                dispatch_ui_command(&mut controller, cmd).await;
            }
        }
    }

    controller.shutdown().await;
    // 等待链路发出关闭帧
    let _ = tokio::time::timeout(Duration::from_secs(2), link_task).await;
    Ok(())
}

// 错误已经以通知的形式推送给UI，这里只记录日志
async fn dispatch_ui_command(controller: &mut SessionController, cmd: UiCommand) {
    let result = match cmd {
        UiCommand::RequestMode { mode } => controller.request_mode(mode).await,
        UiCommand::Stop => {
            controller.stop().await;
            Ok(())
        }
        UiCommand::SetGain { target, value } => controller.set_gain(target, value).await,
        other => match other.device_command() {
            Some(device_cmd) => controller.send_action(device_cmd).await,
            None => Ok(()),
        },
    };
    if let Err(e) = result {
        log::warn!("UI command rejected: {}", e);
    }
}
