use devaudio_linux_rs::audio::PlayerState;
use devaudio_linux_rs::config::Config;
use devaudio_linux_rs::control_bridge::ControlBridge;
use devaudio_linux_rs::service::AudioService;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    log::info!("{} {} starting", Config::app_name(), Config::app_version());

    let service = Arc::new(AudioService::from_config(&config));

    // 重启后接管上次仍在运行的播放器
    if let Some(state) = service.get_state().await.data {
        if state.state != PlayerState::Idle {
            log::info!("Resumed tracking of {:?} ({:?})", state.file_path, state.state);
        }
    }

    // 启动控制桥，与Web层通信
    let bridge = Arc::new(ControlBridge::new(&config, service.clone()).await?);
    log::info!("ControlBridge listening on {}", bridge.local_addr()?);

    tokio::select! {
        res = bridge.clone().run() => {
            if let Err(e) = res {
                log::error!("ControlBridge error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            // 播放器不随服务退出，下次启动时重新接管
            log::info!("Shutting down");
        }
    }

    for info in service.streams().data.unwrap_or_default() {
        service.cancel_stream(&info.device_id).await;
    }
    Ok(())
}
