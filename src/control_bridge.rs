use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::UdpSocket;

use crate::audio::{CaptureStream, Direction};
use crate::config::Config;
use crate::error::Reply;
use crate::service::AudioService;

/// One datagram, one request. `op` selects the operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListDevices {
        #[serde(default)]
        direction: Option<Direction>,
    },
    GetVolume {
        direction: Direction,
    },
    SetVolume {
        direction: Direction,
        percent: i64,
    },
    SetMute {
        direction: Direction,
        muted: bool,
    },
    SetDefault {
        direction: Direction,
        device_id: String,
    },
    Play {
        path: String,
        #[serde(default)]
        seek: f64,
    },
    Pause,
    Resume,
    Seek {
        seconds: f64,
    },
    Stop,
    GetState,
    StartStream {
        #[serde(default)]
        device_id: Option<String>,
    },
    CancelStream {
        device_id: String,
    },
    StreamStatus {
        #[serde(default)]
        device_id: Option<String>,
    },
}

fn encode<T: Serialize>(reply: Reply<T>) -> Value {
    serde_json::to_value(&reply).unwrap_or_else(|e| {
        json!({"success": false, "error": {"code": "Backend", "message": e.to_string()}})
    })
}

// Web层和音频服务通过本地UDP通信，端口在配置中指定
pub struct ControlBridge {
    socket: Arc<UdpSocket>,
    stream_target: String,
    buffer_size: usize,
    service: Arc<AudioService>,
}

impl ControlBridge {
    pub async fn new(config: &Config, service: Arc<AudioService>) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket =
            UdpSocket::bind(format!("{}:{}", config.bridge_local_ip, config.bridge_local_port))
                .await?;

        Ok(Self {
            socket: Arc::new(socket),
            stream_target: config.bridge_stream_target.clone(),
            buffer_size: config.bridge_buffer_size,
            service,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let packet = buf[..len].to_vec();
            let bridge = self.clone();
            // 每个请求单独处理，播放启动较慢时不阻塞其他请求
            tokio::spawn(async move {
                let reply = bridge.handle(&packet).await.to_string();
                if let Err(e) = bridge.socket.send_to(reply.as_bytes(), peer).await {
                    log::error!("Failed to send reply to {}: {}", peer, e);
                }
            });
        }
    }

    pub async fn handle(&self, packet: &[u8]) -> Value {
        let request: Request = match serde_json::from_slice(packet) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Malformed bridge request: {}", e);
                return json!({"success": false, "error": {"code": "BadRequest", "message": e.to_string()}});
            }
        };
        log::debug!("bridge request: {:?}", request);
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: Request) -> Value {
        let service = &self.service;
        match request {
            Request::ListDevices { direction } => encode(service.list_devices(direction).await),
            Request::GetVolume { direction } => encode(service.get_volume(direction).await),
            Request::SetVolume { direction, percent } => {
                encode(service.set_volume(direction, percent).await)
            }
            Request::SetMute { direction, muted } => encode(service.set_mute(direction, muted).await),
            Request::SetDefault {
                direction,
                device_id,
            } => encode(service.set_default(direction, &device_id).await),
            Request::Play { path, seek } => encode(service.play(&path, seek).await),
            Request::Pause => encode(service.pause().await),
            Request::Resume => encode(service.resume().await),
            Request::Seek { seconds } => encode(service.seek(seconds).await),
            Request::Stop => encode(service.stop().await),
            Request::GetState => encode(service.get_state().await),
            Request::StartStream { device_id } => {
                let (reply, stream) = service.start_stream(device_id.as_deref()).await;
                if let Some(stream) = stream {
                    self.forward(stream);
                }
                encode(reply)
            }
            Request::CancelStream { device_id } => encode(service.cancel_stream(&device_id).await),
            Request::StreamStatus { device_id: Some(id) } => encode(service.stream_status(&id)),
            Request::StreamStatus { device_id: None } => encode(service.streams()),
        }
    }

    /// Sends every captured chunk to the stream target until the stream ends.
    fn forward(&self, mut stream: CaptureStream) {
        let socket = self.socket.clone();
        let target = self.stream_target.clone();
        tokio::spawn(async move {
            let device = stream.info().device_id.clone();
            let mut sent = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::error!("capture read on {} failed: {}", device, e);
                        break;
                    }
                };
                if let Err(e) = socket.send_to(&chunk, &target).await {
                    log::error!("Failed to forward audio to {}: {}", target, e);
                    break;
                }
                sent += chunk.len();
            }
            log::info!("capture forward for {} ended after {} bytes", device, sent);
        });
    }
}
