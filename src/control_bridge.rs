use crate::config::Config;
use crate::controller::CallState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// UI → core
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Permission {
        granted: bool,
    },
    Dial {
        #[serde(default)]
        url: Option<String>,
    },
    Hangup,
}

/// Core → UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    CallState { state: CallState },
    CallFailed { message: String },
}

impl StatusMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// The UI process and the core talk JSON over local UDP, ports from config
pub struct ControlBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<ControlEvent>,
}

impl ControlBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<ControlEvent>) -> anyhow::Result<Self> {
        Self::bind(
            &format!("{}:{}", config.control_local_ip, config.control_local_port),
            format!("{}:{}", config.control_remote_ip, config.control_remote_port),
            config.control_buffer_size,
            tx,
        )
        .await
    }

    pub async fn bind(
        local_addr: &str,
        target_addr: String,
        buffer_size: usize,
        tx: mpsc::Sender<ControlEvent>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        log::info!(
            "Control bridge listening on {}, reporting to {}",
            socket.local_addr()?,
            target_addr
        );
        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: buffer_size.max(64),
            tx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let event = match parse_control(&buf[..len]) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Ignoring control message from {}: {:#}", peer, e);
                    continue;
                }
            };
            log::debug!("Control event from {}: {:?}", peer, event);
            if let Err(e) = self.tx.send(event).await {
                log::error!("Failed to forward control event: {}", e);
                break;
            }
        }
        Ok(())
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }

    /// Fire-and-forget status report; the UI may not be listening.
    pub async fn send_status(&self, status: &StatusMessage) {
        if let Err(e) = self.send_message(&status.to_json()).await {
            log::warn!("Failed to send status to UI: {}", e);
        }
    }
}

fn parse_control(datagram: &[u8]) -> anyhow::Result<ControlEvent> {
    let text = std::str::from_utf8(datagram)?;
    Ok(serde_json::from_str(text.trim())?)
}
