//! Control-port command channel.
//!
//! ```text
//! engine / keep-alive ──► CommandChannel (UDP, ephemeral port) ──► device:control_port
//! ```
//!
//! The device sends nothing back on this path, so the channel is send-only.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jhview_core::{EngineConfig, TransportError};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::command::Command;

// MARK: - CommandTransport

/// Anything that can deliver commands to the device's control port.
///
/// `send` must be callable concurrently from the orchestration task and the
/// keep-alive task.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Transmit one command. A failure leaves the transport usable.
    async fn send(&self, command: Command) -> Result<(), TransportError>;

    /// Send `times` identical copies, `spacing` apart. Succeeds when at
    /// least one copy went out; otherwise returns the last error.
    async fn send_redundant(
        &self,
        command: Command,
        times: u32,
        spacing: Duration,
    ) -> Result<(), TransportError> {
        let mut delivered = 0u32;
        let mut last_err = None;
        for i in 0..times.max(1) {
            if i > 0 && !spacing.is_zero() {
                tokio::time::sleep(spacing).await;
            }
            match self.send(command).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("{} copy {}/{} failed: {}", command, i + 1, times, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Release the underlying socket. Idempotent.
    async fn close(&self);
}

/// Opens a fresh [`CommandTransport`] for each connection attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(
        &self,
        config: &EngineConfig,
    ) -> Result<Arc<dyn CommandTransport>, TransportError>;
}

/// Default connector: a UDP [`CommandChannel`] per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpConnector;

#[async_trait]
impl TransportConnector for UdpConnector {
    async fn open(
        &self,
        config: &EngineConfig,
    ) -> Result<Arc<dyn CommandTransport>, TransportError> {
        let channel = CommandChannel::open(config.control_addr(), config.command_timeout()).await?;
        Ok(Arc::new(channel))
    }
}

// MARK: - CommandChannel

/// UDP command sender bound to an OS-assigned local port.
pub struct CommandChannel {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    remote_addr: SocketAddr,
    send_timeout: Duration,
}

impl CommandChannel {
    /// Bind an ephemeral local port and target `remote`.
    pub async fn open(remote: SocketAddr, send_timeout: Duration) -> Result<Self, TransportError> {
        let local = SocketAddr::new(unspecified_for(remote.ip()), 0);
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: local.to_string(),
                reason: e.to_string(),
            })?;

        // "Connect" sets the default destination so `send()` can be used.
        socket
            .connect(remote)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: remote.to_string(),
                reason: e.to_string(),
            })?;

        if let Ok(addr) = socket.local_addr() {
            info!("Command channel {} → {}", addr, remote);
        }

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            remote_addr: remote,
            send_timeout,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.socket.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl CommandTransport for CommandChannel {
    async fn send(&self, command: Command) -> Result<(), TransportError> {
        let socket = self.current_socket().ok_or(TransportError::ChannelClosed)?;

        match tokio::time::timeout(self.send_timeout, socket.send(command.as_bytes())).await {
            Ok(Ok(_)) => {
                debug!("Sent {} to {}", command, self.remote_addr);
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::SendFailed {
                reason: format!("{} to {}: {}", command, self.remote_addr, e),
            }),
            Err(_) => Err(TransportError::Timeout {
                ms: self.send_timeout.as_millis() as u64,
            }),
        }
    }

    async fn close(&self) {
        let taken = match self.socket.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if taken.is_some() {
            debug!("Command channel to {} closed", self.remote_addr);
        }
    }
}

fn unspecified_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
