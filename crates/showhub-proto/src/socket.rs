//! The shared UDP socket every driver's feedback is relayed through.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::warn;

use crate::wire::{self, WireError};
use crate::{Message, Value};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to bind message socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
}

/// Owns the single inbound/outbound UDP socket.
///
/// Every endpoint a datagram has ever arrived from is remembered as a reply
/// target; `send_to_clients` fans an encoded message out to all of them.
/// Decode failures are never fatal — `recv` surfaces them as an error so the
/// caller's loop can log and continue (see spec §4.1, §7 Protocol-decode).
pub struct MessageSocket {
    socket: UdpSocket,
    reply_targets: Mutex<HashSet<SocketAddr>>,
}

impl MessageSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>, SocketError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SocketError::Bind { addr, source })?;
        Ok(Arc::new(Self {
            socket,
            reply_targets: Mutex::new(HashSet::new()),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and decode the next datagram, remembering its origin as a
    /// reply target. Returns `Ok(Err(..))`-shaped data via the outer Result
    /// for decode failures so the caller can log and keep looping without
    /// losing the origin information for already-successful decodes.
    pub async fn recv(&self) -> std::io::Result<(Result<Message, WireError>, SocketAddr)> {
        let mut buf = [0u8; 2048];
        let (len, origin) = self.socket.recv_from(&mut buf).await?;
        self.remember_reply_target(origin).await;
        Ok((wire::decode(&buf[..len]), origin))
    }

    pub async fn remember_reply_target(&self, addr: SocketAddr) {
        self.reply_targets.lock().await.insert(addr);
    }

    pub async fn reply_target_count(&self) -> usize {
        self.reply_targets.lock().await.len()
    }

    /// Encode `address`+`args` and send to every known reply target.
    pub async fn send_to_clients(&self, address: &str, args: Vec<Value>) -> Result<(), SocketError> {
        let msg = Message::new(address, args);
        let bytes = wire::encode(&msg);
        let targets: Vec<SocketAddr> = self.reply_targets.lock().await.iter().copied().collect();
        for target in targets {
            if let Err(e) = self.socket.send_to(&bytes, target).await {
                warn!(%target, error = %e, "failed to send to reply target");
            }
        }
        Ok(())
    }

    pub async fn send_to(&self, address: &str, args: Vec<Value>, target: SocketAddr) -> Result<(), SocketError> {
        let msg = Message::new(address, args);
        let bytes = wire::encode(&msg);
        self.socket.send_to(&bytes, target).await?;
        Ok(())
    }
}
