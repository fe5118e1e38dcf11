//! Datagram transport
//!
//! One socket per session. Binding goes through socket2 so a session can
//! reclaim its previous port immediately after teardown; everything
//! above this module deals in whole frames, never raw bytes.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::protocol::Frame;

use super::error::SessionError;

/// Largest datagram we will read; anything bigger than a full data
/// frame is not ours.
const RECV_BUFFER_SIZE: usize = 2048;

/// Decoded frames queued between the socket task and the read loop.
const RECEIVE_QUEUE_DEPTH: usize = 1024;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind a reusable, non-blocking UDP socket on `addr`.
    pub async fn bind(addr: &str) -> Result<Self, SessionError> {
        let requested: SocketAddr = addr.parse()?;

        let domain = if requested.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        // Sessions rebind their old port right after a teardown
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&requested.into())?;

        let socket = UdpSocket::from_std(raw.into())?;
        let local_addr = socket.local_addr()?;
        debug!("Transport bound on {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send_to(&self, frame: &Frame, addr: SocketAddr) -> Result<(), SessionError> {
        let bytes = frame.to_bytes();
        self.socket.send_to(&bytes, addr).await?;
        trace!("{} bytes -> {}", bytes.len(), addr);
        Ok(())
    }

    /// Receive one frame. An undecodable datagram surfaces as
    /// `InvalidFrame` so the caller can decide whether to keep reading.
    pub async fn recv_from(&self) -> Result<(Frame, SocketAddr), SessionError> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        trace!("{} bytes <- {}", len, addr);

        match Frame::from_bytes(&buf[..len]) {
            Some(frame) => Ok((frame, addr)),
            None => Err(SessionError::InvalidFrame),
        }
    }

    /// Spawn the socket reader. Decoded frames flow out through the
    /// returned channel; garbage datagrams are dropped without ending
    /// the task, and the task ends once the receiver is gone.
    pub fn start_receive_loop(
        self: Arc<Self>,
    ) -> (mpsc::Receiver<(Frame, SocketAddr)>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE_DEPTH);

        let handle = tokio::spawn(async move {
            let mut garbage = 0u64;
            loop {
                match self.recv_from().await {
                    Ok(delivery) => {
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(SessionError::InvalidFrame) => {
                        garbage += 1;
                        trace!("Dropped undecodable datagram ({} so far)", garbage);
                    }
                    Err(e) => warn!("Socket receive failed: {}", e),
                }
            }
            debug!("Receive task on {} finished", self.local_addr);
        });

        (rx, handle)
    }
}
