use crate::{
    errors::{Error, Result},
    models::*,
};

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// Which of the two per-engine sockets a query runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Connected socket, one reply datagram per request.
    Single,
    /// Unconnected socket that reports the sender of every datagram, used for split replies.
    Multi,
}

/// A blocking datagram channel to one server.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8]) -> Result<()>;
    fn recv(&mut self) -> Result<Packet>;
    fn set_timeouts(&mut self, send: Duration, recv: Duration) -> Result<()>;
}

/// Opens transports on behalf of the query engine.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        addr: SocketAddr,
        kind: SocketKind,
        config: &QueryConfig,
    ) -> Result<Box<dyn Transport>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UdpConnector;

impl Connector for UdpConnector {
    fn connect(
        &self,
        addr: SocketAddr,
        kind: SocketKind,
        config: &QueryConfig,
    ) -> Result<Box<dyn Transport>> {
        Ok(Box::new(UdpTransport::open(addr, kind, config)?))
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d == Duration::from_secs(0) {
        None
    } else {
        Some(d)
    }
}

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    kind: SocketKind,
    recv_timeout: Option<Duration>,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn open(peer: SocketAddr, kind: SocketKind, config: &QueryConfig) -> Result<Self> {
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)?;
        if kind == SocketKind::Single {
            socket.connect(peer)?;
        }

        let mut transport = Self {
            socket,
            peer,
            kind,
            recv_timeout: None,
            buf: vec![0; config.max_datagram_size],
        };
        transport.set_timeouts(config.send_timeout, config.recv_timeout)?;
        debug!("Opened {:?} socket to {}", kind, peer);

        Ok(transport)
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("Sending data to {}: {}", self.peer, hex::encode(data));
        match self.kind {
            SocketKind::Single => self.socket.send(data)?,
            SocketKind::Multi => self.socket.send_to(data, self.peer)?,
        };
        Ok(())
    }

    /// Waits for the next datagram from the peer. Datagrams from other senders are dropped, and
    /// the receive timeout bounds the whole wait, not each datagram.
    fn recv(&mut self) -> Result<Packet> {
        let deadline = self.recv_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left == Duration::from_secs(0) {
                    return Err(Error::TransportTimeout);
                }
                self.socket.set_read_timeout(Some(left))?;
            }

            let (len, addr) = match self.kind {
                SocketKind::Single => (self.socket.recv(&mut self.buf)?, self.peer),
                SocketKind::Multi => self.socket.recv_from(&mut self.buf)?,
            };
            if addr != self.peer {
                debug!("Dropping datagram from unexpected sender {}", addr);
                continue;
            }

            let data = self.buf[..len].to_vec();
            trace!("Received data from {}: {}", addr, hex::encode(&data));
            return Ok(Packet { addr, data });
        }
    }

    fn set_timeouts(&mut self, send: Duration, recv: Duration) -> Result<()> {
        self.recv_timeout = non_zero(recv);
        self.socket.set_write_timeout(non_zero(send))?;
        self.socket.set_read_timeout(self.recv_timeout)?;
        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        debug!("Closing {:?} socket to {}", self.kind, self.peer);
    }
}
