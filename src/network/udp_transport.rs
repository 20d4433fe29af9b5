use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use log::warn;

use crate::error::SteplockError;
use crate::{MultiTransport, MAX_TRANSPORT_CONNECTIONS};

/// A simple non-blocking UDP implementation of [`MultiTransport`]. Listens on 0.0.0.0 on a
/// given port; the first datagram from an unseen peer address claims the next free connection
/// index, which then stays bound to that address.
#[derive(Debug)]
pub struct UdpMultiTransport {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl UdpMultiTransport {
    /// Binds a UDP socket to 0.0.0.0:port and sets it to non-blocking mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peers: Vec::new(),
        })
    }

    /// The peer address bound to a connection index, if any datagram arrived from it yet.
    pub fn peer_addr(&self, connection_index: u8) -> Option<SocketAddr> {
        self.peers.get(connection_index as usize).copied()
    }

    fn connection_index_for(&mut self, addr: SocketAddr) -> Option<u8> {
        if let Some(position) = self.peers.iter().position(|peer| *peer == addr) {
            return Some(position as u8);
        }
        if self.peers.len() >= MAX_TRANSPORT_CONNECTIONS {
            warn!(
                "dropping datagram from {}: all {} connection indices taken",
                addr, MAX_TRANSPORT_CONNECTIONS
            );
            return None;
        }
        self.peers.push(addr);
        Some((self.peers.len() - 1) as u8)
    }
}

impl MultiTransport for UdpMultiTransport {
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<(u8, usize)>, SteplockError> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((octet_count, from)) => match self.connection_index_for(from) {
                    Some(connection_index) => return Ok(Some((connection_index, octet_count))),
                    None => continue,
                },
                // there are no more datagrams
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                // datagram sockets sometimes get this as a result of an earlier send_to
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn send_to(&mut self, connection_index: u8, data: &[u8]) -> Result<(), SteplockError> {
        let peer = self
            .peers
            .get(connection_index as usize)
            .ok_or(SteplockError::UnknownConnection { connection_index })?;
        self.socket.send_to(data, peer)?;
        Ok(())
    }
}
