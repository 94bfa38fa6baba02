use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::interface::InterfaceWriter;
use crate::protocol::{self, Announcement};
use crate::state::Tunnel;

/// Drain buffer; bounds the useful inbound payload.
pub const RECV_BUF: usize = 1600;

/// One UDP path: a socket bound to the link's resolved source plus the task
/// draining it. Created and recycled by the address watcher; at most one
/// exists per link.
pub struct LinkEndpoint {
    socket: Arc<UdpSocket>,
    connected: bool,
    task: JoinHandle<()>,
}

impl LinkEndpoint {
    /// Binds `(src, srcport)` and starts the drain. With `connect_to` the
    /// socket is additionally connected and a one-byte probe flushes NAT
    /// state on the way out; probe failure is not fatal.
    pub async fn start(
        idx: usize,
        name: &str,
        src: IpAddr,
        srcport: u16,
        connect_to: Option<SocketAddr>,
        reuse: bool,
        tunnel: Arc<Mutex<Tunnel>>,
        writer: Arc<Mutex<InterfaceWriter>>,
    ) -> std::io::Result<Self> {
        let socket = build_socket(SocketAddr::new(src, srcport), reuse)?;
        let socket = UdpSocket::from_std(socket)?;

        let mut connected = false;
        if let Some(peer) = connect_to {
            match socket.connect(peer).await {
                Ok(()) => {
                    connected = true;
                    if let Err(e) = socket.send(b"a").await {
                        warn!("link {}: probe to {} failed: {}", name, peer, e);
                    }
                }
                Err(e) => warn!("link {}: connect {} failed: {}", name, peer, e),
            }
        }

        let socket = Arc::new(socket);
        let task = tokio::spawn(recv_loop(idx, socket.clone(), tunnel, writer));
        Ok(Self {
            socket,
            connected,
            task,
        })
    }

    pub async fn send(&self, wire: &[u8], dst: SocketAddr) -> std::io::Result<usize> {
        if self.connected {
            self.socket.send(wire).await
        } else {
            self.socket.send_to(wire, dst).await
        }
    }

    /// Stops the drain and closes the socket. Returns only once the old
    /// descriptor is gone, so a successor can bind the same pair.
    pub async fn terminate(self) {
        self.task.abort();
        let _ = self.task.await;
        drop(self.socket);
    }
}

fn build_socket(addr: SocketAddr, reuse: bool) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(
        if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        },
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    if reuse {
        socket.set_reuse_address(true)?;
        #[cfg(not(windows))]
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn recv_loop(
    idx: usize,
    socket: Arc<UdpSocket>,
    tunnel: Arc<Mutex<Tunnel>>,
    writer: Arc<Mutex<InterfaceWriter>>,
) {
    let mut buf = [0u8; RECV_BUF];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!("recv error: {}", e);
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        handle_datagram(idx, &buf[..n], from, &tunnel, &writer).await;
    }
}

/// Classification happens on the post-filter bytes: the `SES:` prefix marks
/// an announcement, everything else goes to the kernel. With strict
/// validation on, a prefix-bearing datagram that fails the checks is
/// delivered as data instead of being consumed.
async fn handle_datagram(
    idx: usize,
    raw: &[u8],
    from: SocketAddr,
    tunnel: &Arc<Mutex<Tunnel>>,
    writer: &Arc<Mutex<InterfaceWriter>>,
) {
    let mut t = tunnel.lock().await;
    t.links[idx].lastdst = Some(from);

    let Some(plain) = t.filters.inbound(raw) else {
        debug!("undecodable datagram from {} dropped", from);
        return;
    };

    if protocol::is_announcement(&plain) {
        let accepted = match Announcement::decode(&plain) {
            Ok(ann) => {
                if t.strict_announce
                    && !(protocol::prevalidate(&plain) && t.has_link(&ann.link))
                {
                    None
                } else {
                    Some(ann)
                }
            }
            Err(_) => None,
        };
        match accepted {
            Some(ann) => {
                t.apply_announcement(&ann, from);
                return;
            }
            None if !t.strict_announce => {
                debug!("malformed announcement from {} dropped", from);
                return;
            }
            None => {} // strict mode: treat as data
        }
    }

    drop(t);
    let mut w = writer.lock().await;
    if let Err(e) = w.write_frame(&plain).await {
        warn!("tun/tap write failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_excludes_double_bind() {
        let first = build_socket("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = first.local_addr().unwrap();
        // same pair while the first socket lives: refused
        assert!(build_socket(addr, false).is_err());
        // released descriptor frees the pair for a successor
        drop(first);
        let again = build_socket(addr, false).unwrap();
        assert_eq!(again.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_reuse_allows_shared_bind() {
        let first = build_socket("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = first.local_addr().unwrap();
        let second = build_socket(addr, true).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_sockets_are_nonblocking() {
        let socket = build_socket("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
