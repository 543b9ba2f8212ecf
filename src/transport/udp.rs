//! Tokio UDP socket pair.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::{Endpoint, SocketPair};
use crate::config::PortConfig;

/// Main and listener sockets bound on the local ports from [`PortConfig`].
///
/// Sockets are shared with the driver through `Arc` so it can wait on
/// `recv_from` while the engine keeps ownership of the lifecycle. Must be
/// opened from inside a tokio runtime.
///
/// `open` never performs a DNS lookup. A host that is not an IP literal
/// must first go through [`resolve`](Self::resolve), which caches the
/// address for later opens.
#[derive(Debug, Default)]
pub struct UdpSocketPair {
    main: Option<Arc<UdpSocket>>,
    listener: Option<Arc<UdpSocket>>,
    remote: Option<IpAddr>,
    resolved: Option<(String, IpAddr)>,
}

impl UdpSocketPair {
    /// Create with both sockets closed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Main socket, if open.
    pub fn main(&self) -> Option<Arc<UdpSocket>> {
        self.main.clone()
    }

    /// Listener socket, if open.
    pub fn listener(&self) -> Option<Arc<UdpSocket>> {
        self.listener.clone()
    }

    /// Resolved device address.
    pub fn remote(&self) -> Option<IpAddr> {
        self.remote
    }

    /// Local address of `endpoint`, if open.
    pub fn local_addr(&self, endpoint: Endpoint) -> Option<SocketAddr> {
        self.socket(endpoint).and_then(|s| s.local_addr().ok())
    }

    /// Look up `host` without blocking and remember the address, preferring IPv4.
    pub async fn resolve(&mut self, host: &str) -> io::Result<IpAddr> {
        let host = host.trim();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
        let ip = preferred(&addrs).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {host}"),
            )
        })?;
        tracing::debug!("Resolved {} to {}", host, ip);
        self.resolved = Some((host.to_string(), ip));
        Ok(ip)
    }

    /// Address for `host` from an IP literal or an earlier [`resolve`](Self::resolve).
    fn address_of(&self, host: &str) -> io::Result<IpAddr> {
        let host = host.trim();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        match &self.resolved {
            Some((name, ip)) if name == host => Ok(*ip),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host} has not been resolved"),
            )),
        }
    }

    fn socket(&self, endpoint: Endpoint) -> Option<&Arc<UdpSocket>> {
        match endpoint {
            Endpoint::Main => self.main.as_ref(),
            Endpoint::Listener => self.listener.as_ref(),
        }
    }
}

fn bind(host: &str, port: u16) -> io::Result<Arc<UdpSocket>> {
    let socket = std::net::UdpSocket::bind((host, port))?;
    socket.set_nonblocking(true)?;
    Ok(Arc::new(UdpSocket::from_std(socket)?))
}

fn preferred(addrs: &[SocketAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
}

impl SocketPair for UdpSocketPair {
    fn open(&mut self, host: &str, ports: &PortConfig) -> io::Result<()> {
        self.close();

        let remote = self.address_of(host)?;
        let main = bind(&ports.bind_host, ports.local_main)?;
        let listener = bind(&ports.bind_host, ports.local_listener)?;

        tracing::debug!(
            "Bound main {:?} and listener {:?} for {}",
            main.local_addr().ok(),
            listener.local_addr().ok(),
            remote
        );

        self.remote = Some(remote);
        self.main = Some(main);
        self.listener = Some(listener);
        Ok(())
    }

    fn reopen_listener(&mut self, ports: &PortConfig) -> io::Result<()> {
        if self.listener.is_none() {
            self.listener = Some(bind(&ports.bind_host, ports.local_listener)?);
        }
        Ok(())
    }

    fn send_to(&mut self, endpoint: Endpoint, port: u16, payload: &[u8]) -> io::Result<()> {
        let socket = self.socket(endpoint).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, format!("{endpoint} socket closed"))
        })?;
        let remote = self
            .remote
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no remote address"))?;

        socket.try_send_to(payload, SocketAddr::new(remote, port))?;
        Ok(())
    }

    fn close_listener(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!("Listener socket closed");
        }
    }

    fn close(&mut self) {
        self.main = None;
        self.listener = None;
    }

    fn is_open(&self, endpoint: Endpoint) -> bool {
        self.socket(endpoint).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_ports() -> PortConfig {
        PortConfig {
            bind_host: "127.0.0.1".to_string(),
            local_main: 0,
            local_listener: 0,
            ..PortConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let mut pair = UdpSocketPair::new();
        assert!(!pair.is_open(Endpoint::Main));

        pair.open("127.0.0.1", &ephemeral_ports()).unwrap();
        assert!(pair.is_open(Endpoint::Main));
        assert!(pair.is_open(Endpoint::Listener));
        assert_eq!(pair.remote(), Some(IpAddr::from([127, 0, 0, 1])));

        pair.close_listener();
        assert!(!pair.is_open(Endpoint::Listener));
        assert!(pair.is_open(Endpoint::Main));

        pair.reopen_listener(&ephemeral_ports()).unwrap();
        assert!(pair.is_open(Endpoint::Listener));

        pair.close();
        pair.close();
        assert!(!pair.is_open(Endpoint::Main));
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let mut pair = UdpSocketPair::new();
        pair.open("127.0.0.1", &ephemeral_ports()).unwrap();
        pair.send_to(Endpoint::Main, peer_port, b"\x00\x06\x00\x00").unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x00\x06\x00\x00");
        assert_eq!(Some(from), pair.local_addr(Endpoint::Main));
    }

    #[tokio::test]
    async fn test_hostname_requires_resolve() {
        let mut pair = UdpSocketPair::new();
        let err = pair.open("localhost", &ephemeral_ports()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!pair.is_open(Endpoint::Main));

        let ip = pair.resolve("localhost").await.unwrap();
        assert!(ip.is_loopback());
        pair.open("localhost", &ephemeral_ports()).unwrap();
        assert_eq!(pair.remote(), Some(ip));

        // The cached address survives close and serves reconnects.
        pair.close();
        pair.open(" localhost ", &ephemeral_ports()).unwrap();
        assert!(pair.open("kframe.invalid", &ephemeral_ports()).is_err());
    }

    #[test]
    fn test_preferred_address_is_ipv4() {
        let v6 = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 0));
        let v4 = SocketAddr::from(([127, 0, 0, 1], 0));
        assert_eq!(preferred(&[v6, v4]), Some(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(preferred(&[v6]), Some(v6.ip()));
        assert_eq!(preferred(&[]), None);
    }

    #[tokio::test]
    async fn test_send_on_closed_socket_fails() {
        let mut pair = UdpSocketPair::new();
        let err = pair.send_to(Endpoint::Listener, 5001, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
