//! End-to-end tests over real UDP sockets.
//!
//! A mock device on loopback plays the full handshake and answers heartbeats
//! and macro acknowledgements while the real tokio driver runs the client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kframe::protocol::wire;
use kframe::{
    ConnectionConfig, ConnectionEvent, ConnectionState, KFrameClient, KFrameError, PortConfig,
    Suite,
};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

/// Find an available local UDP port
fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct MockDevice {
    initial: UdpSocket,
    announce: UdpSocket,
    session: UdpSocket,
    /// Answer heartbeats while set
    responsive: Arc<AtomicBool>,
}

impl MockDevice {
    async fn bind() -> Self {
        Self {
            initial: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            announce: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            session: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            responsive: Arc::new(AtomicBool::new(true)),
        }
    }

    fn port(socket: &UdpSocket) -> u16 {
        socket.local_addr().unwrap().port()
    }

    fn client_config(&self, keepalive: Duration) -> ConnectionConfig {
        let ports = PortConfig {
            bind_host: "127.0.0.1".to_string(),
            local_main: free_port(),
            local_listener: free_port(),
            remote_initial: Self::port(&self.initial),
            remote_announce: Self::port(&self.announce),
        };
        ConnectionConfig::new("127.0.0.1")
            .with_ports(ports)
            .with_keepalive(keepalive)
            .with_timeout(Duration::from_secs(2))
            .with_max_retries(1)
    }

    /// Play the device side, then report every session datagram on the channel.
    fn spawn(self, client_listener: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let main = expect(&self.initial, wire::PACKET_1).await;
            self.initial.send_to(wire::PACKET_2, main).await.unwrap();
            expect(&self.initial, wire::PACKET_3).await;
            self.initial.send_to(wire::PACKET_4, main).await.unwrap();
            expect(&self.initial, wire::PACKET_5).await;
            self.initial.send_to(wire::PACKET_6, main).await.unwrap();

            let listener = SocketAddr::from(([127, 0, 0, 1], client_listener));
            self.announce.send_to(wire::PACKET_7, listener).await.unwrap();
            expect(&self.announce, wire::PACKET_8).await;
            let mut announcement = vec![0u8; 20];
            announcement[18..20].copy_from_slice(&Self::port(&self.session).to_be_bytes());
            self.announce.send_to(&announcement, listener).await.unwrap();
            expect(&self.announce, wire::PACKET_10).await;

            let peer = expect(&self.session, wire::PACKET_12).await;
            self.session.send_to(wire::PACKET_13, peer).await.unwrap();
            expect(&self.session, wire::PACKET_14).await;
            self.session.send_to(wire::PACKET_15, peer).await.unwrap();
            let mut buf = [0u8; 64];
            let (n, _) = self.session.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], wire::encode_packet_16(3).as_ref());
            self.session.send_to(wire::PACKET_17, peer).await.unwrap();

            loop {
                let Ok((n, from)) = self.session.recv_from(&mut buf).await else {
                    return;
                };
                let payload = buf[..n].to_vec();
                if payload == wire::HEARTBEAT {
                    if self.responsive.load(Ordering::SeqCst) {
                        let _ = self.session.send_to(wire::HEARTBEAT_RESPONSE, from).await;
                    }
                } else if n == 28 && payload[..3] == [0x00, 0x04, 0x03] {
                    let _ = self.session.send_to(&[0x00, 0x02, 0x03, payload[3]], from).await;
                }
                if tx.send(payload).is_err() {
                    return;
                }
            }
        });
        rx
    }
}

/// Receive until `payload` arrives; returns its sender.
async fn expect(socket: &UdpSocket, payload: &[u8]) -> SocketAddr {
    let mut buf = [0u8; 64];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        if &buf[..n] == payload {
            return from;
        }
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    wanted: ConnectionEvent,
) -> bool {
    let search = async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(WAIT, search).await.unwrap_or(false)
}

/// Test handshake, suite selection and a macro round trip over loopback
#[tokio::test]
async fn test_handshake_and_macro_over_udp() {
    let device = MockDevice::bind().await;
    let config = device
        .client_config(Duration::from_millis(500))
        .with_suite(Suite::Suite3a);
    let mut received = device.spawn(config.ports.local_listener);

    let (client, task) = KFrameClient::spawn(config);
    let mut events = client.subscribe();
    client.connect().await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();

    let [first, second] = Suite::Suite3a.packets();
    assert_eq!(received.recv().await.unwrap(), first);
    assert_eq!(received.recv().await.unwrap(), second);

    let id = client.send_macro(12).await.unwrap();
    assert!(wait_for(&mut events, ConnectionEvent::MacroAcknowledged(id)).await);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.state, ConnectionState::Connected);
    assert_eq!(stats.macros_acknowledged, 1);

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test that a hostname is resolved before the sockets open
#[tokio::test]
async fn test_handshake_with_hostname() {
    let device = MockDevice::bind().await;
    let mut config = device.client_config(Duration::from_millis(500));
    config.host = "localhost".to_string();
    let _received = device.spawn(config.ports.local_listener);

    let (client, task) = KFrameClient::spawn(config);
    client.connect().await.unwrap();
    client
        .wait_for_state(ConnectionState::Connected, WAIT)
        .await
        .unwrap();

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test that heartbeats flow and a silent device triggers reconnection
#[tokio::test]
async fn test_silent_device_triggers_reconnect() {
    let device = MockDevice::bind().await;
    let responsive = device.responsive.clone();
    let config = device.client_config(Duration::from_millis(500));
    let mut received = device.spawn(config.ports.local_listener);

    let (client, task) = KFrameClient::spawn(config);
    let mut events = client.subscribe();
    client.connect().await.unwrap();
    assert!(wait_for(&mut events, ConnectionEvent::StateChanged(ConnectionState::Connected)).await);

    // Suite packets, then at least one heartbeat.
    received.recv().await.unwrap();
    received.recv().await.unwrap();
    assert_eq!(received.recv().await.unwrap(), wire::HEARTBEAT);

    responsive.store(false, Ordering::SeqCst);
    assert!(
        wait_for(
            &mut events,
            ConnectionEvent::StateChanged(ConnectionState::Reconnecting)
        )
        .await
    );

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test commands fail cleanly without a session and retries end in Disconnected
#[tokio::test]
async fn test_unreachable_device_gives_up() {
    let device = MockDevice::bind().await;
    let config = device
        .client_config(Duration::from_millis(500))
        .with_timeout(Duration::from_millis(200));
    // Device never answers.

    let (client, task) = KFrameClient::spawn(config);
    assert!(matches!(
        client.send_macro(1).await,
        Err(KFrameError::NotConnected)
    ));

    let mut events = client.subscribe();
    client.connect().await.unwrap();
    assert!(
        wait_for(
            &mut events,
            ConnectionEvent::StateChanged(ConnectionState::Reconnecting)
        )
        .await
    );
    assert!(
        wait_for(
            &mut events,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        )
        .await
    );
    assert_eq!(client.state().await.unwrap(), ConnectionState::Disconnected);

    client.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(matches!(
        client.state().await,
        Err(KFrameError::ChannelClosed)
    ));
}
