//! Tokio driver for the connection engine.
//!
//! One task owns a [`Connection`] over a [`UdpSocketPair`] and multiplexes
//! four inputs: commands from [`KFrameClient`] handles, datagrams on each
//! socket, and the engine's next timer deadline. Engine events are fanned out
//! on a broadcast channel after every input.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionStats};
use super::event::{ConnectionEvent, ConnectionState};
use crate::config::ConnectionConfig;
use crate::error::{KFrameError, Result};
use crate::protocol::Suite;
use crate::transport::{Endpoint, UdpSocketPair};

/// Largest datagram the driver reads.
pub const MAX_DATAGRAM: usize = 2048;

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    UpdateConfig(Box<ConnectionConfig>, oneshot::Sender<Result<()>>),
    SendMacro {
        macro_number: u32,
        reply: oneshot::Sender<Result<u8>>,
    },
    SendAuxRoute {
        aux: u32,
        source: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSuite(Suite, oneshot::Sender<Result<()>>),
    SendSuiteSwitch(Suite, oneshot::Sender<Result<()>>),
    State(oneshot::Sender<ConnectionState>),
    Stats(oneshot::Sender<ConnectionStats>),
    Shutdown(oneshot::Sender<()>),
}

impl Command {
    /// Host the engine is about to open sockets for, if this command connects.
    fn target_host<'a>(&'a self, current: &'a ConnectionConfig) -> Option<&'a str> {
        let host = match self {
            Self::Connect(_) => &current.host,
            Self::UpdateConfig(config, _) => &config.host,
            _ => return None,
        };
        Some(host.trim()).filter(|h| !h.is_empty())
    }
}

enum Input {
    Command(Option<Command>),
    Main(io::Result<(usize, SocketAddr)>),
    Listener(io::Result<(usize, SocketAddr)>),
    Timeout,
}

/// Handle to a running connection task.
///
/// Cheap to clone; every clone talks to the same task.
#[derive(Debug, Clone)]
pub struct KFrameClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect(_) => "Connect",
            Self::Disconnect(_) => "Disconnect",
            Self::UpdateConfig(..) => "UpdateConfig",
            Self::SendMacro { .. } => "SendMacro",
            Self::SendAuxRoute { .. } => "SendAuxRoute",
            Self::SetSuite(..) => "SetSuite",
            Self::SendSuiteSwitch(..) => "SendSuiteSwitch",
            Self::State(_) => "State",
            Self::Stats(_) => "Stats",
            Self::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl KFrameClient {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    ///
    /// The task starts disconnected; call [`connect`](Self::connect).
    pub fn spawn(config: ConnectionConfig) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let conn = Connection::new(config, UdpSocketPair::new());
        tracing::debug!(connection = %conn.id(), "Spawning connection task");
        let task = tokio::spawn(run(conn, rx, events.clone()));

        (Self { commands, events }, task)
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Start connecting.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await?
    }

    /// Stop and release the sockets.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Replace the configuration (restarts the session on host/suite/port change).
    pub async fn update_config(&self, config: ConnectionConfig) -> Result<()> {
        self.request(|reply| Command::UpdateConfig(Box::new(config), reply))
            .await?
    }

    /// Recall a macro. Returns its correlation id.
    pub async fn send_macro(&self, macro_number: u32) -> Result<u8> {
        self.request(|reply| Command::SendMacro {
            macro_number,
            reply,
        })
        .await?
    }

    /// Route a source to an AUX bus.
    pub async fn send_aux_route(&self, aux: u32, source: u32) -> Result<()> {
        self.request(|reply| Command::SendAuxRoute { aux, source, reply })
            .await?
    }

    /// Change the default suite and apply it if connected.
    pub async fn set_suite(&self, suite: Suite) -> Result<()> {
        self.request(|reply| Command::SetSuite(suite, reply)).await?
    }

    /// Select a suite once without changing the default.
    pub async fn send_suite_switch(&self, suite: Suite) -> Result<()> {
        self.request(|reply| Command::SendSuiteSwitch(suite, reply))
            .await?
    }

    /// Current state.
    pub async fn state(&self) -> Result<ConnectionState> {
        self.request(Command::State).await
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> Result<ConnectionStats> {
        self.request(Command::Stats).await
    }

    /// Disconnect and stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Wait until the state becomes `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        let mut events = self.subscribe();
        if self.state().await? == target {
            return Ok(());
        }

        tokio::time::timeout(timeout, self.state_reached(&mut events, target))
            .await
            .map_err(|_| KFrameError::Network(format!("Timed out waiting for state {target}")))?
    }

    async fn state_reached(
        &self,
        events: &mut broadcast::Receiver<ConnectionEvent>,
        target: ConnectionState,
    ) -> Result<()> {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::StateChanged(state)) if state == target => return Ok(()),
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.state().await? == target {
                        return Ok(());
                    }
                },
                Err(broadcast::error::RecvError::Closed) => return Err(KFrameError::ChannelClosed),
            }
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| KFrameError::ChannelClosed)?;
        rx.await.map_err(|_| KFrameError::ChannelClosed)
    }
}

async fn run(
    mut conn: Connection<UdpSocketPair>,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ConnectionEvent>,
) {
    let mut main_buf = vec![0u8; MAX_DATAGRAM];
    let mut listener_buf = vec![0u8; MAX_DATAGRAM];

    loop {
        // Socket handles are scoped to the select so a reopen in the handler
        // can rebind the same local ports.
        let input = {
            let main = conn.sockets().main();
            let listener = conn.sockets().listener();
            let deadline = conn.next_timeout();

            tokio::select! {
                command = commands.recv() => Input::Command(command),
                res = recv_on(main.as_deref(), &mut main_buf) => Input::Main(res),
                res = recv_on(listener.as_deref(), &mut listener_buf) => Input::Listener(res),
                () = sleep_until(deadline) => Input::Timeout,
            }
        };

        let now = Instant::now();
        let running = match input {
            Input::Command(Some(command)) => {
                if let Some(host) = command.target_host(conn.config()) {
                    let host = host.to_string();
                    if let Err(e) = conn.sockets_mut().resolve(&host).await {
                        tracing::warn!("Failed to resolve {}: {}", host, e);
                    }
                }
                handle_command(&mut conn, command, Instant::now())
            },
            Input::Command(None) => {
                conn.disconnect();
                false
            },
            Input::Main(Ok((n, from))) => {
                conn.handle_datagram(Endpoint::Main, from, &main_buf[..n], now);
                true
            },
            Input::Listener(Ok((n, from))) => {
                conn.handle_datagram(Endpoint::Listener, from, &listener_buf[..n], now);
                true
            },
            Input::Main(Err(e)) => {
                conn.handle_socket_error(Endpoint::Main, &e, now);
                true
            },
            Input::Listener(Err(e)) => {
                conn.handle_socket_error(Endpoint::Listener, &e, now);
                true
            },
            Input::Timeout => {
                conn.handle_timeout(now);
                true
            },
        };

        while let Some(event) = conn.poll_event() {
            // No subscribers is fine.
            let _ = events.send(event);
        }

        if !running {
            break;
        }
    }

    tracing::debug!(connection = %conn.id(), "Connection task stopped");
}

fn handle_command(conn: &mut Connection<UdpSocketPair>, command: Command, now: Instant) -> bool {
    tracing::trace!("Command {:?}", command);
    match command {
        Command::Connect(reply) => {
            let _ = reply.send(conn.connect(now));
        },
        Command::Disconnect(reply) => {
            conn.disconnect();
            let _ = reply.send(());
        },
        Command::UpdateConfig(config, reply) => {
            let _ = reply.send(conn.update_config(*config, now));
        },
        Command::SendMacro {
            macro_number,
            reply,
        } => {
            let _ = reply.send(conn.send_macro(macro_number));
        },
        Command::SendAuxRoute { aux, source, reply } => {
            let _ = reply.send(conn.send_aux_route(aux, source));
        },
        Command::SetSuite(suite, reply) => {
            let _ = reply.send(conn.set_suite(suite, now));
        },
        Command::SendSuiteSwitch(suite, reply) => {
            let _ = reply.send(conn.send_suite_switch(suite, now));
        },
        Command::State(reply) => {
            let _ = reply.send(conn.state());
        },
        Command::Stats(reply) => {
            let _ = reply.send(conn.stats());
        },
        Command::Shutdown(reply) => {
            conn.disconnect();
            let _ = reply.send(());
            return false;
        },
    }
    true
}

async fn recv_on(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
