//! Error simulator relay
//!
//! The simulator sits between one client and the server. Clients send their
//! requests to the simulator's listening port; it forwards them to the
//! server's request port from its own relay socket, learns the server's
//! transfer ID from the first reply and from then on shuttles packets both
//! ways, applying queued alterations to the packets they target.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alteration::{Alteration, Direction, PacketTarget};
use crate::queue::AlterationQueue;

/// Error simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Where clients send their requests
    pub listen_address: String,
    /// The server's request port
    pub server_address: SocketAddr,
    /// Receive buffer size; larger than any valid packet so oversized ones pass through intact
    pub recv_buffer: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:2300".to_string(),
            server_address: SocketAddr::from(([127, 0, 0, 1], 6900)),
            recv_buffer: 1500,
        }
    }
}

pub struct ErrorSimulator {
    config: SimulatorConfig,
    queue: AlterationQueue,
    client_socket: Option<UdpSocket>,
    server_socket: Option<UdpSocket>,
}

impl ErrorSimulator {
    pub fn new(config: SimulatorConfig, queue: AlterationQueue) -> Self {
        Self {
            config,
            queue,
            client_socket: None,
            server_socket: None,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Alterations still waiting for their packet
    pub fn queue(&self) -> &AlterationQueue {
        &self.queue
    }

    /// Schedule more alterations before the relay starts
    pub fn queue_mut(&mut self) -> &mut AlterationQueue {
        &mut self.queue
    }

    /// Bind the client-facing and server-facing relay sockets
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let client_socket = UdpSocket::bind(&self.config.listen_address)
            .await
            .with_context(|| format!("Failed to bind error simulator to {}", self.config.listen_address))?;
        let server_side = match self.config.server_address {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let server_socket = UdpSocket::bind(server_side)
            .await
            .context("Failed to bind server-side relay socket")?;

        let local_addr = client_socket.local_addr().context("Failed to get local address")?;
        tracing::info!(
            "Error simulator listening on {}, relaying to {} ({} alteration(s) queued)",
            local_addr,
            self.config.server_address,
            self.queue.len()
        );

        self.client_socket = Some(client_socket);
        self.server_socket = Some(server_socket);
        Ok(local_addr)
    }

    /// The client-facing address, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.client_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Relay until the process ends
    pub async fn run(&mut self) -> Result<()> {
        let (_keep_open, shutdown) = watch::channel(false);
        self.run_until(shutdown).await
    }

    /// Relay until `shutdown` flips to `true` or its sender is dropped
    pub async fn run_until(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.client_socket.is_none() || self.server_socket.is_none() {
            self.bind().await?;
        }
        let (Some(client_socket), Some(server_socket)) = (self.client_socket.take(), self.server_socket.take()) else {
            anyhow::bail!("Error simulator sockets are not bound");
        };

        let mut relay = Relay {
            client_socket,
            server_socket,
            server_address: self.config.server_address,
            recv_buffer: self.config.recv_buffer,
            client: None,
            server_tid: None,
            queue: std::mem::take(&mut self.queue),
            shutdown,
        };
        let outcome = relay.run().await;
        self.queue = relay.queue;

        tracing::info!("Error simulator stopped ({} alteration(s) unused)", self.queue.len());
        outcome
    }
}

/// Relay state for one run; owned by a single sequential task
struct Relay {
    client_socket: UdpSocket,
    server_socket: UdpSocket,
    server_address: SocketAddr,
    recv_buffer: usize,
    client: Option<SocketAddr>,
    server_tid: Option<SocketAddr>,
    queue: AlterationQueue,
    shutdown: watch::Receiver<bool>,
}

impl Relay {
    async fn run(&mut self) -> Result<()> {
        let mut client_buf = vec![0u8; self.recv_buffer];
        let mut server_buf = vec![0u8; self.recv_buffer];

        loop {
            let (direction, received) = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                received = self.client_socket.recv_from(&mut client_buf) => (Direction::ClientToServer, received),
                received = self.server_socket.recv_from(&mut server_buf) => (Direction::ServerToClient, received),
            };

            let Some((len, src)) = filter_icmp(received).context("Relay receive failed")? else {
                continue;
            };
            let packet = match direction {
                Direction::ClientToServer => client_buf[..len].to_vec(),
                Direction::ServerToClient => server_buf[..len].to_vec(),
            };

            if !self.relay(direction, packet, src).await? {
                return Ok(());
            }
        }
    }

    /// Forward one packet, altering it if the queue head targets it
    ///
    /// Returns `false` if shutdown was requested while waiting.
    async fn relay(&mut self, direction: Direction, packet: Vec<u8>, src: SocketAddr) -> Result<bool> {
        let Some(dest) = self.route(direction, src, &packet) else {
            return Ok(true);
        };
        let Some(alteration) = self.queue.take_match(direction, &packet) else {
            self.send(direction, &packet, dest).await;
            return Ok(true);
        };

        tracing::info!("Applying alteration [{}] to {} packet from {}", alteration, direction, src);
        let altered = alteration.apply(&packet);

        if let Some(delay) = alteration.delay {
            tracing::info!("Delaying {} packet by {:?}", direction, delay);
            tokio::time::sleep(delay).await;
        }

        if alteration.drop {
            tracing::info!("Dropped {} packet {}", direction, alteration.target);
            // The next packet from the same side takes the dropped one's place, unaltered.
            let Some((next, next_src)) = self.next_from(direction).await? else {
                return Ok(false);
            };
            if let Some(dest) = self.route(direction, next_src, &next) {
                self.send(direction, &next, dest).await;
            }
            return Ok(true);
        }

        self.emit(&alteration, direction, &altered, dest).await;
        if let Some(gap) = alteration.duplicate {
            tokio::time::sleep(gap).await;
            tracing::info!("Sending duplicate {} packet", direction);
            self.emit(&alteration, direction, &altered, dest).await;
        }

        Ok(true)
    }

    /// Learn peers from `src` and pick the destination for its packet
    fn route(&mut self, direction: Direction, src: SocketAddr, packet: &[u8]) -> Option<SocketAddr> {
        match direction {
            Direction::ClientToServer => {
                if PacketTarget::of(packet) == Some(PacketTarget::Request) {
                    tracing::info!("New request from client {}", src);
                    self.client = Some(src);
                    self.server_tid = None;
                    return Some(self.server_address);
                }
                if self.client.is_none() {
                    self.client = Some(src);
                }
                Some(self.server_tid.unwrap_or(self.server_address))
            }
            Direction::ServerToClient => {
                if self.server_tid != Some(src) {
                    tracing::debug!("Server transfer ID is now {}", src);
                    self.server_tid = Some(src);
                }
                if self.client.is_none() {
                    tracing::warn!("Dropping packet from server {}: no client known yet", src);
                }
                self.client
            }
        }
    }

    /// Block until the next packet arrives on the `direction` side
    async fn next_from(&mut self, direction: Direction) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = vec![0u8; self.recv_buffer];
        let socket = match direction {
            Direction::ClientToServer => &self.client_socket,
            Direction::ServerToClient => &self.server_socket,
        };

        loop {
            let received = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(None);
                    }
                    continue;
                }
                received = socket.recv_from(&mut buf) => received,
            };
            if let Some((len, src)) = filter_icmp(received).context("Relay receive failed")? {
                return Ok(Some((buf[..len].to_vec(), src)));
            }
        }
    }

    /// Send through the normal relay socket, or a transient one for overrides
    async fn emit(&self, alteration: &Alteration, direction: Direction, bytes: &[u8], dest: SocketAddr) {
        if alteration.tid.is_none() && alteration.source_address.is_none() {
            self.send(direction, bytes, dest).await;
            return;
        }

        let ip = alteration
            .source_address
            .unwrap_or_else(|| self.outbound_ip(direction));
        let bind_addr = SocketAddr::new(ip, alteration.tid.unwrap_or(0));
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("Failed to bind transient socket {}: {}", bind_addr, e);
                return;
            }
        };

        match socket.send_to(bytes, dest).await {
            Ok(len) => tracing::info!(
                "Sent {} byte {} packet to {} from transient socket {}",
                len,
                direction,
                dest,
                socket.local_addr().unwrap_or(bind_addr)
            ),
            Err(e) => tracing::warn!("Failed to send from transient socket {}: {}", bind_addr, e),
        }
    }

    async fn send(&self, direction: Direction, bytes: &[u8], dest: SocketAddr) {
        let socket = self.outbound(direction);
        match socket.send_to(bytes, dest).await {
            Ok(len) => tracing::debug!("Forwarded {} byte {} packet to {}", len, direction, dest),
            Err(e) => tracing::warn!("Failed to forward {} packet to {}: {}", direction, dest, e),
        }
    }

    fn outbound(&self, direction: Direction) -> &UdpSocket {
        match direction {
            Direction::ClientToServer => &self.server_socket,
            Direction::ServerToClient => &self.client_socket,
        }
    }

    fn outbound_ip(&self, direction: Direction) -> IpAddr {
        self.outbound(direction)
            .local_addr()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |a| a.ip())
    }
}

/// Treat ICMP-induced errors as "nothing received"
fn filter_icmp(received: io::Result<(usize, SocketAddr)>) -> io::Result<Option<(usize, SocketAddr)>> {
    match received {
        Ok(received) => Ok(Some(received)),
        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
            tracing::debug!("Ignoring ICMP-induced relay error: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// A running simulator started with [`spawn_error_simulator`]
pub struct SimulatorHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl SimulatorHandle {
    /// Where clients should send their requests
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.context("Error simulator task failed")?
    }
}

/// Bind a simulator and run it on a background task
pub async fn spawn_error_simulator(config: SimulatorConfig, queue: AlterationQueue) -> Result<SimulatorHandle> {
    let mut simulator = ErrorSimulator::new(config, queue);
    let local_addr = simulator.bind().await?;
    let (shutdown, receiver) = watch::channel(false);
    let task = tokio::spawn(async move { simulator.run_until(receiver).await });

    Ok(SimulatorHandle {
        local_addr,
        shutdown,
        task,
    })
}
