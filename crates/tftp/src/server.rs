//! TFTP Server Implementation
//!
//! This module contains the request dispatcher that owns the well-known
//! listening socket, and the per-request handler that validates a request and
//! runs its transfer session on a fresh ephemeral port.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tokio::fs::{File, OpenOptions};
use tokio::io::{BufReader, BufWriter};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::protocol::{Packet, TftpError, TftpErrorCode, TftpRequest, TransferMode, build_ack};
use crate::transfer::{Role, TransferConfig, TransferSession, create_ephemeral_socket, io_error_code};

const RESERVED_CHARS: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    pub transfer_config: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6900".to_string(),
            root_directory: PathBuf::from("./server_files"),
            transfer_config: TransferConfig::default(),
        }
    }
}

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    socket: Option<UdpSocket>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig) -> Self {
        Self { config, socket: None }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TftpServerConfig::default())
    }

    /// Create a new TFTP server with custom bind address and root directory
    pub fn with_config(bind_address: String, root_directory: PathBuf) -> Self {
        Self::new(TftpServerConfig {
            bind_address,
            root_directory,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TftpServerConfig {
        &mut self.config
    }

    /// Bind the listening socket without serving yet
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind TFTP server socket to {}", self.config.bind_address))?;

        let local_addr = socket.local_addr().context("Failed to get local address")?;
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            local_addr,
            self.config.root_directory.display()
        );

        self.socket = Some(socket);
        Ok(local_addr)
    }

    /// Start the TFTP server and serve until the process ends
    pub async fn run(&mut self) -> Result<()> {
        let (_keep_open, shutdown) = watch::channel(false);
        self.run_until(shutdown).await
    }

    /// Serve until `shutdown` flips to `true` or its sender is dropped
    ///
    /// Binds first if [`bind`](Self::bind) was not called.
    pub async fn run_until(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        self.serve(shutdown).await
    }

    /// Get the local address the server is bound to (if running)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Request dispatcher loop
    async fn serve(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = self.socket.take().context("Server must be bound before serving")?;
        let listen_ip = socket.local_addr().context("Failed to get local address")?.ip();

        let mut sessions = JoinSet::new();
        let mut buffer = [0u8; 2048];
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, client)) => {
                            tracing::debug!("Received {} byte request from {}", len, client);
                            self.dispatch(&buffer[..len], client, listen_ip, &mut sessions);
                        }
                        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                            tracing::debug!("Ignoring ICMP-induced listener error: {}", e);
                        }
                        Err(e) => {
                            outcome = Err(e).context("TFTP listener receive failed");
                            break;
                        }
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Transfer task ended abnormally: {}", e);
                    }
                }
            }
        }

        // Closing the listener stops new sessions; in-flight ones run to completion.
        drop(socket);
        if !sessions.is_empty() {
            tracing::info!("TFTP listener closed, waiting for {} active transfer(s)", sessions.len());
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Transfer task ended abnormally: {}", e);
            }
        }
        tracing::info!("TFTP server stopped");

        outcome
    }

    /// Hand a datagram off to its own task
    fn dispatch(&self, datagram: &[u8], client: SocketAddr, listen_ip: IpAddr, sessions: &mut JoinSet<()>) {
        let root = self.config.root_directory.clone();
        let mut config = self.config.transfer_config.clone();
        if config.local_bind.is_none() && !listen_ip.is_unspecified() {
            config.local_bind = Some(listen_ip);
        }

        let datagram = datagram.to_vec();
        sessions.spawn(async move {
            if let Err(e) = handle_request(datagram, client, root, config).await {
                tracing::warn!("Request from {} failed: {:#}", client, e);
            }
        });
    }
}

/// A running server started with [`spawn_tftp_server`]
pub struct TftpServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl TftpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener and wait for in-flight transfers to finish
    pub async fn shutdown(self) -> Result<()> {
        // The server may already have stopped on its own, which drops the receiver.
        let _ = self.shutdown.send(true);
        self.task.await.context("TFTP server task failed")?
    }
}

/// Bind a server and run it on a background task
pub async fn spawn_tftp_server(config: TftpServerConfig) -> Result<TftpServerHandle> {
    let mut server = TftpServer::new(config);
    let local_addr = server.bind().await?;
    let (shutdown, receiver) = watch::channel(false);
    let task = tokio::spawn(async move { server.run_until(receiver).await });

    Ok(TftpServerHandle {
        local_addr,
        shutdown,
        task,
    })
}

/// Run a TFTP server with the given bind address and root directory
///
/// This is a convenience function that creates and runs a TFTP server.
pub async fn run_tftp_server(bind_address: String, root_directory: PathBuf, local_bind: Option<IpAddr>) -> Result<()> {
    let mut server = TftpServer::with_config(bind_address, root_directory);
    server.config_mut().transfer_config.local_bind = local_bind;
    server.run().await
}

/// Validate one request and run its transfer session
///
/// Every reply, including a rejection, leaves from a fresh ephemeral socket.
async fn handle_request(datagram: Vec<u8>, client: SocketAddr, root: PathBuf, config: TransferConfig) -> Result<()> {
    let socket = create_ephemeral_socket(client, config.local_bind)
        .await
        .context("failed to bind ephemeral socket")?;

    let (role, request, mode) = match parse_request(&datagram) {
        Ok(parsed) => parsed,
        Err(rejection) => return reject(&socket, client, rejection).await,
    };
    let verb = if role == Role::Sender { "RRQ" } else { "WRQ" };
    tracing::info!("{} for '{}' in {} mode from {}", verb, request.filename, mode, client);

    let path = match resolve_path(&root, &request.filename).await {
        Ok(path) => path,
        Err(rejection) => return reject(&socket, client, rejection).await,
    };

    match role {
        Role::Sender => serve_read(socket, client, &path, mode, config).await,
        Role::Receiver => serve_write(socket, client, &path, mode, config).await,
    }
}

/// RRQ: the server sends `path` to the client
async fn serve_read(
    socket: UdpSocket,
    client: SocketAddr,
    path: &Path,
    mode: TransferMode,
    config: TransferConfig,
) -> Result<()> {
    let file = match open_for_read(path).await {
        Ok(file) => file,
        Err(rejection) => return reject(&socket, client, rejection).await,
    };

    let mut session = TransferSession::accepted(socket, client, Role::Sender, mode, config);
    let mut reader = BufReader::new(file);
    let summary = session
        .send(&mut reader, None)
        .await
        .with_context(|| format!("sending '{}' to {}", path.display(), client))?;

    tracing::info!(
        "Sent '{}' to {} ({} bytes in {} blocks)",
        path.display(),
        client,
        summary.bytes,
        summary.blocks
    );
    Ok(())
}

/// WRQ: the server receives the client's upload into `path`
async fn serve_write(
    socket: UdpSocket,
    client: SocketAddr,
    path: &Path,
    mode: TransferMode,
    config: TransferConfig,
) -> Result<()> {
    let file = match OpenOptions::new().write(true).create_new(true).open(path).await {
        Ok(file) => file,
        Err(e) => {
            let rejection = TftpError::with_default_message(io_error_code(&e, true));
            return reject(&socket, client, rejection).await;
        }
    };

    let mut session = TransferSession::accepted(socket, client, Role::Receiver, mode, config);
    let mut writer = BufWriter::new(file);
    match session.receive(&mut writer, build_ack(0)).await {
        Ok(summary) => {
            tracing::info!(
                "Received '{}' from {} ({} bytes in {} blocks)",
                path.display(),
                client,
                summary.bytes,
                summary.blocks
            );
            Ok(())
        }
        Err(e) => {
            drop(writer);
            if let Err(remove_err) = tokio::fs::remove_file(path).await {
                tracing::warn!("Failed to remove partial file {}: {}", path.display(), remove_err);
            }
            Err(e).with_context(|| format!("receiving '{}' from {}", path.display(), client))
        }
    }
}

async fn reject(socket: &UdpSocket, client: SocketAddr, rejection: TftpError) -> Result<()> {
    tracing::info!("Rejecting request from {}: {}", client, rejection);
    let packet = Packet::Error(rejection.clone()).encode();
    socket
        .send_to(&packet, client)
        .await
        .context("failed to send error reply")?;
    Err(anyhow!("request rejected with {}", rejection))
}

/// Decode and validate a datagram received on the listening socket
///
/// Returns the role the server plays for it (RRQ makes the server the sender).
pub fn parse_request(datagram: &[u8]) -> Result<(Role, TftpRequest, TransferMode), TftpError> {
    let illegal = |message: String| TftpError::new(TftpErrorCode::IllegalOperation, message);

    let (role, request) = match Packet::decode(datagram) {
        Ok(Packet::ReadRequest(request)) => (Role::Sender, request),
        Ok(Packet::WriteRequest(request)) => (Role::Receiver, request),
        Ok(other) => return Err(illegal(format!("Expected RRQ or WRQ, got {}", other.opcode()))),
        Err(e) => return Err(illegal(e.to_string())),
    };

    let mode = request
        .transfer_mode()
        .ok_or_else(|| illegal(format!("Unsupported transfer mode '{}'", request.mode)))?;
    validate_filename(&request.filename).map_err(|reason| illegal(reason.to_string()))?;

    Ok((role, request, mode))
}

/// Reject empty names, path separators, traversal and reserved characters
pub fn validate_filename(filename: &str) -> Result<(), &'static str> {
    if filename.is_empty() {
        return Err("Empty filename");
    }
    if filename == "." || filename == ".." {
        return Err("Path traversal attempt detected");
    }
    if filename.contains(RESERVED_CHARS) {
        return Err("Filename contains a reserved character");
    }
    if filename.chars().any(char::is_control) {
        return Err("Filename contains a control character");
    }
    Ok(())
}

/// Resolve a validated filename inside `root`
///
/// Existing targets are canonicalized so a symlink cannot lead outside the
/// root directory.
async fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, TftpError> {
    let root = tokio::fs::canonicalize(root).await.map_err(|e| {
        tracing::error!("Root directory {} is unusable: {}", root.display(), e);
        TftpError::new(TftpErrorCode::AccessViolation, "Server root directory unavailable")
    })?;
    let requested = root.join(filename);

    match tokio::fs::canonicalize(&requested).await {
        Ok(canonical) if canonical.starts_with(&root) => Ok(canonical),
        Ok(_) => Err(TftpError::new(
            TftpErrorCode::AccessViolation,
            "Path traversal attempt detected",
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(requested),
        Err(e) => Err(TftpError::with_default_message(io_error_code(&e, false))),
    }
}

async fn open_for_read(path: &Path) -> Result<File, TftpError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| TftpError::with_default_message(io_error_code(&e, false)))?;
    if !metadata.is_file() {
        return Err(TftpError::new(TftpErrorCode::FileNotFound, "Not a regular file"));
    }

    File::open(path)
        .await
        .map_err(|e| TftpError::with_default_message(io_error_code(&e, false)))
}
