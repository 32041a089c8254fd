//! TFTP Client Implementation
//!
//! Each call opens a fresh ephemeral socket (the client's TID), sends the
//! request to the server's well-known port and binds to whichever port the
//! server answers from.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};

use crate::protocol::{Packet, TftpRequest, TransferMode};
use crate::transfer::{Role, TransferConfig, TransferError, TransferSession, TransferSummary, create_ephemeral_socket};

const MAX_RENAMES: u32 = 1000;

/// TFTP Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server (or error simulator) request address
    pub server: SocketAddr,
    pub mode: TransferMode,
    pub transfer_config: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], 6900)),
            mode: TransferMode::Octet,
            transfer_config: TransferConfig::default(),
        }
    }
}

pub struct TftpClient {
    config: ClientConfig,
}

impl TftpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Client for `server` with default mode and timeouts
    pub fn with_server(server: SocketAddr) -> Self {
        Self::new(ClientConfig {
            server,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Download `remote` into `sink`
    pub async fn read_to<W>(&self, remote: &str, sink: &mut W) -> Result<TransferSummary, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut session = self.open_session(Role::Receiver).await?;
        let request = Packet::ReadRequest(TftpRequest::new(remote, self.config.mode)).encode();
        tracing::info!("RRQ '{}' ({}) to {}", remote, self.config.mode, self.config.server);

        session.receive(sink, request).await
    }

    /// Upload everything `source` yields as `remote`
    pub async fn write_from<R>(&self, source: &mut R, remote: &str) -> Result<TransferSummary, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut session = self.open_session(Role::Sender).await?;
        let request = Packet::WriteRequest(TftpRequest::new(remote, self.config.mode)).encode();
        tracing::info!("WRQ '{}' ({}) to {}", remote, self.config.mode, self.config.server);

        session.send(source, Some(request)).await
    }

    /// Download `remote` into the local file `local`
    ///
    /// An existing file is never overwritten: the download goes to the first
    /// free name of the form `name (N).ext` instead. The file this call
    /// created is removed again if the transfer fails.
    pub async fn read_file(&self, remote: &str, local: impl AsRef<Path>) -> Result<TransferSummary> {
        let (file, local) = create_local_file(local.as_ref())
            .await
            .with_context(|| format!("failed to create {}", local.as_ref().display()))?;

        let mut writer = BufWriter::new(file);
        match self.read_to(remote, &mut writer).await {
            Ok(summary) => {
                tracing::info!("Read '{}' into {} ({} bytes)", remote, local.display(), summary.bytes);
                Ok(summary)
            }
            Err(e) => {
                drop(writer);
                if let Err(remove_err) = tokio::fs::remove_file(&local).await {
                    tracing::warn!("Failed to remove partial file {}: {}", local.display(), remove_err);
                }
                Err(e).with_context(|| format!("reading '{}' from {}", remote, self.config.server))
            }
        }
    }

    /// Upload the local file `local` as `remote`
    pub async fn write_file(&self, local: impl AsRef<Path>, remote: &str) -> Result<TransferSummary> {
        let local = local.as_ref();
        let file = File::open(local)
            .await
            .with_context(|| format!("failed to open {}", local.display()))?;

        let mut reader = BufReader::new(file);
        let summary = self
            .write_from(&mut reader, remote)
            .await
            .with_context(|| format!("writing '{}' to {}", remote, self.config.server))?;

        tracing::info!("Wrote {} as '{}' ({} bytes)", local.display(), remote, summary.bytes);
        Ok(summary)
    }

    async fn open_session(&self, role: Role) -> Result<TransferSession, TransferError> {
        let socket = create_ephemeral_socket(self.config.server, self.config.transfer_config.local_bind).await?;
        Ok(TransferSession::requesting(
            socket,
            self.config.server,
            role,
            self.config.mode,
            self.config.transfer_config.clone(),
        ))
    }
}

/// Create `path`, or the first numbered sibling of it that does not exist yet
async fn create_local_file(path: &Path) -> io::Result<(File, PathBuf)> {
    let mut candidate = path.to_path_buf();
    for n in 1..=MAX_RENAMES {
        match OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(file) => {
                if n > 1 {
                    tracing::info!("{} exists, saving as {}", path.display(), candidate.display());
                }
                return Ok((file, candidate));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => candidate = numbered_path(path, n),
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {} after {} attempts", path.display(), MAX_RENAMES),
    ))
}

/// `dir/boot.img` -> `dir/boot (n).img`
fn numbered_path(path: &Path, n: u32) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::protocol::{TftpData, TftpErrorCode, build_ack, build_data};

    fn quick_client(server: SocketAddr) -> TftpClient {
        TftpClient::new(ClientConfig {
            server,
            mode: TransferMode::Octet,
            transfer_config: TransferConfig {
                timeout: Duration::from_millis(150),
                request_retries: 2,
                max_retries: 2,
                local_bind: Some(IpAddr::from([127, 0, 0, 1])),
            },
        })
    }

    async fn recv_packet(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; 1500];
        let (len, src) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("no packet within 5s")
            .unwrap();
        (Packet::decode(&buf[..len]).unwrap(), src)
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server, "127.0.0.1:6900".parse().unwrap());
        assert_eq!(config.mode, TransferMode::Octet);
    }

    #[tokio::test]
    async fn test_read_to_binds_server_tid() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = quick_client(listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            let mut sink = Vec::new();
            let summary = client.read_to("greeting.txt", &mut sink).await;
            (summary, sink)
        });

        let (request, client_addr) = recv_packet(&listener).await;
        assert_eq!(
            request,
            Packet::ReadRequest(TftpRequest::new("greeting.txt", TransferMode::Octet))
        );

        transfer.send_to(&build_data(1, b"hi there"), client_addr).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));

        let (summary, sink) = task.await.unwrap();
        assert_eq!(summary.unwrap(), TransferSummary { blocks: 1, bytes: 8 });
        assert_eq!(sink, b"hi there");
    }

    #[tokio::test]
    async fn test_write_from_waits_for_ack_zero() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = quick_client(listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            let mut source: &[u8] = b"upload me";
            client.write_from(&mut source, "up.txt").await
        });

        let (request, client_addr) = recv_packet(&listener).await;
        assert!(matches!(request, Packet::WriteRequest(ref r) if r.filename == "up.txt"));

        transfer.send_to(&build_ack(0), client_addr).await.unwrap();
        let (data, _) = recv_packet(&transfer).await;
        assert_eq!(data, Packet::Data(TftpData::new(1, b"upload me".to_vec())));
        transfer.send_to(&build_ack(1), client_addr).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap().bytes, 9);
    }

    #[tokio::test]
    async fn test_failed_read_removes_local_file() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = quick_client(listener.local_addr().unwrap());
        let temp_dir = tempdir().unwrap();
        let local = temp_dir.path().join("missing.bin");

        let target = local.clone();
        let task = tokio::spawn(async move { client.read_file("missing.bin", &target).await });

        let (_, client_addr) = recv_packet(&listener).await;
        let reply = Packet::error(TftpErrorCode::FileNotFound).encode();
        listener.send_to(&reply, client_addr).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        let transfer_err = err.downcast_ref::<TransferError>().unwrap();
        assert!(matches!(
            transfer_err,
            TransferError::Peer {
                code: TftpErrorCode::FileNotFound,
                ..
            }
        ));
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_failed_read_keeps_existing_local_file() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = quick_client(listener.local_addr().unwrap());
        let temp_dir = tempdir().unwrap();
        let important = temp_dir.path().join("important.txt");
        std::fs::write(&important, b"precious user data").unwrap();

        let target = important.clone();
        let task = tokio::spawn(async move { client.read_file("absent.txt", &target).await });

        let (_, client_addr) = recv_packet(&listener).await;
        let reply = Packet::error(TftpErrorCode::FileNotFound).encode();
        listener.send_to(&reply, client_addr).await.unwrap();

        assert!(task.await.unwrap().is_err());
        assert_eq!(std::fs::read(&important).unwrap(), b"precious user data");
        assert!(!temp_dir.path().join("important (1).txt").exists());
    }

    #[tokio::test]
    async fn test_read_into_existing_path_uses_numbered_name() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transfer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = quick_client(listener.local_addr().unwrap());
        let temp_dir = tempdir().unwrap();
        let local = temp_dir.path().join("greeting.txt");
        std::fs::write(&local, b"old").unwrap();
        std::fs::write(temp_dir.path().join("greeting (1).txt"), b"older").unwrap();

        let target = local.clone();
        let task = tokio::spawn(async move { client.read_file("greeting.txt", &target).await });

        let (_, client_addr) = recv_packet(&listener).await;
        transfer.send_to(&build_data(1, b"hi there"), client_addr).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));

        assert_eq!(task.await.unwrap().unwrap().bytes, 8);
        assert_eq!(std::fs::read(&local).unwrap(), b"old");
        assert_eq!(std::fs::read(temp_dir.path().join("greeting (1).txt")).unwrap(), b"older");
        assert_eq!(std::fs::read(temp_dir.path().join("greeting (2).txt")).unwrap(), b"hi there");
    }

    #[test]
    fn test_numbered_path() {
        assert_eq!(numbered_path(Path::new("dir/boot.img"), 3), PathBuf::from("dir/boot (3).img"));
        assert_eq!(numbered_path(Path::new("README"), 1), PathBuf::from("README (1)"));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = quick_client(silent.local_addr().unwrap());

        let mut sink = Vec::new();
        let err = client.read_to("anything", &mut sink).await.unwrap_err();
        assert!(err.is_timeout());

        // The request was retransmitted once before giving up.
        for _ in 0..2 {
            assert!(matches!(recv_packet(&silent).await.0, Packet::ReadRequest(_)));
        }
    }
}
