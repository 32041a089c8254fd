//! TFTP File Transfer Logic
//!
//! This module holds the stop-and-wait state machine shared by the client and
//! the server. A [`TransferSession`] owns one UDP socket and moves a byte
//! stream across it one DATA/ACK pair at a time, retransmitting on timeout,
//! suppressing duplicates and binding the peer's transfer ID (TID) on the
//! first response.

use std::io::{self, Cursor, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use crate::protocol::{
    BLOCK_SIZE, NetasciiDecoder, Packet, TftpErrorCode, TransferMode, build_ack, build_data, build_error,
    convert_to_netascii, is_stale_block,
};

const TIMEOUT_MILLIS: u64 = 1500;
const MAX_RETRIES: usize = 10;
const RECV_BUFFER_SIZE: usize = 1500; // MTU size buffer

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long to wait for a response before retransmitting
    pub timeout: Duration,
    /// Timeouts tolerated while waiting for the first response to a request
    pub request_retries: usize,
    /// Timeouts tolerated per block once the peer is bound
    pub max_retries: usize,
    /// Local address for ephemeral transfer sockets
    pub local_bind: Option<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(TIMEOUT_MILLIS),
            request_retries: MAX_RETRIES,
            max_retries: MAX_RETRIES,
            local_bind: None,
        }
    }
}

/// Why a transfer session ended without completing
#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer stopped answering
    #[error("transfer timed out after {attempts} attempts")]
    Timeout { attempts: usize },

    /// The peer sent an ERROR packet
    #[error("peer reported {code}: {message}")]
    Peer { code: TftpErrorCode, message: String },

    /// The peer broke the protocol; an ERROR(4) was sent back
    #[error("illegal TFTP operation: {0}")]
    Protocol(String),

    /// Reading or writing the local stream failed; an ERROR was sent back
    #[error("local stream failure ({code}): {source}")]
    Local {
        code: TftpErrorCode,
        #[source]
        source: io::Error,
    },

    /// Socket failure, not retried
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Which side of the DATA/ACK exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestSent,
    Transferring,
    Completed,
    Failed,
}

/// Totals reported by a completed transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// DATA packets delivered, including a trailing empty one
    pub blocks: u64,
    /// Payload bytes as carried on the wire
    pub bytes: u64,
}

enum Incoming {
    Packet(Packet),
    TimedOut,
}

/// A single RRQ/WRQ transfer, run by exactly one task
pub struct TransferSession {
    socket: UdpSocket,
    peer: SocketAddr,
    bound: bool,
    role: Role,
    mode: TransferMode,
    block: u16,
    state: SessionState,
    config: TransferConfig,
    recv_buf: Vec<u8>,
}

impl TransferSession {
    /// Session for a request that has already been accepted (server side)
    ///
    /// The peer's address and TID are known from the request itself.
    pub fn accepted(
        socket: UdpSocket,
        peer: SocketAddr,
        role: Role,
        mode: TransferMode,
        config: TransferConfig,
    ) -> Self {
        let mut session = Self::new(socket, peer, role, mode, config);
        session.bound = true;
        session
    }

    /// Session that will send a request to `server` (client side)
    ///
    /// The peer TID is bound to the source port of the first response that
    /// comes from the server's host.
    pub fn requesting(
        socket: UdpSocket,
        server: SocketAddr,
        role: Role,
        mode: TransferMode,
        config: TransferConfig,
    ) -> Self {
        Self::new(socket, server, role, mode, config)
    }

    fn new(socket: UdpSocket, peer: SocketAddr, role: Role, mode: TransferMode, config: TransferConfig) -> Self {
        Self {
            socket,
            peer,
            bound: false,
            role,
            mode,
            block: 1,
            state: SessionState::Idle,
            config,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The peer address, including its TID once bound
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next block expected (receiver) or to be sent (sender)
    pub fn next_block(&self) -> u16 {
        self.block
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the receiving side of a transfer
    ///
    /// `opening` is the packet that starts the exchange: the RRQ on a client,
    /// ACK(0) on a server answering a WRQ. It is also what gets retransmitted
    /// until the first DATA arrives.
    pub async fn receive<W>(&mut self, sink: &mut W, opening: Vec<u8>) -> Result<TransferSummary, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut summary = TransferSummary::default();
        let mut decoder = NetasciiDecoder::new();
        let mut last_sent = opening;
        let mut attempts = 0;

        self.send_to_peer(&last_sent).await?;
        let mut deadline = self.next_deadline();
        self.state = if self.bound {
            SessionState::Transferring
        } else {
            SessionState::RequestSent
        };

        loop {
            match self.next_packet(deadline).await? {
                Incoming::TimedOut => {
                    attempts += 1;
                    if attempts >= self.retry_budget() {
                        return Err(self.fail(TransferError::Timeout { attempts }));
                    }
                    tracing::debug!("Timeout waiting for DATA #{}, resending last packet", self.block);
                    self.send_to_peer(&last_sent).await?;
                    deadline = self.next_deadline();
                }
                Incoming::Packet(Packet::Data(data)) if data.block == self.block => {
                    let decoded;
                    let chunk: &[u8] = match self.mode {
                        TransferMode::Octet => &data.data,
                        TransferMode::NetAscii => {
                            decoded = decoder.feed(&data.data);
                            &decoded
                        }
                    };
                    let mut written = sink.write_all(chunk).await;
                    if written.is_ok() && data.is_last_block() {
                        // Everything must be on disk before the final ACK goes out.
                        written = match sink.write_all(&decoder.finish()).await {
                            Ok(()) => sink.flush().await,
                            Err(e) => Err(e),
                        };
                    }
                    if let Err(e) = written {
                        return Err(self.local_failure(io_error_code(&e, true), e).await);
                    }

                    summary.blocks += 1;
                    summary.bytes += data.data.len() as u64;
                    last_sent = build_ack(data.block);
                    self.send_to_peer(&last_sent).await?;
                    self.block = self.block.wrapping_add(1);
                    self.state = SessionState::Transferring;
                    attempts = 0;
                    deadline = self.next_deadline();

                    if data.is_last_block() {
                        self.state = SessionState::Completed;
                        return Ok(summary);
                    }
                }
                Incoming::Packet(Packet::Data(data)) if is_stale_block(data.block, self.block) => {
                    // The peer did not see our ACK; repeat it without writing the payload again.
                    tracing::debug!("Duplicate DATA #{} from {}, resending ACK", data.block, self.peer);
                    self.send_to_peer(&last_sent).await?;
                }
                Incoming::Packet(Packet::Data(data)) => {
                    let reason = format!("expected DATA #{}, got #{}", self.block, data.block);
                    return Err(self.violation(reason).await);
                }
                Incoming::Packet(other) => {
                    let reason = format!("expected DATA #{}, got {}", self.block, other.opcode());
                    return Err(self.violation(reason).await);
                }
            }
        }
    }

    /// Run the sending side of a transfer
    ///
    /// With `opening` set (a client WRQ) the request is sent first and must be
    /// acknowledged with ACK(0). A server answering a RRQ passes `None` and
    /// starts with DATA #1.
    pub async fn send<R>(&mut self, source: &mut R, opening: Option<Vec<u8>>) -> Result<TransferSummary, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(request) = opening {
            self.state = SessionState::RequestSent;
            self.await_ack(&request, 0).await?;
        }
        self.state = SessionState::Transferring;

        match self.mode {
            TransferMode::Octet => self.send_blocks(source).await,
            TransferMode::NetAscii => {
                let mut raw = Vec::new();
                if let Err(e) = source.read_to_end(&mut raw).await {
                    return Err(self.local_failure(io_error_code(&e, false), e).await);
                }
                let mut converted = Cursor::new(convert_to_netascii(&raw));
                self.send_blocks(&mut converted).await
            }
        }
    }

    async fn send_blocks<R>(&mut self, source: &mut R) -> Result<TransferSummary, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut summary = TransferSummary::default();
        let mut chunk = vec![0u8; BLOCK_SIZE];

        loop {
            let len = match read_chunk(source, &mut chunk).await {
                Ok(len) => len,
                Err(e) => return Err(self.local_failure(io_error_code(&e, false), e).await),
            };

            // A short (possibly empty) block ends the transfer, so a source that
            // ends on a block boundary is followed by one empty DATA packet.
            let packet = build_data(self.block, &chunk[..len]);
            let block = self.block;
            self.await_ack(&packet, block).await?;

            summary.blocks += 1;
            summary.bytes += len as u64;

            if len < BLOCK_SIZE {
                self.state = SessionState::Completed;
                return Ok(summary);
            }
            self.block = self.block.wrapping_add(1);
        }
    }

    /// Send `packet` until the peer acknowledges `expected`
    async fn await_ack(&mut self, packet: &[u8], expected: u16) -> Result<(), TransferError> {
        let mut attempts = 0;
        self.send_to_peer(packet).await?;
        let mut deadline = self.next_deadline();

        loop {
            match self.next_packet(deadline).await? {
                Incoming::TimedOut => {
                    attempts += 1;
                    if attempts >= self.retry_budget() {
                        return Err(self.fail(TransferError::Timeout { attempts }));
                    }
                    tracing::debug!("Timeout waiting for ACK #{}, retransmitting", expected);
                    self.send_to_peer(packet).await?;
                    deadline = self.next_deadline();
                }
                Incoming::Packet(Packet::Ack(block)) if block == expected => return Ok(()),
                Incoming::Packet(Packet::Ack(block)) if is_stale_block(block, expected) => {
                    tracing::debug!("Discarding stale ACK #{} (waiting for #{})", block, expected);
                }
                Incoming::Packet(Packet::Ack(block)) => {
                    let reason = format!("expected ACK #{}, got #{}", expected, block);
                    return Err(self.violation(reason).await);
                }
                Incoming::Packet(other) => {
                    let reason = format!("expected ACK #{}, got {}", expected, other.opcode());
                    return Err(self.violation(reason).await);
                }
            }
        }
    }

    /// Wait until `deadline` for the next packet from the bound peer
    ///
    /// Packets from any other TID are answered with ERROR(5) and otherwise
    /// ignored. ERROR(5) from the peer is logged and ignored; any other ERROR
    /// packet ends the session.
    async fn next_packet(&mut self, deadline: Instant) -> Result<Incoming, TransferError> {
        loop {
            let (len, src) = match timeout_at(deadline, self.socket.recv_from(&mut self.recv_buf)).await {
                Err(_) => return Ok(Incoming::TimedOut),
                Ok(Ok(received)) => received,
                Ok(Err(e)) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                    tracing::debug!("Ignoring ICMP-induced receive error: {}", e);
                    continue;
                }
                Ok(Err(e)) => return Err(self.fail(e.into())),
            };

            if !self.accept_source(src) {
                tracing::warn!("Packet from unknown transfer ID {} (peer is {})", src, self.peer);
                self.send_error_to(src, TftpErrorCode::UnknownTransferId, "Unknown transfer ID")
                    .await;
                continue;
            }

            let packet = match Packet::decode(&self.recv_buf[..len]) {
                Ok(packet) => packet,
                Err(e) => return Err(self.violation(e.to_string()).await),
            };
            tracing::debug!("Received {} from {}", packet, src);

            match packet {
                Packet::Error(err) if err.code == TftpErrorCode::UnknownTransferId => {
                    tracing::warn!("Peer {} reported unknown transfer ID: {}", src, err.message);
                }
                Packet::Error(err) => {
                    return Err(self.fail(TransferError::Peer {
                        code: err.code,
                        message: err.message,
                    }));
                }
                packet => return Ok(Incoming::Packet(packet)),
            }
        }
    }

    fn accept_source(&mut self, src: SocketAddr) -> bool {
        if self.bound {
            return src == self.peer;
        }
        if src.ip() != self.peer.ip() {
            return false;
        }
        tracing::debug!("Bound peer TID {} (request went to {})", src.port(), self.peer);
        self.peer = src;
        self.bound = true;
        true
    }

    /// Stale and duplicate packets do not push the retransmission deadline back.
    fn next_deadline(&self) -> Instant {
        Instant::now() + self.config.timeout
    }

    fn retry_budget(&self) -> usize {
        if self.bound {
            self.config.max_retries
        } else {
            self.config.request_retries
        }
    }

    async fn send_to_peer(&mut self, packet: &[u8]) -> Result<(), TransferError> {
        if let Err(e) = self.socket.send_to(packet, self.peer).await {
            return Err(self.fail(e.into()));
        }
        tracing::debug!("Sent {} bytes to {}", packet.len(), self.peer);
        Ok(())
    }

    /// Best-effort ERROR packet; failures are only logged
    async fn send_error_to(&self, to: SocketAddr, code: TftpErrorCode, message: &str) {
        if let Err(e) = self.socket.send_to(&build_error(code.as_u16(), message), to).await {
            tracing::warn!("Failed to send {} to {}: {}", code, to, e);
        }
    }

    async fn violation(&mut self, reason: String) -> TransferError {
        tracing::warn!("Illegal TFTP operation from {}: {}", self.peer, reason);
        self.send_error_to(self.peer, TftpErrorCode::IllegalOperation, &reason).await;
        self.fail(TransferError::Protocol(reason))
    }

    async fn local_failure(&mut self, code: TftpErrorCode, source: io::Error) -> TransferError {
        self.send_error_to(self.peer, code, code.default_message()).await;
        self.fail(TransferError::Local { code, source })
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        tracing::debug!("{:?} session with {} failed: {}", self.role, self.peer, err);
        self.state = SessionState::Failed;
        err
    }
}

/// Fill `buf` from `source`, stopping early only at end of stream
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Map a local file or stream failure onto the TFTP error code sent to the peer
pub fn io_error_code(err: &io::Error, writing: bool) -> TftpErrorCode {
    match err.kind() {
        ErrorKind::PermissionDenied => TftpErrorCode::AccessViolation,
        ErrorKind::NotFound if !writing => TftpErrorCode::FileNotFound,
        ErrorKind::AlreadyExists => TftpErrorCode::FileAlreadyExists,
        _ if writing => TftpErrorCode::DiskFull,
        _ => TftpErrorCode::NotDefined,
    }
}

/// Create an ephemeral UDP socket appropriate for the peer address family
pub async fn create_ephemeral_socket(peer: SocketAddr, local_bind: Option<IpAddr>) -> io::Result<UdpSocket> {
    let bind_addr = match (local_bind, peer) {
        (Some(ip), _) => SocketAddr::new(ip, 0),
        (None, SocketAddr::V4(_)) => SocketAddr::from(([0, 0, 0, 0], 0)),
        (None, SocketAddr::V6(_)) => SocketAddr::from(([0u16; 8], 0)),
    };

    let sock = UdpSocket::bind(bind_addr).await?;
    tracing::debug!("Transfer socket bound to {}", sock.local_addr()?);
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;
    use crate::protocol::{TftpData, TftpError};

    fn test_config() -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(200),
            request_retries: 3,
            max_retries: 3,
            local_bind: None,
        }
    }

    async fn loopback() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv_packet(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (len, src) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("no packet within 5s")
            .unwrap();
        (Packet::decode(&buf[..len]).unwrap(), src)
    }

    async fn receiver(peer: &UdpSocket) -> (TransferSession, SocketAddr) {
        let socket = loopback().await;
        let addr = socket.local_addr().unwrap();
        let session = TransferSession::accepted(
            socket,
            peer.local_addr().unwrap(),
            Role::Receiver,
            TransferMode::Octet,
            test_config(),
        );
        (session, addr)
    }

    struct FullDisk;

    impl AsyncWrite for FullDisk {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.request_retries, 10);
        assert_eq!(config.max_retries, 10);
        assert!(config.local_bind.is_none());
    }

    #[test]
    fn test_io_error_code() {
        let denied = io::Error::from(ErrorKind::PermissionDenied);
        let missing = io::Error::from(ErrorKind::NotFound);
        let other = io::Error::other("boom");

        assert_eq!(io_error_code(&denied, true), TftpErrorCode::AccessViolation);
        assert_eq!(io_error_code(&missing, false), TftpErrorCode::FileNotFound);
        assert_eq!(io_error_code(&other, true), TftpErrorCode::DiskFull);
        assert_eq!(io_error_code(&other, false), TftpErrorCode::NotDefined);
    }

    #[tokio::test]
    async fn test_unknown_tid_is_answered_without_aborting() {
        let peer = loopback().await;
        let rogue = loopback().await;
        let (mut session, session_addr) = receiver(&peer).await;

        let task = tokio::spawn(async move {
            let mut sink = Vec::new();
            let result = session.receive(&mut sink, build_ack(0)).await;
            (result, sink, session)
        });

        assert_eq!(recv_packet(&peer).await, (Packet::Ack(0), session_addr));

        rogue.send_to(&build_data(1, b"intruder"), session_addr).await.unwrap();
        let (reply, _) = recv_packet(&rogue).await;
        assert!(matches!(reply, Packet::Error(TftpError { code: TftpErrorCode::UnknownTransferId, .. })));

        // Block 1 is still the one expected from the real peer.
        peer.send_to(&build_data(1, b"hello"), session_addr).await.unwrap();
        assert_eq!(recv_packet(&peer).await.0, Packet::Ack(1));

        let (result, sink, session) = task.await.unwrap();
        assert_eq!(result.unwrap(), TransferSummary { blocks: 1, bytes: 5 });
        assert_eq!(sink, b"hello");
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_data_is_acked_but_not_written_twice() {
        let peer = loopback().await;
        let (mut session, session_addr) = receiver(&peer).await;

        let task = tokio::spawn(async move {
            let mut sink = Vec::new();
            let result = session.receive(&mut sink, build_ack(0)).await;
            (result, sink)
        });
        recv_packet(&peer).await;

        let first = vec![7u8; BLOCK_SIZE];
        peer.send_to(&build_data(1, &first), session_addr).await.unwrap();
        assert_eq!(recv_packet(&peer).await.0, Packet::Ack(1));

        peer.send_to(&build_data(1, &first), session_addr).await.unwrap();
        assert_eq!(recv_packet(&peer).await.0, Packet::Ack(1));

        peer.send_to(&build_data(2, b"end"), session_addr).await.unwrap();
        assert_eq!(recv_packet(&peer).await.0, Packet::Ack(2));

        let (result, sink) = task.await.unwrap();
        assert_eq!(result.unwrap().blocks, 2);
        assert_eq!(sink.len(), BLOCK_SIZE + 3);
    }

    #[tokio::test]
    async fn test_receiver_block_number_wraps_to_zero() {
        let peer = loopback().await;
        let (mut session, session_addr) = receiver(&peer).await;
        session.block = u16::MAX;

        let task = tokio::spawn(async move {
            let mut sink = Vec::new();
            let result = session.receive(&mut sink, build_ack(u16::MAX - 1)).await;
            (result, session.next_block())
        });
        recv_packet(&peer).await;

        peer.send_to(&build_data(u16::MAX, &[1u8; BLOCK_SIZE]), session_addr)
            .await
            .unwrap();
        assert_eq!(recv_packet(&peer).await.0, Packet::Ack(u16::MAX));

        peer.send_to(&build_data(0, b"wrapped"), session_addr).await.unwrap();
        assert_eq!(recv_packet(&peer).await.0, Packet::Ack(0));

        let (result, next) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(next, 1);
    }

    #[tokio::test]
    async fn test_out_of_sequence_block_is_illegal() {
        let peer = loopback().await;
        let (mut session, session_addr) = receiver(&peer).await;

        let task = tokio::spawn(async move {
            let mut sink = Vec::new();
            let result = session.receive(&mut sink, build_ack(0)).await;
            (result, session.state())
        });
        recv_packet(&peer).await;

        peer.send_to(&build_data(3, b"skip"), session_addr).await.unwrap();
        let (reply, _) = recv_packet(&peer).await;
        assert!(matches!(reply, Packet::Error(TftpError { code: TftpErrorCode::IllegalOperation, .. })));

        let (result, state) = task.await.unwrap();
        assert!(matches!(result, Err(TransferError::Protocol(_))));
        assert_eq!(state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_malformed_packet_is_illegal() {
        let peer = loopback().await;
        let (mut session, session_addr) = receiver(&peer).await;

        let task = tokio::spawn(async move {
            let mut sink = Vec::new();
            session.receive(&mut sink, build_ack(0)).await
        });
        recv_packet(&peer).await;

        peer.send_to(&[0, 9, 0, 1], session_addr).await.unwrap();
        let (reply, _) = recv_packet(&peer).await;
        assert!(matches!(reply, Packet::Error(TftpError { code: TftpErrorCode::IllegalOperation, .. })));
        assert!(matches!(task.await.unwrap(), Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_full_disk_is_reported_to_peer() {
        let peer = loopback().await;
        let (mut session, session_addr) = receiver(&peer).await;

        let task = tokio::spawn(async move { session.receive(&mut FullDisk, build_ack(0)).await });
        recv_packet(&peer).await;

        peer.send_to(&build_data(1, b"data"), session_addr).await.unwrap();
        let (reply, _) = recv_packet(&peer).await;
        assert!(matches!(reply, Packet::Error(TftpError { code: TftpErrorCode::DiskFull, .. })));
        assert!(matches!(
            task.await.unwrap(),
            Err(TransferError::Local {
                code: TftpErrorCode::DiskFull,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_sender_discards_stale_ack() {
        let peer = loopback().await;
        let socket = loopback().await;
        let mut session = TransferSession::accepted(
            socket,
            peer.local_addr().unwrap(),
            Role::Sender,
            TransferMode::Octet,
            test_config(),
        );

        let task = tokio::spawn(async move {
            let mut source: &[u8] = &[3u8; 600];
            session.send(&mut source, None).await
        });

        let (first, session_addr) = recv_packet(&peer).await;
        assert!(matches!(first, Packet::Data(TftpData { block: 1, .. })));

        peer.send_to(&build_ack(0), session_addr).await.unwrap();
        peer.send_to(&build_ack(1), session_addr).await.unwrap();

        let (second, _) = recv_packet(&peer).await;
        assert_eq!(second, Packet::Data(TftpData::new(2, vec![3u8; 88])));
        peer.send_to(&build_ack(2), session_addr).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), TransferSummary { blocks: 2, bytes: 600 });
    }

    #[tokio::test]
    async fn test_exact_block_multiple_ends_with_empty_data() {
        let peer = loopback().await;
        let socket = loopback().await;
        let mut session = TransferSession::accepted(
            socket,
            peer.local_addr().unwrap(),
            Role::Sender,
            TransferMode::Octet,
            test_config(),
        );

        let task = tokio::spawn(async move {
            let mut source: &[u8] = &[1u8; BLOCK_SIZE];
            session.send(&mut source, None).await
        });

        let (first, session_addr) = recv_packet(&peer).await;
        assert!(matches!(first, Packet::Data(ref d) if d.block == 1 && d.data.len() == BLOCK_SIZE));
        peer.send_to(&build_ack(1), session_addr).await.unwrap();

        let (second, _) = recv_packet(&peer).await;
        assert_eq!(second, Packet::Data(TftpData::new(2, Vec::new())));
        peer.send_to(&build_ack(2), session_addr).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap().blocks, 2);
    }

    #[tokio::test]
    async fn test_sender_times_out_after_retry_budget() {
        let peer = loopback().await;
        let socket = loopback().await;
        let mut session = TransferSession::accepted(
            socket,
            peer.local_addr().unwrap(),
            Role::Sender,
            TransferMode::Octet,
            test_config(),
        );

        let mut source: &[u8] = b"nobody listens";
        let result = session.send(&mut source, None).await;
        assert!(matches!(result, Err(TransferError::Timeout { attempts: 3 })));
        assert_eq!(session.state(), SessionState::Failed);

        // One original transmission plus two retransmissions.
        for _ in 0..3 {
            let (packet, _) = recv_packet(&peer).await;
            assert!(matches!(packet, Packet::Data(TftpData { block: 1, .. })));
        }
    }

    #[tokio::test]
    async fn test_peer_error_aborts_but_code_five_does_not() {
        let peer = loopback().await;
        let socket = loopback().await;
        let mut session = TransferSession::accepted(
            socket,
            peer.local_addr().unwrap(),
            Role::Sender,
            TransferMode::Octet,
            test_config(),
        );

        let task = tokio::spawn(async move {
            let mut source: &[u8] = b"payload";
            session.send(&mut source, None).await
        });

        let (_, session_addr) = recv_packet(&peer).await;
        let tid = Packet::error(TftpErrorCode::UnknownTransferId).encode();
        peer.send_to(&tid, session_addr).await.unwrap();
        let fatal = Packet::error(TftpErrorCode::AccessViolation).encode();
        peer.send_to(&fatal, session_addr).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(TransferError::Peer {
                code: TftpErrorCode::AccessViolation,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_requesting_session_binds_first_responder_tid() {
        let listener = loopback().await;
        let transfer = loopback().await;
        let socket = loopback().await;
        let mut session = TransferSession::requesting(
            socket,
            listener.local_addr().unwrap(),
            Role::Receiver,
            TransferMode::NetAscii,
            test_config(),
        );
        let request = Packet::ReadRequest(crate::protocol::TftpRequest::new("f.txt", TransferMode::NetAscii)).encode();

        let task = tokio::spawn(async move {
            let mut sink = Vec::new();
            let result = session.receive(&mut sink, request).await;
            (result, sink, session.peer())
        });

        let (rrq, client_addr) = recv_packet(&listener).await;
        assert!(matches!(rrq, Packet::ReadRequest(_)));

        transfer.send_to(&build_data(1, b"a\r\nb\r\0"), client_addr).await.unwrap();
        assert_eq!(recv_packet(&transfer).await.0, Packet::Ack(1));

        let (result, sink, peer) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(sink, b"a\nb\r");
        assert_eq!(peer, transfer.local_addr().unwrap());
    }
}
