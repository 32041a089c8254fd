//! TFTP (Trivial File Transfer Protocol) Implementation
//!
//! This crate provides an RFC 1350 TFTP client and concurrent server:
//! - Read (RRQ) and write (WRQ) requests
//! - Binary (octet) and text (netascii) transfer modes
//! - Stop-and-wait delivery with timeout retransmission and duplicate suppression
//! - Transfer ID (TID) binding, answering strangers with ERROR(5)
//! - Path confinement to the server's root directory
//! - One task per transfer, each on its own ephemeral port
//!
//! # Protocol Organization
//!
//! - [`Packet`] - The five wire packets, with [`Packet::encode`] and [`Packet::decode`]
//! - [`TftpOpcode`] - TFTP opcodes
//! - [`TftpErrorCode`] - Standard error codes with default messages
//! - [`TransferMode`] - Transfer modes (octet/netascii)
//! - [`TransferSession`] - The DATA/ACK state machine shared by client and server
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use tftp::{run_tftp_server, spawn_tftp_server, TftpServerConfig};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Run in the foreground
//!     run_tftp_server("0.0.0.0:6900".to_string(), PathBuf::from("./server_files"), None).await?;
//!
//!     // Or in the background, with a graceful shutdown
//!     let handle = spawn_tftp_server(TftpServerConfig::default()).await?;
//!     println!("listening on {}", handle.local_addr());
//!     handle.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Basic Client Usage
//!
//! ```rust,no_run
//! use tftp::{ClientConfig, TftpClient, TransferMode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = TftpClient::new(ClientConfig {
//!         mode: TransferMode::NetAscii,
//!         ..Default::default()
//!     });
//!     client.read_file("notes.txt", "./notes.txt").await?;
//!     client.write_file("./report.txt", "report.txt").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Working with Packets
//!
//! ```rust
//! use tftp::{Packet, TftpErrorCode, TftpOpcode};
//!
//! let ack = Packet::Ack(65535).encode();
//! assert_eq!(ack, [0, 4, 0xff, 0xff]);
//! assert_eq!(Packet::decode(&ack).unwrap().opcode(), TftpOpcode::Acknowledgment);
//!
//! let error = Packet::error(TftpErrorCode::FileNotFound);
//! assert_eq!(Packet::decode(&error.encode()).unwrap(), error);
//! ```

mod client;
mod protocol;
mod server;
mod transfer;

pub use client::*;
pub use protocol::*;
pub use server::*;
pub use transfer::*;
