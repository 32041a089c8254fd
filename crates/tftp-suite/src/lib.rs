//! TFTP Suite Library
//!
//! A TFTP (RFC 1350) toolkit made of two crates:
//!
//! - **tftp**: packet codec, stop-and-wait transfer sessions, client and a
//!   concurrent server
//!   - Binary (octet) and text (netascii) transfer modes
//!   - Timeout retransmission and duplicate suppression
//!   - Transfer ID checking with ERROR(5) replies
//!   - Path confinement to the server root
//!
//! - **errsim**: a relay that sits between client and server and injects
//!   faults into chosen packets
//!   - Byte, block number, opcode, mode, filename and size rewrites
//!   - Delay, duplication and loss
//!   - Sending from a foreign transfer ID or address
//!

// Re-export the crates for easier access
pub use {errsim, tftp};
