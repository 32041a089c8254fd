//! TFTP Error Simulator
//!
//! A fault-injecting UDP relay for exercising TFTP implementations. Clients
//! are pointed at the simulator instead of the server; every packet is
//! forwarded unchanged unless a queued [`Alteration`] targets it, in which case
//! it can be rewritten, truncated, delayed, duplicated, dropped, or sent from
//! a foreign transfer ID.
//!
//! ```rust,no_run
//! use errsim::{AlterationQueue, SimulatorConfig, spawn_error_simulator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut queue = AlterationQueue::new();
//!     queue.push("c2s:2:drop".parse()?);
//!     queue.push("s2c:3:delay=500,duplicate=100".parse()?);
//!
//!     let simulator = spawn_error_simulator(SimulatorConfig::default(), queue).await?;
//!     println!("relaying on {}", simulator.local_addr());
//!     simulator.shutdown().await
//! }
//! ```

mod alteration;
mod queue;
mod simulator;

pub use alteration::*;
pub use queue::*;
pub use simulator::*;
