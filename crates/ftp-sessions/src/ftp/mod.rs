//! # FTP session core
//!
//! Architecture:
//! - `types`: identities, listing entries, job snapshots, events
//! - `error`: categorised error type
//! - `config`: retry, queue and registry tunables
//! - `protocol`: control-channel command/response codec
//! - `connection`: TCP connect and banner
//! - `transfer`: PASV/EPSV data channels
//! - `parser`: MLSD/Unix/Windows listing parser
//! - `client`: `ProtocolClient`/`Connector` seams and the RFC 959 client
//! - `memory`: in-memory server, client and connector
//! - `control`: per-transfer cancellation, progress and stall watchdog
//! - `history`: bounded record of finished transfers
//! - `queue`: per-direction FIFO transfer queue
//! - `navigation`: navigation state machine
//! - `session`: one server connection with its queues
//! - `registry`: sessions keyed by host, eviction, maintenance
//! - `format`: size and timestamp display helpers

pub mod types;
pub mod error;
pub mod config;
pub mod protocol;
pub mod connection;
pub mod transfer;
pub mod parser;
pub mod client;
pub mod memory;
pub mod control;
pub mod history;
pub mod queue;
pub mod navigation;
pub mod session;
pub mod registry;
pub mod format;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use config::{FtpSessionsConfig, RegistryConfig, RetryConfig, TransferQueueConfig};
pub use client::{Connector, FtpClient, FtpConnector, ProtocolClient, SharedClient};
pub use control::TransferControl;
pub use history::TransferHistory;
pub use memory::{MemoryClient, MemoryConnector, MemoryServer, MemorySink};
pub use navigation::NavigationController;
pub use queue::{JobHandle, LocalResource, TransferJob, TransferQueue};
pub use registry::{ConnectionRegistry, EvictionPolicy, IdleTimeout, NeverEvict};
pub use session::ConnectionSession;
pub use format::{format_epoch_millis, format_size, format_timestamp};
