//! # ftp-sessions
//!
//! Session core for browsing and transferring files on FTP servers:
//!   • Registry of live server sessions with an observable server list
//!   • Per-direction FIFO transfer queues with cooperative cancellation
//!   • Throttled progress, stall watchdog and bounded transfer history
//!   • Atomic directory navigation (change + list, or nothing)
//!   • RFC 959 client with bounded retry for connect and list
//!   • In-memory backend for driving all of the above without a network

pub mod ftp;

pub use ftp::*;
