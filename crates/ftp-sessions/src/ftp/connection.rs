//! TCP transport: establishes the control connection.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::types::{FtpResponse, ServerIdentity};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Open the control connection and return the codec plus the welcome banner.
///
/// Failures here are transport-level so the caller's retry loop can decide
/// whether to try again.
pub async fn connect(identity: &ServerIdentity) -> FtpResult<(FtpCodec, FtpResponse)> {
    let addr = identity.address();
    let dur = Duration::from_secs(identity.connect_timeout_sec);

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {}", addr)))?
        .map_err(|e| FtpError::transport(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();

    let mut codec = FtpCodec::new(tcp, Duration::from_secs(identity.read_timeout_sec));
    let banner = codec.read_response().await?;
    if !banner.is_completion() {
        // 421 here is a busy server; keep it transient.
        return Err(FtpError::from_reply(banner.code, &banner.text()));
    }
    Ok((codec, banner))
}
