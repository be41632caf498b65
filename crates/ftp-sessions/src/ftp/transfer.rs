//! Data-channel setup for listings and file transfers.
//!
//! Supports the two passive modes (RFC 959 + RFC 2428):
//! - **PASV**: server opens a port and reports `h1,h2,h3,h4,p1,p2`
//! - **EPSV**: server reports only a port, the host is the control host

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::types::{host_port, DataChannelMode};
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

lazy_static! {
    static ref PASV_RE: Regex = Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").unwrap();
    static ref EPSV_RE: Regex = Regex::new(r"\|\|\|(\d+)\|").unwrap();
}

/// Negotiate and connect a data channel.
pub async fn open_data_channel(
    codec: &mut FtpCodec,
    mode: DataChannelMode,
    host: &str,
    data_timeout: Duration,
) -> FtpResult<TcpStream> {
    let addr = match mode {
        DataChannelMode::Passive => {
            let resp = codec.expect_ok("PASV").await?;
            parse_pasv_response(&resp.text())?.to_string()
        }
        DataChannelMode::ExtendedPassive => {
            let resp = codec.expect_ok("EPSV").await?;
            let port = parse_epsv_response(&resp.text())?;
            host_port(host, port)
        }
    };

    let tcp = timeout(data_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("Data connect to {}", addr)))?
        .map_err(|e| FtpError::transport(format!("Data connect to {}: {}", addr, e)))?;
    tcp.set_nodelay(true).ok();
    Ok(tcp)
}

/// Parse `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol(format!("Cannot parse PASV: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

/// Parse `229 Entering Extended Passive Mode (|||port|)`.
fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    let caps = EPSV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol(format!("Cannot parse EPSV: {}", text)))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol("EPSV port out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply() {
        let addr = parse_pasv_response("227 Entering Passive Mode (192,168,1,20,19,137)").unwrap();
        assert_eq!(addr, "192.168.1.20:5001".parse::<SocketAddr>().unwrap());
        // Some servers omit the parentheses.
        let bare = parse_pasv_response("227 =127,0,0,1,4,1").unwrap();
        assert_eq!(bare.port(), 1025);
        assert!(parse_pasv_response("227 (300,1,1,1,1,1)").is_err());
        assert!(parse_pasv_response("227 nothing").is_err());
    }

    #[test]
    fn epsv_reply() {
        assert_eq!(
            parse_epsv_response("229 Entering Extended Passive Mode (|||6446|)").unwrap(),
            6446
        );
        assert!(parse_epsv_response("229 (|||99999|)").is_err());
    }
}
