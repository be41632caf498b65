//! Control-channel codec (RFC 959 §4).
//!
//! Handles:
//! - Sending commands terminated with `\r\n`
//! - Reading single-line and multi-line replies under a read timeout
//! - Parsing the 3-digit reply code

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpResponse;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Command/response codec over the split control connection.
pub struct FtpCodec {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    read_timeout: Duration,
}

impl FtpCodec {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: BufReader::new(rd),
            writer: wr,
            read_timeout,
        }
    }

    /// Send a raw command (CRLF is appended here).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        self.writer.write_all(line.as_bytes()).await?;
        if cmd.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    async fn read_line_raw(&mut self) -> FtpResult<String> {
        let mut buf = String::new();
        let n = timeout(self.read_timeout, self.reader.read_line(&mut buf))
            .await
            .map_err(|_| FtpError::timeout("Control channel read"))??;
        if n == 0 {
            return Err(FtpError::transport("Server closed connection"));
        }
        Ok(buf)
    }

    /// Read a complete reply.
    ///
    /// Multi-line replies look like:
    /// ```text
    /// 211-Features:
    ///  SIZE
    /// 211 End
    /// ```
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let first_trimmed = first.trim_end_matches(|c| c == '\r' || c == '\n');

        let code = parse_code(first_trimmed)?;
        let mut lines = vec![first_trimmed.to_string()];

        if first_trimmed.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let next_trimmed = next.trim_end_matches(|c| c == '\r' || c == '\n');
                lines.push(next_trimmed.to_string());
                if next_trimmed.starts_with(&terminator) {
                    break;
                }
            }
        }

        let resp = FtpResponse { code, lines };
        log::trace!("<<< {}", resp.lines.last().map(String::as_str).unwrap_or(""));
        Ok(resp)
    }

    /// Read one reply with a different timeout than the configured one.
    pub async fn read_response_within(&mut self, limit: Duration) -> FtpResult<FtpResponse> {
        let saved = std::mem::replace(&mut self.read_timeout, limit);
        let resp = self.read_response().await;
        self.read_timeout = saved;
        resp
    }

    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Send a command and require a reply in the given class (first digit).
    pub async fn expect(&mut self, cmd: &str, expected_first_digit: u16) -> FtpResult<FtpResponse> {
        let resp = self.execute(cmd).await?;
        if resp.code / 100 != expected_first_digit {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }

    pub async fn expect_ok(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.expect(cmd, 2).await
    }
}

fn parse_code(line: &str) -> FtpResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| FtpError::protocol(format!("Invalid reply line: '{}'", line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (FtpCodec, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (FtpCodec::new(client, Duration::from_millis(300)), server)
    }

    #[test]
    fn reply_codes() {
        assert_eq!(parse_code("220 ready").unwrap(), 220);
        assert_eq!(parse_code("211-Features").unwrap(), 211);
        assert!(parse_code("hi").is_err());
        assert!(parse_code("abc def").is_err());
    }

    #[tokio::test]
    async fn multi_line_reply() {
        let (mut codec, mut server) = pair().await;
        server
            .write_all(b"211-Features:\r\n SIZE\r\n MLSD\r\n211 End\r\n")
            .await
            .unwrap();
        let resp = codec.read_response().await.unwrap();
        assert_eq!(resp.code, 211);
        assert_eq!(resp.lines.len(), 4);
        assert!(resp.is_completion());
    }

    #[tokio::test]
    async fn execute_sends_crlf_and_checks_class() {
        let (mut codec, mut server) = pair().await;
        let srv = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(b"550 No such file\r\n").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        let err = codec.expect_ok("DELE nope").await.unwrap_err();
        assert_eq!(err.code, Some(550));
        assert_eq!(srv.await.unwrap(), "DELE nope\r\n");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (mut codec, _server) = pair().await;
        let err = codec.read_response().await.unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::Transport);
    }
}
