//! FTP control connection

use crate::error::{FtpError, Result};
use crate::reply::{parse_passive, read_reply, Reply};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default limit for connecting, for waiting on a single reply and for a
/// stalled data transfer
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const DATA_CHUNK: usize = 64 * 1024;

/// An open control connection
pub struct FtpStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    timeout: Duration,
    welcome: String,
}

impl FtpStream {
    /// Connect to `addr` (`host:port`) and wait for the greeting.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(addr: &str, limit: Duration) -> Result<Self> {
        let stream = with_timeout(limit, TcpStream::connect(addr)).await??;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let mut ftp = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            timeout: limit,
            welcome: String::new(),
        };

        let mut greeting = ftp.read_reply().await?;
        // 120: service ready in nnn minutes, the real greeting follows
        while greeting.code == 120 {
            greeting = ftp.read_reply().await?;
        }
        let greeting = expect(greeting, &[220])?;
        debug!(peer = %peer, "FTP greeting: {}", greeting.message);
        ftp.welcome = greeting.message;
        Ok(ftp)
    }

    /// Greeting text sent by the server
    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let reply = self.command(&format!("USER {}", user), &[230, 331]).await?;
        if reply.code == 331 {
            self.command(&format!("PASS {}", password), &[230, 202])
                .await?;
        }
        Ok(())
    }

    pub async fn cwd(&mut self, path: &str) -> Result<()> {
        self.command(&format!("CWD {}", path), &[200, 250]).await?;
        Ok(())
    }

    pub async fn mkdir(&mut self, name: &str) -> Result<()> {
        self.command(&format!("MKD {}", name), &[257]).await?;
        Ok(())
    }

    /// Names in `path`, or in the current directory.
    ///
    /// Servers that answer an empty listing with 450/550 yield an empty
    /// list.
    pub async fn nlst(&mut self, path: Option<&str>) -> Result<Vec<String>> {
        self.command("TYPE A", &[200]).await?;
        let mut data = self.open_data_connection().await?;

        let cmd = match path {
            Some(path) => format!("NLST {}", path),
            None => "NLST".to_string(),
        };
        self.send(&cmd).await?;
        let reply = self.read_reply().await?;
        match reply.code {
            125 | 150 => {}
            450 | 550 => {
                debug!(reply = %reply, "Empty listing");
                return Ok(Vec::new());
            }
            _ => return Err(FtpError::UnexpectedReply(reply)),
        }

        let listing = receive_data(&mut data, self.timeout).await?;
        drop(data);
        self.expect_reply(&[226, 250]).await?;

        Ok(String::from_utf8_lossy(&listing)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Upload everything `reader` yields as `name` in the current directory.
    pub async fn put<R>(&mut self, name: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.command("TYPE I", &[200]).await?;
        let mut data = self.open_data_connection().await?;
        self.command(&format!("STOR {}", name), &[125, 150]).await?;

        let copied = send_data(reader, &mut data, self.timeout).await?;
        drop(data);

        self.expect_reply(&[226, 250]).await?;
        debug!(name, bytes = copied, "Stored");
        Ok(copied)
    }

    /// Say goodbye and close the connection.
    pub async fn quit(mut self) -> Result<()> {
        self.command("QUIT", &[221]).await?;
        Ok(())
    }

    async fn open_data_connection(&mut self) -> Result<TcpStream> {
        let reply = self.command("PASV", &[227]).await?;
        let addr = parse_passive(&reply.message)?;

        // Servers behind NAT sometimes announce an unusable address
        let ip = if addr.ip().is_unspecified() {
            self.peer.ip()
        } else {
            IpAddr::V4(*addr.ip())
        };
        let target = SocketAddr::new(ip, addr.port());
        let stream = with_timeout(self.timeout, TcpStream::connect(target)).await??;
        Ok(stream)
    }

    async fn command(&mut self, cmd: &str, expected: &[u16]) -> Result<Reply> {
        self.send(cmd).await?;
        self.expect_reply(expected).await
    }

    async fn send(&mut self, cmd: &str) -> Result<()> {
        if cmd.contains(['\r', '\n']) {
            return Err(FtpError::InvalidArgument(format!(
                "line break in command {:?}",
                cmd
            )));
        }
        if cmd.starts_with("PASS ") {
            debug!("> PASS ****");
        } else {
            debug!("> {}", cmd);
        }
        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn expect_reply(&mut self, expected: &[u16]) -> Result<Reply> {
        let reply = self.read_reply().await?;
        expect(reply, expected)
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let reply = with_timeout(self.timeout, read_reply(&mut self.reader)).await??;
        debug!("< {}", reply);
        Ok(reply)
    }
}

fn expect(reply: Reply, expected: &[u16]) -> Result<Reply> {
    if expected.contains(&reply.code) {
        Ok(reply)
    } else {
        Err(FtpError::UnexpectedReply(reply))
    }
}

/// Copy `reader` into the data connection. Fails with [`FtpError::Timeout`]
/// when the peer accepts nothing for `limit`.
async fn send_data<R>(reader: &mut R, data: &mut TcpStream, limit: Duration) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; DATA_CHUNK];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        with_timeout(limit, data.write_all(&buf[..n])).await??;
        copied += n as u64;
    }
    with_timeout(limit, data.shutdown()).await??;
    Ok(copied)
}

/// Read the data connection to its end, allowing at most `limit` between
/// chunks.
async fn receive_data(data: &mut TcpStream, limit: Duration) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    let mut buf = vec![0u8; DATA_CHUNK];
    loop {
        let n = with_timeout(limit, data.read(&mut buf)).await??;
        if n == 0 {
            return Ok(content);
        }
        content.extend_from_slice(&buf[..n]);
    }
}

async fn with_timeout<F: Future>(limit: Duration, fut: F) -> Result<F::Output> {
    timeout(limit, fut).await.map_err(|_| FtpError::Timeout)
}
