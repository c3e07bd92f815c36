//! Control connection replies

use crate::error::{FtpError, Result};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// A complete server reply, multi-line replies joined with `\n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Read one reply from the control connection.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let first = read_line(reader).await?;
    let (code, multiline, text) =
        split_status(&first).ok_or_else(|| FtpError::InvalidReply(first.clone()))?;

    let mut message = text.to_string();
    if multiline {
        loop {
            let line = read_line(reader).await?;
            match split_status(&line) {
                Some((c, false, text)) if c == code => {
                    message.push('\n');
                    message.push_str(text);
                    break;
                }
                _ => {
                    message.push('\n');
                    message.push_str(&line);
                }
            }
        }
    }

    Ok(Reply { code, message })
}

async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    // Banners and names are often Latin-1; keep them readable instead of
    // failing the whole reply
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(FtpError::ConnectionClosed);
    }
    Ok(String::from_utf8_lossy(&line)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

/// Split `123-text` / `123 text` into code, continuation flag and text.
fn split_status(line: &str) -> Option<(u16, bool, &str)> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = digits.parse().ok()?;
    match line.as_bytes().get(3) {
        None => Some((code, false, "")),
        Some(b' ') => Some((code, false, &line[4..])),
        Some(b'-') => Some((code, true, &line[4..])),
        Some(_) => None,
    }
}

/// Extract the data address from a `227 Entering Passive Mode
/// (h1,h2,h3,h4,p1,p2)` message.
pub fn parse_passive(message: &str) -> Result<SocketAddrV4> {
    let invalid = || FtpError::InvalidReply(format!("227 {}", message));

    let start = match message.find('(') {
        Some(pos) => pos + 1,
        None => message.find(|c: char| c.is_ascii_digit()).ok_or_else(invalid)?,
    };
    let fields: Vec<u8> = message[start..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .take(6)
        .map(|s| s.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| invalid())?;
    if fields.len() != 6 {
        return Err(invalid());
    }

    let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let port = u16::from(fields[4]) << 8 | u16::from(fields[5]);
    Ok(SocketAddrV4::new(ip, port))
}
