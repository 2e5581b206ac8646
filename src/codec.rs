//! Encoding and decoding of the disguise protocol.
//!
//! Requests go out as inline commands; the responder also understands RESP
//! multibulk arrays so that ordinary key-value clients can talk to it.
use std::io::{self, ErrorKind};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::{
    error::Tunnel,
    protocol::{MAX_ARGS, MAX_LINE_LEN},
};

/// A reply from the responder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Reply {
    /// `+<text>`
    Simple(String),
    /// `-<text>`
    Error(String),
    /// `$<len>\r\n<data>` or, for `None`, `$-1`.
    Bulk(Option<Vec<u8>>),
}

impl Reply {
    pub(crate) fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub(crate) fn error(msg: impl Into<String>) -> Self {
        Reply::Error(format!("ERR {}", msg.into()))
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
            }
            Reply::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
            }
            Reply::Bulk(Some(data)) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
            }
            Reply::Bulk(None) => out.extend_from_slice(b"$-1"),
        }
        out.extend_from_slice(b"\r\n");
    }

    /// A short rendering for error messages and logs.
    pub(crate) fn describe(&self) -> String {
        match self {
            Reply::Simple(s) => s.clone(),
            Reply::Error(s) => format!("-{}", s),
            Reply::Bulk(Some(data)) => format!("${}", data.len()),
            Reply::Bulk(None) => "$-1".to_string(),
        }
    }
}

/// Appends an inline command. An empty argument is written as `""`.
pub(crate) fn encode_inline(args: &[&[u8]], out: &mut Vec<u8>) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        if arg.is_empty() {
            out.extend_from_slice(b"\"\"");
        } else {
            out.extend_from_slice(arg);
        }
    }
    out.extend_from_slice(b"\r\n");
}

/// Reads one line without its terminator into `line`.
///
/// Returns `Ok(false)` on a clean EOF before the first byte.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    loop {
        let (done, used) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return if line.is_empty() {
                    Ok(false)
                } else {
                    Err(ErrorKind::UnexpectedEof.into())
                };
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&buf[..i]);
                    (true, i + 1)
                }
                None => {
                    line.extend_from_slice(buf);
                    (false, buf.len())
                }
            }
        };
        reader.consume(used);
        if line.len() > MAX_LINE_LEN {
            return Err(Tunnel::LineTooLong.into());
        }
        if done {
            break;
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(true)
}

fn malformed(what: &[u8]) -> io::Error {
    Tunnel::MalformedReply(String::from_utf8_lossy(what).into_owned()).into()
}

fn parse_len(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Reads `len` bytes followed by CRLF.
async fn read_bulk<R>(reader: &mut R, len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if len > MAX_LINE_LEN {
        return Err(Tunnel::LineTooLong.into());
    }
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).await?;
    if &data[len..] != b"\r\n" {
        return Err(malformed(&data[len..]));
    }
    data.truncate(len);
    Ok(data)
}

/// Reads one command as its raw arguments.
///
/// Returns `Ok(None)` on a clean EOF. Blank lines are skipped. An error means
/// the framing itself is broken and the rest of the input cannot be trusted;
/// an inline line is always a complete command, whatever its arguments.
pub(crate) async fn read_command<R>(reader: &mut R) -> io::Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        if !read_line(reader, &mut line).await? {
            return Ok(None);
        }
        if line.first() == Some(&b'*') {
            let count = parse_len(&line[1..])
                .filter(|n| (1..=MAX_ARGS as i64).contains(n))
                .ok_or_else(|| malformed(&line))?;
            let mut args = Vec::with_capacity(count as usize);
            for _ in 0..count {
                read_line(reader, &mut line).await?;
                let len = match line.split_first() {
                    Some((b'$', digits)) => parse_len(digits).filter(|n| *n >= 0),
                    _ => None,
                }
                .ok_or_else(|| malformed(&line))?;
                args.push(read_bulk(reader, len as usize).await?);
            }
            return Ok(Some(args));
        }
        let args = split_inline(&line);
        if !args.is_empty() {
            return Ok(Some(args));
        }
    }
}

fn split_inline(line: &[u8]) -> Vec<Vec<u8>> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            if token == b"\"\"" {
                Vec::new()
            } else {
                token.to_vec()
            }
        })
        .collect()
}

/// Reads one reply.
pub(crate) async fn read_reply<R>(reader: &mut R) -> io::Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if !read_line(reader, &mut line).await? {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    match line.split_first() {
        Some((b'+', text)) => Ok(Reply::Simple(String::from_utf8_lossy(text).trim().to_string())),
        Some((b'-', text)) => Ok(Reply::Error(String::from_utf8_lossy(text).into_owned())),
        Some((b'$', digits)) => match parse_len(digits) {
            Some(-1) => Ok(Reply::Bulk(None)),
            Some(len) if len >= 0 => Ok(Reply::Bulk(Some(read_bulk(reader, len as usize).await?))),
            _ => Err(malformed(&line)),
        },
        _ => Err(malformed(&line)),
    }
}
