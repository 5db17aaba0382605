use std::fmt;
use std::time::Duration;

use anyhow::bail;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::http::response::{Body, Response};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Bodies up to this size are sent in the same write as the head.
pub const DEFAULT_STREAM_THRESHOLD: u64 = 64 * 1024;

const COPY_CHUNK: usize = 64 * 1024;

/// The peer accepted no bytes for a whole write timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStalled;

impl fmt::Display for WriteStalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("peer stopped reading")
    }
}

impl std::error::Error for WriteStalled {}

fn serialize_head(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in &resp.headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

/// Writes one response: head first, then the body unless suppressed (HEAD).
pub struct ResponseWriter {
    head: Vec<u8>,
    body: Body,
    send_body: bool,
    stream_threshold: u64,
    write_timeout: Option<Duration>,
}

impl ResponseWriter {
    pub fn new(response: Response, send_body: bool) -> Self {
        let head = serialize_head(&response);
        Self {
            head,
            body: response.body,
            send_body,
            stream_threshold: DEFAULT_STREAM_THRESHOLD,
            write_timeout: None,
        }
    }

    pub fn with_stream_threshold(mut self, threshold: u64) -> Self {
        self.stream_threshold = threshold;
        self
    }

    /// Fails with [`WriteStalled`] when a single write or flush makes no
    /// progress for `limit`. Slow readers are fine as long as they keep
    /// draining.
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = Some(limit);
        self
    }

    /// Writes the response and returns the number of body bytes sent.
    ///
    /// A file that yields fewer bytes than its advertised length is an error;
    /// the caller must then drop the connection since the framing is broken.
    /// So is a stalled peer, see [`ResponseWriter::with_write_timeout`].
    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let threshold = self.stream_threshold;
        let limit = self.write_timeout;
        let send_body = self.send_body && !self.body.is_empty();
        let mut out = std::mem::take(&mut self.head);

        let sent = match &mut self.body {
            _ if !send_body => {
                write_buffer(stream, &out, limit).await?;
                0
            }

            Body::Bytes(bytes) => {
                out.extend_from_slice(bytes);
                write_buffer(stream, &out, limit).await?;
                bytes.len() as u64
            }

            Body::File { file, len } if *len <= threshold => {
                let expected = *len;
                let start = out.len();
                (&mut *file).take(expected).read_to_end(&mut out).await?;
                let read = (out.len() - start) as u64;
                if read != expected {
                    bail!("file shrank while reading: expected {expected} bytes, got {read}");
                }
                write_buffer(stream, &out, limit).await?;
                read
            }

            Body::File { file, len } => {
                let expected = *len;
                write_buffer(stream, &out, limit).await?;
                let mut reader = (&mut *file).take(expected);
                let mut chunk = vec![0u8; COPY_CHUNK];
                let mut copied = 0u64;
                loop {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    write_buffer(stream, &chunk[..n], limit).await?;
                    copied += n as u64;
                }
                if copied != expected {
                    bail!("file shrank while streaming: expected {expected} bytes, sent {copied}");
                }
                copied
            }
        };

        match limit {
            Some(limit) => timeout(limit, stream.flush())
                .await
                .map_err(|_| WriteStalled)??,
            None => stream.flush().await?,
        }
        Ok(sent)
    }
}

async fn write_buffer<W>(
    stream: &mut W,
    buffer: &[u8],
    limit: Option<Duration>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < buffer.len() {
        let pending = &buffer[written..];
        let n = match limit {
            Some(limit) => timeout(limit, stream.write(pending))
                .await
                .map_err(|_| WriteStalled)??,
            None => stream.write(pending).await?,
        };

        if n == 0 {
            bail!("connection closed while writing");
        }

        written += n;
    }

    Ok(())
}
