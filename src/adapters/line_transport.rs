//! Delimiter-framed line I/O over an async byte stream.

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

/// Hook for discarding bytes held below the async stream (e.g. UART FIFOs).
pub trait Purge {
    /// Drop pending input and output in the device driver.
    fn purge(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Purge for tokio::io::DuplexStream {}

impl Purge for tokio::net::TcpStream {}

#[cfg(test)]
impl Purge for tokio_test::io::Mock {}

#[cfg(feature = "instrument_serial")]
impl Purge for tokio_serial::SerialStream {
    fn purge(&self) -> std::io::Result<()> {
        use tokio_serial::SerialPort;
        self.clear(tokio_serial::ClearBuffer::All)
            .map_err(std::io::Error::from)
    }
}

/// Line transport over any async stream.
///
/// Defaults match the stage controller: commands end in `\r`, replies end in
/// `\r`.
pub struct LineTransport<S> {
    stream: BufReader<S>,
    /// Bytes of a reply line read so far; survives a cancelled read.
    pending: Vec<u8>,
    terminator: String,
    delimiter: u8,
    label: String,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Purge + Unpin + Send,
{
    /// Wrap a stream. `label` shows up in logs.
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            pending: Vec::with_capacity(64),
            terminator: "\r".to_string(),
            delimiter: b'\r',
            label: label.into(),
        }
    }

    /// Set the string appended to each command.
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Set the byte that ends each reply.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Access the wrapped stream.
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }
}

#[async_trait]
impl<S> Transport for LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Purge + Unpin + Send,
{
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let payload = format!("{}{}", line, self.terminator);
        let stream = self.stream.get_mut();
        stream.write_all(payload.as_bytes()).await?;
        stream.flush().await?;
        debug!(port = %self.label, "-> {}", line);
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        self.stream
            .read_until(self.delimiter, &mut self.pending)
            .await?;

        if self.pending.last() != Some(&self.delimiter) {
            // read_until only stops short of the delimiter at EOF
            return Err(TransportError::Closed);
        }

        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw)
            .trim_matches(|c: char| c.is_ascii_whitespace())
            .to_string();
        debug!(port = %self.label, "<- {}", line);
        Ok(line)
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        let mut dropped = self.pending.len();
        self.pending.clear();

        // Drain whatever is readable right now without waiting for more.
        loop {
            let available = match self.stream.fill_buf().now_or_never() {
                Some(Ok(buf)) => buf.len(),
                Some(Err(e)) => return Err(e.into()),
                None => 0,
            };
            if available == 0 {
                break;
            }
            dropped += available;
            self.stream.consume(available);
        }

        self.stream.get_ref().purge()?;
        trace!(port = %self.label, dropped, "cleared transport buffers");
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
