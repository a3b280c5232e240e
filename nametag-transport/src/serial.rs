//! Serial line channel to the adapter
//!
//! Owns the serial device. Reads resolve with whatever block of bytes is
//! available (the kernel and `BytesMut` provide coalescing when the
//! consumer lags); writes are flushed immediately. Any OS-level error is
//! wrapped as `TransportError::Port` and is fatal to the adapter session.
//!
//! The channel splits into independent read and write halves so the
//! adapter pump can wait on inbound bytes and drain its outbound queue
//! concurrently. The halves are generic over the byte stream, which lets
//! tests run the full pump over an in-memory duplex pipe.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use crate::error::TransportError;

/// Baud rate of the Bluefruit bridge firmware.
pub const BAUD_RATE: u32 = 115_200;

/// An open adapter serial port.
pub struct SerialLine {
    path: String,
    stream: SerialStream,
}

impl SerialLine {
    /// Open `path` at 115 200 8N1, non-blocking.
    pub fn open(path: &str) -> Result<SerialLine, TransportError> {
        debug!("Opening serial: {path}");
        let stream = tokio_serial::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()?;
        Ok(SerialLine {
            path: path.to_string(),
            stream,
        })
    }

    /// The device path this channel was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Split into independently usable read/write halves.
    pub fn split(
        self,
    ) -> (
        SerialReader<ReadHalf<SerialStream>>,
        SerialWriter<WriteHalf<SerialStream>>,
    ) {
        let (rd, wr) = tokio::io::split(self.stream);
        (SerialReader::new(self.path, rd), SerialWriter::new(wr))
    }
}

/// Read half of the channel.
pub struct SerialReader<R> {
    path: String,
    inner: R,
}

impl<R: AsyncRead + Unpin> SerialReader<R> {
    pub fn new(path: impl Into<String>, inner: R) -> SerialReader<R> {
        SerialReader {
            path: path.into(),
            inner,
        }
    }

    /// Read the next non-empty block of bytes into `buf`.
    ///
    /// Returns the number of bytes appended. End-of-file counts as a port
    /// error: the device vanished.
    pub async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        let n = self.inner.read_buf(buf).await?;
        if n == 0 {
            return Err(TransportError::Port(format!("{}: closed", self.path)));
        }
        Ok(n)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Write half of the channel.
pub struct SerialWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> SerialWriter<W> {
    pub fn new(inner: W) -> SerialWriter<W> {
        SerialWriter { inner }
    }

    /// Write `data` and flush.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
