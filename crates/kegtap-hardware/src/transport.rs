//! Byte transports behind a controller.
//!
//! Serial ports are blocking, so reads and writes run on tokio's blocking
//! pool with a short port timeout. Sockets and in-process pipes are plain
//! `AsyncRead`/`AsyncWrite` halves.

use std::io::{Read, Write};
use std::time::Duration;

use kegtap_core::TransportKind;
use kegtap_protocol::WireFormat;
use serialport::SerialPort;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HardwareError, Result};

const READ_CHUNK: usize = 256;

/// Result of one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes arrived.
    Data(Vec<u8>),
    /// Nothing arrived before the timeout.
    Idle,
    /// The peer closed the stream.
    Closed,
}

/// Read half of a transport.
pub enum TransportReader {
    Serial(Option<Box<dyn SerialPort>>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl TransportReader {
    /// Read whatever is available, waiting at most `timeout`.
    pub async fn read(&mut self, timeout: Duration) -> Result<ReadOutcome> {
        match self {
            TransportReader::Serial(slot) => {
                let mut port = slot
                    .take()
                    .ok_or_else(|| HardwareError::disconnected("serial port already closed"))?;
                let (port, result) = tokio::task::spawn_blocking(move || {
                    let mut buf = [0u8; READ_CHUNK];
                    let result = port.read(&mut buf).map(|n| buf[..n].to_vec());
                    (port, result)
                })
                .await
                .map_err(|e| HardwareError::communication(format!("serial reader panicked: {e}")))?;
                *slot = Some(port);

                match result {
                    Ok(bytes) if bytes.is_empty() => Ok(ReadOutcome::Idle),
                    Ok(bytes) => Ok(ReadOutcome::Data(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(ReadOutcome::Idle),
                    Err(e) => Err(e.into()),
                }
            }
            TransportReader::Stream(reader) => {
                let mut buf = [0u8; READ_CHUNK];
                match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                    Err(_) => Ok(ReadOutcome::Idle),
                    Ok(Ok(0)) => Ok(ReadOutcome::Closed),
                    Ok(Ok(n)) => Ok(ReadOutcome::Data(buf[..n].to_vec())),
                    Ok(Err(e)) => Err(e.into()),
                }
            }
        }
    }
}

/// Write half of a transport.
pub enum TransportWriter {
    Serial(Option<Box<dyn SerialPort>>),
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    Closed,
}

impl TransportWriter {
    pub async fn write_all(&mut self, data: Vec<u8>) -> Result<()> {
        match self {
            TransportWriter::Serial(slot) => {
                let mut port = slot
                    .take()
                    .ok_or_else(|| HardwareError::disconnected("serial port already closed"))?;
                let (port, result) = tokio::task::spawn_blocking(move || {
                    let result = port.write_all(&data).and_then(|()| port.flush());
                    (port, result)
                })
                .await
                .map_err(|e| HardwareError::communication(format!("serial writer panicked: {e}")))?;
                *slot = Some(port);
                Ok(result?)
            }
            TransportWriter::Stream(writer) => {
                writer.write_all(&data).await?;
                writer.flush().await?;
                Ok(())
            }
            TransportWriter::Closed => Err(HardwareError::disconnected("transport closed")),
        }
    }

    /// Close the write half. A stream peer observes end-of-file.
    pub async fn close(&mut self) {
        if let TransportWriter::Stream(writer) = self {
            let _ = writer.shutdown().await;
        }
        *self = TransportWriter::Closed;
    }
}

/// An opened device, ready to become a controller.
pub struct Transport {
    pub kind: TransportKind,
    pub device_id: String,
    pub format: WireFormat,
    pub reader: TransportReader,
    pub writer: TransportWriter,
}

impl Transport {
    /// Wrap any async byte stream, such as a TCP socket or an in-process pipe.
    pub fn from_stream<S>(kind: TransportKind, device_id: impl Into<String>, format: WireFormat, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            kind,
            device_id: device_id.into(),
            format,
            reader: TransportReader::Stream(Box::new(reader)),
            writer: TransportWriter::Stream(Box::new(writer)),
        }
    }

    /// Wrap an opened serial port; the write half is a cloned handle.
    pub fn from_serial(device_id: impl Into<String>, port: Box<dyn SerialPort>) -> Result<Self> {
        let writer = port.try_clone()?;
        Ok(Self {
            kind: TransportKind::Serial,
            device_id: device_id.into(),
            format: WireFormat::Binary,
            reader: TransportReader::Serial(Some(port)),
            writer: TransportWriter::Serial(Some(writer)),
        })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_read_write() {
        let (host, mut device) = tokio::io::duplex(64);
        let mut transport =
            Transport::from_stream(TransportKind::Fake, "fake-0", WireFormat::Text, host);

        transport.writer.write_all(b"ping\n".to_vec()).await.unwrap();
        let mut buf = [0u8; 5];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        device.write_all(b"info").await.unwrap();
        let outcome = transport.reader.read(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Data(b"info".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_idle_then_closed() {
        let (host, device) = tokio::io::duplex(64);
        let mut transport =
            Transport::from_stream(TransportKind::Fake, "fake-0", WireFormat::Text, host);

        let outcome = transport.reader.read(Duration::from_millis(250)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Idle);

        drop(device);
        let outcome = transport.reader.read(Duration::from_millis(250)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_writes() {
        let (host, _device) = tokio::io::duplex(64);
        let mut transport =
            Transport::from_stream(TransportKind::Fake, "fake-0", WireFormat::Text, host);
        transport.writer.close().await;
        assert!(matches!(
            transport.writer.write_all(b"x".to_vec()).await,
            Err(HardwareError::Disconnected { .. })
        ));
    }
}
