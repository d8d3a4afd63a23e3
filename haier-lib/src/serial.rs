//! Serial transport: opening ports, reconnecting, and frame-level I/O over
//! any byte stream.

use crate::codec::{DecodeOutcome, FrameCodec};
use crate::config::{ReconnectPolicy, SerialConfig};
use crate::error::HaierError;
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, error, info, warn};

/// A serial port known to the operating system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSummary {
    pub name: String,
    pub kind: String,
}

pub fn list_ports() -> Result<Vec<PortSummary>, HaierError> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| {
            let kind = match port.port_type {
                SerialPortType::UsbPort(usb) => format!(
                    "usb {:04x}:{:04x}{}",
                    usb.vid,
                    usb.pid,
                    usb.product.map(|p| format!(" {p}")).unwrap_or_default()
                ),
                SerialPortType::PciPort => "pci".to_string(),
                SerialPortType::BluetoothPort => "bluetooth".to_string(),
                SerialPortType::Unknown => "unknown".to_string(),
            };
            PortSummary { name: port.port_name, kind }
        })
        .collect())
}

/// Something that can (re)open a byte stream for one direction
pub trait Connect: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn port_name(&self) -> &str;

    fn policy(&self) -> ReconnectPolicy;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Stream, HaierError>> + Send;
}

/// Opens a physical port with `tokio-serial`
#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    /// Validates the configuration; no port is touched yet
    pub fn new(config: SerialConfig) -> Result<Self, HaierError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Connect for SerialConnector {
    type Stream = SerialStream;

    fn port_name(&self) -> &str {
        &self.config.port
    }

    fn policy(&self) -> ReconnectPolicy {
        self.config.reconnect
    }

    async fn connect(&mut self) -> Result<SerialStream, HaierError> {
        debug!(port = %self.config.port, baud = self.config.baud_rate, "Opening serial port");
        let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.tokio_data_bits())
            .stop_bits(self.config.tokio_stop_bits())
            .parity(self.config.tokio_parity())
            .flow_control(self.config.tokio_flow_control())
            .timeout(self.config.read_timeout)
            .open_native_async()
            .map_err(|e| HaierError::Transport {
                port: self.config.port.clone(),
                attempts: 1,
                message: e.to_string(),
            })?;

        #[cfg(unix)]
        let port = {
            let mut port = port;
            port.set_exclusive(false)?;
            port
        };

        info!(port = %self.config.port, "Serial port open");
        Ok(port)
    }
}

/// Hands out one already-open stream, then refuses to reconnect.
///
/// Used for pseudo terminals, sockets and in-memory pipes.
#[derive(Debug)]
pub struct StreamConnector<S> {
    name: String,
    stream: Option<S>,
}

impl<S> StreamConnector<S> {
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        Self {
            name: name.into(),
            stream: Some(stream),
        }
    }
}

impl<S> Connect for StreamConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    fn port_name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: 0,
            ..ReconnectPolicy::default()
        }
    }

    async fn connect(&mut self) -> Result<S, HaierError> {
        self.stream.take().ok_or(HaierError::LinkClosed)
    }
}

/// Connect, retrying with exponential backoff per the connector's policy
pub async fn connect_with_retry<C: Connect>(connector: &mut C) -> Result<C::Stream, HaierError> {
    let policy = connector.policy();
    let attempts = policy.max_retries + 1;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match connector.connect().await {
            Ok(stream) => {
                if attempt > 1 {
                    info!(port = connector.port_name(), attempt, "Reconnected");
                }
                return Ok(stream);
            }
            Err(e) => {
                if attempt < attempts {
                    let delay = policy.backoff(attempt);
                    warn!(
                        port = connector.port_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }
    let message = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
    error!(port = connector.port_name(), attempts, %message, "Giving up on port");
    Err(HaierError::Transport {
        port: connector.port_name().to_string(),
        attempts,
        message,
    })
}

/// Frame-level request/response I/O over one byte stream
#[derive(Debug)]
pub struct FramedLink<S> {
    stream: S,
    buf: BytesMut,
    codec: FrameCodec,
}

impl<S> FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, codec: FrameCodec) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(512),
            codec,
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Encode, write and flush one frame; returns the bytes written
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<Bytes, HaierError> {
        let bytes = self.codec.encode(frame)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        debug!(bytes = hex::encode(&bytes), "Sent frame");
        Ok(bytes)
    }

    /// Read until one frame decodes. Resyncs are logged and skipped.
    pub async fn receive_frame(&mut self) -> Result<Frame, HaierError> {
        loop {
            match self.codec.decode(&mut self.buf) {
                DecodeOutcome::Frame(frame) => return Ok(frame),
                DecodeOutcome::Resync { discarded, reason } => {
                    warn!(discarded, %reason, "Link resynchronized");
                    continue;
                }
                DecodeOutcome::NeedMoreBytes => {}
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(HaierError::LinkClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CommandCode;
    use std::time::Duration;

    #[tokio::test]
    async fn test_framed_link_roundtrip() {
        let (a, b) = tokio::io::duplex(256);
        let mut left = FramedLink::new(a, FrameCodec::default());
        let mut right = FramedLink::new(b, FrameCodec::default());

        let frame = Frame::new(CommandCode::Single(0x60), vec![0x00, 0x01, 0x02, 0x00, 0x00, 0x00]);
        left.send_frame(&frame).await.expect("send");
        let received = right.receive_frame().await.expect("receive");
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_receive_reports_closed_link() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut link = FramedLink::new(b, FrameCodec::default());
        assert!(matches!(link.receive_frame().await, Err(HaierError::LinkClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_connector_gives_up_after_one_use() {
        let (a, _b) = tokio::io::duplex(64);
        let mut connector = StreamConnector::new("pipe", a);
        assert!(connect_with_retry(&mut connector).await.is_ok());
        match connect_with_retry(&mut connector).await {
            Err(HaierError::Transport { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("Expected transport error, got {:?}", other.map(|_| ())),
        }
    }

    struct Flaky {
        failures: u32,
    }

    impl Connect for Flaky {
        type Stream = tokio::io::DuplexStream;

        fn port_name(&self) -> &str {
            "flaky"
        }

        fn policy(&self) -> ReconnectPolicy {
            ReconnectPolicy::default()
        }

        async fn connect(&mut self) -> Result<Self::Stream, HaierError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(HaierError::LinkClosed);
            }
            Ok(tokio::io::duplex(8).0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_exponentially() {
        let start = tokio::time::Instant::now();
        let mut connector = Flaky { failures: 3 };
        assert!(connect_with_retry(&mut connector).await.is_ok());
        // 200 + 400 + 800 ms
        assert_eq!(start.elapsed(), Duration::from_millis(1400));
    }
}
