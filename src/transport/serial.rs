//! Serial/USB link to the controller
//!
//! `serialport` is blocking, so every call hands the port to tokio's blocking
//! pool and takes it back when the call returns.

use super::{take_frame, take_overflow, Transport, TransportError};
use crate::config::TransportConfig;
use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Poll interval of a single blocking read
const READ_POLL: Duration = Duration::from_millis(10);

type Port = Box<dyn serialport::SerialPort>;

pub struct SerialTransport {
    port: Option<Port>,
    path: Option<String>,
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            port: None,
            path: None,
            pending: Vec::new(),
        }
    }

    fn take_port(&mut self) -> Result<Port, TransportError> {
        self.port.take().ok_or(TransportError::NotOpen)
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn join_error(e: tokio::task::JoinError) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        let path = config
            .serial_port
            .clone()
            .ok_or_else(|| TransportError::Connection("no serial port configured".to_string()))?;
        let baud_rate = config.baud_rate();

        let builder = serialport::new(&path, baud_rate)
            .timeout(READ_POLL)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None);

        let open = tokio::task::spawn_blocking(move || builder.open());
        let port = match tokio::time::timeout(config.connect_timeout(), open).await {
            Ok(Ok(Ok(port))) => port,
            Ok(Ok(Err(e))) => {
                warn!("Failed to open serial port {}: {}", path, e);
                return Err(TransportError::Connection(format!("{}: {}", path, e)));
            }
            Ok(Err(e)) => return Err(join_error(e)),
            Err(_) => {
                return Err(TransportError::Connection(format!(
                    "{}: not available within {:?}",
                    path,
                    config.connect_timeout()
                )))
            }
        };

        info!("Opened serial port {} at {} baud", path, baud_rate);
        self.port = Some(port);
        self.path = Some(path);
        self.pending.clear();
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut port = self.take_port()?;
        let data = frame.to_vec();
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = port.write_all(&data).and_then(|_| port.flush());
            (port, result)
        })
        .await
        .map_err(join_error)?;
        self.port = Some(port);
        result.map_err(TransportError::Io)
    }

    async fn receive(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError> {
        if let Some(frame) = take_frame(&mut self.pending) {
            return Ok(frame);
        }

        let mut port = self.take_port()?;
        let mut pending = std::mem::take(&mut self.pending);
        let (port, pending, result) = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + max_wait;
            let mut chunk = [0u8; 256];
            let result = loop {
                if let Some(frame) = take_frame(&mut pending).or_else(|| take_overflow(&mut pending)) {
                    break Ok(frame);
                }
                if Instant::now() >= deadline {
                    break Err(TransportError::Timeout(max_wait));
                }
                match port.read(&mut chunk) {
                    Ok(n) => pending.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => break Err(TransportError::Io(e)),
                }
            };
            (port, pending, result)
        })
        .await
        .map_err(join_error)?;

        self.port = Some(port);
        self.pending = pending;
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!("Closed serial port {}", self.path.as_deref().unwrap_or("?"));
        }
        self.pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("serial://{}", path),
            None => "serial".to_string(),
        }
    }
}
