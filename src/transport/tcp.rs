//! TCP link to the controller's ASCII command interface

use super::{take_frame, take_overflow, Transport, TransportError};
use crate::config::TransportConfig;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: Option<String>,
    pending: Vec<u8>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            stream: None,
            address: None,
            pending: Vec::new(),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| TransportError::Connection("no host configured".to_string()))?;
        let address = format!("{}:{}", host, config.port());

        let stream = match timeout(config.connect_timeout(), TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Connection to controller failed ({}): {}", address, e);
                return Err(TransportError::Connection(format!("{}: {}", address, e)));
            }
            Err(_) => {
                return Err(TransportError::Connection(format!(
                    "{}: no answer within {:?}",
                    address,
                    config.connect_timeout()
                )))
            }
        };
        stream.set_nodelay(true)?;

        info!("Connected to controller at {}", address);
        self.stream = Some(stream);
        self.address = Some(address);
        self.pending.clear();
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let deadline = Instant::now() + max_wait;
        let mut chunk = [0u8; 512];

        loop {
            if let Some(frame) = take_frame(&mut self.pending).or_else(|| take_overflow(&mut self.pending)) {
                return Ok(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(max_wait));
            }

            match timeout(remaining, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "controller closed the connection",
                    )))
                }
                Ok(Ok(n)) => self.pending.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => return Err(TransportError::Timeout(max_wait)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            info!("Closed connection to {}", self.address.as_deref().unwrap_or("controller"));
        }
        self.pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.address {
            Some(address) => format!("tcp://{}", address),
            None => "tcp".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn config_for(port: u16) -> TransportConfig {
        TransportConfig {
            kind: crate::config::TransportKind::Tcp,
            host: Some("127.0.0.1".to_string()),
            port: Some(port),
            connect_timeout_ms: Some(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_echo_controller_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Controller that answers every line in two partial writes
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(_line)) = lines.next_line().await {
                write_half.write_all(b"%00").await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                write_half.write_all(b"01*31\n").await.unwrap();
            }
        });

        let mut transport = TcpTransport::new();
        transport.open(&config_for(port)).await.unwrap();
        transport.send(b">0001 HELLO*3F\n").await.unwrap();
        let frame = transport.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, b"%0001*31\n".to_vec());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut transport = TcpTransport::new();
        transport.open(&config_for(port)).await.unwrap();
        let result = transport.receive(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_connection_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut transport = TcpTransport::new();
        let result = transport.open(&config_for(port)).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn test_send_before_open() {
        let mut transport = TcpTransport::new();
        assert!(matches!(transport.send(b"x\n").await, Err(TransportError::NotOpen)));
    }
}
