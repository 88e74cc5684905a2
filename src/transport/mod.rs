//! Transport Adapter
//!
//! Byte-stream links to the controller. A [`Transport`] moves whole frames
//! (one line, terminator included); the [`TransportAdapter`] wraps one and
//! rejects overlapping calls, since the physical link cannot multiplex.

pub mod serial;
pub mod sim;
pub mod tcp;

use crate::config::{TransportConfig, TransportKind};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub use serial::SerialTransport;
pub use sim::{SimulatedTransport, SimulatorHandle};
pub use tcp::TcpTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No frame received within {0:?}")]
    Timeout(Duration),

    #[error("Transport is busy with another caller")]
    ConcurrentAccess,

    #[error("Transport is not open")]
    NotOpen,
}

impl TransportError {
    /// The link is gone and no retry over it can succeed
    pub fn is_link_lost(&self) -> bool {
        match self {
            TransportError::Connection(_) | TransportError::NotOpen => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            TransportError::Timeout(_) | TransportError::ConcurrentAccess => false,
        }
    }

    /// The call was refused before any byte reached the link
    pub fn is_untransmitted(&self) -> bool {
        matches!(self, TransportError::ConcurrentAccess | TransportError::NotOpen)
    }
}

/// Frame-oriented link to a controller
#[async_trait]
pub trait Transport: Send {
    /// Establish the link
    async fn open(&mut self, config: &TransportConfig) -> Result<(), TransportError>;

    /// Write one complete frame
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `max_wait` for the next complete frame
    async fn receive(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the link
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Link description for logs
    fn describe(&self) -> String;
}

/// Serializing wrapper around a [`Transport`]
pub struct TransportAdapter {
    inner: Mutex<Box<dyn Transport>>,
    name: String,
}

impl TransportAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let name = transport.describe();
        Self {
            inner: Mutex::new(transport),
            name,
        }
    }

    /// Build the transport selected by `config.kind`
    pub fn from_config(config: &TransportConfig) -> crate::Result<Self> {
        let transport: Box<dyn Transport> = match config.kind {
            TransportKind::Tcp => Box::new(TcpTransport::new()),
            TransportKind::Serial => Box::new(SerialTransport::new()),
            TransportKind::Simulated => Box::new(SimulatedTransport::new()?),
        };
        Ok(Self::new(transport))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn open(&self, config: &TransportConfig) -> Result<(), TransportError> {
        let mut transport = self.acquire()?;
        transport.open(config).await
    }

    pub async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut transport = self.acquire()?;
        debug!("-> {}", String::from_utf8_lossy(frame).trim_end());
        transport.send(frame).await
    }

    pub async fn receive(&self, max_wait: Duration) -> Result<Vec<u8>, TransportError> {
        let mut transport = self.acquire()?;
        let frame = transport.receive(max_wait).await?;
        debug!("<- {}", String::from_utf8_lossy(&frame).trim_end());
        Ok(frame)
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        let mut transport = self.acquire()?;
        transport.close().await
    }

    fn acquire(&self) -> Result<tokio::sync::MutexGuard<'_, Box<dyn Transport>>, TransportError> {
        self.inner.try_lock().map_err(|_| TransportError::ConcurrentAccess)
    }
}

/// Take one complete frame off the front of `pending`, if there is one
pub(crate) fn take_frame(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = pending.iter().position(|&b| b == crate::codec::FRAME_TERMINATOR)?;
    let rest = pending.split_off(end + 1);
    Some(std::mem::replace(pending, rest))
}

/// Take whatever is buffered once it cannot become a valid frame anymore, so
/// the codec can reject it instead of the link stalling on it
pub(crate) fn take_overflow(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    if pending.len() > crate::codec::MAX_FRAME_LEN {
        Some(std::mem::take(pending))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_take_frame_splits_lines() {
        let mut pending = b"%0001*31\n%0002".to_vec();
        assert_eq!(take_frame(&mut pending).unwrap(), b"%0001*31\n".to_vec());
        assert_eq!(pending, b"%0002".to_vec());
        assert!(take_frame(&mut pending).is_none());
    }

    #[test]
    fn test_error_classification() {
        let pipe = TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
        assert!(pipe.is_link_lost());
        assert!(!pipe.is_untransmitted());

        let stalled = TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "write stalled"));
        assert!(!stalled.is_link_lost());
        assert!(!stalled.is_untransmitted());

        assert!(TransportError::ConcurrentAccess.is_untransmitted());
        assert!(!TransportError::ConcurrentAccess.is_link_lost());
        assert!(TransportError::NotOpen.is_link_lost());
    }

    #[test]
    fn test_take_overflow() {
        let mut pending = vec![b'x'; crate::codec::MAX_FRAME_LEN + 1];
        assert!(take_overflow(&mut pending).is_some());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_rejected() {
        let adapter = Arc::new(TransportAdapter::new(Box::new(SimulatedTransport::new().unwrap())));
        adapter.open(&TransportConfig::default()).await.unwrap();

        // Nothing is queued, so the first receive holds the link for its whole wait
        let waiting = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.receive(Duration::from_millis(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = adapter.send(b">0001 HELLO*31\n").await;
        assert!(matches!(second, Err(TransportError::ConcurrentAccess)));

        let first = waiting.await.unwrap();
        assert!(matches!(first, Err(TransportError::Timeout(_))));
    }
}
