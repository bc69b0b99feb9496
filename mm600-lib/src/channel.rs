//! Byte-oriented transport underneath the bridge protocol.

use crate::error::PumpError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;

/// A raw, exclusively owned connection to the bridge.
///
/// `receive_with_timeout` returns an empty buffer when nothing arrived within
/// the timeout; callers turn that into a timeout error where it matters.
#[async_trait]
pub trait ByteChannel: Send {
    async fn connect(&mut self) -> Result<(), PumpError>;

    async fn disconnect(&mut self) -> Result<(), PumpError>;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), PumpError>;

    async fn receive_with_timeout(&mut self, timeout: Duration) -> Result<Bytes, PumpError>;
}

/// In-memory channel replaying queued reports and recording everything sent.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    incoming: VecDeque<Bytes>,
    sent: Vec<Bytes>,
    connected: bool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one report for a later `receive_with_timeout`.
    pub fn push_incoming(&mut self, report: impl Into<Bytes>) {
        self.incoming.push_back(report.into());
    }

    pub fn sent(&self) -> &[Bytes] {
        &self.sent
    }

    pub fn pending(&self) -> usize {
        self.incoming.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

#[async_trait]
impl ByteChannel for MemoryChannel {
    async fn connect(&mut self) -> Result<(), PumpError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), PumpError> {
        self.connected = false;
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), PumpError> {
        self.sent.push(Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn receive_with_timeout(&mut self, _timeout: Duration) -> Result<Bytes, PumpError> {
        Ok(self.incoming.pop_front().unwrap_or_default())
    }
}
