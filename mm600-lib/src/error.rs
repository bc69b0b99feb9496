use std::array::TryFromSliceError;
use std::io;
use thiserror::Error;

/// The primary error type for the `mm600-lib` library.
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("USB device not found. Is the Contour Next Link 2.4 connected?")]
    DeviceNotFound,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("Timeout during device operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("No response received within {waited_ms} ms")]
    ReceiveTimeout { waited_ms: u64 },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    Checksum { expected: u16, computed: u16 },

    #[error(
        "Could not decrypt pump message (expected CRC {expected:#06x}, computed {computed:#06x}). Re-link pump and meter"
    )]
    Decryption { expected: u16, computed: u16 },

    #[error("Unexpected checksum in block {block}: expected {expected:#06x}, computed {computed:#06x}")]
    BlockChecksum { block: usize, expected: u16, computed: u16 },

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Failed after {attempts} attempts: {source}")]
    Retry {
        attempts: u32,
        #[source]
        source: Box<PumpError>,
    },

    #[error("Pairing failed: {0}")]
    Pairing(String),

    #[error("Record error: {0}")]
    Record(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PumpError {
    /// Errors the command layer may absorb and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PumpError::Timeout(_) | PumpError::ReceiveTimeout { .. } | PumpError::InvalidMessage(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PumpError::Timeout(_) | PumpError::ReceiveTimeout { .. })
    }
}

impl From<TryFromSliceError> for PumpError {
    fn from(_: TryFromSliceError) -> Self {
        PumpError::InvalidMessage("Failed to convert slice to array".to_string())
    }
}
