pub mod channel;
pub mod checksum;
pub mod cipher;
pub mod commands;
pub mod config;
pub mod constants;
pub mod device;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod history;
pub mod link;
pub mod multipacket;
pub mod ngp;
pub mod pairing;
pub mod records;
pub mod session;
pub mod timestamp;
pub mod timezone;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod tests;

// Re-export the main entry points for easy access
pub use channel::{ByteChannel, MemoryChannel};
pub use config::{DriverConfig, FixedTimezone};
pub use device::UsbChannel;
pub use driver::{Driver, PumpData};
pub use error::PumpError;
pub use history::{DecodedHistory, process_history};
pub use upload::SessionMetadata;
