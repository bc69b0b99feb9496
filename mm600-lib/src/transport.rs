//! HID report framing and the ASCII control dialogue of the Contour Next Link 2.4.

use crate::channel::ByteChannel;
use crate::config::DriverConfig;
use crate::constants::{Ascii, USB_BLOCK_SIZE, USB_HEADER, USB_HEADER_SIZE, USB_PAYLOAD_SIZE};
use crate::envelope;
use crate::error::PumpError;
use bytes::{Bytes, BytesMut};
use regex::Regex;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

const PASSTHROUGH_PREFIXES: [&[u8]; 2] = [b"W|", b"Q|"];

/// Split a logical message into zero-padded 64-byte reports.
pub fn encode_reports(message: &[u8]) -> Vec<[u8; USB_BLOCK_SIZE]> {
    let mut chunks: Vec<&[u8]> = message.chunks(USB_PAYLOAD_SIZE).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    chunks
        .into_iter()
        .map(|chunk| {
            let mut report = [0u8; USB_BLOCK_SIZE];
            report[..3].copy_from_slice(USB_HEADER);
            report[3] = chunk.len() as u8;
            report[USB_HEADER_SIZE..USB_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// What the bridge reports about itself in answer to `X`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    /// `"dddd-ddddddd"`, also the key for link key unpacking.
    pub model_and_serial: String,
    pub astm_info: String,
}

impl BridgeInfo {
    pub fn parse(astm_info: &str) -> Result<Self, PumpError> {
        let pattern = Regex::new(r"\d{4}-\d{7}").map_err(|e| PumpError::InvalidMessage(e.to_string()))?;
        let model_and_serial = pattern
            .find(astm_info)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| PumpError::InvalidMessage("Bridge did not report a model and serial number".to_string()))?;
        Ok(Self {
            model_and_serial,
            astm_info: astm_info.to_string(),
        })
    }
}

/// The bridge end of the byte channel: framing, pacing and ASCII control.
pub struct Bridge<C: ByteChannel> {
    channel: C,
    read_timeout: Duration,
    send_delay: Duration,
    comms_reset_delay: Duration,
}

impl<C: ByteChannel> Bridge<C> {
    pub fn new(channel: C, config: &DriverConfig) -> Self {
        Self {
            channel,
            read_timeout: config.read_timeout(),
            send_delay: config.send_delay(),
            comms_reset_delay: config.comms_reset_delay(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn send_delay(&self) -> Duration {
        self.send_delay
    }

    pub async fn connect(&mut self) -> Result<(), PumpError> {
        self.channel.connect().await
    }

    pub async fn disconnect(&mut self) -> Result<(), PumpError> {
        self.channel.disconnect().await
    }

    pub async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    /// Send a logical message as consecutive reports.
    pub async fn write_message(&mut self, message: &[u8]) -> Result<(), PumpError> {
        debug!("### SENDING {}", hex::encode(message));
        for report in encode_reports(message) {
            self.channel.send(&report).await?;
        }
        Ok(())
    }

    /// Read one logical message.
    ///
    /// Stops at the first report carrying fewer than 60 payload bytes, or once
    /// a Minimed envelope has reached the length declared in its header.
    pub async fn read_message(&mut self, timeout: Duration) -> Result<Bytes, PumpError> {
        let deadline = Instant::now() + timeout;
        let mut message = BytesMut::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let report = self.channel.receive_with_timeout(remaining).await?;
            if report.is_empty() {
                debug!("TIMEOUT");
                return Err(PumpError::ReceiveTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            if report.len() < USB_HEADER_SIZE || &report[..3] != USB_HEADER {
                return Err(PumpError::InvalidMessage("Unexpected USB packet header".to_string()));
            }

            let size = report[3] as usize;
            let end = (USB_HEADER_SIZE + size).min(report.len());
            message.extend_from_slice(&report[USB_HEADER_SIZE..end]);

            let envelope_done = envelope::declared_length(&message).is_some_and(|n| message.len() >= n);
            if size < USB_PAYLOAD_SIZE || envelope_done {
                break;
            }
        }

        debug!("### READ {}", hex::encode(&message));
        Ok(message.freeze())
    }

    /// Write, wait `delay`, then read one message.
    pub async fn exchange(&mut self, message: &[u8], timeout: Duration, delay: Duration) -> Result<Bytes, PumpError> {
        self.write_message(message).await?;
        self.pause(delay).await;
        self.read_message(timeout).await
    }

    async fn ascii_command(&mut self, command: &[u8], expect: Ascii, delay: Duration) -> Result<(), PumpError> {
        let response = self.exchange(command, self.read_timeout, delay).await?;
        check_ascii(&response, expect)
    }

    /// Ask the bridge for its ASTM info block.
    ///
    /// The bridge answers with two messages in either order: the info block
    /// (starting with EOT) and a bare ENQ.
    pub async fn device_info(&mut self) -> Result<BridgeInfo, PumpError> {
        self.write_message(b"X").await?;
        self.pause(self.send_delay).await;
        let first = self.read_message(self.read_timeout).await?;
        self.pause(self.send_delay).await;
        let second = self.read_message(self.read_timeout).await?;

        let info = if first.first() == Some(&u8::from(Ascii::Eot)) {
            check_ascii(&second, Ascii::Enq)?;
            first
        } else {
            check_ascii(&first, Ascii::Enq)?;
            second
        };

        let info = BridgeInfo::parse(&String::from_utf8_lossy(&info))?;
        info!("Bridge {}", info.model_and_serial);
        Ok(info)
    }

    pub async fn enter_remote_command_mode(&mut self) -> Result<(), PumpError> {
        self.ascii_command(&[u8::from(Ascii::Nak)], Ascii::Eot, Duration::ZERO).await?;
        self.ascii_command(&[u8::from(Ascii::Enq)], Ascii::Ack, Duration::ZERO).await
    }

    pub async fn exit_remote_command_mode(&mut self) -> Result<(), PumpError> {
        self.ascii_command(&[u8::from(Ascii::Eot)], Ascii::Enq, self.comms_reset_delay)
            .await
    }

    pub async fn set_passthrough_mode(&mut self, enable: bool) -> Result<(), PumpError> {
        for prefix in PASSTHROUGH_PREFIXES {
            self.ascii_command(prefix, Ascii::Ack, Duration::ZERO).await?;
        }
        let mode: &[u8] = if enable { b"1|" } else { b"0|" };
        self.ascii_command(mode, Ascii::Ack, Duration::ZERO).await
    }
}

fn check_ascii(response: &[u8], expect: Ascii) -> Result<(), PumpError> {
    match response.first() {
        Some(&b) if b == u8::from(expect) => Ok(()),
        other => Err(PumpError::InvalidMessage(format!(
            "Unexpected ASCII control message. Expected {}, got {:?}",
            expect,
            other.map(|b| Ascii::from(*b))
        ))),
    }
}
