//! Reassembly of payloads the pump splits into numbered packets.

use crate::error::PumpError;
use crate::ngp::ComDResponse;
use bytes::{Bytes, BytesMut};

/// A contiguous run of packets still to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingRun {
    pub start: u16,
    pub count: u16,
}

#[derive(Debug, Clone)]
pub struct MultipacketSession {
    pub segment_size: u32,
    pub packet_size: u16,
    pub last_packet_size: u16,
    pub packets_to_fetch: u16,
    segments: Vec<Option<Bytes>>,
}

impl MultipacketSession {
    pub fn new(segment_size: u32, packet_size: u16, last_packet_size: u16, packets_to_fetch: u16) -> Self {
        Self {
            segment_size,
            packet_size,
            last_packet_size,
            packets_to_fetch,
            segments: vec![None; packets_to_fetch as usize],
        }
    }

    /// Start a session from an INITIATE_MULTIPACKET_TRANSFER message.
    pub fn from_initiate(message: &ComDResponse) -> Result<Self, PumpError> {
        Ok(Self::new(
            message.u32_at(0x03)?,
            message.u16_at(0x07)?,
            message.u16_at(0x09)?,
            message.u16_at(0x0B)?,
        ))
    }

    fn last_packet_number(&self) -> u16 {
        self.packets_to_fetch.saturating_sub(1)
    }

    /// Store one packet. Every packet but the last must be exactly
    /// `packet_size` long; the last must be `last_packet_size`.
    pub fn add_segment(&mut self, packet_number: u16, data: Bytes) -> Result<(), PumpError> {
        if packet_number >= self.packets_to_fetch {
            return Err(PumpError::InvalidMessage(format!(
                "Multipacket packet {} out of range ({} packets)",
                packet_number, self.packets_to_fetch
            )));
        }
        let (expected, what) = if packet_number == self.last_packet_number() {
            (self.last_packet_size, "last packet")
        } else {
            (self.packet_size, "packet")
        };
        if data.len() != expected as usize {
            return Err(PumpError::InvalidMessage(format!(
                "Multipacket Transfer {} size mismatch: expected {}, got {}",
                what,
                expected,
                data.len()
            )));
        }
        self.segments[packet_number as usize] = Some(data);
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_some()).count()
    }

    pub fn payload_complete(&self) -> bool {
        self.segment_count() == self.packets_to_fetch as usize
    }

    /// The last packet arrived but some earlier ones did not.
    pub fn retransmit_needed(&self) -> bool {
        self.segments.last().is_some_and(|s| s.is_some()) && !self.payload_complete()
    }

    pub fn missing_segments(&self) -> Vec<MissingRun> {
        let mut runs: Vec<MissingRun> = Vec::new();
        let mut in_run = false;
        for (index, segment) in self.segments.iter().enumerate() {
            match (segment, in_run) {
                (None, false) => {
                    runs.push(MissingRun {
                        start: index as u16,
                        count: 1,
                    });
                    in_run = true;
                }
                (None, true) => {
                    if let Some(run) = runs.last_mut() {
                        run.count += 1;
                    }
                }
                (Some(_), _) => in_run = false,
            }
        }
        runs
    }

    /// The reassembled payload; its length must equal the announced segment size.
    pub fn payload(&self) -> Result<Bytes, PumpError> {
        if !self.payload_complete() {
            return Err(PumpError::InvalidMessage(format!(
                "Multipacket payload incomplete: {} of {} packets",
                self.segment_count(),
                self.packets_to_fetch
            )));
        }
        let mut out = BytesMut::with_capacity(self.segment_size as usize);
        for segment in self.segments.iter().flatten() {
            out.extend_from_slice(segment);
        }
        if out.len() != self.segment_size as usize {
            return Err(PumpError::InvalidMessage(format!(
                "Total segment size mismatch: expected {}, got {}",
                self.segment_size,
                out.len()
            )));
        }
        Ok(out.freeze())
    }
}
