//! Reassembled history segments: header, optional LZO stage and the
//! 2048-byte CRC-sealed blocks that carry event pages.

use super::lzo;
use crate::checksum::crc16;
use crate::constants::{ComDCommand, HistoryDataType};
use crate::error::PumpError;
use bytes::Bytes;
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const BLOCK_SIZE: usize = 2048;
pub const BLOCK_TRAILER_SIZE: usize = 4;
pub const SEGMENT_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SegmentHeaderRaw {
    marker: U16,
    data_type: u8,
    compressed_size: U32,
    uncompressed_size: U32,
    compressed: u8,
}

/// One completed multipacket payload of history data.
#[derive(Debug, Clone)]
pub struct HistorySegment {
    pub data_type: HistoryDataType,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub compressed: bool,
    data: Bytes,
}

impl HistorySegment {
    pub fn parse(payload: Bytes) -> Result<Self, PumpError> {
        let (raw, _) = SegmentHeaderRaw::read_from_prefix(&payload[..]).map_err(|_| {
            PumpError::InvalidMessage(format!("History segment too short: {} bytes", payload.len()))
        })?;
        if raw.marker.get() != u16::from(ComDCommand::UnmergedHistoryResponse) {
            return Err(PumpError::InvalidMessage(format!(
                "Unknown history segment marker {:#06x}",
                raw.marker.get()
            )));
        }
        let body_len = payload.len() - SEGMENT_HEADER_SIZE;
        if raw.compressed_size.get() as usize != body_len {
            return Err(PumpError::InvalidMessage(format!(
                "Compressed size mismatch: header says {}, segment carries {}",
                raw.compressed_size.get(),
                body_len
            )));
        }
        Ok(Self {
            data_type: HistoryDataType::from(raw.data_type),
            compressed_size: raw.compressed_size.get(),
            uncompressed_size: raw.uncompressed_size.get(),
            compressed: raw.compressed != 0,
            data: payload.slice(SEGMENT_HEADER_SIZE..),
        })
    }

    /// Wrap `blocks` in a segment, LZO-framed when `compress` is set.
    pub fn encode(data_type: HistoryDataType, blocks: &[u8], compress: bool) -> Vec<u8> {
        let body = if compress { lzo::encode_stored(blocks) } else { blocks.to_vec() };
        let raw = SegmentHeaderRaw {
            marker: U16::new(ComDCommand::UnmergedHistoryResponse.into()),
            data_type: data_type.into(),
            compressed_size: U32::new(body.len() as u32),
            uncompressed_size: U32::new(blocks.len() as u32),
            compressed: compress as u8,
        };
        let mut out = Vec::with_capacity(SEGMENT_HEADER_SIZE + body.len());
        out.extend_from_slice(raw.as_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// The block stream, decompressed if the segment is compressed.
    pub fn block_data(&self) -> Result<Bytes, PumpError> {
        if !self.compressed {
            return Ok(self.data.clone());
        }
        lzo::decompress(&self.data, self.uncompressed_size as usize).map(Bytes::from)
    }

    /// Decode the segment and append its pages to `pages`.
    pub fn pages_into(&self, pages: &mut Vec<Bytes>) -> Result<usize, PumpError> {
        split_blocks(&self.block_data()?, pages)
    }
}

/// Split a block stream into pages, appending each verified page.
///
/// On a CRC failure the pages of earlier blocks are already in `pages`
/// and the error names the failing block.
pub fn split_blocks(data: &Bytes, pages: &mut Vec<Bytes>) -> Result<usize, PumpError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(PumpError::InvalidMessage(format!(
            "Block stream of {} bytes is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    let mut bytes_added = 0;
    for (index, start) in (0..data.len()).step_by(BLOCK_SIZE).enumerate() {
        let block = data.slice(start..start + BLOCK_SIZE);
        let trailer = &block[BLOCK_SIZE - BLOCK_TRAILER_SIZE..];
        let size = u16::from_be_bytes([trailer[0], trailer[1]]) as usize;
        let expected = u16::from_be_bytes([trailer[2], trailer[3]]);
        if size > BLOCK_SIZE - BLOCK_TRAILER_SIZE {
            return Err(PumpError::InvalidMessage(format!(
                "Block {} declares {} payload bytes",
                index, size
            )));
        }
        let computed = crc16(&block[..size]);
        if computed != expected {
            return Err(PumpError::BlockChecksum {
                block: index,
                expected,
                computed,
            });
        }
        pages.push(block.slice(..size));
        bytes_added += size;
    }
    Ok(bytes_added)
}

/// Seal one page into a block with its size and CRC trailer.
pub fn seal_block(page: &[u8]) -> Result<[u8; BLOCK_SIZE], PumpError> {
    if page.len() > BLOCK_SIZE - BLOCK_TRAILER_SIZE {
        return Err(PumpError::InvalidMessage(format!("Page of {} bytes does not fit a block", page.len())));
    }
    let mut block = [0u8; BLOCK_SIZE];
    block[..page.len()].copy_from_slice(page);
    block[BLOCK_SIZE - 4..BLOCK_SIZE - 2].copy_from_slice(&(page.len() as u16).to_be_bytes());
    block[BLOCK_SIZE - 2..].copy_from_slice(&crc16(page).to_be_bytes());
    Ok(block)
}
