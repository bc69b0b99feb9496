//! LZO1X decompression, bounds-checked.

use crate::error::PumpError;

const M2_MAX_OFFSET: usize = 0x0800;

struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Input<'_> {
    fn byte(&mut self) -> Result<usize, PumpError> {
        let b = self
            .data
            .get(self.pos)
            .copied()
            .ok_or_else(|| overrun("input", self.pos))?;
        self.pos += 1;
        Ok(b as usize)
    }

    fn le16(&mut self) -> Result<usize, PumpError> {
        Ok(self.byte()? | (self.byte()? << 8))
    }

    /// Length continuation: each zero byte adds 255, the first non-zero byte
    /// ends the run and is added as well.
    fn extended_length(&mut self, base: usize) -> Result<usize, PumpError> {
        let mut length = base;
        loop {
            match self.byte()? {
                0 => length += 255,
                b => return Ok(length + b),
            }
        }
    }

    fn literals(&mut self, count: usize, out: &mut Vec<u8>, limit: usize) -> Result<(), PumpError> {
        let run = self
            .data
            .get(self.pos..self.pos + count)
            .ok_or_else(|| overrun("literal run", self.pos))?;
        if out.len() + count > limit {
            return Err(overrun("output", out.len() + count));
        }
        out.extend_from_slice(run);
        self.pos += count;
        Ok(())
    }
}

fn overrun(what: &str, at: usize) -> PumpError {
    PumpError::Decompression(format!("{} overrun at {}", what, at))
}

fn copy_match(out: &mut Vec<u8>, distance: usize, length: usize, limit: usize) -> Result<(), PumpError> {
    if distance == 0 || distance > out.len() {
        return Err(PumpError::Decompression(format!(
            "match distance {} outside {} decoded bytes",
            distance,
            out.len()
        )));
    }
    if out.len() + length > limit {
        return Err(overrun("output", out.len() + length));
    }
    let start = out.len() - distance;
    for i in 0..length {
        let b = out[start + i];
        out.push(b);
    }
    Ok(())
}

/// Decompress an LZO1X stream that must expand to exactly `expected_len` bytes.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>, PumpError> {
    if input.len() < 3 {
        return Err(PumpError::Decompression("stream too short".to_string()));
    }
    let mut ip = Input { data: input, pos: 0 };
    let mut out = Vec::with_capacity(expected_len);
    // 0: start, 1..=3: trailing literals of the last match, 4: after a literal run
    let mut state = 0usize;

    if input[0] > 17 {
        ip.pos = 1;
        let t = input[0] as usize - 17;
        ip.literals(t, &mut out, expected_len)?;
        state = if t < 4 { t } else { 4 };
    }

    loop {
        let t = ip.byte()?;
        let distance;
        let length;
        let next;

        if t < 16 {
            if state == 0 {
                let run = if t == 0 { ip.extended_length(15)? } else { t } + 3;
                ip.literals(run, &mut out, expected_len)?;
                state = 4;
                continue;
            }
            next = t & 3;
            let low = ip.byte()?;
            if state != 4 {
                distance = 1 + (t >> 2) + (low << 2);
                length = 2;
            } else {
                distance = 1 + M2_MAX_OFFSET + (t >> 2) + (low << 2);
                length = 3;
            }
        } else if t >= 64 {
            next = t & 3;
            let low = ip.byte()?;
            distance = 1 + ((t >> 2) & 7) + (low << 3);
            length = (t >> 5) + 1;
        } else if t >= 32 {
            length = match t & 31 {
                0 => ip.extended_length(31)?,
                n => n,
            } + 2;
            let word = ip.le16()?;
            distance = 1 + (word >> 2);
            next = word & 3;
        } else {
            let high = (t & 8) << 11;
            length = match t & 7 {
                0 => ip.extended_length(7)?,
                n => n,
            } + 2;
            let word = ip.le16()?;
            let offset = high + (word >> 2);
            if offset == 0 {
                if length != 3 {
                    return Err(PumpError::Decompression("malformed end of stream".to_string()));
                }
                break;
            }
            distance = offset + 0x4000;
            next = word & 3;
        }

        copy_match(&mut out, distance, length, expected_len)?;
        state = next;
        if next > 0 {
            ip.literals(next, &mut out, expected_len)?;
        }
    }

    if ip.pos != input.len() {
        return Err(PumpError::Decompression(format!(
            "{} trailing bytes after end of stream",
            input.len() - ip.pos
        )));
    }
    if out.len() != expected_len {
        return Err(PumpError::Decompression(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

/// Encode `data` as a valid LZO1X stream made only of literal runs.
pub fn encode_stored(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 255 + 8);
    match data.len() {
        0 => {}
        len @ 1..=238 => out.push((len + 17) as u8),
        len => {
            out.push(0);
            let mut rest = len - 18;
            while rest > 255 {
                out.push(0);
                rest -= 255;
            }
            out.push(rest as u8);
        }
    }
    out.extend_from_slice(data);
    out.extend_from_slice(&[0x11, 0x00, 0x00]);
    out
}
