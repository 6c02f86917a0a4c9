//! bsdiff 4.x patch framing and application.
//!
//! ```text
//! 0       8   "BSDIFF40"
//! 8       8   X = length of compressed control block
//! 16      8   Y = length of compressed diff block
//! 24      8   length of new file
//! 32      X   compressed control block (triples of sign-magnitude i64)
//! 32+X    Y   compressed diff block
//! 32+X+Y  ..  compressed extra block
//! ```

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::binary_diff::{self, Control};
use crate::compress::{self, CompressionKind};
use crate::error::PatchError;

pub const SIGNATURE: &[u8; 8] = b"BSDIFF40";
pub const HEADER_LEN: u64 = 32;

const SIGN_BIT: u64 = 0x8000_0000_0000_0000;
const COPY_BUFFER: usize = 1 << 20;

/// Encode `value` as sign-magnitude little-endian into `buf[..8]`.
pub fn write_offset(value: i64, buf: &mut [u8]) {
    let raw = if value < 0 {
        value.unsigned_abs() | SIGN_BIT
    } else {
        value as u64
    };
    LittleEndian::write_u64(buf, raw);
}

/// Decode a sign-magnitude little-endian value from `buf[..8]`.
///
/// The bare sign bit (negative zero) decodes to `i64::MIN`, the one value whose
/// magnitude does not fit in 63 bits.
pub fn read_offset(buf: &[u8]) -> i64 {
    let raw = LittleEndian::read_u64(buf);
    if raw & SIGN_BIT == 0 || raw == SIGN_BIT {
        raw as i64
    } else {
        ((raw & !SIGN_BIT) as i64).wrapping_neg()
    }
}

/// Diff `old` against `new` and write a complete patch to `output`.
///
/// Returns the number of bytes written.
pub fn create_patch<W: Write + ?Sized>(
    old: &[u8],
    new: &[u8],
    kind: CompressionKind,
    output: &mut W,
) -> io::Result<u64> {
    let delta = binary_diff::compute_diff(old, new);

    let mut raw_controls = vec![0u8; delta.controls.len() * 24];
    for (control, chunk) in delta.controls.iter().zip(raw_controls.chunks_exact_mut(24)) {
        write_offset(control.copy_len, &mut chunk[0..8]);
        write_offset(control.extra_len, &mut chunk[8..16]);
        write_offset(control.seek, &mut chunk[16..24]);
    }

    let controls = compress::compress_bytes(kind, &raw_controls)?;
    let diff = compress::compress_bytes(kind, &delta.diff)?;
    let extra = compress::compress_bytes(kind, &delta.extra)?;

    tracing::trace!(
        triples = delta.controls.len(),
        diff = delta.diff.len(),
        extra = delta.extra.len(),
        "bsdiff segments"
    );

    let mut header = [0u8; HEADER_LEN as usize];
    header[..8].copy_from_slice(SIGNATURE);
    write_offset(controls.len() as i64, &mut header[8..16]);
    write_offset(diff.len() as i64, &mut header[16..24]);
    write_offset(new.len() as i64, &mut header[24..32]);

    output.write_all(&header)?;
    output.write_all(&controls)?;
    output.write_all(&diff)?;
    output.write_all(&extra)?;

    Ok(HEADER_LEN + (controls.len() + diff.len() + extra.len()) as u64)
}

/// Lengths decoded from a patch header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    pub control_len: u64,
    pub diff_len: u64,
    pub new_size: u64,
}

impl PatchHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN as usize]) -> Result<Self, PatchError> {
        if &bytes[..8] != SIGNATURE {
            return Err(PatchError::Corrupt("bad signature"));
        }
        let control_len = read_offset(&bytes[8..16]);
        let diff_len = read_offset(&bytes[16..24]);
        let new_size = read_offset(&bytes[24..32]);
        if control_len < 0 || diff_len < 0 || new_size < 0 {
            return Err(PatchError::Corrupt("negative length in header"));
        }
        Ok(Self {
            control_len: control_len as u64,
            diff_len: diff_len as u64,
            new_size: new_size as u64,
        })
    }
}

/// Apply an in-memory patch to `old`, writing the new file to `output`.
pub fn apply_patch<W: Write + ?Sized>(
    old: &[u8],
    patch: &[u8],
    kind: CompressionKind,
    output: &mut W,
) -> Result<u64, PatchError> {
    apply_patch_with(old, || Ok(io::Cursor::new(patch)), kind, output)
}

/// Apply a patch read through `open_patch`, writing the new file to `output`.
///
/// `open_patch` is called four times and must return an independent stream positioned
/// at the start of the patch each time; the patch may sit at any offset of a larger
/// stream. Returns the number of bytes written.
pub fn apply_patch_with<F, R, W>(
    old: &[u8],
    mut open_patch: F,
    kind: CompressionKind,
    output: &mut W,
) -> Result<u64, PatchError>
where
    F: FnMut() -> io::Result<R>,
    R: Read + Seek,
    W: Write + ?Sized,
{
    let header = {
        let mut stream = open_patch()?;
        let mut bytes = [0u8; HEADER_LEN as usize];
        stream.read_exact(&mut bytes)?;
        PatchHeader::parse(&bytes)?
    };

    let control_at = HEADER_LEN;
    let diff_at = control_at + header.control_len;
    let extra_at = diff_at + header.diff_len;

    let control_stream = open_segment(&mut open_patch, control_at)?.take(header.control_len);
    let diff_stream = open_segment(&mut open_patch, diff_at)?.take(header.diff_len);
    let extra_stream = open_segment(&mut open_patch, extra_at)?;
    let mut controls = compress::decoder(kind, control_stream)?;
    let mut diff = compress::decoder(kind, diff_stream)?;
    let mut extra = compress::decoder(kind, extra_stream)?;

    let mut replay = Replay {
        old,
        old_pos: 0,
        new_pos: 0,
        new_size: header.new_size,
        buffer: vec![0u8; COPY_BUFFER.min(header.new_size as usize).max(1)],
    };

    let mut triple = [0u8; 24];
    while replay.new_pos < header.new_size {
        controls
            .read_exact(&mut triple)
            .map_err(|_| PatchError::Corrupt("control block ended early"))?;
        let control = Control {
            copy_len: read_offset(&triple[0..8]),
            extra_len: read_offset(&triple[8..16]),
            seek: read_offset(&triple[16..24]),
        };
        replay.step(&control, &mut diff, &mut extra, output)?;
    }

    Ok(replay.new_pos)
}

fn open_segment<F, R>(open_patch: &mut F, offset: u64) -> io::Result<R>
where
    F: FnMut() -> io::Result<R>,
    R: Seek,
{
    let mut stream = open_patch()?;
    stream.seek(SeekFrom::Current(offset as i64))?;
    Ok(stream)
}

/// Cursor state while replaying control triples.
struct Replay<'a> {
    old: &'a [u8],
    old_pos: i64,
    new_pos: u64,
    new_size: u64,
    buffer: Vec<u8>,
}

impl Replay<'_> {
    fn step<W: Write + ?Sized>(
        &mut self,
        control: &Control,
        diff: &mut dyn Read,
        extra: &mut dyn Read,
        output: &mut W,
    ) -> Result<(), PatchError> {
        if control.copy_len < 0 || control.extra_len < 0 {
            return Err(PatchError::Corrupt("negative length in control triple"));
        }
        if self.new_pos + control.copy_len as u64 > self.new_size {
            return Err(PatchError::Corrupt("copy runs past the declared size"));
        }

        let mut remaining = control.copy_len as usize;
        while remaining > 0 {
            let chunk = remaining.min(self.buffer.len());
            let buf = &mut self.buffer[..chunk];
            diff.read_exact(buf)
                .map_err(|_| PatchError::Corrupt("diff block ended early"))?;

            // Only bytes that exist in the old file are added; the rest pass through.
            let old_len = self.old.len() as i64;
            let lo = self.old_pos.clamp(0, old_len);
            let hi = self.old_pos.saturating_add(chunk as i64).clamp(0, old_len);
            if lo < hi {
                let skip = (lo - self.old_pos) as usize;
                let window = &self.old[lo as usize..hi as usize];
                for (b, o) in buf[skip..].iter_mut().zip(window) {
                    *b = b.wrapping_add(*o);
                }
            }
            output.write_all(buf)?;

            self.old_pos += chunk as i64;
            self.new_pos += chunk as u64;
            remaining -= chunk;
        }

        if self.new_pos + control.extra_len as u64 > self.new_size {
            return Err(PatchError::Corrupt("extra runs past the declared size"));
        }

        let mut remaining = control.extra_len as usize;
        while remaining > 0 {
            let chunk = remaining.min(self.buffer.len());
            let buf = &mut self.buffer[..chunk];
            extra
                .read_exact(buf)
                .map_err(|_| PatchError::Corrupt("extra block ended early"))?;
            output.write_all(buf)?;
            self.new_pos += chunk as u64;
            remaining -= chunk;
        }

        self.old_pos = self
            .old_pos
            .checked_add(control.seek)
            .ok_or(PatchError::Corrupt("seek overflows"))?;
        Ok(())
    }
}
