//! Chunk-offset fixup engine.
//!
//! `stco` and `co64` entries are absolute file offsets, so relocating `mdat`
//! invalidates every one of them. This module walks the container hierarchy
//! inside a `moov` payload and rewrites each entry in place by a signed
//! delta. The walk is iterative with an explicit `(position, limit)` stack,
//! which keeps malformed nesting from touching the call stack.

use tracing::debug;

use crate::box_utils::child_at;
use crate::error::Mp4Error;

/// Container FourCCs whose payloads are sequences of boxes to descend into.
///
/// `edts` holds media-time edit lists and `mvex` fragment defaults; neither
/// contains file offsets, but both may nest further boxes, so the walk must
/// pass through them rather than stop.
const CONTAINER_BOXES: &[[u8; 4]] = &[
    *b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"edts", *b"mvex", *b"udta",
];

/// Rewrite every `stco`/`co64` entry in a `moov` payload by `delta`.
///
/// `moov_payload` is the box body only, without the `moov` header. Returns
/// the number of entries rewritten. A `delta` of zero leaves the buffer
/// untouched.
///
/// Shifted `stco` entries must stay within `[0, 2^31 - 1]` and `co64`
/// entries must not go negative; a violation aborts with
/// [`Mp4Error::OffsetOverflow`] / [`Mp4Error::OffsetUnderflow`], leaving the
/// buffer partially rewritten. Callers are expected to discard it on error.
pub fn apply_chunk_offset_delta(moov_payload: &mut [u8], delta: i64) -> Result<u64, Mp4Error> {
    if delta == 0 {
        return Ok(0);
    }

    let mut rewritten = 0u64;
    let mut frames: Vec<(usize, usize)> = vec![(0, moov_payload.len())];

    while let Some((mut offset, limit)) = frames.pop() {
        while let Some(child) = child_at(moov_payload, offset, limit)? {
            match &child.fourcc {
                b"stco" => {
                    rewritten +=
                        rewrite_stco(&mut moov_payload[child.body_start..child.end], delta)?;
                }
                b"co64" => {
                    rewritten +=
                        rewrite_co64(&mut moov_payload[child.body_start..child.end], delta)?;
                }
                fourcc if CONTAINER_BOXES.contains(fourcc) => {
                    // Resume the current container after the child is done.
                    frames.push((child.end, limit));
                    frames.push((child.body_start, child.end));
                    break;
                }
                _ => {}
            }
            offset = child.end;
        }
    }

    debug!(rewritten, delta, "Rewrote chunk offset entries");
    Ok(rewritten)
}

/// Rewrite a `stco` body (version/flags + entry_count + u32 entries).
fn rewrite_stco(body: &mut [u8], delta: i64) -> Result<u64, Mp4Error> {
    let entry_count = offset_table_len(body, 4)?;

    for i in 0..entry_count {
        let at = 8 + i * 4;
        let entry = u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);

        let shifted = (entry as u64).checked_add_signed(delta);
        let Some(shifted) = shifted.filter(|&v| v <= i32::MAX as u64) else {
            return Err(Mp4Error::OffsetOverflow { entry, delta });
        };

        body[at..at + 4].copy_from_slice(&(shifted as u32).to_be_bytes());
    }

    Ok(entry_count as u64)
}

/// Rewrite a `co64` body (version/flags + entry_count + u64 entries).
fn rewrite_co64(body: &mut [u8], delta: i64) -> Result<u64, Mp4Error> {
    let entry_count = offset_table_len(body, 8)?;

    for i in 0..entry_count {
        let at = 8 + i * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&body[at..at + 8]);
        let entry = u64::from_be_bytes(raw);

        let Some(shifted) = entry.checked_add_signed(delta) else {
            return Err(Mp4Error::OffsetUnderflow { entry, delta });
        };

        body[at..at + 8].copy_from_slice(&shifted.to_be_bytes());
    }

    Ok(entry_count as u64)
}

/// Validate a full-box offset table and return its entry count.
fn offset_table_len(body: &[u8], stride: usize) -> Result<usize, Mp4Error> {
    if body.len() < 8 {
        return Err(Mp4Error::MalformedMoov("offset table shorter than header"));
    }

    let entry_count = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
    let table_len = entry_count
        .checked_mul(stride)
        .ok_or(Mp4Error::MalformedMoov("offset table entry count overflow"))?;
    if table_len > body.len() - 8 {
        return Err(Mp4Error::MalformedMoov("offset table exceeds box body"));
    }

    Ok(entry_count)
}
