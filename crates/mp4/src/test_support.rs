//! Shared byte-level fixture builders.
//!
//! This module is available for local tests and optionally for downstream
//! crate tests when the `test-utils` feature is enabled.

use bytes::Bytes;

use crate::box_utils::child_at;

pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

/// A box using the 64-bit extended-size header regardless of its length.
pub fn make_largesize_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (16 + body.len()) as u64;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// A `size == 0` box that claims everything to EOF.
pub fn make_eof_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.push(((flags >> 16) & 0xFF) as u8);
    body.push(((flags >> 8) & 0xFF) as u8);
    body.push((flags & 0xFF) as u8);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

/// A `stco` box with the given absolute chunk offsets.
pub fn make_stco(offsets: &[u32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + offsets.len() * 4);
    payload.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for offset in offsets {
        payload.extend_from_slice(&offset.to_be_bytes());
    }
    make_full_box(b"stco", 0, 0, &payload)
}

/// A `co64` box with the given absolute chunk offsets.
pub fn make_co64(offsets: &[u64]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + offsets.len() * 8);
    payload.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for offset in offsets {
        payload.extend_from_slice(&offset.to_be_bytes());
    }
    make_full_box(b"co64", 0, 0, &payload)
}

/// A `moov` payload (no `moov` header) nesting one offset-table box under
/// `trak/mdia/minf/stbl`.
pub fn make_moov_payload(offset_table_box: &[u8]) -> Vec<u8> {
    let stbl = make_box(b"stbl", offset_table_box);
    let minf = make_box(b"minf", &stbl);
    let mdia = make_box(b"mdia", &minf);
    make_box(b"trak", &mdia)
}

/// A `moov` payload padded with a trailing `free` box to exactly `len` bytes.
///
/// Panics when `len` cannot accommodate the sample-table tree plus an 8-byte
/// `free` header; fixtures should pick a roomier size instead.
pub fn make_moov_payload_padded(offset_table_box: &[u8], len: usize) -> Vec<u8> {
    let mut payload = make_moov_payload(offset_table_box);
    let pad_total = len
        .checked_sub(payload.len())
        .expect("padded moov length below tree size");
    assert!(pad_total >= 8, "no room for a free box header");
    payload.extend_from_slice(&make_box(b"free", &vec![0u8; pad_total - 8]));
    payload
}

/// A complete non-fast-start file: `ftyp`, `mdat`, then `moov`.
pub fn make_unoptimized_file(stco_offsets: &[u32], mdat_body: &[u8]) -> Bytes {
    let mut file = Vec::new();
    file.extend_from_slice(&make_box(b"ftyp", &[0u8; 16]));
    file.extend_from_slice(&make_box(b"mdat", mdat_body));
    file.extend_from_slice(&make_box(
        b"moov",
        &make_moov_payload(&make_stco(stco_offsets)),
    ));
    Bytes::from(file)
}

/// A complete fast-start file: `ftyp`, `moov`, then `mdat`.
pub fn make_optimized_file(stco_offsets: &[u32], mdat_body: &[u8]) -> Bytes {
    let mut file = Vec::new();
    file.extend_from_slice(&make_box(b"ftyp", &[0u8; 16]));
    file.extend_from_slice(&make_box(
        b"moov",
        &make_moov_payload(&make_stco(stco_offsets)),
    ));
    file.extend_from_slice(&make_box(b"mdat", mdat_body));
    Bytes::from(file)
}

/// Entries of the first `stco` box found under `moov_payload`, if any.
pub fn read_first_stco(moov_payload: &[u8]) -> Option<Vec<u32>> {
    let body = find_first_body(moov_payload, b"stco")?;
    let entry_count = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
    let entries = body[8..8 + entry_count * 4]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(entries)
}

/// Entries of the first `co64` box found under `moov_payload`, if any.
pub fn read_first_co64(moov_payload: &[u8]) -> Option<Vec<u64>> {
    let body = find_first_body(moov_payload, b"co64")?;
    let entry_count = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
    let entries = body[8..8 + entry_count * 8]
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    Some(entries)
}

/// Depth-first search for the body of the first box with the given FourCC.
fn find_first_body<'a>(data: &'a [u8], target: &[u8; 4]) -> Option<&'a [u8]> {
    let mut frames = vec![(0usize, data.len())];
    while let Some((mut offset, limit)) = frames.pop() {
        while let Ok(Some(child)) = child_at(data, offset, limit) {
            if &child.fourcc == target {
                return Some(&data[child.body_start..child.end]);
            }
            if child.end - child.body_start >= 8 {
                frames.push((child.body_start, child.end));
            }
            offset = child.end;
        }
    }
    None
}
