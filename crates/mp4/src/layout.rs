//! Output layout planning.
//!
//! Given the scanned top-level boxes, decide where every box lands in the
//! optimized file: `ftyp` first when present, then the relocated `moov`,
//! then every other box in its original scan order. The only derived value
//! that matters downstream is `mdat_delta`, the uniform shift applied to
//! every chunk-offset entry.

use tracing::{debug, warn};

use crate::error::Mp4Error;
use crate::scanner::BoxRecord;

/// The planned output arrangement for one optimization run.
#[derive(Debug, Clone)]
pub struct LayoutPlan {
    pub ftyp: Option<BoxRecord>,
    pub moov: BoxRecord,
    /// First `mdat` in scan order; the delta is computed against it.
    pub mdat: BoxRecord,
    /// Every top-level box other than the chosen `ftyp` and `moov`, in scan
    /// order. Includes `mdat` so the writer can emit them verbatim.
    pub rest: Vec<BoxRecord>,
    /// `new_mdat_header_offset - old_mdat_header_offset`.
    pub mdat_delta: i64,
    /// 8, or 16 when the relocated `moov` needs an extended-size header.
    pub moov_header_len: u8,
}

impl LayoutPlan {
    /// Whether the input already has `moov` ahead of `mdat`, in which case a
    /// plain copy preserves the fast-start property.
    pub fn is_already_fast_start(&self) -> bool {
        self.moov.header_offset < self.mdat.header_offset
    }

    /// Total length of the output file.
    pub fn output_len(&self) -> u64 {
        let ftyp_len = self.ftyp.map_or(0, |b| b.total_len());
        let moov_len = self.moov_header_len as u64 + self.moov.payload_len;
        ftyp_len + moov_len + self.rest.iter().map(|b| b.total_len()).sum::<u64>()
    }
}

/// Plan the fast-start layout for the scanned `records`.
///
/// Fails with [`Mp4Error::MissingBox`] when no `moov` or no `mdat` is
/// present. Duplicate `ftyp`/`moov` boxes are tolerated: the first of each
/// is used and later ones are carried through as ordinary boxes.
pub fn plan_layout(records: &[BoxRecord]) -> Result<LayoutPlan, Mp4Error> {
    let moov = *first_of(records, b"moov").ok_or(Mp4Error::MissingBox("moov"))?;
    first_of(records, b"mdat").ok_or(Mp4Error::MissingBox("mdat"))?;
    let ftyp = first_of(records, b"ftyp").copied();

    let moov_header_len = required_header_len(moov.payload_len);

    let ftyp_len = ftyp.map_or(0, |b| b.total_len());
    let moov_len = moov_header_len as u64 + moov.payload_len;

    // Assign output offsets to every remaining box in scan order; the delta
    // of the first mdat is the one the chunk-offset tables need.
    let mut cursor = ftyp_len + moov_len;
    let mut rest = Vec::with_capacity(records.len());
    let mut mdat = None;
    let mut mdat_delta = 0i64;

    for record in records {
        if is_same_box(record, &moov) {
            continue;
        }
        if let Some(f) = &ftyp
            && is_same_box(record, f)
        {
            continue;
        }

        match &record.fourcc {
            b"moov" => warn!(
                offset = record.header_offset,
                "Duplicate moov box; copying it verbatim"
            ),
            b"ftyp" => warn!(
                offset = record.header_offset,
                "Duplicate ftyp box; copying it verbatim"
            ),
            b"mdat" if mdat.is_none() => {
                mdat = Some(*record);
                mdat_delta = cursor as i64 - record.header_offset as i64;
            }
            _ => {}
        }

        rest.push(*record);
        cursor += record.total_len();
    }

    // Presence was checked above.
    let mdat = mdat.ok_or(Mp4Error::MissingBox("mdat"))?;

    debug!(
        mdat_delta,
        moov_header_len,
        output_len = cursor,
        "Planned fast-start layout"
    );

    Ok(LayoutPlan {
        ftyp,
        moov,
        mdat,
        rest,
        mdat_delta,
        moov_header_len,
    })
}

/// Whether the first `moov` precedes the first `mdat` in scan order.
///
/// Fails with [`Mp4Error::MissingBox`] when either is absent.
pub fn is_fast_start(records: &[BoxRecord]) -> Result<bool, Mp4Error> {
    let moov = first_of(records, b"moov").ok_or(Mp4Error::MissingBox("moov"))?;
    let mdat = first_of(records, b"mdat").ok_or(Mp4Error::MissingBox("mdat"))?;
    Ok(moov.header_offset < mdat.header_offset)
}

fn first_of<'a>(records: &'a [BoxRecord], fourcc: &[u8; 4]) -> Option<&'a BoxRecord> {
    records.iter().find(|r| &r.fourcc == fourcc)
}

fn is_same_box(a: &BoxRecord, b: &BoxRecord) -> bool {
    a.header_offset == b.header_offset
}

/// Header length the relocated `moov` needs: 16 bytes once the total box
/// length no longer fits a 32-bit size field.
fn required_header_len(payload_len: u64) -> u8 {
    if payload_len + 8 > u32::MAX as u64 {
        16
    } else {
        8
    }
}
