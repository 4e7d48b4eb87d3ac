//! Top-level box scan.
//!
//! The scanner walks the outermost layer of an ISO-BMFF file only. It never
//! descends into containers; the chunk-offset fixup engine owns the nested
//! walk because only top-level boxes participate in the output layout.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};
use tracing::debug;

use crate::box_utils::fourcc_to_string;
use crate::error::Mp4Error;

/// A top-level box located during the scan. Offsets are absolute file offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxRecord {
    pub fourcc: [u8; 4],
    pub header_offset: u64,
    /// 8 for a plain header, 16 when the size is 64-bit extended.
    pub header_len: u8,
    pub payload_offset: u64,
    pub payload_len: u64,
}

impl BoxRecord {
    /// Total on-disk length, header included.
    pub fn total_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }

    /// Offset one past the last byte of the box.
    pub fn end_offset(&self) -> u64 {
        self.header_offset + self.total_len()
    }
}

/// Scan the top-level boxes of `reader`, returning them in file order.
///
/// The records form a non-overlapping cover of `[0, len)`, or of a prefix of
/// it when a `size == 0` box claims the remainder of the file. The reader is
/// left at an unspecified position.
pub fn scan_boxes<R: Read + Seek>(reader: &mut R) -> Result<Vec<BoxRecord>, Mp4Error> {
    let len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut records = Vec::new();
    let mut offset = 0u64;

    while offset < len {
        if len - offset < 8 {
            return Err(Mp4Error::TruncatedBox { offset });
        }

        let size32 = reader.read_u32::<BigEndian>()? as u64;
        let mut fourcc = [0u8; 4];
        reader.read_exact(&mut fourcc)?;

        let (total_len, header_len) = match size32 {
            1 => {
                if len - offset < 16 {
                    return Err(Mp4Error::TruncatedBox { offset });
                }
                let size64 = reader.read_u64::<BigEndian>()?;
                if size64 < 16 {
                    return Err(Mp4Error::InvalidBoxSize {
                        size: size64,
                        offset,
                    });
                }
                (size64, 16u8)
            }
            // The box claims everything up to EOF and ends the scan.
            0 => (len - offset, 8u8),
            s if s < 8 => {
                return Err(Mp4Error::InvalidBoxSize { size: s, offset });
            }
            s => (s, 8u8),
        };

        if offset + total_len > len {
            return Err(Mp4Error::InvalidBoxSize {
                size: total_len,
                offset,
            });
        }

        let record = BoxRecord {
            fourcc,
            header_offset: offset,
            header_len,
            payload_offset: offset + header_len as u64,
            payload_len: total_len - header_len as u64,
        };
        debug!(
            fourcc = %fourcc_to_string(&fourcc),
            offset,
            total_len,
            "Found top-level box"
        );
        records.push(record);

        if size32 == 0 {
            break;
        }

        offset += total_len;
        reader.seek(SeekFrom::Start(offset))?;
    }

    Ok(records)
}
