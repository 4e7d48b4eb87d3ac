//! Streaming output writer.
//!
//! Emits the planned layout to the sink: `ftyp` verbatim, a fresh `moov`
//! header plus the fixed-up payload, then every remaining top-level box
//! copied header-and-payload from the input. Large boxes are copied in
//! fixed-size chunks so `mdat` never has to fit in memory, with the
//! cancellation token polled and a progress fraction reported per chunk.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mp4::{BoxRecord, LayoutPlan};

use crate::error::OptimizerError;

pub(crate) struct WriteProgress<'a> {
    pub input_len: u64,
    pub bytes_written: u64,
    pub report: &'a mut dyn FnMut(f32),
}

impl WriteProgress<'_> {
    fn advance(&mut self, bytes: u64) {
        self.bytes_written += bytes;
        (self.report)(self.bytes_written as f32 / self.input_len as f32);
    }
}

/// Copy the input byte-for-byte; the fast path for already-optimized files.
pub(crate) fn copy_file_verbatim<R: Read + Seek, W: Write>(
    reader: &mut R,
    writer: &mut W,
    input_len: u64,
    chunk_size: usize,
    token: &CancellationToken,
    progress: &mut WriteProgress<'_>,
) -> Result<(), OptimizerError> {
    reader.seek(SeekFrom::Start(0))?;
    copy_chunked(reader, writer, input_len, chunk_size, token, progress)?;
    (progress.report)(1.0);
    Ok(())
}

/// Write the remuxed layout.
pub(crate) fn write_fast_start<R: Read + Seek, W: Write>(
    reader: &mut R,
    writer: &mut W,
    plan: &LayoutPlan,
    moov_payload: &[u8],
    chunk_size: usize,
    token: &CancellationToken,
    progress: &mut WriteProgress<'_>,
) -> Result<(), OptimizerError> {
    if let Some(ftyp) = &plan.ftyp {
        copy_box(reader, writer, ftyp, chunk_size, token, progress)?;
    }

    write_moov_header(writer, plan.moov_header_len, moov_payload.len() as u64)?;
    writer.write_all(moov_payload)?;
    progress.advance(plan.moov_header_len as u64 + moov_payload.len() as u64);

    for record in &plan.rest {
        if token.is_cancelled() {
            return Err(OptimizerError::Cancelled);
        }
        copy_box(reader, writer, record, chunk_size, token, progress)?;
    }

    (progress.report)(1.0);
    Ok(())
}

fn write_moov_header<W: Write>(
    writer: &mut W,
    header_len: u8,
    payload_len: u64,
) -> Result<(), OptimizerError> {
    if header_len == 8 {
        writer.write_u32::<BigEndian>((payload_len + 8) as u32)?;
        writer.write_all(b"moov")?;
    } else {
        writer.write_u32::<BigEndian>(1)?;
        writer.write_all(b"moov")?;
        writer.write_u64::<BigEndian>(payload_len + 16)?;
    }
    Ok(())
}

/// Copy one top-level box, header and payload, from its input position.
fn copy_box<R: Read + Seek, W: Write>(
    reader: &mut R,
    writer: &mut W,
    record: &BoxRecord,
    chunk_size: usize,
    token: &CancellationToken,
    progress: &mut WriteProgress<'_>,
) -> Result<(), OptimizerError> {
    debug!(
        fourcc = %mp4::fourcc_to_string(&record.fourcc),
        offset = record.header_offset,
        len = record.total_len(),
        "Copying box"
    );
    reader.seek(SeekFrom::Start(record.header_offset))?;
    copy_chunked(reader, writer, record.total_len(), chunk_size, token, progress)
}

fn copy_chunked<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    chunk_size: usize,
    token: &CancellationToken,
    progress: &mut WriteProgress<'_>,
) -> Result<(), OptimizerError> {
    let mut buf = vec![0u8; chunk_size];
    let mut remaining = len;

    while remaining > 0 {
        if token.is_cancelled() {
            return Err(OptimizerError::Cancelled);
        }

        let n = remaining.min(chunk_size as u64) as usize;
        reader.read_exact(&mut buf[..n])?;
        writer.write_all(&buf[..n])?;
        remaining -= n as u64;
        progress.advance(n as u64);
    }

    Ok(())
}
