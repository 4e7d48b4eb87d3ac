//! ISO-BMFF (ISO Base Media File Format) box handling for fast-start
//! optimization.
//!
//! This crate provides just enough MP4/MOV structure awareness to relocate a
//! `moov` box ahead of the media payload: a top-level box scanner, an engine
//! that rewrites the absolute chunk-offset tables (`stco`/`co64`) buried
//! inside `moov`, and a planner that derives the output layout and the offset
//! delta the relocation implies. It operates on byte sources and in-memory
//! buffers only; file handling and streaming output live in `mp4-fix`.

mod box_utils;
mod chunk_offsets;
mod error;
mod layout;
mod scanner;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use box_utils::fourcc_to_string;
pub use chunk_offsets::apply_chunk_offset_delta;
pub use error::Mp4Error;
pub use layout::{LayoutPlan, is_fast_start, plan_layout};
pub use scanner::{BoxRecord, scan_boxes};
