#![doc = include_str!("../README.md")]

mod bits;
mod error;

pub mod halog;
pub mod header;
pub mod ldt;
pub mod writer;

pub use error::{Error, Result};
pub use halog::{read_records, LogRecord};
pub use header::{decode as decode_header, read_header, CameraHeader, ImageHeader};
pub use ldt::{PacketKind, Reassembler, ReassemblerConfig, Report, Warning};
