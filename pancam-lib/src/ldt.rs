//! Logical data transfer (LDT) reassembly.
//!
//! Science data is downlinked as LDTs. Each transfer starts with a first
//! fragment packet carrying the declared data length and instrument ownership,
//! followed by continuation fragments carrying the rest of the data. All
//! fragments share the transfer's unit id and carry an increasing sequence
//! number.
//!
//! Fragment payload layout (byte offsets):
//!
//! | Offset | Size | First fragment          | Continuation fragment |
//! |--------|------|-------------------------|-----------------------|
//! | 16     | 2    | unit id                 | unit id               |
//! | 18     | 2    | sequence number         | sequence number       |
//! | 20     | -    |                         | data                  |
//! | 21     | 2    | file id bit fields      |                       |
//! | 23     | 4    | declared data length    |                       |
//! | 29     | -    | data                    |                       |
//!
//! The last 2 bytes of every fragment are a trailer that is not part of the data.
use std::{
    collections::HashMap,
    fmt::Display,
    io::BufRead,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::{
    bits,
    halog::{read_records, LogRecord},
    writer::ImageWriter,
    Error, Result,
};

/// Packet type tag of the first fragment of a transfer.
pub const FIRST_FRAGMENT_TAG: &str = "AB.TM.MRSS0697";
/// Packet type tag of the continuation fragments of a transfer.
pub const CONTINUATION_FRAGMENT_TAG: &str = "AB.TM.MRSS0698";
/// Instrument id of PanCam in the file id field.
pub const PANCAM_INSTRUMENT_ID: u8 = 0x5;

const LENGTH_OFFSET: usize = 23;
const FIRST_DATA_OFFSET: usize = 29;
const CONTINUATION_DATA_OFFSET: usize = 20;
const TRAILER_LEN: usize = 2;

/// How a log record takes part in reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    FirstFragment,
    ContinuationFragment,
    Other,
}

impl PacketKind {
    #[must_use]
    pub fn classify(tag: &str) -> Self {
        match tag {
            FIRST_FRAGMENT_TAG => PacketKind::FirstFragment,
            CONTINUATION_FRAGMENT_TAG => PacketKind::ContinuationFragment,
            _ => PacketKind::Other,
        }
    }
}

impl From<&LogRecord> for PacketKind {
    fn from(record: &LogRecord) -> Self {
        PacketKind::classify(record.type_tag())
    }
}

/// Transfer identification common to first and continuation fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FragmentHeader {
    pub unit_id: u16,
    pub seq: u16,
}

impl FragmentHeader {
    /// Byte offset of the header in the fragment payload.
    pub const OFFSET: usize = 16;
    pub const LEN: usize = 4;

    /// Decode from fragment payload bytes. Returns `None` if there are not enough
    /// bytes to construct the header.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(Self::OFFSET..Self::OFFSET + Self::LEN)?;
        Some(FragmentHeader {
            unit_id: u16::from_be_bytes([buf[0], buf[1]]),
            seq: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

/// File identification bit fields of a first fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileId {
    pub flag: u8,
    pub instrument_id: u8,
    /// Data kind flags; bit 1 set means science data.
    pub data_kind: u8,
    pub spare: u8,
    pub file_type: u8,
}

impl FileId {
    /// Byte offset of the file id in the first fragment payload.
    pub const OFFSET: usize = 21;
    pub const LEN: usize = 2;

    /// Decode from first fragment payload bytes. Returns `None` if there are not
    /// enough bytes.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(Self::OFFSET..Self::OFFSET + Self::LEN)?;
        Some(FileId {
            flag: bits::extract(buf, 0, 1) as u8,
            instrument_id: bits::extract(buf, 1, 4) as u8,
            data_kind: bits::extract(buf, 5, 2) as u8,
            spare: bits::extract(buf, 7, 1) as u8,
            file_type: bits::extract(buf, 8, 8) as u8,
        })
    }

    #[must_use]
    pub fn is_science(&self) -> bool {
        self.data_kind & 0x2 == 0x2
    }
}

/// Reassembly settings.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ReassemblerConfig {
    /// Directory reassembled files are written to.
    #[builder(default = PathBuf::from("IMG_RAW"))]
    pub output_dir: PathBuf,
    /// Only transfers owned by this instrument are written.
    #[builder(default = PANCAM_INSTRUMENT_ID)]
    pub instrument_id: u8,
    /// Extension of reassembled files.
    #[builder(default = String::from("pci_raw"), setter(into))]
    pub extension: String,
    /// Suffix appended to files of transfers found to be missing data.
    #[builder(default = String::from("part"), setter(into))]
    pub partial_suffix: String,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Tracking state of a single transfer.
#[derive(Debug, Clone, Serialize)]
pub struct ReassemblyUnit {
    /// True when this transfer belongs to the configured instrument and carries
    /// science data, i.e., it is written to disk.
    pub is_target: bool,
    /// Sequence number of the last fragment seen.
    pub last_seq: u16,
    /// Data length declared by the first fragment. Zero for non-targets.
    pub expected_len: u32,
    pub bytes_written: u64,
    /// Current location of the output file, if any.
    pub output_path: Option<PathBuf>,
}

impl ReassemblyUnit {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_written == u64::from(self.expected_len)
    }
}

/// Non-fatal conditions found during reassembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A first fragment arrived for a unit id that is already tracked.
    DuplicateUnit { unit_id: u16 },
    /// A continuation fragment did not follow the previous sequence number.
    SequenceGap { unit_id: u16, expected: u16, got: u16 },
    /// A transfer ended with fewer or more bytes than it declared. Its file was
    /// renamed to `path`.
    MissingData {
        unit_id: u16,
        expected: u32,
        actual: u64,
        path: PathBuf,
    },
}

impl Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::DuplicateUnit { unit_id } => {
                write!(f, "2 first fragments with the same unit id {unit_id}")
            }
            Warning::SequenceGap {
                unit_id,
                expected,
                got,
            } => write!(
                f,
                "unit {unit_id} fragments not sequential; expected {expected}, got {got}"
            ),
            Warning::MissingData {
                unit_id,
                expected,
                actual,
                path,
            } => write!(
                f,
                "unit {unit_id} missing data; expected {expected} bytes, wrote {actual}; renamed to {}",
                path.display()
            ),
        }
    }
}

/// Counts and findings from processing a log.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Report {
    pub records: usize,
    pub first_fragments: usize,
    pub continuation_fragments: usize,
    /// Fragments of transfers that are not targets.
    pub skipped_fragments: usize,
    /// Files created, at the path they were created with.
    pub created: Vec<PathBuf>,
    /// Files renamed as partial.
    pub partial: Vec<PathBuf>,
    pub warnings: Vec<Warning>,
}

impl Report {
    fn warn(&mut self, warning: Warning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }
}

fn fragment_data(payload: &[u8], start: usize) -> Result<&[u8]> {
    let minimum = start + TRAILER_LEN;
    if payload.len() < minimum {
        return Err(Error::NotEnoughData {
            actual: payload.len(),
            minimum,
        });
    }
    Ok(&payload[start..payload.len() - TRAILER_LEN])
}

fn fragment_header(payload: &[u8]) -> Result<FragmentHeader> {
    FragmentHeader::decode(payload).ok_or(Error::NotEnoughData {
        actual: payload.len(),
        minimum: FragmentHeader::OFFSET + FragmentHeader::LEN,
    })
}

/// Rebuilds transferred files from the fragments found in downlink logs.
///
/// State is kept across calls to [Reassembler::process] so a transfer may
/// continue in the next log given to the same instance. Fragments must be
/// provided in log order.
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblerConfig,
    writer: ImageWriter,
    units: HashMap<u16, ReassemblyUnit>,
    // unit id of the most recently started target transfer
    active: Option<u16>,
}

impl Reassembler {
    #[must_use]
    pub fn new(config: ReassemblerConfig) -> Self {
        let writer = ImageWriter::new(config.output_dir.clone());
        Reassembler {
            config,
            writer,
            units: HashMap::default(),
            active: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    /// Tracking state for `unit_id`, if a first fragment has been seen for it.
    #[must_use]
    pub fn unit(&self, unit_id: u16) -> Option<&ReassemblyUnit> {
        self.units.get(&unit_id)
    }

    /// Target transfers that have not (yet) written their declared length, in
    /// unit id order.
    ///
    /// Nothing is renamed for these; the missing data check only happens when
    /// the next transfer starts.
    pub fn pending(&self) -> impl Iterator<Item = (u16, &ReassemblyUnit)> {
        let mut pending: Vec<(u16, &ReassemblyUnit)> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.is_target && !unit.is_complete())
            .map(|(id, unit)| (*id, unit))
            .collect();
        pending.sort_unstable_by_key(|(id, _)| *id);
        pending.into_iter()
    }

    /// Reassemble all transfers in the log read from `reader`.
    ///
    /// # Errors
    /// [Error::Format] for a malformed log, [Error::Sequence] for a continuation
    /// fragment without a first fragment, [Error::NotEnoughData] for fragments
    /// too short to decode, and [Error::Io] for failures writing output. Files
    /// already written are left as is.
    pub fn process<R>(&mut self, reader: R) -> Result<Report>
    where
        R: BufRead,
    {
        let mut report = Report::default();
        for zult in read_records(reader) {
            let record = zult?;
            self.push(&record, &mut report)?;
        }
        debug!(
            records = report.records,
            created = report.created.len(),
            warnings = report.warnings.len(),
            "log processed"
        );
        Ok(report)
    }

    /// Handle a single log record, recording results in `report`.
    ///
    /// # Errors
    /// See [Reassembler::process].
    pub fn push(&mut self, record: &LogRecord, report: &mut Report) -> Result<()> {
        report.records += 1;
        match PacketKind::from(record) {
            PacketKind::FirstFragment => {
                report.first_fragments += 1;
                self.handle_first(record, report)
            }
            PacketKind::ContinuationFragment => {
                report.continuation_fragments += 1;
                self.handle_continuation(record, report)
            }
            PacketKind::Other => {
                trace!(line = record.line(), tag = record.type_tag(), "skipping record");
                Ok(())
            }
        }
    }

    fn handle_first(&mut self, record: &LogRecord, report: &mut Report) -> Result<()> {
        let payload = record.payload()?;
        let header = fragment_header(&payload)?;
        debug!(line = record.line(), unit_id = header.unit_id, seq = header.seq, "first fragment");

        if self.units.contains_key(&header.unit_id) {
            report.warn(Warning::DuplicateUnit {
                unit_id: header.unit_id,
            });
        }

        let file_id = FileId::decode(&payload).ok_or(Error::NotEnoughData {
            actual: payload.len(),
            minimum: FileId::OFFSET + FileId::LEN,
        })?;
        let is_target = if file_id.instrument_id != self.config.instrument_id {
            info!(unit_id = header.unit_id, instrument_id = file_id.instrument_id, "not a target instrument transfer, skipping");
            false
        } else if !file_id.is_science() {
            info!(unit_id = header.unit_id, data_kind = file_id.data_kind, "not a science transfer, skipping");
            false
        } else {
            true
        };

        // A new transfer ends the active one when it is a target itself or when it
        // reuses the active unit id.
        if is_target || self.active == Some(header.unit_id) {
            self.finish_active(report)?;
        }

        if !is_target {
            report.skipped_fragments += 1;
            self.units.insert(
                header.unit_id,
                ReassemblyUnit {
                    is_target: false,
                    last_seq: header.seq,
                    expected_len: 0,
                    bytes_written: 0,
                    output_path: None,
                },
            );
            return Ok(());
        }

        let len_bytes = payload
            .get(LENGTH_OFFSET..LENGTH_OFFSET + 4)
            .ok_or(Error::NotEnoughData {
                actual: payload.len(),
                minimum: LENGTH_OFFSET + 4,
            })?;
        let expected_len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let data = fragment_data(&payload, FIRST_DATA_OFFSET)?;

        let name = format!(
            "{}_{}.{}",
            record.ground_time()?.format("%y%m%d_%H%M%S"),
            header.unit_id,
            self.config.extension
        );
        let path = self.writer.create(&name, data)?;
        report.created.push(path.clone());

        self.units.insert(
            header.unit_id,
            ReassemblyUnit {
                is_target: true,
                last_seq: header.seq,
                expected_len,
                bytes_written: data.len() as u64,
                output_path: Some(path),
            },
        );
        self.active = Some(header.unit_id);

        Ok(())
    }

    fn handle_continuation(&mut self, record: &LogRecord, report: &mut Report) -> Result<()> {
        let payload = record.payload()?;
        let header = fragment_header(&payload)?;
        trace!(line = record.line(), unit_id = header.unit_id, seq = header.seq, "continuation fragment");

        let Some(unit) = self.units.get_mut(&header.unit_id) else {
            return Err(Error::Sequence {
                unit_id: header.unit_id,
                msg: format!(
                    "continuation fragment without first fragment at line {}",
                    record.line()
                ),
            });
        };
        if !unit.is_target {
            report.skipped_fragments += 1;
            return Ok(());
        }

        let expected = unit.last_seq.wrapping_add(1);
        if header.seq != expected {
            report.warn(Warning::SequenceGap {
                unit_id: header.unit_id,
                expected,
                got: header.seq,
            });
        }
        unit.last_seq = header.seq;

        let data = fragment_data(&payload, CONTINUATION_DATA_OFFSET)?;
        let Some(path) = &unit.output_path else {
            return Err(Error::Sequence {
                unit_id: header.unit_id,
                msg: format!("no output file for continuation at line {}", record.line()),
            });
        };
        self.writer.append(path, data)?;
        unit.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Check the active transfer wrote what it declared, renaming its file as
    /// partial if it didn't.
    fn finish_active(&mut self, report: &mut Report) -> Result<()> {
        let Some(unit_id) = self.active.take() else {
            return Ok(());
        };
        let Some(unit) = self.units.get_mut(&unit_id) else {
            return Ok(());
        };
        if unit.is_complete() {
            debug!(unit_id, bytes = unit.bytes_written, "transfer complete");
            return Ok(());
        }
        let Some(path) = &unit.output_path else {
            return Ok(());
        };
        let renamed = mark_partial(&self.writer, path, &self.config.partial_suffix)?;
        unit.output_path = Some(renamed.clone());
        report.partial.push(renamed.clone());
        report.warn(Warning::MissingData {
            unit_id,
            expected: unit.expected_len,
            actual: unit.bytes_written,
            path: renamed,
        });
        Ok(())
    }
}

fn mark_partial(writer: &ImageWriter, path: &Path, suffix: &str) -> Result<PathBuf> {
    // a file removed out from under us can't be renamed, but there's nothing to lose
    if !path.exists() {
        warn!("{path:?} no longer exists; cannot mark as partial");
        return Ok(path.to_path_buf());
    }
    writer.mark_partial(path, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(FIRST_FRAGMENT_TAG, PacketKind::FirstFragment; "first")]
    #[test_case(CONTINUATION_FRAGMENT_TAG, PacketKind::ContinuationFragment; "continuation")]
    #[test_case("AB.TM.MRSP8001", PacketKind::Other; "rover housekeeping")]
    #[test_case("AB.TM.MRSS0699", PacketKind::Other; "neighbouring tag")]
    #[test_case("", PacketKind::Other; "empty")]
    fn classify(tag: &str, expected: PacketKind) {
        assert_eq!(PacketKind::classify(tag), expected);
    }

    #[test]
    fn decode_fragment_header() {
        let mut buf = vec![0u8; 20];
        buf[16..20].copy_from_slice(&[0x00, 0x07, 0x01, 0x02]);
        let header = FragmentHeader::decode(&buf).unwrap();
        assert_eq!(header.unit_id, 7);
        assert_eq!(header.seq, 0x0102);

        assert!(FragmentHeader::decode(&buf[..19]).is_none());
    }

    #[test_case(0b0010_1100, PANCAM_INSTRUMENT_ID, 0b10, true; "pancam science")]
    #[test_case(0b0010_1010, PANCAM_INSTRUMENT_ID, 0b01, false; "pancam housekeeping")]
    #[test_case(0b1011_0110, 0x6, 0b11, true; "other instrument science")]
    fn decode_file_id(byte: u8, instrument_id: u8, data_kind: u8, science: bool) {
        let mut buf = vec![0u8; 23];
        buf[21] = byte;
        buf[22] = 0x42;
        let file_id = FileId::decode(&buf).unwrap();
        assert_eq!(file_id.instrument_id, instrument_id);
        assert_eq!(file_id.data_kind, data_kind);
        assert_eq!(file_id.is_science(), science);
        assert_eq!(file_id.file_type, 0x42);
    }

    #[test]
    fn fragment_data_trims_header_and_trailer() {
        let payload: Vec<u8> = (0..40).collect();
        let data = fragment_data(&payload, CONTINUATION_DATA_OFFSET).unwrap();
        assert_eq!(data, &payload[20..38]);

        let data = fragment_data(&payload[..31], FIRST_DATA_OFFSET).unwrap();
        assert!(data.is_empty());

        let err = fragment_data(&payload[..30], FIRST_DATA_OFFSET).unwrap_err();
        assert!(matches!(
            err,
            Error::NotEnoughData {
                actual: 30,
                minimum: 31
            }
        ));
    }

    #[test]
    fn default_config() {
        let config = ReassemblerConfig::default();
        assert_eq!(config.output_dir, PathBuf::from("IMG_RAW"));
        assert_eq!(config.instrument_id, PANCAM_INSTRUMENT_ID);
        assert_eq!(config.extension, "pci_raw");
        assert_eq!(config.partial_suffix, "part");
    }

    #[test]
    fn warning_serializes_with_kind() {
        let warning = Warning::SequenceGap {
            unit_id: 7,
            expected: 3,
            got: 4,
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["kind"], "sequence_gap");
        assert_eq!(json["got"], 4);
    }
}
