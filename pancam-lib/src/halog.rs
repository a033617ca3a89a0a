//! Reader for rover downlink `.ha` log files.
//!
//! A log is line oriented text. It starts with a 5 line preamble terminated by
//! `<BEGIN_DATA_BLOCK>`, followed by packet records, and ends with
//! `<END_DATA_BLOCK>`. Each record is a 4 line header block whose last line is
//! `<LENGTH>` followed by the decimal payload length in bytes, then the payload
//! as hex text with up to 32 bytes per line.
use std::io::{BufRead, Lines};

use chrono::NaiveDateTime;
use tracing::trace;

use crate::{Error, Result};

pub const BEGIN_DATA_BLOCK: &str = "<BEGIN_DATA_BLOCK>";
pub const END_DATA_BLOCK: &str = "<END_DATA_BLOCK>";
pub const LENGTH_TAG: &str = "<LENGTH>";

/// Number of payload bytes encoded on a single data line.
pub const BYTES_PER_LINE: usize = 32;
/// Format of the ground reference time in record headers.
pub const GROUND_TIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S%.f";

const PREAMBLE_LINES: usize = 5;
const HEADER_LINES: usize = 4;
/// Column where the ground reference time starts on header line 2
const TIME_COLUMN: usize = 16;
/// Column where the packet type tag starts on header line 3
const TAG_COLUMN: usize = 12;
const MAX_PREALLOC_LINES: usize = 1024;

/// A single packet record from a downlink log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    line: usize,
    header: [String; HEADER_LINES],
    len: usize,
    data: Vec<String>,
}

impl LogRecord {
    /// 1-based line number of the first header line of this record.
    #[must_use]
    pub fn line(&self) -> usize {
        self.line
    }

    /// Station routing tag identifying the packet type, e.g., `AB.TM.MRSS0697`.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        self.header[2].get(TAG_COLUMN..).unwrap_or_default().trim_end()
    }

    /// The ground reference time text as it appears in the log.
    #[must_use]
    pub fn ground_reference_time(&self) -> &str {
        self.header[1].get(TIME_COLUMN..).unwrap_or_default().trim()
    }

    /// Parse the ground reference time.
    ///
    /// # Errors
    /// [Error::Format] if the time does not match [GROUND_TIME_FORMAT].
    pub fn ground_time(&self) -> Result<NaiveDateTime> {
        let text = self.ground_reference_time();
        NaiveDateTime::parse_from_str(text, GROUND_TIME_FORMAT).map_err(|err| Error::Format {
            line: self.line + 1,
            msg: format!("invalid ground reference time {text:?}: {err}"),
        })
    }

    /// Payload length in bytes declared by the `<LENGTH>` line.
    #[must_use]
    pub fn declared_len(&self) -> usize {
        self.len
    }

    /// The hex encoded payload lines.
    #[must_use]
    pub fn data_lines(&self) -> &[String] {
        &self.data
    }

    /// Decode the payload lines into bytes.
    ///
    /// # Errors
    /// [Error::Format] if the payload lines are not valid hex.
    pub fn payload(&self) -> Result<Vec<u8>> {
        hex::decode(self.data.concat()).map_err(|err| Error::Format {
            line: self.line + HEADER_LINES,
            msg: format!("invalid payload hex: {err}"),
        })
    }
}

/// Iterator over the [LogRecord]s of a single log. See [read_records].
pub struct LogRecords<R>
where
    R: BufRead,
{
    lines: Lines<R>,
    line: usize,
    started: bool,
    done: bool,
}

impl<R> LogRecords<R>
where
    R: BufRead,
{
    fn new(reader: R) -> Self {
        LogRecords {
            lines: reader.lines(),
            line: 0,
            started: false,
            done: false,
        }
    }

    fn next_line(&mut self) -> Result<String> {
        match self.lines.next() {
            Some(zult) => {
                self.line += 1;
                Ok(zult?)
            }
            None => Err(Error::Format {
                line: self.line,
                msg: format!("log ended before {END_DATA_BLOCK}"),
            }),
        }
    }

    fn read_preamble(&mut self) -> Result<()> {
        let mut last = String::new();
        for _ in 0..PREAMBLE_LINES {
            last = self.next_line()?;
        }
        if last.trim_end() != BEGIN_DATA_BLOCK {
            return Err(Error::Format {
                line: self.line,
                msg: format!("expected {BEGIN_DATA_BLOCK}, got {last:?}"),
            });
        }
        Ok(())
    }

    fn read_record(&mut self) -> Result<Option<LogRecord>> {
        if !self.started {
            self.started = true;
            self.read_preamble()?;
        }

        let first = self.next_line()?;
        if first.trim_end() == END_DATA_BLOCK {
            return Ok(None);
        }
        let line = self.line;
        let header = [first, self.next_line()?, self.next_line()?, self.next_line()?];

        let Some(len) = header[3].strip_prefix(LENGTH_TAG) else {
            return Err(Error::Format {
                line: self.line,
                msg: format!("expected {LENGTH_TAG} line, got {:?}", header[3]),
            });
        };
        let len: usize = len.trim().parse().map_err(|_| Error::Format {
            line: self.line,
            msg: format!("invalid packet length {len:?}"),
        })?;

        // length is untrusted input
        let num_lines = len.div_ceil(BYTES_PER_LINE);
        let mut data = Vec::with_capacity(num_lines.min(MAX_PREALLOC_LINES));
        for _ in 0..num_lines {
            data.push(self.next_line()?.trim_end().to_string());
        }
        trace!(line, len, "read record");

        Ok(Some(LogRecord {
            line,
            header,
            len,
            data,
        }))
    }
}

impl<R> Iterator for LogRecords<R>
where
    R: BufRead,
{
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Return an iterator providing the [LogRecord]s of a downlink log.
///
/// The iterator ends after `<END_DATA_BLOCK>` or after the first error. Records
/// are produced lazily, so a format error late in the log is only reported
/// after all the records before it.
///
/// # Examples
/// ```
/// use pancam::read_records;
///
/// let log = "\
/// line 1
/// line 2
/// line 3
/// line 4
/// <BEGIN_DATA_BLOCK>
/// <PKT>
/// <GROUND_REF_TM> 31/10/2019 17:18:02.123
/// <PKT_NAME>  AB.TM.MRSP8001
/// <LENGTH>4
/// deadbeef
/// <END_DATA_BLOCK>
/// ";
/// let records: Vec<_> = read_records(log.as_bytes()).collect();
/// assert_eq!(records.len(), 1);
/// let record = records[0].as_ref().unwrap();
/// assert_eq!(record.type_tag(), "AB.TM.MRSP8001");
/// assert_eq!(record.payload().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
/// ```
pub fn read_records<R>(reader: R) -> LogRecords<R>
where
    R: BufRead,
{
    LogRecords::new(reader)
}
