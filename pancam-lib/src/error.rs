#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Not enough bytes")]
    NotEnoughData {
        /// Number of bytes we got
        actual: usize,
        /// Minimum number of expected bytes
        minimum: usize,
    },

    /// The downlink log does not have the expected line structure.
    #[error("log format error at line {line}: {msg}")]
    Format { line: usize, msg: String },

    /// A fragment arrived that cannot be placed in any transfer.
    #[error("sequence error for unit {unit_id}: {msg}")]
    Sequence { unit_id: u16, msg: String },

    /// Image header bytes failed validation.
    #[error("image header error: {0}")]
    Header(String),
}

pub type Result<T> = std::result::Result<T, Error>;
