#![allow(dead_code)]
use std::{fs, path::Path, path::PathBuf};

use pancam::ldt::{CONTINUATION_FRAGMENT_TAG, FIRST_FRAGMENT_TAG};

pub const GROUND_TIME: &str = "14/11/2019 17:03:24.500";
pub const SCIENCE: u8 = 0b10;
pub const HOUSEKEEPING: u8 = 0b01;

/// Builds downlink log text.
pub struct LogBuilder {
    text: String,
}

impl Default for LogBuilder {
    fn default() -> Self {
        LogBuilder {
            text: "DATA EXPORT\nSOURCE: ROVER\nFORMAT: HA\n\n<BEGIN_DATA_BLOCK>\n".to_string(),
        }
    }
}

impl LogBuilder {
    pub fn record(mut self, tag: &str, time: &str, payload: &[u8]) -> Self {
        self.text.push_str("<PKT>\n");
        self.text.push_str(&format!("<GROUND_REF_TM> {time}\n"));
        self.text.push_str(&format!("<PKT_NAME>  {tag}\n"));
        self.text.push_str(&format!("<LENGTH>{}\n", payload.len()));
        for chunk in payload.chunks(32) {
            self.text.push_str(&hex::encode_upper(chunk));
            self.text.push('\n');
        }
        self
    }

    /// Add a first fragment for a PanCam science transfer.
    pub fn first(self, unit_id: u16, seq: u16, declared_len: u32, data: &[u8]) -> Self {
        self.first_with(GROUND_TIME, unit_id, seq, 0x5, SCIENCE, declared_len, data)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn first_with(
        self,
        time: &str,
        unit_id: u16,
        seq: u16,
        instrument_id: u8,
        data_kind: u8,
        declared_len: u32,
        data: &[u8],
    ) -> Self {
        let mut payload = vec![0u8; 16];
        payload.extend_from_slice(&unit_id.to_be_bytes());
        payload.extend_from_slice(&seq.to_be_bytes());
        payload.push(0);
        payload.push((instrument_id & 0xf) << 3 | (data_kind & 0x3) << 1);
        payload.push(0x01);
        payload.extend_from_slice(&declared_len.to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(data);
        payload.extend_from_slice(&[0xee, 0xee]);
        self.record(FIRST_FRAGMENT_TAG, time, &payload)
    }

    pub fn continuation(self, unit_id: u16, seq: u16, data: &[u8]) -> Self {
        let mut payload = vec![0u8; 16];
        payload.extend_from_slice(&unit_id.to_be_bytes());
        payload.extend_from_slice(&seq.to_be_bytes());
        payload.extend_from_slice(data);
        payload.extend_from_slice(&[0xee, 0xee]);
        self.record(CONTINUATION_FRAGMENT_TAG, GROUND_TIME, &payload)
    }

    /// Add a record that takes no part in reassembly.
    pub fn other(self, len: usize) -> Self {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        self.record("AB.TM.MRSP8001", GROUND_TIME, &payload)
    }

    pub fn build(mut self) -> String {
        self.text.push_str("<END_DATA_BLOCK>\n");
        self.text
    }
}

/// Deterministic image data of `len` bytes.
pub fn image_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

/// Sorted names of the files in `dir`. Empty if `dir` does not exist.
pub fn file_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::default();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

pub fn output_dir(tmpdir: &tempfile::TempDir) -> PathBuf {
    tmpdir.path().join("IMG_RAW")
}
