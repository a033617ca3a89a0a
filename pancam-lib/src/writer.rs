use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::Result;

/// Writes reassembled image data into an output directory.
///
/// No file handles are kept between calls; every call opens, writes and closes
/// its file.
#[derive(Debug, Clone)]
pub struct ImageWriter {
    dir: PathBuf,
}

impl ImageWriter {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        ImageWriter { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create `name` in the output directory containing `data`, removing any
    /// existing file with the same name first. The output directory is created
    /// if it does not exist.
    ///
    /// # Errors
    /// Any I/O error creating the directory, removing or writing the file.
    pub fn create(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        if !self.dir.is_dir() {
            info!("creating output directory {:?}", self.dir);
            fs::create_dir_all(&self.dir)?;
        }
        let path = self.dir.join(name);
        if path.is_file() {
            info!("deleting existing file {name}");
            fs::remove_file(&path)?;
        }
        info!("creating file {name}");
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        Ok(path)
    }

    /// Append `data` to the file at `path`.
    ///
    /// # Errors
    /// Any I/O error opening or writing the file.
    pub fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)?;
        debug!(path = %path.display(), len = data.len(), "appended");
        Ok(())
    }

    /// Rename `path` by appending `.<suffix>` to its file name, returning the
    /// new path. File contents are not modified.
    ///
    /// # Errors
    /// Any I/O error renaming the file.
    pub fn mark_partial(&self, path: &Path, suffix: &str) -> Result<PathBuf> {
        let mut renamed = path.as_os_str().to_owned();
        renamed.push(".");
        renamed.push(suffix);
        let renamed = PathBuf::from(renamed);
        fs::rename(path, &renamed)?;
        info!("renamed {:?} to {:?}", path, renamed);
        Ok(renamed)
    }
}
