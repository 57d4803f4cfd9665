use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::materialize::DirRecord;
use crate::{Error, Result};

/// Buffered output file that remembers its path for diagnostics.
struct RecordFile {
    out: BufWriter<File>,
    path: PathBuf,
}

impl RecordFile {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::path_io("create", path, e))?;
        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: &Path) -> Self {
        Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| Error::path_io("write", &self.path, e))
    }

    fn finish(self) -> Result<()> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|e| Error::path_io("flush", &path, e.into_error()))?;
        file.sync_all().map_err(|e| Error::path_io("fsync", &path, e))
    }
}

/// Paths for the archive tool's files-from mode, one per line, in visit order.
pub struct ArchiveManifest {
    file: RecordFile,
    entries: Vec<PathBuf>,
}

impl ArchiveManifest {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: RecordFile::create(path)?,
            entries: Vec::new(),
        })
    }

    pub fn from_file(file: File, path: &Path) -> Self {
        Self {
            file: RecordFile::from_file(file, path),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, rel: &Path) -> Result<()> {
        let mut line = rel.as_os_str().as_bytes().to_vec();
        line.push(b'\n');
        self.file.write(&line)?;
        self.entries.push(rel.to_path_buf());
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<PathBuf>> {
        self.file.finish()?;
        Ok(self.entries)
    }
}

/// DirectoryManifest output of the remote capture pass.
pub struct DirectoryManifest {
    file: RecordFile,
    records: u64,
}

impl DirectoryManifest {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: RecordFile::create(path)?,
            records: 0,
        })
    }

    pub fn push(&mut self, record: &DirRecord) -> Result<()> {
        self.file.write(&record.to_line())?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn finish(self) -> Result<()> {
        self.file.finish()
    }
}

/// LinkManifest output: an optional previous-backup time line, then NUL-terminated paths.
pub struct LinkManifest {
    file: RecordFile,
    has_header: bool,
    links: u64,
}

impl LinkManifest {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: RecordFile::create(path)?,
            has_header: false,
            links: 0,
        })
    }

    /// Must precede every path record.
    pub fn write_previous_time(&mut self, secs: i64) -> Result<()> {
        if self.has_header || self.links > 0 {
            return Err(Error::Manifest {
                message: format!("{}: previous time written twice or late", self.file.path.display()),
            });
        }
        self.file.write(format!("0x{:08x}\n", secs).as_bytes())?;
        self.has_header = true;
        Ok(())
    }

    pub fn push(&mut self, rel: &Path) -> Result<()> {
        if !self.has_header {
            return Err(Error::Manifest {
                message: format!("{}: link recorded without previous time", self.file.path.display()),
            });
        }
        let mut record = rel.as_os_str().as_bytes().to_vec();
        record.push(0);
        self.file.write(&record)?;
        self.links += 1;
        Ok(())
    }

    pub fn links(&self) -> u64 {
        self.links
    }

    pub fn finish(self) -> Result<()> {
        self.file.finish()
    }
}
