use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ml::{linear::Linear, NodeValue},
    Error, Result,
};

/// Resolves a manifest feature reference into a `frames × dim` matrix.
pub trait FeatureReader: Send + Sync {
    fn read(&self, reference: &str) -> Result<Linear>;
}

/// Receives one matrix per utterance id.
pub trait FeatureWriter {
    fn write(&mut self, id: &str, matrix: &Linear) -> Result<()>;
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveEntry {
    id: String,
    rows: usize,
    cols: usize,
    data: Vec<NodeValue>,
}

/// Reads matrices out of a line-oriented archive.
///
/// References take the form `path:offset`, where `offset` is the byte offset
/// of the entry's line. A reference without an offset reads the first entry.
#[derive(Debug, Default, Clone)]
pub struct ArchiveReader;

impl ArchiveReader {
    pub fn new() -> Self {
        Self
    }

    fn split_reference(reference: &str) -> Result<(&str, u64)> {
        match reference.rsplit_once(':') {
            Some((path, offset)) if !path.is_empty() => {
                let offset = offset.parse::<u64>().map_err(|_| {
                    Error::DataNotFound(format!("bad offset in feature reference '{reference}'"))
                })?;
                Ok((path, offset))
            }
            _ => Ok((reference, 0)),
        }
    }
}

impl FeatureReader for ArchiveReader {
    fn read(&self, reference: &str) -> Result<Linear> {
        let (path, offset) = Self::split_reference(reference)?;
        let path = Path::new(path);
        let file = File::open(&path).map_err(|e| {
            Error::DataNotFound(format!("cannot open archive '{}': {e}", path.display()))
        })?;

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(Error::DataNotFound(format!(
                "no entry at offset {offset} in '{}'",
                path.display()
            )));
        }

        let entry: ArchiveEntry = serde_json::from_str(line.trim_end())?;
        if entry.rows * entry.cols != entry.data.len() {
            return Err(Error::Shape(format!(
                "archive entry '{}' declares {}x{} but holds {} values",
                entry.id,
                entry.rows,
                entry.cols,
                entry.data.len()
            )));
        }
        if entry.cols == 0 {
            return Ok(Linear::new(entry.rows, 0));
        }
        Linear::from_iter(entry.cols, entry.data.into_iter())
    }
}

/// Appends matrices to `<name>.ark` and records `id path:offset` lines in `<name>.scp`.
pub struct ArchiveWriter {
    ark_path: PathBuf,
    ark: BufWriter<File>,
    scp: BufWriter<File>,
    offset: u64,
}

impl ArchiveWriter {
    pub fn create<P: AsRef<Path>>(name: P) -> Result<Self> {
        let name = name.as_ref();
        let with_suffix = |suffix: &str| {
            let mut path = name.as_os_str().to_owned();
            path.push(suffix);
            PathBuf::from(path)
        };
        let ark_path = with_suffix(".ark");
        let scp_path = with_suffix(".scp");
        if let Some(parent) = ark_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
        };
        debug!("Writing features to archive: {}", ark_path.display());
        Ok(Self {
            ark: BufWriter::new(open(&ark_path)?),
            scp: BufWriter::new(open(&scp_path)?),
            ark_path,
            offset: 0,
        })
    }

    pub fn ark_path(&self) -> &Path {
        &self.ark_path
    }

    pub fn scp_path(&self) -> PathBuf {
        self.ark_path.with_extension("scp")
    }
}

impl FeatureWriter for ArchiveWriter {
    fn write(&mut self, id: &str, matrix: &Linear) -> Result<()> {
        let entry = ArchiveEntry {
            id: id.to_string(),
            rows: matrix.count(),
            cols: matrix.stride(),
            data: matrix.values().to_vec(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        self.ark.write_all(line.as_bytes())?;
        writeln!(self.scp, "{id} {}:{}", self.ark_path.display(), self.offset)?;
        self.offset += line.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.ark.flush()?;
        self.scp.flush()?;
        Ok(())
    }
}

/// In-memory store keyed by reference. Writes key by utterance id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Linear>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&self, reference: S, matrix: Linear) {
        match self.entries.write() {
            Ok(mut entries) => entries.insert(reference.into(), matrix),
            Err(poisoned) => poisoned.into_inner().insert(reference.into(), matrix),
        };
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|x| x.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, reference: &str) -> Option<Linear> {
        self.entries.read().ok()?.get(reference).cloned()
    }
}

impl FeatureReader for MemoryStore {
    fn read(&self, reference: &str) -> Result<Linear> {
        self.get(reference)
            .ok_or_else(|| Error::DataNotFound(format!("no features for reference '{reference}'")))
    }
}

impl FeatureWriter for MemoryStore {
    fn write(&mut self, id: &str, matrix: &Linear) -> Result<()> {
        self.insert(id, matrix.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize, start: NodeValue) -> Linear {
        Linear::from_iter(cols, (0..rows * cols).map(|x| start + x as NodeValue)).unwrap()
    }

    #[test]
    fn archive_writer_indexes_entries_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("feats");
        let mut writer = ArchiveWriter::create(&name).unwrap();
        writer.write("utt1", &matrix(3, 2, 0.0)).unwrap();
        writer.write("utt2", &matrix(1, 2, 10.5)).unwrap();
        writer.finish().unwrap();

        let scp = std::fs::read_to_string(writer.scp_path()).unwrap();
        let index: Vec<(&str, &str)> = scp.lines().filter_map(|x| x.split_once(' ')).collect();
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].0, "utt1");
        assert_eq!(index[1].0, "utt2");

        let reader = ArchiveReader::new();
        assert_eq!(reader.read(index[0].1).unwrap(), matrix(3, 2, 0.0));
        assert_eq!(reader.read(index[1].1).unwrap(), matrix(1, 2, 10.5));
    }

    #[test]
    fn archive_reader_reports_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let reference = format!("{}:0", dir.path().join("missing.ark").display());
        let err = ArchiveReader::new().read(&reference).unwrap_err();
        assert!(matches!(err, Error::DataNotFound(_)));
    }

    #[test]
    fn archive_reader_reports_offset_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::create(dir.path().join("feats")).unwrap();
        writer.write("utt1", &matrix(1, 1, 0.0)).unwrap();
        writer.finish().unwrap();

        let reference = format!("{}:100000", writer.ark_path().display());
        let err = ArchiveReader::new().read(&reference).unwrap_err();
        assert!(matches!(err, Error::DataNotFound(_)));
    }

    #[test]
    fn memory_store_resolves_inserted_references() {
        let store = MemoryStore::new();
        store.insert("a", matrix(2, 2, 1.0));
        assert_eq!(store.read("a").unwrap(), matrix(2, 2, 1.0));
        assert!(matches!(store.read("b"), Err(Error::DataNotFound(_))));
    }
}
