//! Disk-backed sort of fixed-width byte records.
//!
//! Bytes are pushed through [`std::io::Write`] and grouped into records of
//! the declared width; a partial trailing record is carried across writes.
//! Once the in-memory buffer passes its threshold the buffered records are
//! sorted and spilled as a run into a private temporary directory.
//! [`ExternalSorter::finish`] merges all runs and hands every record to the
//! caller in ascending byte order. Duplicates are kept.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tempfile::TempDir;
use tracing::debug;

use crate::errors::{VaultError, VaultResult};

/// Default in-memory buffer before a run is spilled.
pub const DEFAULT_BUFFER_BYTES: usize = 512 << 20;

const IO_BUFFER_BYTES: usize = 1 << 20;

pub struct ExternalSorter {
    width: usize,
    threshold: usize,
    buffer: Vec<u8>,
    partial: Vec<u8>,
    temp_root: Option<PathBuf>,
    spill_dir: Option<TempDir>,
    runs: Vec<PathBuf>,
    records: u64,
}

impl ExternalSorter {
    /// `buffer_bytes` is rounded down to a whole number of records, with a
    /// floor of one record. Spill files go under `temp_root`, or the system
    /// temp directory when `None`.
    pub fn new(width: usize, buffer_bytes: usize, temp_root: Option<&Path>) -> VaultResult<Self> {
        if width == 0 {
            return Err(VaultError::Config("sorter record width must be non-zero".into()));
        }
        let threshold = (buffer_bytes / width).max(1) * width;
        Ok(Self {
            width,
            threshold,
            buffer: Vec::new(),
            partial: Vec::with_capacity(width),
            temp_root: temp_root.map(Path::to_path_buf),
            spill_dir: None,
            runs: Vec::new(),
            records: 0,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Complete records accepted so far.
    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Number of runs spilled to disk so far.
    pub fn runs(&self) -> usize {
        self.runs.len()
    }

    fn sorted_records(&self) -> Vec<&[u8]> {
        let mut records: Vec<&[u8]> = self.buffer.chunks_exact(self.width).collect();
        records.par_sort_unstable();
        records
    }

    fn spill_dir(&mut self) -> io::Result<&Path> {
        if self.spill_dir.is_none() {
            let mut builder = tempfile::Builder::new();
            builder.prefix("tagvault-sort-");
            let dir = match &self.temp_root {
                Some(root) => {
                    std::fs::create_dir_all(root)?;
                    builder.tempdir_in(root)?
                }
                None => builder.tempdir()?,
            };
            self.spill_dir = Some(dir);
        }
        match &self.spill_dir {
            Some(dir) => Ok(dir.path()),
            None => Err(io::Error::other("spill directory unavailable")),
        }
    }

    /// Sort the buffered records and write them out as one run.
    fn spill(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let name = format!("run-{:05}", self.runs.len());
        let path = self.spill_dir()?.join(name);
        let count = self.buffer.len() / self.width;
        {
            let mut out = BufWriter::with_capacity(IO_BUFFER_BYTES, File::create(&path)?);
            for record in self.sorted_records() {
                out.write_all(record)?;
            }
            out.flush()?;
        }
        debug!(run = self.runs.len(), records = count, path = %path.display(), "sort run spilled");
        self.runs.push(path);
        self.buffer.clear();
        Ok(())
    }

    /// Merge everything pushed so far and pass each record to `commit` in
    /// ascending byte order. Returns the number of records committed.
    ///
    /// A partial record left over from the last write is an error. Temporary
    /// runs are removed when the sorter is dropped, whether or not the merge
    /// succeeded.
    pub fn finish<F>(mut self, mut commit: F) -> VaultResult<u64>
    where
        F: FnMut(&[u8]) -> VaultResult<()>,
    {
        if !self.partial.is_empty() {
            return Err(VaultError::Store(format!(
                "incomplete trailing record: {} of {} bytes",
                self.partial.len(),
                self.width
            )));
        }

        if self.runs.is_empty() {
            let mut committed = 0u64;
            for record in self.sorted_records() {
                commit(record)?;
                committed += 1;
            }
            return Ok(committed);
        }

        self.spill()?;
        self.merge_runs(&mut commit)
    }

    fn merge_runs<F>(&self, commit: &mut F) -> VaultResult<u64>
    where
        F: FnMut(&[u8]) -> VaultResult<()>,
    {
        let mut readers = Vec::with_capacity(self.runs.len());
        for path in &self.runs {
            readers.push(BufReader::with_capacity(IO_BUFFER_BYTES, File::open(path)?));
        }

        let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::with_capacity(readers.len());
        for (idx, reader) in readers.iter_mut().enumerate() {
            if let Some(record) = read_record(reader, self.width)? {
                heap.push(Reverse((record, idx)));
            }
        }

        let mut committed = 0u64;
        while let Some(Reverse((record, idx))) = heap.pop() {
            commit(&record)?;
            committed += 1;
            if let Some(next) = read_record(&mut readers[idx], self.width)? {
                heap.push(Reverse((next, idx)));
            }
        }
        debug!(runs = self.runs.len(), records = committed, "sort runs merged");
        Ok(committed)
    }
}

/// Read one record, or `None` at a clean end of file.
fn read_record<R: Read>(reader: &mut R, width: usize) -> io::Result<Option<Vec<u8>>> {
    let mut record = vec![0u8; width];
    let mut filled = 0;
    while filled < width {
        match reader.read(&mut record[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("sort run truncated mid-record ({filled} of {width} bytes)"),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(record))
}

impl Write for ExternalSorter {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let len = buf.len();

        if !self.partial.is_empty() {
            let take = (self.width - self.partial.len()).min(buf.len());
            self.partial.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.partial.len() < self.width {
                return Ok(len);
            }
            self.buffer.extend_from_slice(&self.partial);
            self.partial.clear();
            self.records += 1;
        }

        let whole = buf.len() - buf.len() % self.width;
        self.buffer.extend_from_slice(&buf[..whole]);
        self.records += (whole / self.width) as u64;
        self.partial.extend_from_slice(&buf[whole..]);

        if self.buffer.len() >= self.threshold {
            self.spill()?;
        }
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(sorter: ExternalSorter) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        sorter
            .finish(|r| {
                out.push(r.to_vec());
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_in_memory_sort() {
        let mut sorter = ExternalSorter::new(2, 1024, None).unwrap();
        sorter.write_all(&[3, 0, 1, 9, 2, 5, 1, 0]).unwrap();
        assert_eq!(sorter.len(), 4);
        assert_eq!(sorter.runs(), 0);
        assert_eq!(collect(sorter), vec![vec![1, 0], vec![1, 9], vec![2, 5], vec![3, 0]]);
    }

    #[test]
    fn test_records_split_across_writes() {
        let mut sorter = ExternalSorter::new(4, 1024, None).unwrap();
        sorter.write_all(&[9, 9]).unwrap();
        sorter.write_all(&[9, 9, 1]).unwrap();
        sorter.write_all(&[1]).unwrap();
        sorter.write_all(&[1, 1, 5, 5, 5, 5]).unwrap();
        assert_eq!(
            collect(sorter),
            vec![vec![1, 1, 1, 1], vec![5, 5, 5, 5], vec![9, 9, 9, 9]]
        );
    }

    #[test]
    fn test_spilled_runs_merge_with_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        // Three records per run.
        let mut sorter = ExternalSorter::new(1, 3, Some(dir.path())).unwrap();
        for b in [7u8, 3, 7, 1, 9, 3, 0, 7] {
            sorter.write_all(&[b]).unwrap();
        }
        assert!(sorter.runs() >= 2);
        let sorted: Vec<u8> = collect(sorter).into_iter().map(|r| r[0]).collect();
        assert_eq!(sorted, vec![0, 1, 3, 3, 7, 7, 7, 9]);
    }

    #[test]
    fn test_spill_dir_is_removed_after_finish() {
        let root = tempfile::tempdir().unwrap();
        let mut sorter = ExternalSorter::new(1, 1, Some(root.path())).unwrap();
        sorter.write_all(&[2, 1]).unwrap();
        collect(sorter);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_trailing_partial_record_is_an_error() {
        let mut sorter = ExternalSorter::new(3, 1024, None).unwrap();
        sorter.write_all(&[1, 2, 3, 4]).unwrap();
        let err = sorter.finish(|_| Ok(())).unwrap_err();
        assert!(matches!(err, VaultError::Store(_)));
    }

    #[test]
    fn test_commit_error_stops_merge() {
        let mut sorter = ExternalSorter::new(1, 1024, None).unwrap();
        sorter.write_all(&[1, 2, 3]).unwrap();
        let mut seen = 0;
        let err = sorter
            .finish(|_| {
                seen += 1;
                Err(VaultError::Store("disk full".into()))
            })
            .unwrap_err();
        assert_eq!(seen, 1);
        assert!(matches!(err, VaultError::Store(_)));
    }

    #[test]
    fn test_zero_width_rejected() {
        assert!(ExternalSorter::new(0, 1024, None).is_err());
    }
}
