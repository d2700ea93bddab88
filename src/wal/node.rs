use super::Buffer;
use crate::error::{Error, Result};

use fs4::FileExt as _;
use log::{debug, error};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// An exclusive write-ahead log node. Owns the pool buffers attached at
/// registration and a lazily opened, exclusively locked segment file under
/// its own directory. Records are framed with a u32 length prefix and
/// buffered in a ring: a full buffer is spilled to the segment file and the
/// next buffer in the ring takes over.
///
/// Lifecycle: registered (buffers attached) -> closed -> deleted. close() is
/// terminal and drops the buffers; delete() additionally removes the node's
/// directory and hands the buffers back to the caller for return to the
/// pool. force_sync() is idempotent.
pub struct LogNode {
    identifier: String,
    dir: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    buffers: Vec<Buffer>,
    active: usize,
    file: Option<File>,
    closed: bool,
}

impl LogNode {
    /// Creates a node for the given identifier. No IO happens until the
    /// first append or sync.
    pub(super) fn new(identifier: &str, dir: PathBuf) -> Self {
        Self {
            identifier: identifier.to_string(),
            dir,
            inner: Mutex::new(Inner { buffers: Vec::new(), active: 0, file: None, closed: false }),
        }
    }

    /// Returns the node's identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Attaches the pool buffers obtained at registration.
    pub(super) fn init_buffers(&self, buffers: Vec<Buffer>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.buffers = buffers;
            inner.active = 0;
        }
    }

    /// Appends a length-prefixed record. The record lands in the active
    /// buffer; a buffer without room for it is spilled to the segment file
    /// first. Records are only durable after force_sync().
    pub fn append(&self, record: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.closed {
            return Err(Error::IO(format!("WAL node {} is closed", self.identifier)));
        }

        let frame = (record.len() as u32).to_le_bytes();
        let size = frame.len() + record.len();
        if inner.buffers.is_empty() || size > inner.capacity() {
            // No buffer can ever hold the record, bypass the ring.
            inner.spill(&self.dir)?;
            let file = inner.file(&self.dir)?;
            file.write_all(&frame)?;
            file.write_all(record)?;
            return Ok(());
        }

        if inner.remaining() < size {
            inner.spill(&self.dir)?;
        }
        let active = inner.active;
        inner.buffers[active].extend_from_slice(&frame);
        inner.buffers[active].extend_from_slice(record);
        Ok(())
    }

    /// Flushes all buffered records to the segment file and fsyncs it.
    /// Idempotent; a no-op on a closed node or before the first append.
    pub fn force_sync(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.closed {
            return Ok(());
        }
        inner.spill(&self.dir)?;
        if let Some(file) = &inner.file {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Flushes, syncs, and closes the node, dropping its buffers. Terminal:
    /// later appends fail.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.closed {
            return Ok(());
        }
        inner.spill(&self.dir)?;
        if let Some(file) = &inner.file {
            file.sync_all()?;
        }
        inner.file = None;
        inner.buffers = Vec::new();
        inner.closed = true;
        debug!("Closed WAL node {}", self.identifier);
        Ok(())
    }

    /// Closes the node, removes its directory, and returns the attached
    /// buffers (cleared) to the caller, which returns them to the pool.
    pub fn delete(&self) -> Result<Vec<Buffer>> {
        let mut inner = self.inner.lock()?;
        inner.file = None;
        inner.closed = true;
        let mut buffers = std::mem::take(&mut inner.buffers);
        for buffer in &mut buffers {
            buffer.clear();
        }
        if self.dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.dir) {
                error!("Cannot remove WAL directory of {}: {}", self.identifier, err);
            }
        }
        debug!("Deleted WAL node {}", self.identifier);
        Ok(buffers)
    }
}

impl Inner {
    /// Returns the active buffer's total capacity.
    fn capacity(&self) -> usize {
        self.buffers[self.active].capacity()
    }

    /// Returns the active buffer's remaining capacity.
    fn remaining(&self) -> usize {
        let active = &self.buffers[self.active];
        active.capacity() - active.len()
    }

    /// Writes the active buffer out to the segment file and rotates the
    /// ring. A no-op when nothing is buffered.
    fn spill(&mut self, dir: &Path) -> Result<()> {
        if self.buffers.is_empty() || self.buffers[self.active].is_empty() {
            return Ok(());
        }
        let active = self.active;
        let mut bytes = std::mem::take(&mut self.buffers[active]);
        let result = self.file(dir).and_then(|file| file.write_all(&bytes).map_err(Error::from));
        bytes.clear();
        self.buffers[active] = bytes;
        self.active = (active + 1) % self.buffers.len();
        result
    }

    /// Returns the segment file, opening and exclusively locking it on
    /// first use.
    fn file(&mut self, dir: &Path) -> Result<&mut File> {
        if self.file.is_none() {
            std::fs::create_dir_all(dir)?;
            let file = OpenOptions::new().create(true).append(true).open(dir.join("wal.log"))?;
            file.try_lock_exclusive()?;
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(Error::Internal("WAL segment file not open".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup(capacity: usize, count: usize) -> (LogNode, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = LogNode::new("g1", dir.path().join("g1"));
        node.init_buffers((0..count).map(|_| Buffer::with_capacity(capacity)).collect());
        (node, dir)
    }

    /// Decodes the length-prefixed records of a segment file.
    fn read_records(dir: &std::path::Path) -> Vec<Vec<u8>> {
        let bytes = std::fs::read(dir.join("g1").join("wal.log")).unwrap_or_default();
        let mut records = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("frame")) as usize;
            pos += 4;
            records.push(bytes[pos..pos + len].to_vec());
            pos += len;
        }
        records
    }

    #[test]
    fn append_buffers_until_force_sync() -> crate::error::Result<()> {
        let (node, dir) = setup(64, 2);
        node.append(b"first")?;
        node.append(b"second")?;
        assert_eq!(read_records(dir.path()), Vec::<Vec<u8>>::new());

        node.force_sync()?;
        assert_eq!(read_records(dir.path()), vec![b"first".to_vec(), b"second".to_vec()]);

        // force_sync is idempotent.
        node.force_sync()?;
        assert_eq!(read_records(dir.path()), vec![b"first".to_vec(), b"second".to_vec()]);
        Ok(())
    }

    #[test]
    fn spills_full_buffers() -> crate::error::Result<()> {
        let (node, dir) = setup(16, 2);
        for record in [&b"0123456789"[..], b"abcdefghij", b"x"] {
            node.append(record)?;
        }
        // Each append that outgrew the active buffer spilled it to disk.
        assert_eq!(read_records(dir.path()), vec![b"0123456789".to_vec(), b"abcdefghij".to_vec()]);

        node.force_sync()?;
        assert_eq!(
            read_records(dir.path()),
            vec![b"0123456789".to_vec(), b"abcdefghij".to_vec(), b"x".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn oversized_record_bypasses_ring() -> crate::error::Result<()> {
        let (node, dir) = setup(8, 2);
        node.append(b"tiny")?;
        node.append(b"a record larger than any buffer")?;
        node.force_sync()?;
        assert_eq!(
            read_records(dir.path()),
            vec![b"tiny".to_vec(), b"a record larger than any buffer".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn close_is_terminal() -> crate::error::Result<()> {
        let (node, dir) = setup(64, 2);
        node.append(b"payload")?;
        node.close()?;
        assert_eq!(read_records(dir.path()), vec![b"payload".to_vec()]);
        assert!(node.append(b"more").is_err());
        node.close()?; // close is idempotent
        assert!(node.force_sync().is_ok()); // and force_sync a no-op
        Ok(())
    }

    #[test]
    fn delete_returns_buffers_and_removes_dir() -> crate::error::Result<()> {
        let (node, dir) = setup(64, 2);
        node.append(b"payload")?;
        node.force_sync()?;
        assert!(dir.path().join("g1").exists());

        let buffers = node.delete()?;
        assert_eq!(buffers.len(), 2);
        assert!(buffers.iter().all(|b| b.is_empty() && b.capacity() == 64));
        assert!(!dir.path().join("g1").exists());
        Ok(())
    }
}
