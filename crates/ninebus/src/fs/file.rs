//! Uninterpreted byte files and the shared per-fid write buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{FileNode, file_qid, lock};
use crate::error::string as errstr;
use crate::fcall::Qid;
use crate::res;
use crate::utils::Result;

/// Per-fid offset-indexed write accumulator.
///
/// This is the plumbing behind every leaf that acts on a complete
/// payload at clunk time: writes land at their offset with zero fill
/// on gaps, a write at offset 0 into a non-empty buffer starts a new
/// sequence on the same fid, and the offset of the first write is
/// recorded so `>` (truncate, first write at 0) and `>>` (append,
/// first write past 0) can be told apart.
#[derive(Default)]
pub struct WriteBuffer {
    bufs: Mutex<HashMap<u64, FidBuf>>,
}

struct FidBuf {
    data: Vec<u8>,
    first_offset: u64,
}

impl WriteBuffer {
    pub fn new() -> Self {
        WriteBuffer::default()
    }

    /// Record one write. Returns the byte count for Rwrite.
    pub fn push(&self, fid: u64, offset: u64, data: &[u8]) -> u32 {
        let mut bufs = lock(&self.bufs);
        let buf = bufs.entry(fid).or_insert(FidBuf {
            data: Vec::new(),
            first_offset: offset,
        });

        // Offset 0 into existing data: new write sequence on this fid
        if offset == 0 && !buf.data.is_empty() {
            buf.data.clear();
            buf.first_offset = 0;
        }

        let off = offset as usize;
        if off + data.len() > buf.data.len() {
            buf.data.resize(off + data.len(), 0);
        }
        buf.data[off..off + data.len()].copy_from_slice(data);

        data.len() as u32
    }

    /// Take the assembled payload and first-write offset for `fid`.
    /// `None` when the fid never wrote.
    pub fn take(&self, fid: u64) -> Option<(Vec<u8>, u64)> {
        lock(&self.bufs)
            .remove(&fid)
            .map(|b| (b.data, b.first_offset))
    }
}

/// Static file: bytes in, bytes out, uninterpreted.
pub struct StaticFile {
    name: String,
    qid: Qid,
    writable: bool,
    content: Mutex<Vec<u8>>,
}

impl StaticFile {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Arc<Self> {
        Arc::new(StaticFile {
            name: name.into(),
            qid: file_qid(),
            writable: true,
            content: Mutex::new(content),
        })
    }

    pub fn read_only(name: impl Into<String>, content: Vec<u8>) -> Arc<Self> {
        Arc::new(StaticFile {
            name: name.into(),
            qid: file_qid(),
            writable: false,
            content: Mutex::new(content),
        })
    }

    pub fn set(&self, content: Vec<u8>) {
        *lock(&self.content) = content;
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.content).clone()
    }
}

#[async_trait]
impl FileNode for StaticFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn qid(&self) -> Qid {
        self.qid
    }

    fn mode(&self) -> u32 {
        if self.writable { 0o666 } else { 0o444 }
    }

    fn length(&self) -> u64 {
        lock(&self.content).len() as u64
    }

    async fn read(&self, _fid: u64, offset: u64, count: u32) -> Result<Vec<u8>> {
        let content = lock(&self.content);
        let off = (offset as usize).min(content.len());
        let end = (off + count as usize).min(content.len());
        Ok(content[off..end].to_vec())
    }

    async fn write(&self, _fid: u64, offset: u64, data: &[u8]) -> Result<u32> {
        if !self.writable {
            return res!(errstr::PERM);
        }

        let mut content = lock(&self.content);
        let off = offset as usize;
        if off + data.len() > content.len() {
            content.resize(off + data.len(), 0);
        }
        content[off..off + data.len()].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    async fn truncate(&self, len: u64) -> Result<()> {
        if !self.writable {
            return res!(errstr::PERM);
        }
        lock(&self.content).truncate(len as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buffer_assembles_in_offset_order() {
        let buf = WriteBuffer::new();
        assert_eq!(buf.push(1, 0, b"hello"), 5);
        assert_eq!(buf.push(1, 5, b"world"), 5);
        assert_eq!(buf.push(1, 10, b"!!!!!"), 5);

        let (payload, first) = buf.take(1).unwrap();
        assert_eq!(payload, b"helloworld!!!!!");
        assert_eq!(first, 0);
        assert!(buf.take(1).is_none());
    }

    #[test]
    fn write_buffer_zero_fills_gaps() {
        let buf = WriteBuffer::new();
        buf.push(1, 3, b"x");
        let (payload, first) = buf.take(1).unwrap();
        assert_eq!(payload, b"\0\0\0x");
        assert_eq!(first, 3);
    }

    #[test]
    fn write_buffer_restarts_on_rewrite_at_zero() {
        let buf = WriteBuffer::new();
        buf.push(1, 0, b"first");
        buf.push(1, 0, b"second");
        let (payload, _) = buf.take(1).unwrap();
        assert_eq!(payload, b"second");
    }

    #[test]
    fn write_buffer_keeps_fids_apart() {
        let buf = WriteBuffer::new();
        buf.push(1, 0, b"one");
        buf.push(2, 0, b"two");
        assert_eq!(buf.take(1).unwrap().0, b"one");
        assert_eq!(buf.take(2).unwrap().0, b"two");
    }

    #[tokio::test]
    async fn static_file_read_write() {
        let f = StaticFile::new("greeting", b"hello".to_vec());
        assert_eq!(f.read(1, 0, 1024).await.unwrap(), b"hello");
        assert_eq!(f.read(1, 2, 2).await.unwrap(), b"ll");
        assert_eq!(f.read(1, 10, 8).await.unwrap(), b"");

        f.write(1, 5, b" there").await.unwrap();
        assert_eq!(f.contents(), b"hello there");

        f.truncate(5).await.unwrap();
        assert_eq!(f.length(), 5);
    }

    #[tokio::test]
    async fn read_only_file_rejects_writes() {
        let f = StaticFile::read_only("ro", b"data".to_vec());
        assert!(f.write(1, 0, b"x").await.is_err());
        assert_eq!(f.mode(), 0o444);
    }
}
