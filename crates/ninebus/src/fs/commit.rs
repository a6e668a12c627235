//! Write-on-clunk leaf.
//!
//! The universal idiom for "act when the writer closes the file":
//! writes are accumulated per fid, and the complete payload is handed
//! to the handler exactly once when the fid is clunked. `echo x > f`
//! therefore delivers the whole of `x` in one commit, and every
//! shell-level write produces its own commit.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{FileNode, WriteBuffer, file_qid, lock};
use crate::fcall::Qid;
use crate::utils::Result;

/// Receiver of completed payloads.
#[async_trait]
pub trait Commit: Send + Sync {
    /// Called once per open/write/clunk cycle with the assembled
    /// payload. `truncate` is true when the first write landed at
    /// offset 0 (shell `>`), false when the writer seeked first
    /// (shell `>>`).
    async fn commit(&self, payload: Vec<u8>, truncate: bool) -> Result<()>;
}

pub struct CommitFile {
    name: String,
    qid: Qid,
    handler: Arc<dyn Commit>,
    buf: WriteBuffer,
    // Last committed payload, readable back by clients
    last: Mutex<Vec<u8>>,
}

impl CommitFile {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Commit>) -> Arc<Self> {
        Arc::new(CommitFile {
            name: name.into(),
            qid: file_qid(),
            handler,
            buf: WriteBuffer::new(),
            last: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl FileNode for CommitFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn qid(&self) -> Qid {
        self.qid
    }

    fn length(&self) -> u64 {
        lock(&self.last).len() as u64
    }

    async fn read(&self, _fid: u64, offset: u64, count: u32) -> Result<Vec<u8>> {
        let last = lock(&self.last);
        let off = (offset as usize).min(last.len());
        let end = (off + count as usize).min(last.len());
        Ok(last[off..end].to_vec())
    }

    async fn write(&self, fid: u64, offset: u64, data: &[u8]) -> Result<u32> {
        Ok(self.buf.push(fid, offset, data))
    }

    async fn clunk(&self, fid: u64) -> Result<()> {
        let Some((payload, first_offset)) = self.buf.take(fid) else {
            return Ok(());
        };

        *lock(&self.last) = payload.clone();
        self.handler.commit(payload, first_offset == 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        commits: StdMutex<Vec<(Vec<u8>, bool)>>,
    }

    #[async_trait]
    impl Commit for Recorder {
        async fn commit(&self, payload: Vec<u8>, truncate: bool) -> Result<()> {
            self.commits.lock().unwrap().push((payload, truncate));
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_fires_once_with_full_payload() {
        let recorder = Arc::new(Recorder::default());
        let file = CommitFile::new("input", recorder.clone());

        file.write(1, 0, b"hello").await.unwrap();
        file.write(1, 5, b"world").await.unwrap();
        file.write(1, 10, b"!!!!!").await.unwrap();
        file.clunk(1).await.unwrap();

        let commits = recorder.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, b"helloworld!!!!!");
        assert!(commits[0].1);
    }

    #[tokio::test]
    async fn append_detected_by_first_offset() {
        let recorder = Arc::new(Recorder::default());
        let file = CommitFile::new("history", recorder.clone());

        file.write(1, 100, b"more").await.unwrap();
        file.clunk(1).await.unwrap();

        let commits = recorder.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert!(!commits[0].1);
    }

    #[tokio::test]
    async fn clunk_without_write_commits_nothing() {
        let recorder = Arc::new(Recorder::default());
        let file = CommitFile::new("input", recorder.clone());

        file.clunk(1).await.unwrap();
        assert!(recorder.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_payload_readable_back() {
        let recorder = Arc::new(Recorder::default());
        let file = CommitFile::new("input", recorder.clone());

        file.write(1, 0, b"ping").await.unwrap();
        file.clunk(1).await.unwrap();

        assert_eq!(file.read(2, 0, 64).await.unwrap(), b"ping");
    }
}
