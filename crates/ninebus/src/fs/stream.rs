//! Append-only stream leaf.
//!
//! A stream carries one *generation* at a time. `append` feeds the
//! current generation and wakes blocked readers, `finish` marks its
//! end (readers see EOF once they have drained it), and `reset` opens
//! the next generation with empty content. A reader is pinned to the
//! generation that was current when its fid was opened; after a reset
//! it reads EOF and must reopen to see the new generation from its
//! start.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{FileNode, file_qid, lock};
use crate::error::string as errstr;
use crate::fcall::Qid;
use crate::res;
use crate::utils::Result;

pub struct StreamFile {
    name: String,
    qid: Qid,
    state: Mutex<StreamState>,
    // Generation each open fid is pinned to
    opens: Mutex<HashMap<u64, u64>>,
    notify: Notify,
}

struct StreamState {
    generation: u64,
    buf: Vec<u8>,
    finished: bool,
}

impl StreamFile {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(StreamFile {
            name: name.into(),
            qid: file_qid(),
            state: Mutex::new(StreamState {
                generation: 0,
                buf: Vec::new(),
                finished: false,
            }),
            opens: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Append bytes to the current generation and wake readers.
    pub fn append(&self, bytes: &[u8]) {
        lock(&self.state).buf.extend_from_slice(bytes);
        self.notify.notify_waiters();
    }

    /// Mark the current generation ended; drained readers see EOF.
    pub fn finish(&self) {
        lock(&self.state).finished = true;
        self.notify.notify_waiters();
    }

    /// Close the current generation and open the next, empty one.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.buf.clear();
        state.finished = false;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }
}

#[async_trait]
impl FileNode for StreamFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn qid(&self) -> Qid {
        self.qid
    }

    fn mode(&self) -> u32 {
        0o444
    }

    fn length(&self) -> u64 {
        lock(&self.state).buf.len() as u64
    }

    async fn open(&self, fid: u64, _mode: u8) -> Result<()> {
        let generation = lock(&self.state).generation;
        lock(&self.opens).insert(fid, generation);
        Ok(())
    }

    async fn read(&self, fid: u64, offset: u64, count: u32) -> Result<Vec<u8>> {
        loop {
            // Register for wakeups before inspecting state, so an
            // append between the check and the await is not lost.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let state = lock(&self.state);
                let pinned = lock(&self.opens)
                    .get(&fid)
                    .copied()
                    .unwrap_or(state.generation);

                // The stream was reset since this fid opened
                if pinned != state.generation {
                    return Ok(Vec::new());
                }

                let off = offset as usize;
                if off < state.buf.len() {
                    let end = (off + count as usize).min(state.buf.len());
                    return Ok(state.buf[off..end].to_vec());
                }
                if state.finished {
                    return Ok(Vec::new());
                }
            }

            notified.await;
        }
    }

    async fn write(&self, _fid: u64, _offset: u64, _data: &[u8]) -> Result<u32> {
        res!(errstr::PERM)
    }

    async fn clunk(&self, fid: u64) -> Result<()> {
        lock(&self.opens).remove(&fid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn read_after_append_returns_from_offset() {
        let stream = StreamFile::new("output");
        stream.open(1, 0).await.unwrap();

        stream.append(b"hello ");
        stream.append(b"world");

        assert_eq!(stream.read(1, 0, 1024).await.unwrap(), b"hello world");
        assert_eq!(stream.read(1, 6, 1024).await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn read_blocks_until_append() {
        let stream = StreamFile::new("output");
        stream.open(1, 0).await.unwrap();

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.read(1, 0, 64).await })
        };

        // Give the reader time to block
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        stream.append(b"x");
        let got = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, b"x");
    }

    #[tokio::test]
    async fn finish_yields_eof_after_drain() {
        let stream = StreamFile::new("output");
        stream.open(1, 0).await.unwrap();

        stream.append(b"tail");
        stream.finish();

        assert_eq!(stream.read(1, 0, 64).await.unwrap(), b"tail");
        assert_eq!(stream.read(1, 4, 64).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn reset_ends_old_generation() {
        let stream = StreamFile::new("output");
        stream.open(1, 0).await.unwrap();
        stream.append(b"old");

        stream.reset();
        stream.append(b"new");

        // The pinned reader sees EOF after the reset
        assert_eq!(stream.read(1, 0, 64).await.unwrap(), b"");

        // A reopened fid reads the new generation from its start
        stream.clunk(1).await.unwrap();
        stream.open(2, 0).await.unwrap();
        assert_eq!(stream.read(2, 0, 64).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn reader_between_reset_and_append_blocks() {
        let stream = StreamFile::new("output");
        stream.append(b"old");
        stream.reset();

        stream.open(1, 0).await.unwrap();
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.read(1, 0, 64).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        stream.append(b"fresh");
        let got = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, b"fresh");
    }
}
