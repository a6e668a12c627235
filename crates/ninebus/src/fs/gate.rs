//! Blocking single-payload output gate.
//!
//! State machine `Waiting → Ready → Consumed → Waiting`: reads block
//! until content is staged and marked ready, the read that returns
//! the tail of the content consumes the gate, and a later read at
//! offset 0 rearms it. The shell-visible effect is the
//! `while true; do cat X; done` idiom — each cat returns one payload
//! then sees EOF, and the next cat blocks until something new is
//! staged.

use std::pin::pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{FileNode, file_qid, lock};
use crate::error::string as errstr;
use crate::fcall::Qid;
use crate::res;
use crate::utils::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Waiting,
    Ready,
    Consumed,
}

pub struct GateFile {
    name: String,
    qid: Qid,
    state: Mutex<GateState>,
    notify: Notify,
}

struct GateState {
    phase: Phase,
    content: Vec<u8>,
}

impl GateFile {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(GateFile {
            name: name.into(),
            qid: file_qid(),
            state: Mutex::new(GateState {
                phase: Phase::Waiting,
                content: Vec::new(),
            }),
            notify: Notify::new(),
        })
    }

    /// Replace the staged content without changing phase.
    pub fn stage(&self, content: Vec<u8>) {
        lock(&self.state).content = content;
    }

    /// `Waiting|Consumed → Ready`: release blocked readers.
    pub fn mark_ready(&self) {
        lock(&self.state).phase = Phase::Ready;
        self.notify.notify_waiters();
    }

    /// Stage content and mark it ready in one step.
    pub fn publish(&self, content: Vec<u8>) {
        {
            let mut state = lock(&self.state);
            state.content = content;
            state.phase = Phase::Ready;
        }
        self.notify.notify_waiters();
    }

    /// Drop the content and return to Waiting.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.content.clear();
        state.phase = Phase::Waiting;
    }
}

#[async_trait]
impl FileNode for GateFile {
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
        let state = lock(&self.state);
        match state.phase {
            Phase::Ready => state.content.len() as u64,
            _ => 0,
        }
    }

    async fn read(&self, _fid: u64, offset: u64, count: u32) -> Result<Vec<u8>> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = lock(&self.state);
                match state.phase {
                    Phase::Ready => {
                        let off = (offset as usize).min(state.content.len());
                        let end = (off + count as usize).min(state.content.len());
                        let chunk = state.content[off..end].to_vec();
                        if off + chunk.len() >= state.content.len() {
                            state.phase = Phase::Consumed;
                        }
                        return Ok(chunk);
                    }
                    Phase::Consumed if offset == 0 => {
                        // Rearm for the next payload, then wait
                        state.phase = Phase::Waiting;
                    }
                    Phase::Consumed => return Ok(Vec::new()),
                    Phase::Waiting => {}
                }
            }

            notified.await;
        }
    }

    async fn write(&self, _fid: u64, _offset: u64, _data: &[u8]) -> Result<u32> {
        res!(errstr::PERM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn full_lifecycle_rearms() {
        let gate = GateFile::new("output");

        // Read blocks in Waiting
        let reader = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.read(1, 0, 64).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        gate.publish(b"x".to_vec());
        let got = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, b"x");

        // The read that returned the tail consumed the gate
        assert_eq!(gate.read(1, 1, 64).await.unwrap(), b"");

        // Reading again at offset 0 rearms and blocks
        let reader = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.read(2, 0, 64).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        gate.publish(b"y".to_vec());
        let got = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, b"y");
    }

    #[tokio::test]
    async fn partial_reads_consume_only_at_tail() {
        let gate = GateFile::new("output");
        gate.publish(b"abcdef".to_vec());

        assert_eq!(gate.read(1, 0, 3).await.unwrap(), b"abc");
        assert_eq!(gate.length(), 6);
        assert_eq!(gate.read(1, 3, 3).await.unwrap(), b"def");

        // Consumed now: further reads past 0 see EOF
        assert_eq!(gate.read(1, 6, 3).await.unwrap(), b"");
        assert_eq!(gate.length(), 0);
    }

    #[tokio::test]
    async fn clear_returns_to_waiting() {
        let gate = GateFile::new("output");
        gate.publish(b"stale".to_vec());
        gate.clear();

        let reader = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.read(1, 0, 64).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        reader.abort();
    }

    #[tokio::test]
    async fn mark_ready_after_stage() {
        let gate = GateFile::new("output");
        gate.stage(b"staged".to_vec());

        let reader = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.read(1, 0, 64).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        gate.mark_ready();
        let got = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, b"staged");
    }
}
