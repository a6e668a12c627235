//! Deliver-once message queue leaf.
//!
//! Posted messages are handed to whichever reader asks first; a read
//! with nothing queued blocks until the next post. Offsets are
//! ignored: every read takes one whole message.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{FileNode, file_qid, lock};
use crate::fcall::Qid;
use crate::utils::Result;

pub struct QueueFile {
    name: String,
    qid: Qid,
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl QueueFile {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(QueueFile {
            name: name.into(),
            qid: file_qid(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Post a message for exactly one future read to receive.
    pub fn post(&self, msg: Vec<u8>) {
        lock(&self.queue).push_back(msg);
        self.notify.notify_waiters();
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }
}

#[async_trait]
impl FileNode for QueueFile {
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
        lock(&self.queue).front().map(|m| m.len() as u64).unwrap_or(0)
    }

    async fn read(&self, _fid: u64, _offset: u64, count: u32) -> Result<Vec<u8>> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut queue = lock(&self.queue);
                if let Some(mut msg) = queue.pop_front() {
                    msg.truncate(count as usize);
                    return Ok(msg);
                }
            }

            notified.await;
        }
    }
}
