//! Control-file leaf.
//!
//! Commands arrive as writes and are buffered per open fid. Some
//! callers expect a command to take effect on write (`echo cmd > ctl`
//! without relying on clunk timing), others write the whole command
//! and then clunk; both signals are honored: every complete
//! newline-terminated line is executed as soon as it arrives and is
//! consumed from the buffer, and any unterminated remainder runs at
//! clunk. Reading returns the handler's status snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;

use super::{FileNode, file_qid, lock};
use crate::fcall::Qid;
use crate::utils::Result;

/// Command processor behind a ctl file.
#[async_trait]
pub trait CtlHandler: Send + Sync {
    /// Execute one command line; the reply is a one-line status.
    async fn execute(&self, line: &str) -> Result<String>;

    /// Key/value status block returned by reads, lines of `key value`.
    async fn status(&self) -> String;
}

pub struct CtlFile {
    name: String,
    qid: Qid,
    handler: Arc<dyn CtlHandler>,
    bufs: Mutex<HashMap<u64, Vec<u8>>>,
}

impl CtlFile {
    pub fn new(name: impl Into<String>, handler: Arc<dyn CtlHandler>) -> Arc<Self> {
        Arc::new(CtlFile {
            name: name.into(),
            qid: file_qid(),
            handler,
            bufs: Mutex::new(HashMap::new()),
        })
    }

    async fn run_line(&self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let reply = self.handler.execute(line).await?;
        debug!("ctl {}: {} -> {}", self.name, line, reply.trim_end());
        Ok(())
    }
}

#[async_trait]
impl FileNode for CtlFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn qid(&self) -> Qid {
        self.qid
    }

    // Plan 9 convention: ctl files report length 0

    async fn open(&self, fid: u64, _mode: u8) -> Result<()> {
        lock(&self.bufs).remove(&fid);
        Ok(())
    }

    async fn read(&self, _fid: u64, offset: u64, count: u32) -> Result<Vec<u8>> {
        let status = self.handler.status().await.into_bytes();
        let off = (offset as usize).min(status.len());
        let end = (off + count as usize).min(status.len());
        Ok(status[off..end].to_vec())
    }

    async fn write(&self, fid: u64, _offset: u64, data: &[u8]) -> Result<u32> {
        // Collect the complete lines under the lock, run them outside it
        let lines: Vec<String> = {
            let mut bufs = lock(&self.bufs);
            let buf = bufs.entry(fid).or_default();
            buf.extend_from_slice(data);

            let mut lines = Vec::new();
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
            lines
        };

        for line in lines {
            self.run_line(&line).await?;
        }

        Ok(data.len() as u32)
    }

    async fn clunk(&self, fid: u64) -> Result<()> {
        let Some(residual) = lock(&self.bufs).remove(&fid) else {
            return Ok(());
        };

        self.run_line(&String::from_utf8_lossy(&residual)).await
    }
}
