//! Per-client multiplexer connection.
//!
//! Each client gets a `MuxConnection` that serves a virtual root
//! directory listing the backend names plus a `ctl` file, routes
//! walks into backend names onto real backend connections, and
//! proxies every subsequent operation with fid/tag rewriting.
//!
//! Fid mapping: a client fid is in exactly one of three states —
//! the virtual mux root, the ctl file, or proxied to
//! `(backend, backend_fid)`. The tracked path is for diagnostics
//! only; the binding is authoritative.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

use ninebus::utils::Result;
use ninebus::{
    DEFAULT_MSIZE, FCall, IOHDRSZ, MAX_MSIZE, MsgType, Qid, QidType, Stat, dm,
    error::Error, errstr, wire,
};
use num_traits::FromPrimitive;

use crate::backend::BackendConnection;
use crate::server::MuxShared;

const MSIZE_SLACK: u32 = 256;

/// Owner reported in synthesized stats.
const OWNER: &str = "mux";

/// What a client fid points to.
#[derive(Clone, Debug)]
enum FidInfo {
    /// The virtual top directory listing backends
    Root,
    /// The synthetic control file
    Ctl,
    /// A fid on exactly one backend
    Proxied {
        backend: String,
        fid: u32,
        path: String,
    },
}

pub struct MuxConnection {
    id: u64,
    shared: Arc<MuxShared>,
    msize: AtomicU32,
    fids: Mutex<HashMap<u32, FidInfo>>,
    // Buffered ctl writes per client fid
    ctl_bufs: Mutex<HashMap<u32, Vec<u8>>>,
    // client tag -> backend name, for flush routing
    tag_routes: Mutex<HashMap<u16, String>>,
    // Lazily-opened backend connections, one per backend name
    backends: Mutex<HashMap<String, Arc<BackendConnection>>>,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    qids: Mutex<QidPaths>,
}

// Qid paths synthesized for the virtual root, the ctl file and the
// backend top directories. Kept within 32 bits: FUSE clients map
// qid.path to ino_t and some builds use 32-bit inodes.
struct QidPaths {
    next: u64,
    backends: HashMap<String, u64>,
}

impl MuxConnection {
    pub fn new(
        id: u64,
        shared: Arc<MuxShared>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (to_client, rx) = mpsc::unbounded_channel();
        let base = (id * 1000) & 0x7fff_ffff;

        let conn = Arc::new(MuxConnection {
            id,
            shared,
            msize: AtomicU32::new(DEFAULT_MSIZE),
            fids: Mutex::new(HashMap::new()),
            ctl_bufs: Mutex::new(HashMap::new()),
            tag_routes: Mutex::new(HashMap::new()),
            backends: Mutex::new(HashMap::new()),
            to_client,
            qids: Mutex::new(QidPaths {
                next: base + 2,
                backends: HashMap::new(),
            }),
        });
        (conn, rx)
    }

    fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    fn iounit(&self) -> u32 {
        self.msize() - IOHDRSZ
    }

    fn root_qid(&self) -> Qid {
        Qid {
            typ: QidType::DIR,
            version: 0,
            path: (self.id * 1000) & 0x7fff_ffff,
        }
    }

    fn ctl_qid(&self) -> Qid {
        Qid {
            typ: QidType::FILE,
            version: 0,
            path: ((self.id * 1000) & 0x7fff_ffff) + 1,
        }
    }

    async fn backend_qid(&self, name: &str) -> Qid {
        let mut qids = self.qids.lock().await;
        let path = match qids.backends.get(name) {
            Some(path) => *path,
            None => {
                let path = qids.next;
                qids.next += 1;
                qids.backends.insert(name.to_owned(), path);
                path
            }
        };
        Qid {
            typ: QidType::DIR,
            version: 0,
            path,
        }
    }

    fn send_client(&self, frame: Vec<u8>) {
        let _ = self.to_client.send(frame);
    }

    /// Main client loop: frame, answer Tversion inline, dispatch the
    /// rest concurrently.
    pub async fn serve<R, W>(
        self: Arc<Self>,
        reader: R,
        writer: W,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // All client-bound frames funnel through one writer task so
        // each frame hits the socket atomically.
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let mut framed = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .num_skip(0)
            .max_frame_length((MAX_MSIZE + MSIZE_SLACK) as usize)
            .little_endian()
            .new_read(reader);

        while let Some(frame) = framed.next().await {
            let frame = match frame {
                Ok(frame) => frame.to_vec(),
                Err(e) => {
                    warn!("[{}] read error: {}", self.id, e);
                    break;
                }
            };
            if frame.len() < wire::HDRSZ {
                warn!("[{}] truncated frame, closing", self.id);
                break;
            }
            if frame.len() as u32 > self.msize() + MSIZE_SLACK {
                warn!("[{}] frame of {} bytes exceeds msize, closing", self.id, frame.len());
                break;
            }

            let mtype = wire::msg_type(&frame);
            let tag = wire::tag(&frame);

            // Version changes the framing limit; handle inline
            if mtype == MsgType::TVersion as u8 {
                if let Err(e) = self.handle_version(&frame, tag).await {
                    warn!("[{}] version: {}", self.id, e);
                }
                continue;
            }

            let conn = self.clone();
            tokio::spawn(async move {
                conn.dispatch(frame, mtype, tag).await;
            });
        }

        self.cleanup().await;
        writer_task.abort();
        info!("[{}] client disconnected", self.id);
    }

    async fn dispatch(self: &Arc<Self>, frame: Vec<u8>, mtype: u8, tag: u16) {
        use MsgType::*;

        let result = match MsgType::from_u8(mtype) {
            Some(TAuth) => self.reply_err(tag, errstr::NO_AUTH),
            Some(TAttach) => self.handle_attach(&frame, tag).await,
            Some(TWalk) => self.handle_walk(&frame, tag).await,
            Some(TFlush) => self.handle_flush(&frame, tag).await,
            Some(TClunk) => self.handle_clunk(&frame, tag).await,
            Some(TOpen | TCreate | TRead | TWrite | TRemove | TStat | TWStat) => {
                self.handle_fid_op(frame, mtype, tag).await
            }
            _ => self.reply_err(tag, &format!("Unknown message type {}", mtype)),
        };

        if let Err(e) = result {
            debug!("[{}] {}: {}", self.id, wire::msg_name(mtype), e);
            let _ = self.reply_err(tag, &e.ename());
        }
    }

    fn reply_err(&self, tag: u16, ename: &str) -> Result<()> {
        self.send_client(wire::rerror(tag, ename)?);
        Ok(())
    }

    async fn handle_version(&self, frame: &[u8], tag: u16) -> Result<()> {
        let FCall::TVersion { msize, version } = wire::parse_msg(frame)?.body else {
            return self.reply_err(tag, "malformed Tversion");
        };

        let msize = msize.min(MAX_MSIZE);
        if version != ninebus::P92000 {
            self.send_client(wire::rversion(tag, msize, ninebus::VERSION_UNKNOWN)?);
            return Ok(());
        }

        self.msize.store(msize, Ordering::Relaxed);
        self.send_client(wire::rversion(tag, msize, ninebus::P92000)?);
        Ok(())
    }

    /// Attach binds the client's fid to the virtual root — or, when
    /// aname names a known backend, directly to that backend's root.
    async fn handle_attach(&self, frame: &[u8], tag: u16) -> Result<()> {
        let FCall::TAttach { fid, aname, .. } = wire::parse_msg(frame)?.body else {
            return self.reply_err(tag, "malformed Tattach");
        };

        if !aname.is_empty() && self.shared.addr_of(&aname).await.is_some() {
            let backend = match self.get_backend(&aname).await {
                Ok(backend) => backend,
                Err(e) => return self.reply_err(tag, &e.ename()),
            };

            let clone_fid = backend.alloc_fid();
            let resp = backend.walk(backend.root_fid(), clone_fid, &[]).await?;
            if let Some(ename) = wire::parse_rerror(&resp) {
                return self.reply_err(tag, &ename);
            }

            self.fids.lock().await.insert(
                fid,
                FidInfo::Proxied {
                    backend: aname.clone(),
                    fid: clone_fid,
                    path: format!("/{}", aname),
                },
            );
            let qid = self.backend_qid(&aname).await;
            self.send_client(wire::rattach(tag, qid)?);
            return Ok(());
        }

        self.fids.lock().await.insert(fid, FidInfo::Root);
        self.send_client(wire::rattach(tag, self.root_qid())?);
        Ok(())
    }

    /// Walk routing — the heart of the multiplexer.
    async fn handle_walk(&self, frame: &[u8], tag: u16) -> Result<()> {
        let (fid, newfid, names) = wire::parse_twalk(frame)?;

        let source = match self.fids.lock().await.get(&fid).cloned() {
            Some(info) => info,
            None => return self.reply_err(tag, errstr::UNKNOWN_FID),
        };

        match source {
            FidInfo::Root => self.walk_from_root(tag, newfid, &names).await,
            FidInfo::Ctl => {
                if names.is_empty() {
                    self.fids.lock().await.insert(newfid, FidInfo::Ctl);
                    self.send_client(wire::rwalk(tag, vec![])?);
                    Ok(())
                } else {
                    self.reply_err(tag, errstr::NOT_DIR)
                }
            }
            FidInfo::Proxied { backend, fid, path } => {
                self.walk_from_proxied(tag, newfid, &names, &backend, fid, &path)
                    .await
            }
        }
    }

    async fn walk_from_root(&self, tag: u16, newfid: u32, names: &[String]) -> Result<()> {
        // Empty walk clones the root fid
        if names.is_empty() {
            self.fids.lock().await.insert(newfid, FidInfo::Root);
            self.send_client(wire::rwalk(tag, vec![])?);
            return Ok(());
        }

        let first = &names[0];
        let rest = &names[1..];

        if first == "ctl" {
            if !rest.is_empty() {
                return self.reply_err(tag, errstr::NOT_DIR);
            }
            self.fids.lock().await.insert(newfid, FidInfo::Ctl);
            self.send_client(wire::rwalk(tag, vec![self.ctl_qid()])?);
            return Ok(());
        }

        if self.shared.addr_of(first).await.is_none() {
            return self.reply_err(tag, &format!("File not found: {}", first));
        }

        let backend = match self.get_backend(first).await {
            Ok(backend) => backend,
            Err(e) => return self.reply_err(tag, &e.ename()),
        };

        // Clone the backend root, then walk the remaining components
        let clone_fid = backend.alloc_fid();
        let resp = backend.walk(backend.root_fid(), clone_fid, &[]).await?;
        if let Some(ename) = wire::parse_rerror(&resp) {
            return self.reply_err(tag, &ename);
        }

        let mut wqids = vec![self.backend_qid(first).await];

        if rest.is_empty() {
            self.fids.lock().await.insert(
                newfid,
                FidInfo::Proxied {
                    backend: first.clone(),
                    fid: clone_fid,
                    path: format!("/{}", first),
                },
            );
            self.send_client(wire::rwalk(tag, wqids)?);
            return Ok(());
        }

        let walk_fid = backend.alloc_fid();
        let resp = backend.walk(clone_fid, walk_fid, rest).await?;

        if wire::parse_rerror(&resp).is_some() {
            // The backend dir itself walked fine; the client sees a
            // partial walk and newfid stays unbound
            backend.clunk_quiet(clone_fid).await;
            self.send_client(wire::rwalk(tag, wqids)?);
            return Ok(());
        }

        let walked = wire::parse_rwalk(&resp)?;
        let complete = walked.len() == rest.len();
        wqids.extend(walked);

        if complete {
            backend.clunk_quiet(clone_fid).await;
            self.fids.lock().await.insert(
                newfid,
                FidInfo::Proxied {
                    backend: first.clone(),
                    fid: walk_fid,
                    path: format!("/{}/{}", first, rest.join("/")),
                },
            );
        } else {
            // Partial: the backend never bound walk_fid, and the
            // client keeps its original fid
            backend.clunk_quiet(clone_fid).await;
        }

        self.send_client(wire::rwalk(tag, wqids)?);
        Ok(())
    }

    async fn walk_from_proxied(
        &self,
        tag: u16,
        newfid: u32,
        names: &[String],
        backend_name: &str,
        backend_fid: u32,
        path: &str,
    ) -> Result<()> {
        let backend = match self.backends.lock().await.get(backend_name).cloned() {
            Some(backend) if backend.is_alive() => backend,
            _ => {
                return self.reply_err(tag, &format!("Backend {} disconnected", backend_name));
            }
        };

        let walk_fid = backend.alloc_fid();
        let mut resp = backend.walk(backend_fid, walk_fid, names).await?;

        if wire::parse_rerror(&resp).is_none() {
            let walked = wire::parse_rwalk(&resp)?;
            if names.is_empty() || walked.len() == names.len() {
                let new_path = if names.is_empty() {
                    path.to_owned()
                } else {
                    format!("{}/{}", path.trim_end_matches('/'), names.join("/"))
                };
                self.fids.lock().await.insert(
                    newfid,
                    FidInfo::Proxied {
                        backend: backend_name.to_owned(),
                        fid: walk_fid,
                        path: new_path,
                    },
                );
            }
        }

        // Forward the backend's own response bytes, Rwalk or Rerror
        wire::set_tag(&mut resp, tag);
        self.send_client(resp);
        Ok(())
    }

    /// Clunk: forwarded for proxied fids (leaves rely on the clunk
    /// hook to commit buffered writes); local for root and ctl.
    async fn handle_clunk(&self, frame: &[u8], tag: u16) -> Result<()> {
        let Some(fid) = wire::fid(frame) else {
            return self.reply_err(tag, "malformed Tclunk");
        };

        let info = match self.fids.lock().await.remove(&fid) {
            Some(info) => info,
            None => return self.reply_err(tag, errstr::UNKNOWN_FID),
        };

        match info {
            FidInfo::Root => {
                self.send_client(wire::rclunk(tag)?);
            }
            FidInfo::Ctl => {
                // Any residual (unterminated) buffered command runs
                // now; errors are logged, clunk always succeeds
                if let Some(residual) = self.ctl_bufs.lock().await.remove(&fid) {
                    let line = String::from_utf8_lossy(&residual);
                    let line = line.trim();
                    if !line.is_empty() {
                        if let Err(e) = self.shared.handle_command(line).await {
                            warn!("[{}] ctl: {}", self.id, e.ename());
                        }
                    }
                }
                self.send_client(wire::rclunk(tag)?);
            }
            FidInfo::Proxied {
                backend,
                fid: bfid,
                path,
            } => {
                debug!("[{}] clunk of {} (backend fid {})", self.id, path, bfid);
                match self.backends.lock().await.get(&backend).cloned() {
                    Some(conn) if conn.is_alive() => {
                        let mut frame = frame.to_vec();
                        wire::set_fid(&mut frame, bfid);
                        self.tag_routes.lock().await.insert(tag, backend);
                        conn.send_proxied(frame, tag).await?;
                    }
                    _ => {
                        self.send_client(wire::rclunk(tag)?);
                    }
                }
            }
        }

        Ok(())
    }

    /// Flush: route to whichever backend holds the oldtag.
    async fn handle_flush(&self, frame: &[u8], tag: u16) -> Result<()> {
        let oldtag = wire::flush_oldtag(frame);

        let route = self.tag_routes.lock().await.remove(&oldtag);
        if let Some(backend_name) = route {
            if let Some(backend) = self.backends.lock().await.get(&backend_name).cloned() {
                if backend.is_alive() && backend.send_flush(tag, oldtag).await? {
                    // Rflush comes back through the backend reader
                    return Ok(());
                }
            }
        }

        self.send_client(wire::rflush(tag)?);
        Ok(())
    }

    /// Open/read/write/stat/wstat/create/remove: local for the mux
    /// root and ctl, fid-rewritten and forwarded for proxied fids.
    async fn handle_fid_op(&self, frame: Vec<u8>, mtype: u8, tag: u16) -> Result<()> {
        let Some(fid) = wire::fid(&frame) else {
            return self.reply_err(tag, "malformed request");
        };

        let info = match self.fids.lock().await.get(&fid).cloned() {
            Some(info) => info,
            None => return self.reply_err(tag, errstr::UNKNOWN_FID),
        };

        match info {
            FidInfo::Ctl => self.ctl_op(&frame, mtype, tag, fid).await,
            FidInfo::Root => self.root_op(&frame, mtype, tag).await,
            FidInfo::Proxied {
                backend, fid: bfid, ..
            } => {
                let conn = match self.backends.lock().await.get(&backend).cloned() {
                    Some(conn) if conn.is_alive() => conn,
                    _ => {
                        return self
                            .reply_err(tag, &format!("Backend {} disconnected", backend));
                    }
                };

                let mut frame = frame;
                wire::set_fid(&mut frame, bfid);
                self.tag_routes.lock().await.insert(tag, backend);
                conn.send_proxied(frame, tag).await
            }
        }
    }

    async fn ctl_op(&self, frame: &[u8], mtype: u8, tag: u16, fid: u32) -> Result<()> {
        use MsgType::*;

        match MsgType::from_u8(mtype) {
            Some(TOpen) => {
                self.ctl_bufs.lock().await.remove(&fid);
                self.send_client(wire::ropen(tag, self.ctl_qid(), self.iounit())?);
                Ok(())
            }
            Some(TRead) => {
                let FCall::TRead { offset, count, .. } = wire::parse_msg(frame)?.body else {
                    return self.reply_err(tag, "malformed Tread");
                };
                let listing = self.shared.listing().await.into_bytes();
                let off = (offset as usize).min(listing.len());
                let end = (off + count as usize).min(listing.len());
                self.send_client(wire::rread(tag, listing[off..end].to_vec())?);
                Ok(())
            }
            Some(TWrite) => self.ctl_write(frame, tag, fid).await,
            Some(TStat) => {
                // ctl files traditionally report length 0 in Plan 9
                self.send_client(wire::rstat(tag, self.ctl_stat())?);
                Ok(())
            }
            Some(TWStat) => {
                self.send_client(wire::rwstat(tag)?);
                Ok(())
            }
            Some(TCreate) => self.reply_err(tag, errstr::FILE_EXISTS),
            _ => self.reply_err(tag, "Operation not supported on ctl"),
        }
    }

    async fn ctl_write(&self, frame: &[u8], tag: u16, fid: u32) -> Result<()> {
        let FCall::TWrite { data, .. } = wire::parse_msg(frame)?.body else {
            return self.reply_err(tag, "malformed Twrite");
        };

        // Buffer per fid, consuming complete lines as they arrive so
        // `echo cmd > ctl` works without relying on clunk timing
        let lines: Vec<String> = {
            let mut bufs = self.ctl_bufs.lock().await;
            let buf = bufs.entry(fid).or_default();
            buf.extend_from_slice(&data.0);

            let mut lines = Vec::new();
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&line).trim().to_owned());
            }
            lines
        };

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let reply = self.shared.handle_command(&line).await?;
            info!("[{}] ctl: {} -> {}", self.id, line, reply.trim_end());
        }

        self.send_client(wire::rwrite(tag, data.0.len() as u32)?);
        Ok(())
    }

    async fn root_op(&self, frame: &[u8], mtype: u8, tag: u16) -> Result<()> {
        use MsgType::*;

        match MsgType::from_u8(mtype) {
            Some(TOpen) => {
                self.send_client(wire::ropen(tag, self.root_qid(), self.iounit())?);
                Ok(())
            }
            Some(TRead) => {
                let FCall::TRead { offset, count, .. } = wire::parse_msg(frame)?.body else {
                    return self.reply_err(tag, "malformed Tread");
                };
                let listing = self.root_listing().await?;
                let off = (offset as usize).min(listing.len());
                let end = (off + count as usize).min(listing.len());
                self.send_client(wire::rread(tag, listing[off..end].to_vec())?);
                Ok(())
            }
            Some(TStat) => {
                self.send_client(wire::rstat(tag, self.root_stat())?);
                Ok(())
            }
            Some(TWStat) => {
                self.send_client(wire::rwstat(tag)?);
                Ok(())
            }
            _ => self.reply_err(tag, "Operation not supported on mux root"),
        }
    }

    fn ctl_stat(&self) -> Stat {
        let now = wire::now_sec();
        Stat {
            typ: 0,
            dev: 0,
            qid: self.ctl_qid(),
            mode: 0o666,
            atime: now,
            mtime: now,
            length: 0,
            name: "ctl".to_owned(),
            uid: OWNER.to_owned(),
            gid: OWNER.to_owned(),
            muid: String::new(),
        }
    }

    fn root_stat(&self) -> Stat {
        let now = wire::now_sec();
        Stat {
            typ: 0,
            dev: 0,
            qid: self.root_qid(),
            mode: dm::DIR | 0o777,
            atime: now,
            mtime: now,
            length: 0,
            name: String::new(),
            uid: OWNER.to_owned(),
            gid: OWNER.to_owned(),
            muid: String::new(),
        }
    }

    /// Synthesized root listing: the ctl entry plus one directory
    /// entry per known backend.
    async fn root_listing(&self) -> Result<Vec<u8>> {
        let mut listing = wire::pack_stat("ctl", self.ctl_qid(), 0o666, 0, OWNER)?;

        for name in self.shared.names().await {
            let qid = self.backend_qid(&name).await;
            listing.extend(wire::pack_stat(&name, qid, dm::DIR | 0o777, 0, OWNER)?);
        }

        Ok(listing)
    }

    /// Get or lazily open the connection to a named backend.
    async fn get_backend(&self, name: &str) -> Result<Arc<BackendConnection>> {
        {
            let mut backends = self.backends.lock().await;
            match backends.get(name) {
                Some(conn) if conn.is_alive() => return Ok(conn.clone()),
                Some(_) => {
                    backends.remove(name);
                }
                None => {}
            }
        }

        let addr = self
            .shared
            .addr_of(name)
            .await
            .ok_or_else(|| Error::Ename(format!("File not found: {}", name)))?;

        let conn =
            BackendConnection::connect(name, &addr, self.msize(), self.to_client.clone())
                .await
                .map_err(|e| {
                    debug!("[{}] backend {} connect: {}", self.id, name, e);
                    Error::Ename(format!("Backend {} unreachable", name))
                })?;

        self.backends.lock().await.insert(name.to_owned(), conn.clone());
        Ok(conn)
    }

    async fn cleanup(&self) {
        for (_, backend) in self.backends.lock().await.drain() {
            backend.close().await;
        }
        self.fids.lock().await.clear();
        self.ctl_bufs.lock().await.clear();
        self.tag_routes.lock().await.clear();
    }
}
