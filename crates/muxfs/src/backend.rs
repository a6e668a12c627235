//! Backend 9P connections.
//!
//! Fid space is per-connection in 9P, so one backend TCP socket can
//! never be shared between two clients of the mux: each client
//! connection lazily opens its own socket to every backend it
//! touches. A backend connection negotiates its own version and
//! attach, then proxies traffic with tag rewriting.
//!
//! Two disjoint tag spaces live on each connection: an *external*
//! space for proxied client messages (backend tag mapped back to the
//! client tag by the reader task) and an *internal* space for
//! requests the mux synthesizes itself (version, attach, clone
//! walks, administrative clunks), answered through per-tag oneshot
//! futures. Mixing them would let a client tag collision corrupt an
//! internal future.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

use ninebus::utils::Result;
use ninebus::{MAX_MSIZE, NOTAG, error::Error, om, res, wire};

/// Timeout on every request the mux originates itself.
pub const INTERNAL_TIMEOUT: Duration = Duration::from_secs(5);

const EXT_TAG_FIRST: u16 = 1;
const EXT_TAG_LAST: u16 = 0x7fff;
const INT_TAG_FIRST: u16 = 0x8000;
const INT_TAG_LAST: u16 = 0xfffd;

/// Raw frames headed back to the owning client.
pub type ClientSink = mpsc::UnboundedSender<Vec<u8>>;

/// One TCP connection to a backend 9P server, owned by one client.
pub struct BackendConnection {
    name: String,
    addr: String,
    writer: Mutex<OwnedWriteHalf>,
    msize: AtomicU32,
    root_fid: AtomicU32,
    next_fid: AtomicU32,
    ext: Mutex<ExtTags>,
    internal: Mutex<InternalTags>,
    alive: AtomicBool,
}

struct ExtTags {
    next: u16,
    // backend tag -> client tag
    map: HashMap<u16, u16>,
}

struct InternalTags {
    next: u16,
    pending: HashMap<u16, oneshot::Sender<Vec<u8>>>,
}

impl BackendConnection {
    /// Connect, negotiate version (capped by the client's msize) and
    /// attach. Responses to proxied traffic flow into `to_client`
    /// with their tags already rewritten.
    pub async fn connect(
        name: &str,
        addr: &str,
        client_msize: u32,
        to_client: ClientSink,
    ) -> Result<Arc<Self>> {
        let stream = timeout(INTERNAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Ename(format!("Backend {} unreachable", name)))??;
        let (readhalf, writehalf) = stream.into_split();

        let conn = Arc::new(BackendConnection {
            name: name.to_owned(),
            addr: addr.to_owned(),
            writer: Mutex::new(writehalf),
            msize: AtomicU32::new(client_msize.min(MAX_MSIZE)),
            root_fid: AtomicU32::new(0),
            next_fid: AtomicU32::new(0),
            ext: Mutex::new(ExtTags {
                next: EXT_TAG_FIRST,
                map: HashMap::new(),
            }),
            internal: Mutex::new(InternalTags {
                next: INT_TAG_FIRST,
                pending: HashMap::new(),
            }),
            alive: AtomicBool::new(true),
        });

        tokio::spawn(read_loop(readhalf, conn.clone(), to_client));

        if let Err(e) = conn.negotiate_version().await {
            conn.close().await;
            return Err(e);
        }
        if let Err(e) = conn.attach().await {
            conn.close().await;
            return Err(e);
        }

        info!(
            "backend {} connected to {} (msize={}, root_fid={})",
            conn.name,
            conn.addr,
            conn.msize(),
            conn.root_fid()
        );
        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    pub fn root_fid(&self) -> u32 {
        self.root_fid.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Allocate a backend-side fid.
    pub fn alloc_fid(&self) -> u32 {
        self.next_fid.fetch_add(1, Ordering::Relaxed)
    }

    async fn negotiate_version(&self) -> Result<()> {
        let frame = wire::tversion(self.msize())?;
        let resp = self.request_at(NOTAG, frame).await?;

        if let Some(ename) = wire::parse_rerror(&resp) {
            return res!(format!("Backend version failed: {}", ename));
        }
        let (backend_msize, version) = wire::parse_rversion(&resp)?;
        if version != ninebus::P92000 {
            return res!(format!("Backend {} speaks {}", self.name, version));
        }

        self.msize
            .store(self.msize().min(backend_msize), Ordering::Relaxed);
        Ok(())
    }

    async fn attach(&self) -> Result<()> {
        let fid = self.alloc_fid();
        let resp = self.request(wire::tattach(0, fid, "mux", "")?).await?;

        if let Some(ename) = wire::parse_rerror(&resp) {
            return res!(format!("Backend attach failed: {}", ename));
        }

        self.root_fid.store(fid, Ordering::Relaxed);
        debug!("backend {} attached, root_fid={}", self.name, fid);
        Ok(())
    }

    async fn send_raw(&self, frame: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return res!(format!("Backend {} disconnected", self.name));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        Ok(())
    }

    /// Forward a proxied frame, rewriting the client tag into the
    /// external backend tag space. The response returns through the
    /// reader task.
    pub async fn send_proxied(&self, mut frame: Vec<u8>, client_tag: u16) -> Result<()> {
        let backend_tag = {
            let mut ext = self.ext.lock().await;
            let mut tag = ext.next;
            while ext.map.contains_key(&tag) {
                tag = if tag >= EXT_TAG_LAST { EXT_TAG_FIRST } else { tag + 1 };
            }
            ext.next = if tag >= EXT_TAG_LAST { EXT_TAG_FIRST } else { tag + 1 };
            ext.map.insert(tag, client_tag);
            tag
        };

        wire::set_tag(&mut frame, backend_tag);
        self.send_raw(&frame).await
    }

    /// Issue an internally-tagged request and wait for its response.
    pub async fn request(&self, frame: Vec<u8>) -> Result<Vec<u8>> {
        let tag = {
            let mut internal = self.internal.lock().await;
            let mut tag = internal.next;
            while internal.pending.contains_key(&tag) {
                tag = if tag >= INT_TAG_LAST { INT_TAG_FIRST } else { tag + 1 };
            }
            internal.next = if tag >= INT_TAG_LAST { INT_TAG_FIRST } else { tag + 1 };
            tag
        };

        self.request_at(tag, frame).await
    }

    async fn request_at(&self, tag: u16, mut frame: Vec<u8>) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.internal.lock().await.pending.insert(tag, tx);

        wire::set_tag(&mut frame, tag);
        if let Err(e) = self.send_raw(&frame).await {
            self.internal.lock().await.pending.remove(&tag);
            return Err(e);
        }

        match timeout(INTERNAL_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => {
                res!(format!("Backend {} disconnected", self.name))
            }
            Err(_) => {
                self.internal.lock().await.pending.remove(&tag);
                res!(format!("Backend {} request timeout", self.name))
            }
        }
    }

    /// Walk on the backend; returns the raw Rwalk/Rerror frame.
    pub async fn walk(&self, fid: u32, newfid: u32, names: &[String]) -> Result<Vec<u8>> {
        self.request(wire::twalk(0, fid, newfid, names)?)
            .await
            .map_err(|_| Error::Ename("Backend walk timeout".to_owned()))
    }

    /// Open a backend fid for writing; used by ctl notifications.
    pub async fn open_write(&self, fid: u32) -> Result<()> {
        let resp = self.request(wire::topen(0, fid, om::WRITE)?).await?;
        if let Some(ename) = wire::parse_rerror(&resp) {
            return res!(ename);
        }
        Ok(())
    }

    /// Write to a backend fid; used by ctl notifications.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<()> {
        let resp = self.request(wire::twrite(0, fid, offset, data)?).await?;
        if let Some(ename) = wire::parse_rerror(&resp) {
            return res!(ename);
        }
        Ok(())
    }

    /// Clunk a backend fid the mux no longer needs. Best-effort.
    pub async fn clunk_quiet(&self, fid: u32) {
        match wire::tclunk(0, fid) {
            Ok(frame) => {
                if let Err(e) = self.request(frame).await {
                    debug!("backend {} clunk of fid {} failed: {}", self.name, fid, e);
                }
            }
            Err(e) => debug!("backend {}: {}", self.name, e),
        }
    }

    /// Forward a flush for a proxied client tag. Returns false when
    /// the oldtag is no longer outstanding on this backend.
    pub async fn send_flush(&self, client_tag: u16, client_oldtag: u16) -> Result<bool> {
        let backend_oldtag = {
            let ext = self.ext.lock().await;
            ext.map
                .iter()
                .find(|(_, ct)| **ct == client_oldtag)
                .map(|(bt, _)| *bt)
        };
        let Some(backend_oldtag) = backend_oldtag else {
            return Ok(false);
        };

        let frame = wire::tflush(client_tag, backend_oldtag)?;
        self.send_proxied(frame, client_tag).await?;
        Ok(true)
    }

    /// Shut the connection down; pending internal requests fail.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.internal.lock().await.pending.clear();
    }
}

/// Consume backend responses: internal tags fulfil their futures,
/// external tags are rewritten back to client space and forwarded
/// byte-for-byte.
async fn read_loop(readhalf: OwnedReadHalf, conn: Arc<BackendConnection>, to_client: ClientSink) {
    let mut framed = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .num_skip(0)
        .max_frame_length((MAX_MSIZE + 256) as usize)
        .little_endian()
        .new_read(readhalf);

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame.to_vec(),
            Err(e) => {
                warn!("backend {}: read error: {}", conn.name, e);
                break;
            }
        };
        if frame.len() < wire::HDRSZ {
            warn!("backend {}: truncated frame", conn.name);
            break;
        }

        let tag = wire::tag(&frame);

        // Internally-tagged response?
        if let Some(tx) = conn.internal.lock().await.pending.remove(&tag) {
            let _ = tx.send(frame);
            continue;
        }

        // Proxied response: rewrite tag back into client space
        let client_tag = conn.ext.lock().await.map.remove(&tag);
        match client_tag {
            Some(client_tag) => {
                let mut frame = frame;
                wire::set_tag(&mut frame, client_tag);
                if to_client.send(frame).is_err() {
                    break;
                }
            }
            None => {
                warn!(
                    "backend {}: response for unknown tag {} ({}), dropping",
                    conn.name,
                    tag,
                    wire::msg_name(wire::msg_type(&frame))
                );
            }
        }
    }

    info!("backend {} disconnected", conn.name);
    conn.alive.store(false, Ordering::Relaxed);
    conn.internal.lock().await.pending.clear();
}
