//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! Serves a synthetic [`fs`] tree over TCP or a Unix stream socket.
//! Each connection runs a frame loop; `Tversion` is answered inline
//! because it changes the session's framing limit, and every other
//! message is dispatched as its own task so a blocked read on one fid
//! never stalls the rest of the connection. Response frames are
//! written atomically under a single writer lock; ordering on the
//! wire is by tag, not position.

use {
    crate::{
        error::{self, string as errstr},
        fcall::*,
        fs::{self, DirNode, Node},
        io_err, res, serialize,
        utils::{self, Result},
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    num_traits::FromPrimitive,
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Mutex, RwLock, watch},
    },
    tokio_stream::StreamExt,
    tokio_util::{
        codec::{FramedWrite, length_delimited::LengthDelimitedCodec},
        sync::CancellationToken,
    },
};

/// Slack allowed on top of the negotiated msize before a frame is a
/// protocol violation that closes the connection.
const MSIZE_SLACK: u32 = 256;

/// A client fid bound to a node of the tree.
pub struct Fid {
    raw: u32,
    key: u64,
    node: Node,
    // Parent directory and leaf name, for Tremove
    origin: Option<(Arc<DirNode>, String)>,
    state: Mutex<FidState>,
}

#[derive(Default)]
struct FidState {
    open_mode: Option<u8>,
    dir_index: usize,
    dir_offset: u64,
}

impl Fid {
    /// The raw client-chosen fid.
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Process-global key leaves use for per-fid scratch.
    pub fn key(&self) -> u64 {
        self.key
    }
}

#[derive(Clone)]
struct Inflight {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Session {
    root: Arc<DirNode>,
    msize: AtomicU32,
    fids: RwLock<HashMap<u32, Arc<Fid>>>,
    inflight: Mutex<HashMap<u16, Inflight>>,
}

impl Session {
    fn iounit(&self) -> u32 {
        self.msize.load(Ordering::Relaxed) - IOHDRSZ
    }

    async fn fid(&self, raw: u32) -> Result<Arc<Fid>> {
        self.fids
            .read()
            .await
            .get(&raw)
            .cloned()
            .ok_or_else(|| error::Error::Ename(errstr::UNKNOWN_FID.to_owned()))
    }

    async fn bind(
        &self,
        raw: u32,
        node: Node,
        origin: Option<(Arc<DirNode>, String)>,
    ) -> Result<()> {
        let mut fids = self.fids.write().await;
        if fids.contains_key(&raw) {
            return res!(errstr::FID_IN_USE);
        }
        fids.insert(
            raw,
            Arc::new(Fid {
                raw,
                key: fs::alloc_fid_key(),
                node,
                origin,
                state: Mutex::new(FidState::default()),
            }),
        );
        Ok(())
    }
}

async fn dispatch_once(msg: &Msg, session: &Session, cancel: &CancellationToken) -> Result<FCall> {
    use crate::FCall::*;

    match msg.body {
        TAuth { .. } => res!(errstr::NO_AUTH),
        TAttach { fid, .. } => attach(session, fid).await,
        TWalk {
            fid,
            newfid,
            ref wnames,
        } => walk(session, fid, newfid, wnames).await,
        TOpen { fid, mode } => open(session, fid, mode).await,
        TCreate { .. } => res!(errstr::CREATE_PROHIBITED),
        TRead { fid, offset, count } => read(session, fid, offset, count, cancel).await,
        TWrite {
            fid,
            offset,
            ref data,
        } => write(session, fid, offset, &data.0).await,
        TClunk { fid } => clunk(session, fid).await,
        TRemove { fid } => remove(session, fid).await,
        TStat { fid } => stat(session, fid).await,
        TWStat { fid, ref stat } => wstat(session, fid, stat).await,
        TFlush { oldtag } => flush(session, msg.tag, oldtag).await,
        _ => res!(format!(
            "Unknown message type {}",
            MsgType::from(&msg.body) as u8
        )),
    }
}

async fn attach(session: &Session, fid: u32) -> Result<FCall> {
    let node = Node::Dir(session.root.clone());
    let qid = node.qid();
    session.bind(fid, node, None).await?;
    Ok(FCall::RAttach { qid })
}

async fn walk(session: &Session, fid: u32, newfid: u32, wnames: &[String]) -> Result<FCall> {
    let from = session.fid(fid).await?;
    if from.state.lock().await.open_mode.is_some() {
        return res!(errstr::WALK_OPEN_FID);
    }

    // A walk with zero names clones the fid
    if wnames.is_empty() {
        session
            .bind(newfid, from.node.clone(), from.origin.clone())
            .await?;
        return Ok(FCall::RWalk { wqids: vec![] });
    }

    let mut wqids = Vec::with_capacity(wnames.len());
    let mut cur = from.node.clone();
    let mut origin = from.origin.clone();

    for (i, name) in wnames.iter().enumerate() {
        let dir = match &cur {
            Node::Dir(d) => d.clone(),
            // Walks stop at the first file; trailing names fail
            Node::File(_) => {
                if i == 0 {
                    return res!(errstr::NOT_DIR);
                }
                break;
            }
        };

        match dir.child(name) {
            Some(next) => {
                wqids.push(next.qid());
                origin = Some((dir, name.clone()));
                cur = next;
            }
            None => {
                if i == 0 {
                    return res!(format!("File not found: {}", name));
                }
                break;
            }
        }
    }

    // newfid is bound only when the whole walk succeeded
    if wqids.len() == wnames.len() {
        session.bind(newfid, cur, origin).await?;
    }

    Ok(FCall::RWalk { wqids })
}

async fn open(session: &Session, fid: u32, mode: u8) -> Result<FCall> {
    let f = session.fid(fid).await?;
    let mut st = f.state.lock().await;
    if st.open_mode.is_some() {
        return res!(errstr::FID_OPEN);
    }

    let iounit = session.iounit();
    match &f.node {
        Node::Dir(d) => {
            if matches!(mode & 3, om::WRITE | om::RDWR) {
                return res!(errstr::IS_DIR);
            }
            st.open_mode = Some(mode);
            st.dir_index = 0;
            st.dir_offset = 0;
            Ok(FCall::ROpen {
                qid: d.qid(),
                iounit,
            })
        }
        Node::File(file) => {
            file.open(f.key, mode).await?;
            if mode & om::TRUNC != 0 {
                file.truncate(0).await?;
            }
            st.open_mode = Some(mode);
            Ok(FCall::ROpen {
                qid: file.qid(),
                iounit,
            })
        }
    }
}

async fn read(
    session: &Session,
    fid: u32,
    offset: u64,
    count: u32,
    cancel: &CancellationToken,
) -> Result<FCall> {
    let f = session.fid(fid).await?;

    {
        let st = f.state.lock().await;
        match st.open_mode {
            None => return res!(errstr::FID_NOT_OPEN),
            Some(mode) if mode & 3 == om::WRITE => return res!(errstr::PERM),
            Some(_) => {}
        }
    }

    let count = count.min(session.iounit());
    match &f.node {
        Node::Dir(d) => read_dir(&f, d, offset, count).await,
        Node::File(file) => {
            // Leaf reads may suspend indefinitely; Tflush cancels here
            tokio::select! {
                _ = cancel.cancelled() => res!(errstr::INTERRUPTED),
                r = file.read(f.key, offset, count) => {
                    r.map(|data| FCall::RRead { data: Data(data) })
                }
            }
        }
    }
}

async fn read_dir(f: &Fid, dir: &Arc<DirNode>, offset: u64, count: u32) -> Result<FCall> {
    let mut st = f.state.lock().await;

    if offset == 0 {
        st.dir_index = 0;
        st.dir_offset = 0;
    } else if offset != st.dir_offset {
        return res!(errstr::BAD_DIR_OFFSET);
    }

    let mut out = Vec::new();
    while let Some(child) = dir.entry_at(st.dir_index) {
        let stat = child.stat();
        if out.len() + stat.size() as usize + 2 > count as usize {
            break;
        }
        serialize::Encodable::encode(&stat, &mut out)?;
        st.dir_index += 1;
    }

    st.dir_offset = offset + out.len() as u64;
    Ok(FCall::RRead { data: Data(out) })
}

async fn write(session: &Session, fid: u32, offset: u64, data: &[u8]) -> Result<FCall> {
    let f = session.fid(fid).await?;

    {
        let st = f.state.lock().await;
        match st.open_mode {
            None => return res!(errstr::FID_NOT_OPEN),
            Some(mode) if matches!(mode & 3, om::READ | om::EXEC) => {
                return res!(errstr::PERM);
            }
            Some(_) => {}
        }
    }

    match &f.node {
        Node::Dir(_) => res!(errstr::IS_DIR),
        Node::File(file) => {
            let count = file.write(f.key, offset, data).await?;
            Ok(FCall::RWrite { count })
        }
    }
}

async fn clunk(session: &Session, fid: u32) -> Result<FCall> {
    let f = session
        .fids
        .write()
        .await
        .remove(&fid)
        .ok_or_else(|| error::Error::Ename(errstr::UNKNOWN_FID.to_owned()))?;

    // Hook errors never reach the client; the fid is gone either way
    if let Node::File(file) = &f.node {
        if let Err(e) = file.clunk(f.key).await {
            warn!("clunk hook failed on {}: {}", file.name(), e);
        }
    }

    Ok(FCall::RClunk)
}

async fn remove(session: &Session, fid: u32) -> Result<FCall> {
    // Tremove always consumes the fid, even on error
    let f = session
        .fids
        .write()
        .await
        .remove(&fid)
        .ok_or_else(|| error::Error::Ename(errstr::UNKNOWN_FID.to_owned()))?;

    if let Node::File(file) = &f.node {
        if let Err(e) = file.clunk(f.key).await {
            warn!("clunk hook failed on {}: {}", file.name(), e);
        }
    }

    let removable = match &f.node {
        Node::Dir(d) => d.is_removable(),
        Node::File(file) => file.removable(),
    };

    match (&f.origin, removable) {
        (Some((parent, name)), true) => {
            parent.remove(name);
            Ok(FCall::RRemove)
        }
        _ => res!(errstr::REMOVE_PROHIBITED),
    }
}

async fn stat(session: &Session, fid: u32) -> Result<FCall> {
    let f = session.fid(fid).await?;
    Ok(FCall::RStat {
        stat: f.node.stat(),
    })
}

async fn wstat(session: &Session, fid: u32, stat: &Stat) -> Result<FCall> {
    let f = session.fid(fid).await?;

    // Wstat is accepted silently, except that a length carries a
    // truncate request for writable leaves ("don't touch" is ~0)
    if stat.length != !0u64 {
        if let Node::File(file) = &f.node {
            file.truncate(stat.length).await?;
        }
    }

    Ok(FCall::RWStat)
}

async fn flush(session: &Session, tag: u16, oldtag: u16) -> Result<FCall> {
    // Best-effort cancel: signal the task servicing oldtag and wait
    // for it to answer its own tag before Rflush goes out. Unknown
    // and duplicate oldtags succeed silently.
    if oldtag != tag {
        let target = session.inflight.lock().await.get(&oldtag).cloned();
        if let Some(inflight) = target {
            inflight.cancel.cancel();
            let mut done = inflight.done;
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    Ok(FCall::RFlush)
}

fn version_reply(session: &Session, client_msize: u32, version: &str) -> FCall {
    let msize = client_msize.min(MAX_MSIZE);

    if version != P92000 {
        return FCall::RVersion {
            msize,
            version: VERSION_UNKNOWN.to_owned(),
        };
    }

    session.msize.store(msize, Ordering::Relaxed);
    FCall::RVersion {
        msize,
        version: P92000.to_owned(),
    }
}

async fn send_msg<W>(
    framedwrite: &Mutex<FramedWrite<W, LengthDelimitedCodec>>,
    msg: &Msg,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = bytes::BytesMut::with_capacity(4096).writer();
    serialize::write_msg(&mut writer, msg)?;

    let frozen = writer.into_inner().freeze();
    framedwrite.lock().await.send(frozen).await?;
    debug!("→ {:?}", msg);
    Ok(())
}

/// Serve one established connection until it closes.
///
/// Public so tests and embedders can run a session over any byte
/// stream (e.g. `tokio::io::duplex`).
pub async fn dispatch<Reader, Writer>(
    root: Arc<DirNode>,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let session = Arc::new(Session {
        root,
        msize: AtomicU32::new(MAX_MSIZE),
        fids: RwLock::new(HashMap::new()),
        inflight: Mutex::new(HashMap::new()),
    });

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .max_frame_length((MAX_MSIZE + MSIZE_SLACK) as usize)
        .little_endian()
        .new_read(reader);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);
    let framedwrite = Arc::new(Mutex::new(framedwrite));

    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        if bytes.len() < 3 {
            error!("truncated frame, closing connection");
            break;
        }
        let msize = session.msize.load(Ordering::Relaxed);
        if bytes.len() as u32 + 4 > msize + MSIZE_SLACK {
            error!(
                "frame of {} bytes exceeds msize {}, closing connection",
                bytes.len() + 4,
                msize
            );
            break;
        }

        // Anything that is not a known T-message gets an Rerror
        // without touching the session.
        let mtype = bytes[0];
        let tag = u16::from_le_bytes([bytes[1], bytes[2]]);
        match MsgType::from_u8(mtype) {
            Some(t) if t.is_t() => {}
            _ => {
                let reply = Msg {
                    tag,
                    body: FCall::RError {
                        ename: format!("Unknown message type {}", mtype),
                    },
                };
                send_msg(&framedwrite, &reply).await?;
                continue;
            }
        }

        let msg = match serialize::read_msg(&mut bytes.reader()) {
            Ok(msg) => msg,
            Err(e) => {
                error!("unreadable frame: {}, closing connection", e);
                break;
            }
        };
        debug!("← {:?}", msg);

        // Tversion changes the framing limit for the whole session,
        // so it cannot race the messages behind it.
        if let FCall::TVersion { msize, ref version } = msg.body {
            let reply = Msg {
                tag: msg.tag,
                body: version_reply(&session, msize, version),
            };
            send_msg(&framedwrite, &reply).await?;
            continue;
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        session.inflight.lock().await.insert(
            msg.tag,
            Inflight {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let session = session.clone();
        let framedwrite = framedwrite.clone();

        tokio::spawn(async move {
            let response_fcall = dispatch_once(&msg, &session, &cancel)
                .await
                .unwrap_or_else(|e| {
                    debug!("{:?}: error: {}", MsgType::from(&msg.body), e);
                    FCall::RError { ename: e.ename() }
                });

            let response = Msg {
                tag: msg.tag,
                body: response_fcall,
            };
            if let Err(e) = send_msg(&framedwrite, &response).await {
                error!("failed to send response for tag {}: {:?}", msg.tag, e);
            }

            session.inflight.lock().await.remove(&msg.tag);
            let _ = done_tx.send(true);
        });
    }

    // The session dies with the connection: clunk every leftover fid
    // so leaf hooks can release their per-fid state.
    let fids = std::mem::take(&mut *session.fids.write().await);
    for (_, fid) in fids {
        if let Node::File(file) = &fid.node {
            if let Err(e) = file.clunk(fid.key).await {
                warn!("clunk hook failed on {}: {}", file.name(), e);
            }
        }
    }

    Ok(())
}

async fn srv_async_tcp(root: Arc<DirNode>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let root = root.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = dispatch(root, readhalf, writehalf).await;
            if let Err(e) = res {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

pub async fn srv_async_unix(root: Arc<DirNode>, addr: impl AsRef<Path>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let root = root.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            let res = dispatch(root, readhalf, writehalf).await;
                            if let Err(e) = res {
                                error!("Error: {:?}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Serve `root` at `addr` (`tcp!host!port` or `unix!path`).
pub async fn srv_async(root: Arc<DirNode>, addr: &str) -> Result<()> {
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(root, &listen_addr).await,
        "unix" => srv_async_unix(root, &listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
