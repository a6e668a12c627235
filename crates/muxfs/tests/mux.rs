//! End-to-end multiplexer tests: real synthetic backends on
//! ephemeral TCP ports, a mux in front, and a raw 9P client.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use muxfs::server::MuxServer;
use ninebus::fs::{CtlHandler, CtlFile, DirNode, GateFile, StaticFile};
use ninebus::srv::dispatch;
use ninebus::utils::Result;
use ninebus::{serialize, *};

async fn spawn_backend(root: Arc<DirNode>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let root = root.clone();
            tokio::spawn(async move {
                let (r, w) = stream.into_split();
                let _ = dispatch(root, r, w).await;
            });
        }
    });

    format!("127.0.0.1:{}", addr.port())
}

async fn spawn_mux(backends: BTreeMap<String, String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = MuxServer::new(backends);

    tokio::spawn(async move {
        let _ = server.serve_on(listener).await;
    });

    addr
}

async fn send(stream: &mut TcpStream, msg: &Msg) {
    let mut buf = vec![0u8; 4];
    serialize::write_msg(&mut buf, msg).unwrap();
    let size = (buf.len() as u32).to_le_bytes();
    buf[..4].copy_from_slice(&size);
    stream.write_all(&buf).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> Msg {
    let mut szbuf = [0u8; 4];
    stream.read_exact(&mut szbuf).await.unwrap();
    let size = u32::from_le_bytes(szbuf) as usize;
    let mut body = vec![0u8; size - 4];
    stream.read_exact(&mut body).await.unwrap();
    serialize::read_msg(&mut Cursor::new(body)).unwrap()
}

async fn rpc(stream: &mut TcpStream, msg: Msg) -> Msg {
    send(stream, &msg).await;
    recv(stream).await
}

async fn session(addr: SocketAddr) -> TcpStream {
    let mut c = TcpStream::connect(addr).await.unwrap();
    let resp = rpc(
        &mut c,
        Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: 16384,
                version: P92000.to_owned(),
            },
        },
    )
    .await;
    assert!(matches!(resp.body, FCall::RVersion { .. }));

    let resp = rpc(
        &mut c,
        Msg {
            tag: 1,
            body: FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "test".to_owned(),
                aname: String::new(),
            },
        },
    )
    .await;
    assert!(matches!(resp.body, FCall::RAttach { .. }));
    c
}

fn twalk(tag: u16, fid: u32, newfid: u32, names: &[&str]) -> Msg {
    Msg {
        tag,
        body: FCall::TWalk {
            fid,
            newfid,
            wnames: names.iter().map(|s| s.to_string()).collect(),
        },
    }
}

fn topen(tag: u16, fid: u32, mode: u8) -> Msg {
    Msg {
        tag,
        body: FCall::TOpen { fid, mode },
    }
}

fn tread(tag: u16, fid: u32, offset: u64, count: u32) -> Msg {
    Msg {
        tag,
        body: FCall::TRead { fid, offset, count },
    }
}

fn twrite(tag: u16, fid: u32, offset: u64, data: &[u8]) -> Msg {
    Msg {
        tag,
        body: FCall::TWrite {
            fid,
            offset,
            data: Data(data.to_vec()),
        },
    }
}

fn tclunk(tag: u16, fid: u32) -> Msg {
    Msg {
        tag,
        body: FCall::TClunk { fid },
    }
}

fn ename(msg: &Msg) -> String {
    match &msg.body {
        FCall::RError { ename } => ename.clone(),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

fn read_data(msg: &Msg) -> Vec<u8> {
    match &msg.body {
        FCall::RRead { data } => data.0.clone(),
        other => panic!("expected Rread, got {:?}", other),
    }
}

/// Ctl handler that records every executed line.
#[derive(Default)]
struct RecordingCtl {
    lines: Mutex<Vec<String>>,
}

#[async_trait]
impl CtlHandler for RecordingCtl {
    async fn execute(&self, line: &str) -> Result<String> {
        self.lines.lock().unwrap().push(line.to_owned());
        Ok("ok".to_owned())
    }

    async fn status(&self) -> String {
        format!("commands {}\n", self.lines.lock().unwrap().len())
    }
}

fn rio_root() -> Arc<DirNode> {
    let root = DirNode::new("");
    root.add_file(StaticFile::read_only("screen", b"pixels".to_vec()))
        .unwrap();
    root
}

fn llm_root(ctl: Arc<RecordingCtl>) -> Arc<DirNode> {
    let root = DirNode::new("");
    root.add_file(CtlFile::new("ctl", ctl)).unwrap();
    root
}

#[tokio::test]
async fn walk_into_backend_and_write_ctl() {
    let ctl = Arc::new(RecordingCtl::default());
    let rio_addr = spawn_backend(rio_root()).await;
    let llm_addr = spawn_backend(llm_root(ctl.clone())).await;

    let mut backends = BTreeMap::new();
    backends.insert("rio".to_owned(), rio_addr);
    backends.insert("llm".to_owned(), llm_addr);
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    // Walk root -> f1 through ["llm", "ctl"]: two qids, dir then file
    let resp = rpc(&mut c, twalk(2, 0, 1, &["llm", "ctl"])).await;
    match &resp.body {
        FCall::RWalk { wqids } => {
            assert_eq!(wqids.len(), 2);
            assert!(wqids[0].typ.contains(QidType::DIR));
            assert!(!wqids[1].typ.contains(QidType::DIR));
        }
        other => panic!("expected Rwalk, got {:?}", other),
    }

    // The write lands on the backend's ctl as one command line
    let resp = rpc(&mut c, topen(3, 1, om::WRITE)).await;
    assert!(matches!(resp.body, FCall::ROpen { .. }));

    let resp = rpc(&mut c, twrite(4, 1, 0, b"provider x\n")).await;
    assert_eq!(resp.body, FCall::RWrite { count: 11 });

    let resp = rpc(&mut c, tclunk(5, 1)).await;
    assert_eq!(resp.body, FCall::RClunk);

    // Give the backend a beat to run the command. Startup machine
    // notifications may land in the same log, so look for ours.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ctl.lines.lock().unwrap().contains(&"provider x".to_owned()));
}

#[tokio::test]
async fn proxied_read_preserves_payload() {
    let rio_addr = spawn_backend(rio_root()).await;

    let mut backends = BTreeMap::new();
    backends.insert("rio".to_owned(), rio_addr);
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    rpc(&mut c, twalk(2, 0, 1, &["rio", "screen"])).await;
    rpc(&mut c, topen(3, 1, om::READ)).await;

    let resp = rpc(&mut c, tread(4, 1, 0, 4096)).await;
    assert_eq!(resp.tag, 4);
    assert_eq!(read_data(&resp), b"pixels");

    // Clone the proxied fid with an empty walk; both stay usable
    let resp = rpc(&mut c, twalk(5, 0, 2, &["rio"])).await;
    assert!(matches!(resp.body, FCall::RWalk { .. }));
    let resp = rpc(&mut c, twalk(6, 2, 3, &[])).await;
    assert_eq!(resp.body, FCall::RWalk { wqids: vec![] });
    let resp = rpc(
        &mut c,
        Msg {
            tag: 7,
            body: FCall::TStat { fid: 3 },
        },
    )
    .await;
    assert!(matches!(resp.body, FCall::RStat { .. }));
}

#[tokio::test]
async fn root_listing_and_unknown_walks() {
    let rio_addr = spawn_backend(rio_root()).await;

    let mut backends = BTreeMap::new();
    backends.insert("rio".to_owned(), rio_addr);
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    // Root read lists ctl plus one entry per backend
    rpc(&mut c, twalk(2, 0, 1, &[])).await;
    rpc(&mut c, topen(3, 1, om::READ)).await;
    let resp = rpc(&mut c, tread(4, 1, 0, 8192)).await;
    let data = read_data(&resp);

    let mut names = Vec::new();
    let mut cursor = Cursor::new(data);
    while let Ok(stat) = <Stat as serialize::Decodable>::decode(&mut cursor) {
        names.push(stat.name);
    }
    assert_eq!(names, ["ctl", "rio"]);

    // Unknown top-level name
    let resp = rpc(&mut c, twalk(5, 0, 2, &["nope"])).await;
    assert_eq!(ename(&resp), "File not found: nope");

    // ctl is a file, not a directory
    let resp = rpc(&mut c, twalk(6, 0, 2, &["ctl", "deeper"])).await;
    assert_eq!(ename(&resp), "not a directory");
}

#[tokio::test]
async fn backend_unreachable() {
    let mut backends = BTreeMap::new();
    // Nothing listens on port 1
    backends.insert("dead".to_owned(), "127.0.0.1:1".to_owned());
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    let resp = rpc(&mut c, twalk(2, 0, 1, &["dead"])).await;
    assert_eq!(ename(&resp), "Backend dead unreachable");
}

#[tokio::test]
async fn dynamic_backend_add_via_ctl() {
    let rio_addr = spawn_backend(rio_root()).await;

    let llm2_root = DirNode::new("");
    llm2_root
        .add_file(StaticFile::read_only("x", b"late".to_vec()))
        .unwrap();
    let llm2_addr = spawn_backend(llm2_root).await;

    let mut backends = BTreeMap::new();
    backends.insert("rio".to_owned(), rio_addr);
    let mux = spawn_mux(backends).await;

    // Client A registers the new backend through the mux ctl
    let mut a = session(mux).await;
    rpc(&mut a, twalk(2, 0, 1, &["ctl"])).await;
    rpc(&mut a, topen(3, 1, om::WRITE)).await;
    let resp = rpc(
        &mut a,
        twrite(4, 1, 0, format!("add llm2 {}\n", llm2_addr).as_bytes()),
    )
    .await;
    assert!(matches!(resp.body, FCall::RWrite { .. }));
    rpc(&mut a, tclunk(5, 1)).await;

    // A second client sees llm2 in the root listing...
    let mut b = session(mux).await;
    rpc(&mut b, twalk(2, 0, 1, &[])).await;
    rpc(&mut b, topen(3, 1, om::READ)).await;
    let resp = rpc(&mut b, tread(4, 1, 0, 8192)).await;
    let listing = read_data(&resp);
    let mut names = Vec::new();
    let mut cursor = Cursor::new(listing);
    while let Ok(stat) = <Stat as serialize::Decodable>::decode(&mut cursor) {
        names.push(stat.name);
    }
    assert_eq!(names, ["ctl", "llm2", "rio"]);

    // ...and can walk into it, which lazily dials the backend
    let resp = rpc(&mut b, twalk(5, 0, 2, &["llm2", "x"])).await;
    match &resp.body {
        FCall::RWalk { wqids } => assert_eq!(wqids.len(), 2),
        other => panic!("expected Rwalk, got {:?}", other),
    }
    rpc(&mut b, topen(6, 2, om::READ)).await;
    let resp = rpc(&mut b, tread(7, 2, 0, 64)).await;
    assert_eq!(read_data(&resp), b"late");

    // Reading the mux ctl reports the new backend
    rpc(&mut b, twalk(8, 0, 3, &["ctl"])).await;
    rpc(&mut b, topen(9, 3, om::READ)).await;
    let resp = rpc(&mut b, tread(10, 3, 0, 4096)).await;
    let text = String::from_utf8(read_data(&resp)).unwrap();
    assert!(text.contains("llm2"));
    assert!(text.contains("rio"));
}

#[tokio::test]
async fn removed_backend_drains_gracefully() {
    let rio_addr = spawn_backend(rio_root()).await;

    let mut backends = BTreeMap::new();
    backends.insert("rio".to_owned(), rio_addr);
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    // Hold an open fid into the backend
    rpc(&mut c, twalk(2, 0, 1, &["rio", "screen"])).await;
    rpc(&mut c, topen(3, 1, om::READ)).await;

    // Remove the backend through ctl
    rpc(&mut c, twalk(4, 0, 2, &["ctl"])).await;
    rpc(&mut c, topen(5, 2, om::WRITE)).await;
    rpc(&mut c, twrite(6, 2, 0, b"remove rio\n")).await;
    rpc(&mut c, tclunk(7, 2)).await;

    // New walks no longer resolve...
    let resp = rpc(&mut c, twalk(8, 0, 3, &["rio"])).await;
    assert_eq!(ename(&resp), "File not found: rio");

    // ...but the existing fid keeps working until clunked
    let resp = rpc(&mut c, tread(9, 1, 0, 64)).await;
    assert_eq!(read_data(&resp), b"pixels");
    let resp = rpc(&mut c, tclunk(10, 1)).await;
    assert_eq!(resp.body, FCall::RClunk);
}

#[tokio::test]
async fn flush_forwarded_to_backend() {
    let gate = GateFile::new("output");
    let root = DirNode::new("");
    root.add_file(gate.clone()).unwrap();
    let addr = spawn_backend(root).await;

    let mut backends = BTreeMap::new();
    backends.insert("rio".to_owned(), addr);
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    rpc(&mut c, twalk(2, 0, 1, &["rio", "output"])).await;
    rpc(&mut c, topen(3, 1, om::READ)).await;

    // The read blocks inside the backend leaf
    send(&mut c, &tread(7, 1, 0, 64)).await;
    assert!(timeout(Duration::from_millis(100), recv(&mut c)).await.is_err());

    send(
        &mut c,
        &Msg {
            tag: 8,
            body: FCall::TFlush { oldtag: 7 },
        },
    )
    .await;

    // The backend answers the cancelled read first, then the flush;
    // the mux forwards both with the client's own tags
    let first = recv(&mut c).await;
    assert_eq!(first.tag, 7);
    assert_eq!(ename(&first), "interrupted");

    let second = recv(&mut c).await;
    assert_eq!(second.tag, 8);
    assert_eq!(second.body, FCall::RFlush);
}

#[tokio::test]
async fn partial_walk_leaves_newfid_unbound() {
    let rio_addr = spawn_backend(rio_root()).await;

    let mut backends = BTreeMap::new();
    backends.insert("rio".to_owned(), rio_addr);
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    // "rio" resolves, "missing" does not: one qid, newfid unbound
    let resp = rpc(&mut c, twalk(2, 0, 1, &["rio", "missing"])).await;
    match &resp.body {
        FCall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
        other => panic!("expected Rwalk, got {:?}", other),
    }

    let resp = rpc(
        &mut c,
        Msg {
            tag: 3,
            body: FCall::TStat { fid: 1 },
        },
    )
    .await;
    assert_eq!(ename(&resp), "unknown fid");
}

#[tokio::test]
async fn machine_notifications_reach_llm_backends() {
    let ctl = Arc::new(RecordingCtl::default());
    let llm_addr = spawn_backend(llm_root(ctl.clone())).await;
    let rio_addr = spawn_backend(rio_root()).await;

    let late_root = DirNode::new("");
    late_root
        .add_file(StaticFile::read_only("x", vec![]))
        .unwrap();
    let late_addr = spawn_backend(late_root).await;

    let mut backends = BTreeMap::new();
    backends.insert("llm".to_owned(), llm_addr);
    backends.insert("rio".to_owned(), rio_addr);
    let mux = spawn_mux(backends).await;

    let mut c = session(mux).await;

    // Startup notification: the llm backend learns about rio
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctl.lines.lock().unwrap().contains(&"machine add rio".to_owned()));

    // Adding a backend notifies llm-like backends too
    rpc(&mut c, twalk(2, 0, 1, &["ctl"])).await;
    rpc(&mut c, topen(3, 1, om::WRITE)).await;
    rpc(
        &mut c,
        twrite(4, 1, 0, format!("add late {}\n", late_addr).as_bytes()),
    )
    .await;
    rpc(&mut c, tclunk(5, 1)).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctl.lines.lock().unwrap().contains(&"machine add late".to_owned()));

    // So does removing one
    rpc(&mut c, twalk(6, 0, 2, &["ctl"])).await;
    rpc(&mut c, topen(7, 2, om::WRITE)).await;
    rpc(&mut c, twrite(8, 2, 0, b"remove late\n")).await;
    rpc(&mut c, tclunk(9, 2)).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctl.lines.lock().unwrap().contains(&"machine remove late".to_owned()));
}
