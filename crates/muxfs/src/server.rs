//! Mux listener and the shared backend registry.
//!
//! The registry is one `RwLock` map shared by every client
//! connection, so a ctl `add`/`remove` issued on one connection is
//! visible to all of them at once: new walks resolve against the
//! updated map while fids already proxied into a removed backend
//! keep draining until they are clunked.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{RwLock, mpsc};

use ninebus::utils::Result;
use ninebus::{DEFAULT_MSIZE, error::Error, io_err, res, utils, wire};

use crate::backend::BackendConnection;
use crate::conn::MuxConnection;

/// State shared by every client connection of one mux instance.
pub struct MuxShared {
    // backend name -> host:port
    backends: RwLock<BTreeMap<String, String>>,
}

impl MuxShared {
    pub fn new(backends: BTreeMap<String, String>) -> Arc<Self> {
        Arc::new(MuxShared {
            backends: RwLock::new(backends),
        })
    }

    pub async fn addr_of(&self, name: &str) -> Option<String> {
        self.backends.read().await.get(name).cloned()
    }

    /// Backend names in listing order.
    pub async fn names(&self) -> Vec<String> {
        self.backends.read().await.keys().cloned().collect()
    }

    /// Content of the ctl file: one `NAME HOST:PORT` per line.
    pub async fn listing(&self) -> String {
        let backends = self.backends.read().await;
        let mut out = String::new();
        for (name, addr) in backends.iter() {
            out.push_str(name);
            out.push(' ');
            out.push_str(addr);
            out.push('\n');
        }
        out
    }

    /// Register a backend at runtime. Immediately visible to every
    /// client on its next walk or directory read.
    pub async fn add_backend(&self, name: &str, addr: &str) -> Result<String> {
        let (_, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::Ename(format!("invalid address '{}', expected host:port", addr)))?;
        if port.parse::<u16>().is_err() {
            return res!(format!("invalid port '{}'", port));
        }

        {
            let mut backends = self.backends.write().await;
            if backends.contains_key(name) {
                return res!(format!("backend '{}' already exists", name));
            }
            backends.insert(name.to_owned(), addr.to_owned());
        }
        info!("backend '{}' added: {}", name, addr);

        self.notify_llm_backends(format!("machine add {}", name), name)
            .await;
        Ok(format!("added {} {}\n", name, addr))
    }

    /// Unregister a backend. Existing fids into it stay valid until
    /// clunked; new walks no longer resolve to it.
    pub async fn remove_backend(&self, name: &str) -> Result<String> {
        if self.backends.read().await.get(name).is_none() {
            return res!(format!("backend '{}' not found", name));
        }

        self.notify_llm_backends(format!("machine remove {}", name), name)
            .await;

        self.backends.write().await.remove(name);
        info!("backend '{}' removed", name);
        Ok(format!("removed {}\n", name))
    }

    /// One ctl command line: `add NAME HOST:PORT` | `remove NAME`.
    pub async fn handle_command(&self, line: &str) -> Result<String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(String::new());
        }

        match (parts[0].to_lowercase().as_str(), parts.len()) {
            ("add", 3) => self.add_backend(parts[1], parts[2]).await,
            ("remove", 2) => self.remove_backend(parts[1]).await,
            _ => res!(format!(
                "unknown command '{}', usage: add <name> <host>:<port> | remove <name>",
                line
            )),
        }
    }

    /// On startup, tell each llm-like backend about every other
    /// backend it can reach through the mux.
    pub async fn notify_initial(&self) {
        let backends: Vec<(String, String)> = {
            let map = self.backends.read().await;
            map.iter().map(|(n, a)| (n.clone(), a.clone())).collect()
        };

        for (llm_name, llm_addr) in backends.iter().filter(|(n, _)| n.contains("llm")) {
            for (other, _) in backends.iter().filter(|(n, _)| n != llm_name) {
                spawn_ctl_notify(
                    llm_name.clone(),
                    llm_addr.clone(),
                    format!("machine add {}", other),
                );
            }
        }
    }

    /// Backends whose name contains `llm` track the machines mounted
    /// beside them; tell them about a change via their own ctl file.
    async fn notify_llm_backends(&self, command: String, skip: &str) {
        let targets: Vec<(String, String)> = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .filter(|(name, _)| name.contains("llm") && name.as_str() != skip)
                .map(|(n, a)| (n.clone(), a.clone()))
                .collect()
        };

        for (name, addr) in targets {
            spawn_ctl_notify(name, addr, command.clone());
        }
    }
}

fn spawn_ctl_notify(backend: String, addr: String, command: String) {
    tokio::spawn(async move {
        if let Err(e) = write_backend_ctl(&backend, &addr, &command).await {
            warn!("ctl notify of {} failed: {}", backend, e);
        }
    });
}

/// Fire-and-forget `command` into a backend's `/ctl`: fresh
/// connection, walk, open, write, clunk.
async fn write_backend_ctl(backend: &str, addr: &str, command: &str) -> Result<()> {
    // The notification connection carries no proxied traffic, so the
    // client sink is never read from.
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);

    let conn = BackendConnection::connect(backend, addr, DEFAULT_MSIZE, tx).await?;

    let fid = conn.alloc_fid();
    let resp = conn
        .walk(conn.root_fid(), fid, &["ctl".to_owned()])
        .await?;
    if let Some(ename) = wire::parse_rerror(&resp) {
        conn.close().await;
        return res!(ename);
    }

    let result: Result<()> = async {
        conn.open_write(fid).await?;
        conn.write(fid, 0, command.as_bytes()).await?;
        conn.clunk_quiet(fid).await;
        Ok(())
    }
    .await;

    conn.close().await;
    result
}

/// The multiplexer's TCP/Unix listener.
pub struct MuxServer {
    shared: Arc<MuxShared>,
    next_conn_id: AtomicU64,
}

impl MuxServer {
    pub fn new(backends: BTreeMap<String, String>) -> Self {
        MuxServer {
            shared: MuxShared::new(backends),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn shared(&self) -> Arc<MuxShared> {
        self.shared.clone()
    }

    /// Serve at `addr` (`tcp!host!port` or `unix!path`).
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let (proto, listen_addr) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => {
                let listener = TcpListener::bind(&listen_addr).await?;
                self.serve_on(listener).await
            }
            "unix" => self.serve_unix(&listen_addr).await,
            _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
        }
    }

    /// Accept loop over a pre-bound TCP listener.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        info!("mux listening on {:?}", listener.local_addr()?);
        self.shared.notify_initial().await;

        loop {
            let (stream, peer) = listener.accept().await?;
            let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            info!("client {} connected from {:?}", id, peer);

            let (conn, rx) = MuxConnection::new(id, self.shared.clone());
            let (readhalf, writehalf) = stream.into_split();
            tokio::spawn(conn.serve(readhalf, writehalf, rx));
        }
    }

    async fn serve_unix(&self, path: &str) -> Result<()> {
        // A stale socket file from a previous run refuses the bind
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!("mux listening on {}", path);
        self.shared.notify_initial().await;

        loop {
            let (stream, _) = listener.accept().await?;
            let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            info!("client {} connected (unix)", id);

            let (conn, rx) = MuxConnection::new(id, self.shared.clone());
            let (readhalf, writehalf) = tokio::io::split(stream);
            tokio::spawn(conn.serve(readhalf, writehalf, rx));
        }
    }
}
