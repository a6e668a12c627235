//! Workbench filesystem: a small synthetic 9P server that wires the
//! ninebus leaves together.
//!
//! Namespace:
//!
//! ```text
//! /
//! ├── ctl          new NAME | delete NAME; reads return status
//! └── NAME/        one directory per workbench session
//!     ├── input    write-on-clunk; committing stages the echo
//!     ├── output   blocking gate: cat blocks until input commits
//!     ├── log      append-only activity stream
//!     └── events   deliver-once event queue
//! ```

use {
    async_trait::async_trait,
    clap::Parser,
    ninebus::{
        fs::{
            Commit, CommitFile, CtlFile, CtlHandler, DirNode, GateFile, QueueFile, StreamFile,
        },
        res,
        srv::srv_async,
        utils::Result,
    },
    std::sync::{Arc, Mutex},
};

// Names an incoming session may not take
const RESERVED_NAMES: &[&str] = &["ctl"];

/// One workbench session: input commits echo into the output gate,
/// the log stream and the event queue.
struct SessionPipe {
    name: String,
    output: Arc<GateFile>,
    log: Arc<StreamFile>,
    events: Arc<QueueFile>,
}

#[async_trait]
impl Commit for SessionPipe {
    async fn commit(&self, payload: Vec<u8>, truncate: bool) -> Result<()> {
        let text = String::from_utf8_lossy(&payload).trim_end().to_owned();

        let verb = if truncate { "input" } else { "append" };
        self.log
            .append(format!("{} {} bytes\n", verb, payload.len()).as_bytes());

        self.output.publish(format!("echo: {}\n", text).into_bytes());
        self.events
            .post(format!("{} {} {}\n", self.name, verb, payload.len()).into_bytes());
        Ok(())
    }
}

struct Workbench {
    root: Arc<DirNode>,
    sessions: Mutex<Vec<String>>,
}

impl Workbench {
    fn new() -> Arc<Self> {
        Arc::new(Workbench {
            root: DirNode::new(""),
            sessions: Mutex::new(Vec::new()),
        })
    }

    fn create_session(&self, name: &str) -> Result<()> {
        if RESERVED_NAMES.contains(&name) {
            return res!(format!("Name '{}' is reserved", name));
        }

        let dir = DirNode::removable(name);
        let output = GateFile::new("output");
        let log = StreamFile::new("log");
        let events = QueueFile::new("events");

        let pipe = Arc::new(SessionPipe {
            name: name.to_owned(),
            output: output.clone(),
            log: log.clone(),
            events: events.clone(),
        });

        dir.add_file(CommitFile::new("input", pipe))?;
        dir.add_file(output)?;
        dir.add_file(log)?;
        dir.add_file(events)?;

        self.root.add_dir(dir)?;
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).push(name.to_owned());

        log::info!("session '{}' created", name);
        Ok(())
    }

    fn delete_session(&self, name: &str) -> Result<()> {
        if !self.root.remove(name) {
            return res!(format!("Session '{}' not found", name));
        }
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s != name);

        log::info!("session '{}' deleted", name);
        Ok(())
    }

    fn session_names(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct WorkbenchCtl {
    bench: Arc<Workbench>,
}

#[async_trait]
impl CtlHandler for WorkbenchCtl {
    async fn execute(&self, line: &str) -> Result<String> {
        let (cmd, arg) = match line.split_once(' ') {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (line, ""),
        };

        match cmd.to_lowercase().as_str() {
            "new" => {
                if arg.is_empty() {
                    return res!("Usage: new <name>");
                }
                self.bench.create_session(arg)?;
                Ok(format!("Session '{}' created", arg))
            }
            "delete" => {
                if arg.is_empty() {
                    return res!("Usage: delete <name>");
                }
                self.bench.delete_session(arg)?;
                Ok(format!("Session '{}' deleted", arg))
            }
            _ => res!(format!("Unknown command: {}. Available: new, delete", cmd)),
        }
    }

    async fn status(&self) -> String {
        let names = self.bench.session_names();
        let mut out = format!("sessions {}\n", names.len());
        for name in names {
            out.push_str(&format!("session {}\n", name));
        }
        out
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!0.0.0.0!5640")]
    address: String,

    /// Create a session at startup (repeatable)
    #[arg(long = "session", value_name = "NAME")]
    sessions: Vec<String>,
}

async fn synthfs_main(Cli { address, sessions }: Cli) -> Result<i32> {
    let bench = Workbench::new();
    bench
        .root
        .add_file(CtlFile::new("ctl", Arc::new(WorkbenchCtl { bench: bench.clone() })))?;

    for name in &sessions {
        bench.create_session(name)?;
    }

    println!("[*] Ready to accept clients: {}", address);
    println!();
    println!("Example usage:");
    println!("  echo 'new work' > /mnt/synth/ctl");
    println!("  echo 'hello' > /mnt/synth/work/input");
    println!("  cat /mnt/synth/work/output");

    srv_async(bench.root.clone(), &address).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = synthfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ninebus::fs::Node;

    fn bench_with_ctl() -> Arc<Workbench> {
        let bench = Workbench::new();
        bench
            .root
            .add_file(CtlFile::new(
                "ctl",
                Arc::new(WorkbenchCtl {
                    bench: bench.clone(),
                }),
            ))
            .unwrap();
        bench
    }

    #[tokio::test]
    async fn sessions_appear_and_disappear() {
        let bench = bench_with_ctl();

        bench.create_session("work").unwrap();
        assert!(bench.root.child("work").is_some());

        // Reserved and duplicate names are refused
        assert!(bench.create_session("ctl").is_err());
        assert!(bench.create_session("work").is_err());

        bench.delete_session("work").unwrap();
        assert!(bench.root.child("work").is_none());
        assert!(bench.delete_session("work").is_err());
    }

    #[tokio::test]
    async fn input_commit_feeds_output_log_and_events() {
        let bench = bench_with_ctl();
        bench.create_session("work").unwrap();

        let session = match bench.root.child("work") {
            Some(Node::Dir(dir)) => dir,
            _ => panic!("session dir missing"),
        };
        let input = match session.child("input") {
            Some(Node::File(f)) => f,
            _ => panic!("input missing"),
        };

        input.write(1, 0, b"hello").await.unwrap();
        input.clunk(1).await.unwrap();

        let output = match session.child("output") {
            Some(Node::File(f)) => f,
            _ => panic!("output missing"),
        };
        assert_eq!(output.read(2, 0, 1024).await.unwrap(), b"echo: hello\n");

        let log = match session.child("log") {
            Some(Node::File(f)) => f,
            _ => panic!("log missing"),
        };
        log.open(3, 0).await.unwrap();
        assert_eq!(log.read(3, 0, 1024).await.unwrap(), b"input 5 bytes\n");

        let events = match session.child("events") {
            Some(Node::File(f)) => f,
            _ => panic!("events missing"),
        };
        assert_eq!(events.read(4, 0, 1024).await.unwrap(), b"work input 5\n");
    }

    #[tokio::test]
    async fn ctl_grammar() {
        let bench = bench_with_ctl();
        let ctl = WorkbenchCtl {
            bench: bench.clone(),
        };

        assert_eq!(
            ctl.execute("new work").await.unwrap(),
            "Session 'work' created"
        );
        assert!(ctl.execute("new").await.is_err());
        assert!(ctl.execute("bogus").await.is_err());

        let status = ctl.status().await;
        assert!(status.starts_with("sessions 1\n"));
        assert!(status.contains("session work\n"));
    }
}
