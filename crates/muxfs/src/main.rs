use {
    clap::Parser,
    std::collections::BTreeMap,
    tokio::signal::unix::{SignalKind, signal},
};

use muxfs::server::MuxServer;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!0.0.0.0!5642")]
    address: String,

    /// Backend spec: NAME=HOST:PORT (repeatable)
    #[arg(long = "backend", value_name = "NAME=HOST:PORT", required = true)]
    backends: Vec<String>,
}

fn parse_backend(spec: &str) -> Result<(String, String), String> {
    let (name, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("Invalid backend spec '{}'. Expected NAME=HOST:PORT", spec))?;
    let name = name.trim();
    let addr = addr.trim();

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("Invalid address '{}'. Expected HOST:PORT", addr))?;
    if name.is_empty() || host.is_empty() {
        return Err(format!("Invalid backend spec '{}'", spec));
    }
    port.parse::<u16>()
        .map_err(|_| format!("Invalid port '{}'", port))?;

    Ok((name.to_owned(), addr.to_owned()))
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            eprintln!("Error: cannot install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

async fn mux_main(Cli { address, backends }: Cli) -> ninebus::Result<i32> {
    let mut parsed = BTreeMap::new();
    for spec in &backends {
        let (name, addr) = parse_backend(spec).map_err(ninebus::Error::Ename)?;
        parsed.insert(name, addr);
    }

    println!("[*] Backends:");
    for (name, addr) in &parsed {
        println!("      {} -> {}", name, addr);
    }
    println!("[*] Ready to accept clients: {}", address);

    let server = MuxServer::new(parsed);
    tokio::select! {
        res = server.serve(&address) => res.and(Ok(0)),
        _ = shutdown_signal() => {
            println!("Shutting down");
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = mux_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        1
    });

    std::process::exit(exit_code);
}
