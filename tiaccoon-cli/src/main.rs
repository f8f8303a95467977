mod cli;

use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use tiaccoon::{Agent, AgentConfig};

fn main() {
    // Nothing the agent creates may be group/world accessible: it deals in
    // control sockets and memory handles.
    unsafe { libc::umask(0o077) };

    let cli = Cli::parse();

    if let Some(pid) = cli.mem_nsenter_pid {
        // Helper mode: we are the nsenter child inside the target's user
        // namespace. No logging setup; the parent only reads the socket.
        if let Err(e) = tiaccoon::procmem::serve_nsenter_memfd(pid) {
            eprintln!("tiaccoon mem helper failed: {}", e);
            process::exit(1);
        }
        return;
    }

    init_logging(&cli);

    let Some(socket_path) = cli.resolve_socket_path() else {
        eprintln!("--socket or $XDG_RUNTIME_DIR must be set");
        process::exit(1);
    };
    let Some(default_policy) = cli.default_policy else {
        eprintln!("--default-policy must be either 'allow' or 'deny'");
        process::exit(1);
    };
    let Some(ip) = cli.ip else {
        eprintln!("--ip must be set to the agent's virtual IP");
        process::exit(1);
    };

    let config = AgentConfig {
        socket_path,
        default_policy: default_policy.allows(),
        my_vip: IpAddr::V4(ip),
        feature_rdma: cli.feature_rdma,
    };
    if let Err(error) = run(config) {
        eprintln!("Error: {}", error);
        process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.log_level.as_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_file(cli.log_source)
                .with_line_number(cli.log_source),
        )
        .init();
}

/// Remove a stale socket file; anything but "not found" is a failure.
fn cleanup_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn run(config: AgentConfig) -> anyhow::Result<()> {
    cleanup_socket(&config.socket_path).with_context(|| {
        format!(
            "cannot clean up control socket file {}",
            config.socket_path.display()
        )
    })?;

    let agent = Agent::new(config.clone());

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("cannot install SIGTERM handler")?;

    let result = tokio::select! {
        result = agent.run() => result.context("agent failed"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            agent.shutdown();
            Ok(())
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            agent.shutdown();
            Ok(())
        }
    };

    if let Err(e) = cleanup_socket(&config.socket_path) {
        tracing::error!(
            path = %config.socket_path.display(),
            error = %e,
            "cannot clean up control socket file"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cleanup_socket_tolerates_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(cleanup_socket(&tmp.path().join("absent.sock")).is_ok());
    }

    #[test]
    fn test_cleanup_socket_removes_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stale.sock");
        std::fs::write(&path, b"stale").unwrap();
        cleanup_socket(&path).unwrap();
        assert!(!path.exists());
    }
}
