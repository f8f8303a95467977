//! CLI definition and argument parsing for the tiaccoon binary.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

pub const SOCKET_FILE_NAME: &str = "tiaccoon.sock";

#[derive(Parser, Debug)]
#[command(
    name = "tiaccoon",
    author,
    version,
    about = "Userspace socket bypass agent for rootless containers"
)]
pub struct Cli {
    /// Socket path for seccomp notify (defaults to
    /// $XDG_RUNTIME_DIR/tiaccoon.sock)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Default access-control policy
    #[arg(long, value_enum)]
    pub default_policy: Option<DefaultPolicy>,

    /// The agent's own virtual IP
    #[arg(long = "ip")]
    pub ip: Option<Ipv4Addr>,

    /// Enable the RDMA signalling paths
    #[arg(long)]
    pub feature_rdma: bool,

    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Include source locations in log output
    #[arg(long)]
    pub log_source: bool,

    /// Internal: open /proc/<pid>/mem after nsenter and pass it back on the
    /// inherited socket
    #[arg(long, hide = true)]
    pub mem_nsenter_pid: Option<i32>,
}

impl Cli {
    /// Resolve the control socket path: the flag, else
    /// `$XDG_RUNTIME_DIR/tiaccoon.sock`.
    pub fn resolve_socket_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.socket {
            return Some(path.clone());
        }
        std::env::var_os("XDG_RUNTIME_DIR").map(|dir| PathBuf::from(dir).join(SOCKET_FILE_NAME))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

impl DefaultPolicy {
    pub fn allows(self) -> bool {
        matches!(self, DefaultPolicy::Allow)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
