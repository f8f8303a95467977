//! Tiaccoon engine library.
//!
//! A userspace agent that transparently redirects TCP socket operations of
//! processes inside a rootless container onto host-side endpoints, driven by
//! the kernel's seccomp user-notification facility. The container runtime
//! hands over one seccomp fd per container on a control socket; from then on
//! the engine inspects trapped networking syscalls, rewrites address
//! arguments in the container's memory, performs the real work on host
//! sockets, and injects the resulting fds back into the container.

pub mod agent;
pub mod destination;
pub mod manage;
pub mod policy;
pub mod procmem;
pub mod sockaddr;
pub mod supervisor;
pub mod vip;

mod pidfd;

pub use agent::{Agent, AgentConfig};
pub use destination::{DestinationTable, Entry, TransportAddr, TransportKind};
pub use policy::{AccessControl, PolicyTable};
pub use supervisor::Supervisor;
