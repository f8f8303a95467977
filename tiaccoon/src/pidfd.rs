//! Pid / pidfd cache.
//!
//! Seccomp notifications carry the raw pid of the calling task, which may be
//! a thread id. `pidfd_open` only works on thread-group leaders, so a raw
//! pid that fails to open is resolved to its tgid through
//! `/proc/<pid>/status` and retried. The pidfd is kept open so the engine
//! can later duplicate container fds into its own table with `pidfd_getfd`.

use std::collections::HashMap;
use std::fs;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PidKind {
    /// The raw pid is a thread-group leader; tgid == pid.
    Process,
    /// The raw pid is a thread; tgid was parsed from its status file.
    Thread,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PidInfo {
    pub kind: PidKind,
    pub pidfd: RawFd,
    pub tgid: i32,
}

/// Cache keyed by the raw pid observed in notifications.
#[derive(Debug, Default)]
pub(crate) struct PidfdCache {
    infos: HashMap<i32, PidInfo>,
}

fn pidfd_open(pid: i32) -> nix::Result<RawFd> {
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0u32) };
    Errno::result(rc).map(|fd| fd as RawFd)
}

fn pidfd_getfd(pidfd: RawFd, target_fd: i32) -> nix::Result<RawFd> {
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd, target_fd, 0u32) };
    Errno::result(rc).map(|fd| fd as RawFd)
}

/// Extract the tgid from the contents of `/proc/<pid>/status`.
fn parse_tgid(status: &str) -> TiaccoonResult<i32> {
    for line in status.lines() {
        if !line.starts_with("Tgid") {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 2 {
            return Err(TiaccoonError::Parse(format!(
                "unexpected Tgid line in status: {:?}",
                line
            )));
        }
        return fields[1].trim().parse::<i32>().map_err(|e| {
            TiaccoonError::Parse(format!("unexpected Tgid value {:?}: {}", fields[1], e))
        });
    }
    Err(TiaccoonError::Parse("no Tgid line in status".into()))
}

impl PidfdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached info for a raw pid, if any.
    pub fn cached(&self, pid: i32) -> Option<PidInfo> {
        self.infos.get(&pid).copied()
    }

    /// Resolve a raw pid to `(kind, pidfd, tgid)`, opening and caching the
    /// pidfd on first sight.
    pub fn get(&mut self, pid: i32) -> TiaccoonResult<PidInfo> {
        if let Some(info) = self.infos.get(&pid) {
            return Ok(*info);
        }

        match pidfd_open(pid) {
            Ok(pidfd) => {
                let info = PidInfo {
                    kind: PidKind::Process,
                    pidfd,
                    tgid: pid,
                };
                self.infos.insert(pid, info);
                Ok(info)
            }
            Err(errno) => {
                // The pid may be a thread; pidfd_open wants its leader.
                tracing::warn!(
                    pid,
                    error = %errno,
                    "pidfd_open failed, retrying with the tgid"
                );
                let status = fs::read_to_string(format!("/proc/{}/status", pid)).map_err(|e| {
                    TiaccoonError::Registration(format!("reading /proc/{}/status: {}", pid, e))
                })?;
                let tgid = parse_tgid(&status)?;
                let pidfd = pidfd_open(tgid).map_err(|e| {
                    TiaccoonError::Registration(format!(
                        "pidfd_open failed for tgid {}: {}",
                        tgid, e
                    ))
                })?;
                tracing::info!(pid, tgid, "resolved thread pid to its leader");
                let info = PidInfo {
                    kind: PidKind::Thread,
                    pidfd,
                    tgid,
                };
                self.infos.insert(pid, info);
                Ok(info)
            }
        }
    }

    /// Duplicate a container fd into the engine's fd table. The caller owns
    /// the returned fd.
    pub fn get_fd_in_process(&mut self, pid: i32, target_fd: i32) -> TiaccoonResult<RawFd> {
        let info = self.get(pid)?;
        pidfd_getfd(info.pidfd, target_fd).map_err(|e| {
            TiaccoonError::Registration(format!(
                "pidfd_getfd failed for pid {} fd {}: {}",
                pid, target_fd, e
            ))
        })
    }

    /// Close and forget the pidfd cached for a raw pid.
    pub fn close(&mut self, pid: i32) {
        if let Some(info) = self.infos.remove(&pid) {
            if unsafe { libc::close(info.pidfd) } < 0 {
                tracing::error!(pid, pidfd = info.pidfd, "failed to close pidfd");
            }
        }
    }

    /// Close every cached pidfd.
    pub fn clear(&mut self) {
        for (_, info) in self.infos.drain() {
            let _ = unsafe { libc::close(info.pidfd) };
        }
    }
}
