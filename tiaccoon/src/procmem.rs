//! Remote process memory I/O.
//!
//! Syscall address arguments live in the container process's memory, reached
//! through `/proc/<pid>/mem`. Handles are cached per pid and dropped when
//! the owning process exits. When the direct open is denied (the target runs
//! in a user namespace the agent has no mapping into), a helper copy of the
//! agent re-enters the target's namespaces via `nsenter`, opens the file
//! there, and hands the fd back over an inherited UNIX socket.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, socketpair, sockopt, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::sys::uio::{pread, pwrite};

use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

/// Fd number the nsenter helper inherits its answer socket on.
const HELPER_FD: RawFd = 3;

const HELPER_TIMEOUT_MS: i64 = 500;

/// Per-pid cache of `/proc/<pid>/mem` handles.
#[derive(Debug, Default)]
pub struct ProcMem {
    memfds: HashMap<i32, File>,
}

impl ProcMem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `len` bytes of the target's memory at `offset`. Short reads
    /// truncate the result, mirroring `pread`.
    pub fn read(&mut self, pid: i32, offset: u64, len: u64) -> TiaccoonResult<Vec<u8>> {
        let file = self.open(pid)?;
        let mut buf = vec![0u8; len as usize];
        let n = pread(file, &mut buf, offset as libc::off_t).map_err(|e| {
            TiaccoonError::Memory(format!("pread pid {} offset 0x{:x}: {}", pid, offset, e))
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` into the target's memory at `offset`. Anything less than
    /// a full write is an error.
    pub fn write(&mut self, pid: i32, offset: u64, data: &[u8]) -> TiaccoonResult<()> {
        let file = self.open(pid)?;
        let n = pwrite(file, data, offset as libc::off_t).map_err(|e| {
            TiaccoonError::Memory(format!("pwrite pid {} offset 0x{:x}: {}", pid, offset, e))
        })?;
        if n != data.len() {
            return Err(TiaccoonError::Memory(format!(
                "partial write to pid {}: expected {} bytes, wrote {}",
                pid,
                data.len(),
                n
            )));
        }
        Ok(())
    }

    /// Drop the cached handle for a pid. Called when its process exits.
    pub fn forget(&mut self, pid: i32) {
        self.memfds.remove(&pid);
    }

    fn open(&mut self, pid: i32) -> TiaccoonResult<&File> {
        match self.memfds.entry(pid) {
            MapEntry::Occupied(entry) => Ok(entry.into_mut()),
            MapEntry::Vacant(entry) => {
                let path = format!("/proc/{}/mem", pid);
                let file = match File::options().read(true).write(true).open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        tracing::warn!(
                            pid,
                            "permission denied opening {}, retrying through nsenter helper",
                            path
                        );
                        let file = open_mem_via_nsenter(pid)?;
                        tracing::info!(pid, "opened target memory through nsenter helper");
                        file
                    }
                    Err(e) => {
                        return Err(TiaccoonError::Memory(format!("open {}: {}", path, e)));
                    }
                };
                Ok(entry.insert(file))
            }
        }
    }
}

/// Whether two processes share a user namespace.
fn same_user_ns(pid_a: i32, pid_b: i32) -> TiaccoonResult<bool> {
    let ns_a = fs::read_link(format!("/proc/{}/ns/user", pid_a))
        .map_err(|e| TiaccoonError::Memory(format!("readlink /proc/{}/ns/user: {}", pid_a, e)))?;
    let ns_b = fs::read_link(format!("/proc/{}/ns/user", pid_b))
        .map_err(|e| TiaccoonError::Memory(format!("readlink /proc/{}/ns/user: {}", pid_b, e)))?;
    Ok(ns_a == ns_b)
}

/// Spawn `nsenter -t <pid> -F [-U --preserve-credentials] -- <self>
/// --mem-nsenter-pid=<pid>` and collect the memfd it sends back.
fn open_mem_via_nsenter(pid: i32) -> TiaccoonResult<File> {
    let (parent_end, child_end) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    )
    .map_err(|e| TiaccoonError::Memory(format!("socketpair for nsenter helper: {}", e)))?;

    let timeout = TimeVal::milliseconds(HELPER_TIMEOUT_MS);
    setsockopt(&parent_end, sockopt::ReceiveTimeout, &timeout)
        .map_err(|e| TiaccoonError::Memory(format!("setting helper receive timeout: {}", e)))?;
    setsockopt(&child_end, sockopt::SendTimeout, &timeout)
        .map_err(|e| TiaccoonError::Memory(format!("setting helper send timeout: {}", e)))?;

    let self_exe = std::env::current_exe()
        .map_err(|e| TiaccoonError::Memory(format!("resolving own executable: {}", e)))?;
    let self_pid = std::process::id() as i32;

    let mut cmd = Command::new("nsenter");
    cmd.arg("-t").arg(pid.to_string()).arg("-F");
    if !same_user_ns(pid, self_pid)? {
        cmd.arg("-U").arg("--preserve-credentials");
    }
    cmd.arg("--")
        .arg(self_exe)
        .arg(format!("--mem-nsenter-pid={}", pid));
    cmd.stdin(Stdio::null()).stdout(Stdio::null());

    let inherited = child_end.as_raw_fd();
    // The helper expects its answer socket at a fixed fd number.
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(inherited, HELPER_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| TiaccoonError::Memory(format!("spawning nsenter helper: {}", e)))?;
    drop(child_end);

    let result = recv_memfd(parent_end.as_raw_fd());
    let status = child.wait();

    let memfd = result?;
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(pid, %status, "nsenter helper exited abnormally"),
        Err(e) => tracing::warn!(pid, error = %e, "waiting for nsenter helper failed"),
    }

    Ok(unsafe { File::from_raw_fd(memfd) })
}

/// Receive the single fd the helper sends over the socketpair.
fn recv_memfd(sock: RawFd) -> TiaccoonResult<RawFd> {
    let mut data = [0u8; 64];
    let mut iov = [IoSliceMut::new(&mut data)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<UnixAddr>(sock, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(|e| TiaccoonError::Memory(format!("receiving memfd from helper: {}", e)))?;
    let cmsgs = msg
        .cmsgs()
        .map_err(|e| TiaccoonError::Memory(format!("parsing helper control message: {}", e)))?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                return Ok(*fd);
            }
        }
    }
    Err(TiaccoonError::Memory(
        "helper reply carried no file descriptor".into(),
    ))
}

/// Helper-process entry point, reached through the hidden
/// `--mem-nsenter-pid` flag after `nsenter` placed us in the target's user
/// namespace: open the target's memory and pass the fd back on the
/// inherited socket.
pub fn serve_nsenter_memfd(pid: i32) -> TiaccoonResult<()> {
    let path = format!("/proc/{}/mem", pid);
    let file = File::options()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| TiaccoonError::Memory(format!("open {}: {}", path, e)))?;

    let fds = [file.as_raw_fd()];
    let iov = [IoSlice::new(b"ok")];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(HELPER_FD, &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|e| TiaccoonError::Memory(format!("sending memfd to parent: {}", e)))?;
    Ok(())
}
