//! Raw seccomp user-notification plumbing.
//!
//! Byte-compatible images of the kernel's `seccomp_notif`,
//! `seccomp_notif_resp` and `seccomp_notif_addfd` structs plus the four
//! ioctls that drive the notify fd. The RECV buffer must be zeroed before
//! each call; the kernel rejects it otherwise.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use tiaccoon_shared::{TiaccoonError, TiaccoonResult};

/// Response flag: let the kernel execute the original syscall.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

/// ADDFD flag: install the fd at the exact number in `newfd`.
pub const SECCOMP_ADDFD_FLAG_SETFD: u32 = 1;

const SECCOMP_IOC_MAGIC: u8 = b'!';

/// `struct seccomp_data`: the trapped syscall and its raw arguments.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// `struct seccomp_notif`: one received notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// `struct seccomp_notif_resp`: the supervisor's verdict.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

impl SeccompNotifResp {
    /// The default verdict: pass the syscall through untouched.
    pub fn pass_through(id: u64) -> Self {
        SeccompNotifResp {
            id,
            val: 0,
            error: 0,
            flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
        }
    }

    /// Take the syscall over with a success value.
    pub fn succeed(&mut self, val: i64) {
        self.flags &= !SECCOMP_USER_NOTIF_FLAG_CONTINUE;
        self.error = 0;
        self.val = val;
    }

    /// Take the syscall over and fail it with `-errno`.
    pub fn fail(&mut self, errno: Errno) {
        self.flags &= !SECCOMP_USER_NOTIF_FLAG_CONTINUE;
        self.error = -(errno as i32);
        self.val = 0;
    }

    pub fn is_continue(&self) -> bool {
        self.flags & SECCOMP_USER_NOTIF_FLAG_CONTINUE != 0
    }
}

/// `struct seccomp_notif_addfd`: fd injection request.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotifAddfd {
    pub id: u64,
    pub flags: u32,
    pub srcfd: u32,
    pub newfd: u32,
    pub newfd_flags: u32,
}

mod ioctls {
    use super::{SeccompNotif, SeccompNotifAddfd, SeccompNotifResp, SECCOMP_IOC_MAGIC};

    nix::ioctl_readwrite!(notif_recv, SECCOMP_IOC_MAGIC, 0, SeccompNotif);
    nix::ioctl_readwrite!(notif_send, SECCOMP_IOC_MAGIC, 1, SeccompNotifResp);
    nix::ioctl_write_ptr!(notif_id_valid, SECCOMP_IOC_MAGIC, 2, u64);
    nix::ioctl_write_ptr!(notif_addfd, SECCOMP_IOC_MAGIC, 3, SeccompNotifAddfd);
}

/// Block until the next notification arrives on `fd`.
pub fn recv(fd: RawFd) -> nix::Result<SeccompNotif> {
    let mut req = SeccompNotif::default();
    unsafe { ioctls::notif_recv(fd, &mut req) }?;
    Ok(req)
}

/// Deliver a verdict for a previously received notification.
pub fn respond(fd: RawFd, resp: &SeccompNotifResp) -> nix::Result<()> {
    let mut resp = *resp;
    unsafe { ioctls::notif_send(fd, &mut resp) }?;
    Ok(())
}

/// TOCTOU check: whether the notification id still names a blocked syscall.
pub fn id_valid(fd: RawFd, id: u64) -> bool {
    unsafe { ioctls::notif_id_valid(fd, &id) }.is_ok()
}

/// Inject `srcfd` into the traced process, returning the fd number it
/// received (or `newfd` itself under `SECCOMP_ADDFD_FLAG_SETFD`).
pub fn addfd(fd: RawFd, req: &SeccompNotifAddfd) -> TiaccoonResult<RawFd> {
    let newfd = unsafe { ioctls::notif_addfd(fd, req) }
        .map_err(|e| TiaccoonError::Syscall(format!("ioctl(SECCOMP_IOCTL_NOTIF_ADDFD): {}", e)))?;
    Ok(newfd)
}

/// Errors on RECV that mean "this notification went away, keep looping".
pub fn recv_retryable(errno: Errno) -> bool {
    matches!(errno, Errno::ENOENT | Errno::EINTR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_struct_sizes_match_kernel_abi() {
        assert_eq!(mem::size_of::<SeccompData>(), 64);
        assert_eq!(mem::size_of::<SeccompNotif>(), 80);
        assert_eq!(mem::size_of::<SeccompNotifResp>(), 24);
        assert_eq!(mem::size_of::<SeccompNotifAddfd>(), 24);
    }

    #[test]
    fn test_pass_through_default() {
        let resp = SeccompNotifResp::pass_through(7);
        assert_eq!(resp.id, 7);
        assert!(resp.is_continue());
        assert_eq!(resp.error, 0);
        assert_eq!(resp.val, 0);
    }

    #[test]
    fn test_succeed_clears_continue() {
        let mut resp = SeccompNotifResp::pass_through(1);
        resp.succeed(5);
        assert!(!resp.is_continue());
        assert_eq!(resp.val, 5);
        assert_eq!(resp.error, 0);
    }

    #[test]
    fn test_fail_sets_negative_errno() {
        let mut resp = SeccompNotifResp::pass_through(1);
        resp.fail(Errno::EACCES);
        assert!(!resp.is_continue());
        assert_eq!(resp.error, -(Errno::EACCES as i32));
    }

    #[test]
    fn test_recv_retryable() {
        assert!(recv_retryable(Errno::ENOENT));
        assert!(recv_retryable(Errno::EINTR));
        assert!(!recv_retryable(Errno::EBADF));
    }
}
