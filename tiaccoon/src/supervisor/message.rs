//! Control-socket message decode.
//!
//! The container runtime sends one message per container: a JSON
//! `ContainerProcessState` in the data segment and a single `SCM_RIGHTS`
//! control message carrying the fds named by `fds[]`. The engine keeps the
//! one named `seccompFd` and closes everything else.

use std::io::IoSliceMut;
use std::os::unix::io::RawFd;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};

use tiaccoon_shared::{ContainerProcessState, TiaccoonError, TiaccoonResult, SECCOMP_FD_NAME};

use super::close_fd;

/// The state JSON must fit under this many bytes.
pub(crate) const MAX_STATE_SIZE: usize = 4096;

/// Upper bound of fds accepted in one control message.
const MAX_STATE_FDS: usize = 16;

/// Receive one runtime message from `sock` and return the seccomp fd plus
/// the decoded process state. On any violation every received fd is closed
/// and an error describing the problem is returned.
pub(crate) fn recv_seccomp_fd(sock: RawFd) -> TiaccoonResult<(RawFd, ContainerProcessState)> {
    let mut data = [0u8; MAX_STATE_SIZE];
    let mut fds: Vec<RawFd> = Vec::new();
    let mut scm_count = 0usize;
    let (bytes, flags) = {
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_STATE_FDS]);
        let msg = recvmsg::<UnixAddr>(sock, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
            .map_err(|e| TiaccoonError::Parse(format!("recvmsg on control socket: {}", e)))?;
        for cmsg in msg
            .cmsgs()
            .map_err(|e| TiaccoonError::Parse(format!("parsing control message: {}", e)))?
        {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                scm_count += 1;
                fds.extend(received);
            }
        }
        (msg.bytes, msg.flags)
    };

    let fail = |fds: &[RawFd], err: TiaccoonError| -> TiaccoonError {
        close_received_fds(fds);
        err
    };

    if bytes >= MAX_STATE_SIZE || flags.contains(MsgFlags::MSG_TRUNC) {
        return Err(fail(
            &fds,
            TiaccoonError::Parse(format!(
                "process state message too large (n={}, limit {})",
                bytes, MAX_STATE_SIZE
            )),
        ));
    }
    if flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(fail(
            &fds,
            TiaccoonError::Parse("control message truncated: too many fds".into()),
        ));
    }
    if scm_count != 1 {
        return Err(fail(
            &fds,
            TiaccoonError::Parse(format!(
                "expected exactly 1 SCM_RIGHTS message, got {}",
                scm_count
            )),
        ));
    }

    let state: ContainerProcessState = match serde_json::from_slice(&data[..bytes]) {
        Ok(state) => state,
        Err(e) => {
            return Err(fail(
                &fds,
                TiaccoonError::Parse(format!("cannot parse OCI process state: {}", e)),
            ));
        }
    };

    if state.fds.len() != fds.len() {
        return Err(fail(
            &fds,
            TiaccoonError::Parse(format!(
                "fds[] names {} descriptors but {} were transferred",
                state.fds.len(),
                fds.len()
            )),
        ));
    }

    match select_seccomp_fd(&state.fds, &fds) {
        Ok(fd) => Ok((fd, state)),
        Err(e) => Err(fail(&fds, e)),
    }
}

/// Pick the fd named `seccompFd` (exactly once) out of the received set and
/// close the rest. On error nothing is closed; the caller owns cleanup.
fn select_seccomp_fd(names: &[String], fds: &[RawFd]) -> TiaccoonResult<RawFd> {
    let mut index = None;
    for (i, name) in names.iter().enumerate() {
        if name != SECCOMP_FD_NAME {
            continue;
        }
        if index.is_some() {
            return Err(TiaccoonError::Parse(format!(
                "{} appears more than once in fds[]",
                SECCOMP_FD_NAME
            )));
        }
        index = Some(i);
    }
    let index = index.ok_or_else(|| {
        TiaccoonError::Parse(format!("{} not present in fds[]", SECCOMP_FD_NAME))
    })?;
    if index >= fds.len() {
        return Err(TiaccoonError::Parse(format!(
            "{} index {} out of range ({} fds received)",
            SECCOMP_FD_NAME,
            index,
            fds.len()
        )));
    }

    for (i, fd) in fds.iter().enumerate() {
        if i != index {
            close_fd(*fd);
        }
    }
    Ok(fds[index])
}

fn close_received_fds(fds: &[RawFd]) {
    for fd in fds {
        close_fd(*fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{
        sendmsg, socketpair, AddressFamily, ControlMessage, SockFlag, SockType,
    };
    use std::io::IoSlice;
    use std::os::fd::AsRawFd;

    fn send_message(sock: RawFd, json: &[u8], fds: &[RawFd]) {
        let iov = [IoSlice::new(json)];
        let cmsgs = [ControlMessage::ScmRights(fds)];
        sendmsg::<UnixAddr>(sock, &iov, &cmsgs, MsgFlags::empty(), None).unwrap();
    }

    fn devnull_fds(n: usize) -> Vec<RawFd> {
        (0..n)
            .map(|_| {
                let file = std::fs::File::open("/dev/null").unwrap();
                let fd = file.as_raw_fd();
                std::mem::forget(file);
                fd
            })
            .collect()
    }

    fn fd_is_open(fd: RawFd) -> bool {
        (unsafe { libc::fcntl(fd, libc::F_GETFD) }) >= 0
    }

    #[test]
    fn test_recv_selects_seccomp_fd_and_closes_rest() {
        let (tx, rx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let fds = devnull_fds(3);
        let json = br#"{"fds": ["other", "seccompFd", "log"], "pid": 1}"#;
        send_message(tx.as_raw_fd(), json, &fds);

        let (seccomp_fd, state) = recv_seccomp_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(state.fds[1], "seccompFd");
        assert!(fd_is_open(seccomp_fd));
        close_fd(seccomp_fd);
    }

    #[test]
    fn test_recv_rejects_duplicate_seccomp_fd() {
        let (tx, rx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let fds = devnull_fds(2);
        let json = br#"{"fds": ["seccompFd", "seccompFd"]}"#;
        send_message(tx.as_raw_fd(), json, &fds);
        assert!(recv_seccomp_fd(rx.as_raw_fd()).is_err());
    }

    #[test]
    fn test_recv_rejects_missing_seccomp_fd() {
        let (tx, rx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let fds = devnull_fds(1);
        let json = br#"{"fds": ["log"]}"#;
        send_message(tx.as_raw_fd(), json, &fds);
        assert!(recv_seccomp_fd(rx.as_raw_fd()).is_err());
    }

    #[test]
    fn test_recv_rejects_fd_count_mismatch() {
        let (tx, rx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let fds = devnull_fds(1);
        let json = br#"{"fds": ["seccompFd", "log"]}"#;
        send_message(tx.as_raw_fd(), json, &fds);
        assert!(recv_seccomp_fd(rx.as_raw_fd()).is_err());
    }

    #[test]
    fn test_recv_rejects_malformed_json() {
        let (tx, rx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let fds = devnull_fds(1);
        send_message(tx.as_raw_fd(), b"not json", &fds);
        assert!(recv_seccomp_fd(rx.as_raw_fd()).is_err());
    }

    #[test]
    fn test_select_seccomp_fd_closes_only_others() {
        let fds = devnull_fds(3);
        let picked = select_seccomp_fd(
            &[
                "a".to_string(),
                SECCOMP_FD_NAME.to_string(),
                "b".to_string(),
            ],
            &fds,
        )
        .unwrap();
        assert_eq!(picked, fds[1]);
        assert!(fd_is_open(fds[1]));
        assert!(!fd_is_open(fds[0]));
        assert!(!fd_is_open(fds[2]));
        close_fd(picked);
    }
}
