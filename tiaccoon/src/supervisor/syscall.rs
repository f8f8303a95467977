//! Mapping from raw syscall numbers to the syscalls the filter traps.
//!
//! The notification carries the architecture's syscall number; the filter
//! installed by the runtime only traps the calls listed here, but an
//! unexpected number must still map cleanly to "unknown" and pass through.

/// A syscall the engine knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Bind,
    Listen,
    Accept,
    Accept4,
    Connect,
    Setsockopt,
    Fcntl,
    Getpeername,
    Getsockname,
    Close,
    Exit,
    ExitGroup,
}

impl Syscall {
    /// Resolve a trapped syscall number for the native architecture.
    pub fn from_nr(nr: i32) -> Option<Syscall> {
        match i64::from(nr) {
            libc::SYS_bind => Some(Syscall::Bind),
            libc::SYS_listen => Some(Syscall::Listen),
            libc::SYS_accept => Some(Syscall::Accept),
            libc::SYS_accept4 => Some(Syscall::Accept4),
            libc::SYS_connect => Some(Syscall::Connect),
            libc::SYS_setsockopt => Some(Syscall::Setsockopt),
            libc::SYS_fcntl => Some(Syscall::Fcntl),
            libc::SYS_getpeername => Some(Syscall::Getpeername),
            libc::SYS_getsockname => Some(Syscall::Getsockname),
            libc::SYS_close => Some(Syscall::Close),
            libc::SYS_exit => Some(Syscall::Exit),
            libc::SYS_exit_group => Some(Syscall::ExitGroup),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Syscall::Bind => "bind",
            Syscall::Listen => "listen",
            Syscall::Accept => "accept",
            Syscall::Accept4 => "accept4",
            Syscall::Connect => "connect",
            Syscall::Setsockopt => "setsockopt",
            Syscall::Fcntl => "fcntl",
            Syscall::Getpeername => "getpeername",
            Syscall::Getsockname => "getsockname",
            Syscall::Close => "close",
            Syscall::Exit => "_exit",
            Syscall::ExitGroup => "exit_group",
        }
    }

    /// `_exit`/`exit_group` tear the process down; no socket logic runs for
    /// them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Syscall::Exit | Syscall::ExitGroup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_numbers_resolve() {
        assert_eq!(Syscall::from_nr(libc::SYS_bind as i32), Some(Syscall::Bind));
        assert_eq!(
            Syscall::from_nr(libc::SYS_connect as i32),
            Some(Syscall::Connect)
        );
        assert_eq!(
            Syscall::from_nr(libc::SYS_exit_group as i32),
            Some(Syscall::ExitGroup)
        );
    }

    #[test]
    fn test_unknown_number_is_none() {
        assert_eq!(Syscall::from_nr(-1), None);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Syscall::Exit.is_terminal());
        assert!(Syscall::ExitGroup.is_terminal());
        assert!(!Syscall::Close.is_terminal());
    }

    #[test]
    fn test_names() {
        assert_eq!(Syscall::Exit.name(), "_exit");
        assert_eq!(Syscall::Accept4.name(), "accept4");
    }
}
