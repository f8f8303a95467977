//! Types shared between the tiaccoon engine library and its binaries.

pub mod errors;
pub mod state;

pub use errors::{TiaccoonError, TiaccoonResult, TRY_RDMA_SENTINEL};
pub use state::{ContainerProcessState, ContainerState, SECCOMP_FD_NAME};
