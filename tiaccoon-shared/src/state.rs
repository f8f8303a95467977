//! OCI container process state as received on the control socket.
//!
//! The container runtime sends one JSON message per container alongside an
//! `SCM_RIGHTS` control message. The JSON is the runtime spec's
//! `ContainerProcessState`; the agent only consumes `fds`, the ordered list
//! of names describing the transferred descriptors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name identifying the seccomp notification fd in [`ContainerProcessState::fds`].
pub const SECCOMP_FD_NAME: &str = "seccompFd";

/// State of the container process at the time the seccomp fd was sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProcessState {
    #[serde(default, rename = "ociVersion")]
    pub version: String,

    /// Names describing each fd in the accompanying `SCM_RIGHTS` message,
    /// in order.
    #[serde(default)]
    pub fds: Vec<String>,

    #[serde(default)]
    pub pid: i32,

    #[serde(default)]
    pub metadata: String,

    #[serde(default)]
    pub state: ContainerState,
}

/// The OCI runtime state block embedded in [`ContainerProcessState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(default)]
    pub oci_version: String,

    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub pid: i32,

    #[serde(default)]
    pub bundle: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_runtime_message() {
        let raw = r#"{
            "ociVersion": "1.0.2",
            "fds": ["seccompFd"],
            "pid": 4242,
            "metadata": "",
            "state": {
                "ociVersion": "1.0.2",
                "id": "web",
                "status": "creating",
                "pid": 4242,
                "bundle": "/run/bundle/web"
            }
        }"#;
        let state: ContainerProcessState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.fds, vec![SECCOMP_FD_NAME.to_string()]);
        assert_eq!(state.pid, 4242);
        assert_eq!(state.state.id, "web");
    }

    #[test]
    fn test_parse_tolerates_missing_fields() {
        let state: ContainerProcessState = serde_json::from_str("{}").unwrap();
        assert!(state.fds.is_empty());
        assert_eq!(state.pid, 0);
    }
}
