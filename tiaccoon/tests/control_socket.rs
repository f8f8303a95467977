//! End-to-end control-socket behaviour against a running agent.

use std::io::IoSlice;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tempfile::TempDir;

use tiaccoon::{Agent, AgentConfig};

fn test_agent(path: PathBuf) -> Arc<Agent> {
    Arc::new(Agent::new(AgentConfig {
        socket_path: path,
        default_policy: false,
        my_vip: IpAddr::V4(Ipv4Addr::new(10, 0, 10, 40)),
        feature_rdma: false,
    }))
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control socket {} never appeared", path.display());
}

fn send_runtime_message(path: &Path, json: &[u8], fds: &[RawFd]) {
    let stream = UnixStream::connect(path).unwrap();
    let iov = [IoSlice::new(json)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None).unwrap();
}

#[tokio::test]
async fn test_agent_survives_bogus_seccomp_fd() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tiaccoon.sock");

    let agent = test_agent(path.clone());
    let server = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    wait_for_socket(&path).await;

    // A well-formed handshake whose "seccomp fd" is /dev/null: the worker
    // must fail its first receive and die without taking the agent down.
    let bogus = path.clone();
    tokio::task::spawn_blocking(move || {
        let devnull = std::fs::File::open("/dev/null").unwrap();
        send_runtime_message(
            &bogus,
            br#"{"fds": ["seccompFd"], "pid": 1, "state": {"id": "bogus"}}"#,
            &[devnull.as_raw_fd()],
        );
    })
    .await
    .unwrap();

    // A malformed handshake: fd count does not match fds[].
    let malformed = path.clone();
    tokio::task::spawn_blocking(move || {
        let devnull = std::fs::File::open("/dev/null").unwrap();
        send_runtime_message(
            &malformed,
            br#"{"fds": ["seccompFd", "log"]}"#,
            &[devnull.as_raw_fd()],
        );
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    // the agent still accepts connections
    let again = path.clone();
    tokio::task::spawn_blocking(move || {
        UnixStream::connect(&again).unwrap();
    })
    .await
    .unwrap();

    agent.shutdown();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_agent_unlinks_stale_socket_on_start() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tiaccoon.sock");
    std::fs::write(&path, b"stale").unwrap();

    let agent = test_agent(path.clone());
    let server = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    // the stale file exists from the start, so poll until a connect lands
    // on the replacing socket
    let probe = path.clone();
    tokio::task::spawn_blocking(move || {
        for attempt in 0..200 {
            if UnixStream::connect(&probe).is_ok() {
                return;
            }
            assert!(attempt < 199, "socket at {} never became connectable", probe.display());
            std::thread::sleep(Duration::from_millis(10));
        }
    })
    .await
    .unwrap();

    agent.shutdown();
    server.await.unwrap().unwrap();
}
