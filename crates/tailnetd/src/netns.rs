//! Namespace executor: run a closure inside a target network namespace.
//!
//! `setns(2)` changes the namespace of the calling thread only, so the
//! closure runs on a dedicated short-lived thread rather than a runtime
//! worker or the blocking pool. The thread enters the target namespace,
//! runs the closure with a handle to the original namespace (so links can
//! be moved back), and restores the original namespace through a drop
//! guard on every exit path, panics included. If restoration ever failed
//! the thread is discarded anyway — no pooled thread can be left in the
//! wrong namespace.

use std::fs::File;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use tracing::error;

use crate::netlink::NetlinkError;

#[derive(Debug, thiserror::Error)]
pub enum NetnsError {
    #[error("opening namespace {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("entering namespace: {0}")]
    Enter(nix::Error),

    #[error("namespace executor thread panicked")]
    Panicked,

    #[error("spawning namespace executor thread: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Netlink(#[from] NetlinkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetnsError>;

/// Restores the original namespace when dropped.
struct NetnsGuard<'a> {
    original: &'a File,
}

impl<'a> NetnsGuard<'a> {
    fn enter(target: &File, original: &'a File) -> Result<Self> {
        setns(target, CloneFlags::CLONE_NEWNET).map_err(NetnsError::Enter)?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original, CloneFlags::CLONE_NEWNET) {
            // The thread dies right after this; nothing else runs on it.
            error!(error = %e, "failed to restore original network namespace");
        }
    }
}

/// True when the namespace path still exists.
pub fn exists(netns_path: &str) -> bool {
    !netns_path.is_empty() && Path::new(netns_path).exists()
}

/// Run `f` inside the network namespace at `path`.
///
/// The closure receives the original namespace's file handle; its raw fd is
/// valid for `setns_by_fd`-style link moves. Blocking is expected — the
/// closure owns its thread and may run a local runtime for async work.
pub async fn run_in_namespace<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce(&File) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let path = path.to_path_buf();
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::Builder::new()
        .name("netns-exec".into())
        .spawn(move || {
            let result = enter_and_run(&path, f);
            let _ = tx.send(result);
        })
        .map_err(NetnsError::Spawn)?;

    rx.await.map_err(|_| NetnsError::Panicked)?
}

fn enter_and_run<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce(&File) -> Result<T>,
{
    let original = File::open("/proc/self/ns/net").map_err(|source| NetnsError::Open {
        path: PathBuf::from("/proc/self/ns/net"),
        source,
    })?;
    let target = File::open(path).map_err(|source| NetnsError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let _guard = NetnsGuard::enter(&target, &original)?;
    f(&original)
}

/// Run an async closure on a single-threaded runtime pinned inside the
/// namespace. Convenience over [`run_in_namespace`] for netlink work.
pub async fn run_async_in_namespace<T, F, Fut>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce(std::os::fd::RawFd) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<T>>,
    T: Send + 'static,
{
    run_in_namespace(path, move |original| {
        use std::os::fd::AsRawFd;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        rt.block_on(f(original.as_raw_fd()))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_handles_empty_and_missing() {
        assert!(!exists(""));
        assert!(!exists("/no/such/netns/path"));
        assert!(exists("/proc/self/ns/net"));
    }

    #[tokio::test]
    async fn closure_runs_and_returns() {
        // Entering our own namespace is a no-op but exercises the full
        // guard path without privileges beyond CAP-less setns-to-self.
        let out = run_in_namespace(Path::new("/proc/self/ns/net"), |original| {
            use std::os::fd::AsRawFd;
            assert!(original.as_raw_fd() >= 0);
            Ok(42)
        })
        .await;
        match out {
            Ok(v) => assert_eq!(v, 42),
            // Unprivileged environments may refuse setns even to the same
            // namespace; the executor must surface that as Enter.
            Err(NetnsError::Enter(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn missing_namespace_is_open_error() {
        let out = run_in_namespace(Path::new("/no/such/ns"), |_| Ok(())).await;
        assert!(matches!(out, Err(NetnsError::Open { .. })));
    }

    #[tokio::test]
    async fn panic_in_closure_is_contained() {
        let out: Result<()> = run_in_namespace(Path::new("/proc/self/ns/net"), |_| {
            panic!("boom");
        })
        .await;
        match out {
            Err(NetnsError::Panicked) | Err(NetnsError::Enter(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
