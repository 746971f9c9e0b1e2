//! Producer-side background accept loop.
//!
//! Runs on the producer leader only. Each rendezvous connection is read on
//! its own task so a slow or stalled client never holds up the next accept.
//! A complete port name is queued as a pending attachment; malformed or
//! stalled connections are logged and dropped.

use crate::error::{InSituError, Result};
use crate::rendezvous;
use insitu_env::PortName;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};

/// Time a rendezvous client has to deliver its whole port name.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` (e.g. descriptor exhaustion).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Port names waiting for the next timestep gate.
///
/// The only state shared between the accept loop and the timestep loop. The
/// lock is held for a push or a drain, never across I/O.
#[derive(Debug, Clone, Default)]
pub struct PendingAttachments {
    inner: Arc<Mutex<Vec<PortName>>>,
}

impl PendingAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PortName>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, name: PortName) {
        self.lock().push(name);
    }

    /// Takes every queued name, in arrival order, and clears the queue.
    pub fn drain(&self) -> Vec<PortName> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptStats {
    /// Connections whose port name was queued.
    pub accepted: u64,
    /// Connections dropped for a malformed or stalled payload.
    pub rejected: u64,
}

/// Handle to a running accept loop.
#[derive(Debug)]
pub struct AcceptLoopHandle {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<AcceptStats>,
}

impl AcceptLoopHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) -> AcceptStats {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "Accept loop task did not exit cleanly");
                AcceptStats::default()
            }
        }
    }
}

/// Starts the accept loop on an already bound listener.
pub fn spawn_accept_loop(listener: TcpListener, pending: PendingAttachments) -> std::io::Result<AcceptLoopHandle> {
    let local_addr = listener.local_addr()?;
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(listener, pending, stop_rx));

    tracing::info!(addr = %local_addr, "Rendezvous listener accepting attachments");
    Ok(AcceptLoopHandle {
        local_addr,
        stop,
        task,
    })
}

async fn run(listener: TcpListener, pending: PendingAttachments, mut stop: watch::Receiver<bool>) -> AcceptStats {
    let mut stats = AcceptStats::default();
    let mut readers: JoinSet<(SocketAddr, Result<PortName>)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    readers.spawn(read_attachment(stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Rendezvous accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(finished) = readers.join_next() => record(finished, &pending, &mut stats),
        }
    }

    // Connections that finish within the grace period still count.
    let settle = async {
        while let Some(finished) = readers.join_next().await {
            record(finished, &pending, &mut stats);
        }
    };
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, settle).await;
    if !readers.is_empty() {
        tracing::debug!(in_flight = readers.len(), "Aborting unfinished rendezvous reads");
        readers.shutdown().await;
    }

    tracing::info!(accepted = stats.accepted, rejected = stats.rejected, "Accept loop stopped");
    stats
}

async fn read_attachment(mut stream: TcpStream, peer: SocketAddr) -> (SocketAddr, Result<PortName>) {
    let received = match tokio::time::timeout(RECEIVE_TIMEOUT, rendezvous::receive(&mut stream)).await {
        Ok(received) => received,
        Err(_) => Err(InSituError::protocol(format!(
            "no complete port name within {:?}",
            RECEIVE_TIMEOUT
        ))),
    };
    (peer, received)
}

fn record(
    finished: std::result::Result<(SocketAddr, Result<PortName>), JoinError>,
    pending: &PendingAttachments,
    stats: &mut AcceptStats,
) {
    match finished {
        Ok((peer, Ok(name))) => {
            tracing::info!(%peer, port = %name, "Queued consumer attachment");
            pending.push(name);
            stats.accepted += 1;
        }
        Ok((peer, Err(e))) => {
            tracing::warn!(%peer, error = %e, "Dropping malformed rendezvous connection");
            stats.rejected += 1;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rendezvous reader task failed");
            stats.rejected += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::bind_listener;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn wait_for(pending: &PendingAttachments, n: usize) {
        for _ in 0..500 {
            if pending.len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} attachments", n);
    }

    #[test]
    fn test_pending_drain_clears() {
        let pending = PendingAttachments::new();
        pending.push(PortName::from("a"));
        pending.push(PortName::from("b"));

        assert_eq!(pending.drain(), vec![PortName::from("a"), PortName::from("b")]);
        assert!(pending.is_empty());
        assert!(pending.drain().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_connection_does_not_wedge_loop() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let pending = PendingAttachments::new();
        let handle = spawn_accept_loop(listener, pending.clone()).unwrap();
        let port = handle.local_addr().port();

        // Declares 50 bytes, sends 10, closes.
        let mut bad = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        bad.write_all(&50i32.to_le_bytes()).await.unwrap();
        bad.write_all(&[b'z'; 10]).await.unwrap();
        drop(bad);

        rendezvous::announce("127.0.0.1", port, &PortName::from("local://good"))
            .await
            .unwrap();
        wait_for(&pending, 1).await;

        assert_eq!(pending.drain(), vec![PortName::from("local://good")]);
        let stats = handle.shutdown().await;
        assert_eq!(stats, AcceptStats { accepted: 1, rejected: 1 });
    }

    #[tokio::test]
    async fn test_open_truncated_client_does_not_block_next_attachment() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let pending = PendingAttachments::new();
        let handle = spawn_accept_loop(listener, pending.clone()).unwrap();
        let port = handle.local_addr().port();

        // Declares 50 bytes, sends 10, and keeps the connection open.
        let mut stalled = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stalled.write_all(&50i32.to_le_bytes()).await.unwrap();
        stalled.write_all(&[b'z'; 10]).await.unwrap();

        rendezvous::announce("127.0.0.1", port, &PortName::from("local://good"))
            .await
            .unwrap();
        wait_for(&pending, 1).await;
        assert_eq!(pending.drain(), vec![PortName::from("local://good")]);

        let stats = handle.shutdown().await;
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 0);
        drop(stalled);
    }

    #[tokio::test]
    async fn test_attachments_queue_in_arrival_order() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let pending = PendingAttachments::new();
        let handle = spawn_accept_loop(listener, pending.clone()).unwrap();
        let port = handle.local_addr().port();

        for i in 0..3 {
            let name = PortName::new(format!("local://c{}", i));
            rendezvous::announce("127.0.0.1", port, &name).await.unwrap();
            wait_for(&pending, i + 1).await;
        }

        let names: Vec<String> = pending.drain().into_iter().map(PortName::into_string).collect();
        assert_eq!(names, vec!["local://c0", "local://c1", "local://c2"]);
        assert_eq!(handle.shutdown().await.accepted, 3);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let handle = spawn_accept_loop(listener, PendingAttachments::new()).unwrap();
        assert_eq!(handle.shutdown().await, AcceptStats::default());
    }
}
