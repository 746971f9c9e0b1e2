//! In-process group communicators and group channels with fault injection.
//!
//! Every worker is a tokio task. Point-to-point traffic goes through one
//! unbounded mpsc queue per ordered (source, destination) pair, which gives
//! the per-pair FIFO ordering the pull protocol relies on.

use async_trait::async_trait;
use insitu_core::wire;
use insitu_env::{ChannelError, ChannelFabric, GroupChannel, GroupComm, PortName, Rank, ReduceOp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

type Outbox = mpsc::UnboundedSender<Vec<u8>>;
type Inbox = tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>;

/// Queues from `senders` workers to `receivers` workers.
///
/// Returns, per sender, its outboxes indexed by receiver and, per receiver,
/// its inboxes indexed by sender.
fn mesh(senders: usize, receivers: usize) -> (Vec<Vec<Outbox>>, Vec<Vec<Inbox>>) {
    let mut outboxes: Vec<Vec<Outbox>> = (0..senders).map(|_| Vec::with_capacity(receivers)).collect();
    let mut inboxes: Vec<Vec<Option<Inbox>>> = (0..receivers)
        .map(|_| (0..senders).map(|_| None).collect())
        .collect();

    for (src, outbox) in outboxes.iter_mut().enumerate() {
        for inbox in inboxes.iter_mut() {
            let (tx, rx) = mpsc::unbounded_channel();
            outbox.push(tx);
            inbox[src] = Some(tokio::sync::Mutex::new(rx));
        }
    }

    let inboxes = inboxes
        .into_iter()
        .map(|row| row.into_iter().flatten().collect())
        .collect();
    (outboxes, inboxes)
}

async fn recv_from(inbox: &Inbox) -> Result<Vec<u8>, ChannelError> {
    inbox
        .lock()
        .await
        .recv()
        .await
        .ok_or_else(|| ChannelError::disconnected("sender dropped"))
}

/// One worker of an in-process group.
pub struct LocalGroup {
    rank: Rank,
    size: usize,
    outbox: Vec<Outbox>,
    inbox: Vec<Inbox>,
}

impl LocalGroup {
    /// Creates the communicators for a group of `size` workers.
    pub fn create(size: usize) -> Vec<LocalGroup> {
        let (outboxes, inboxes) = mesh(size, size);
        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outbox, inbox))| LocalGroup {
                rank,
                size,
                outbox,
                inbox,
            })
            .collect()
    }

    fn send_to(&self, dest: Rank, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.outbox[dest]
            .send(payload)
            .map_err(|_| ChannelError::disconnected(format!("group worker {} is gone", dest)))
    }

    /// Root collects one message from every other worker, in rank order.
    async fn gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, ChannelError> {
        if self.rank != 0 {
            self.send_to(0, payload)?;
            return Ok(Vec::new());
        }
        let mut gathered = vec![payload];
        for src in 1..self.size {
            gathered.push(recv_from(&self.inbox[src]).await?);
        }
        Ok(gathered)
    }
}

#[async_trait]
impl GroupComm for LocalGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn barrier(&self) -> Result<(), ChannelError> {
        self.gather(Vec::new()).await?;
        self.broadcast(0, Vec::new()).await?;
        Ok(())
    }

    async fn broadcast(&self, root: Rank, payload: Vec<u8>) -> Result<Vec<u8>, ChannelError> {
        ChannelError::check_rank(root, self.size)?;
        if self.rank == root {
            for dest in (0..self.size).filter(|&d| d != root) {
                self.send_to(dest, payload.clone())?;
            }
            Ok(payload)
        } else {
            recv_from(&self.inbox[root]).await
        }
    }

    async fn all_reduce(&self, values: Vec<f32>, op: ReduceOp) -> Result<Vec<f32>, ChannelError> {
        let mismatch = |e: insitu_core::InSituError| ChannelError::CollectiveMismatch(e.to_string());

        let gathered = self.gather(wire::encode_floats(&values)).await?;
        let reduced = if self.rank == 0 {
            let mut acc = values;
            for contribution in gathered.iter().skip(1) {
                op.fold_into(&mut acc, &wire::decode_floats(contribution).map_err(mismatch)?)?;
            }
            wire::encode_floats(&acc)
        } else {
            Vec::new()
        };

        let result = self.broadcast(0, reduced).await?;
        wire::decode_floats(&result).map_err(mismatch)
    }
}

/// Severable link shared by every end of one group channel.
#[derive(Debug)]
struct Link {
    id: u64,
    severed: watch::Sender<bool>,
}

impl Link {
    fn is_severed(&self) -> bool {
        *self.severed.borrow()
    }
}

/// One worker's end of an in-process group channel.
pub struct LocalChannel {
    link: Arc<Link>,
    local_rank: Rank,
    outbox: Vec<Outbox>,
    inbox: Vec<Inbox>,
}

impl LocalChannel {
    pub fn link_id(&self) -> u64 {
        self.link.id
    }

    fn severed_error(&self) -> ChannelError {
        ChannelError::disconnected(format!("link {} severed", self.link.id))
    }
}

#[async_trait]
impl GroupChannel for LocalChannel {
    fn local_rank(&self) -> Rank {
        self.local_rank
    }

    fn remote_size(&self) -> usize {
        self.outbox.len()
    }

    async fn send(&self, dest: Rank, payload: Vec<u8>) -> Result<(), ChannelError> {
        ChannelError::check_rank(dest, self.outbox.len())?;
        if self.link.is_severed() {
            return Err(self.severed_error());
        }
        self.outbox[dest]
            .send(payload)
            .map_err(|_| ChannelError::disconnected(format!("remote worker {} is gone", dest)))
    }

    async fn recv(&self, source: Rank) -> Result<Vec<u8>, ChannelError> {
        ChannelError::check_rank(source, self.inbox.len())?;

        let mut severed = self.link.severed.subscribe();
        if *severed.borrow() {
            return Err(self.severed_error());
        }
        tokio::select! {
            received = recv_from(&self.inbox[source]) => received,
            _ = severed.changed() => Err(self.severed_error()),
        }
    }
}

enum PortState {
    Open,
    Linked(u64),
    Refused,
}

struct PortEntry {
    accept_size: usize,
    state: watch::Sender<PortState>,
}

#[derive(Default)]
struct FabricState {
    ports: HashMap<PortName, PortEntry>,
    /// Channel ends not yet claimed, by link id then side.
    unclaimed: HashMap<(u64, Side), Vec<Option<LocalChannel>>>,
    links: Vec<Arc<Link>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    Acceptor,
    Connector,
}

#[derive(Default)]
struct FabricInner {
    state: Mutex<FabricState>,
    handshakes: AtomicU64,
    next_link: AtomicU64,
    refuse_next: AtomicUsize,
}

impl FabricInner {
    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, link: u64, side: Side, rank: Rank) -> Result<LocalChannel, ChannelError> {
        let mut state = self.lock();
        let ends = state
            .unclaimed
            .get_mut(&(link, side))
            .ok_or_else(|| ChannelError::handshake(format!("link {} has no {:?} ends", link, side)))?;
        let end = ends
            .get_mut(rank)
            .and_then(Option::take)
            .ok_or_else(|| ChannelError::handshake(format!("link {} end {} already claimed", link, rank)))?;
        if ends.iter().all(Option::is_none) {
            state.unclaimed.remove(&(link, side));
        }
        Ok(end)
    }

    /// Leader-side connect: builds the link or reports why not.
    fn link_port(&self, port: &PortName, connect_size: usize) -> Result<u64, ChannelError> {
        let mut state = self.lock();
        let entry = state
            .ports
            .get(port)
            .ok_or_else(|| ChannelError::UnknownPort(port.to_string()))?;
        if !matches!(*entry.state.borrow(), PortState::Open) {
            return Err(ChannelError::handshake(format!("port {} is already linked", port)));
        }

        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            entry.state.send_replace(PortState::Refused);
            return Err(ChannelError::handshake(format!("injected refusal on {}", port)));
        }

        let accept_size = entry.accept_size;
        let id = self.next_link.fetch_add(1, Ordering::SeqCst);
        let (severed, _) = watch::channel(false);
        let link = Arc::new(Link { id, severed });

        let (acc_out, con_in) = mesh(accept_size, connect_size);
        let (con_out, acc_in) = mesh(connect_size, accept_size);

        let acceptors = acc_out
            .into_iter()
            .zip(acc_in)
            .enumerate()
            .map(|(rank, (outbox, inbox))| {
                Some(LocalChannel {
                    link: link.clone(),
                    local_rank: rank,
                    outbox,
                    inbox,
                })
            })
            .collect();
        let connectors = con_out
            .into_iter()
            .zip(con_in)
            .enumerate()
            .map(|(rank, (outbox, inbox))| {
                Some(LocalChannel {
                    link: link.clone(),
                    local_rank: rank,
                    outbox,
                    inbox,
                })
            })
            .collect();

        entry.state.send_replace(PortState::Linked(id));
        state.unclaimed.insert((id, Side::Acceptor), acceptors);
        state.unclaimed.insert((id, Side::Connector), connectors);
        state.links.push(link);
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }
}

const STATUS_LINKED: u8 = 0;
const STATUS_UNKNOWN_PORT: u8 = 1;
const STATUS_FAILED: u8 = 2;

/// In-process channel fabric shared by a producer group and any number of
/// consumer groups.
#[derive(Clone, Default)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fault-injection handle for this fabric.
    pub fn controller(&self) -> FabricController {
        FabricController {
            inner: self.inner.clone(),
        }
    }

    /// Group channels established so far.
    pub fn handshakes(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    /// Ports currently open.
    pub fn open_ports(&self) -> usize {
        self.inner.lock().ports.len()
    }
}

#[async_trait]
impl ChannelFabric for LocalFabric {
    type Group = LocalGroup;
    type Channel = LocalChannel;

    async fn open_port(&self, group: &LocalGroup) -> Result<PortName, ChannelError> {
        let name = if group.is_root() {
            let name = PortName::generate("local");
            let (state, _) = watch::channel(PortState::Open);
            self.inner.lock().ports.insert(
                name.clone(),
                PortEntry {
                    accept_size: group.size(),
                    state,
                },
            );
            name.into_string().into_bytes()
        } else {
            Vec::new()
        };

        let name = group.broadcast(0, name).await?;
        String::from_utf8(name)
            .map(PortName::from)
            .map_err(|e| ChannelError::CollectiveMismatch(format!("port name is not UTF-8: {}", e)))
    }

    async fn accept(&self, port: &PortName, group: &LocalGroup) -> Result<LocalChannel, ChannelError> {
        let mut state = {
            let fabric = self.inner.lock();
            let entry = fabric
                .ports
                .get(port)
                .ok_or_else(|| ChannelError::UnknownPort(port.to_string()))?;
            entry.state.subscribe()
        };

        let link = loop {
            match *state.borrow_and_update() {
                PortState::Open => {}
                PortState::Linked(id) => break id,
                PortState::Refused => return Err(ChannelError::Refused(port.to_string())),
            }
            state
                .changed()
                .await
                .map_err(|_| ChannelError::disconnected(format!("port {} closed while accepting", port)))?;
        };

        self.inner.claim(link, Side::Acceptor, group.rank())
    }

    async fn connect(&self, port: &PortName, group: &LocalGroup) -> Result<LocalChannel, ChannelError> {
        let status = if group.is_root() {
            match self.inner.link_port(port, group.size()) {
                Ok(id) => {
                    let mut status = vec![STATUS_LINKED];
                    status.extend_from_slice(&id.to_le_bytes());
                    status
                }
                Err(ChannelError::UnknownPort(_)) => vec![STATUS_UNKNOWN_PORT],
                Err(_) => vec![STATUS_FAILED],
            }
        } else {
            Vec::new()
        };

        let status = group.broadcast(0, status).await?;
        match status.as_slice() {
            [STATUS_LINKED, id @ ..] => {
                let id: [u8; 8] = id
                    .try_into()
                    .map_err(|_| ChannelError::CollectiveMismatch("malformed link id".to_string()))?;
                self.inner.claim(u64::from_le_bytes(id), Side::Connector, group.rank())
            }
            [STATUS_UNKNOWN_PORT] => Err(ChannelError::UnknownPort(port.to_string())),
            _ => Err(ChannelError::handshake(format!("connect to {} failed", port))),
        }
    }

    async fn close_port(&self, port: &PortName, group: &LocalGroup) -> Result<(), ChannelError> {
        if group.is_root() {
            self.inner.lock().ports.remove(port);
        }
        group.barrier().await
    }
}

/// Fault injection for a [`LocalFabric`].
#[derive(Clone)]
pub struct FabricController {
    inner: Arc<FabricInner>,
}

impl FabricController {
    /// Makes the next `n` connect attempts fail on both sides.
    pub fn refuse_next_connects(&self, n: usize) {
        self.inner.refuse_next.fetch_add(n, Ordering::SeqCst);
    }

    /// Severs every established link. Returns how many were live.
    pub fn sever_links(&self) -> usize {
        let state = self.inner.lock();
        let mut severed = 0;
        for link in &state.links {
            if !link.is_severed() {
                link.severed.send_replace(true);
                severed += 1;
            }
        }
        tracing::info!(links = severed, "Severed group channels");
        severed
    }

    /// Links established and not severed.
    pub fn live_links(&self) -> usize {
        self.inner.lock().links.iter().filter(|l| !l.is_severed()).count()
    }

    pub fn handshakes(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn on_all<T, F, Fut>(groups: Vec<LocalGroup>, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(LocalGroup) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let handles: Vec<_> = groups.into_iter().map(|g| tokio::spawn(f(g))).collect();
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_group_collectives() {
        let results = on_all(LocalGroup::create(4), |g| async move {
            g.barrier().await.unwrap();
            let b = g.broadcast(2, vec![g.rank() as u8]).await.unwrap();
            let max = g.all_reduce(vec![g.rank() as f32, -(g.rank() as f32)], ReduceOp::Max).await.unwrap();
            let min = g.all_reduce(vec![g.rank() as f32], ReduceOp::Min).await.unwrap();
            (b, max, min)
        })
        .await;

        for (b, max, min) in results {
            assert_eq!(b, vec![2]);
            assert_eq!(max, vec![3.0, 0.0]);
            assert_eq!(min, vec![0.0]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_rejects_bad_root() {
        let group = LocalGroup::create(1).pop().unwrap();
        assert!(matches!(
            group.broadcast(3, Vec::new()).await,
            Err(ChannelError::InvalidRank { rank: 3, size: 1 })
        ));
    }

    async fn link(fabric: &LocalFabric, accept: usize, connect: usize) -> (Vec<LocalChannel>, Vec<LocalChannel>) {
        let acceptors = LocalGroup::create(accept);
        let connectors = LocalGroup::create(connect);

        let f = fabric.clone();
        let accept_side = tokio::spawn(async move {
            let handles: Vec<_> = acceptors
                .into_iter()
                .map(|g| {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let port = f.open_port(&g).await?;
                        let ch = f.accept(&port, &g).await;
                        f.close_port(&port, &g).await?;
                        ch.map(|ch| (port, ch))
                    })
                })
                .collect();
            let mut out = Vec::new();
            for h in handles {
                out.push(h.await.unwrap());
            }
            out
        });

        // Wait for the acceptor leader's port.
        let port = loop {
            let ports: Vec<PortName> = fabric.inner.lock().ports.keys().cloned().collect();
            if let Some(p) = ports.into_iter().next() {
                break p;
            }
            tokio::task::yield_now().await;
        };

        let mut connect_handles = Vec::new();
        for g in connectors {
            let f = fabric.clone();
            let port = if g.is_root() { port.clone() } else { PortName::default() };
            connect_handles.push(tokio::spawn(async move { f.connect(&port, &g).await }));
        }
        let mut connected = Vec::new();
        for h in connect_handles {
            connected.push(h.await.unwrap().unwrap());
        }
        let accepted = accept_side
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap().1)
            .collect();
        (accepted, connected)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_channel_between_groups() {
        let fabric = LocalFabric::new();
        let (acceptors, connectors) = link(&fabric, 2, 3).await;

        assert_eq!(fabric.handshakes(), 1);
        assert_eq!(fabric.open_ports(), 0);
        assert_eq!(acceptors[1].remote_size(), 3);
        assert_eq!(connectors[2].remote_size(), 2);

        connectors[0].broadcast_to_remote(b"bounds".to_vec()).await.unwrap();
        for a in &acceptors {
            assert_eq!(a.recv_broadcast(0).await.unwrap(), b"bounds".to_vec());
        }

        acceptors[1].send(2, vec![1]).await.unwrap();
        acceptors[1].send(2, vec![2]).await.unwrap();
        assert_eq!(connectors[2].recv(1).await.unwrap(), vec![1]);
        assert_eq!(connectors[2].recv(1).await.unwrap(), vec![2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sever_wakes_blocked_receiver() {
        let fabric = LocalFabric::new();
        let (mut acceptors, _connectors) = link(&fabric, 1, 1).await;
        let a = acceptors.pop().unwrap();

        let waiting = tokio::spawn(async move { a.recv(0).await });
        tokio::task::yield_now().await;

        let controller = fabric.controller();
        assert_eq!(controller.live_links(), 1);
        assert_eq!(controller.sever_links(), 1);

        assert!(matches!(waiting.await.unwrap(), Err(ChannelError::Disconnected(_))));
        assert_eq!(controller.live_links(), 0);
    }

    #[tokio::test]
    async fn test_connect_unknown_port() {
        let fabric = LocalFabric::new();
        let group = LocalGroup::create(1).pop().unwrap();
        let result = fabric.connect(&PortName::from("local://nowhere"), &group).await;
        assert!(matches!(result, Err(ChannelError::UnknownPort(_))));
        assert_eq!(fabric.handshakes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refused_connect_fails_both_sides() {
        let fabric = LocalFabric::new();
        fabric.controller().refuse_next_connects(1);

        let acceptor = LocalGroup::create(1).pop().unwrap();
        let port = fabric.open_port(&acceptor).await.unwrap();
        let f = fabric.clone();
        let p = port.clone();
        let accepting = tokio::spawn(async move { f.accept(&p, &acceptor).await.map(|_| ()) });

        let connector = LocalGroup::create(1).pop().unwrap();
        assert!(matches!(
            fabric.connect(&port, &connector).await,
            Err(ChannelError::HandshakeFailed(_))
        ));
        assert!(matches!(accepting.await.unwrap(), Err(ChannelError::Refused(_))));
        assert_eq!(fabric.handshakes(), 0);
    }
}
