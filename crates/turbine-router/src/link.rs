//! Connections to other routers

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tracing::debug;
use turbine_core::{codec, Message, Reply, ServerIdentity, ServerName, Wait, Welcome};
use turbine_transport::TransportSender;
use uuid::Uuid;

use crate::error::{Result, RouterError};

/// Link identifier
pub type LinkId = String;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialled the remote; endpoints forward over these
    Outbound,
    /// The remote dialled us
    Inbound,
}

struct PendingRequest {
    tx: oneshot::Sender<Reply>,
    bytes: u64,
}

/// One live connection to another router
pub struct Link {
    /// Unique link ID
    pub id: LinkId,
    pub direction: Direction,
    /// Remote identity, known once the handshake is done
    remote: RwLock<Option<ServerIdentity>>,
    /// Transport sender for this link
    sender: Arc<dyn TransportSender>,
    /// Requests waiting for a reply, by request id
    pending: DashMap<u64, PendingRequest>,
    pending_pings: DashMap<u64, oneshot::Sender<()>>,
    welcome: Mutex<Option<oneshot::Sender<Welcome>>>,
    next_id: AtomicU64,
    in_flight_bytes: AtomicU64,
    bytes_transferred: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
    pub created_at: Instant,
    last_activity: RwLock<Instant>,
}

impl Link {
    pub fn new(sender: Arc<dyn TransportSender>, direction: Direction) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            remote: RwLock::new(None),
            sender,
            pending: DashMap::new(),
            pending_pings: DashMap::new(),
            welcome: Mutex::new(None),
            next_id: AtomicU64::new(1),
            in_flight_bytes: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            created_at: now,
            last_activity: RwLock::new(now),
        }
    }

    pub fn remote(&self) -> Option<ServerIdentity> {
        self.remote.read().clone()
    }

    pub fn remote_name(&self) -> Option<ServerName> {
        self.remote.read().as_ref().map(|identity| identity.name.clone())
    }

    pub fn set_remote(&self, identity: ServerIdentity) {
        *self.remote.write() = Some(identity);
    }

    /// Label for log lines
    pub fn describe(&self) -> String {
        match self.remote_name() {
            Some(name) => format!("{} ({:?})", name, self.direction),
            None => format!("link {} ({:?})", self.id, self.direction),
        }
    }

    /// Payload bytes sent in requests that have not been answered yet
    pub fn in_flight_bytes(&self) -> u64 {
        self.in_flight_bytes.load(Ordering::SeqCst)
    }

    /// Total bytes written to this link
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.sender.is_connected()
    }

    /// Encode and send a message
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(RouterError::Protocol(format!(
                "{} is closed",
                self.describe()
            )));
        }
        let data = codec::encode(message)?;
        let len = data.len() as u64;
        self.sender.send(data).await?;
        self.bytes_transferred.fetch_add(len, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    /// Send a request built from a fresh request id and wait for its reply.
    ///
    /// `payload_bytes` count as in flight until the reply arrives.
    pub async fn request<F>(&self, build: F, payload_bytes: usize, wait: Wait) -> Result<Reply>
    where
        F: FnOnce(u64) -> Message,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let bytes = payload_bytes as u64;

        self.pending.insert(id, PendingRequest { tx, bytes });
        self.in_flight_bytes.fetch_add(bytes, Ordering::SeqCst);
        let _guard = PendingGuard { link: self, id };

        self.send_message(&build(id)).await?;

        tokio::select! {
            reply = bounded(wait, rx) => match reply? {
                Ok(reply) => Ok(reply),
                Err(_) => Err(RouterError::Protocol(format!(
                    "{} closed before replying",
                    self.describe()
                ))),
            },
            _ = self.closed() => Err(RouterError::Protocol(format!(
                "{} closed before replying",
                self.describe()
            ))),
        }
    }

    /// Hand a reply to the request waiting on it
    pub fn complete(&self, id: u64, reply: Reply) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                self.in_flight_bytes.fetch_sub(pending.bytes, Ordering::SeqCst);
                pending.tx.send(reply).is_ok()
            }
            None => {
                debug!("Reply {} on {} matches no request", id, self.describe());
                false
            }
        }
    }

    /// Round-trip a ping within `wait`
    pub async fn ping(&self, wait: Wait) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_pings.insert(id, tx);

        let result: Result<()> = async {
            self.send_message(&Message::Ping { id }).await?;
            match bounded(wait, rx).await? {
                Ok(()) => Ok(()),
                Err(_) => Err(RouterError::Protocol(format!(
                    "{} closed before answering ping",
                    self.describe()
                ))),
            }
        }
        .await;

        self.pending_pings.remove(&id);
        result
    }

    pub fn complete_ping(&self, id: u64) {
        if let Some((_, tx)) = self.pending_pings.remove(&id) {
            let _ = tx.send(());
        }
    }

    /// Register interest in the Welcome answering our Hello
    pub fn expect_welcome(&self) -> oneshot::Receiver<Welcome> {
        let (tx, rx) = oneshot::channel();
        *self.welcome.lock() = Some(tx);
        rx
    }

    pub fn complete_welcome(&self, welcome: Welcome) -> bool {
        match self.welcome.lock().take() {
            Some(tx) => tx.send(welcome).is_ok(),
            None => false,
        }
    }

    /// Drop every waiting request; their callers see the link as closed.
    ///
    /// Returns the payload bytes those requests still had in flight. Each
    /// request is released exactly once, here or by its caller.
    pub fn fail_all(&self) -> u64 {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut stranded = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                self.in_flight_bytes.fetch_sub(pending.bytes, Ordering::SeqCst);
                stranded += pending.bytes;
            }
        }
        self.pending_pings.clear();
        self.welcome.lock().take();
        stranded
    }

    /// Mark the link closed without touching the transport
    pub fn mark_closed(&self) -> bool {
        let transitioned = !self.closed.swap(true, Ordering::SeqCst);
        if transitioned {
            self.closed_notify.notify_waiters();
        }
        transitioned
    }

    /// Close the transport and mark the link closed
    pub async fn close(&self) {
        if self.mark_closed() {
            if let Err(e) = self.sender.close().await {
                debug!("Closing {} failed: {}", self.describe(), e);
            }
        }
    }

    /// Resolves once the link is closed
    pub async fn closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Removes an abandoned request and releases its in-flight bytes.
///
/// Once the link is closed the request is left for [`Link::fail_all`], so
/// the bytes it stranded are counted by whoever handles the loss.
struct PendingGuard<'a> {
    link: &'a Link,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.link.is_closed() {
            return;
        }
        if let Some((_, pending)) = self.link.pending.remove(&self.id) {
            self.link
                .in_flight_bytes
                .fetch_sub(pending.bytes, Ordering::SeqCst);
        }
    }
}

/// Await `fut` within `wait`, mapping expiry to [`RouterError::Timeout`]
pub(crate) async fn bounded<F: std::future::Future>(wait: Wait, fut: F) -> Result<F::Output> {
    turbine_transport::within(wait, fut)
        .await
        .map_err(|_| RouterError::Timeout)
}
