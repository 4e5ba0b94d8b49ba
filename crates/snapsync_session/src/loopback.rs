//! In-process remote authority.
//!
//! [`LoopbackAuthority`] speaks the real wire protocol over in-memory
//! channels. It checks credentials, keeps an authority-side log of every
//! accepted envelope, acknowledges each uploaded entry, and fans accepted
//! envelopes out to every other connected device. Fault injection covers
//! going offline, dropping live connections and pushing raw frames.
//!
//! Every frame for a connection goes through that connection's queue, and
//! frames are queued while the state lock is held. The handshake reply,
//! the backlog and live fan-out therefore reach a device in authority
//! order.

use crate::error::{SessionError, SessionResult};
use crate::transport::{Connection, RemoteTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use snapsync_core::SequenceNumber;
use snapsync_protocol::{ClientMessage, Envelope, Hello, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

/// One accepted envelope in the authority log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityEntry {
    /// Authority sequence number.
    pub remote_seq: u64,
    /// Device that uploaded it, `None` for envelopes published directly.
    pub device_id: Option<String>,
    /// The envelope.
    pub envelope: Envelope,
}

type Queue = mpsc::UnboundedSender<Vec<u8>>;

struct Link {
    device_id: String,
    queue: Queue,
    cancel: CancellationToken,
    /// Last `remote_seq` queued on this link.
    last_sent: u64,
}

impl Link {
    fn push_mutation(&mut self, remote_seq: u64, envelope: &Envelope) {
        let message = ServerMessage::Mutation {
            remote_seq,
            after: self.last_sent,
            envelope: envelope.clone(),
        };
        if enqueue(&self.queue, &message) {
            self.last_sent = remote_seq;
        }
    }
}

#[derive(Default)]
struct AuthorityState {
    online: bool,
    accounts: HashMap<String, String>,
    log: Vec<AuthorityEntry>,
    links: HashMap<u64, Link>,
    next_link: u64,
    /// Every uploaded sequence number per device, duplicates included.
    received: HashMap<String, Vec<SequenceNumber>>,
    /// Highest acknowledged sequence number per device.
    acked: HashMap<String, SequenceNumber>,
}

/// An in-process remote authority.
///
/// Cloning shares the authority.
#[derive(Clone)]
pub struct LoopbackAuthority {
    state: Arc<Mutex<AuthorityState>>,
}

impl LoopbackAuthority {
    /// Creates an online authority with no accounts.
    pub fn new() -> Self {
        let state = AuthorityState {
            online: true,
            ..AuthorityState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Adds an account.
    pub fn with_account(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.state
            .lock()
            .accounts
            .insert(username.into(), password.into());
        self
    }

    /// A transport connecting to this authority.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            authority: self.clone(),
        }
    }

    /// Takes the authority on or off line. Going offline drops every live
    /// connection and refuses new ones.
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
        if !online {
            self.drop_connections();
        }
    }

    /// Drops every live connection. Devices see a transport failure.
    pub fn drop_connections(&self) {
        let links: Vec<_> = self.state.lock().links.drain().collect();
        tracing::debug!(count = links.len(), "dropping loopback connections");
        for (_, link) in links {
            link.cancel.cancel();
        }
    }

    /// Number of devices past the handshake.
    pub fn connection_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Sequence numbers uploaded by `device_id`, in arrival order.
    pub fn received_from(&self, device_id: &str) -> Vec<SequenceNumber> {
        self.state
            .lock()
            .received
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The authority log.
    pub fn entries(&self) -> Vec<AuthorityEntry> {
        self.state.lock().log.clone()
    }

    /// Accepts an envelope from outside any device and fans it out to
    /// every connected device. Returns its authority sequence number.
    pub async fn publish(&self, envelope: Envelope) -> u64 {
        let mut state = self.state.lock();
        let remote_seq = state.accept(None, envelope.clone());
        for link in state.links.values_mut() {
            link.push_mutation(remote_seq, &envelope);
        }
        remote_seq
    }

    /// Queues a raw frame on every connection of `device_id`. Returns the
    /// number of connections reached.
    ///
    /// The frame bypasses the mutation chain, so a `Mutation` injected here
    /// does not move the link's `after` marker.
    pub async fn inject_frame(&self, device_id: &str, frame: Vec<u8>) -> usize {
        let state = self.state.lock();
        let mut reached = 0;
        for link in state.links.values().filter(|l| l.device_id == device_id) {
            if link.queue.send(frame.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    async fn serve(self, mut conn: Connection, cancel: CancellationToken) {
        let hello = tokio::select! {
            () = cancel.cancelled() => return,
            frame = conn.inbound.recv() => match frame.map(|f| ClientMessage::decode(&f)) {
                Some(Ok(ClientMessage::Hello(hello))) => hello,
                Some(_) => {
                    tracing::warn!("loopback: first frame was not a hello");
                    return;
                }
                None => return,
            },
        };

        let (queue, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(queue_rx, conn.outbound.clone(), cancel.clone()));

        let Some(link_id) = self.admit(&hello, queue, &cancel) else {
            return;
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                frame = conn.inbound.recv() => {
                    let Some(frame) = frame else { break };
                    match ClientMessage::decode(&frame) {
                        Ok(ClientMessage::Mutation { seq, envelopes }) => {
                            if !self.accept_upload(&hello.device_id, link_id, seq, envelopes) {
                                break;
                            }
                        }
                        Ok(ClientMessage::Hello(_)) => tracing::warn!("loopback: repeated hello"),
                        Err(e) => tracing::warn!(error = %e, "loopback: undecodable frame"),
                    }
                }
            }
        }
        self.state.lock().links.remove(&link_id);
    }

    /// Runs the handshake. Returns the link id once the device is admitted.
    ///
    /// The reply, the backlog and the link registration happen under one
    /// lock, so no live mutation can be queued ahead of the backlog.
    fn admit(&self, hello: &Hello, queue: Queue, cancel: &CancellationToken) -> Option<u64> {
        let mut state = self.state.lock();
        let refusal = if let Err(e) = hello.check_version() {
            Some(e.to_string())
        } else if state.accounts.get(&hello.credentials.username)
            != Some(&hello.credentials.password)
        {
            Some("invalid credentials".to_string())
        } else {
            None
        };

        if let Some(reason) = refusal {
            tracing::debug!(device = %hello.device_id, %reason, "loopback handshake refused");
            enqueue(&queue, &ServerMessage::Rejected { reason });
            return None;
        }

        let welcome = ServerMessage::Welcome {
            remote_cursor: state.log.len() as u64,
        };
        if !enqueue(&queue, &welcome) {
            return None;
        }
        let mut link = Link {
            device_id: hello.device_id.clone(),
            queue,
            cancel: cancel.clone(),
            last_sent: hello.remote_cursor,
        };
        let backlog = state
            .log
            .iter()
            .filter(|e| e.remote_seq > hello.remote_cursor)
            .filter(|e| e.device_id.as_deref() != Some(hello.device_id.as_str()));
        let mut queued = 0usize;
        for entry in backlog {
            link.push_mutation(entry.remote_seq, &entry.envelope);
            queued += 1;
        }
        tracing::debug!(device = %hello.device_id, backlog = queued, "loopback handshake accepted");

        let link_id = state.next_link;
        state.next_link += 1;
        state.links.insert(link_id, link);
        Some(link_id)
    }

    /// Accepts one uploaded entry. Returns `false` once the device is gone.
    fn accept_upload(
        &self,
        device_id: &str,
        link_id: u64,
        seq: SequenceNumber,
        envelopes: Vec<Envelope>,
    ) -> bool {
        let mut state = self.state.lock();
        state
            .received
            .entry(device_id.to_string())
            .or_default()
            .push(seq);

        let acked = state.acked.get(device_id).copied().unwrap_or_default();
        if seq > acked {
            for envelope in envelopes {
                let remote_seq = state.accept(Some(device_id.to_string()), envelope.clone());
                for (id, link) in &mut state.links {
                    if *id != link_id && link.device_id != device_id {
                        link.push_mutation(remote_seq, &envelope);
                    }
                }
            }
            state.acked.insert(device_id.to_string(), seq);
        }

        let ack = ServerMessage::Ack {
            up_to: seq.max(acked),
        };
        state
            .links
            .get(&link_id)
            .is_some_and(|link| enqueue(&link.queue, &ack))
    }
}

impl Default for LoopbackAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthorityState {
    fn accept(&mut self, device_id: Option<String>, envelope: Envelope) -> u64 {
        let remote_seq = self.log.len() as u64 + 1;
        self.log.push(AuthorityEntry {
            remote_seq,
            device_id,
            envelope,
        });
        remote_seq
    }
}

fn enqueue(queue: &Queue, message: &ServerMessage) -> bool {
    match message.encode() {
        Ok(frame) => queue.send(frame).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "loopback: cannot encode reply");
            false
        }
    }
}

/// Drains one link's queue into its connection, in order.
async fn forward(
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if outbound.send(frame).await.is_err() {
            break;
        }
    }
}

/// [`RemoteTransport`] for a [`LoopbackAuthority`].
#[derive(Clone)]
pub struct LoopbackTransport {
    authority: LoopbackAuthority,
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    async fn connect(&self) -> SessionResult<Connection> {
        if !self.authority.state.lock().online {
            return Err(SessionError::transport("authority unreachable"));
        }
        let (client, server) = Connection::pair(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(self.authority.clone().serve(server, cancel));
        Ok(client)
    }
}
