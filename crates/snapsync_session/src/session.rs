//! The sync session task.

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::state::{SessionState, SessionStatus, StatusCallbacks};
use crate::transport::{Connection, RemoteTransport};
use snapsync_core::{CoreError, Database, Origin, SequenceNumber};
use snapsync_protocol::{envelopes_for_entry, ClientMessage, Envelope, Hello, ServerMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A sync session between one [`Database`] and a remote authority.
///
/// Build it, register status callbacks, then [`start`](Self::start) it on
/// a tokio runtime. The session only touches the database through
/// [`Database::ingest_remote`], the acknowledged watermark and the remote
/// cursor; local writers never wait on it.
pub struct SyncSession<T: RemoteTransport> {
    db: Arc<Database>,
    transport: Arc<T>,
    config: SessionConfig,
    callbacks: Arc<StatusCallbacks>,
}

impl<T: RemoteTransport> SyncSession<T> {
    /// Creates a session.
    pub fn new(db: Arc<Database>, transport: T, config: SessionConfig) -> Self {
        Self {
            db,
            transport: Arc::new(transport),
            config,
            callbacks: Arc::new(StatusCallbacks::default()),
        }
    }

    /// Registers a status callback. Callbacks run on the session task.
    pub fn on_status<F>(self, callback: F) -> Self
    where
        F: Fn(&SessionStatus) + Send + Sync + 'static,
    {
        self.callbacks.register(Arc::new(callback));
        self
    }

    /// Spawns the session task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> SessionHandle {
        let (status_tx, status_rx) = watch::channel(SessionStatus::new(SessionState::Disconnected));
        let cancel = CancellationToken::new();
        let runner = Runner {
            db: self.db,
            transport: self.transport,
            config: self.config,
            callbacks: Arc::clone(&self.callbacks),
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(runner.run());
        SessionHandle {
            status: status_rx,
            callbacks: self.callbacks,
            cancel,
            task,
        }
    }
}

/// Owner's handle on a running session.
pub struct SessionHandle {
    status: watch::Receiver<SessionStatus>,
    callbacks: Arc<StatusCallbacks>,
    cancel: CancellationToken,
    task: JoinHandle<SessionStatus>,
}

impl SessionHandle {
    /// Current state.
    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Registers a status callback for future changes.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&SessionStatus) + Send + Sync + 'static,
    {
        self.callbacks.register(Arc::new(callback));
    }

    /// Waits until the session reaches `state` or ends.
    pub async fn wait_for(&self, state: SessionState) -> SessionStatus {
        let mut rx = self.status.clone();
        let result = rx
            .wait_for(|status| status.state == state || status.state.is_terminal())
            .await
            .map(|status| (*status).clone());
        match result {
            Ok(status) => status,
            Err(_) => self.status(),
        }
    }

    /// Requests cooperative cancellation. Unacknowledged entries stay in
    /// the log for the next session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a token that cancels the session when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the session task to end and returns its final status.
    pub async fn join(self) -> SessionStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "sync session task panicked");
                SessionStatus::with_error(SessionState::Failed, SessionError::transport(e.to_string()))
            }
        }
    }

    /// Cancels the session and waits for it to end.
    pub async fn stop(self) -> SessionStatus {
        self.cancel();
        self.join().await
    }
}

/// Upload progress within one connection.
struct UploadCursor {
    /// Next log sequence number to read.
    next: SequenceNumber,
    /// Highest sequence number sent on this connection.
    last_sent: SequenceNumber,
}

impl UploadCursor {
    fn scanned(&self) -> SequenceNumber {
        SequenceNumber::new(self.next.as_u64().saturating_sub(1))
    }
}

struct Runner<T: RemoteTransport> {
    db: Arc<Database>,
    transport: Arc<T>,
    config: SessionConfig,
    callbacks: Arc<StatusCallbacks>,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

impl<T: RemoteTransport> Runner<T> {
    async fn run(self) -> SessionStatus {
        tracing::info!(device = %self.config.device_id, "sync session started");
        let mut failures = 0u32;

        let final_status = loop {
            if self.cancel.is_cancelled() {
                break SessionStatus::new(SessionState::Stopped);
            }

            let error = self.connect_and_sync(&mut failures).await;
            match error {
                SessionError::Cancelled => break SessionStatus::new(SessionState::Stopped),
                SessionError::Auth { .. } => {
                    tracing::error!(error = %error, "authority refused credentials");
                    break SessionStatus::with_error(SessionState::SignedOut, error);
                }
                e if e.is_retryable() => {
                    failures += 1;
                    if self.config.backoff.exhausted(failures) {
                        tracing::error!(attempts = failures, error = %e, "retry budget exhausted");
                        break SessionStatus::with_error(
                            SessionState::Failed,
                            SessionError::RetryBudgetExhausted {
                                attempts: failures,
                                last_error: e.to_string(),
                            },
                        );
                    }

                    let delay = self.config.backoff.delay_for_attempt(failures);
                    tracing::warn!(attempt = failures, ?delay, error = %e, "connection lost, retrying");
                    self.publish(SessionStatus::with_error(SessionState::Disconnected, e));
                    tokio::select! {
                        () = self.cancel.cancelled() => break SessionStatus::new(SessionState::Stopped),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                e => {
                    tracing::error!(error = %e, "sync session failed");
                    break SessionStatus::with_error(SessionState::Failed, e);
                }
            }
        };

        tracing::info!(state = %final_status.state, "sync session ended");
        self.publish(final_status.clone());
        final_status
    }

    fn publish(&self, status: SessionStatus) {
        let previous = self.status.borrow().state;
        if previous != status.state {
            tracing::debug!(from = %previous, to = %status.state, "session state");
        }
        self.status.send_replace(status.clone());
        self.callbacks.notify(&status);
    }

    fn set_state(&self, state: SessionState) {
        if self.status.borrow().state != state {
            self.publish(SessionStatus::new(state));
        }
    }

    /// Runs one connection until it fails. Always returns the reason.
    async fn connect_and_sync(&self, failures: &mut u32) -> SessionError {
        self.set_state(SessionState::Authenticating);
        let mut conn = tokio::select! {
            () = self.cancel.cancelled() => return SessionError::Cancelled,
            conn = self.transport.connect() => match conn {
                Ok(conn) => conn,
                Err(e) => return e,
            },
        };

        if let Err(e) = self.handshake(&mut conn).await {
            return e;
        }
        *failures = 0;
        self.set_state(SessionState::Connected);

        match self.stream(&mut conn).await {
            Ok(never) => match never {},
            Err(e) => e,
        }
    }

    async fn handshake(&self, conn: &mut Connection) -> SessionResult<()> {
        let hello = Hello {
            protocol_version: self.config.protocol_version,
            ..Hello::new(
                self.config.device_id.clone(),
                self.config.credentials.clone(),
                self.db.ack_watermark(),
                self.db.remote_cursor(),
            )
        };
        tracing::debug!(
            resume_cursor = %hello.resume_cursor,
            remote_cursor = hello.remote_cursor,
            "sending hello"
        );
        send(&conn.outbound, &ClientMessage::Hello(hello)).await?;

        // Anything ahead of the reply is dropped; the backlog after Welcome
        // covers it.
        let deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
        loop {
            let reply = tokio::select! {
                () = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                reply = tokio::time::timeout_at(deadline, conn.inbound.recv()) => reply,
            };
            let frame = match reply {
                Err(_) => return Err(SessionError::Timeout),
                Ok(None) => return Err(SessionError::transport("connection closed during handshake")),
                Ok(Some(frame)) => frame,
            };

            match ServerMessage::decode(&frame) {
                Ok(ServerMessage::Welcome { remote_cursor }) => {
                    tracing::info!(remote_cursor, "handshake accepted");
                    return Ok(());
                }
                Ok(ServerMessage::Rejected { reason }) => return Err(SessionError::auth(reason)),
                Ok(other) => tracing::debug!(kind = other.kind(), "ignoring frame before welcome"),
                Err(e) => tracing::debug!(error = %e, "ignoring undecodable frame before welcome"),
            }
        }
    }

    /// Streams in both directions until the connection fails.
    async fn stream(&self, conn: &mut Connection) -> SessionResult<std::convert::Infallible> {
        let wake = Arc::new(Notify::new());
        let waker = Arc::clone(&wake);
        let _subscription = self.db.subscribe(move |event| {
            if event.origin == Origin::Local {
                waker.notify_one();
            }
        });

        let mut cursor = UploadCursor {
            next: self.db.ack_watermark().next(),
            last_sent: SequenceNumber::ZERO,
        };

        loop {
            if self.upload(&conn.outbound, &mut cursor).await? {
                wake.notify_one();
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                () = wake.notified() => {}
                frame = conn.inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame, &cursor).await?,
                    None => return Err(SessionError::transport("connection closed by authority")),
                },
            }
        }
    }

    /// Sends the next batch of local entries. Returns `true` if more are
    /// waiting.
    async fn upload(
        &self,
        outbound: &mpsc::Sender<Vec<u8>>,
        cursor: &mut UploadCursor,
    ) -> SessionResult<bool> {
        let batch = self.config.upload_batch_size;
        let mut read = 0;
        for entry in self.db.replay_from(cursor.next) {
            let entry = entry?;
            if read == batch {
                return Ok(true);
            }
            read += 1;
            cursor.next = entry.sequence.next();

            if entry.origin == Origin::Remote {
                continue;
            }
            let envelopes = envelopes_for_entry(&entry, self.db.store());
            if envelopes.is_empty() {
                tracing::debug!(seq = %entry.sequence, "nothing to upload for entry");
                continue;
            }
            tracing::debug!(seq = %entry.sequence, envelopes = envelopes.len(), "uploading");
            send(
                outbound,
                &ClientMessage::Mutation {
                    seq: entry.sequence,
                    envelopes,
                },
            )
            .await?;
            cursor.last_sent = entry.sequence;
        }

        // Nothing in flight: entries scanned without sending need no ack.
        if cursor.last_sent <= self.db.ack_watermark() {
            self.acknowledge(cursor.scanned()).await?;
        }
        Ok(false)
    }

    async fn handle_frame(&self, frame: &[u8], cursor: &UploadCursor) -> SessionResult<()> {
        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.report_malformed(SessionError::malformed(e.to_string()));
                return Ok(());
            }
        };

        match message {
            ServerMessage::Ack { up_to } => {
                tracing::debug!(%up_to, "ack");
                self.acknowledge(up_to.min(cursor.scanned())).await?;
                if up_to >= cursor.last_sent {
                    self.acknowledge(cursor.scanned()).await?;
                }
                Ok(())
            }
            ServerMessage::Mutation {
                remote_seq,
                after,
                envelope,
            } => self.ingest(remote_seq, after, envelope),
            other => {
                self.report_malformed(SessionError::malformed(format!(
                    "unexpected {} while connected",
                    other.kind()
                )));
                Ok(())
            }
        }
    }

    fn ingest(&self, remote_seq: u64, after: u64, envelope: Envelope) -> SessionResult<()> {
        let cursor = self.db.remote_cursor();
        if remote_seq <= cursor {
            tracing::debug!(remote_seq, "skipping already ingested remote mutation");
            return Ok(());
        }
        if after > cursor {
            tracing::warn!(remote_seq, after, cursor, "gap in remote stream, resyncing");
            return Err(SessionError::StreamGap { cursor, after });
        }

        self.set_state(SessionState::Reconciling);
        let id = envelope.id.clone();
        let result = envelope
            .into_mutation(self.db.store())
            .map_err(|e| SessionError::malformed(e.to_string()))
            .and_then(|mutation| match self.db.ingest_remote(mutation) {
                Ok(seq) => Ok(seq),
                Err(CoreError::MalformedMutation { message }) => Err(SessionError::malformed(message)),
                Err(e) => Err(SessionError::Core(e)),
            });

        match result {
            Ok(seq) => tracing::debug!(remote_seq, %seq, %id, "ingested remote mutation"),
            Err(e @ SessionError::MalformedMutation { .. }) => self.report_malformed(e),
            Err(e) => return Err(e),
        }
        self.db.set_remote_cursor(remote_seq)?;
        self.set_state(SessionState::Connected);
        Ok(())
    }

    fn report_malformed(&self, error: SessionError) {
        tracing::warn!(error = %error, "rejected remote data");
        let state = self.status.borrow().state;
        self.publish(SessionStatus::with_error(state, error));
    }

    async fn acknowledge(&self, up_to: SequenceNumber) -> SessionResult<()> {
        if !self.db.acknowledge(up_to)? {
            return Ok(());
        }
        let Some(threshold) = self.config.compact_threshold else {
            return Ok(());
        };
        if self.db.compactable_entries() < threshold {
            return Ok(());
        }

        // Compaction rewrites files; keep it off the async workers.
        let db = Arc::clone(&self.db);
        match tokio::task::spawn_blocking(move || db.compact()).await {
            Ok(Ok(dropped)) => tracing::info!(dropped, "compacted acknowledged entries"),
            Ok(Err(e)) => tracing::warn!(error = %e, "compaction failed, entries kept"),
            Err(e) => tracing::warn!(error = %e, "compaction task failed"),
        }
        Ok(())
    }
}

async fn send(outbound: &mpsc::Sender<Vec<u8>>, message: &ClientMessage) -> SessionResult<()> {
    let frame = message.encode()?;
    outbound
        .send(frame)
        .await
        .map_err(|_| SessionError::transport("connection closed"))
}
