//! Sync session against the loopback authority.

use async_trait::async_trait;
use parking_lot::Mutex;
use snapsync_core::{fields, Database, Record, RecordId, SequenceNumber, Version};
use snapsync_protocol::{Credentials, Envelope, ServerMessage};
use snapsync_session::{
    BackoffConfig, Connection, LoopbackAuthority, RemoteTransport, SessionConfig, SessionError,
    SessionHandle, SessionResult, SessionState, SessionStatus, SyncSession,
};
use std::sync::Arc;
use std::time::Duration;

const USER: &str = "ada";
const PASSWORD: &str = "secret";

fn authority() -> LoopbackAuthority {
    LoopbackAuthority::new().with_account(USER, PASSWORD)
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig::new()
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50))
}

fn config(device: &str) -> SessionConfig {
    SessionConfig::new(device, Credentials::new(USER, PASSWORD)).with_backoff(fast_backoff())
}

fn photo(id: &str, text: &str) -> Record {
    Record::new(id, fields([("text", text.into())]))
}

fn recorder() -> (
    Arc<Mutex<Vec<SessionStatus>>>,
    impl Fn(&SessionStatus) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |status: &SessionStatus| sink.lock().push(status.clone()))
}

fn start(db: &Arc<Database>, authority: &LoopbackAuthority, config: SessionConfig) -> SessionHandle {
    SyncSession::new(Arc::clone(db), authority.transport(), config).start()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn uploads_pending_entries_and_advances_watermark() {
    let authority = authority();
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.submit_record("photos", photo("p1", "Cat")).unwrap();
    db.submit_record("photos", photo("p2", "Dog")).unwrap();

    let handle = start(&db, &authority, config("device-a"));
    eventually("initial upload", || db.ack_watermark() == SequenceNumber::new(2)).await;

    db.submit_record("photos", photo("p3", "Owl")).unwrap();
    eventually("live upload", || db.ack_watermark() == SequenceNumber::new(3)).await;

    let entries = authority.entries();
    assert_eq!(entries.len(), 3);
    assert!(entries
        .iter()
        .all(|e| e.envelope.collection.as_ref().map(|c| c.as_str()) == Some("photos")));
    assert_eq!(handle.state(), SessionState::Connected);

    let status = handle.stop().await;
    assert_eq!(status.state, SessionState::Stopped);
}

#[tokio::test]
async fn transport_error_resumes_from_watermark() {
    let authority = authority();
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.submit_record("photos", photo("p1", "Cat")).unwrap();
    db.submit_record("photos", photo("p2", "Dog")).unwrap();

    let (seen, callback) = recorder();
    let handle = SyncSession::new(Arc::clone(&db), authority.transport(), config("device-a"))
        .on_status(callback)
        .start();
    eventually("first acks", || db.ack_watermark() == SequenceNumber::new(2)).await;

    authority.drop_connections();
    eventually("disconnect reported", || {
        seen.lock().iter().any(|s| {
            s.state == SessionState::Disconnected
                && matches!(s.error.as_deref(), Some(SessionError::Transport { .. }))
        })
    })
    .await;

    db.submit_record("photos", photo("p3", "Owl")).unwrap();
    eventually("resumed upload", || db.ack_watermark() == SequenceNumber::new(3)).await;

    assert_eq!(
        authority.received_from("device-a"),
        vec![
            SequenceNumber::new(1),
            SequenceNumber::new(2),
            SequenceNumber::new(3)
        ]
    );
    assert!(seen.lock().iter().all(|s| s.user_message().is_none()));
    handle.stop().await;
}

#[tokio::test]
async fn auth_failure_signs_out_without_retry() {
    let authority = authority();
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.submit_record("photos", photo("p1", "Cat")).unwrap();

    let (seen, callback) = recorder();
    let config = SessionConfig::new("device-a", Credentials::new(USER, "wrong"))
        .with_backoff(fast_backoff());
    let status = SyncSession::new(Arc::clone(&db), authority.transport(), config)
        .on_status(callback)
        .start()
        .join()
        .await;

    assert_eq!(status.state, SessionState::SignedOut);
    assert!(matches!(status.error.as_deref(), Some(SessionError::Auth { .. })));
    assert_eq!(
        status.user_message(),
        Some("signed out, please re-authenticate")
    );
    assert_eq!(
        seen.lock().last().map(|s| s.state),
        Some(SessionState::SignedOut)
    );
    assert_eq!(
        seen.lock()
            .iter()
            .filter(|s| s.state == SessionState::Authenticating)
            .count(),
        1
    );
    assert_eq!(db.pending_upload().count(), 1);
    assert!(authority.entries().is_empty());
}

#[tokio::test]
async fn malformed_remote_data_is_skipped() {
    let authority = authority();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let (seen, callback) = recorder();
    let handle = SyncSession::new(Arc::clone(&db), authority.transport(), config("device-a"))
        .on_status(callback)
        .start();
    handle.wait_for(SessionState::Connected).await;
    eventually("admitted", || authority.connection_count() == 1).await;

    assert_eq!(authority.inject_frame("device-a", vec![0xff, 0x01]).await, 1);
    authority
        .publish(Envelope {
            id: RecordId::from(""),
            version: Version::INITIAL,
            fields: fields([("text", "ghost".into())]),
            deleted: false,
            collection: None,
        })
        .await;
    authority
        .publish(Envelope {
            collection: Some("photos".into()),
            ..Envelope::from_record(&photo("p9", "Heron"))
        })
        .await;

    eventually("valid record ingested", || db.get(&RecordId::from("p9")).is_some()).await;
    let malformed = seen
        .lock()
        .iter()
        .filter(|s| matches!(s.error.as_deref(), Some(SessionError::MalformedMutation { .. })))
        .count();
    assert_eq!(malformed, 2);
    assert!(handle.state().is_online());
    assert_eq!(db.current_items("photos").len(), 1);
    assert_eq!(db.remote_cursor(), 2);
    handle.stop().await;
}

#[tokio::test]
async fn cancellation_keeps_pending_entries() {
    let authority = authority();
    authority.set_online(false);
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.submit_record("photos", photo("p1", "Cat")).unwrap();

    let handle = start(&db, &authority, config("device-a"));
    let status = handle.wait_for(SessionState::Disconnected).await;
    assert!(!status.state.is_terminal());

    let status = handle.stop().await;
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(db.ack_watermark(), SequenceNumber::ZERO);
    assert_eq!(db.pending_upload().count(), 1);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails() {
    let authority = authority();
    authority.set_online(false);
    let db = Arc::new(Database::open_in_memory().unwrap());

    let config = config("device-a").with_backoff(fast_backoff().with_max_attempts(3));
    let status = start(&db, &authority, config).join().await;

    assert_eq!(status.state, SessionState::Failed);
    assert!(matches!(
        status.error.as_deref(),
        Some(SessionError::RetryBudgetExhausted { attempts: 3, .. })
    ));
    assert_eq!(status.user_message(), None);
}

struct SilentTransport {
    held: Mutex<Vec<Connection>>,
}

#[async_trait]
impl RemoteTransport for SilentTransport {
    async fn connect(&self) -> SessionResult<Connection> {
        let (client, server) = Connection::pair(8);
        self.held.lock().push(server);
        Ok(client)
    }
}

#[tokio::test]
async fn handshake_timeout_is_retried() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let transport = SilentTransport {
        held: Mutex::new(Vec::new()),
    };
    let config = config("device-a")
        .with_handshake_timeout(Duration::from_millis(20))
        .with_backoff(fast_backoff().with_max_attempts(2));

    let status = SyncSession::new(db, transport, config).start().join().await;
    match status.error.as_deref() {
        Some(SessionError::RetryBudgetExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(*attempts, 2);
            assert_eq!(last_error, "handshake timed out");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn two_devices_converge() {
    let authority = authority();
    let a = Arc::new(Database::open_in_memory().unwrap());
    let b = Arc::new(Database::open_in_memory().unwrap());
    let session_a = start(&a, &authority, config("device-a"));
    let session_b = start(&b, &authority, config("device-b"));

    a.submit_record("photos", photo("p1", "Cat")).unwrap();
    let id = RecordId::from("p1");
    eventually("fan-out to b", || b.current_items("photos").len() == 1).await;
    assert_eq!(b.get(&id).unwrap().text("text"), Some("Cat"));

    b.update(&id, fields([("text", "Dog".into())])).unwrap();
    eventually("update reaches a", || {
        a.get(&id).and_then(|r| r.text("text").map(str::to_owned)) == Some("Dog".to_owned())
    })
    .await;
    assert_eq!(a.get(&id).unwrap().version, Version::new(2));
    assert_eq!(b.get(&id).unwrap().version, Version::new(2));

    eventually("both acknowledged", || {
        a.ack_watermark() == a.log().last_sequence() && b.ack_watermark() == b.log().last_sequence()
    })
    .await;

    session_a.stop().await;
    session_b.stop().await;
}

#[tokio::test]
async fn late_device_catches_up_from_backlog() {
    let authority = authority();
    let a = Arc::new(Database::open_in_memory().unwrap());
    let session_a = start(&a, &authority, config("device-a"));
    a.submit_record("photos", photo("p1", "Cat")).unwrap();
    a.submit_record("photos", photo("p2", "Dog")).unwrap();
    eventually("a acknowledged", || a.ack_watermark() == SequenceNumber::new(2)).await;

    let b = Arc::new(Database::open_in_memory().unwrap());
    let session_b = start(&b, &authority, config("device-b"));
    eventually("b caught up", || b.current_items("photos").len() == 2).await;

    let items: Vec<_> = b
        .current_items("photos")
        .iter()
        .map(|r| r.id.to_string())
        .collect();
    assert_eq!(items, vec!["p1", "p2"]);
    assert_eq!(b.remote_cursor(), 2);

    session_a.stop().await;
    session_b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_during_live_traffic_misses_nothing() {
    const RECORDS: usize = 100;

    for delay_ms in [0u64, 3, 15] {
        let authority = authority();
        let a = Arc::new(Database::open_in_memory().unwrap());
        let session_a = start(&a, &authority, config("device-a"));

        let writer = {
            let a = Arc::clone(&a);
            tokio::task::spawn_blocking(move || {
                for i in 0..RECORDS {
                    a.submit_record("photos", photo(&format!("p{i}"), "Cat")).unwrap();
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let b = Arc::new(Database::open_in_memory().unwrap());
        let session_b = start(&b, &authority, config("device-b"));
        writer.await.unwrap();

        eventually("b holds every record", || {
            b.current_items("photos").len() == RECORDS
        })
        .await;
        eventually("authority holds every record", || {
            authority.entries().len() == RECORDS
        })
        .await;
        assert_eq!(b.remote_cursor(), RECORDS as u64);
        assert!(session_b.state().is_online());

        session_a.stop().await;
        session_b.stop().await;
    }
}

#[tokio::test]
async fn gap_in_remote_stream_forces_a_resync() {
    let authority = authority();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let (seen, callback) = recorder();
    let handle = SyncSession::new(Arc::clone(&db), authority.transport(), config("device-a"))
        .on_status(callback)
        .start();
    handle.wait_for(SessionState::Connected).await;
    eventually("admitted", || authority.connection_count() == 1).await;

    let skipped_ahead = ServerMessage::Mutation {
        remote_seq: 5,
        after: 4,
        envelope: Envelope {
            collection: Some("photos".into()),
            ..Envelope::from_record(&photo("p5", "Stray"))
        },
    };
    assert_eq!(
        authority
            .inject_frame("device-a", skipped_ahead.encode().unwrap())
            .await,
        1
    );

    eventually("gap reported", || {
        seen.lock().iter().any(|s| {
            s.state == SessionState::Disconnected
                && matches!(
                    s.error.as_deref(),
                    Some(SessionError::StreamGap { cursor: 0, after: 4 })
                )
        })
    })
    .await;
    eventually("reconnected", || {
        handle.state() == SessionState::Connected && authority.connection_count() == 1
    })
    .await;

    assert_eq!(db.remote_cursor(), 0);
    assert!(db.get(&RecordId::from("p5")).is_none());

    authority
        .publish(Envelope {
            collection: Some("photos".into()),
            ..Envelope::from_record(&photo("p1", "Cat"))
        })
        .await;
    eventually("stream resumes", || db.remote_cursor() == 1).await;
    handle.stop().await;
}

/// Answers every handshake with a stray mutation ahead of the welcome.
struct EagerTransport {
    held: Mutex<Vec<Connection>>,
}

#[async_trait]
impl RemoteTransport for EagerTransport {
    async fn connect(&self) -> SessionResult<Connection> {
        let (client, server) = Connection::pair(8);
        let stray = ServerMessage::Mutation {
            remote_seq: 1,
            after: 0,
            envelope: Envelope::from_record(&photo("p1", "Early")),
        };
        for message in [stray, ServerMessage::Welcome { remote_cursor: 1 }] {
            server
                .outbound
                .try_send(message.encode().unwrap())
                .unwrap();
        }
        self.held.lock().push(server);
        Ok(client)
    }
}

#[tokio::test]
async fn frames_ahead_of_welcome_are_ignored() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let transport = EagerTransport {
        held: Mutex::new(Vec::new()),
    };
    let (seen, callback) = recorder();
    let handle = SyncSession::new(Arc::clone(&db), transport, config("device-a"))
        .on_status(callback)
        .start();

    let status = handle.wait_for(SessionState::Connected).await;
    assert_eq!(status.state, SessionState::Connected);
    assert!(seen.lock().iter().all(|s| s.error.is_none()));
    assert_eq!(db.remote_cursor(), 0);
    assert!(db.get(&RecordId::from("p1")).is_none());

    let status = handle.stop().await;
    assert_eq!(status.state, SessionState::Stopped);
}

#[tokio::test]
async fn acknowledged_entries_are_compacted() {
    let authority = authority();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let handle = start(&db, &authority, config("device-a").with_compact_threshold(2));

    for (id, text) in [("p1", "Cat"), ("p2", "Dog"), ("p3", "Owl")] {
        db.submit_record("photos", photo(id, text)).unwrap();
    }
    eventually("all acknowledged", || db.ack_watermark() == SequenceNumber::new(3)).await;
    eventually("compacted", || db.stats().unwrap().last_compacted >= 2).await;

    assert_eq!(db.current_items("photos").len(), 3);
    assert!(db.log().entry_count() < 3);
    handle.stop().await;
}

#[tokio::test]
async fn watermark_survives_reopen_and_nothing_is_resent() {
    let authority = authority();
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Arc::new(Database::open(dir.path(), snapsync_core::Config::default()).unwrap());
        db.submit_record("photos", photo("p1", "Cat")).unwrap();
        let handle = start(&db, &authority, config("device-a"));
        eventually("first upload", || db.ack_watermark() == SequenceNumber::new(1)).await;
        handle.stop().await;
    }

    let db = Arc::new(Database::open(dir.path(), snapsync_core::Config::default()).unwrap());
    assert_eq!(db.ack_watermark(), SequenceNumber::new(1));
    assert_eq!(db.pending_upload().count(), 0);

    db.submit_record("photos", photo("p2", "Dog")).unwrap();
    let handle = start(&db, &authority, config("device-a"));
    eventually("second upload", || db.ack_watermark() == SequenceNumber::new(2)).await;
    handle.stop().await;

    assert_eq!(
        authority.received_from("device-a"),
        vec![SequenceNumber::new(1), SequenceNumber::new(2)]
    );
}
