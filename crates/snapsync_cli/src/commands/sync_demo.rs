//! Sync demo command implementation.

use super::open_existing;
use snapsync_core::Database;
use snapsync_protocol::Credentials;
use snapsync_session::{LoopbackAuthority, SessionConfig, SessionState, SyncSession};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEMO_USER: &str = "demo";
const DEMO_PASSWORD: &str = "demo";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of one demo run.
#[derive(Debug)]
pub struct DemoReport {
    /// Entries the authority holds after the run.
    pub authority_entries: usize,
    /// Acknowledged watermark of the local database.
    pub ack_watermark: u64,
    /// Last local sequence number.
    pub last_sequence: u64,
    /// Records the in-memory peer device ended up with.
    pub peer_records: usize,
    /// Final state of the local session.
    pub final_state: SessionState,
}

/// Syncs `db` and an empty in-memory peer through an in-process authority
/// until every local entry is acknowledged and the peer has caught up.
pub fn sync_until_acknowledged(
    db: Arc<Database>,
    timeout: Duration,
) -> Result<DemoReport, Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_demo(db, timeout))
}

async fn run_demo(
    db: Arc<Database>,
    timeout: Duration,
) -> Result<DemoReport, Box<dyn std::error::Error>> {
    let authority = LoopbackAuthority::new().with_account(DEMO_USER, DEMO_PASSWORD);
    let credentials = Credentials::new(DEMO_USER, DEMO_PASSWORD);
    let peer = Arc::new(Database::open_in_memory()?);

    let local = SyncSession::new(
        Arc::clone(&db),
        authority.transport(),
        SessionConfig::new("cli", credentials.clone()),
    )
    .on_status(|status| tracing::info!(state = %status.state, "local session"))
    .start();
    let remote = SyncSession::new(
        Arc::clone(&peer),
        authority.transport(),
        SessionConfig::new("peer", credentials),
    )
    .start();

    let done = || {
        let target = db.log().last_sequence();
        db.ack_watermark() >= target
            && peer.remote_cursor() >= authority.entries().len() as u64
    };
    let waited = tokio::time::timeout(timeout, async {
        while !done() {
            if local.state().is_terminal() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    let status = local.stop().await;
    remote.stop().await;
    if let Some(error) = status.error {
        return Err(format!("sync session failed: {error}").into());
    }
    if waited.is_err() {
        return Err(format!("sync did not finish within {timeout:?}").into());
    }

    let stats = db.stats()?;
    Ok(DemoReport {
        authority_entries: authority.entries().len(),
        ack_watermark: stats.ack_watermark,
        last_sequence: stats.last_sequence,
        peer_records: peer.stats()?.live_records,
        final_state: status.state,
    })
}

/// Runs the sync-demo command.
pub fn run(path: &Path, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(open_existing(path)?);
    let pending = db.pending_upload().count();
    println!("Syncing {} ({pending} pending entries)", path.display());
    println!();

    let report = sync_until_acknowledged(db, timeout)?;

    println!("Sync complete:");
    println!("  Authority entries: {}", report.authority_entries);
    println!(
        "  Ack watermark:     {} of {}",
        report.ack_watermark, report.last_sequence
    );
    println!("  Peer records:      {}", report.peer_records);
    println!("  Session state:     {}", report.final_state);
    Ok(())
}
