//! Subcommand bodies.

use anyhow::{ensure, Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use collabshare::core::conversation::parse_messages;
use collabshare::core::session::{FileSessionStore, SessionStore, WebSocketConnector};
use collabshare::utils::data_dir;
use collabshare::utils::sos::SignalOfStop;
use collabshare::{
    CollabGate, ExportDescriptor, MemoryPeer, SendOptions, SessionManager, SessionSnapshot,
    TransferManager,
};

use crate::args::Settings;

const LOOPBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Mount the session and follow it until Ctrl+C.
///
/// Peer connections are negotiated by the host application over the relay
/// channel, so this command only observes the session and the collab gate.
pub async fn run(
    settings: &Settings,
    invite: Option<String>,
    join: Option<String>,
    sos: SignalOfStop,
) -> Result<()> {
    let store = Arc::new(FileSessionStore::in_dir(data_dir::get()?)?);
    let config = settings.session_config(invite);
    let connector = Arc::new(WebSocketConnector::new());
    let session = SessionManager::mount(connector, store, config);
    if let Some(address) = join {
        session.join(address);
    }

    let gate = CollabGate::spawn(session.watch(), settings.transfer_config(None));
    let mut snapshots = session.watch();
    let mut managers = gate.watch();
    let mut relays = session.relay_messages();

    let mut probe = tokio::time::interval(settings.online_probe());
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    probe.tick().await;

    print_snapshot(&snapshots.borrow_and_update());
    loop {
        tokio::select! {
            _ = sos.wait() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                print_snapshot(&snapshots.borrow_and_update());
            }
            changed = managers.changed() => {
                if changed.is_err() {
                    break;
                }
                let ready = managers.borrow_and_update().is_some();
                println!("transfer manager {}", if ready { "ready" } else { "disposed" });
            }
            relay = relays.recv() => match relay {
                Ok(message) => {
                    let kind = message
                        .get("type")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("untyped");
                    debug!(event = "signaling_relay", kind);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(event = "signaling_relay_lagged", skipped = n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = probe.tick() => {
                if session.notify_online() {
                    info!(event = "session_probe_reconnect");
                }
            }
        }
    }

    drop(gate);
    info!(event = "run_stopped");
    Ok(())
}

fn print_snapshot(snap: &SessionSnapshot) {
    let role = snap.role.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
    println!(
        "{:?} address={} user={} task={} role={} participants={} collab={}",
        snap.state,
        snap.address.as_deref().unwrap_or("-"),
        snap.user_id.as_deref().unwrap_or("-"),
        snap.task_id.as_deref().unwrap_or("-"),
        role,
        snap.participants.len(),
        snap.is_collab_mode(),
    );
    if let Some(err) = &snap.last_error {
        println!("  last error: {err}");
    }
}

/// Drop the persisted session address.
pub fn leave(settings: &Settings) -> Result<()> {
    let store = FileSessionStore::in_dir(data_dir::get()?)?;
    let key = settings.session_config(None).storage_key;
    let had = store.get(&key).is_some();
    store.remove(&key)?;
    if had {
        println!("session forgotten ({})", store.path().display());
    } else {
        println!("no persisted session");
    }
    Ok(())
}

/// Push a conversation file through two linked managers and check that the
/// receiver sees exactly what was sent.
pub async fn loopback(
    settings: &Settings,
    file: &Path,
    chunk_size: Option<usize>,
    sos: SignalOfStop,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let messages = parse_messages(&text)
        .with_context(|| format!("{} is not a JSON array of messages", file.display()))?;

    let config = settings.transfer_config(chunk_size);
    let sender = TransferManager::new(config.clone());
    let receiver = TransferManager::new(config);
    let (a, b) = MemoryPeer::pair();
    sender.add_peer("receiver", a);
    receiver.add_peer("sender", b);

    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let _sub = receiver.on_receive_conversation(move |msgs, meta| {
        if let Some(tx) = tx.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send((msgs.to_vec(), meta.clone()));
        }
    });

    let descriptor = ExportDescriptor::now("collabshare-cli", file.display().to_string());
    let options = SendOptions::new().on_progress(|sent, total| {
        debug!(event = "loopback_progress", sent, total);
    });
    let send = sender.send_conversation("receiver", &messages, descriptor, options);
    let export_id = sos.select(send).await.context("interrupted")??;

    let (received, meta) = sos
        .select(tokio::time::timeout(LOOPBACK_TIMEOUT, rx))
        .await
        .context("interrupted")?
        .context("timed out waiting for the receiver")?
        .context("receiver dropped the export")?;

    ensure!(meta.export_id == export_id, "export id mismatch");
    ensure!(received == messages, "received conversation differs from the input");
    println!(
        "ok: {} messages, {} bytes -> {} compressed in {} chunks ({})",
        received.len(),
        meta.total_bytes,
        meta.compressed_bytes,
        meta.total_chunks,
        export_id
    );
    Ok(())
}
