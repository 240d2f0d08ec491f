//! Collaboration gate: the join point between session and transfer layers.
//!
//! A [`TransferManager`] exists exactly while the session is in collab mode
//! (connected, bound to a task, no local connection). Entering collab mode
//! creates a fresh manager; leaving it disposes the manager, which aborts
//! every in-flight transfer and unwires every peer.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::session::SessionSnapshot;
use crate::core::transfer::{TransferConfig, TransferManager};

pub struct CollabGate {
    current: watch::Receiver<Option<Arc<TransferManager>>>,
    task: JoinHandle<()>,
}

impl CollabGate {
    /// Follow `session` until it is dropped. Must be called inside a Tokio
    /// runtime.
    pub fn spawn(session: watch::Receiver<SessionSnapshot>, config: TransferConfig) -> Self {
        let (tx, current) = watch::channel(None);
        let task = tokio::spawn(follow(session, config, tx));
        Self { current, task }
    }

    /// The live manager, if the session is in collab mode.
    pub fn transfer_manager(&self) -> Option<Arc<TransferManager>> {
        self.current.borrow().clone()
    }

    /// Observe manager creation and disposal.
    pub fn watch(&self) -> watch::Receiver<Option<Arc<TransferManager>>> {
        self.current.clone()
    }
}

impl Drop for CollabGate {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(mgr) = self.current.borrow().as_ref() {
            mgr.dispose();
        }
    }
}

async fn follow(
    mut session: watch::Receiver<SessionSnapshot>,
    config: TransferConfig,
    tx: watch::Sender<Option<Arc<TransferManager>>>,
) {
    loop {
        let (collab, task_id) = {
            let snap = session.borrow_and_update();
            (snap.is_collab_mode(), snap.task_id.clone())
        };
        tx.send_if_modified(|current| match (collab, current.is_some()) {
            (true, false) => {
                info!(event = "collab_mode_entered", task_id = task_id.as_deref());
                *current = Some(Arc::new(TransferManager::new(config.clone())));
                true
            }
            (false, true) => {
                info!(event = "collab_mode_left");
                if let Some(mgr) = current.take() {
                    mgr.dispose();
                }
                true
            }
            _ => false,
        });
        if session.changed().await.is_err() {
            break;
        }
    }
    tx.send_modify(|current| {
        if let Some(mgr) = current.take() {
            mgr.dispose();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::test_support::*;
    use crate::core::session::{MemorySessionStore, SessionManager};

    async fn wait_manager(gate: &CollabGate, present: bool) -> Option<Arc<TransferManager>> {
        let mut rx = gate.watch();
        let current = tokio::time::timeout(std::time::Duration::from_secs(5), rx.wait_for(|m| m.is_some() == present))
            .await
            .expect("timed out waiting for collab gate")
            .expect("gate stopped")
            .clone();
        current
    }

    #[tokio::test]
    async fn test_manager_follows_collab_mode() {
        let connector = ScriptedConnector::new();
        let store = Arc::new(MemorySessionStore::new());
        let session = SessionManager::mount(connector.clone(), store, fast_config());
        let gate = CollabGate::spawn(session.watch(), TransferConfig::default());
        assert!(gate.transfer_manager().is_none());

        let remote = connector.expect_link();
        session.join("ws://signal/room");
        remote.push(authenticated("A", Some("task-1")));
        let first = wait_manager(&gate, true).await.unwrap();
        assert!(!first.is_disposed());

        session.set_local_connection(true);
        wait_manager(&gate, false).await;
        assert!(first.is_disposed());

        session.set_local_connection(false);
        let second = wait_manager(&gate, true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        session.leave();
        wait_manager(&gate, false).await;
        assert!(second.is_disposed());
    }

    #[tokio::test]
    async fn test_no_manager_without_task() {
        let connector = ScriptedConnector::new();
        let store = Arc::new(MemorySessionStore::new());
        let session = SessionManager::mount(connector.clone(), store, fast_config());
        let gate = CollabGate::spawn(session.watch(), TransferConfig::default());
        let remote = connector.expect_link();
        let mut rx = session.watch();

        session.join("ws://signal/room");
        remote.push(authenticated("A", None));
        wait_for(&mut rx, |s| s.user_id.is_some()).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(gate.transfer_manager().is_none());
    }

    #[tokio::test]
    async fn test_dropping_gate_disposes_manager() {
        let connector = ScriptedConnector::new();
        let store = Arc::new(MemorySessionStore::new());
        let session = SessionManager::mount(connector.clone(), store, fast_config());
        let gate = CollabGate::spawn(session.watch(), TransferConfig::default());
        let remote = connector.expect_link();

        session.join("ws://signal/room");
        remote.push(authenticated("A", Some("task-1")));
        let mgr = wait_manager(&gate, true).await.unwrap();
        drop(gate);
        assert!(mgr.is_disposed());
    }
}
