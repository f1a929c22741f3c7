//! Primary-side sync: publishes committed state and applies companion edits.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::channel::{ChannelStatus, SyncChannel};
use super::message::{AddToken, DeltaOp, Envelope, SyncMessage};
use super::SyncError;
use crate::diff::{DiffEngine, PlanLimits, SyncPlan};
use crate::domain::{DomainError, Mutation, TallyId};
use crate::repository::EntityStore;
use crate::snapshot::{Snapshot, SnapshotBuilder, TallyValue};

/// Where outgoing messages go. `SyncChannel` in production.
pub trait Outbox: Send + Sync {
    fn send(&self, message: SyncMessage) -> Result<(), SyncError>;
}

impl Outbox for SyncChannel {
    fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        SyncChannel::send(self, message)
    }
}

pub struct PrimarySync {
    store: Arc<EntityStore>,
    outbox: Arc<dyn Outbox>,
    limits: PlanLimits,
    /// What the companion was last told
    last_sent: Option<Snapshot>,
    /// Companion adds staged here but not yet confirmed back
    unconfirmed: Vec<(AddToken, TallyId)>,
}

impl PrimarySync {
    pub fn new(store: Arc<EntityStore>, outbox: Arc<dyn Outbox>, limits: PlanLimits) -> Self {
        Self {
            store,
            outbox,
            limits,
            last_sent: None,
            unconfirmed: Vec::new(),
        }
    }

    pub fn last_sent(&self) -> Option<&Snapshot> {
        self.last_sent.as_ref()
    }

    /// Send whatever committed state the companion has not seen yet.
    pub async fn publish(&mut self) -> Result<SyncPlan, SyncError> {
        self.send_confirmations().await?;
        let current = SnapshotBuilder::capture(&self.store).await;
        let plan = match &self.last_sent {
            Some(previous) => DiffEngine::plan(previous, &current, self.limits),
            None => SyncPlan::FullSnapshot,
        };

        match &plan {
            SyncPlan::UpToDate => return Ok(plan),
            SyncPlan::Delta(ops) => self.outbox.send(SyncMessage::Delta(ops.clone()))?,
            SyncPlan::FullSnapshot => self.outbox.send(SyncMessage::FullSnapshot(current.clone()))?,
        }
        log::debug!("Published {} for {} tallies", plan_label(&plan), current.len());
        self.last_sent = Some(current);
        Ok(plan)
    }

    /// Unconditionally send the full committed state.
    pub async fn resync_full(&mut self) -> Result<(), SyncError> {
        self.send_confirmations().await?;
        let current = SnapshotBuilder::capture(&self.store).await;
        self.outbox.send(SyncMessage::FullSnapshot(current.clone()))?;
        self.last_sent = Some(current);
        Ok(())
    }

    /// A fresh link knows nothing about what was sent before it.
    pub async fn on_reachable(&mut self) -> Result<(), SyncError> {
        log::info!("Companion reachable, sending full snapshot");
        self.resync_full().await
    }

    /// Handle one message from the companion.
    pub async fn apply_inbound(&mut self, envelope: Envelope) -> Result<(), SyncError> {
        match envelope.message {
            SyncMessage::ResyncRequest => {
                log::info!("Companion {} asked for resync", envelope.origin);
                self.resync_full().await
            }
            SyncMessage::FullSnapshot(_) => {
                log::warn!("Ignoring snapshot from companion {}: primary state wins", envelope.origin);
                Ok(())
            }
            SyncMessage::Delta(ops) => self.apply_delta(ops).await,
        }
    }

    async fn apply_delta(&mut self, ops: Vec<DeltaOp>) -> Result<(), SyncError> {
        for op in ops {
            let result = match op {
                DeltaOp::AdjustBy { id, by } => self.stage(id, Mutation::AdjustBy { by }).await,
                DeltaOp::Rename { id, title } => self.stage(id, Mutation::Rename { title }).await,
                DeltaOp::SetCollapsed { id, collapsed } => self.stage(id, Mutation::SetCollapsed { collapsed }).await,
                DeltaOp::SetColor { id, color_index } => self.stage(id, Mutation::SetColor { color_index }).await,
                DeltaOp::Remove { id } => self.stage(id, Mutation::Delete).await,
                DeltaOp::Add {
                    token,
                    title,
                    color_index,
                } => {
                    let record = self.store.create(title, color_index).await?;
                    self.unconfirmed.push((token, record.id));
                    Ok(())
                }
                DeltaOp::Reorder { order } => {
                    for (position, id) in order.into_iter().enumerate() {
                        match self.store.move_to(id, position).await {
                            Ok(()) => {}
                            Err(DomainError::RecordNotFound(_)) | Err(DomainError::InvalidInput(_)) => {
                                log::warn!("Skipping stale reorder entry {}", id);
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Ok(())
                }
                DeltaOp::Confirmed { .. } => {
                    log::warn!("Ignoring confirmation sent by companion");
                    Ok(())
                }
            };
            result?;
        }

        self.commit_with_retry().await?;
        self.publish().await?;
        Ok(())
    }

    /// Confirm companion adds whose records are committed by now. An add
    /// still pending keeps waiting; one the host discarded is forgotten.
    async fn send_confirmations(&mut self) -> Result<(), SyncError> {
        if self.unconfirmed.is_empty() {
            return Ok(());
        }

        let has_pending = self.store.has_pending().await;
        let mut confirmations = Vec::new();
        for (token, id) in std::mem::take(&mut self.unconfirmed) {
            match self.store.fetch(id).await {
                Ok(record) => confirmations.push(DeltaOp::Confirmed {
                    token,
                    value: TallyValue::from(&record),
                }),
                Err(_) if has_pending => self.unconfirmed.push((token, id)),
                Err(_) => log::warn!("Companion add {} was never committed, dropping it", id),
            }
        }

        if !confirmations.is_empty() {
            self.outbox.send(SyncMessage::Delta(confirmations))?;
        }
        Ok(())
    }

    /// Stale ids are the companion's problem; the next publish corrects it.
    async fn stage(&self, id: TallyId, mutation: Mutation) -> Result<(), DomainError> {
        match self.store.mutate(id, mutation).await {
            Ok(_) => Ok(()),
            Err(DomainError::RecordNotFound(_)) => {
                log::warn!("Companion edit for unknown tally {}, ignoring", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn commit_with_retry(&mut self) -> Result<(), SyncError> {
        match self.store.commit().await {
            Ok(_) => Ok(()),
            Err(first) => {
                log::warn!("Commit of companion edits failed, retrying: {}", first);
                if let Err(second) = self.store.commit().await {
                    // Staged edits stay for the host's next commit; the
                    // companion is reset to what is durable now
                    log::error!("Companion edits left uncommitted: {}", second);
                    self.resync_full().await?;
                    return Err(second.into());
                }
                Ok(())
            }
        }
    }

    /// Serve the channel until its inbound side closes. Each `()` on
    /// `local_changes` means the host committed something worth publishing.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut status: watch::Receiver<ChannelStatus>,
        mut local_changes: mpsc::UnboundedReceiver<()>,
    ) {
        let mut was_reachable = status.borrow().state.is_reachable();
        loop {
            tokio::select! {
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(e) = self.apply_inbound(envelope).await {
                        log::warn!("Companion message not applied: {}", e);
                    }
                }
                Some(()) = local_changes.recv() => {
                    if let Err(e) = self.publish().await {
                        log::warn!("Local change not published: {}", e);
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    let reachable = current.state.is_reachable();
                    let result = if (reachable && !was_reachable) || current.overflowed {
                        self.on_reachable().await
                    } else {
                        Ok(())
                    };
                    was_reachable = reachable;
                    if let Err(e) = result {
                        log::warn!("Full snapshot not queued: {}", e);
                    }
                }
            }
        }
        log::debug!("Primary sync loop stopped");
    }
}

fn plan_label(plan: &SyncPlan) -> &'static str {
    match plan {
        SyncPlan::UpToDate => "up-to-date",
        SyncPlan::Delta(_) => "delta",
        SyncPlan::FullSnapshot => "full snapshot",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryMedium, MigrationPolicy};
    use crate::sync::DeviceId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingOutbox {
        sent: Mutex<Vec<SyncMessage>>,
    }

    impl CapturingOutbox {
        fn take(&self) -> Vec<SyncMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Outbox for CapturingOutbox {
        fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    async fn setup() -> (PrimarySync, Arc<EntityStore>, Arc<MemoryMedium>, Arc<CapturingOutbox>) {
        let medium = Arc::new(MemoryMedium::new());
        let (store, _) = EntityStore::open(medium.clone(), MigrationPolicy::default())
            .await
            .unwrap();
        let store = Arc::new(store);
        store.create("Coffee", 0).await.unwrap();
        store.create("Tea", 1).await.unwrap();
        store.commit().await.unwrap();

        let outbox = Arc::new(CapturingOutbox::default());
        let primary = PrimarySync::new(store.clone(), outbox.clone(), PlanLimits::default());
        (primary, store, medium, outbox)
    }

    fn from_companion(message: SyncMessage) -> Envelope {
        Envelope {
            seq: 1,
            origin: DeviceId::new("watch"),
            message,
        }
    }

    #[tokio::test]
    async fn test_first_publish_is_full_then_delta() {
        let (mut primary, store, _, outbox) = setup().await;
        assert_eq!(primary.publish().await.unwrap(), SyncPlan::FullSnapshot);
        assert_eq!(primary.publish().await.unwrap(), SyncPlan::UpToDate);

        let tea = store.fetch_all().await[1].id;
        store.mutate(tea, Mutation::Increment).await.unwrap();
        store.commit().await.unwrap();
        assert_eq!(
            primary.publish().await.unwrap(),
            SyncPlan::Delta(vec![DeltaOp::AdjustBy { id: tea, by: 1 }])
        );

        let sent = outbox.take();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].is_full_snapshot());
    }

    #[tokio::test]
    async fn test_companion_add_is_committed_and_confirmed() {
        let (mut primary, store, _, outbox) = setup().await;
        primary.publish().await.unwrap();
        outbox.take();

        let token = AddToken::new();
        primary
            .apply_inbound(from_companion(SyncMessage::Delta(vec![DeltaOp::Add {
                token,
                title: "Water".into(),
                color_index: 3,
            }])))
            .await
            .unwrap();

        let records = store.fetch_all().await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].title, "Water");

        let sent = outbox.take();
        match &sent[0] {
            SyncMessage::Delta(ops) => match &ops[0] {
                DeltaOp::Confirmed { token: t, value } => {
                    assert_eq!(*t, token);
                    assert_eq!(value.id, records[2].id);
                }
                other => panic!("expected confirmation, got {:?}", other),
            },
            other => panic!("expected delta, got {:?}", other),
        }
        // Count changed, so the echo is a full snapshot
        assert!(sent[1].is_full_snapshot());
    }

    #[tokio::test]
    async fn test_stale_companion_edit_is_ignored() {
        let (mut primary, store, _, outbox) = setup().await;
        primary.publish().await.unwrap();
        outbox.take();

        let coffee = store.fetch_all().await[0].id;
        primary
            .apply_inbound(from_companion(SyncMessage::Delta(vec![
                DeltaOp::AdjustBy { id: TallyId::new(), by: 5 },
                DeltaOp::AdjustBy { id: coffee, by: 2 },
            ])))
            .await
            .unwrap();

        assert_eq!(store.fetch(coffee).await.unwrap().counter, 2);
        assert_eq!(
            outbox.take(),
            vec![SyncMessage::Delta(vec![DeltaOp::AdjustBy { id: coffee, by: 2 }])]
        );
    }

    #[tokio::test]
    async fn test_resync_request_answered_with_snapshot() {
        let (mut primary, _, _, outbox) = setup().await;
        primary.apply_inbound(from_companion(SyncMessage::ResyncRequest)).await.unwrap();
        let sent = outbox.take();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            SyncMessage::FullSnapshot(snapshot) => assert_eq!(snapshot.len(), 2),
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commit_retried_once() {
        let (mut primary, store, medium, outbox) = setup().await;
        primary.publish().await.unwrap();
        outbox.take();

        let coffee = store.fetch_all().await[0].id;
        medium.fail_next_apply();
        primary
            .apply_inbound(from_companion(SyncMessage::Delta(vec![DeltaOp::AdjustBy { id: coffee, by: 1 }])))
            .await
            .unwrap();
        assert_eq!(store.fetch(coffee).await.unwrap().counter, 1);
    }

    #[tokio::test]
    async fn test_failed_companion_commit_keeps_host_edits() {
        let (mut primary, store, medium, outbox) = setup().await;
        primary.publish().await.unwrap();
        outbox.take();

        let records = store.fetch_all().await;
        let (coffee, tea) = (records[0].id, records[1].id);
        store
            .mutate(tea, Mutation::Rename { title: "Green tea".into() })
            .await
            .unwrap();

        medium.fail_next_applies(2);
        let result = primary
            .apply_inbound(from_companion(SyncMessage::Delta(vec![DeltaOp::AdjustBy { id: coffee, by: 1 }])))
            .await;
        assert!(matches!(result, Err(SyncError::Store(DomainError::CommitFailed(_)))));
        assert!(store.has_pending().await);
        assert_eq!(store.fetch(tea).await.unwrap().title, "Tea");

        // The companion is told what is durable
        let sent = outbox.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_full_snapshot());

        // Disk is back: the host's retry commits both edits
        store.commit().await.unwrap();
        assert_eq!(store.fetch(tea).await.unwrap().title, "Green tea");
        assert_eq!(store.fetch(coffee).await.unwrap().counter, 1);
    }

    #[tokio::test]
    async fn test_add_confirmed_once_durable() {
        let (mut primary, store, medium, outbox) = setup().await;
        primary.publish().await.unwrap();
        outbox.take();

        let token = AddToken::new();
        medium.fail_next_applies(2);
        let result = primary
            .apply_inbound(from_companion(SyncMessage::Delta(vec![DeltaOp::Add {
                token,
                title: "Water".into(),
                color_index: 0,
            }])))
            .await;
        assert!(result.is_err());
        let sent = outbox.take();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].carries_add_handshake());

        store.commit().await.unwrap();
        primary.publish().await.unwrap();

        let sent = outbox.take();
        match &sent[0] {
            SyncMessage::Delta(ops) => {
                assert!(matches!(&ops[0], DeltaOp::Confirmed { token: t, value } if *t == token && value.title == "Water"));
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
        assert!(sent[1].is_full_snapshot());
        assert!(primary.unconfirmed.is_empty());
    }
}
