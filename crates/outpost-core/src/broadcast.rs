use crate::channels::{ChannelLayer, DeliveryError};
use crate::error::OutpostError;
use crate::outpost_ipc::MessageEnvelope;
use crate::state_store::InstanceStateStore;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Pushes TRIGGER_UPDATE to every live connection of an outpost.
#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<dyn InstanceStateStore>,
    channels: Arc<dyn ChannelLayer>,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn InstanceStateStore>, channels: Arc<dyn ChannelLayer>) -> Self {
        Self { store, channels }
    }

    /// Store failures are returned; per-connection delivery failures are only
    /// counted and logged.
    pub async fn notify(&self, outpost_id: &str) -> Result<BroadcastReport, OutpostError> {
        let instances = self.store.instances_for_outpost(outpost_id).await?;
        let targets = instances
            .into_iter()
            .flat_map(|state| state.channel_ids)
            .collect::<BTreeSet<_>>();

        let envelope = MessageEnvelope::trigger_update();
        let sends = targets.iter().map(|channel_id| {
            let envelope = envelope.clone();
            async move { (channel_id, self.channels.send(channel_id, envelope).await) }
        });

        let mut report = BroadcastReport::default();
        for (channel_id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    log_delivery_failure(outpost_id, channel_id, &err);
                }
            }
        }

        info!(
            event = "outpost_update_broadcast",
            outpost_id = outpost_id,
            delivered = report.delivered,
            failed = report.failed
        );
        Ok(report)
    }
}

fn log_delivery_failure(outpost_id: &str, channel_id: &str, err: &DeliveryError) {
    warn!(
        event = "outpost_update_send_error",
        outpost_id = outpost_id,
        conn_id = channel_id,
        error = %err
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelRegistry;
    use crate::outpost_ipc::Instruction;
    use crate::session::tests::Harness;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_one_trigger_per_connection_across_instances() {
        let harness = Harness::new();
        let registry = Arc::new(ChannelRegistry::new(8));
        let broadcaster = Broadcaster::new(harness.store.clone(), registry.clone());

        let mut receivers = Vec::new();
        for (channel_id, uid) in [("c1", "A"), ("c2", "A"), ("c3", "B")] {
            receivers.push(registry.register(channel_id).await);
            let mut session = harness.open("outpost-1", channel_id).await;
            session
                .handle(MessageEnvelope::hello(uid, "1.0", "abc"))
                .await
                .expect("hello");
        }
        let mut unrelated_rx = registry.register("c9").await;
        let mut unrelated = harness.open("outpost-2", "c9").await;
        unrelated
            .handle(MessageEnvelope::hello("Z", "1.0", "abc"))
            .await
            .expect("hello");

        let report = broadcaster.notify("outpost-1").await.expect("notify");
        assert_eq!(report, BroadcastReport { delivered: 3, failed: 0 });

        for rx in receivers.iter_mut() {
            let msg = rx.try_recv().expect("trigger delivered");
            assert_eq!(msg.instruction, Instruction::TriggerUpdate);
            assert!(msg.args.is_empty());
            assert!(rx.try_recv().is_err(), "exactly one trigger per connection");
        }
        assert!(unrelated_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_target_does_not_block_others() {
        let harness = Harness::new();
        let registry = Arc::new(ChannelRegistry::new(8));
        let broadcaster = Broadcaster::new(harness.store.clone(), registry.clone());

        let mut live_rx = registry.register("c1").await;
        let dead_rx = registry.register("c2").await;
        drop(dead_rx);
        for channel_id in ["c1", "c2", "c3"] {
            let mut session = harness.open("outpost-1", channel_id).await;
            session
                .handle(MessageEnvelope::hello("A", "1.0", "abc"))
                .await
                .expect("hello");
        }

        let report = broadcaster.notify("outpost-1").await.expect("notify");
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 2 });
        assert_eq!(
            live_rx.try_recv().expect("delivered").instruction,
            Instruction::TriggerUpdate
        );
    }

    #[tokio::test]
    async fn disconnected_and_expired_connections_are_skipped() {
        let harness = Harness::new();
        let registry = Arc::new(ChannelRegistry::new(8));
        let broadcaster = Broadcaster::new(harness.store.clone(), registry.clone());

        let mut c1_rx = registry.register("c1").await;
        let mut c2_rx = registry.register("c2").await;
        let mut first = harness.open("outpost-1", "c1").await;
        let mut second = harness.open("outpost-1", "c2").await;
        first
            .handle(MessageEnvelope::hello("A", "1.0", "abc"))
            .await
            .expect("hello c1");
        second
            .handle(MessageEnvelope::hello("A", "1.0", "abc"))
            .await
            .expect("hello c2");

        first.disconnect("normal").await.expect("disconnect");
        let report = broadcaster.notify("outpost-1").await.expect("notify");
        assert_eq!(report.delivered, 1);
        assert!(c1_rx.try_recv().is_err());
        assert!(c2_rx.try_recv().is_ok());

        harness.clock.advance(Duration::from_secs(31));
        let report = broadcaster.notify("outpost-1").await.expect("notify");
        assert_eq!(report, BroadcastReport::default());
        assert!(c2_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_connection_is_not_targeted() {
        let harness = Harness::new();
        let registry = Arc::new(ChannelRegistry::new(8));
        let broadcaster = Broadcaster::new(harness.store.clone(), registry.clone());

        let mut rx = registry.register("c1").await;
        let _session = harness.open("outpost-1", "c1").await;

        let report = broadcaster.notify("outpost-1").await.expect("notify");
        assert_eq!(report.delivered, 0);
        assert!(rx.try_recv().is_err());
    }
}
