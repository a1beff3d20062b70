use crate::access::{AccessGate, ConnectRequest, OutpostDirectory, OutpostRecord};
use crate::clock::Clock;
use crate::error::OutpostError;
use crate::outpost_ipc::{decode_frame, Instruction, MessageEnvelope, DEFAULT_MAX_FRAME_BYTES};
use crate::state_store::{state_ttl, HelloReport, InstanceKey, InstanceStateStore, StateUpdate};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared dependencies handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn InstanceStateStore>,
    pub clock: Arc<dyn Clock>,
    pub hello_interval: Duration,
    pub max_frame_bytes: usize,
}

impl SessionContext {
    pub fn new(
        store: Arc<dyn InstanceStateStore>,
        clock: Arc<dyn Clock>,
        hello_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            hello_interval,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn state_ttl(&self) -> Duration {
        state_ttl(self.hello_interval)
    }
}

/// Controller for one outpost connection.
///
/// Registration is lazy: nothing is written to the store until the first
/// non-ACK envelope arrives, so a connection that never speaks is invisible
/// to broadcasts.
pub struct OutpostSession {
    ctx: SessionContext,
    outpost: OutpostRecord,
    channel_id: String,
    last_uid: String,
    // Instance key that currently lists this channel id, if any.
    attached_uid: Option<String>,
}

impl OutpostSession {
    /// Authorize the request and build the session. Both failure cases are
    /// hard rejects: the transport must refuse the handshake.
    pub async fn connect(
        request: ConnectRequest,
        directory: &dyn OutpostDirectory,
        gate: &dyn AccessGate,
        ctx: SessionContext,
    ) -> Result<Self, OutpostError> {
        if !gate.is_authorized(&request.caller, &request.outpost_id).await {
            warn!(
                event = "outpost_connect_denied",
                conn_id = %request.channel_id,
                outpost_id = %request.outpost_id,
                caller = %request.caller
            );
            return Err(OutpostError::AuthorizationDenied {
                caller: request.caller.to_string(),
                outpost_id: request.outpost_id,
            });
        }
        let Some(outpost) = directory.lookup(&request.outpost_id).await else {
            warn!(
                event = "outpost_connect_unknown",
                conn_id = %request.channel_id,
                outpost_id = %request.outpost_id
            );
            return Err(OutpostError::OutpostNotFound(request.outpost_id));
        };

        debug!(
            event = "outpost_connected",
            conn_id = %request.channel_id,
            outpost_id = %outpost.id
        );
        Ok(Self {
            ctx,
            outpost,
            last_uid: request.channel_id.clone(),
            channel_id: request.channel_id,
            attached_uid: None,
        })
    }

    pub fn outpost(&self) -> &OutpostRecord {
        &self.outpost
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn last_uid(&self) -> &str {
        &self.last_uid
    }

    pub fn attached_uid(&self) -> Option<&str> {
        self.attached_uid.as_deref()
    }

    /// Decode and process one raw payload. Returns the reply to send back on
    /// this connection, if any.
    pub async fn receive(&mut self, raw: &[u8]) -> Result<Option<MessageEnvelope>, OutpostError> {
        let msg = decode_frame::<MessageEnvelope>(raw, self.ctx.max_frame_bytes)?;
        self.handle(msg).await
    }

    pub async fn handle(
        &mut self,
        msg: MessageEnvelope,
    ) -> Result<Option<MessageEnvelope>, OutpostError> {
        if let Instruction::Unknown(code) = msg.instruction {
            return Err(OutpostError::UnknownInstruction(code));
        }

        let uid = msg
            .instance_uid()
            .unwrap_or(self.channel_id.as_str())
            .to_string();
        self.last_uid = uid.clone();

        let report = match msg.instruction {
            // Pure acknowledgment: no persisted change, no reply.
            Instruction::Ack => {
                debug!(event = "outpost_ack", conn_id = %self.channel_id, instance_uid = %uid);
                return Ok(None);
            }
            Instruction::Hello => Some(HelloReport {
                version: msg.reported_version(),
                build_hash: msg.reported_build_hash(),
            }),
            Instruction::TriggerUpdate | Instruction::Unknown(_) => None,
        };

        if let Some(previous) = self.attached_uid.clone().filter(|prev| *prev != uid) {
            let key = InstanceKey::new(&self.outpost.id, &previous);
            self.ctx.store.detach(&key, &self.channel_id).await?;
            self.attached_uid = None;
            info!(
                event = "outpost_instance_reassigned",
                conn_id = %self.channel_id,
                outpost_id = %self.outpost.id,
                from_uid = %previous,
                instance_uid = %uid
            );
        }

        let key = InstanceKey::new(&self.outpost.id, &uid);
        let update = StateUpdate {
            channel_id: self.channel_id.clone(),
            seen_at: self.ctx.clock.now(),
            report,
        };
        let state = self.ctx.store.upsert(&key, update, self.ctx.state_ttl()).await?;
        self.attached_uid = Some(uid);

        debug!(
            event = "outpost_instance_seen",
            conn_id = %self.channel_id,
            outpost_id = %self.outpost.id,
            instance_uid = %state.instance_uid,
            instruction = %msg.instruction,
            channels = state.channel_ids.len()
        );
        Ok(Some(MessageEnvelope::ack()))
    }

    /// Remove this connection from its instance record. Safe to call more
    /// than once and for sessions that never registered.
    pub async fn disconnect(&mut self, reason: &str) -> Result<(), OutpostError> {
        let Some(uid) = self.attached_uid.take() else {
            debug!(event = "outpost_disconnected", conn_id = %self.channel_id, reason = reason);
            return Ok(());
        };
        let key = InstanceKey::new(&self.outpost.id, &uid);
        let removed = self.ctx.store.detach(&key, &self.channel_id).await?;
        info!(
            event = "outpost_disconnected",
            conn_id = %self.channel_id,
            outpost_id = %self.outpost.id,
            instance_uid = %uid,
            removed = removed,
            reason = reason
        );
        Ok(())
    }
}
