use crate::outposts::OutpostCatalog;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use outpost_core::{
    new_channel_id,
    outpost_ipc::{encode_frame, DEFAULT_MAX_FRAME_BYTES},
    AccessGate, Broadcaster, CallerIdentity, ChannelLayer, ChannelRegistry, Clock, ConnectRequest,
    InstanceStateStore, MemoryInstanceStore, OutpostDirectory, OutpostError, OutpostSession,
    SessionContext,
};
use std::{future::Future, io, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub hello_interval: Duration,
    pub reap_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub debug: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hello_interval: outpost_core::OUTPOST_HELLO_INTERVAL,
            reap_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: false,
        }
    }
}

pub struct HubState {
    config: HubConfig,
    catalog: Arc<OutpostCatalog>,
    store: Arc<MemoryInstanceStore>,
    channels: Arc<ChannelRegistry>,
    ctx: SessionContext,
    broadcaster: Broadcaster,
    shutdown: watch::Receiver<bool>,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        catalog: Arc<OutpostCatalog>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let store = Arc::new(MemoryInstanceStore::new(clock.clone()));
        let channels = Arc::new(ChannelRegistry::new(config.queue_capacity));
        let mut ctx = SessionContext::new(store.clone(), clock, config.hello_interval);
        ctx.max_frame_bytes = config.max_frame_bytes;
        let broadcaster = Broadcaster::new(store.clone(), channels.clone());
        Self {
            config,
            catalog,
            store,
            channels,
            ctx,
            broadcaster,
            shutdown,
        }
    }

    /// Same decision the socket handshake makes, for the HTTP endpoints.
    async fn authorize_view(&self, caller: &CallerIdentity, outpost_id: &str) -> Result<(), StatusCode> {
        if !self.catalog.is_authorized(caller, outpost_id).await {
            warn!(event = "outpost_view_denied", outpost_id = outpost_id, caller = %caller);
            return Err(StatusCode::FORBIDDEN);
        }
        if self.catalog.lookup(outpost_id).await.is_none() {
            return Err(StatusCode::NOT_FOUND);
        }
        Ok(())
    }

    fn caller_from_headers(&self, headers: &HeaderMap) -> CallerIdentity {
        bearer_token(headers)
            .map(|token| self.catalog.caller_for_token(token))
            .unwrap_or_else(CallerIdentity::anonymous)
    }

    async fn reap_once(&self) -> usize {
        let reaped = match self.store.purge_expired().await {
            Ok(count) => {
                if count > 0 {
                    info!(event = "instance_state_reaped", count = count);
                }
                count
            }
            Err(err) => {
                warn!(event = "instance_state_reap_failed", error = %err);
                0
            }
        };
        let live_instances = self.store.live_count().await;
        let open_connections = self.channels.open_count().await;
        debug!(
            event = "hub_stats",
            live_instances = live_instances,
            open_connections = open_connections
        );
        reaped
    }

    pub fn spawn_state_reaper(self: Arc<Self>) {
        if self.config.reap_interval.is_zero() {
            return;
        }
        let interval = self.config.reap_interval;
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.reap_once().await;
                    }
                }
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, mut session: OutpostSession) {
        let conn_id = session.channel_id().to_string();
        let outpost_id = session.outpost().id.clone();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let mut outbound = self.channels.register(&conn_id).await;

        let write_timeout = self.config.write_timeout;
        let max_frame_bytes = self.config.max_frame_bytes;
        let conn_for_writer = conn_id.clone();
        let write_task = tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                let text = match encode_frame(&envelope, max_frame_bytes) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(event = "outpost_encode_error", conn_id = %conn_for_writer, error = %err);
                        continue;
                    }
                };
                match tokio::time::timeout(write_timeout, ws_sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(event = "outpost_write_error", conn_id = %conn_for_writer, error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "outpost_write_timeout", conn_id = %conn_for_writer);
                        return;
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        info!(event = "outpost_socket_open", conn_id = %conn_id, outpost_id = %outpost_id);

        let mut shutdown = self.shutdown.clone();
        let reason = loop {
            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break "shutdown";
                    }
                    continue;
                }
                next = ws_receiver.next() => next,
            };
            let msg = match next {
                Some(Ok(value)) => value,
                Some(Err(err)) => {
                    warn!(event = "outpost_read_error", conn_id = %conn_id, error = %err);
                    break "read_error";
                }
                None => break "closed",
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => break "client_close",
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(event = "outpost_message_received", conn_id = %conn_id, raw = %String::from_utf8_lossy(&data));
            }

            match session.receive(&data).await {
                Ok(Some(reply)) => {
                    if let Err(err) = self.channels.send(&conn_id, reply).await {
                        warn!(event = "outpost_reply_error", conn_id = %conn_id, error = %err);
                        break "send_error";
                    }
                }
                Ok(None) => {}
                Err(err @ OutpostError::StoreUnavailable(_)) => {
                    error!(event = "outpost_store_unavailable", conn_id = %conn_id, error = %err);
                }
                Err(err) => {
                    warn!(event = "outpost_message_dropped", conn_id = %conn_id, error = %err);
                }
            }
        };

        if let Err(err) = session.disconnect(reason).await {
            warn!(event = "outpost_cleanup_failed", conn_id = %conn_id, error = %err);
        }
        self.channels.unregister(&conn_id).await;
        let _ = write_task.await;
        info!(event = "outpost_socket_closed", conn_id = %conn_id, outpost_id = %outpost_id, reason = reason);
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws/outpost/:outpost_id", get(ws_handler))
        .route("/outposts/:outpost_id/notify", post(notify_handler))
        .route("/outposts/:outpost_id/instances", get(instances_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

pub async fn serve<F>(listener: TcpListener, hub: Arc<HubState>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(outpost_id): Path<String>,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> Response {
    let request = ConnectRequest {
        outpost_id,
        caller: hub.caller_from_headers(&headers),
        channel_id: new_channel_id(),
    };
    let session = match OutpostSession::connect(
        request,
        hub.catalog.as_ref(),
        hub.catalog.as_ref(),
        hub.ctx.clone(),
    )
    .await
    {
        Ok(value) => value,
        Err(err) => return rejection_status(&err).into_response(),
    };
    ws.on_upgrade(move |socket| hub.handle_socket(socket, session))
}

async fn notify_handler(
    Path(outpost_id): Path<String>,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> Response {
    let caller = hub.caller_from_headers(&headers);
    if let Err(status) = hub.authorize_view(&caller, &outpost_id).await {
        return status.into_response();
    }
    match hub.broadcaster.notify(&outpost_id).await {
        Ok(report) => (StatusCode::ACCEPTED, Json(report)).into_response(),
        Err(err) => {
            error!(event = "outpost_notify_failed", outpost_id = %outpost_id, error = %err);
            rejection_status(&err).into_response()
        }
    }
}

async fn instances_handler(
    Path(outpost_id): Path<String>,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> Response {
    let caller = hub.caller_from_headers(&headers);
    if let Err(status) = hub.authorize_view(&caller, &outpost_id).await {
        return status.into_response();
    }
    match hub.store.instances_for_outpost(&outpost_id).await {
        Ok(instances) => Json(instances).into_response(),
        Err(err) => {
            error!(event = "outpost_instances_failed", outpost_id = %outpost_id, error = %err);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

fn rejection_status(err: &OutpostError) -> StatusCode {
    match err {
        OutpostError::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
        OutpostError::OutpostNotFound(_) => StatusCode::NOT_FOUND,
        OutpostError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OutpostError::MalformedMessage(_) | OutpostError::UnknownInstruction(_) => {
            StatusCode::BAD_REQUEST
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
