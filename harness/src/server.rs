use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use relay_core::contracts::{RunQueue, RunStore, TraceRecorder, WorkerTransport};
use relay_core::messages::{ServerToWorker, WorkerToServer};
use relay_core::model::AuthenticatedEnvironment;
use relay_dispatcher::Dispatcher;

use crate::config::RelayConfig;
use crate::pgqueue::PgRunQueue;
use crate::store::PgRunStore;
use crate::trace::LogTraceRecorder;

pub const API_KEY_HEADER: &str = "x-relay-api-key";

struct AppState {
    cfg: RelayConfig,
    queue: Arc<PgRunQueue>,
    store: Arc<PgRunStore>,
    tracer: Arc<LogTraceRecorder>,
}

pub struct RelayServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl RelayServer {
    pub async fn start(pool: PgPool, cfg: RelayConfig, bind: SocketAddr) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind relay server to {bind}"))?;
        let addr = listener.local_addr().context("relay server local_addr")?;

        let state = Arc::new(AppState {
            queue: Arc::new(PgRunQueue::new(pool.clone(), cfg.visibility_timeout())),
            store: Arc::new(PgRunStore::new(pool)),
            tracer: Arc::new(LogTraceRecorder),
            cfg,
        });
        let app = Router::new()
            .route("/v1/worker/ws", get(worker_ws))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_server(listener, app, shutdown_rx));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join relay server task")??;
        Ok(())
    }
}

pub async fn run(cfg: &RelayConfig) -> anyhow::Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect relay db")?;

    let bind: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("parse RELAY_BIND={}", cfg.bind))?;

    let server = RelayServer::start(pool, cfg.clone(), bind).await?;
    tracing::info!(addr = %server.addr, "relay server listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("relay server shutting down");
    server.shutdown().await?;
    Ok(())
}

async fn run_server(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("relay serve")?;

    Ok(())
}

async fn worker_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(api_key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let environment = state
        .store
        .find_environment_by_api_key(api_key)
        .await
        .map_err(|err| {
            tracing::error!(
                event = "relay.server.environment_lookup_failed",
                error = %err,
                "environment lookup failed"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(ws.on_upgrade(move |socket| worker_session(state, socket, environment)))
}

/// One dispatcher per authenticated connection. Inbound frames register
/// worker versions or finalize attempts; socket close stops the dispatch
/// loop.
async fn worker_session(
    state: Arc<AppState>,
    socket: WebSocket,
    environment: AuthenticatedEnvironment,
) {
    let connection_id = Uuid::new_v4();
    tracing::info!(
        event = "relay.server.worker_connected",
        connection = %connection_id,
        environment = %environment.friendly_id,
        "worker connected"
    );

    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerToWorker>(32);
    let writer = tokio::spawn(write_frames(sink, rx));

    let dispatcher = Dispatcher::new(
        environment.clone(),
        state.queue.clone() as Arc<dyn RunQueue>,
        state.store.clone() as Arc<dyn RunStore>,
        state.tracer.clone() as Arc<dyn TraceRecorder>,
        Arc::new(SocketTransport { tx: tx.clone() }),
        state.cfg.dispatcher_options(),
    );

    let _ = tx
        .send(ServerToWorker::ServerReady {
            id: connection_id.to_string(),
        })
        .await;

    read_frames(stream, &dispatcher, connection_id).await;

    dispatcher.stop().await;
    // the dispatcher keeps a sender clone, so the writer is torn down
    // explicitly rather than by channel closure
    drop(tx);
    writer.abort();
    let _ = writer.await;

    tracing::info!(
        event = "relay.server.worker_disconnected",
        connection = %connection_id,
        environment = %environment.friendly_id,
        "worker disconnected"
    );
}

async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    dispatcher: &Dispatcher,
    connection_id: Uuid,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let parsed: WorkerToServer = match serde_json::from_str(text.as_str()) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(
                    event = "relay.server.frame_unparseable",
                    connection = %connection_id,
                    error = %err,
                    "dropping unparseable worker frame"
                );
                continue;
            }
        };

        let result = match parsed {
            WorkerToServer::ReadyForTasks {
                background_worker_id,
            } => dispatcher.register_worker(&background_worker_id).await,
            WorkerToServer::BackgroundWorkerMessage { data, .. } => {
                dispatcher.handle_worker_event(data).await
            }
        };

        if let Err(err) = result {
            tracing::warn!(
                event = "relay.server.worker_message_failed",
                connection = %connection_id,
                error = %err,
                "worker message handling failed"
            );
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerToWorker>,
) {
    while let Some(message) = rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(
                    event = "relay.server.frame_encode_failed",
                    error = %err,
                    "failed to encode outbound frame"
                );
                continue;
            }
        };

        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

/// Outbound transport backed by the per-connection writer channel. A closed
/// channel surfaces as a send error, which the dispatch loop treats as a
/// transport fault and rolls back.
struct SocketTransport {
    tx: mpsc::Sender<ServerToWorker>,
}

#[async_trait]
impl WorkerTransport for SocketTransport {
    async fn send(&self, message: ServerToWorker) -> anyhow::Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("worker connection closed"))
    }
}
