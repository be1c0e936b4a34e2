//! HTTP signaling endpoint
//!
//! A publisher posts its SDP offer and receives the answer in the same
//! request. Every accepted publisher gets its own `StreamReceiver` and
//! recording; the table of live receivers is bounded.

use crate::assets::{
    REPLY_BAD_REQUEST, REPLY_NEGOTIATION_FAILED, REPLY_OK, REPLY_SESSIONS_EXHAUSTED,
};
use crate::config::RecorderConfig;
use crate::utils::net::webrtc::create_webrtc_api;
use crate::utils::sos::SignalOfStop;
use crate::workers::WorkerClose;
use crate::workers::receiver::StreamReceiver;
use anyhow::Context;
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use webrtc::api::API;

/// Browser page that publishes camera and microphone
const PUBLISH_PAGE: &str = include_str!("publish.html");

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub sdp: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AnswerBody {
    pub sdp: String,
}

/// `{"s": code, "d": {...}}` on success, `{"s": code, "e": "..."}` otherwise
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PublishReply {
    pub s: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<AnswerBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl PublishReply {
    fn answer(sdp: String) -> Self {
        PublishReply {
            s: REPLY_OK,
            d: Some(AnswerBody { sdp }),
            e: None,
        }
    }

    fn error(code: u32, message: impl Into<String>) -> Self {
        PublishReply {
            s: code,
            d: None,
            e: Some(message.into()),
        }
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<u64, Arc<StreamReceiver>>,
    /// slots held by publishes still negotiating
    pending: usize,
}

struct ServerState {
    api: Arc<API>,
    config: RecorderConfig,
    table: Mutex<SessionTable>,
    next_id: AtomicU64,
    sos: SignalOfStop,
}

impl ServerState {
    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reserve(&self) -> bool {
        let mut table = self.table();
        if table.sessions.len() + table.pending >= self.config.max_sessions {
            return false;
        }
        table.pending += 1;
        true
    }

    fn unreserve(&self) {
        let mut table = self.table();
        table.pending = table.pending.saturating_sub(1);
    }
}

pub struct SignalingServer {
    state: Arc<ServerState>,
}

impl SignalingServer {
    pub fn new(config: RecorderConfig) -> anyhow::Result<SignalingServer> {
        let api = create_webrtc_api().context("cannot create the WebRTC API")?;

        Ok(SignalingServer {
            state: Arc::new(ServerState {
                api,
                config,
                table: Mutex::new(SessionTable::default()),
                next_id: AtomicU64::new(1),
                sos: SignalOfStop::new(),
            }),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/test", get(hello))
            .route("/rtc/v1/publish", post(publish))
            .layer(CorsLayer::very_permissive())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until `sos` fires, then close every recording.
    pub async fn run(&self, sos: SignalOfStop) -> anyhow::Result<()> {
        let listen = self.state.config.listen;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("cannot listen on {}", listen))?;

        std::fs::create_dir_all(&self.state.config.output_dir).with_context(|| {
            format!(
                "cannot create output directory {}",
                self.state.config.output_dir.display()
            )
        })?;

        info!("SignalingServer: listening on {}", listener.local_addr()?);

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { sos.wait_cancellation().await })
            .await;

        self.close().await;
        served.context("HTTP server failed")
    }
}

#[async_trait]
impl WorkerClose for SignalingServer {
    async fn close(&self) {
        self.state.sos.cancel();

        let receivers: Vec<Arc<StreamReceiver>> =
            self.state.table().sessions.drain().map(|(_, r)| r).collect();
        if !receivers.is_empty() {
            info!("SignalingServer: closing {} recordings", receivers.len());
        }
        for receiver in receivers {
            receiver.close().await;
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(PUBLISH_PAGE)
}

async fn hello() -> &'static str {
    "Hello World"
}

async fn publish(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Json<PublishReply> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return Json(PublishReply::error(REPLY_BAD_REQUEST, rejection.body_text()));
        }
    };
    if request.sdp.trim().is_empty() {
        return Json(PublishReply::error(REPLY_BAD_REQUEST, "missing sdp"));
    }

    if state.sos.cancelled() || !state.reserve() {
        return Json(PublishReply::error(
            REPLY_SESSIONS_EXHAUSTED,
            "no recording slot available",
        ));
    }

    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let published = StreamReceiver::publish(id, &state.api, &state.config, request.sdp).await;

    let (receiver, answer) = match published {
        Ok(published) => published,
        Err(e) => {
            state.unreserve();
            warn!("SignalingServer: publish {} refused: {}", id, e);
            return Json(PublishReply::error(REPLY_NEGOTIATION_FAILED, e.to_string()));
        }
    };

    let receiver = Arc::new(receiver);
    {
        let mut table = state.table();
        table.pending = table.pending.saturating_sub(1);
        table.sessions.insert(id, Arc::clone(&receiver));
    }

    // forget the session once its publisher goes away
    let watcher_state = Arc::clone(&state);
    tokio::spawn(async move {
        let sos = watcher_state.sos.clone();
        if sos.select(receiver.wait_disconnected()).await.is_none() {
            // shutdown closes every recording itself
            return;
        }
        info!("SignalingServer: publisher {} left", receiver.id());
        let removed = watcher_state.table().sessions.remove(&id);
        if let Some(receiver) = removed {
            receiver.close().await;
        }
    });

    Json(PublishReply::answer(answer))
}
