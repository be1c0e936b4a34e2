//! Recording session
//!
//! One recording per publisher. It owns the shared sink and at most one
//! track per media kind, each driven by its own `TrackReceiver` task, so a
//! failing track never stalls or closes its sibling. The sink is closed
//! once, after the last track released it.

use crate::assets::{HEALTH_LOG_INTERVAL_SECS, STALL_THRESHOLD_SECS, TRACK_CHANNEL_SIZE};
use crate::config::TrackConfig;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::{HealthSummary, TrackHealth};
use crate::pipeline::receiver::track::{TrackReceiver, TrackSession, TransportItem};
use crate::pipeline::types::MediaKind;
use crate::utils::sos::SignalOfStop;
use crate::workers::save_stream::{SharedSink, SinkError, SinkHandle};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a {0} track is already open")]
    DuplicateTrack(MediaKind),
    #[error("recording session is closed")]
    Closed,
    #[error("recording sink unavailable: {0}")]
    Sink(#[from] SinkError),
}

struct TrackEntry {
    clock_rate: u32,
    health: Arc<TrackHealth>,
    task: JoinHandle<anyhow::Result<()>>,
}

#[derive(Default)]
struct SessionInner {
    tracks: HashMap<MediaKind, TrackEntry>,
    /// Held for the session's lifetime so the sink outlives its tracks
    own_handle: Option<SinkHandle>,
    logger: Option<JoinHandle<Option<()>>>,
    closed: bool,
}

/// How one track ended
#[derive(Debug, Clone)]
pub struct TrackReport {
    pub kind: MediaKind,
    pub summary: HealthSummary,
    pub error: Option<String>,
}

/// Outcome of a closed recording
#[derive(Debug, Clone, Default)]
pub struct RecordingReport {
    pub id: u64,
    pub tracks: Vec<TrackReport>,
    pub sink_error: Option<String>,
}

impl RecordingReport {
    /// Whether every track and the sink finished without error
    pub fn is_clean(&self) -> bool {
        self.sink_error.is_none() && self.tracks.iter().all(|t| t.error.is_none())
    }

    pub fn track(&self, kind: MediaKind) -> Option<&TrackReport> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

pub struct RecordingSession {
    id: u64,
    config: TrackConfig,
    sink: SharedSink,
    inner: Arc<Mutex<SessionInner>>,
    max_wait: watch::Sender<Duration>,
    health_interval: Duration,
    sos: SignalOfStop,
}

impl RecordingSession {
    pub fn new(id: u64, config: TrackConfig, sink: SharedSink) -> Result<Self, SessionError> {
        let own_handle = sink.attach()?;
        let (max_wait, _) = watch::channel(config.max_wait);

        Ok(Self {
            id,
            config,
            sink,
            inner: Arc::new(Mutex::new(SessionInner {
                own_handle: Some(own_handle),
                ..Default::default()
            })),
            max_wait,
            health_interval: Duration::from_secs(HEALTH_LOG_INTERVAL_SECS),
            sos: SignalOfStop::new(),
        })
    }

    /// Interval of the periodic track health report
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Start a track of `kind` and return the sender its transport feeds.
    ///
    /// Dropping every clone of the sender ends the track. Must be called
    /// from within a tokio runtime.
    pub fn open_track(
        &self,
        kind: MediaKind,
        clock_rate: u32,
    ) -> Result<mpsc::Sender<TransportItem>, SessionError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        if inner.tracks.contains_key(&kind) {
            return Err(SessionError::DuplicateTrack(kind));
        }

        let handle = self.sink.attach()?;

        let mut config = self.config.clone();
        config.max_wait = *self.max_wait.borrow();

        let session = TrackSession::new(kind, clock_rate, &config, handle);
        let health = session.health();

        let (tx, rx) = mpsc::channel(TRACK_CHANNEL_SIZE);
        let mut receiver =
            TrackReceiver::new(session, rx, self.max_wait.subscribe(), self.sos.child());

        let id = self.id;
        let task = tokio::spawn(async move {
            let result = receiver.run().await;
            if let Err(e) = &result {
                error!("Recording {}: {} {} failed: {:#}", id, receiver.name(), kind, e);
            }
            result
        });

        info!("Recording {}: {} track opened ({} Hz)", self.id, kind, clock_rate);
        inner.tracks.insert(
            kind,
            TrackEntry {
                clock_rate,
                health,
                task,
            },
        );

        if inner.logger.is_none() {
            inner.logger = Some(self.spawn_health_logger());
        }

        Ok(tx)
    }

    /// Change the wait window of every open and future track
    pub fn set_max_wait_time(&self, max_wait: Duration) {
        info!("Recording {}: max wait set to {:?}", self.id, max_wait);
        self.max_wait.send_replace(max_wait);
    }

    pub fn max_wait_time(&self) -> Duration {
        *self.max_wait.borrow()
    }

    /// Wait up to `grace` for the tracks to end on their own (their
    /// transports closed), stop whatever is left, then close the sink.
    pub async fn finish(&self, grace: Duration) -> RecordingReport {
        let (tracks, own_handle, logger) = {
            let mut inner = self.lock();
            if inner.closed {
                return RecordingReport {
                    id: self.id,
                    ..Default::default()
                };
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.tracks),
                inner.own_handle.take(),
                inner.logger.take(),
            )
        };

        let deadline = tokio::time::Instant::now() + grace;
        let mut report = RecordingReport {
            id: self.id,
            ..Default::default()
        };

        let mut tracks: Vec<_> = tracks.into_iter().collect();
        tracks.sort_by_key(|(kind, _)| matches!(kind, MediaKind::Audio));

        for (kind, mut entry) in tracks {
            let joined = match tokio::time::timeout_at(deadline, &mut entry.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    info!("Recording {}: stopping {} track", self.id, kind);
                    self.sos.cancel();
                    entry.task.await
                }
            };

            let error = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(e) => Some(format!("track task aborted: {}", e)),
            };

            report.tracks.push(TrackReport {
                kind,
                summary: entry.health.summary(),
                error,
            });
        }

        self.sos.cancel();
        if let Some(logger) = logger {
            let _ = logger.await;
        }

        if let Some(mut handle) = own_handle {
            if let Err(e) = handle.release() {
                warn!("Recording {}: closing sink failed: {}", self.id, e);
                report.sink_error = Some(e.to_string());
            }
        }

        info!(
            "Recording {}: closed ({} tracks{})",
            self.id,
            report.tracks.len(),
            if report.is_clean() { "" } else { ", with errors" }
        );

        report
    }

    /// Stop every track now and close the sink.
    /// A frame still being assembled is discarded.
    pub async fn close(&self) -> RecordingReport {
        self.sos.cancel();
        self.finish(Duration::ZERO).await
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        // tracks run outside the lock, so its state stays consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_health_logger(&self) -> JoinHandle<Option<()>> {
        let inner = Arc::clone(&self.inner);
        let interval = self.health_interval;
        let id = self.id;
        let stall = Duration::from_secs(STALL_THRESHOLD_SECS);

        self.sos.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let tracks: Vec<(MediaKind, u32, Arc<TrackHealth>)> = {
                    let guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard
                        .tracks
                        .iter()
                        .map(|(kind, t)| (*kind, t.clock_rate, Arc::clone(&t.health)))
                        .collect()
                };

                for (kind, clock_rate, health) in tracks {
                    if health.packets_received() > 0 && health.is_stalled(stall) {
                        warn!("Recording {}: {} track stalled ({} Hz)", id, kind, clock_rate);
                    }
                    info!("Recording {}: {} track {}", id, kind, health.summary());
                }
            }
        })
    }
}
