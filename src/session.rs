//! Session Manager: the authoritative map of active and recently terminal
//! transcode sessions. Owns deduplication (one live process per content
//! hash), the concurrency cap, and handoff to the Process Supervisor.
//!
//! No hidden globals: every collaborator (Content Store, Media Probe,
//! Resource Manager, Process Supervisor) is passed in at construction and
//! held as an owned `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock as SyncRwLock;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::content_store::{hash_request, ContentStore};
use crate::domain::{
    AbrLadder, Container, ContentStatus, Session, SessionStats, SessionStatus, SharedSession,
    TranscodeRequest,
};
use crate::error::{CoreError, CoreResult};
use crate::ffmpeg::{status_for_outcome, ArgBuilder, ProcessSupervisor, SupervisorOutcome};
use crate::ladder;
use crate::media::MediaProbe;
use crate::resources::ResourceManager;
use crate::validator::Validator;

/// Response shape for `POST /playback/start` and `GET /playback/session/:id`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub content_hash: String,
    pub status: SessionStatus,
    pub progress_percent: f64,
    pub manifest_url: String,
    pub content_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

fn manifest_file_name(container: Container) -> &'static str {
    match container {
        Container::Dash => "manifest.mpd",
        Container::Hls => "master.m3u8",
        Container::Mp4 => "output.mp4",
    }
}

fn ladder_fingerprint(ladder: Option<&AbrLadder>) -> String {
    match ladder {
        None => String::new(),
        Some(l) => l
            .rungs
            .iter()
            .map(|r| format!("{}:{}x{}:{}:{}", r.label, r.width, r.height, r.video_bitrate_kbps, r.crf))
            .collect::<Vec<_>>()
            .join(","),
    }
}

pub struct SessionManager {
    ffmpeg_path: String,
    max_concurrent_sessions: usize,
    default_segment_duration_s: f64,
    cancel_grace: Duration,

    content_store: Arc<ContentStore>,
    probe: Arc<MediaProbe>,
    resources: Arc<ResourceManager>,
    supervisor: Arc<ProcessSupervisor>,
    validator: Arc<Validator>,

    /// session_id -> session. All session map mutations are serialized
    /// through this single lock.
    sessions: RwLock<HashMap<String, SharedSession>>,
    /// content_hash -> session_id, consulted under the same lock as the
    /// session map insert so dedup is atomic with registration.
    hash_index: RwLock<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        max_concurrent_sessions: usize,
        default_segment_duration_s: f64,
        cancel_grace_secs: u64,
        content_store: Arc<ContentStore>,
        probe: Arc<MediaProbe>,
        resources: Arc<ResourceManager>,
        supervisor: Arc<ProcessSupervisor>,
        validator: Arc<Validator>,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            max_concurrent_sessions,
            default_segment_duration_s,
            cancel_grace: Duration::from_secs(cancel_grace_secs),
            content_store,
            probe,
            resources,
            supervisor,
            validator,
            sessions: RwLock::new(HashMap::new()),
            hash_index: RwLock::new(HashMap::new()),
        }
    }

    fn summarize(&self, session: &Session) -> SessionSummary {
        let manifest_file = manifest_file_name(session.request.container);
        SessionSummary {
            session_id: session.id.clone(),
            content_hash: session.content_hash.clone(),
            status: session.status,
            progress_percent: session.progress_percent,
            manifest_url: self.content_store.resolve_url(&session.content_hash, manifest_file),
            content_url: self.content_store.resolve_url(&session.content_hash, ""),
            failure_reason: session.failure_reason.clone(),
        }
    }

    /// Creates (or attaches to) a transcode session for `req`.
    ///
    /// Canonicalizes the request, computes its content hash, and either
    /// attaches to an existing live/complete session for that hash or
    /// launches a new FFmpeg process, subject to the concurrency cap.
    pub async fn create_session(&self, req: TranscodeRequest) -> CoreResult<SessionSummary> {
        if req.quality > 100 {
            return Err(CoreError::InvalidRequest("quality out of range [0,100]".into()));
        }

        let media = self.probe.probe(&req.input_path).await?;

        let ladder = if req.enable_abr {
            let (w, h) = req.resolution.unwrap_or((media.width, media.height));
            Some(ladder::generate(w.max(media.width), h.max(media.height), req.quality))
        } else {
            None
        };

        let hash = hash_request(
            &req.input_path,
            req.container.as_str(),
            &req.video_codec,
            &req.audio_codec,
            req.quality,
            req.resolution,
            req.enable_abr,
            &ladder_fingerprint(ladder.as_ref()),
        );

        // Dedup check and registration happen under the same lock ordering
        // (hash_index first, then sessions) so a concurrent launch for the
        // same hash can never slip in between.
        let mut hash_index = self.hash_index.write().await;
        if let Some(existing_id) = hash_index.get(&hash).cloned() {
            let sessions = self.sessions.read().await;
            if let Some(shared) = sessions.get(&existing_id) {
                let snapshot = shared.read().clone();
                if snapshot.is_observer_safe() || !snapshot.status.is_terminal() {
                    info!(hash = %hash, session_id = %existing_id, "attaching to existing session");
                    return Ok(self.summarize(&snapshot));
                }
            }
        }

        if let Ok((dir, ContentStatus::Complete)) = self.content_store.locate(&hash).await {
            info!(hash = %hash, "replaying completed content entry");
            let replay = Session {
                id: uuid::Uuid::new_v4().to_string(),
                content_hash: hash.clone(),
                request: req.clone(),
                process_pid: None,
                start_time: Instant::now(),
                status: SessionStatus::Complete,
                progress_percent: 100.0,
                output_dir: dir,
                cancel_token: CancellationToken::new(),
                last_activity_time: Instant::now(),
                failure_reason: None,
            };
            let summary = self.summarize(&replay);
            let shared: SharedSession = Arc::new(SyncRwLock::new(replay));
            hash_index.insert(hash.clone(), summary.session_id.clone());
            self.sessions.write().await.insert(summary.session_id.clone(), shared);
            return Ok(summary);
        }

        let active_count = {
            let sessions = self.sessions.read().await;
            sessions.values().filter(|s| !s.read().status.is_terminal()).count()
        };
        if active_count >= self.max_concurrent_sessions {
            return Err(CoreError::CapacityExceeded(format!(
                "{} sessions already running (limit {})",
                active_count, self.max_concurrent_sessions
            )));
        }

        let output_dir = self.content_store.allocate(&hash).await?;
        let segment_duration_s =
            crate::ffmpeg::args::segment_duration_for(&req, self.default_segment_duration_s);
        let stream_count = ladder.as_ref().map(|l| l.rungs.len()).unwrap_or(1);
        let resource_cfg = self.resources.optimal_resources(req.enable_abr, stream_count, req.speed_priority);

        let manifest_file = manifest_file_name(req.container);
        let output_path = output_dir.join(manifest_file);
        let args = ArgBuilder::build(
            &req,
            &resource_cfg,
            &media,
            ladder.as_ref(),
            segment_duration_s,
            &output_path,
        )?;

        let id = uuid::Uuid::new_v4().to_string();
        let cancel_token = CancellationToken::new();
        let session = Session {
            id: id.clone(),
            content_hash: hash.clone(),
            request: req.clone(),
            process_pid: None,
            start_time: Instant::now(),
            status: SessionStatus::Starting,
            progress_percent: 0.0,
            output_dir: output_dir.clone(),
            cancel_token: cancel_token.clone(),
            last_activity_time: Instant::now(),
            failure_reason: None,
        };
        let shared: SharedSession = Arc::new(SyncRwLock::new(session.clone()));

        hash_index.insert(hash.clone(), id.clone());
        self.sessions.write().await.insert(id.clone(), shared.clone());
        drop(hash_index);

        let summary = self.summarize(&session);
        self.spawn_supervised_run(
            shared,
            args,
            output_dir,
            media.duration_s,
            ladder,
            segment_duration_s,
            cancel_token,
        );

        Ok(summary)
    }

    fn spawn_supervised_run(
        &self,
        shared: SharedSession,
        args: Vec<String>,
        working_dir: PathBuf,
        duration_s: f64,
        ladder: Option<AbrLadder>,
        segment_duration_s: f64,
        cancel_token: CancellationToken,
    ) {
        let supervisor = self.supervisor.clone();
        let content_store = self.content_store.clone();
        let validator = self.validator.clone();

        {
            let mut s = shared.write();
            s.status = SessionStatus::Running;
        }

        tokio::spawn(async move {
            let progress_shared = shared.clone();
            let on_progress = move |percent: f64| {
                let mut s = progress_shared.write();
                if s.status == SessionStatus::Running {
                    s.progress_percent = s.progress_percent.max(percent);
                    s.last_activity_time = Instant::now();
                }
            };

            let run_result = supervisor
                .run(&args, &working_dir, duration_s, cancel_token, on_progress)
                .await;

            let (outcome, pid, hash, req, output_dir) = {
                let s = shared.read();
                match run_result {
                    Ok((outcome, pid)) => (outcome, pid, s.content_hash.clone(), s.request.clone(), s.output_dir.clone()),
                    Err(e) => {
                        warn!(session_id = %s.id, error = %e, "supervisor launch failed");
                        drop(s);
                        let mut s = shared.write();
                        s.status = SessionStatus::Failed;
                        s.failure_reason = Some(e.to_string());
                        return;
                    }
                }
            };

            {
                let mut s = shared.write();
                s.process_pid = pid;
            }

            match outcome {
                SupervisorOutcome::Complete => {
                    let validation = validator
                        .validate(&req, &output_dir, ladder.as_ref(), segment_duration_s, duration_s)
                        .await;
                    match validation {
                        Ok(()) => {
                            let layout = ladder.as_ref().map(|l| ladder_fingerprint(Some(l)));
                            content_store
                                .mark_complete(&hash, output_dir.join(manifest_file_name(req.container)), layout)
                                .await;
                            let mut s = shared.write();
                            s.status = status_for_outcome(&SupervisorOutcome::Complete);
                            s.progress_percent = 100.0;
                            info!(session_id = %s.id, "session complete");
                        }
                        Err(e) => {
                            warn!(hash = %hash, error = %e, "validation failed, marking session failed");
                            content_store.mark_failed(&hash).await;
                            let mut s = shared.write();
                            s.status = status_for_outcome(&SupervisorOutcome::Failed { reason: e.to_string() });
                            s.failure_reason = Some(e.to_string());
                        }
                    }
                }
                SupervisorOutcome::Stopped => {
                    let mut s = shared.write();
                    s.status = status_for_outcome(&SupervisorOutcome::Stopped);
                }
                SupervisorOutcome::Failed { reason } => {
                    content_store.mark_failed(&hash).await;
                    let mut s = shared.write();
                    s.status = status_for_outcome(&SupervisorOutcome::Failed { reason: reason.clone() });
                    s.failure_reason = Some(reason);
                }
            }
        });
    }

    pub async fn get_session(&self, id: &str) -> CoreResult<SessionSummary> {
        let sessions = self.sessions.read().await;
        let shared = sessions
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("no session {}", id)))?;
        let snapshot = shared.read().clone();
        Ok(self.summarize(&snapshot))
    }

    /// `StopSession(id)`. Idempotent: stopping an already-terminal or
    /// already-stopping session is a no-op that still returns `Ok(())`.
    pub async fn stop_session(&self, id: &str) -> CoreResult<()> {
        let sessions = self.sessions.read().await;
        let shared = sessions
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("no session {}", id)))?
            .clone();
        drop(sessions);

        let (should_cancel, token) = {
            let mut s = shared.write();
            if s.status.is_terminal() || s.status == SessionStatus::Stopping {
                (false, s.cancel_token.clone())
            } else {
                s.status = SessionStatus::Stopping;
                (true, s.cancel_token.clone())
            }
        };
        if should_cancel {
            token.cancel();
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let sessions = self.sessions.read().await;
        for shared in sessions.values() {
            let mut s = shared.write();
            if !s.status.is_terminal() {
                s.status = SessionStatus::Stopping;
                s.cancel_token.cancel();
            }
        }
    }

    /// `CleanupStale(max_age)`: drops terminal sessions older than `max_age`.
    /// Non-terminal sessions are never dropped regardless of age.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut hash_index = self.hash_index.write().await;
        let mut dropped = Vec::new();

        sessions.retain(|id, shared| {
            let s = shared.read();
            let stale = s.status.is_terminal() && s.last_activity_time.elapsed() > max_age;
            if stale {
                dropped.push((id.clone(), s.content_hash.clone()));
            }
            !stale
        });

        for (id, hash) in &dropped {
            if hash_index.get(hash) == Some(id) {
                hash_index.remove(hash);
            }
        }
        if !dropped.is_empty() {
            info!(count = dropped.len(), "cleaned up stale sessions");
        }
        dropped.len()
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        let mut stats = SessionStats { concurrency_limit: self.max_concurrent_sessions, ..Default::default() };
        let mut total_progress = 0.0;
        for shared in sessions.values() {
            let s = shared.read();
            total_progress += s.progress_percent;
            match s.status {
                SessionStatus::Starting => stats.starting += 1,
                SessionStatus::Running => stats.running += 1,
                SessionStatus::Stopping => stats.stopping += 1,
                SessionStatus::Stopped => stats.stopped += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Complete => stats.complete += 1,
            }
        }
        if !sessions.is_empty() {
            stats.average_progress = total_progress / sessions.len() as f64;
        }
        stats
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SpeedPriority;
    use std::path::PathBuf;

    fn make_managers(ffmpeg: &str, root: &std::path::Path) -> SessionManager {
        let content_store = Arc::new(ContentStore::new(root, Duration::from_secs(3600)));
        let probe = Arc::new(MediaProbe::new("ffprobe", 16, 5, 30.0));
        let resources = Arc::new(ResourceManager::new());
        let supervisor = Arc::new(ProcessSupervisor::new(ffmpeg, Duration::from_secs(5)));
        let validator = Arc::new(Validator::new("ffprobe"));
        SessionManager::new(ffmpeg, 2, 2.0, 1, content_store, probe, resources, supervisor, validator)
    }

    fn request() -> TranscodeRequest {
        TranscodeRequest {
            input_path: PathBuf::from("/nonexistent/a.mkv"),
            seek_offset: 0.0,
            container: Container::Mp4,
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            quality: 70,
            speed_priority: SpeedPriority::Balanced,
            resolution: None,
            enable_abr: false,
            provider_settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn missing_input_surfaces_file_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = make_managers("ffmpeg", tmp.path());
        let err = mgr.create_session(request()).await.unwrap_err();
        assert!(matches!(err, CoreError::FileUnavailable(_)));
    }

    #[tokio::test]
    async fn stop_unknown_session_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = make_managers("ffmpeg", tmp.path());
        let err = mgr.stop_session("does-not-exist").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = make_managers("ffmpeg", tmp.path());
        let stats = mgr.stats().await;
        assert_eq!(stats.concurrency_limit, 2);
        assert_eq!(stats.running, 0);
    }
}
