use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    errors::GateError,
    gate::{Countdown, DownloadGate, GateEvent, GateState, OpenOutcome},
};

/// What a download page polls for.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSnapshot {
    pub id: Uuid,
    pub slug: String,
    pub state: GateState,
    pub seconds_left: u32,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_link: Option<String>,
}

impl GateSnapshot {
    fn new(id: Uuid, slug: &str, gate: &DownloadGate) -> Self {
        Self {
            id,
            slug: slug.to_string(),
            state: gate.state(),
            seconds_left: gate.display_seconds(),
            progress: gate.progress(),
            download_url: gate.revealed_url().map(str::to_string),
            manual_link: gate.manual_link().map(str::to_string),
        }
    }
}

struct GateSession {
    slug: String,
    countdown: Countdown,
    last_seen: Instant,
}

/// Live download gates, one per visit to a download page.
pub struct GateRegistry {
    sessions: Mutex<HashMap<Uuid, GateSession>>,
    countdown_secs: u32,
    session_ttl: Duration,
}

impl GateRegistry {
    pub fn new(countdown_secs: u32, session_ttl: Duration) -> Self {
        tracing::info!(countdown_secs, session_ttl = ?session_ttl, "Initializing GateRegistry");
        Self {
            sessions: Mutex::new(HashMap::new()),
            countdown_secs,
            session_ttl,
        }
    }

    /// Opens a gate for `slug` whose countdown starts immediately.
    pub fn start(&self, slug: &str, download_url: String) -> GateSnapshot {
        let id = Uuid::new_v4();
        let countdown = Countdown::start(DownloadGate::new(self.countdown_secs, download_url));
        let snapshot = GateSnapshot::new(id, slug, &countdown.snapshot());

        let mut sessions = self.lock();
        self.sweep(&mut sessions);
        sessions.insert(
            id,
            GateSession {
                slug: slug.to_string(),
                countdown,
                last_seen: Instant::now(),
            },
        );

        tracing::info!(gate_id = %id, %slug, "Download gate started");
        snapshot
    }

    pub fn snapshot(&self, id: Uuid) -> Result<GateSnapshot, GateError> {
        self.with_session(id, |session| Ok(GateSnapshot::new(id, &session.slug, &session.countdown.snapshot())))
    }

    /// Lets the visitor through once the countdown is over, revealing the URL.
    pub fn open(&self, id: Uuid) -> Result<GateSnapshot, GateError> {
        self.transition(id, GateEvent::Open)
    }

    /// Records how the browser's attempt to open the file went.
    pub fn report(&self, id: Uuid, outcome: OpenOutcome) -> Result<GateSnapshot, GateError> {
        tracing::debug!(gate_id = %id, ?outcome, "Download gate open outcome reported");
        self.with_session(id, |session| {
            session.countdown.resolve_open(&outcome)?;
            Ok(GateSnapshot::new(id, &session.slug, &session.countdown.snapshot()))
        })
    }

    /// Drops a session, cancelling its countdown.
    pub fn close(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn transition(&self, id: Uuid, event: GateEvent) -> Result<GateSnapshot, GateError> {
        self.with_session(id, |session| {
            session.countdown.apply(event)?;
            Ok(GateSnapshot::new(id, &session.slug, &session.countdown.snapshot()))
        })
    }

    fn with_session<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut GateSession) -> Result<T, GateError>,
    ) -> Result<T, GateError> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(&id).ok_or(GateError::SessionNotFound(id))?;
        session.last_seen = Instant::now();
        f(session)
    }

    fn sweep(&self, sessions: &mut HashMap<Uuid, GateSession>) {
        let before = sessions.len();
        sessions.retain(|_, s| s.last_seen.elapsed() < self.session_ttl);
        let expired = before - sessions.len();
        if expired > 0 {
            tracing::debug!(expired, "Expired idle download gates");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, GateSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
