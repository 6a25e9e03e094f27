//! Correlated GET transport for the Apps Script read endpoint.
//!
//! The endpoint cannot send CORS headers, so it answers reads as a script body,
//! `<callback>(<json>)`. Each request gets its own callback id, held in a
//! [`CallbackRegistry`] while the request is in flight and released exactly once
//! however the request ends (reply, load failure or deadline).

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::FetchError;

pub const JSONP_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches the script body behind a URL.
#[async_trait]
pub trait ScriptLoader: Send + Sync + 'static {
    async fn load(&self, url: &Url) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpScriptLoader {
    client: reqwest::Client,
}

impl HttpScriptLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ScriptLoader for HttpScriptLoader {
    async fn load(&self, url: &Url) -> Result<String, FetchError> {
        tracing::debug!(url = %url, "JSONP: Loading script");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::warn!(error = %e, "JSONP: Script load failed");
                FetchError::Transport(e.to_string())
            })?;

        response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    pending: HashSet<String>,
    released: u64,
}

/// Callback ids of in-flight requests.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    state: Mutex<RegistryState>,
}

impl CallbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, id: String) -> CallbackGuard {
        self.lock().pending.insert(id.clone());
        CallbackGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().pending.contains(id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Total number of registrations released so far.
    #[cfg(test)]
    pub fn released_count(&self) -> u64 {
        self.lock().released
    }

    fn release(&self, id: &str) {
        let mut state = self.lock();
        if state.pending.remove(id) {
            state.released += 1;
            tracing::trace!(callback = %id, released = state.released, "JSONP: Callback released");
        } else {
            tracing::warn!(callback = %id, "JSONP: Callback released twice");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its callback id on drop.
#[derive(Debug)]
pub struct CallbackGuard {
    registry: Arc<CallbackRegistry>,
    id: String,
}

impl CallbackGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}

/// Time-based id with a random suffix so concurrent requests never collide.
pub fn new_callback_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("jsonp_{}_{}", chrono::Utc::now().timestamp_millis(), &suffix[..9])
}

#[derive(Clone)]
pub struct JsonpClient {
    loader: Arc<dyn ScriptLoader>,
    registry: Arc<CallbackRegistry>,
    timeout: Duration,
}

impl JsonpClient {
    pub fn new(loader: Arc<dyn ScriptLoader>) -> Self {
        Self {
            loader,
            registry: CallbackRegistry::new(),
            timeout: JSONP_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Issues the request and returns the decoded callback argument.
    pub async fn request(&self, mut url: Url) -> Result<Value, FetchError> {
        let guard = self.registry.register(new_callback_id());
        url.query_pairs_mut().append_pair("callback", guard.id());
        tracing::debug!(callback = %guard.id(), in_flight = self.registry.pending_count(), "JSONP: Request registered");

        let outcome = tokio::time::timeout(self.timeout, self.loader.load(&url)).await;
        let callback = guard.id().to_string();
        drop(guard);

        match outcome {
            Ok(Ok(body)) => unwrap_callback(&callback, &body),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(callback = %callback, timeout = ?self.timeout, "JSONP: Request timed out");
                Err(FetchError::Timeout)
            }
        }
    }
}

/// Extracts `<json>` from `<callback>(<json>)`. A bare JSON body is accepted as well,
/// since the script only wraps its output when it sees the callback parameter.
pub fn unwrap_callback(callback: &str, body: &str) -> Result<Value, FetchError> {
    let trimmed = body.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();

    let payload = match trimmed.strip_prefix(callback) {
        Some(rest) => rest
            .trim_start()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| FetchError::Integration(format!("unbalanced callback wrapper for {callback}")))?,
        None => trimmed,
    };

    serde_json::from_str(payload).map_err(|e| FetchError::Integration(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn base() -> Url {
        Url::parse("https://script.example.com/exec?path=list").unwrap()
    }

    #[test]
    fn unwraps_callback_body() {
        let value = unwrap_callback("jsonp_1_abc", "jsonp_1_abc([{\"id\":\"1\"}]);\n").unwrap();
        assert_eq!(value[0]["id"], "1");
    }

    #[test]
    fn accepts_bare_json() {
        let value = unwrap_callback("jsonp_1_abc", "{\"data\":null,\"error\":\"Not found\"}").unwrap();
        assert_eq!(value["error"], "Not found");
    }

    #[test]
    fn foreign_callback_is_an_integration_fault() {
        let err = unwrap_callback("jsonp_1_abc", "jsonp_2_xyz([])").unwrap_err();
        assert!(matches!(err, FetchError::Integration(_)));
    }

    #[test]
    fn callback_ids_are_unique() {
        let a = new_callback_id();
        let b = new_callback_id();
        assert!(a.starts_with("jsonp_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn request_appends_callback_and_releases_it() {
        let loader = Arc::new(CannedLoader::new().reply("path=list", "[1,2,3]"));
        let client = JsonpClient::new(loader.clone());

        let value = client.request(base()).await.unwrap();

        assert_eq!(value, serde_json::json!([1, 2, 3]));
        assert_eq!(loader.calls(), 1);
        assert_eq!(client.registry().pending_count(), 0);
        assert_eq!(client.registry().released_count(), 1);
    }

    #[tokio::test]
    async fn load_failure_is_a_transport_error() {
        let client = JsonpClient::new(Arc::new(CannedLoader::new()));

        let err = client.request(base()).await.unwrap_err();

        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(client.registry().pending_count(), 0);
        assert_eq!(client.registry().released_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_times_out_after_thirty_seconds() {
        let client = JsonpClient::new(Arc::new(SilentLoader));
        let registry = Arc::clone(client.registry());

        let started = tokio::time::Instant::now();
        let err = client.request(base()).await.unwrap_err();

        assert!(matches!(err, FetchError::Timeout));
        assert_eq!(err.to_string(), "request timeout");
        assert!(started.elapsed() >= JSONP_TIMEOUT);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.released_count(), 1);
    }

    #[test]
    fn guard_releases_once() {
        let registry = CallbackRegistry::new();
        let guard = registry.register("jsonp_test".to_string());
        assert!(registry.is_pending("jsonp_test"));
        drop(guard);
        assert!(!registry.is_pending("jsonp_test"));
        assert_eq!(registry.released_count(), 1);
    }
}
