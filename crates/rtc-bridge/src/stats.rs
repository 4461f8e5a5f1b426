//! Stats collection bridge
//!
//! A stats request is one-shot: the collector holds its own reference to the
//! target object for the whole collection, so releasing the caller's handle
//! right after `get_stats` neither cancels the request nor frees the object
//! while the engine is still gathering.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::completion::Completion;
use crate::engine::{NativePeerConnection, StatsSelector};

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

/// Serialized stats report (JSON)
#[derive(Clone, PartialEq, Eq)]
pub struct StatsReport {
    json: String,
}

impl StatsReport {
    pub fn new(json: impl Into<String>) -> Self {
        Self { json: json.into() }
    }

    /// Report delivered when the engine could not produce one
    pub fn empty() -> Self {
        Self::new(r#"{"stats":[]}"#)
    }

    pub fn as_json(&self) -> &str {
        &self.json
    }

    pub fn into_json(self) -> String {
        self.json
    }

    pub fn parse(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.json)
    }

    /// Entries of the `stats` array with the given `type`
    pub fn entries_of_type(&self, stat_type: &str) -> Vec<Value> {
        let Ok(value) = self.parse() else {
            return Vec::new();
        };
        value
            .get("stats")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.get("type").and_then(Value::as_str) == Some(stat_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsReport")
            .field("bytes", &self.json.len())
            .finish()
    }
}

/// Issue a one-shot stats request against `peer`.
///
/// `keep_alive` is held until `on_delivered` has run.
pub(crate) fn collect<K, C, F>(
    peer: &Arc<dyn NativePeerConnection>,
    selector: StatsSelector,
    keep_alive: Arc<K>,
    context: C,
    on_delivered: F,
) where
    K: Send + Sync + ?Sized + 'static,
    C: Send + 'static,
    F: FnOnce(C, StatsReport) + Send + 'static,
{
    let request = NEXT_REQUEST.fetch_add(1, Ordering::Relaxed);
    debug!(request, ?selector, "stats requested");

    let done = Completion::new("get_stats", move |result| {
        let report = match result {
            Ok(json) => StatsReport::new(json),
            Err(err) => {
                warn!(request, error = %err, "stats collection failed, delivering empty report");
                StatsReport::empty()
            }
        };
        on_delivered(context, report);
        debug!(request, "stats delivered");
        drop(keep_alive);
    });
    peer.get_stats(selector, done);
}
