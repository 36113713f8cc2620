// DETECTION: Client Activity Tracker - Sliding Window Flood and Traversal Detection
//
// Keeps the request timestamps of each client fingerprint (ip + user agent) for the last
// window. Every call trims the window before counting. Memory is bounded two ways: the
// least recently seen fingerprint is evicted when the map is full, and a periodic sweep
// drops fingerprints whose window has emptied.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

use crate::config::ActivityConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyReason {
    RequestFlood { requests_in_window: usize },
    PathTraversal,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyReason::RequestFlood { .. } => "request_flood",
            AnomalyReason::PathTraversal => "path_traversal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityVerdict {
    pub is_anomalous: bool,
    pub reason: Option<AnomalyReason>,
    pub requests_in_window: usize,
}

impl ActivityVerdict {
    /// Verdict for a request that is not counted; only traversal is flagged.
    pub fn untracked(path: &str) -> Self {
        let reason = is_path_traversal(path).then_some(AnomalyReason::PathTraversal);
        Self {
            is_anomalous: reason.is_some(),
            reason,
            requests_in_window: 0,
        }
    }
}

// (last seen, sequence); the sequence keeps keys unique for equal instants
type RecencyKey = (Instant, u64);

#[derive(Debug)]
struct ActivityWindow {
    timestamps: VecDeque<Instant>,
    recency: RecencyKey,
}

impl ActivityWindow {
    fn trim(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

// STATE: Windows Plus a Last-Seen Index
// Eviction pops the front of `by_recency` instead of scanning every window.
#[derive(Debug, Default)]
struct ActivityState {
    windows: HashMap<String, ActivityWindow>,
    by_recency: BTreeMap<RecencyKey, String>,
    sequence: u64,
}

impl ActivityState {
    fn next_key(&mut self, now: Instant) -> RecencyKey {
        self.sequence = self.sequence.wrapping_add(1);
        (now, self.sequence)
    }

    fn evict_least_recent(&mut self) {
        if let Some((_, fingerprint)) = self.by_recency.pop_first() {
            self.windows.remove(&fingerprint);
        }
    }

    /// Append a request for `fingerprint` and return the trimmed window size.
    fn touch(&mut self, fingerprint: &str, now: Instant, window: Duration, capacity: usize) -> usize {
        if !self.windows.contains_key(fingerprint) && self.windows.len() >= capacity {
            self.evict_least_recent();
        }

        let key = self.next_key(now);
        let entry = self
            .windows
            .entry(fingerprint.to_string())
            .or_insert_with(|| ActivityWindow {
                timestamps: VecDeque::new(),
                recency: key,
            });
        self.by_recency.remove(&entry.recency);
        entry.recency = key;
        entry.timestamps.push_back(now);
        entry.trim(now, window);
        let count = entry.timestamps.len();

        self.by_recency.insert(key, fingerprint.to_string());
        count
    }

    fn remove(&mut self, fingerprint: &str) {
        if let Some(entry) = self.windows.remove(fingerprint) {
            self.by_recency.remove(&entry.recency);
        }
    }
}

/// Composite client key used for activity tracking.
pub fn fingerprint(ip: &str, user_agent: &str) -> String {
    format!("{}|{}", ip, user_agent)
}

pub fn is_path_traversal(path: &str) -> bool {
    if path.contains("../") || path.contains("..\\") {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    ["..%2f", "..%5c", "%2e%2e/", "%2e%2e%2f", "%2e%2e%5c"]
        .iter()
        .any(|encoded| lower.contains(encoded))
}

pub struct ClientActivityTracker {
    config: ActivityConfig,
    state: Arc<RwLock<ActivityState>>,
}

impl ClientActivityTracker {
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(ActivityState::default())),
        }
    }

    pub async fn record_and_check(&self, fingerprint: &str, path: &str) -> ActivityVerdict {
        let now = Instant::now();
        let count = self.state.write().await.touch(
            fingerprint,
            now,
            self.config.window(),
            self.config.max_tracked_clients,
        );

        // Traversal is flagged regardless of volume
        let reason = if is_path_traversal(path) {
            Some(AnomalyReason::PathTraversal)
        } else if count > self.config.flood_threshold {
            Some(AnomalyReason::RequestFlood {
                requests_in_window: count,
            })
        } else {
            None
        };

        ActivityVerdict {
            is_anomalous: reason.is_some(),
            reason,
            requests_in_window: count,
        }
    }

    /// Remove fingerprints with no requests left in the window.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window();
        let mut state = self.state.write().await;
        let ActivityState {
            windows, by_recency, ..
        } = &mut *state;
        let before = windows.len();

        windows.retain(|_, activity| {
            activity.trim(now, window);
            let keep = !activity.timestamps.is_empty();
            if !keep {
                by_recency.remove(&activity.recency);
            }
            keep
        });

        before - windows.len()
    }

    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = tracker.sweep().await;
                if removed > 0 {
                    debug!(removed_clients = removed, "Swept idle activity windows");
                }
            }
        })
    }

    pub async fn tracked_clients(&self) -> usize {
        self.state.read().await.windows.len()
    }

    pub async fn forget(&self, fingerprint: &str) {
        self.state.write().await.remove(fingerprint);
    }
}
