//! Process-wide session registry
//!
//! Maps session ids to running orchestrators: insert on connect, remove on
//! disconnect. This is the only process-wide mutable structure; the
//! concurrent map keeps session creation and teardown safe without a global
//! lock. Also serves the metrics surface consumed by the HTTP layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use voicebridge_config::RegistryConfig;
use voicebridge_core::{Error, Result};

use crate::orchestrator::{Lifecycle, SessionHandle, TurnRecord};

/// Aggregated cost across turns
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostBreakdown {
    pub stt: f64,
    pub llm: f64,
    pub tts: f64,
    pub total: f64,
}

impl CostBreakdown {
    fn add(&mut self, record: &TurnRecord) {
        self.stt += record.cost.stt_cost;
        self.llm += record.cost.llm_cost;
        self.tts += record.cost.tts_cost;
        self.total += record.cost.estimated_cost_usd;
    }
}

/// Process-wide metrics summary
#[derive(Debug, Clone, Serialize)]
pub struct AggregateMetrics {
    pub active_sessions: usize,
    pub total_sessions_created: u64,
    pub total_turns: usize,
    pub completed_turns: usize,
    pub cancelled_turns: usize,
    pub cost: CostBreakdown,
    pub average_end_to_end_ms: Option<f64>,
    pub target_latency_ms: u64,
    pub target_met: bool,
}

/// Per-session metrics history
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub lifecycle: Lifecycle,
    pub turn_count: usize,
    pub average_end_to_end_ms: Option<f64>,
    pub cost: CostBreakdown,
    pub turns: Vec<TurnRecord>,
}

fn average_end_to_end(records: &[TurnRecord]) -> Option<f64> {
    let completed: Vec<u64> = records
        .iter()
        .filter(|r| r.outcome.is_completed())
        .map(|r| r.latency.end_to_end_ms)
        .collect();
    if completed.is_empty() {
        return None;
    }
    Some(completed.iter().sum::<u64>() as f64 / completed.len() as f64)
}

/// Registry of active sessions
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    created_total: AtomicU64,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            created_total: AtomicU64::new(0),
            config,
        }
    }

    /// Register a freshly connected session
    pub fn insert(&self, handle: Arc<SessionHandle>) -> Result<()> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(Error::SessionLimit(self.config.max_sessions));
        }
        let id = handle.session_id().to_string();
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateSession(id)),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                self.created_total.fetch_add(1, Ordering::Relaxed);
                tracing::info!(session_id = %id, active = self.sessions.len(), "session registered");
                Ok(())
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Drop the mapping without ending the session
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(session_id).map(|(_, handle)| handle)
    }

    /// End a session and drop its mapping
    pub async fn terminate(&self, session_id: &str) -> Result<()> {
        let handle = self
            .remove(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        handle.end().await;
        tracing::info!(session_id, active = self.sessions.len(), "session terminated");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn total_created(&self) -> u64 {
        self.created_total.load(Ordering::Relaxed)
    }

    /// Aggregate latency/cost summary across all registered sessions
    pub fn aggregate(&self) -> AggregateMetrics {
        let mut total_turns = 0;
        let mut completed_turns = 0;
        let mut cost = CostBreakdown::default();
        let mut e2e_sum = 0u64;
        let mut e2e_count = 0usize;

        for session in self.sessions.iter() {
            for record in session.value().shared().records() {
                total_turns += 1;
                if record.outcome.is_completed() {
                    completed_turns += 1;
                    e2e_sum += record.latency.end_to_end_ms;
                    e2e_count += 1;
                }
                cost.add(&record);
            }
        }

        let average_end_to_end_ms =
            (e2e_count > 0).then(|| e2e_sum as f64 / e2e_count as f64);
        AggregateMetrics {
            active_sessions: self.sessions.len(),
            total_sessions_created: self.total_created(),
            total_turns,
            completed_turns,
            cancelled_turns: total_turns - completed_turns,
            cost,
            average_end_to_end_ms,
            target_latency_ms: self.config.target_latency_ms,
            target_met: average_end_to_end_ms
                .is_some_and(|avg| avg <= self.config.target_latency_ms as f64),
        }
    }

    /// Per-session latency/cost history
    ///
    /// Fails with `NotFound` for an unknown session id.
    pub fn session_metrics(&self, session_id: &str) -> Result<SessionMetrics> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        let shared = handle.shared();
        let records = shared.records();

        let mut cost = CostBreakdown::default();
        for record in &records {
            cost.add(record);
        }

        Ok(SessionMetrics {
            session_id: shared.session_id().to_string(),
            created_at: shared.created_at(),
            lifecycle: shared.lifecycle(),
            turn_count: records.len(),
            average_end_to_end_ms: average_end_to_end(&records),
            cost,
            turns: records,
        })
    }

    /// Background eviction of idle sessions
    ///
    /// Returns a shutdown sender; set it to `true` to stop the task.
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(self);
        let interval = registry.config.cleanup_interval();
        let timeout = registry.config.session_timeout();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired: Vec<String> = registry
                            .sessions
                            .iter()
                            .filter(|s| {
                                let shared = s.value().shared();
                                shared.lifecycle() == Lifecycle::Ended || shared.idle_for() > timeout
                            })
                            .map(|s| s.key().clone())
                            .collect();
                        for id in expired {
                            tracing::info!(session_id = %id, "evicting idle session");
                            let _ = registry.terminate(&id).await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("session cleanup task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
