//! Monitor / intervention loop.
//!
//! Polls the event bus on a configurable interval. For each configured
//! issue-type threshold it counts matching events in the trailing window;
//! when one trips, it emits `intervention:triggered` with the proposed
//! remediation. Auto-actionable interventions (confidence permitting) are
//! handed to a pluggable executor; everything else is tagged as requiring
//! approval. A per-hour rate limiter prevents thrashing.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::models::config::{IssueThreshold, MonitorConfig};
use crate::domain::models::event::{EmitOpts, EventSeverity};
use crate::services::event_bus::{types, EventBus, PollQuery};

/// Minimum confidence for applying a fix without approval.
pub const AUTO_APPLY_CONFIDENCE: f64 = 0.8;

/// A tripped threshold and its proposed remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    /// The issue's event type.
    pub issue_type: String,
    pub event_count: u64,
    pub window_ms: u64,
    pub confidence: f64,
    /// Remediation action name from config, when one is mapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub requires_approval: bool,
}

/// Pluggable fix application (the external validator boundary).
#[async_trait]
pub trait InterventionExecutor: Send + Sync {
    async fn apply_fix(&self, intervention: &Intervention) -> Result<(), String>;
}

type HourlyLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// The monitor. One per process; owns no state beyond trigger bookkeeping.
pub struct Monitor {
    bus: Arc<EventBus>,
    config: MonitorConfig,
    executor: Option<Arc<dyn InterventionExecutor>>,
    limiter: HourlyLimiter,
    /// Last event id that triggered per issue type; a threshold re-trips only
    /// on new events.
    last_trigger: std::sync::Mutex<HashMap<String, u64>>,
}

impl Monitor {
    pub fn new(bus: Arc<EventBus>, config: MonitorConfig) -> Self {
        let per_hour = NonZeroU32::new(config.max_interventions_per_hour.max(1))
            .expect("nonzero intervention cap");
        Self {
            bus,
            config,
            executor: None,
            limiter: RateLimiter::direct(Quota::per_hour(per_hour)),
            last_trigger: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Install the apply-fix executor.
    pub fn with_executor(mut self, executor: Arc<dyn InterventionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.polling_interval.max(1));
        info!(interval_secs = interval.as_secs(), "monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("monitor stopped");
    }

    /// One polling pass over every configured threshold.
    pub async fn tick(&self) {
        for (issue_type, threshold) in &self.config.thresholds {
            if let Some(intervention) = self.evaluate(issue_type, threshold) {
                self.dispatch(intervention).await;
            }
        }
    }

    fn evaluate(&self, issue_type: &str, threshold: &IssueThreshold) -> Option<Intervention> {
        let window_start = Utc::now() - chrono::Duration::milliseconds(threshold.window_ms as i64);
        let events = self.bus.poll(
            &PollQuery::since(0)
                .with_types(&[issue_type])
                .with_limit(usize::MAX),
        );
        let in_window: Vec<_> = events
            .iter()
            .filter(|e| e.timestamp >= window_start)
            .collect();
        let count = in_window.len() as u64;
        let newest_id = in_window.last().map(|e| e.id).unwrap_or(0);

        let count_tripped = threshold.count.is_some_and(|c| count >= c);
        let window_secs = (threshold.window_ms as f64 / 1000.0).max(f64::EPSILON);
        let rate_tripped = threshold.rate.is_some_and(|r| count as f64 / window_secs > r);
        if !count_tripped && !rate_tripped {
            return None;
        }

        // Only new events since the last trigger count as a fresh trip.
        {
            let mut last = self.last_trigger.lock().expect("trigger lock");
            let previous = last.get(issue_type).copied().unwrap_or(0);
            if newest_id <= previous {
                return None;
            }
            last.insert(issue_type.to_string(), newest_id);
        }

        if self.limiter.check().is_err() {
            warn!(issue = %issue_type, "intervention cap reached; suppressing");
            return None;
        }

        let requires_approval =
            !(threshold.auto_action && threshold.confidence >= AUTO_APPLY_CONFIDENCE);
        Some(Intervention {
            issue_type: issue_type.to_string(),
            event_count: count,
            window_ms: threshold.window_ms,
            confidence: threshold.confidence,
            action: self.config.actions.get(issue_type).cloned(),
            requires_approval,
        })
    }

    async fn dispatch(&self, intervention: Intervention) {
        self.bus.emit(
            types::INTERVENTION_TRIGGERED,
            json!({
                "issueType": intervention.issue_type,
                "eventCount": intervention.event_count,
                "windowMs": intervention.window_ms,
                "confidence": intervention.confidence,
                "action": intervention.action,
                "requiresApproval": intervention.requires_approval,
            }),
            EmitOpts::severity(EventSeverity::Warn),
        );

        if intervention.requires_approval {
            debug!(issue = %intervention.issue_type, "intervention awaiting approval");
            return;
        }
        let Some(ref executor) = self.executor else {
            debug!(issue = %intervention.issue_type, "no executor installed");
            return;
        };
        match executor.apply_fix(&intervention).await {
            Ok(()) => {
                self.bus.emit(
                    types::INTERVENTION_SUCCESSFUL,
                    json!({ "issueType": intervention.issue_type }),
                    EmitOpts::default(),
                );
            }
            Err(e) => {
                self.bus.emit(
                    types::INTERVENTION_FAILED,
                    json!({ "issueType": intervention.issue_type, "error": e }),
                    EmitOpts::severity(EventSeverity::Error),
                );
            }
        }
    }

    /// Record an externally decided rollback of an earlier intervention.
    pub fn report_rollback(&self, issue_type: &str, reason: &str) {
        self.bus.emit(
            types::INTERVENTION_ROLLED_BACK,
            json!({ "issueType": issue_type, "reason": reason }),
            EmitOpts::severity(EventSeverity::Warn),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(issue: &str, threshold: IssueThreshold) -> MonitorConfig {
        let mut thresholds = HashMap::new();
        thresholds.insert(issue.to_string(), threshold);
        let mut actions = HashMap::new();
        actions.insert(issue.to_string(), "restart-agent".to_string());
        MonitorConfig {
            polling_interval: 1,
            thresholds,
            actions,
            max_interventions_per_hour: 10,
        }
    }

    struct RecordingExecutor {
        applied: std::sync::Mutex<Vec<Intervention>>,
        fail: bool,
    }

    #[async_trait]
    impl InterventionExecutor for RecordingExecutor {
        async fn apply_fix(&self, intervention: &Intervention) -> Result<(), String> {
            self.applied.lock().unwrap().push(intervention.clone());
            if self.fail {
                Err("fix exploded".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn trip_events(bus: &EventBus, issue: &str, n: usize) {
        for _ in 0..n {
            bus.emit_info(issue, json!({}));
        }
    }

    #[tokio::test]
    async fn test_threshold_trips_and_emits() {
        let bus = Arc::new(EventBus::default());
        let monitor = Monitor::new(
            bus.clone(),
            config_with(
                "task:failed",
                IssueThreshold {
                    count: Some(3),
                    rate: None,
                    window_ms: 60_000,
                    confidence: 0.5,
                    auto_action: false,
                },
            ),
        );

        trip_events(&bus, "task:failed", 3);
        monitor.tick().await;

        let triggered = bus.poll(
            &PollQuery::since(0).with_types(&[types::INTERVENTION_TRIGGERED]),
        );
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].payload["issueType"], "task:failed");
        assert_eq!(triggered[0].payload["requiresApproval"], true);
        assert_eq!(triggered[0].payload["action"], "restart-agent");
    }

    #[tokio::test]
    async fn test_below_threshold_is_quiet() {
        let bus = Arc::new(EventBus::default());
        let monitor = Monitor::new(
            bus.clone(),
            config_with(
                "task:failed",
                IssueThreshold {
                    count: Some(5),
                    rate: None,
                    window_ms: 60_000,
                    confidence: 0.5,
                    auto_action: false,
                },
            ),
        );
        trip_events(&bus, "task:failed", 2);
        monitor.tick().await;
        assert!(bus
            .poll(&PollQuery::since(0).with_types(&[types::INTERVENTION_TRIGGERED]))
            .is_empty());
    }

    #[tokio::test]
    async fn test_auto_action_invokes_executor_and_reports() {
        let bus = Arc::new(EventBus::default());
        let executor = Arc::new(RecordingExecutor {
            applied: std::sync::Mutex::new(Vec::new()),
            fail: false,
        });
        let monitor = Monitor::new(
            bus.clone(),
            config_with(
                "ipc:connection_failed",
                IssueThreshold {
                    count: Some(1),
                    rate: None,
                    window_ms: 60_000,
                    confidence: 0.9,
                    auto_action: true,
                },
            ),
        )
        .with_executor(executor.clone());

        trip_events(&bus, "ipc:connection_failed", 1);
        monitor.tick().await;

        assert_eq!(executor.applied.lock().unwrap().len(), 1);
        let ok = bus.poll(
            &PollQuery::since(0).with_types(&[types::INTERVENTION_SUCCESSFUL]),
        );
        assert_eq!(ok.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fix_reports_failure() {
        let bus = Arc::new(EventBus::default());
        let executor = Arc::new(RecordingExecutor {
            applied: std::sync::Mutex::new(Vec::new()),
            fail: true,
        });
        let monitor = Monitor::new(
            bus.clone(),
            config_with(
                "task:failed",
                IssueThreshold {
                    count: Some(1),
                    rate: None,
                    window_ms: 60_000,
                    confidence: 0.95,
                    auto_action: true,
                },
            ),
        )
        .with_executor(executor);

        trip_events(&bus, "task:failed", 1);
        monitor.tick().await;

        let failed = bus.poll(&PollQuery::since(0).with_types(&[types::INTERVENTION_FAILED]));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload["error"], "fix exploded");
    }

    #[tokio::test]
    async fn test_no_retrigger_without_new_events() {
        let bus = Arc::new(EventBus::default());
        let monitor = Monitor::new(
            bus.clone(),
            config_with(
                "task:failed",
                IssueThreshold {
                    count: Some(2),
                    rate: None,
                    window_ms: 600_000,
                    confidence: 0.5,
                    auto_action: false,
                },
            ),
        );

        trip_events(&bus, "task:failed", 2);
        monitor.tick().await;
        monitor.tick().await;

        let triggered = bus.poll(
            &PollQuery::since(0).with_types(&[types::INTERVENTION_TRIGGERED]),
        );
        assert_eq!(triggered.len(), 1);

        // A new matching event re-arms the trigger.
        trip_events(&bus, "task:failed", 1);
        monitor.tick().await;
        let triggered = bus.poll(
            &PollQuery::since(0).with_types(&[types::INTERVENTION_TRIGGERED]),
        );
        assert_eq!(triggered.len(), 2);
    }

    #[tokio::test]
    async fn test_hourly_cap_suppresses() {
        let bus = Arc::new(EventBus::default());
        let mut config = config_with(
            "task:failed",
            IssueThreshold {
                count: Some(1),
                rate: None,
                window_ms: 600_000,
                confidence: 0.5,
                auto_action: false,
            },
        );
        config.max_interventions_per_hour = 1;
        let monitor = Monitor::new(bus.clone(), config);

        trip_events(&bus, "task:failed", 1);
        monitor.tick().await;
        trip_events(&bus, "task:failed", 1);
        monitor.tick().await;

        let triggered = bus.poll(
            &PollQuery::since(0).with_types(&[types::INTERVENTION_TRIGGERED]),
        );
        assert_eq!(triggered.len(), 1, "second trip suppressed by hourly cap");
    }

    #[tokio::test]
    async fn test_rate_threshold() {
        let bus = Arc::new(EventBus::default());
        let monitor = Monitor::new(
            bus.clone(),
            config_with(
                "validation:error_with_suggestion",
                IssueThreshold {
                    count: None,
                    rate: Some(0.5), // events per second
                    window_ms: 10_000,
                    confidence: 0.5,
                    auto_action: false,
                },
            ),
        );
        // 6 events in a 10s window = 0.6/s > 0.5/s.
        trip_events(&bus, "validation:error_with_suggestion", 6);
        monitor.tick().await;
        let triggered = bus.poll(
            &PollQuery::since(0).with_types(&[types::INTERVENTION_TRIGGERED]),
        );
        assert_eq!(triggered.len(), 1);
    }
}
