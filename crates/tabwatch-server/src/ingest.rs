//! Telemetry ingestion pipeline:
//! idempotency lookup → shutdown or coalescing short-circuits → session
//! upsert → health outcome → subscriber notification → idempotency store.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, info, warn};

use tabwatch_core::config::{CoalesceConfig, FeatureFlags, IdempotencyConfig};
use tabwatch_core::events::UpdateKind;
use tabwatch_core::ids::{RequestId, TabId, UserId};
use tabwatch_core::session::{SessionEvent, TelemetryRequest, UpsertOutcome};
use tabwatch_core::{IngestError, AUDIT_TARGET};
use tabwatch_store::{HeartbeatCoalescer, IdempotencyCache, SessionStore};
use tabwatch_telemetry::{HealthAggregator, Outcome};

use crate::notify::{Notification, Notifier};

/// HTTP status and serialized JSON body for one ingestion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestReply {
    pub status: u16,
    pub body: String,
}

impl IngestReply {
    fn ok(body: String) -> Self {
        Self { status: 200, body }
    }

    pub fn error(err: &IngestError) -> Self {
        let mut body = json!({ "success": false, "error": err.to_string() });
        if let IngestError::VersionConflict {
            current_version,
            expected_version,
        } = err
        {
            body["conflict"] = json!({
                "currentVersion": current_version,
                "expectedVersion": expected_version,
            });
        }
        Self {
            status: err.http_status(),
            body: body.to_string(),
        }
    }
}

fn accepted(outcome: Option<&UpsertOutcome>, coalesced: bool) -> String {
    let mut body = json!({ "success": true, "deduplicated": false });
    if let Some(outcome) = outcome {
        body["sessionVersion"] = json!(outcome.version);
        body["updatedAtServer"] = json!(outcome.updated_at);
    }
    if coalesced {
        body["coalesced"] = json!(true);
    }
    body.to_string()
}

pub struct TelemetryPipeline {
    flags: FeatureFlags,
    sessions: Arc<SessionStore>,
    idempotency: IdempotencyCache<String>,
    coalescer: HeartbeatCoalescer,
    health: Arc<HealthAggregator>,
    notifier: Arc<Notifier>,
}

impl TelemetryPipeline {
    pub fn new(
        flags: FeatureFlags,
        idempotency: &IdempotencyConfig,
        coalesce: &CoalesceConfig,
        sessions: Arc<SessionStore>,
        health: Arc<HealthAggregator>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            flags,
            sessions,
            idempotency: IdempotencyCache::new(idempotency),
            coalescer: HeartbeatCoalescer::new(coalesce),
            health,
            notifier,
        }
    }

    pub async fn ingest(
        &self,
        request: TelemetryRequest,
        source_ip: Option<String>,
        request_id: RequestId,
    ) -> IngestReply {
        let started = Instant::now();
        let event = match request.validate(source_ip, request_id.clone()) {
            Ok(event) => event,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "telemetry without identity");
                return IngestReply::error(&e);
            }
        };

        // Replays are answered without touching health: the first
        // submission already counted.
        if self.flags.idempotency_guard {
            if let Some(body) = self.idempotency.get(&event.operation_id) {
                info!(
                    request_id = %event.request_id,
                    operation_id = %event.operation_id,
                    user_id = %event.user_id,
                    tab_id = %event.tab_id,
                    event_type = %event.kind,
                    "idempotent operation replayed"
                );
                return IngestReply::ok(body);
            }
        }

        let result = self.process(&event).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok((body, label)) => {
                if self.flags.idempotency_guard {
                    self.idempotency.set(event.operation_id.clone(), body.clone());
                }
                self.health.record(Outcome::ok(label, latency_ms));
                IngestReply::ok(body)
            }
            Err(e) if e.is_conflict() => {
                self.health.record(Outcome::conflict(event.kind.as_str(), latency_ms));
                warn!(
                    request_id = %event.request_id,
                    operation_id = %event.operation_id,
                    user_id = %event.user_id,
                    tab_id = %event.tab_id,
                    error = %e,
                    "telemetry version conflict"
                );
                IngestReply::error(&e)
            }
            Err(e) => {
                self.health.record(Outcome::failed(event.kind.as_str(), latency_ms));
                error!(
                    request_id = %event.request_id,
                    operation_id = %event.operation_id,
                    user_id = %event.user_id,
                    tab_id = %event.tab_id,
                    event_type = %event.kind,
                    error_kind = e.error_kind(),
                    error = %e,
                    "telemetry processing failed"
                );
                IngestReply::error(&e)
            }
        }
    }

    /// Returns the response body and the label recorded in the health window.
    async fn process(&self, event: &SessionEvent) -> Result<(String, String), IngestError> {
        if event.is_shutdown() {
            self.disconnect(&event.user_id, &event.tab_id).await;
            info!(
                target: AUDIT_TARGET,
                request_id = %event.request_id,
                operation_id = %event.operation_id,
                user_id = %event.user_id,
                tab_id = %event.tab_id,
                "telemetry shutdown processed"
            );
            return Ok((accepted(None, false), event.kind.as_str().to_string()));
        }

        if self.flags.heartbeat_coalescing && self.coalescer.should_coalesce(event) {
            debug!(
                request_id = %event.request_id,
                user_id = %event.user_id,
                tab_id = %event.tab_id,
                "heartbeat coalesced"
            );
            return Ok((accepted(None, true), "heartbeat_coalesced".to_string()));
        }

        let outcome = self.sessions.upsert(event).await?;
        if self.flags.heartbeat_coalescing {
            self.coalescer.mark_persisted(event);
        }
        self.notifier
            .publish(Notification::new(
                event.user_id.clone(),
                UpdateKind::Update,
                json!({
                    "tabId": event.tab_id,
                    "state": event.state,
                    "ip": event.source_ip,
                }),
            ))
            .await;

        info!(
            target: AUDIT_TARGET,
            request_id = %event.request_id,
            operation_id = %event.operation_id,
            user_id = %event.user_id,
            tab_id = %event.tab_id,
            event_type = %event.kind,
            version = outcome.version,
            "telemetry update processed"
        );
        Ok((accepted(Some(&outcome), false), event.kind.as_str().to_string()))
    }

    /// Explicit logout: same effect as a shutdown event.
    pub async fn logout(&self, user_id: &UserId, tab_id: &TabId, request_id: &RequestId) {
        self.disconnect(user_id, tab_id).await;
        info!(
            target: AUDIT_TARGET,
            request_id = %request_id,
            user_id = %user_id,
            tab_id = %tab_id,
            "logout processed"
        );
    }

    async fn disconnect(&self, user_id: &UserId, tab_id: &TabId) {
        self.sessions.remove(user_id, tab_id).await;
        self.coalescer.forget(tab_id);
        self.notifier
            .publish(Notification::new(
                user_id.clone(),
                UpdateKind::Disconnected,
                json!({ "tabId": tab_id }),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SubscriberRegistry;
    use tabwatch_core::config::{HealthConfig, QueueConfig, SaturationPolicy, SessionConfig};
    use tabwatch_core::session::SessionState;
    use tabwatch_store::{DurableWriteQueue, MemoryRecordStore, RetryingExecutor};

    struct Harness {
        pipeline: TelemetryPipeline,
        sessions: Arc<SessionStore>,
        health: Arc<HealthAggregator>,
        records: Arc<MemoryRecordStore>,
        registry: Arc<SubscriberRegistry>,
    }

    fn harness(flags: FeatureFlags, queue_capacity: usize) -> Harness {
        let records = Arc::new(MemoryRecordStore::new());
        let queue = DurableWriteQueue::in_memory(
            &QueueConfig {
                capacity: queue_capacity,
                ..QueueConfig::with_log_path(std::env::temp_dir().join("unused.log"))
            },
            SaturationPolicy::Reject,
        );
        let sessions = Arc::new(SessionStore::new(
            &flags,
            SessionConfig::default(),
            records.clone(),
            Arc::new(RetryingExecutor::disabled()),
            Arc::new(queue),
        ));
        let health = Arc::new(HealthAggregator::new(HealthConfig::default()));
        let registry = Arc::new(SubscriberRegistry::new(64));
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), Arc::clone(&sessions), None));
        let pipeline = TelemetryPipeline::new(
            flags,
            &IdempotencyConfig::default(),
            &CoalesceConfig::default(),
            Arc::clone(&sessions),
            Arc::clone(&health),
            notifier,
        );
        Harness {
            pipeline,
            sessions,
            health,
            records,
            registry,
        }
    }

    fn request(kind: &str, state: &str) -> TelemetryRequest {
        TelemetryRequest {
            user_id: Some("u1".into()),
            tab_id: Some("t1".into()),
            event_type: Some(kind.into()),
            state: Some(state.into()),
            ..TelemetryRequest::default()
        }
    }

    fn with_op(mut r: TelemetryRequest, op: &str) -> TelemetryRequest {
        r.operation_id = Some(op.into());
        r
    }

    async fn send(h: &Harness, r: TelemetryRequest) -> (u16, serde_json::Value) {
        let reply = h
            .pipeline
            .ingest(r, Some("10.0.0.1".into()), RequestId::new())
            .await;
        (reply.status, serde_json::from_str(&reply.body).unwrap())
    }

    #[tokio::test]
    async fn unchanged_heartbeats_are_coalesced() {
        let h = harness(FeatureFlags::default(), 100);
        let mut bodies = Vec::new();
        for i in 0..3 {
            let (status, body) = send(&h, with_op(request("heartbeat", "FOCUSED"), &format!("hb-{i}"))).await;
            assert_eq!(status, 200);
            assert_eq!(body["success"], true);
            bodies.push(body);
        }
        assert_eq!(bodies[0]["sessionVersion"], 1);
        assert!(bodies[0].get("coalesced").is_none());
        assert_eq!(bodies[1]["coalesced"], true);
        assert_eq!(bodies[2]["coalesced"], true);

        // Only the first reached the session store.
        assert_eq!(h.sessions.queue().len(), 1);
        assert_eq!(h.health.event_count(), 3);
    }

    #[tokio::test]
    async fn changed_state_is_not_coalesced() {
        let h = harness(FeatureFlags::default(), 100);
        send(&h, request("heartbeat", "FOCUSED")).await;
        let (_, body) = send(&h, with_op(request("heartbeat", "HIDDEN"), "x")).await;
        assert_eq!(body["sessionVersion"], 2);
    }

    #[tokio::test]
    async fn replayed_operation_returns_identical_body_once() {
        let h = harness(FeatureFlags::default(), 100);
        let (_id, mut rx) = h.registry.register();

        let first = h
            .pipeline
            .ingest(with_op(request("state_change", "FOCUSED"), "op-1"), None, RequestId::new())
            .await;
        let second = h
            .pipeline
            .ingest(with_op(request("state_change", "FOCUSED"), "op-1"), None, RequestId::new())
            .await;

        assert_eq!(first, second);
        assert_eq!(h.health.event_count(), 1, "replay must not double count");
        // One upsert + one log task, not two of each.
        assert_eq!(h.sessions.queue().len(), 2);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "replay must not notify again");
    }

    #[tokio::test]
    async fn derived_operation_id_collapses_client_retries() {
        let h = harness(FeatureFlags::default(), 100);
        let mut r = request("state_change", "FOCUSED");
        r.timestamp = Some(json!(1_700_000_000_000u64));
        let (_, a) = send(&h, r.clone()).await;
        let (_, b) = send(&h, r).await;
        assert_eq!(a, b);
        assert_eq!(h.sessions.queue().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_removes_session_and_notifies() {
        let h = harness(FeatureFlags::default(), 100);
        send(&h, request("init", "FOCUSED")).await;
        assert_eq!(h.sessions.hot_len(), 1);

        let (_id, mut rx) = h.registry.register();
        let (status, body) = send(&h, request("shutdown", "HIDDEN")).await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({ "success": true, "deduplicated": false }));
        assert_eq!(h.sessions.hot_len(), 0);

        let msg: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(msg["payload"]["eventType"], "disconnected");
        assert_eq!(msg["payload"]["data"]["tabId"], "t1");
    }

    #[tokio::test]
    async fn probably_closed_state_is_a_shutdown() {
        let h = harness(FeatureFlags::default(), 100);
        send(&h, request("init", "FOCUSED")).await;
        send(&h, request("state_change", "TAB_PROBABLY_CLOSED")).await;
        assert_eq!(h.sessions.hot_len(), 0);
    }

    #[tokio::test]
    async fn missing_identity_is_rejected() {
        let h = harness(FeatureFlags::default(), 100);
        let (status, body) = send(
            &h,
            TelemetryRequest {
                tab_id: Some("t1".into()),
                ..TelemetryRequest::default()
            },
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["success"], false);
        assert_eq!(h.health.event_count(), 0);
    }

    #[tokio::test]
    async fn stale_version_gets_conflict() {
        let flags = FeatureFlags {
            strict_version_check: true,
            ..FeatureFlags::default()
        };
        let h = harness(flags, 100);
        send(&h, request("init", "FOCUSED")).await;
        let mut r = request("state_change", "HIDDEN");
        r.version = Some(1);
        let (status, body) = send(&h, r.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(body["sessionVersion"], 2);

        r.operation_id = Some("retry-with-stale-version".into());
        let (status, body) = send(&h, r).await;
        assert_eq!(status, 409);
        assert_eq!(body["conflict"], json!({ "currentVersion": 2, "expectedVersion": 1 }));

        let snapshot = h.health.snapshot(std::iter::empty(), tabwatch_core::BreakerState::Closed);
        assert_eq!(snapshot.conflict_count, 1);
        assert_eq!(
            h.records.session(&TabId::from_raw("t1")).unwrap().state,
            Some(SessionState::Hidden)
        );
    }

    #[tokio::test]
    async fn saturated_queue_is_unavailable() {
        let h = harness(FeatureFlags::default(), 1);
        let (status, body) = send(&h, request("state_change", "FOCUSED")).await;
        assert_eq!(status, 503);
        assert_eq!(body["success"], false);
        let snapshot = h.health.snapshot(std::iter::empty(), tabwatch_core::BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 1);
    }

    #[tokio::test]
    async fn logout_behaves_like_shutdown() {
        let h = harness(FeatureFlags::default(), 100);
        send(&h, request("init", "FOCUSED")).await;
        h.pipeline
            .logout(&UserId::from_raw("u1"), &TabId::from_raw("t1"), &RequestId::new())
            .await;
        assert_eq!(h.sessions.hot_len(), 0);
        let kinds: Vec<&str> = h
            .sessions
            .queue()
            .pending()
            .iter()
            .map(|t| t.action.kind())
            .collect();
        assert_eq!(kinds, vec!["upsert", "log", "delete"]);
    }
}
