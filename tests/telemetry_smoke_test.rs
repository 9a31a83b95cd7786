//! Smoke tests for OTLP export.
//!
//! These tests require an OTLP collector on localhost:4317 backed by Tempo
//! (traces, port 3200) and Prometheus (metrics, port 9090).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use hookq::model::{Blocking, WorkItem, WorkItemId};
use hookq::shard::Sharding;
use opentelemetry::KeyValue;

static TELEMETRY: OnceLock<hookq::telemetry::TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static hookq::telemetry::TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        hookq::telemetry::init_telemetry(hookq::telemetry::TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "hookq-smoke-test".to_string(),
            log_level: "info".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &hookq::telemetry::TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

#[test]
#[ignore]
fn smoke_traces() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        {
            let item = WorkItem {
                id: WorkItemId(1),
                shard: Sharding::single().shard_for("smoke"),
                url: "http://localhost/smoke".to_string(),
                queue_name: "smoke".to_string(),
                debug_info: None,
                created_at: Utc::now(),
                last_attempted_at: Some(Utc::now()),
                is_ingested: true,
                internal: None,
                blocking: Blocking::None,
                external_lock_id_when_complete: None,
            };
            let span = hookq::telemetry::work::start_dispatch_span(&item);
            let _enter = span.enter();
            hookq::telemetry::work::record_outcome(&span, "complete");
        }

        flush_and_wait(guard).await;

        let resp = reqwest::Client::new()
            .get("http://localhost:3200/api/search")
            .query(&[("tags", "service.name=hookq-smoke-test"), ("limit", "5")])
            .send()
            .await
            .expect("failed to query Tempo");
        assert!(
            resp.status().is_success(),
            "Tempo query failed: {}",
            resp.status()
        );

        let body: serde_json::Value = resp.json().await.expect("failed to parse Tempo response");
        assert!(
            body["traces"].as_array().is_some_and(|t| !t.is_empty()),
            "expected traces in Tempo, got: {body}"
        );
    });
}

#[test]
#[ignore]
fn smoke_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        hookq::telemetry::metrics::work_dispatched().add(
            1,
            &[
                KeyValue::new("outcome", "complete"),
                KeyValue::new("http.response.status_code", 200_i64),
            ],
        );
        hookq::telemetry::metrics::operation_duration_ms()
            .record(42.5, &[KeyValue::new("operation", "smoke")]);

        flush_and_wait(guard).await;

        let resp = reqwest::Client::new()
            .get("http://localhost:9090/api/v1/query")
            .query(&[("query", "hookq_work_dispatched_total")])
            .send()
            .await
            .expect("failed to query Prometheus");
        assert!(
            resp.status().is_success(),
            "Prometheus query failed: {}",
            resp.status()
        );

        let body: serde_json::Value = resp
            .json()
            .await
            .expect("failed to parse Prometheus response");
        assert!(
            body["data"]["result"]
                .as_array()
                .is_some_and(|r| !r.is_empty()),
            "expected metric results in Prometheus, got: {body}"
        );
    });
}
