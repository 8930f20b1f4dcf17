//! Integration tests for telemetry initialization and span helpers.

use serde_json::json;
use taskq_rs::config::Config;
use taskq_rs::model::TaskEnvelope;
use taskq_rs::telemetry::{Role, TelemetryConfig};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so a second
    // init in this binary may return Err; that is acceptable.
    let config = TelemetryConfig {
        endpoint: None,
        role: Role::Worker,
        queue: "tasks".to_string(),
        instance_id: "test-1".to_string(),
        default_level: "debug".to_string(),
    };
    let _guard = taskq_rs::telemetry::init_telemetry(config);
}

#[test]
fn telemetry_config_tags_role_and_queue() {
    let config = Config::from_toml_str(
        "database_url = \"postgres://t:t@localhost/t\"\nqueue = \"emails\"\notel_endpoint = \"http://localhost:4317\"\n",
    )
    .unwrap();

    let worker = TelemetryConfig::from_config(&config, Role::Worker);
    assert_eq!(worker.service_name(), "taskq-worker");
    assert_eq!(worker.queue, "emails");
    assert_eq!(worker.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(worker.default_level, config.log_level);

    let submitter = TelemetryConfig::from_config(&config, Role::Dispatcher);
    assert_eq!(submitter.service_name(), "taskq-dispatcher");
    assert_ne!(worker.instance_id, submitter.instance_id);
}

#[test]
fn task_span_creates_and_records_transition() {
    let envelope = TaskEnvelope::new("add", vec![json!(2), json!(3)]);
    let span = taskq_rs::telemetry::task::start_task_span(&envelope, 0);
    taskq_rs::telemetry::task::record_state_transition(&span, "PENDING", "STARTED");
    taskq_rs::telemetry::task::record_state_transition(&span, "STARTED", "SUCCESS");
}

#[test]
fn metric_instruments_are_noops_without_provider() {
    use opentelemetry::KeyValue;

    taskq_rs::telemetry::metrics::tasks_submitted()
        .add(1, &[KeyValue::new("task_type", "add"), KeyValue::new("result", "ok")]);
    taskq_rs::telemetry::metrics::task_duration_ms()
        .record(1.5, &[KeyValue::new("task_type", "add"), KeyValue::new("outcome", "success")]);
}
