use chrono::{Duration, Utc};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use farm::error::Error;
use farm::identity::normalize;
use farm::model::{RunState, TagValue};
use farm::source::airflow::{AirflowSource, DagRun, task_sub_record};
use farm::source::argo::{ArgoSource, NodeStatus, Workflow, active_in_window, node_sub_records};
use farm::source::{ExclusionFilter, SnapshotSource, TimeWindow};

// ---------------------------------------------------------------------------
// Argo
// ---------------------------------------------------------------------------

fn argo_workflow() -> Workflow {
    serde_json::from_value(json!({
        "metadata": {
            "name": "etl-cron-1704715200",
            "namespace": "pipelines",
            "uid": "6f1c-uid",
            "generateName": "etl-cron-",
            "creationTimestamp": "2024-01-08T12:00:00Z",
            "labels": {
                "workflows.argoproj.io/cron-workflow": "etl-cron",
                "workflows.argoproj.io/completed": "true"
            }
        },
        "spec": {
            "arguments": { "parameters": [ { "name": "date", "value": "2024-01-08" }, { "name": "dry_run" } ] }
        },
        "status": {
            "phase": "Failed",
            "startedAt": "2024-01-08T12:00:01Z",
            "finishedAt": "2024-01-08T12:05:00Z",
            "nodes": {
                "etl-cron-1704715200": {
                    "id": "etl-cron-1704715200",
                    "name": "etl-cron-1704715200",
                    "displayName": "etl-cron-1704715200",
                    "type": "DAG",
                    "phase": "Failed",
                    "startedAt": "2024-01-08T12:00:01Z",
                    "finishedAt": "2024-01-08T12:05:00Z",
                    "children": ["etl-cron-1704715200-111"]
                },
                "etl-cron-1704715200-111": {
                    "id": "etl-cron-1704715200-111",
                    "name": "etl-cron-1704715200.extract",
                    "displayName": "extract",
                    "type": "Pod",
                    "phase": "Failed",
                    "templateName": "extract",
                    "boundaryID": "etl-cron-1704715200",
                    "message": "Error (exit code 1)",
                    "startedAt": "2024-01-08T12:00:02Z",
                    "finishedAt": "0001-01-01T00:00:00Z"
                }
            }
        }
    }))
    .unwrap()
}

#[test]
fn argo_workflow_converts_to_snapshot() {
    let source = ArgoSource::new(
        "https://argo.example.com",
        "pipelines",
        None,
        Some("https://argo-ui.example.com/".into()),
    )
    .unwrap();
    let snapshot = source.snapshot(argo_workflow());

    assert_eq!(snapshot.id, "6f1c-uid");
    assert_eq!(snapshot.logical_name, "etl-cron-1704715200");
    assert_eq!(snapshot.state, RunState::Failed);
    assert_eq!(snapshot.kind, "Workflow");
    assert_eq!(snapshot.namespace.as_deref(), Some("pipelines"));
    assert_eq!(
        snapshot.url.as_deref(),
        Some("https://argo-ui.example.com/workflows/pipelines/etl-cron-1704715200")
    );
    assert!(snapshot.created_at.is_some());
    assert!(snapshot.finished_at.is_some());
    assert_eq!(snapshot.parameters.len(), 2);
    assert!(snapshot.parameters[1].value.is_none());
    assert_eq!(snapshot.details["completed"], TagValue::from("true"));
    assert_eq!(snapshot.details["phase"], TagValue::from("Failed"));
    assert_eq!(snapshot.details["source_state"], TagValue::from("Failed"));
    assert_eq!(snapshot.sub_records.len(), 2);
    assert_eq!(normalize(&snapshot), "etl-cron");
}

#[test]
fn argo_nodes_link_to_parents() {
    let records = node_sub_records(&argo_workflow().status.nodes);
    let pod = records
        .iter()
        .find(|r| r.id == "etl-cron-1704715200-111")
        .unwrap();
    let dag = records.iter().find(|r| r.id == "etl-cron-1704715200").unwrap();

    assert_eq!(dag.parent_ref, None);
    assert_eq!(pod.parent_ref.as_deref(), Some("etl-cron-1704715200"));
    assert_eq!(pod.name, "extract");
    assert_eq!(pod.kind, "Pod");
    assert_eq!(pod.state, RunState::Failed);
    assert!(pod.finished_at.is_none(), "zero time reads as unset");
    assert_eq!(pod.metadata["template_name"], TagValue::from("extract"));
    assert_eq!(pod.metadata["message"], TagValue::from("Error (exit code 1)"));
    assert_eq!(
        dag.metadata["children"],
        TagValue::from("etl-cron-1704715200-111")
    );
}

#[test]
fn argo_node_without_id_uses_map_key() {
    let mut nodes = BTreeMap::new();
    nodes.insert(
        "n1".to_string(),
        NodeStatus {
            name: "wf.step".into(),
            phase: "Succeeded".into(),
            ..NodeStatus::default()
        },
    );
    let records = node_sub_records(&nodes);
    assert_eq!(records[0].id, "n1");
    assert_eq!(records[0].name, "wf.step");
    assert_eq!(records[0].state, RunState::Succeeded);
}

#[test]
fn window_keeps_recently_created_or_finished() {
    let window = TimeWindow::trailing(std::time::Duration::from_secs(600));
    let recent = (Utc::now() - Duration::seconds(60)).to_rfc3339();
    let stale = (Utc::now() - Duration::hours(3)).to_rfc3339();

    let mut wf = Workflow::default();
    wf.metadata.creation_timestamp = Some(stale.clone());
    assert!(!active_in_window(&wf, &window));

    wf.status.finished_at = Some(recent.clone());
    assert!(active_in_window(&wf, &window));

    let mut fresh = Workflow::default();
    fresh.metadata.creation_timestamp = Some(recent);
    assert!(active_in_window(&fresh, &window));

    assert!(!active_in_window(&Workflow::default(), &window));
}

#[test]
fn argo_phase_mapping() {
    assert_eq!(RunState::from_argo(""), RunState::Pending);
    assert_eq!(RunState::from_argo("Running"), RunState::Running);
    assert_eq!(RunState::from_argo("Error"), RunState::Error);
    assert_eq!(
        RunState::from_argo("Omitted"),
        RunState::Other("Omitted".into())
    );
    assert!(RunState::from_argo("Error").is_terminal());
    assert_eq!(RunState::from_argo("Error").status_code(), 500);
}

// ---------------------------------------------------------------------------
// Airflow
// ---------------------------------------------------------------------------

fn dag_run() -> DagRun {
    serde_json::from_value(json!({
        "dag_id": "nightly_etl",
        "dag_run_id": "scheduled__2024-01-08T00:00:00+00:00",
        "logical_date": "2024-01-08T00:00:00+00:00",
        "start_date": "2024-01-08T00:00:05+00:00",
        "end_date": null,
        "data_interval_start": "2024-01-07T00:00:00+00:00",
        "data_interval_end": "2024-01-08T00:00:00+00:00",
        "run_type": "scheduled",
        "state": "running",
        "external_trigger": false,
        "conf": { "full_refresh": true, "region": "eu" },
        "note": ""
    }))
    .unwrap()
}

#[test]
fn airflow_run_converts_to_snapshot() {
    let source = AirflowSource::new("airflow.example.com", None).unwrap();
    let snapshot = source.snapshot(dag_run());

    assert_eq!(
        snapshot.id,
        "nightly_etl/scheduled__2024-01-08T00:00:00+00:00"
    );
    assert_eq!(snapshot.logical_name, "nightly_etl");
    assert_eq!(snapshot.run_name, "scheduled__2024-01-08T00:00:00+00:00");
    assert_eq!(snapshot.kind, "DAGRun");
    assert_eq!(snapshot.state, RunState::Running);
    assert_eq!(
        snapshot.url.as_deref(),
        Some("https://airflow.example.com/dags/nightly_etl")
    );
    assert!(snapshot.started_at.is_some());
    assert!(snapshot.finished_at.is_none());

    let conf: BTreeMap<_, _> = snapshot
        .parameters
        .iter()
        .map(|p| (p.name.as_str(), p.value.as_deref()))
        .collect();
    assert_eq!(conf["full_refresh"], Some("true"));
    assert_eq!(conf["region"], Some("eu"));

    assert_eq!(snapshot.details["run_type"], TagValue::from("scheduled"));
    assert_eq!(snapshot.details["external_trigger"], TagValue::Bool(false));
    assert!(matches!(snapshot.details["logical_date"], TagValue::Int(_)));
    assert!(!snapshot.details.contains_key("note"));
    assert_eq!(snapshot.details["source_state"], TagValue::from("running"));
    assert!(matches!(snapshot.details["start_date"], TagValue::Int(_)));
    assert!(!snapshot.details.contains_key("end_date"));
    assert_eq!(normalize(&snapshot), "nightly_etl");
}

fn task_json(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

#[test]
fn airflow_task_instances_become_sub_records() {
    let record = task_sub_record(&task_json(json!({
        "task_id": "load",
        "map_index": -1,
        "state": "upstream_failed",
        "start_date": null,
        "end_date": null,
        "try_number": 1,
        "operator": "PythonOperator"
    })));
    assert_eq!(record.id, "load");
    assert_eq!(record.name, "load");
    assert_eq!(record.kind, "dagTask");
    assert_eq!(record.state, RunState::Failed);
    assert!(record.started_at.is_none());
    assert_eq!(record.metadata["try_number"], TagValue::Int(1));
    assert!(!record.metadata.contains_key("start_date"));

    let mapped = task_sub_record(&task_json(json!({
        "task_id": "shard",
        "map_index": 3,
        "state": "success",
        "start_date": "2024-01-08T00:01:00+00:00",
        "end_date": "2024-01-08T00:02:00+00:00"
    })));
    assert_eq!(mapped.id, "shard[3]");
    assert_eq!(mapped.name, "shard");
    assert_eq!(mapped.state, RunState::Succeeded);
    assert!(mapped.finished_at.is_some());
}

#[test]
fn airflow_state_mapping() {
    assert_eq!(RunState::from_airflow("scheduled"), RunState::Queued);
    assert_eq!(RunState::from_airflow("up_for_retry"), RunState::Running);
    assert_eq!(RunState::from_airflow("success"), RunState::Succeeded);
    assert_eq!(RunState::from_airflow(""), RunState::Pending);
    assert_eq!(RunState::from_airflow("queued").status_code(), 102);
    assert!(!RunState::from_airflow("running").is_terminal());
}

#[test]
fn exclusion_filter_matches_by_pattern() {
    let filter = ExclusionFilter::new(regex::Regex::new("^airflow_monitoring$").unwrap());
    assert!(filter.excludes("airflow_monitoring"));
    assert!(!filter.excludes("airflow_monitoring_v2"));
    assert!(!ExclusionFilter::none().excludes("airflow_monitoring"));
}

// ---------------------------------------------------------------------------
// Fetch failures
// ---------------------------------------------------------------------------

// Nothing listens on port 9; connections are refused immediately.
const UNREACHABLE: &str = "http://127.0.0.1:9";

#[tokio::test]
async fn argo_list_failure_is_a_fetch_error() {
    let source = ArgoSource::new(UNREACHABLE, "pipelines", None, None).unwrap();
    let window = TimeWindow::trailing(std::time::Duration::from_secs(600));

    let err = source
        .fetch(&window, &ExclusionFilter::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fetch(_)), "{err:?}");
    assert!(err.to_string().contains("argo"), "{err}");
}

#[tokio::test]
async fn airflow_failures_are_fetch_errors() {
    let source = AirflowSource::new(UNREACHABLE, None).unwrap();
    let window = TimeWindow::trailing(std::time::Duration::from_secs(600));

    let err = source
        .fetch(&window, &ExclusionFilter::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fetch(_)), "{err:?}");

    let snapshot = source.snapshot(dag_run());
    let err = source.sub_records(&snapshot).await.unwrap_err();
    assert!(matches!(err, Error::Fetch(_)), "{err:?}");
    assert!(err.to_string().contains("nightly_etl/"), "{err}");
}
