use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use farm::model::{EntitySnapshot, Identity, RunState, SourceType, SubRecord, TagValue};
use farm::source::argo::{ArgoSource, Workflow};
use farm::trace::{SpanNode, build_trace};

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

fn identity() -> Identity {
    Identity {
        tenant: "acme".into(),
        ..Identity::default()
    }
}

fn finished_run(state: RunState) -> EntitySnapshot {
    let mut run = EntitySnapshot::new(SourceType::Airflow, "etl/run-1", "etl", state);
    run.run_name = "run-1".into();
    run.created_at = Some(t(0));
    run.started_at = Some(t(5));
    run.finished_at = Some(t(600));
    run
}

fn task(id: &str, start: i64, end: Option<i64>) -> SubRecord {
    let mut record = SubRecord::new(id, id, RunState::Succeeded);
    record.kind = "dagTask".into();
    record.started_at = Some(t(start));
    record.finished_at = end.map(t);
    record
}

fn names(spans: &[SpanNode]) -> Vec<&str> {
    spans.iter().map(|s| s.name.as_str()).collect()
}

#[test]
fn three_tasks_yield_five_spans() {
    let mut run = finished_run(RunState::Succeeded);
    run.sub_records = vec![
        task("extract", 10, Some(100)),
        task("transform", 100, Some(300)),
        task("load", 300, Some(590)),
    ];

    let tree = build_trace(&run, "etl", &identity());
    assert_eq!(tree.span_count(), 5);

    let run_span = tree.run_span().unwrap();
    assert_eq!(run_span.name, "run-1");
    assert_eq!(names(&run_span.children), vec!["extract", "transform", "load"]);
    for child in &run_span.children {
        assert_eq!(child.tags["component"], TagValue::from("etl"));
        assert_eq!(child.tags["span.kind"], TagValue::from("consumer"));
        assert_eq!(child.tags["operation.name"], TagValue::from("dagTask"));
    }
}

#[test]
fn no_sub_records_yield_two_spans() {
    let tree = build_trace(&finished_run(RunState::Succeeded), "etl", &identity());
    assert_eq!(tree.span_count(), 2);
    assert!(tree.run_span().unwrap().children.is_empty());
}

#[test]
fn root_span_describes_entity() {
    let mut run = finished_run(RunState::Succeeded);
    run.url = Some("https://airflow.example.com/dags/etl".into());
    let tree = build_trace(&run, "etl", &identity());

    let root = &tree.root;
    assert_eq!(root.name, "airflow.dagrun");
    assert_eq!(root.resource.as_deref(), Some("etl"));
    assert_eq!(root.start, t(0));
    assert_eq!(root.end, t(600));
    assert!(!root.error);
    assert_eq!(root.tags["http.response.status_code"], TagValue::Int(200));
    assert_eq!(root.tags["http.request.method"], TagValue::from("AIRFLOW"));
    assert_eq!(root.tags["tenant"], TagValue::from("acme"));
    assert_eq!(
        root.tags["url"],
        TagValue::from("https://airflow.example.com/dags/etl")
    );

    let run_span = tree.run_span().unwrap();
    assert_eq!(run_span.start, t(5));
    assert_eq!(run_span.service.as_deref(), Some("etl"));
    assert_eq!(run_span.span_type.as_deref(), Some("airflow_dagrun"));
}

#[test]
fn failed_run_is_marked_error() {
    let tree = build_trace(&finished_run(RunState::Failed), "etl", &identity());
    assert!(tree.root.error);
    assert_eq!(tree.root.tags["http.response.status_code"], TagValue::Int(500));
    assert!(tree.run_span().unwrap().error);
}

#[test]
fn root_start_falls_back_to_started_at() {
    let mut run = finished_run(RunState::Succeeded);
    run.created_at = None;
    let tree = build_trace(&run, "etl", &identity());
    assert_eq!(tree.root.start, t(5));
}

#[test]
fn missing_finish_borrows_parent_end() {
    let mut run = finished_run(RunState::Error);
    run.sub_records = vec![task("stuck", 20, None)];

    let tree = build_trace(&run, "etl", &identity());
    let leaf = &tree.run_span().unwrap().children[0];
    assert_eq!(leaf.start, t(20));
    assert_eq!(leaf.end, t(600));
    assert!(!leaf.tags.contains_key("finished"));
}

#[test]
fn missing_run_times_never_invert() {
    let mut run = EntitySnapshot::new(SourceType::Argo, "uid", "wf", RunState::Succeeded);
    run.finished_at = Some(t(100));
    let tree = build_trace(&run, "wf", &identity());
    assert_eq!(tree.root.start, t(100));
    assert!(tree.root.end >= tree.root.start);

    let mut run = finished_run(RunState::Succeeded);
    run.finished_at = Some(t(1));
    let tree = build_trace(&run, "etl", &identity());
    let run_span = tree.run_span().unwrap();
    assert!(run_span.end >= run_span.start);
}

#[test]
fn parent_refs_stay_tags_and_leaves_stay_flat() {
    let mut run = finished_run(RunState::Succeeded);
    run.source = SourceType::Argo;
    let mut dag = task("wf-root", 5, Some(600));
    dag.kind = "DAG".into();
    let mut a = task("wf-a", 10, Some(200));
    a.parent_ref = Some("wf-root".into());
    let mut b = task("wf-b", 200, Some(590));
    b.parent_ref = Some("wf-a".into());
    run.sub_records = vec![b, dag, a];

    let tree = build_trace(&run, "etl", &identity());
    assert_eq!(tree.span_count(), 5);
    assert_eq!(tree.root.name, "argo_workflow");

    let leaves = &tree.run_span().unwrap().children;
    assert_eq!(names(leaves), vec!["wf-b", "wf-root", "wf-a"]);
    assert!(leaves.iter().all(|leaf| leaf.children.is_empty()));
    assert_eq!(leaves[0].tags["parent"], TagValue::from("wf-a"));
    assert_eq!(leaves[2].tags["parent"], TagValue::from("wf-root"));
}

#[test]
fn argo_dag_nodes_are_all_children_of_run() {
    let workflow: Workflow = serde_json::from_value(json!({
        "metadata": { "name": "wf", "namespace": "pipelines", "uid": "uid-wf" },
        "status": {
            "phase": "Succeeded",
            "startedAt": "2024-01-08T12:00:00Z",
            "finishedAt": "2024-01-08T12:10:00Z",
            "nodes": {
                "wf": { "id": "wf", "name": "wf", "type": "DAG", "phase": "Succeeded", "children": ["wf-a"] },
                "wf-a": { "id": "wf-a", "name": "wf.a", "displayName": "a", "type": "Pod", "phase": "Succeeded", "children": ["wf-b"] },
                "wf-b": { "id": "wf-b", "name": "wf.b", "displayName": "b", "type": "Pod", "phase": "Succeeded" }
            }
        }
    }))
    .unwrap();
    let source = ArgoSource::new("https://argo.example.com", "pipelines", None, None).unwrap();
    let snapshot = source.snapshot(workflow);

    let tree = build_trace(&snapshot, "wf", &identity());
    let leaves = &tree.run_span().unwrap().children;
    assert_eq!(leaves.len(), 3);
    assert_eq!(tree.span_count(), 5);
    assert!(leaves.iter().all(|leaf| leaf.children.is_empty()));

    let a = leaves.iter().find(|leaf| leaf.name == "a").unwrap();
    assert_eq!(a.tags["children"], TagValue::from("wf-b"));
    assert_eq!(a.tags["parent"], TagValue::from("wf"));
}

#[test]
fn unknown_or_self_parent_is_still_a_leaf() {
    let mut run = finished_run(RunState::Succeeded);
    let mut orphan = task("orphan", 10, Some(20));
    orphan.parent_ref = Some("gone".into());
    let mut selfish = task("selfish", 30, Some(40));
    selfish.parent_ref = Some("selfish".into());
    run.sub_records = vec![orphan, selfish];

    let tree = build_trace(&run, "etl", &identity());
    assert_eq!(
        names(&tree.run_span().unwrap().children),
        vec!["orphan", "selfish"]
    );
}

#[test]
fn failed_task_is_error_span() {
    let mut run = finished_run(RunState::Failed);
    let mut bad = task("load", 10, Some(20));
    bad.state = RunState::Failed;
    run.sub_records = vec![task("extract", 5, Some(10)), bad];

    let tree = build_trace(&run, "etl", &identity());
    let children = &tree.run_span().unwrap().children;
    assert!(!children[0].error);
    assert!(children[1].error);
    assert_eq!(children[1].tags["state"], TagValue::from("failed"));
}
