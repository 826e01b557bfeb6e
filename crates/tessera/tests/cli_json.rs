//! End-to-end checks of the `tessera` binary against a seeded metadata store.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;
use tessera_db::TesseraDb;
use tessera_protocol::{
    CellValue, ChangeRequestId, ChangeType, ColumnSpec, ColumnType, DatasetId, ProjectId, Row,
    TableSchema, UserId, WorkflowConfig,
};
use tessera_workflow::{
    AllowAll, EditInput, InMemoryTableStore, StartSession, SubmitRequest, TableStore, Workflow,
};

fn tessera_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tessera"))
}

fn run_cli(home: &Path, args: &[&str]) -> Output {
    Command::new(tessera_bin())
        .args(args)
        .env("TESSERA_HOME", home)
        .env("TESSERA_DB", home.join("tessera.sqlite3"))
        .env_remove("TESSERA_CONFIG")
        .env("RUST_LOG", "error")
        .output()
        .expect("failed to execute tessera CLI")
}

fn assert_cli_success(output: &Output, args: &[&str]) {
    assert!(
        output.status.success(),
        "command failed: {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn run_cli_json(home: &Path, args: &[&str]) -> Value {
    let output = run_cli(home, args);
    assert_cli_success(&output, args);
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "failed to parse JSON output: {}\nstdout:\n{}",
            err,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn person(id: i64, name: &str, age: i64) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), CellValue::Int(id));
    row.insert("name".into(), CellValue::Text(name.into()));
    row.insert("age".into(), CellValue::Int(age));
    row
}

/// One merged edit of the `people` dataset, plus one expired session.
fn seed(home: &Path) -> ChangeRequestId {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(async {
        let db = Arc::new(
            TesseraDb::open(home.join("tessera.sqlite3"))
                .await
                .expect("open db"),
        );
        let tables = Arc::new(InMemoryTableStore::new());
        let dataset = DatasetId::new("people");
        let project = ProjectId::new("census");
        tables
            .create_table(
                &dataset,
                TableSchema::new(
                    vec![
                        ColumnSpec::required("id", ColumnType::Int64),
                        ColumnSpec::optional("name", ColumnType::String),
                        ColumnSpec::optional("age", ColumnType::Int64),
                    ],
                    vec!["id".into()],
                ),
                vec![person(1, "ann", 30), person(2, "bo", 40)],
            )
            .await
            .expect("create table");

        let workflow = Workflow::with_db(
            Arc::clone(&db),
            tables.clone(),
            Arc::new(AllowAll),
            WorkflowConfig::default(),
        );
        let carol = UserId::new("carol");
        let session = workflow
            .sessions
            .start_session(StartSession {
                project_id: project.clone(),
                dataset_id: dataset.clone(),
                user_id: carol.clone(),
                mode: ChangeType::Edit,
                rows: Vec::new(),
            })
            .await
            .expect("start session");
        workflow
            .sessions
            .save_edit(
                &session.session_id,
                &carol,
                EditInput::new("1", "age", CellValue::Int(31)),
            )
            .await
            .expect("save edit");
        let cr = workflow
            .sessions
            .submit_change_request(
                &session.session_id,
                &carol,
                SubmitRequest {
                    title: "Fix ann's age".into(),
                    reviewers: vec![UserId::new("alice")],
                },
            )
            .await
            .expect("submit");
        workflow
            .change_requests
            .approve(&cr.id, &UserId::new("alice"))
            .await
            .expect("approve");

        let expiring = Workflow::with_db(
            Arc::clone(&db),
            tables,
            Arc::new(AllowAll),
            WorkflowConfig {
                session_ttl_hours: 0,
                ..WorkflowConfig::default()
            },
        );
        expiring
            .sessions
            .start_session(StartSession {
                project_id: project,
                dataset_id: dataset,
                user_id: UserId::new("dave"),
                mode: ChangeType::Edit,
                rows: Vec::new(),
            })
            .await
            .expect("start expiring session");

        db.pool().close().await;
        cr.id
    })
}

#[test]
fn test_change_request_list_and_show_json() {
    let home = TempDir::new().expect("create temp home");
    let cr_id = seed(home.path());

    let list = run_cli_json(home.path(), &["cr", "list", "--dataset", "people", "--json"]);
    let crs = list.as_array().expect("array");
    assert_eq!(crs.len(), 1);
    assert_eq!(crs[0]["id"], cr_id.as_str());
    assert_eq!(crs[0]["status"], "merged");

    let none = run_cli_json(home.path(), &["cr", "list", "--status", "pending", "--json"]);
    assert!(none.as_array().expect("array").is_empty());

    let detail = run_cli_json(home.path(), &["cr", "show", cr_id.as_str(), "--json"]);
    assert_eq!(detail["change_request"]["title"], "Fix ann's age");
    let outcomes = detail["merge_outcomes"].as_array().expect("outcomes");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["result_version"], 2);
    assert_eq!(outcomes[0]["cells_changed"], 1);
}

#[test]
fn test_audit_trail_json() {
    let home = TempDir::new().expect("create temp home");
    let cr_id = seed(home.path());

    let events = run_cli_json(
        home.path(),
        &["audit", "list", "--cr", cr_id.as_str(), "--json"],
    );
    let kinds: Vec<&str> = events
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|e| e["kind"].as_str())
        .collect();
    assert_eq!(kinds.first(), Some(&"change_request_created"));
    assert_eq!(kinds.last(), Some(&"merged"));

    let merged = run_cli_json(
        home.path(),
        &["audit", "list", "--kind", "change_request.merged", "--json"],
    );
    assert_eq!(merged.as_array().expect("array").len(), 1);
}

#[test]
fn test_rules_attach_show_and_validate() {
    let home = TempDir::new().expect("create temp home");
    let rules_path = home.path().join("rules.json");
    std::fs::write(
        &rules_path,
        r#"[{"column": "age", "kind": "range", "min": 0, "max": 120, "severity": "error"}]"#,
    )
    .expect("write rules");
    let rows_path = home.path().join("rows.json");
    std::fs::write(
        &rows_path,
        r#"[{"id": 1, "age": 30}, {"id": 2, "age": 130}]"#,
    )
    .expect("write rows");

    let rules_arg = rules_path.to_string_lossy().to_string();
    let attach = [
        "rules", "attach", "people", rules_arg.as_str(), "--project", "census", "--by", "admin",
    ];
    assert_cli_success(&run_cli(home.path(), &attach), &attach);

    let set = run_cli_json(home.path(), &["rules", "show", "people", "--json"]);
    assert_eq!(set["version"], 1);
    assert_eq!(set["rules"][0]["kind"], "range");

    let rows_arg = rows_path.to_string_lossy().to_string();
    let validate = ["validate", "--dataset", "people", "--rows", rows_arg.as_str(), "--json"];
    let output = run_cli(home.path(), &validate);
    assert_eq!(output.status.code(), Some(2));
    let report: Value = serde_json::from_slice(&output.stdout).expect("report json");
    assert_eq!(report["passed"], false);
    assert_eq!(report["summary"]["error_count"], 1);
    assert_eq!(report["summary"]["findings"][0]["row_key"], "2");
}

#[test]
fn test_reclaim_expired_sessions() {
    let home = TempDir::new().expect("create temp home");
    seed(home.path());

    let first = run_cli_json(home.path(), &["sessions", "reclaim", "--json"]);
    assert_eq!(first["reclaimed"].as_array().expect("array").len(), 1);

    let second = run_cli_json(home.path(), &["sessions", "reclaim", "--json"]);
    assert!(second["reclaimed"].as_array().expect("array").is_empty());
}

#[test]
fn test_unknown_change_request_is_a_json_error() {
    let home = TempDir::new().expect("create temp home");
    let missing = ChangeRequestId::new();
    let output = run_cli(home.path(), &["cr", "show", missing.as_str(), "--json"]);
    assert_eq!(output.status.code(), Some(1));
    let body: Value = serde_json::from_slice(&output.stdout).expect("error json");
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains(missing.as_str()));
}
