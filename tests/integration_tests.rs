//! Integration tests for vigil
//!
//! These tests verify that all major features work together correctly:
//! the HTTP surface, the queue/worker pipeline, streaming channels, and
//! the workflow orchestrator, all against an in-memory database and a
//! scripted engine.

use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use predicates::prelude::*;
use tempfile::TempDir;
use tower::ServiceExt;

use vigil::db::{DbHandle, VigilDb};
use vigil::engine::{EngineReport, MockEngine, ScriptedOutcome, ToolInvocation};
use vigil::models::{Role, Scope, Tool, User};
use vigil::server::build_app;
use vigil::worker::Worker;

// =============================================================================
// Helpers
// =============================================================================

struct TestApp {
    router: Router,
    db: DbHandle,
    worker: Arc<Worker>,
}

/// Build a full application around an in-memory database, a seeded
/// catalog, and the given scripted engine. The worker is returned
/// unspawned so tests control execution.
fn test_app(engine: MockEngine) -> TestApp {
    let db = DbHandle::new(VigilDb::new_in_memory().unwrap());
    {
        let guard = db.lock_sync().unwrap();
        guard
            .seed_tool(&Tool {
                id: "t1".into(),
                slug: "nmap".into(),
                name: "Network Mapper".into(),
                enabled: true,
                manifest: Some(serde_json::json!({"default_timeout_secs": 30})),
            })
            .unwrap();
        guard
            .seed_scope(&Scope {
                id: "sc1".into(),
                name: "lab".into(),
                cidrs: vec!["10.0.0.0/24".into()],
                host_patterns: vec!["*.lab.internal".into()],
                active: true,
            })
            .unwrap();
        guard
            .seed_user(&User {
                id: "u1".into(),
                name: "analyst".into(),
                role: Role::User,
            })
            .unwrap();
        guard
            .seed_user(&User {
                id: "root".into(),
                name: "ops".into(),
                role: Role::Admin,
            })
            .unwrap();
    }
    let parts = build_app(db.clone(), Arc::new(engine));
    let router = vigil::server::build_router(parts.state);
    TestApp {
        router,
        db,
        worker: parts.worker,
    }
}

fn scan_report() -> EngineReport {
    EngineReport {
        analysis: "Medium: outdated version of nginx detected.\n\nRemediation: upgrade nginx\n"
            .into(),
        invocations: vec![ToolInvocation {
            name: "nmap".into(),
            params: serde_json::json!({"flags": "-sV"}),
            stdout: "80/tcp open http nginx 1.14".into(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1500,
        }],
        tokens_used: 80,
    }
}

async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

async fn wait_for_status(app: &Router, uri: &str, expected: &str) -> serde_json::Value {
    for _ in 0..300 {
        let (status, json) = send_json(app, "GET", uri, None, None).await;
        assert_eq!(status, StatusCode::OK, "polling {} failed: {}", uri, json);
        if json["status"] == expected {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached status {}", uri, expected);
}

// =============================================================================
// CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    fn vigil() -> Command {
        cargo_bin_cmd!("vigil")
    }

    #[test]
    fn test_vigil_help() {
        vigil().arg("--help").assert().success();
    }

    #[test]
    fn test_vigil_version() {
        vigil().arg("--version").assert().success();
    }

    #[test]
    fn test_init_db_creates_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data/vigil.db");
        let config_path = dir.path().join("vigil.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[server]
db_path = "{}"

[[catalog.tools]]
id = "t1"
slug = "nmap"
name = "Network Mapper"
enabled = true
"#,
                db_path.display()
            ),
        )
        .unwrap();

        vigil()
            .arg("--config")
            .arg(&config_path)
            .arg("init-db")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized database"));

        assert!(db_path.exists());
    }
}

// =============================================================================
// Run lifecycle over the API
// =============================================================================

mod run_lifecycle {
    use super::*;

    #[tokio::test]
    async fn create_process_and_fetch_run() {
        let app = test_app(MockEngine::new().with_report(&["80/tcp open"], scan_report()));
        app.worker.clone().spawn();

        let (status, created) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("u1"),
            Some(serde_json::json!({
                "tool": "nmap",
                "scope_id": "sc1",
                "target": "10.0.0.5",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["tool"], "nmap");
        let run_id = created["id"].as_str().unwrap().to_string();

        let run = wait_for_status(&app.router, &format!("/api/runs/{}", run_id), "completed").await;
        assert_eq!(run["exit_code"], 0);
        let artifact_names: Vec<&str> = run["artifacts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert!(artifact_names.contains(&"stdout"));
        assert!(artifact_names.contains(&"analysis"));
        assert!(artifact_names.contains(&"tool_metadata"));
    }

    #[tokio::test]
    async fn create_run_validates_tool_scope_and_identity() {
        let app = test_app(MockEngine::new());

        // Unknown tool -> 404
        let (status, _) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("u1"),
            Some(serde_json::json!({"tool": "ghost", "target": "10.0.0.5"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Out-of-scope target -> 403
        let (status, body) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("u1"),
            Some(serde_json::json!({
                "tool": "nmap",
                "scope_id": "sc1",
                "target": "192.0.2.9",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("scope"));

        // Admin bypasses the scope check.
        let (status, _) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("root"),
            Some(serde_json::json!({
                "tool": "nmap",
                "scope_id": "sc1",
                "target": "192.0.2.9",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        // Unknown identity -> 403
        let (status, _) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("nobody"),
            Some(serde_json::json!({"tool": "nmap", "target": "10.0.0.5"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn stop_pending_run_then_stop_again_conflicts() {
        // Worker not spawned: the run stays pending in the queue.
        let app = test_app(MockEngine::new());

        let (_, created) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("u1"),
            Some(serde_json::json!({"tool": "nmap", "target": "10.0.0.5"})),
        )
        .await;
        let run_id = created["id"].as_str().unwrap().to_string();

        let (status, stopped) = send_json(
            &app.router,
            "POST",
            &format!("/api/runs/{}/stop", run_id),
            Some("u1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped["status"], "cancelled");

        // The queued job is gone.
        {
            let guard = app.db.lock_sync().unwrap();
            assert_eq!(guard.queued_job_count().unwrap(), 0);
        }

        // Stopping a terminal run surfaces a Conflict, not silent success.
        let (status, body) = send_json(
            &app.router,
            "POST",
            &format!("/api/runs/{}/stop", run_id),
            Some("u1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already"));
    }

    #[tokio::test]
    async fn delete_run_removes_everything() {
        let app = test_app(MockEngine::new());
        let (_, created) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("u1"),
            Some(serde_json::json!({"tool": "nmap", "target": "10.0.0.5"})),
        )
        .await;
        let run_id = created["id"].as_str().unwrap().to_string();

        let (status, _) = send_json(
            &app.router,
            "DELETE",
            &format!("/api/runs/{}", run_id),
            Some("u1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) =
            send_json(&app.router, "GET", &format!("/api/runs/{}", run_id), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ownership_guard_on_mutations() {
        let app = test_app(MockEngine::new());
        {
            let guard = app.db.lock_sync().unwrap();
            guard
                .seed_user(&User {
                    id: "u2".into(),
                    name: "other".into(),
                    role: Role::User,
                })
                .unwrap();
        }
        let (_, created) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("u1"),
            Some(serde_json::json!({"tool": "nmap", "target": "10.0.0.5"})),
        )
        .await;
        let run_id = created["id"].as_str().unwrap().to_string();

        let (status, _) = send_json(
            &app.router,
            "POST",
            &format!("/api/runs/{}/stop", run_id),
            Some("u2"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}

// =============================================================================
// Workflow lifecycle over the API
// =============================================================================

mod workflow_lifecycle {
    use super::*;

    fn six_phase_engine() -> MockEngine {
        let engine = MockEngine::new();
        for _ in 0..6 {
            engine.push(ScriptedOutcome::Report {
                chunks: vec![],
                report: scan_report(),
            });
        }
        engine
    }

    #[tokio::test]
    async fn create_runs_all_phases_to_completion() {
        let app = test_app(six_phase_engine());

        let (status, created) = send_json(
            &app.router,
            "POST",
            "/api/workflows",
            Some("u1"),
            Some(serde_json::json!({
                "target": "10.0.0.5",
                "objective": "quick",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["queue_position"], 0);
        assert_eq!(created["steps"].as_array().unwrap().len(), 6);
        assert_eq!(created["steps"][0]["name"], "Intelligence Planning");
        let session_id = created["id"].as_str().unwrap().to_string();

        let done = wait_for_status(
            &app.router,
            &format!("/api/workflows/{}", session_id),
            "completed",
        )
        .await;
        assert_eq!(done["progress"], 100);
        assert!(done["risk_score"].as_i64().unwrap() > 0);
        let steps = done["steps"].as_array().unwrap();
        assert!(steps.iter().all(|s| s["status"] == "completed"));
        // One phase finding per phase, each with mined remediation.
        let findings = done["findings"].as_array().unwrap();
        assert_eq!(findings.len(), 6);
        assert!(findings
            .iter()
            .any(|f| f["remediation"] == "upgrade nginx"));
    }

    #[tokio::test]
    async fn invalid_objective_is_rejected() {
        let app = test_app(MockEngine::new());
        let (status, _) = send_json(
            &app.router,
            "POST",
            "/api/workflows",
            Some("u1"),
            Some(serde_json::json!({"target": "10.0.0.5", "objective": "reckless"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn second_workflow_queues_behind_running_one() {
        // Phase 1 of the first workflow hangs, holding the slot.
        let engine = MockEngine::new();
        engine.push(ScriptedOutcome::Hang);
        let app = test_app(engine);

        let (_, first) = send_json(
            &app.router,
            "POST",
            "/api/workflows",
            Some("u1"),
            Some(serde_json::json!({"target": "10.0.0.1", "objective": "quick"})),
        )
        .await;
        assert_eq!(first["queue_position"], 0);

        let (_, second) = send_json(
            &app.router,
            "POST",
            "/api/workflows",
            Some("u1"),
            Some(serde_json::json!({"target": "10.0.0.2", "objective": "quick"})),
        )
        .await;
        assert_eq!(second["status"], "created");
        assert_eq!(second["queue_position"], 1);

        // The single-flight invariant holds in the database.
        let guard = app.db.lock_sync().unwrap();
        assert_eq!(guard.running_session_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_skips_steps_and_starts_next_in_queue() {
        let engine = MockEngine::new();
        engine.push(ScriptedOutcome::Hang);
        let app = test_app(engine);

        let (_, first) = send_json(
            &app.router,
            "POST",
            "/api/workflows",
            Some("u1"),
            Some(serde_json::json!({"target": "10.0.0.1", "objective": "quick"})),
        )
        .await;
        let first_id = first["id"].as_str().unwrap().to_string();
        let (_, second) = send_json(
            &app.router,
            "POST",
            "/api/workflows",
            Some("u1"),
            Some(serde_json::json!({"target": "10.0.0.2", "objective": "quick"})),
        )
        .await;
        let second_id = second["id"].as_str().unwrap().to_string();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (status, cancelled) = send_json(
            &app.router,
            "POST",
            &format!("/api/workflows/{}/cancel", first_id),
            Some("u1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");
        assert!(cancelled["steps"]
            .as_array()
            .unwrap()
            .iter()
            .all(|s| s["status"] == "skipped"));

        // The backlog drained: session two left created.
        let second_done = wait_for_status(
            &app.router,
            &format!("/api/workflows/{}", second_id),
            "completed",
        )
        .await;
        assert_eq!(second_done["target"], "10.0.0.2");
    }

    #[tokio::test]
    async fn delete_workflow_leaves_no_referencing_rows() {
        let app = test_app(six_phase_engine());
        let (_, created) = send_json(
            &app.router,
            "POST",
            "/api/workflows",
            Some("u1"),
            Some(serde_json::json!({"target": "10.0.0.5", "objective": "quick"})),
        )
        .await;
        let session_id = created["id"].as_str().unwrap().to_string();
        let run_id = created["run_id"].as_str().unwrap().to_string();
        wait_for_status(
            &app.router,
            &format!("/api/workflows/{}", session_id),
            "completed",
        )
        .await;

        let (status, _) = send_json(
            &app.router,
            "DELETE",
            &format!("/api/workflows/{}", session_id),
            Some("u1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let guard = app.db.lock_sync().unwrap();
        assert_eq!(
            guard
                .count_rows_referencing_session(&session_id, &run_id)
                .unwrap(),
            0
        );
    }
}

// =============================================================================
// Streaming
// =============================================================================

mod streaming {
    use super::*;

    #[tokio::test]
    async fn stream_endpoint_rejects_unknown_run() {
        let app = test_app(MockEngine::new());
        let (status, _) = send_json(
            &app.router,
            "GET",
            "/api/runs/no-such-run/stream",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_endpoint_opens_for_existing_run() {
        let app = test_app(MockEngine::new());
        let (_, created) = send_json(
            &app.router,
            "POST",
            "/api/runs",
            Some("u1"),
            Some(serde_json::json!({"tool": "nmap", "target": "10.0.0.5"})),
        )
        .await;
        let run_id = created["id"].as_str().unwrap().to_string();
        // Cancel so the stream terminates quickly via the status poll.
        send_json(
            &app.router,
            "POST",
            &format!("/api/runs/{}/stop", run_id),
            Some("u1"),
            None,
        )
        .await;

        let request = Request::builder()
            .uri(format!("/api/runs/{}/stream", run_id))
            .body(Body::empty())
            .unwrap();
        let resp = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        assert!(content_type.starts_with("text/event-stream"));

        let body = tokio::time::timeout(Duration::from_secs(10), async {
            resp.into_body().collect().await.unwrap().to_bytes()
        })
        .await
        .expect("stream should close after terminal status");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: connected"));
    }
}
