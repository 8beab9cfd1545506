use axum::http::StatusCode;
use chrono::Utc;
use focusflow_server::{server, storage};
use reqwest::Client;
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;

struct TestServer {
    base: String,
    client: Client,
    handle: tokio::task::JoinHandle<()>,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Option<Self> {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let (addr, handle) = match start_server(&db_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                eprintln!("Skipping test due to sandbox restrictions: {e}");
                return None;
            }
            Err(e) => panic!("failed to start server: {e}"),
        };
        Some(Self {
            base: format!("http://{}", addr),
            client: Client::new(),
            handle,
            _tempdir: dir,
        })
    }

    async fn sign_up(&self, email: &str, name: &str, password: &str) -> String {
        let body = self
            .request_expect(
                "POST",
                "/api/auth/signup",
                None,
                Some(json!({"email": email, "password": password, "name": name})),
                StatusCode::OK,
            )
            .await;
        body.get("token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .expect("token missing from auth response")
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let url = format!("{}{}", self.base, path);
        let mut req = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PATCH" => self.client.patch(&url),
            "DELETE" => self.client.delete(&url),
            other => panic!("unsupported method {other}"),
        };
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        let text = resp.text().await.unwrap();
        let val = if text.is_empty() {
            json!(null)
        } else {
            serde_json::from_str(&text).unwrap_or(json!({"raw": text}))
        };
        (status, val)
    }

    async fn request_expect(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
        expected: StatusCode,
    ) -> Value {
        let (status, value) = self.request(method, path, token, body).await;
        assert_eq!(
            status, expected,
            "{method} {path} returned {status:?} with body {value:?}",
        );
        value
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(
    tmp_db: &Path,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
    let config = server::AppConfig {
        jwt_secret: "testsecret".into(),
        dev_cors_origin: None,
        listen_port: None,
    };

    let store = storage::Store::connect_sqlite(tmp_db.to_str().unwrap())
        .await
        .expect("db");

    let state = server::AppState::new(config, store);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok((addr, handle))
}

fn today() -> String {
    Utc::now().date_naive().to_string()
}

#[tokio::test]
async fn public_endpoints_work() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    server
        .request_expect("GET", "/healthz", None, None, StatusCode::OK)
        .await;

    let body = server
        .request_expect(
            "POST",
            "/api/auth/signup",
            None,
            Some(json!({"email":"ada@example.com","password":"secret123","name":"Ada"})),
            StatusCode::OK,
        )
        .await;
    assert!(body.get("token").and_then(|v| v.as_str()).is_some());
    let user = body.get("user").unwrap();
    assert_eq!(user.get("email").unwrap(), "ada@example.com");
    assert_eq!(user.get("name").unwrap(), "Ada");

    // Same email again conflicts
    server
        .request_expect(
            "POST",
            "/api/auth/signup",
            None,
            Some(json!({"email":"ada@example.com","password":"secret123","name":"Ada"})),
            StatusCode::CONFLICT,
        )
        .await;

    // Sign in with the right and the wrong password
    let signin = server
        .request_expect(
            "POST",
            "/api/auth/signin",
            None,
            Some(json!({"email":"ada@example.com","password":"secret123"})),
            StatusCode::OK,
        )
        .await;
    let token = signin.get("token").and_then(|v| v.as_str()).unwrap();
    assert!(!token.is_empty());

    server
        .request_expect(
            "POST",
            "/api/auth/signin",
            None,
            Some(json!({"email":"ada@example.com","password":"wrong"})),
            StatusCode::UNAUTHORIZED,
        )
        .await;
    server
        .request_expect(
            "POST",
            "/api/auth/signin",
            None,
            Some(json!({"email":"nobody@example.com","password":"secret123"})),
            StatusCode::UNAUTHORIZED,
        )
        .await;

    let me = server
        .request_expect("GET", "/api/me", Some(token), None, StatusCode::OK)
        .await;
    assert_eq!(me.get("email").unwrap(), "ada@example.com");
}

#[tokio::test]
async fn signup_input_is_validated() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let cases = vec![
        json!({"email":"not-an-email","password":"secret123","name":"X"}),
        json!({"email":"x@example.com","password":"short","name":"X"}),
        json!({"email":"x@example.com","password":"secret123","name":"  "}),
    ];
    for body in cases {
        server
            .request_expect(
                "POST",
                "/api/auth/signup",
                None,
                Some(body),
                StatusCode::BAD_REQUEST,
            )
            .await;
    }
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let cases: Vec<(&str, &str, Option<Value>)> = vec![
        ("GET", "/api/me", None),
        ("GET", "/api/tasks", None),
        ("POST", "/api/tasks", Some(json!({"title":"t"}))),
        ("PATCH", "/api/tasks/1", Some(json!({"completed":true}))),
        ("DELETE", "/api/tasks/1", None),
        ("POST", "/api/focus-sessions", Some(json!({}))),
        (
            "POST",
            "/api/focus-sessions/1/end",
            Some(json!({"completed":true})),
        ),
        ("GET", "/api/stats", None),
    ];

    for (method, path, body) in cases.iter() {
        server
            .request_expect(method, path, None, body.clone(), StatusCode::UNAUTHORIZED)
            .await;
    }
}

#[tokio::test]
async fn task_lifecycle() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let token = server.sign_up("ada@example.com", "Ada", "secret123").await;

    // A fresh user has an empty task list, not null
    let tasks = server
        .request_expect("GET", "/api/tasks", Some(&token), None, StatusCode::OK)
        .await;
    assert_eq!(tasks, json!([]));

    // Empty title is rejected before touching the store
    server
        .request_expect(
            "POST",
            "/api/tasks",
            Some(&token),
            Some(json!({"title":"   "})),
            StatusCode::BAD_REQUEST,
        )
        .await;
    server
        .request_expect(
            "POST",
            "/api/tasks",
            Some(&token),
            Some(json!({"title":"t","estimated_minutes":0})),
            StatusCode::BAD_REQUEST,
        )
        .await;

    let task = server
        .request_expect(
            "POST",
            "/api/tasks",
            Some(&token),
            Some(json!({"title":"Write report","estimated_minutes":30})),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").and_then(|v| v.as_i64()).unwrap();
    assert_eq!(task.get("completed").unwrap(), false);
    assert!(task.get("completed_at").unwrap().is_null());
    assert_eq!(
        task.get("scheduled_date").and_then(|v| v.as_str()).unwrap(),
        today()
    );

    // Patch: set description, leave the estimate alone
    let patched = server
        .request_expect(
            "PATCH",
            &format!("/api/tasks/{task_id}"),
            Some(&token),
            Some(json!({"description":"quarterly numbers"})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(patched.get("description").unwrap(), "quarterly numbers");
    assert_eq!(
        patched
            .get("estimated_minutes")
            .and_then(|v| v.as_i64())
            .unwrap(),
        30
    );

    // Patch: explicit null clears the description only
    let cleared = server
        .request_expect(
            "PATCH",
            &format!("/api/tasks/{task_id}"),
            Some(&token),
            Some(json!({"description":null})),
            StatusCode::OK,
        )
        .await;
    assert!(cleared.get("description").unwrap().is_null());
    assert_eq!(
        cleared
            .get("estimated_minutes")
            .and_then(|v| v.as_i64())
            .unwrap(),
        30
    );

    // Completing stamps completed_at; un-completing clears it
    let done = server
        .request_expect(
            "PATCH",
            &format!("/api/tasks/{task_id}"),
            Some(&token),
            Some(json!({"completed":true})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(done.get("completed").unwrap(), true);
    assert!(done.get("completed_at").and_then(|v| v.as_str()).is_some());

    let undone = server
        .request_expect(
            "PATCH",
            &format!("/api/tasks/{task_id}"),
            Some(&token),
            Some(json!({"completed":false})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(undone.get("completed").unwrap(), false);
    assert!(undone.get("completed_at").unwrap().is_null());

    server
        .request_expect(
            "DELETE",
            &format!("/api/tasks/{task_id}"),
            Some(&token),
            None,
            StatusCode::NO_CONTENT,
        )
        .await;
    let tasks = server
        .request_expect("GET", "/api/tasks", Some(&token), None, StatusCode::OK)
        .await;
    assert_eq!(tasks, json!([]));

    // Deleting again looks like any other missing task
    server
        .request_expect(
            "DELETE",
            &format!("/api/tasks/{task_id}"),
            Some(&token),
            None,
            StatusCode::NOT_FOUND,
        )
        .await;
}

#[tokio::test]
async fn tasks_are_owner_scoped() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let ada = server.sign_up("ada@example.com", "Ada", "secret123").await;
    let bob = server.sign_up("bob@example.com", "Bob", "secret123").await;

    let task = server
        .request_expect(
            "POST",
            "/api/tasks",
            Some(&ada),
            Some(json!({"title":"Ada's task"})),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").and_then(|v| v.as_i64()).unwrap();

    // Bob cannot see, modify, or delete Ada's task; the errors are the
    // same as for a task that does not exist at all.
    let bobs_tasks = server
        .request_expect("GET", "/api/tasks", Some(&bob), None, StatusCode::OK)
        .await;
    assert_eq!(bobs_tasks, json!([]));

    server
        .request_expect(
            "PATCH",
            &format!("/api/tasks/{task_id}"),
            Some(&bob),
            Some(json!({"completed":true})),
            StatusCode::NOT_FOUND,
        )
        .await;
    server
        .request_expect(
            "DELETE",
            &format!("/api/tasks/{task_id}"),
            Some(&bob),
            None,
            StatusCode::NOT_FOUND,
        )
        .await;

    // Bob cannot start a session against Ada's task either
    server
        .request_expect(
            "POST",
            "/api/focus-sessions",
            Some(&bob),
            Some(json!({"task_id": task_id})),
            StatusCode::NOT_FOUND,
        )
        .await;

    // Ada's task is untouched
    let still_there = server
        .request_expect("GET", "/api/tasks", Some(&ada), None, StatusCode::OK)
        .await;
    assert_eq!(still_there.as_array().unwrap().len(), 1);
    assert_eq!(
        still_there.as_array().unwrap()[0].get("completed").unwrap(),
        false
    );
}

#[tokio::test]
async fn focus_session_scenario() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let token = server.sign_up("ada@example.com", "Ada", "secret123").await;

    let task = server
        .request_expect(
            "POST",
            "/api/tasks",
            Some(&token),
            Some(json!({"title":"Write report"})),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").and_then(|v| v.as_i64()).unwrap();

    // Unknown task id is a 404, not a foreign-key blowup
    server
        .request_expect(
            "POST",
            "/api/focus-sessions",
            Some(&token),
            Some(json!({"task_id": 9999})),
            StatusCode::NOT_FOUND,
        )
        .await;

    let session = server
        .request_expect(
            "POST",
            "/api/focus-sessions",
            Some(&token),
            Some(json!({"task_id": task_id, "planned_minutes": 25})),
            StatusCode::OK,
        )
        .await;
    let session_id = session.get("id").and_then(|v| v.as_i64()).unwrap();
    assert!(session.get("ended_at").unwrap().is_null());
    assert_eq!(session.get("completed").unwrap(), false);

    // Second start for the same user conflicts while one is active
    server
        .request_expect(
            "POST",
            "/api/focus-sessions",
            Some(&token),
            Some(json!({})),
            StatusCode::CONFLICT,
        )
        .await;

    // Stats while active: the session shows up, but contributes no minutes
    let stats = server
        .request_expect("GET", "/api/stats", Some(&token), None, StatusCode::OK)
        .await;
    assert_eq!(
        stats
            .get("active_session")
            .unwrap()
            .get("id")
            .and_then(|v| v.as_i64())
            .unwrap(),
        session_id
    );
    assert_eq!(stats.get("total_focus_minutes").unwrap(), 0);
    assert_eq!(stats.get("completed_tasks").unwrap(), 0);

    let ended = server
        .request_expect(
            "POST",
            &format!("/api/focus-sessions/{session_id}/end"),
            Some(&token),
            Some(json!({"duration_minutes": 25, "completed": true})),
            StatusCode::OK,
        )
        .await;
    assert!(ended.get("ended_at").and_then(|v| v.as_str()).is_some());
    assert_eq!(ended.get("completed").unwrap(), true);
    assert_eq!(
        ended
            .get("duration_minutes")
            .and_then(|v| v.as_i64())
            .unwrap(),
        25
    );

    // The linked task was completed atomically with the session
    let tasks = server
        .request_expect("GET", "/api/tasks", Some(&token), None, StatusCode::OK)
        .await;
    let t = &tasks.as_array().unwrap()[0];
    assert_eq!(t.get("completed").unwrap(), true);
    assert!(t.get("completed_at").and_then(|v| v.as_str()).is_some());

    let stats = server
        .request_expect("GET", "/api/stats", Some(&token), None, StatusCode::OK)
        .await;
    assert_eq!(stats.get("total_tasks").unwrap(), 1);
    assert_eq!(stats.get("completed_tasks").unwrap(), 1);
    assert_eq!(stats.get("total_focus_minutes").unwrap(), 25);
    assert_eq!(stats.get("current_streak").unwrap(), 1);
    assert!(stats.get("active_session").unwrap().is_null());

    // Ending twice is a conflict; a bogus id is a 404
    server
        .request_expect(
            "POST",
            &format!("/api/focus-sessions/{session_id}/end"),
            Some(&token),
            Some(json!({"completed": false})),
            StatusCode::CONFLICT,
        )
        .await;
    server
        .request_expect(
            "POST",
            "/api/focus-sessions/9999/end",
            Some(&token),
            Some(json!({"completed": false})),
            StatusCode::NOT_FOUND,
        )
        .await;

    // With the first session ended, a new (taskless) one may start
    let next = server
        .request_expect(
            "POST",
            "/api/focus-sessions",
            Some(&token),
            Some(json!({})),
            StatusCode::OK,
        )
        .await;
    assert!(next.get("task_id").unwrap().is_null());
}

#[tokio::test]
async fn abandoned_sessions_contribute_no_focus_minutes() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let token = server.sign_up("ada@example.com", "Ada", "secret123").await;

    let s1 = server
        .request_expect(
            "POST",
            "/api/focus-sessions",
            Some(&token),
            Some(json!({"planned_minutes": 50})),
            StatusCode::OK,
        )
        .await;
    let s1_id = s1.get("id").and_then(|v| v.as_i64()).unwrap();
    server
        .request_expect(
            "POST",
            &format!("/api/focus-sessions/{s1_id}/end"),
            Some(&token),
            Some(json!({"duration_minutes": 10, "completed": false})),
            StatusCode::OK,
        )
        .await;

    let s2 = server
        .request_expect(
            "POST",
            "/api/focus-sessions",
            Some(&token),
            Some(json!({})),
            StatusCode::OK,
        )
        .await;
    let s2_id = s2.get("id").and_then(|v| v.as_i64()).unwrap();
    server
        .request_expect(
            "POST",
            &format!("/api/focus-sessions/{s2_id}/end"),
            Some(&token),
            Some(json!({"duration_minutes": 40, "completed": true})),
            StatusCode::OK,
        )
        .await;

    let stats = server
        .request_expect("GET", "/api/stats", Some(&token), None, StatusCode::OK)
        .await;
    assert_eq!(stats.get("total_focus_minutes").unwrap(), 40);
}

#[tokio::test]
async fn task_list_and_stats_honor_date_filter() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let token = server.sign_up("ada@example.com", "Ada", "secret123").await;

    server
        .request_expect(
            "POST",
            "/api/tasks",
            Some(&token),
            Some(json!({"title":"Past task","scheduled_date":"2026-01-05"})),
            StatusCode::OK,
        )
        .await;
    server
        .request_expect(
            "POST",
            "/api/tasks",
            Some(&token),
            Some(json!({"title":"Today task"})),
            StatusCode::OK,
        )
        .await;

    let filtered = server
        .request_expect(
            "GET",
            "/api/tasks?date=2026-01-05",
            Some(&token),
            None,
            StatusCode::OK,
        )
        .await;
    let arr = filtered.as_array().unwrap();
    assert_eq!(arr.len(), 1);
    assert_eq!(arr[0].get("title").unwrap(), "Past task");

    let all = server
        .request_expect("GET", "/api/tasks", Some(&token), None, StatusCode::OK)
        .await;
    assert_eq!(all.as_array().unwrap().len(), 2);
    // Ordered by scheduled date, oldest first
    assert_eq!(
        all.as_array().unwrap()[0].get("title").unwrap(),
        "Past task"
    );

    let stats = server
        .request_expect(
            "GET",
            "/api/stats?date=2026-01-05",
            Some(&token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(stats.get("total_tasks").unwrap(), 1);

    server
        .request_expect(
            "GET",
            "/api/tasks?date=students",
            Some(&token),
            None,
            StatusCode::BAD_REQUEST,
        )
        .await;
}
