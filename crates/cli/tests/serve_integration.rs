//! Integration tests for the `jitgate serve` HTTP API.
//!
//! Each test seeds a fresh database, starts the server as a child process
//! on a unique port, makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tempfile::TempDir;

/// Base port is derived from the process ID so separate test binaries
/// don't collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Seeded demo user ids keyed by email.
struct Seeded {
    user: u64,
    cs1: u64,
    cs2: u64,
    auditor: u64,
}

fn seed(db: &Path) -> Seeded {
    let output = Command::new(env!("CARGO_BIN_EXE_jitgate"))
        .args(["--output", "json", "seed", "--db"])
        .arg(db)
        .output()
        .expect("failed to run jitgate seed");
    assert!(output.status.success(), "seed failed: {:?}", output);
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("seed JSON");
    let id_of = |email: &str| {
        json["users"]
            .as_array()
            .unwrap()
            .iter()
            .find(|u| u["email"] == email)
            .and_then(|u| u["id"].as_u64())
            .unwrap()
    };
    Seeded {
        user: id_of("user@example.com"),
        cs1: id_of("cs1@example.com"),
        cs2: id_of("cs2@example.com"),
        auditor: id_of("auditor@example.com"),
    }
}

/// Start `jitgate serve` on `port` against `db`.
fn start_server(port: u16, db: &Path, env: &[(&str, &str)]) -> Child {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_jitgate"));
    cmd.arg("serve")
        .arg("--port")
        .arg(port.to_string())
        .arg("--db")
        .arg(db)
        .env("JITGATE_SECRET_KEY", "serve-test-secret")
        .env_remove("JITGATE_API_KEY")
        .env_remove("JITGATE_RATE_LIMIT")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (k, v) in env {
        cmd.env(k, v);
    }

    let child = cmd.spawn().expect("failed to start jitgate serve");
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            return child;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    child
}

struct Running {
    child: Child,
    port: u16,
    _dir: TempDir,
    ids: Seeded,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

fn running(env: &[(&str, &str)]) -> Running {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("gate.db");
    let ids = seed(&db);
    let port = next_port();
    let child = start_server(port, &db, env);
    Running {
        child,
        port,
        _dir: dir,
        ids,
    }
}

/// Make an HTTP request and return (status, body).
fn http(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, String)],
    body: Option<&serde_json::Value>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut header_lines = String::new();
    for (name, value) in headers {
        header_lines.push_str(&format!("{}: {}\r\n", name, value));
    }
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    if body.is_some() {
        header_lines.push_str("Content-Type: application/json\r\n");
    }
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        header_lines,
        payload.len(),
        payload
    );
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    parse_http_response(&response)
}

fn as_actor(id: u64, role: &str) -> Vec<(&'static str, String)> {
    vec![("X-Actor-Id", id.to_string()), ("X-Actor-Role", role.to_string())]
}

fn json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or_else(|e| panic!("invalid JSON {body:?}: {e}"))
}

/// Parse an HTTP response into (status_code, body).
fn parse_http_response(response: &str) -> (u16, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status = headers
        .lines()
        .next()
        .unwrap_or("")
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let chunked = headers
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked");
    let body = if chunked { decode_chunked(&body) } else { body };
    (status, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = if chunk_end + 2 <= remaining.len() {
            &remaining[chunk_end + 2..]
        } else {
            ""
        };
    }

    result
}

/// Seeded answers, keyed by category.
fn seeded_answer(category: &str) -> &'static str {
    match category {
        "STATIC" => "1234",
        "HISTORY" => "June",
        "USAGE" => "iPhone",
        other => panic!("unexpected category {other}"),
    }
}

#[test]
fn health_returns_200_with_version() {
    let srv = running(&[]);
    let (status, body) = http(srv.port, "GET", "/health", &[], None);
    assert_eq!(status, 200);
    let json = json(&body);
    assert_eq!(json["status"], "ok");
    assert!(json.get("version").is_some());
}

#[test]
fn unknown_route_is_404() {
    let srv = running(&[]);
    let (status, _) = http(srv.port, "GET", "/nope", &[], None);
    assert_eq!(status, 404);
}

#[test]
fn api_requires_caller_identity_and_matching_role() {
    let srv = running(&[]);
    let (status, _) = http(srv.port, "GET", "/api/cs/cases/open", &[], None);
    assert_eq!(status, 401);

    let headers = as_actor(srv.ids.user, "USER");
    let (status, _) = http(srv.port, "GET", "/api/cs/cases/open", &headers, None);
    assert_eq!(status, 403);

    let headers = as_actor(srv.ids.cs1, "CS");
    let (status, body) = http(srv.port, "GET", "/api/cs/cases/open", &headers, None);
    assert_eq!(status, 200);
    assert_eq!(json(&body), serde_json::json!([]));
}

#[test]
fn full_claim_verify_redeem_and_reset_flow() {
    let srv = running(&[]);
    let port = srv.port;
    let user = as_actor(srv.ids.user, "USER");
    let cs1 = as_actor(srv.ids.cs1, "CS");
    let cs2 = as_actor(srv.ids.cs2, "CS");
    let auditor = as_actor(srv.ids.auditor, "AUDITOR");

    let (status, body) = http(
        port,
        "POST",
        "/api/user/cases",
        &user,
        Some(&serde_json::json!({ "subject": "locked out of my account" })),
    );
    assert_eq!(status, 201, "{body}");
    let case_id = json(&body)["id"].as_u64().unwrap();

    let claim = format!("/api/cs/cases/{case_id}/claim");
    let (status, _) = http(port, "POST", &claim, &cs1, None);
    assert_eq!(status, 200);
    let (status, _) = http(port, "POST", &claim, &cs2, None);
    assert_eq!(status, 409);

    let (status, body) = http(
        port,
        "POST",
        &format!("/api/cs/cases/{case_id}/start-verification"),
        &cs1,
        None,
    );
    assert_eq!(status, 200, "{body}");
    let started = json(&body);
    assert_eq!(started["status"], "PENDING");
    let url = started["verification_url"].as_str().unwrap();
    let token = url.rsplit('/').next().unwrap();

    let (status, body) = http(port, "GET", &format!("/verify/{token}"), &[], None);
    assert_eq!(status, 200);
    assert!(!body.contains("sha256$"));
    let questions = json(&body)["questions"].as_array().unwrap().clone();
    assert_eq!(questions.len(), 3);

    let mut answers = serde_json::Map::new();
    for q in &questions {
        answers.insert(
            q["id"].as_u64().unwrap().to_string(),
            serde_json::json!(seeded_answer(q["category"].as_str().unwrap())),
        );
    }
    let (status, body) = http(
        port,
        "POST",
        &format!("/verify/{token}"),
        &[],
        Some(&serde_json::json!({ "answers": answers })),
    );
    assert_eq!(status, 200, "{body}");
    assert_eq!(json(&body)["passed"], true);

    let redeem = format!("/api/cs/cases/{case_id}/redeem");
    let action = serde_json::json!({ "action": "SEND_RESET_LINK" });
    let (status, body) = http(port, "POST", &redeem, &cs1, Some(&action));
    assert_eq!(status, 200, "{body}");
    let redemption = json(&body);
    assert_eq!(redemption["kind"], "reset_link");
    let reset_url = redemption["reset_url"].as_str().unwrap();
    let reset_token = reset_url.split("token=").nth(1).unwrap();

    let (status, body) = http(port, "POST", &redeem, &cs1, Some(&action));
    assert_eq!(status, 403);
    assert_eq!(json(&body)["error"], "access denied");

    let (status, _) = http(
        port,
        "POST",
        "/reset-password",
        &[],
        Some(&serde_json::json!({ "token": reset_token, "new_password": "correct horse battery" })),
    );
    assert_eq!(status, 200);

    let case_audit = format!("/api/cs/cases/{case_id}/audit");
    let (status, _) = http(port, "GET", &case_audit, &cs2, None);
    assert_eq!(status, 403);
    let (status, body) = http(port, "GET", &case_audit, &cs1, None);
    assert_eq!(status, 200);
    assert!(!json(&body).as_array().unwrap().is_empty());

    let (status, body) = http(port, "GET", "/api/auditor/logs", &auditor, None);
    assert_eq!(status, 200);
    let rows = json(&body);
    let rows = rows.as_array().unwrap();
    assert!(rows.iter().any(|r| r["result"] == "PASSED"));
    for row in rows.iter().filter(|r| r["actor_role"] == "CS") {
        let actor_ref = row["actor_ref"].as_str().unwrap();
        assert_ne!(actor_ref, srv.ids.cs1.to_string());
        assert_eq!(actor_ref.len(), 64);
    }

    let (status, body) = http(port, "GET", "/api/auditor/reports", &auditor, None);
    assert_eq!(status, 200);
    assert_eq!(json(&body)[0]["case_id"], case_id);
}

#[test]
fn wrong_answers_report_remaining_attempts() {
    let srv = running(&[]);
    let port = srv.port;
    let user = as_actor(srv.ids.user, "USER");
    let cs1 = as_actor(srv.ids.cs1, "CS");

    let (_, body) = http(
        port,
        "POST",
        "/api/user/cases",
        &user,
        Some(&serde_json::json!({ "subject": "help" })),
    );
    let case_id = json(&body)["id"].as_u64().unwrap();
    http(port, "POST", &format!("/api/cs/cases/{case_id}/claim"), &cs1, None);
    let (_, body) = http(
        port,
        "POST",
        &format!("/api/cs/cases/{case_id}/start-verification"),
        &cs1,
        None,
    );
    let url = json(&body)["verification_url"].as_str().unwrap().to_string();
    let token = url.rsplit('/').next().unwrap();

    let wrong = serde_json::json!({ "answers": {} });
    let (status, body) = http(port, "POST", &format!("/verify/{token}"), &[], Some(&wrong));
    assert_eq!(status, 200);
    let outcome = json(&body);
    assert_eq!(outcome["passed"], false);
    assert_eq!(outcome["message"], "2 attempts remaining");

    for _ in 0..2 {
        http(port, "POST", &format!("/verify/{token}"), &[], Some(&wrong));
    }
    let (status, _) = http(port, "GET", &format!("/verify/{token}"), &[], None);
    assert_eq!(status, 400);
}

#[test]
fn unknown_verification_token_is_400() {
    let srv = running(&[]);
    let (status, body) = http(srv.port, "GET", "/verify/not-a-token", &[], None);
    assert_eq!(status, 400);
    assert_eq!(
        json(&body)["error"],
        "invalid or expired verification session"
    );
}

#[test]
fn api_key_guards_api_routes_only() {
    let srv = running(&[("JITGATE_API_KEY", "gateway-key")]);
    let cs1 = as_actor(srv.ids.cs1, "CS");

    let (status, _) = http(srv.port, "GET", "/api/cs/cases/open", &cs1, None);
    assert_eq!(status, 401);

    let mut wrong = cs1.clone();
    wrong.push(("X-API-Key", "nope".to_string()));
    let (status, _) = http(srv.port, "GET", "/api/cs/cases/open", &wrong, None);
    assert_eq!(status, 403);

    let mut bearer = cs1.clone();
    bearer.push(("Authorization", "Bearer gateway-key".to_string()));
    let (status, _) = http(srv.port, "GET", "/api/cs/cases/open", &bearer, None);
    assert_eq!(status, 200);

    let (status, _) = http(srv.port, "GET", "/health", &[], None);
    assert_eq!(status, 200);
}

#[test]
fn rate_limit_returns_429() {
    let srv = running(&[("JITGATE_RATE_LIMIT", "2")]);
    for _ in 0..2 {
        let (status, _) = http(srv.port, "GET", "/health", &[], None);
        assert_eq!(status, 200);
    }
    let (status, body) = http(srv.port, "GET", "/health", &[], None);
    assert_eq!(status, 429);
    assert!(json(&body).get("retry_after").is_some());
}
