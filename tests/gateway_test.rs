//! End-to-end tests against an in-process mock identity upstream.
//!
//! The mock treats any token containing "bad" as invalid (exchange returns
//! statusCode 40105) and rejects logins for the username "locked".

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use easilogin::cache::MemoryCache;
use easilogin::gateway::{build_router, renew_sweep, AppState};
use easilogin::models::{AppConfig, UserRecord};
use easilogin::store::UserStore;

async fn mock_login(Json(body): Json<Value>) -> Json<Value> {
    let username = body["username"].as_str().unwrap_or_default();
    if username == "locked" {
        return Json(json!({"statusCode": 40101, "message": "bad credentials"}));
    }
    Json(json!({
        "data": {
            "token": "abc123def4567890",
            "user": {
                "uid": "U999",
                "username": username,
                "phone": username,
                "nickName": "Nick",
                "realName": "Real",
                "photoUrl": "http://img.example/a.png",
                "joinUnitTime": 1700000000,
            }
        }
    }))
}

async fn mock_exchange(Path(token): Path<String>) -> Json<Value> {
    if token.contains("bad") {
        Json(json!({"statusCode": 40105, "message": "token expired"}))
    } else {
        Json(json!({"data": {"status": "ok"}}))
    }
}

async fn mock_user_info() -> Json<Value> {
    Json(json!({
        "data": {
            "uid": "U999",
            "nickName": "NickFromInfo",
            "realName": "RealFromInfo",
            "photoUrl": "http://img.example/b.png",
        }
    }))
}

async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/api/v1/auth/login", post(mock_login))
        .route(
            "/seewo-account/api/v1/auth/:token/exchange",
            get(mock_exchange),
        )
        .route("/api/v2/user/info", get(mock_user_info));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn test_state(upstream_base: &str, dir: &tempfile::TempDir) -> AppState {
    let mut config = AppConfig::default();
    config.upstream.account_base = upstream_base.to_string();
    config.upstream.edu_base = upstream_base.to_string();
    let cache = Arc::new(MemoryCache::new(1024));
    let users = UserStore::new(dir.path());
    AppState::new(config, cache, users).unwrap()
}

async fn seed_user(state: &AppState, userid: &str, password: &str) {
    let mut users = HashMap::new();
    users.insert(userid.to_string(), UserRecord::new(userid, password));
    state.users.save(users, None).await.unwrap();
}

async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn cache_str(state: &AppState, key: &str) -> Option<String> {
    state
        .cache
        .get(key)
        .await
        .map(|b| String::from_utf8_lossy(&b).to_string())
}

#[tokio::test]
async fn test_sso_login_writes_all_three_indices() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    seed_user(&state, "u1", "p").await;
    let base = serve(state.clone()).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/u1", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cookie.starts_with("pt_token=abc123def4567890"));
    assert!(cookie.contains("Domain=.seewo.com"));
    assert!(cookie.contains("HttpOnly"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "success");
    assert_eq!(body["statusCode"], "200");

    assert_eq!(
        cache_str(&state, "token_by_user:u1").await.as_deref(),
        Some("abc123def4567890")
    );
    assert_eq!(
        cache_str(&state, "token_by_uid:U999").await.as_deref(),
        Some("abc123def4567890")
    );
    let idx: Value = serde_json::from_str(
        &cache_str(&state, "token_index:abc123def4567890")
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(idx["userid"], "u1");
    assert_eq!(idx["uid"], "U999");
}

#[tokio::test]
async fn test_sso_login_serves_cached_token_without_login() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    // No stored user record at all: a valid cached token must
    // short-circuit before the 404 check.
    state
        .write_token_indices("ghost", Some("U1"), "cachedtok1234567")
        .await;
    let base = serve(state.clone()).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/ghost", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(cookie.starts_with("pt_token=cachedtok1234567"));
    // The fast check passed, so the indices were re-stamped, not evicted.
    assert!(cache_str(&state, "token_by_user:ghost").await.is_some());
    assert!(cache_str(&state, "token_by_uid:U1").await.is_some());
    assert!(cache_str(&state, "token_index:cachedtok1234567")
        .await
        .is_some());
}

#[tokio::test]
async fn test_cached_dead_token_falls_through_to_fresh_login() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    seed_user(&state, "u1", "p").await;
    state
        .write_token_indices("u1", Some("U1"), "tok_bad_cached001")
        .await;
    let base = serve(state.clone()).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/u1", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    // The dead cached token must never reach the client.
    assert!(
        cookie.starts_with("pt_token=abc123def4567890"),
        "expected a fresh token, got {}",
        cookie
    );

    assert_eq!(
        cache_str(&state, "token_by_user:u1").await.as_deref(),
        Some("abc123def4567890")
    );
    assert!(cache_str(&state, "token_index:tok_bad_cached001")
        .await
        .is_none());
    assert!(cache_str(&state, "token_by_uid:U1").await.is_none());
}

#[tokio::test]
async fn test_cached_token_check_skipped_when_already_inflight() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    state
        .write_token_indices("u1", None, "tok_bad_cached002")
        .await;
    // Another caller already holds the check for this token; the handler
    // must serve the cached token as-is instead of waiting.
    let _guard = state.inflight_tokens.try_mark("tok_bad_cached002").unwrap();
    let base = serve(state.clone()).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/u1", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(cookie.starts_with("pt_token=tok_bad_cached002"));
    assert!(cache_str(&state, "token_index:tok_bad_cached002")
        .await
        .is_some());
}

#[tokio::test]
async fn test_sso_login_unknown_user_is_404() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    let base = serve(state).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/nobody", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "user_not_found");
    assert_eq!(body["statusCode"], "404");
}

#[tokio::test]
async fn test_sso_login_rejected_credentials_is_401() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    seed_user(&state, "locked", "wrong").await;
    let base = serve(state).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/locked", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "token_invalid");
}

#[tokio::test]
async fn test_sso_login_unreachable_upstream_is_504() {
    let dir = tempfile::tempdir().unwrap();
    // Unroutable port: every attempt is a transport failure.
    let state = test_state("http://127.0.0.1:1", &dir);
    seed_user(&state, "u1", "p").await;
    let base = serve(state).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/u1", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "network_error");
}

#[tokio::test]
async fn test_renew_sweep_refreshes_valid_and_evicts_invalid() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);

    state.write_token_indices("u1", Some("U1"), "tok_alpha_000001").await;
    state.write_token_indices("u2", None, "tok_beta_00000002").await;
    state.write_token_indices("u3", Some("U3"), "tok_bad_00000003").await;
    state
        .cache
        .set("login:u3:deadbeef", "x".into(), None)
        .await;
    state.cache.set("agg:u3:deadbeef", "y".into(), None).await;

    let outcome = renew_sweep(&state).await;
    assert_eq!(outcome.refreshed, 2);
    assert_eq!(outcome.invalidated, 1);
    assert_eq!(outcome.skipped, 0);

    assert!(cache_str(&state, "token_by_user:u1").await.is_some());
    assert!(cache_str(&state, "token_by_user:u2").await.is_some());
    assert!(cache_str(&state, "token_index:tok_alpha_000001").await.is_some());

    assert!(cache_str(&state, "token_by_user:u3").await.is_none());
    assert!(cache_str(&state, "token_by_uid:U3").await.is_none());
    assert!(cache_str(&state, "token_index:tok_bad_00000003").await.is_none());
    assert!(cache_str(&state, "login:u3:deadbeef").await.is_none());
    assert!(cache_str(&state, "agg:u3:deadbeef").await.is_none());
}

#[tokio::test]
async fn test_renew_sweep_skips_tokens_with_inflight_check() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    state.write_token_indices("u1", None, "tok_held_0000001").await;

    let _guard = state.inflight_tokens.try_mark("tok_held_0000001").unwrap();
    let outcome = renew_sweep(&state).await;
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.refreshed, 0);
}

#[tokio::test]
async fn test_introspection_fails_open_when_upstream_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state("http://127.0.0.1:1", &dir);
    // A dead upstream must never prove a token invalid.
    assert!(!state.auth.is_token_invalid("tok_bad_00000003").await);
}

#[tokio::test]
async fn test_validate_and_invalidate_evicts_dead_token() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    state.write_token_indices("u1", Some("U1"), "tok_bad_00000009").await;

    state.validate_and_invalidate("tok_bad_00000009").await;
    assert!(cache_str(&state, "token_by_user:u1").await.is_none());
    assert!(cache_str(&state, "token_index:tok_bad_00000009").await.is_none());
}

#[tokio::test]
async fn test_savedata_user_arm_upserts_record() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    let base = serve(state.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/savedata", base))
        .json(&json!({
            "userid": "u1",
            "password": "pw",
            "user_name": "Nick",
            "head_img": "img",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let rec = state.users.find("u1").await.unwrap().unwrap();
    assert_eq!(rec.password, "pw");
    assert_eq!(rec.user_nickname, "Nick");
    assert_eq!(rec.head_img, "img");
}

#[tokio::test]
async fn test_savedata_app_arm_honors_monotonic_timestamp() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);

    let mut rec = UserRecord::new("u1", "pw");
    rec.user_nickname = "Old".to_string();
    rec.pt_timestamp = Some(100);
    let mut users = HashMap::new();
    users.insert("u1".to_string(), rec);
    state.users.save(users, None).await.unwrap();
    let base = serve(state.clone()).await;

    // Stale snapshot: not newer than the stored timestamp, so ignored.
    // The "-offline" token also keeps the handler off the network.
    let resp = reqwest::Client::new()
        .post(format!("{}/saveData", base))
        .json(&json!({
            "pt_appid": "app",
            "pt_type": "sso",
            "pt_userid": "U999",
            "pt_token": "tok-offline",
            "pt_nickname": "New",
            "pt_username": "u1",
            "pt_timestamp": 50,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let rec = state.users.find("u1").await.unwrap().unwrap();
    assert_eq!(rec.user_nickname, "Old");
    assert_eq!(rec.pt_timestamp, Some(100));

    // Newer snapshot wins.
    let resp = reqwest::Client::new()
        .post(format!("{}/saveData", base))
        .json(&json!({
            "pt_appid": "app",
            "pt_type": "sso",
            "pt_userid": "U999",
            "pt_token": "tok-offline",
            "pt_nickname": "New",
            "pt_username": "u1",
            "pt_timestamp": 200,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let rec = state.users.find("u1").await.unwrap().unwrap();
    assert_eq!(rec.user_nickname, "New");
    assert_eq!(rec.pt_timestamp, Some(200));
    assert_eq!(rec.user_id.as_deref(), Some("U999"));
}

#[tokio::test]
async fn test_sso_list_shows_active_records_only() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);

    let mut users = HashMap::new();
    let mut a = UserRecord::new("a", "pw");
    a.user_nickname = "A".to_string();
    users.insert("a".to_string(), a);
    let mut b = UserRecord::new("b", "pw");
    b.active = false;
    users.insert("b".to_string(), b);
    state.users.save(users, None).await.unwrap();
    let base = serve(state).await;

    let body: Value = reqwest::get(format!("{}/getData/SSOLOGIN", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["pt_appid"], "a");
    assert_eq!(data[0]["pt_nickname"], "A");
}

#[tokio::test]
async fn test_user_info_aggregates_login_and_profile() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    let base = serve(state).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{}/user/info", base))
        .json(&json!({"user_id": "u1", "password": "p"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["message"], "success");
    let data = &body["data"];
    assert_eq!(data["token"], "abc123def4567890");
    // Profile fields override login fields when present.
    assert_eq!(data["nickName"], "NickFromInfo");
    assert_eq!(data["realName"], "RealFromInfo");
    assert_eq!(data["uid"], "U999");

    // Field projection.
    let body: Value = client
        .post(format!("{}/user/info", base))
        .json(&json!({"user_id": "u1", "password": "p", "fields": ["token", "uid"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let data = body["data"].as_object().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data["token"], "abc123def4567890");
}

#[tokio::test]
async fn test_sso_login_keys_login_cache_by_record_key() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    let mut rec = UserRecord::new("u1", "p");
    rec.phone = Some("13800001111".to_string());
    let mut users = HashMap::new();
    users.insert("u1".to_string(), rec);
    state.users.save(users, None).await.unwrap();
    let base = serve(state.clone()).await;

    let resp = reqwest::get(format!("{}/getData/SSOLOGIN/u1", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // The login result is cached under the record key, never the phone,
    // so token invalidation can evict it by `login:{userid}:` prefix.
    let digest = "83878c91171338902e0fe0fb97a8c47a"; // md5("p")
    assert!(cache_str(&state, &format!("login:u1:{}", digest))
        .await
        .is_some());
    assert!(cache_str(&state, &format!("login:13800001111:{}", digest))
        .await
        .is_none());
}

#[tokio::test]
async fn test_metrics_reports_counts_and_request_windows() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    seed_user(&state, "u1", "p").await;
    state
        .cache
        .set("login:u1:deadbeef", "x".into(), None)
        .await;
    state
        .cache
        .set("token_by_user:u1", "tok".into(), None)
        .await;
    let base = serve(state).await;

    // A first request so the 24 h window has something besides the
    // metrics call itself.
    let _ = reqwest::get(format!("{}/savedata", base)).await.unwrap();

    let body: Value = reqwest::get(format!("{}/metrics", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["message"], "success");
    let data = &body["data"];
    assert_eq!(data["accounts_total"], 1);
    assert_eq!(data["cached_logins"], 1);
    assert_eq!(data["active_tokens"], 1);
    assert_eq!(data["service"]["running"], true);
    assert!(data["requests_24h"].as_u64().unwrap() >= 2);
    assert!(data["requests_5m"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn test_compat_stubs_return_success_envelope() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&upstream, &dir);
    let base = serve(state).await;

    let client = reqwest::Client::new();
    for (method, path) in [
        (reqwest::Method::GET, "/savedata"),
        (reqwest::Method::GET, "/getData/SSOLOGOUT"),
        (reqwest::Method::DELETE, "/deleteData"),
    ] {
        let resp = client
            .request(method, format!("{}{}", base, path))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["message"], "success");
        assert_eq!(body["statusCode"], "200");
    }
}
