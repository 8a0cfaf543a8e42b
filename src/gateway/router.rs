//! The SSO compatibility surface.
//!
//! Routes mirror the desktop client's expectations exactly, including the
//! `{"message", "statusCode"}` envelope and the `pt_token` cookie. Handlers
//! stay thin; token and profile work lives on [`AppState`] and
//! [`crate::auth::AuthService`].

use axum::extract::{Path, State};
use axum::http::header::{HeaderValue, SET_COOKIE};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::metrics;
use super::state::AppState;
use crate::error::AppError;
use crate::models::{SaveDataBody, UserInfoRequest, UserRecord};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);
    Router::new()
        .route("/getData/SSOLOGIN", get(sso_list))
        .route("/getData/SSOLOGIN/:userid", get(sso_login_user))
        .route("/getData/SSOLOGOUT", get(success_stub))
        .route("/savedata", get(success_stub).post(save_user))
        .route("/saveData", post(save_user))
        .route("/deleteData", delete(success_stub))
        .route("/user/info", post(user_info))
        .route("/metrics", get(metrics::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics::track_requests,
        ))
        .layer(cors)
        .with_state(state)
}

fn success() -> Json<Value> {
    Json(json!({"message": "success", "statusCode": "200"}))
}

fn success_with(data: Value) -> Json<Value> {
    Json(json!({"message": "success", "statusCode": "200", "data": data}))
}

fn pt_token_cookie(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let value = format!("pt_token={};Domain=.seewo.com; Path=/; HttpOnly", token);
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(SET_COOKIE, v);
    }
    headers
}

async fn success_stub() -> Json<Value> {
    success()
}

/// Stored accounts in the SSO list shape the client renders.
async fn sso_list(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let users = state.users.load().await?;
    let data: Vec<Value> = users
        .values()
        .filter(|u| u.active)
        .map(|u| {
            json!({
                "pt_nickname": u.user_nickname,
                "pt_appid": u.userid,
                "pt_userid": u.user_id.as_deref().unwrap_or(&u.userid),
                "pt_username": u.user_realname.as_deref().unwrap_or(&u.userid),
                "pt_photourl": u.head_img,
            })
        })
        .collect();
    Ok(success_with(Value::Array(data)))
}

/// The main token path. A cached token is fast-checked once (skipped when
/// a check is already in flight), re-stamped with fresh TTLs when good,
/// and evicted with a fall-through to a full login when the upstream
/// proves it dead.
async fn sso_login_user(
    State(state): State<AppState>,
    Path(userid): Path<String>,
) -> Result<Response, AppError> {
    if let Some(raw) = state.cache.get(&format!("token_by_user:{}", userid)).await {
        let token = String::from_utf8_lossy(&raw).to_string();
        let invalid = match state.inflight_tokens.try_mark(&token) {
            Some(_guard) => state.auth.is_token_invalid_fast(&token).await,
            // Someone else is already checking this token; serve it as-is.
            None => false,
        };
        if !invalid {
            state.refresh_token_indices(&userid, &token).await;
            return Ok((pt_token_cookie(&token), success()).into_response());
        }
        state.invalidate_token_cache(&token).await;
    }

    let record = state
        .users
        .find(&userid)
        .await?
        .filter(|r| r.active)
        .ok_or(AppError::UserNotFound)?;
    let login = state.auth.login(&userid, &record.password).await?;
    state
        .write_token_indices(&userid, login.uid.as_deref(), &login.token)
        .await;

    let st = state.clone();
    let tok = login.token.clone();
    tokio::spawn(async move {
        st.validate_and_invalidate(&tok).await;
    });
    let st = state.clone();
    let key = userid.clone();
    let tok = login.token.clone();
    let fallback_name = login.nick_name.clone();
    let fallback_img = Some(login.head_img.clone()).filter(|s| !s.is_empty());
    tokio::spawn(async move {
        st.refresh_user_profile(&key, &tok, fallback_name, fallback_img)
            .await;
    });

    Ok((pt_token_cookie(&login.token), success()).into_response())
}

/// Upsert from either request shape. The app shape carries a session
/// snapshot and is ignored when its timestamp is not newer than what we
/// already hold.
async fn save_user(
    State(state): State<AppState>,
    Json(body): Json<SaveDataBody>,
) -> Result<Json<Value>, AppError> {
    match body {
        SaveDataBody::User(b) => {
            let mut users = state.users.load().await?;
            let prev = users.get(&b.userid).cloned();
            let mut rec = UserRecord::new(&b.userid, &b.password);
            rec.user_nickname = b.user_name;
            rec.head_img = b.head_img;
            if let Some(p) = &prev {
                rec.phone = p.phone.clone();
                rec.user_realname = p.user_realname.clone();
                rec.pt_timestamp = p.pt_timestamp;
                rec.user_id = p.user_id.clone();
                rec.active = p.active;
            }
            users.insert(b.userid.clone(), rec);
            state.users.save(users, None).await?;
            info!("User record stored: userid({})", b.userid);
            Ok(success())
        }
        SaveDataBody::App(b) => {
            let mut users = state.users.load().await?;
            let prev = users
                .get(&b.pt_username)
                .or_else(|| users.get(&b.pt_userid))
                .cloned();
            if let Some(p) = &prev {
                if p.pt_timestamp.map(|t| t >= b.pt_timestamp).unwrap_or(false) {
                    return Ok(success());
                }
            }

            let token = b.pt_token.clone();
            let token_usable = !token.is_empty()
                && !token.ends_with("-offline")
                && !state.auth.is_token_invalid(&token).await;
            let mut real_name = prev.as_ref().and_then(|p| p.user_realname.clone());
            if token_usable {
                let fetched = state.auth.fetch_user_info(&token).await;
                if let Some(r) = fetched
                    .get("realName")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                {
                    real_name = Some(r.to_string());
                }
            }

            let mut rec = UserRecord::new(
                &b.pt_username,
                prev.as_ref().map(|p| p.password.clone()).unwrap_or_default(),
            );
            rec.phone = prev.as_ref().and_then(|p| p.phone.clone());
            rec.user_nickname = b
                .pt_nickname
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| prev.as_ref().map(|p| p.user_nickname.clone()))
                .unwrap_or_default();
            rec.head_img = b
                .pt_photourl
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| prev.as_ref().map(|p| p.head_img.clone()))
                .unwrap_or_default();
            rec.user_realname = real_name;
            rec.pt_timestamp = Some(b.pt_timestamp);
            rec.user_id = Some(b.pt_userid.clone());
            rec.active = prev.as_ref().map(|p| p.active).unwrap_or(true);
            let key = b.pt_username.clone();
            users.insert(key.clone(), rec);
            state.users.save(users, None).await?;
            info!("Session snapshot stored: userid({})", key);

            if token_usable {
                let st = state.clone();
                tokio::spawn(async move {
                    st.refresh_user_profile(&key, &token, None, None).await;
                });
            }
            Ok(success())
        }
    }
}

/// Aggregated login + profile payload, optionally projected.
async fn user_info(
    State(state): State<AppState>,
    Json(body): Json<UserInfoRequest>,
) -> Result<Json<Value>, AppError> {
    info!(
        "Aggregated user info: user_id({}) fields({})",
        body.user_id,
        body.fields.as_ref().map(Vec::len).unwrap_or(0)
    );
    let data = state
        .auth
        .aggregated_user_info(&body.user_id, &body.password, body.fields.as_deref())
        .await?;
    Ok(success_with(data))
}
