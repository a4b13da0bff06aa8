use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;
use crate::{auth, users};

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(auth::router())
        .merge(users::router(state.clone()))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        if status.is_server_error() {
                            tracing::error!(%status, ?latency, "response");
                        } else {
                            tracing::info!(%status, ?latency, "response");
                        }
                    },
                ),
        )
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Response {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(req).await.unwrap()
    }

    async fn json_body(res: Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn alice() -> Value {
        json!({
            "first_name": "Alice",
            "last_name": "Liddell",
            "username": "alice",
            "email": "a@x.com",
            "age": 30,
            "password": "Secret1"
        })
    }

    /// Registers alice and logs her in, returning (id, token).
    async fn register_and_login(app: &Router) -> (String, String) {
        let res = send(app, Method::POST, "/user", None, Some(alice())).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let user = json_body(res).await;
        let id = user["id"].as_str().unwrap().to_string();

        let res = send(
            app,
            Method::POST,
            "/login",
            None,
            Some(json!({ "username": "alice", "password": "Secret1" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let token = json_body(res).await["token"].as_str().unwrap().to_string();
        (id, token)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = build_app(AppState::fake());
        let res = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_then_login() {
        let app = build_app(AppState::fake());

        let res = send(&app, Method::POST, "/user", None, Some(alice())).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let user = json_body(res).await;
        assert_eq!(user["username"], "alice");
        assert!(user.get("password").is_none());
        assert!(user.get("password_hash").is_none());

        let res = send(
            &app,
            Method::POST,
            "/login",
            None,
            Some(json!({ "username": "alice", "password": "Secret1" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert!(!body["token"].as_str().unwrap().is_empty());
        assert!(body["user"]["last_login_at"].is_string());

        let res = send(
            &app,
            Method::POST,
            "/login",
            None,
            Some(json!({ "username": "alice", "password": "wrong" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let body = json_body(res).await;
        assert!(body.get("token").is_none());
        assert_eq!(body["error"]["code"], "AUTH_003");
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let app = build_app(AppState::fake());
        send(&app, Method::POST, "/user", None, Some(alice())).await;

        let mut again = alice();
        again["username"] = json!("alice2");
        let res = send(&app, Method::POST, "/user", None, Some(again)).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = send(&app, Method::GET, "/users", None, None).await;
        let list = json_body(res).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_with_missing_field_is_validation_error() {
        let app = build_app(AppState::fake());
        let mut body = alice();
        body.as_object_mut().unwrap().remove("age");

        let res = send(&app, Method::POST, "/user", None, Some(body)).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = json_body(res).await;
        assert_eq!(body["error"]["code"], "VAL_001");
        assert!(body["error"]["message"].as_str().unwrap().contains("age"));

        let res = send(&app, Method::GET, "/users", None, None).await;
        assert!(json_body(res).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_without_content_type_is_validation_error() {
        let app = build_app(AppState::fake());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .body(Body::from(
                json!({ "username": "alice", "password": "Secret1" }).to_string(),
            ))
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"]["code"], "VAL_001");
    }

    #[tokio::test]
    async fn update_with_broken_json_is_validation_error() {
        let app = build_app(AppState::fake());
        let (id, token) = register_and_login(&app).await;

        let req = Request::builder()
            .method(Method::PUT)
            .uri(format!("/user/{id}"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"first_name\":"))
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"]["code"], "VAL_001");
    }

    #[tokio::test]
    async fn owner_can_read_profile() {
        let app = build_app(AppState::fake());
        let (id, token) = register_and_login(&app).await;

        let res = send(&app, Method::GET, &format!("/user/{id}"), Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let user = json_body(res).await;
        assert_eq!(user["id"], id.as_str());
        assert!(user.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn missing_or_malformed_bearer_is_bad_request() {
        let app = build_app(AppState::fake());
        let (id, _) = register_and_login(&app).await;

        let res = send(&app, Method::GET, &format!("/user/{id}"), None, None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .uri(format!("/user/{id}"))
            .header(header::AUTHORIZATION, "Token abc")
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn token_for_another_user_is_forbidden() {
        let app = build_app(AppState::fake());
        let (_, token) = register_and_login(&app).await;

        let mut bob = alice();
        bob["username"] = json!("bob");
        bob["email"] = json!("b@x.com");
        let res = send(&app, Method::POST, "/user", None, Some(bob)).await;
        let bob_id = json_body(res).await["id"].as_str().unwrap().to_string();

        let res = send(&app, Method::GET, &format!("/user/{bob_id}"), Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let forbidden = json_body(res).await;

        let res = send(&app, Method::GET, &format!("/user/{bob_id}"), Some("garbage"), None).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        // a wrong subject and a broken token read the same
        assert_eq!(json_body(res).await, forbidden);

        let res = send(&app, Method::DELETE, &format!("/user/{bob_id}"), Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn wrong_old_password_changes_nothing() {
        let app = build_app(AppState::fake());
        let (id, token) = register_and_login(&app).await;

        let res = send(
            &app,
            Method::PUT,
            &format!("/user/{id}"),
            Some(&token),
            Some(json!({
                "first_name": "Mallory",
                "oldPassword": "not-it",
                "newPassword": "Secret2"
            })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = send(&app, Method::GET, &format!("/user/{id}"), Some(&token), None).await;
        assert_eq!(json_body(res).await["first_name"], "Alice");
    }

    #[tokio::test]
    async fn profile_update_is_applied() {
        let app = build_app(AppState::fake());
        let (id, token) = register_and_login(&app).await;

        let res = send(
            &app,
            Method::PUT,
            &format!("/user/{id}"),
            Some(&token),
            Some(json!({ "last_name": "Pleasance" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["last_name"], "Pleasance");
    }

    #[tokio::test]
    async fn soft_delete_hides_user() {
        let app = build_app(AppState::fake());
        let (id, token) = register_and_login(&app).await;

        let res = send(&app, Method::DELETE, &format!("/user/{id}"), Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = send(&app, Method::GET, "/users", None, None).await;
        assert!(json_body(res).await.as_array().unwrap().is_empty());

        // the token is still valid, but the row is gone from lookups
        let res = send(&app, Method::GET, &format!("/user/{id}"), Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hard_delete_flag_is_honoured() {
        let state = AppState::fake();
        let directory = state.directory.clone();
        let app = build_app(state);
        let (id, token) = register_and_login(&app).await;

        let res = send(
            &app,
            Method::DELETE,
            &format!("/user/{id}"),
            Some(&token),
            Some(json!({ "hard": true })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);

        let id = uuid::Uuid::parse_str(&id).unwrap();
        assert!(directory.get_user_by_id_including_deleted(id).await.is_err());
    }
}
