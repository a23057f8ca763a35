//! Registration endpoint.
//!
//! `POST /auth/register {"username": .., "password": ..}`
//!
//! | Outcome                    | Status | Body                                        |
//! |----------------------------|--------|---------------------------------------------|
//! | account stored             | 200    | `{"message": "User created", "user_id": ..}` |
//! | missing/blank fields, bad JSON | 400 | `{"error": ..}`                             |
//! | username taken             | 409    | `{"error": "Username already taken"}`       |
//! | store failure              | 500    | `{"error": "Internal server error"}`        |
//!
//! The response never depends on the broker.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::accounts::{RegistrationError, RegistrationService};

/// Request header carrying the caller's trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    message: &'static str,
    user_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Routes served by the auth service.
pub fn router(service: RegistrationService) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .with_state(service)
}

/// Caller-supplied trace id, or a fresh one.
fn trace_id(headers: &HeaderMap) -> String {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn register(
    State(service): State<RegistrationService>,
    headers: HeaderMap,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let trace_id = trace_id(&headers);
    let span = info_span!("auth.register", trace_id = %trace_id);

    let mut response = async {
        let Json(request) = match body {
            Ok(request) => request,
            Err(rejection) => {
                warn!(error = %rejection, "Rejected register request body");
                return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
            }
        };

        info!(username = %request.username, "Register attempt");

        match service
            .register(&request.username, &request.password, &trace_id)
            .await
        {
            Ok(registered) => (
                StatusCode::OK,
                Json(RegisterResponse {
                    message: "User created",
                    user_id: registered.user_id.to_string(),
                }),
            )
                .into_response(),
            Err(RegistrationError::Validation(reason)) => {
                error_response(StatusCode::BAD_REQUEST, reason)
            }
            Err(e @ RegistrationError::Conflict) => {
                warn!(username = %request.username, "Username already taken");
                error_response(StatusCode::CONFLICT, e.to_string())
            }
            Err(RegistrationError::Store(_)) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        }
    }
    .instrument(span)
    .await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
