//! Session lifecycle: login, whoami, logout, expiry.
//!
//! Sessions are strictly per-connection. Logout or expiry on one connection
//! never affects another, even for the same user. Every mutation publishes
//! to the registry before the response goes out.

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::RequestError;
use crate::protocol::{now_ms, Request};

use super::ConnectionWorker;

/// `auth.login {token}` — validate, install the session, mirror it into
/// the registry.
pub(super) async fn login(
    worker: &mut ConnectionWorker,
    req: &Request,
) -> Result<Value, RequestError> {
    let Some(auth) = worker.ctx.config.auth.clone() else {
        return Err(RequestError::unauthorized("Authentication is not configured"));
    };
    let token = req.str_field("token")?;

    let Some(claims) = auth.validator.validate(token).await else {
        return Err(RequestError::unauthorized("Invalid token"));
    };
    if claims.expired(now_ms()) {
        return Err(RequestError::unauthorized("Token has expired"));
    }

    let response = serde_json::to_value(&claims).unwrap_or(Value::Null);
    worker.state.session_id = Some(Uuid::new_v4().to_string());
    worker
        .ctx
        .registry
        .update_auth(
            &worker.state.connection_id,
            Some(claims.user_id.clone()),
            claims.roles.clone(),
        )
        .await;
    info!(
        connection = %worker.state.connection_id,
        user = %claims.user_id,
        "login"
    );
    worker.state.session = Some(claims);

    Ok(response)
}

/// `auth.whoami` — never errors. An expired session is cleared silently.
pub(super) async fn whoami(worker: &mut ConnectionWorker) -> Result<Value, RequestError> {
    let expired = worker
        .state
        .session
        .as_ref()
        .is_some_and(|c| c.expired(now_ms()));
    if expired {
        worker.clear_session().await;
    }

    match &worker.state.session {
        Some(claims) => {
            let mut response = json!({ "authenticated": true });
            if let Ok(Value::Object(fields)) = serde_json::to_value(claims) {
                for (k, v) in fields {
                    response[k] = v;
                }
            }
            Ok(response)
        }
        None => Ok(json!({ "authenticated": false })),
    }
}

/// `auth.logout` — idempotent.
pub(super) async fn logout(worker: &mut ConnectionWorker) -> Result<Value, RequestError> {
    if let Some(claims) = &worker.state.session {
        info!(
            connection = %worker.state.connection_id,
            user = %claims.user_id,
            "logout"
        );
    }
    worker.clear_session().await;
    Ok(json!({ "loggedOut": true }))
}
