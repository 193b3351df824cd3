mod password;

pub use password::{hash_password, verify_password};

use std::sync::Arc;

use async_trait::async_trait;
use gotcha::axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::models::User;

/// Who sent the request
#[derive(Debug, Clone, PartialEq)]
pub enum AuthContext {
    /// The configured `user_token`; used to bootstrap the first account
    Service,
    User(User),
    None,
}

impl AuthContext {
    pub fn require_auth(&self) -> Result<(), StatusCode> {
        match self {
            AuthContext::Service | AuthContext::User(_) => Ok(()),
            AuthContext::None => Err(StatusCode::UNAUTHORIZED),
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            AuthContext::User(user) => Some(user),
            _ => None,
        }
    }
}

/// Resolves tokens handed out by `POST /auth/`
#[async_trait]
pub trait UserTokens: Send + Sync {
    async fn user_by_token(&self, token: &str) -> crate::Result<Option<User>>;
}

/// Classify an `Authorization` header value. The service token wins over
/// user tokens; an empty configured token never authenticates.
pub async fn authenticate(
    header: Option<&str>,
    service_token: &str,
    users: &dyn UserTokens,
) -> AuthContext {
    let token = match header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(t) if !t.is_empty() => t,
        Some(_) => {
            warn!("Empty token provided");
            return AuthContext::None;
        }
        None => {
            debug!("No token provided");
            return AuthContext::None;
        }
    };

    if !service_token.is_empty() && token == service_token {
        debug!("Service token authenticated");
        return AuthContext::Service;
    }

    match users.user_by_token(token).await {
        Ok(Some(user)) => {
            debug!(user = %user.uuid, "User token authenticated");
            AuthContext::User(user)
        }
        Ok(None) => {
            warn!("Invalid token provided");
            AuthContext::None
        }
        Err(e) => {
            error!(error = %e, "token lookup failed");
            AuthContext::None
        }
    }
}

/// State of [`auth_middleware`]
#[derive(Clone)]
pub struct AuthState {
    pub settings: Settings,
    pub users: Arc<dyn UserTokens>,
}

/// Attaches an [`AuthContext`] to every request; handlers decide whether
/// they need it.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let context = authenticate(header, &state.settings.user_token, state.users.as_ref()).await;

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
