use gotcha::axum::extract::{Path, State};
use gotcha::axum::Extension;
use gotcha::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::auth::AuthContext;
use crate::models::{AuthCheckResponse, AuthTokenResponse, Credentials, UserResponse};
use crate::Db;

fn parse_user_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid user uuid: {}", raw)))
}

/// GET /user/ - List accounts
#[gotcha::api]
pub async fn list_users(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let users = db.list_users().await?;
    Ok(Json(users.into_iter().map(Into::into).collect()))
}

/// POST /user/ - Create an account
#[gotcha::api]
pub async fn create_user(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Json(payload): Json<Credentials>,
) -> Result<Json<UserResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let user = db.create_user(&payload).await?;
    Ok(Json(user.into()))
}

/// GET /user/:uuid - Get an account
#[gotcha::api]
pub async fn get_user(
    State(db): State<Db>,
    Path(user_uuid): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    let uuid = parse_user_uuid(&user_uuid)?;

    let user = db
        .get_user_by_uuid(uuid)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User {} not found", uuid)))?;

    Ok(Json(user.into()))
}

/// DELETE /user/:uuid - Delete an account
#[gotcha::api]
pub async fn delete_user(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Path(user_uuid): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let uuid = parse_user_uuid(&user_uuid)?;
    let user = db.delete_user(uuid).await?;
    Ok(Json(user.into()))
}

/// POST /auth/ - Exchange email and password for a bearer token
#[gotcha::api]
pub async fn authorize(
    State(db): State<Db>,
    Json(payload): Json<Credentials>,
) -> Result<Json<AuthTokenResponse>, ApiError> {
    let authorization_token = db.authorize(&payload).await?;
    Ok(Json(AuthTokenResponse { authorization_token }))
}

/// GET /auth/ - Whether the bearer token is accepted, and whose it is
#[gotcha::api]
pub async fn check_auth(
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<AuthCheckResponse>, ApiError> {
    Ok(Json(auth_check(&auth)?))
}

fn auth_check(auth: &AuthContext) -> Result<AuthCheckResponse, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    Ok(AuthCheckResponse {
        authorized: true,
        user: auth.user().cloned().map(Into::into),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gotcha::axum::http::StatusCode;

    use crate::models::User;

    #[test]
    fn test_parse_user_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(parse_user_uuid(&uuid.to_string()).ok(), Some(uuid));

        let err = parse_user_uuid("42").err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_auth_check_reports_owner() {
        let now = Utc::now();
        let user = User {
            id: 3,
            uuid: Uuid::new_v4(),
            email: "dispatch@example.org".to_string(),
            password_hash: "$argon2id$v=19$...".to_string(),
            token: Some("user-token".to_string()),
            created_at: now,
            updated_at: now,
        };

        let check = auth_check(&AuthContext::User(user.clone())).ok().unwrap();
        assert!(check.authorized);
        assert_eq!(check.user.map(|u| u.uuid), Some(user.uuid.to_string()));

        let check = auth_check(&AuthContext::Service).ok().unwrap();
        assert!(check.authorized);
        assert!(check.user.is_none());

        let err = auth_check(&AuthContext::None).err().unwrap();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }
}
