//! Caller identity. The fronting identity proxy authenticates users and
//! forwards their id in `X-User-Id`; this service trusts that header.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::models::{Role, User};
use crate::state::AppState;
use crate::store::NewUser;
use crate::utils::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

const MAX_USER_ID_LEN: usize = 128;

/// The caller, if one was identified.
pub struct MaybeCaller(pub Option<User>);

/// An identified caller.
pub struct Caller(pub User);

/// An identified caller with the admin role.
pub struct AdminCaller(pub User);

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for MaybeCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(id) = header_str(parts, USER_ID_HEADER) else {
            return Ok(MaybeCaller(None));
        };
        if id.len() > MAX_USER_ID_LEN {
            return Err(AppError::AuthError("Malformed user id".to_string()));
        }

        let role = if state.config.is_admin_id(id) {
            Role::Admin
        } else {
            Role::User
        };
        let user = state
            .store
            .ensure_user(NewUser {
                id: id.to_string(),
                role,
                display_name: header_str(parts, USER_NAME_HEADER).map(str::to_string),
                phone: None,
            })
            .await?;
        Ok(MaybeCaller(Some(user)))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match MaybeCaller::from_request_parts(parts, state).await? {
            MaybeCaller(Some(user)) => Ok(Caller(user)),
            MaybeCaller(None) => Err(AppError::AuthError("Sign in required".to_string())),
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AdminCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Caller(user) = Caller::from_request_parts(parts, state).await?;
        if user.is_admin() {
            Ok(AdminCaller(user))
        } else {
            Err(AppError::Forbidden("Admin access required".to_string()))
        }
    }
}
