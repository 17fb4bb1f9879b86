//! Caller identity
//!
//! Authentication happens upstream. The gateway in front of this service
//! forwards the authenticated user as request headers, which are turned into
//! a [`Caller`] here and passed explicitly into every offer operation.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::UserId;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_VERIFIED_HEADER: &str = "x-user-verified";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    #[default]
    User,
    Admin,
}

/// The authenticated user behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub verified: bool,
    pub role: CallerRole,
}

impl Caller {
    /// An unverified regular user.
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            verified: false,
            role: CallerRole::User,
        }
    }

    pub fn verified(user_id: impl Into<UserId>) -> Self {
        Self {
            verified: true,
            ..Self::user(user_id)
        }
    }

    pub fn admin(user_id: impl Into<UserId>) -> Self {
        Self {
            verified: true,
            role: CallerRole::Admin,
            ..Self::user(user_id)
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == CallerRole::Admin
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = match header(parts, USER_ID_HEADER)? {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(AppError::Unauthorized(format!(
                    "Missing {USER_ID_HEADER} header"
                )))
            }
        };

        let verified = match header(parts, USER_VERIFIED_HEADER)? {
            None => false,
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
            Some(v) => {
                return Err(AppError::Unauthorized(format!(
                    "Invalid {USER_VERIFIED_HEADER} header: {v}"
                )))
            }
        };

        let role = match header(parts, USER_ROLE_HEADER)? {
            None => CallerRole::User,
            Some(v) if v.eq_ignore_ascii_case("user") => CallerRole::User,
            Some(v) if v.eq_ignore_ascii_case("admin") => CallerRole::Admin,
            Some(v) => {
                return Err(AppError::Unauthorized(format!(
                    "Invalid {USER_ROLE_HEADER} header: {v}"
                )))
            }
        };

        Ok(Caller {
            user_id,
            verified,
            role,
        })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<Option<&'a str>, AppError> {
    parts
        .headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| AppError::Unauthorized(format!("Malformed {name} header")))
        })
        .transpose()
}
