use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tuft_core::{Caller, Role};
use tuft_shared::Masked;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Claims issued by the session provider. `sub` is the user id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

impl TryFrom<Claims> for Caller {
    type Error = AppError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AppError::Authentication("token subject is not a user id".to_string()))?;
        let role: Role = claims
            .role
            .parse()
            .map_err(|_| AppError::Authentication(format!("unknown role {}", claims.role)))?;
        Ok(Caller {
            user_id,
            role,
            email: claims.email.map(Masked),
        })
    }
}

/// Resolves the bearer token into a `Caller` request extension.
pub async fn authenticate(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let TypedHeader(Authorization(bearer)) =
        bearer.ok_or_else(|| AppError::Authentication("missing bearer token".to_string()))?;

    let token_data = decode::<Claims>(
        bearer.token(),
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Authentication(e.to_string()))?;

    let caller = Caller::try_from(token_data.claims)?;
    req.extensions_mut().insert(caller);

    Ok(next.run(req).await)
}

fn caller_of(req: &Request) -> Result<&Caller, AppError> {
    req.extensions()
        .get::<Caller>()
        .ok_or_else(|| AppError::Authentication("request was not authenticated".to_string()))
}

/// Admins and instructors.
pub async fn require_staff(req: Request, next: Next) -> Result<Response, AppError> {
    if !caller_of(&req)?.is_staff() {
        return Err(AppError::Forbidden("staff only".to_string()));
    }
    Ok(next.run(req).await)
}

pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    if !caller_of(&req)?.is_admin() {
        return Err(AppError::Forbidden("admin only".to_string()));
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str, role: &str) -> Claims {
        Claims {
            sub: sub.to_string(),
            role: role.to_string(),
            email: Some("maker@example.com".to_string()),
            exp: 0,
        }
    }

    #[test]
    fn test_claims_resolve_to_caller() {
        let user_id = Uuid::new_v4();
        let caller = Caller::try_from(claims(&user_id.to_string(), "instructor")).unwrap();
        assert_eq!(caller.user_id, user_id);
        assert_eq!(caller.role, Role::Instructor);
        assert!(caller.is_staff());
    }

    #[test]
    fn test_rejects_malformed_claims() {
        assert!(Caller::try_from(claims("not-a-uuid", "STUDENT")).is_err());
        assert!(Caller::try_from(claims(&Uuid::new_v4().to_string(), "OWNER")).is_err());
    }
}
