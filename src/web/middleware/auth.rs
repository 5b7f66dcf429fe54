//! Bearer token authentication for REST handlers.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Body,
    extract::FromRequestParts,
    http::{request::Parts, Request},
    middleware::Next,
    response::Response,
    RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::auth::{Identity, TokenVerifier};
use crate::web::error::ApiError;

/// Extractor for authenticated users.
///
/// Requires `Authorization: Bearer <token>` and a [`TokenVerifier`] placed in
/// the request extensions by [`inject_verifier`].
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::unauthorized("Missing authorization"))?;

        let verifier = parts
            .extensions
            .get::<Arc<TokenVerifier>>()
            .ok_or_else(|| ApiError::internal("Token verifier not configured"))?;

        let identity = verifier.verify(bearer.token()).map_err(|e| {
            tracing::debug!("Bearer token rejected: {}", e);
            ApiError::unauthorized("Invalid or expired token")
        })?;

        Ok(AuthUser(identity))
    }
}

/// Middleware function to inject the token verifier into request extensions.
pub async fn inject_verifier(
    verifier: Arc<TokenVerifier>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    request.extensions_mut().insert(verifier);
    next.run(request).await
}
