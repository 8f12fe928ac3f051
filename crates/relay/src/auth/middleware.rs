use crate::{
    auth::{handshake::token_from_cookies, jwt::JwtAccessTokenService},
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
}

/// Accepts `Authorization: Bearer <token>` or the `token` session cookie.
pub async fn require_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned)
        .or_else(|| token_from_cookies(request.headers()));

    let Some(token) = token else {
        return unauthorized_response("token not provided");
    };

    let user_id = match jwt_service.validate_token(&token) {
        Ok(user_id) => user_id,
        Err(_) => return unauthorized_response("invalid token"),
    };

    request.extensions_mut().insert(AuthenticatedUser { user_id });

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::{extract_bearer_token, require_auth, AuthenticatedUser};
    use crate::auth::jwt::JwtAccessTokenService;
    use axum::{
        body::Body,
        extract::Extension,
        http::{
            header::{AUTHORIZATION, COOKIE},
            Request, StatusCode,
        },
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "murmur_test_secret_that_is_definitely_long_enough";

    fn protected_app(jwt_service: Arc<JwtAccessTokenService>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(user): Extension<AuthenticatedUser>| async move {
                    user.user_id.to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(jwt_service, require_auth))
    }

    fn service() -> Arc<JwtAccessTokenService> {
        Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"))
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer   "), None);
    }

    #[tokio::test]
    async fn rejects_requests_without_credentials() {
        let response = protected_app(service())
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_requests_with_invalid_bearer_token() {
        let response = protected_app(service())
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, "Bearer invalid-token")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_bearer_token() {
        let service = service();
        let token = service.issue_token(Uuid::new_v4()).expect("token should be issued");

        let response = protected_app(service)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn accepts_session_cookie() {
        let service = service();
        let token = service.issue_token(Uuid::new_v4()).expect("token should be issued");

        let response = protected_app(service)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(COOKIE, format!("lang=en; token={token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
