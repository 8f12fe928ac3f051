// Connection authentication for realtime upgrades.
//
// The credential comes from the `token` query parameter of the upgrade URL
// first, then from the `token` cookie. The check runs on the upgrade request,
// so a rejected client never gets a socket.

use axum::http::{header::COOKIE, HeaderMap};
use cookie::Cookie;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::{auth::jwt::JwtAccessTokenService, error::ChatError};

pub const TOKEN_COOKIE: &str = "token";

/// Auth payload a client attaches to its upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeAuth {
    #[serde(default)]
    pub token: Option<String>,
}

/// Resolve the session credential: explicit auth field wins over the cookie.
pub fn extract_credential(auth: &HandshakeAuth, headers: &HeaderMap) -> Option<String> {
    auth.token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| token_from_cookies(headers))
}

/// Value of the `token` cookie across every `Cookie` header on the request.
pub fn token_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| Cookie::split_parse(value).flatten().collect::<Vec<_>>())
        .find(|cookie| cookie.name() == TOKEN_COOKIE && !cookie.value().is_empty())
        .map(|cookie| cookie.value().to_string())
}

pub fn authenticate_connection(
    jwt_service: &JwtAccessTokenService,
    auth: &HandshakeAuth,
    headers: &HeaderMap,
) -> Result<Uuid, ChatError> {
    let Some(token) = extract_credential(auth, headers) else {
        warn!("realtime handshake rejected: no session token");
        return Err(ChatError::Authentication("authentication error"));
    };

    jwt_service.validate_token(&token).map_err(|error| {
        warn!(error = %error, "realtime handshake rejected: invalid session token");
        ChatError::Authentication("authentication error")
    })
}

#[cfg(test)]
mod tests {
    use super::{authenticate_connection, extract_credential, token_from_cookies, HandshakeAuth};
    use crate::{auth::jwt::JwtAccessTokenService, error::ChatError};
    use axum::http::{header::COOKIE, HeaderMap, HeaderValue};
    use uuid::Uuid;

    const TEST_SECRET: &str = "murmur_test_secret_that_is_definitely_long_enough";

    fn headers_with_cookie(raw: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static(raw));
        headers
    }

    #[test]
    fn explicit_auth_field_takes_priority_over_cookie() {
        let auth = HandshakeAuth { token: Some("from-auth".to_string()) };
        let headers = headers_with_cookie("token=from-cookie");

        assert_eq!(extract_credential(&auth, &headers).as_deref(), Some("from-auth"));
    }

    #[test]
    fn falls_back_to_token_cookie() {
        let headers = headers_with_cookie("theme=dark; token=from-cookie; lang=fr");

        assert_eq!(
            extract_credential(&HandshakeAuth::default(), &headers).as_deref(),
            Some("from-cookie")
        );
    }

    #[test]
    fn blank_auth_field_falls_back_to_cookie() {
        let auth = HandshakeAuth { token: Some("   ".to_string()) };
        let headers = headers_with_cookie("token=from-cookie");

        assert_eq!(extract_credential(&auth, &headers).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn ignores_cookies_with_other_names_or_empty_values() {
        assert_eq!(token_from_cookies(&headers_with_cookie("tokens=abc; xtoken=def")), None);
        assert_eq!(token_from_cookies(&headers_with_cookie("token=")), None);
        assert_eq!(token_from_cookies(&HeaderMap::new()), None);
    }

    #[test]
    fn authenticates_valid_cookie_token() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let user_id = Uuid::new_v4();
        let token = service.issue_token(user_id).expect("token should be issued");
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("token={token}")).expect("cookie header should build"),
        );

        let resolved = authenticate_connection(&service, &HandshakeAuth::default(), &headers)
            .expect("handshake should authenticate");
        assert_eq!(resolved, user_id);
    }

    #[test]
    fn rejects_missing_and_invalid_credentials() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");

        let missing = authenticate_connection(&service, &HandshakeAuth::default(), &HeaderMap::new());
        assert!(matches!(missing, Err(ChatError::Authentication(_))));

        let invalid = authenticate_connection(
            &service,
            &HandshakeAuth { token: Some("garbage".to_string()) },
            &HeaderMap::new(),
        );
        assert!(matches!(invalid, Err(ChatError::Authentication(_))));
    }
}
