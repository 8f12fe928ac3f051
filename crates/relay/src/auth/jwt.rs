use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Session tokens live as long as the login cookie that carries them.
pub const SESSION_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionClaims {
    #[serde(rename = "userId")]
    user_id: String,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(&self, user_id: Uuid) -> anyhow::Result<String> {
        self.issue_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, user_id: Uuid, issued_at: i64) -> anyhow::Result<String> {
        let claims = SessionClaims {
            user_id: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + SESSION_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode session token")
    }

    /// Verify signature and expiry, then return the embedded `userId`.
    pub fn validate_token(&self, token: &str) -> anyhow::Result<Uuid> {
        let claims = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode session token")?
            .claims;

        Uuid::parse_str(&claims.user_id)
            .with_context(|| format!("session token userId '{}' is not a UUID", claims.user_id))
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtAccessTokenService, SESSION_TOKEN_TTL_SECONDS};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;
    use uuid::Uuid;

    const TEST_SECRET: &str = "murmur_test_secret_that_is_definitely_long_enough";

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtAccessTokenService::new("too-short").is_err());
    }

    #[test]
    fn issues_and_validates_session_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let user_id = Uuid::new_v4();

        let token = service.issue_token(user_id).expect("token should be issued");

        assert_eq!(service.validate_token(&token).expect("token should validate"), user_id);
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let token = service.issue_token(Uuid::new_v4()).expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(service.validate_token(&tampered).is_err());
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let other = JwtAccessTokenService::new("another_secret_that_is_also_long_enough_!!")
            .expect("service should initialize");
        let token = other.issue_token(Uuid::new_v4()).expect("token should be issued");

        assert!(service.validate_token(&token).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - SESSION_TOKEN_TTL_SECONDS
            - 1;
        let token =
            service.issue_token_at(Uuid::new_v4(), issued_at).expect("token should be issued");

        assert!(service.validate_token(&token).is_err());
    }

    #[test]
    fn rejects_tokens_with_invalid_user_id_claim() {
        #[derive(Serialize)]
        struct InvalidClaims {
            #[serde(rename = "userId")]
            user_id: &'static str,
            iat: i64,
            exp: i64,
        }

        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims =
            InvalidClaims { user_id: "not-a-uuid", iat: now, exp: now + SESSION_TOKEN_TTL_SECONDS };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(service.validate_token(&token).is_err());
    }

    #[test]
    fn rejects_tokens_without_user_id_claim() {
        #[derive(Serialize)]
        struct MissingUserClaims {
            sub: String,
            exp: i64,
        }

        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &MissingUserClaims { sub: Uuid::new_v4().to_string(), exp: now + 60 },
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(service.validate_token(&token).is_err());
    }
}
