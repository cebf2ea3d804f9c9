//! Access and refresh tokens
//!
//! Both kinds are HS256 JWTs. Access tokens are stateless. Refresh tokens
//! are single use: the store keeps only the SHA-256 hex of the raw token,
//! and rotation revokes the presented token with an atomic test-and-set
//! before issuing its successor, so a replayed or concurrently reused
//! refresh token is rejected.
//!
//! Every rejection surfaces as [`AvError::Token`]; the concrete
//! [`TokenRejection`] is logged but never shown to the caller.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::errors::{AvError, AvResult, TokenRejection};
use crate::store::{RefreshTokenRow, TokenStore, User, UserDirectory};

pub const TOKEN_TYPE_ACCESS: &str = "access";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";

/// Shortest accepted HMAC secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Longest accepted token lifetime (ten years), in seconds.
pub const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Claims carried by both token kinds.
///
/// Access tokens leave `jti` and `device_id` empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub token_type: String,
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Hex SHA-256 of a raw token; the only form that is ever stored.
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn reject(reason: TokenRejection) -> AvError {
    tracing::warn!(reason = reason.as_str(), "Token rejected");
    AvError::token(reason)
}

#[derive(Clone)]
pub struct JwtService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtService {
    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> AvResult<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AvError::config(format!(
                "jwt secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if access_ttl <= Duration::zero() || refresh_ttl <= Duration::zero() {
            return Err(AvError::config("token lifetimes must be positive"));
        }
        let max = Duration::seconds(MAX_TOKEN_TTL_SECS as i64);
        if access_ttl > max || refresh_ttl > max {
            return Err(AvError::config(format!(
                "token lifetimes must not exceed {MAX_TOKEN_TTL_SECS} seconds"
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            access_ttl,
            refresh_ttl,
        })
    }

    pub fn from_config(config: &AuthConfig) -> AvResult<Self> {
        Self::new(
            config.jwt_secret.as_bytes(),
            ttl_from_secs("access_ttl_secs", config.access_ttl_secs)?,
            ttl_from_secs("refresh_ttl_secs", config.refresh_ttl_secs)?,
        )
    }

    fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> AvResult<i64> {
        now.checked_add_signed(ttl)
            .map(|t| t.timestamp())
            .ok_or_else(|| AvError::internal("token expiry out of range"))
    }

    fn encode(&self, claims: &TokenClaims) -> AvResult<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AvError::crypto(format!("token encoding failed: {e}")))
    }

    pub fn generate_access_token(&self, username: &str) -> AvResult<String> {
        let now = Utc::now();
        self.encode(&TokenClaims {
            sub: username.to_string(),
            jti: None,
            iat: now.timestamp(),
            exp: Self::expiry_after(now, self.access_ttl)?,
            token_type: TOKEN_TYPE_ACCESS.to_string(),
            device_id: None,
        })
    }

    /// New refresh token and its claims. A blank device id is left out.
    pub fn generate_refresh_token(
        &self,
        username: &str,
        device_id: Option<&str>,
    ) -> AvResult<(String, TokenClaims)> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub: username.to_string(),
            jti: Some(Uuid::new_v4().to_string()),
            iat: now.timestamp(),
            exp: Self::expiry_after(now, self.refresh_ttl)?,
            token_type: TOKEN_TYPE_REFRESH.to_string(),
            device_id: device_id
                .filter(|d| !d.trim().is_empty())
                .map(str::to_string),
        };
        Ok((self.encode(&claims)?, claims))
    }

    /// Verify signature and expiry.
    pub fn parse(&self, token: &str) -> AvResult<TokenClaims> {
        jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let err = AvError::from(e);
                if let Some(reason) = err.token_reason() {
                    tracing::warn!(reason = reason.as_str(), "Token rejected");
                }
                err
            })
    }

    fn parse_typed(&self, token: &str, expected: &str) -> AvResult<TokenClaims> {
        let claims = self.parse(token)?;
        if claims.token_type != expected {
            return Err(reject(TokenRejection::WrongType));
        }
        Ok(claims)
    }

    pub fn parse_access(&self, token: &str) -> AvResult<TokenClaims> {
        self.parse_typed(token, TOKEN_TYPE_ACCESS)
    }

    pub fn parse_refresh(&self, token: &str) -> AvResult<TokenClaims> {
        self.parse_typed(token, TOKEN_TYPE_REFRESH)
    }
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

/// A freshly issued refresh token. `raw` is not recoverable later.
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub raw: String,
    pub row: RefreshTokenRow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct RefreshTokenService {
    store: Arc<dyn TokenStore>,
    users: Arc<dyn UserDirectory>,
    jwt: JwtService,
}

impl RefreshTokenService {
    pub fn new(store: Arc<dyn TokenStore>, users: Arc<dyn UserDirectory>, jwt: JwtService) -> Self {
        Self { store, users, jwt }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    pub fn issue(&self, user: &User, device_id: Option<&str>) -> AvResult<IssuedRefreshToken> {
        let (raw, claims) = self.jwt.generate_refresh_token(&user.username, device_id)?;
        let expiry = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AvError::internal("refresh token expiry out of range"))?;

        let row = RefreshTokenRow {
            id: Uuid::new_v4(),
            token_hash_hex: hash_token(&raw),
            user_id: user.id,
            expiry,
            revoked: false,
        };
        self.store.save(&row)?;

        tracing::info!(
            user_id = %user.id,
            device = claims.device_id.as_deref().unwrap_or("-"),
            "Refresh token issued"
        );
        Ok(IssuedRefreshToken { raw, row })
    }

    pub fn find_active(&self, raw: &str) -> AvResult<Option<RefreshTokenRow>> {
        self.find_active_at(raw, Utc::now())
    }

    /// Row for `raw` if it is unrevoked and unexpired at `now`.
    pub fn find_active_at(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> AvResult<Option<RefreshTokenRow>> {
        Ok(self
            .store
            .find_by_hash(&hash_token(raw))?
            .filter(|row| row.is_active_at(now)))
    }

    /// Why `raw` is not active. Expiry wins over revocation.
    fn inactive_reason(&self, raw: &str, now: DateTime<Utc>) -> AvResult<TokenRejection> {
        Ok(match self.store.find_by_hash(&hash_token(raw))? {
            None => TokenRejection::UnknownToken,
            Some(row) if row.expiry <= now => TokenRejection::Expired,
            Some(_) => TokenRejection::Revoked,
        })
    }

    /// Revoke `old` and issue its successor for the same user and device.
    ///
    /// Only one caller can win the revocation; the rest are rejected.
    pub fn rotate(
        &self,
        old: &RefreshTokenRow,
        user: &User,
        device_id: Option<&str>,
    ) -> AvResult<IssuedRefreshToken> {
        if !self.store.revoke_if_active(&old.token_hash_hex, Utc::now())? {
            tracing::warn!(user_id = %user.id, token_id = %old.id, "Refresh token replay detected");
            return Err(reject(TokenRejection::Revoked));
        }
        self.issue(user, device_id)
    }

    /// Drop every refresh token the user holds, on every device.
    pub fn revoke_all_for_user(&self, user_id: Uuid) -> AvResult<usize> {
        let removed = self.store.delete_all_for_user(user_id)?;
        tracing::info!(%user_id, removed, "Refresh tokens revoked");
        Ok(removed)
    }

    /// Tokens for a user whose credentials were already checked.
    pub fn login(&self, user: &User, device_id: Option<&str>) -> AvResult<TokenPair> {
        let access_token = self.jwt.generate_access_token(&user.username)?;
        let refresh = self.issue(user, device_id)?;
        Ok(TokenPair {
            access_token,
            refresh_token: refresh.raw,
        })
    }

    /// Exchange a refresh token for a new pair.
    pub fn refresh(&self, raw: &str) -> AvResult<TokenPair> {
        let now = Utc::now();
        let Some(row) = self.find_active_at(raw, now)? else {
            return Err(reject(self.inactive_reason(raw, now)?));
        };

        let claims = self.jwt.parse_refresh(raw)?;
        let user = self
            .users
            .find_by_id(row.user_id)?
            .ok_or_else(|| reject(TokenRejection::UnknownUser))?;
        if claims.sub != user.username {
            return Err(reject(TokenRejection::SubjectMismatch));
        }

        let next = self.rotate(&row, &user, claims.device_id.as_deref())?;
        let access_token = self.jwt.generate_access_token(&user.username)?;
        Ok(TokenPair {
            access_token,
            refresh_token: next.raw,
        })
    }

    /// Revoke all refresh tokens of the access token's subject.
    ///
    /// Returns how many were removed; an unknown subject removes nothing.
    pub fn logout(&self, access_token: &str) -> AvResult<usize> {
        let claims = self.jwt.parse_access(access_token)?;
        match self.users.find_by_username(&claims.sub)? {
            Some(user) => self.revoke_all_for_user(user.id),
            None => {
                tracing::warn!(subject = %claims.sub, "Logout for unknown user");
                Ok(0)
            }
        }
    }

    /// Subject of a valid access token.
    pub fn authenticate(&self, access_token: &str) -> AvResult<String> {
        Ok(self.jwt.parse_access(access_token)?.sub)
    }
}

impl std::fmt::Debug for RefreshTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenService")
            .field("jwt", &self.jwt)
            .finish_non_exhaustive()
    }
}

fn ttl_from_secs(field: &str, secs: u64) -> AvResult<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| AvError::config(format!("auth.{field} is out of range")))
}
