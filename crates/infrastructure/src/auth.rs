//! JWT 身份验证
//!
//! HS256 签名，claims 中携带用户 ID、显示名和可选头像。

use application::{AuthError, IdentityProvider};
use async_trait::async_trait;
use config::JwtConfig;
use domain::{UserId, UserIdentity};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT 身份提供方
#[derive(Clone)]
pub struct JwtIdentityProvider {
    expiration_hours: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            expiration_hours: config.expiration_hours,
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }

    /// 为身份签发令牌
    pub fn issue_token(&self, identity: &UserIdentity) -> Result<String, AuthError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.expiration_hours);
        self.issue_token_expiring(identity, exp.timestamp())
    }

    /// 指定过期时间签发
    pub fn issue_token_expiring(
        &self,
        identity: &UserIdentity,
        exp: i64,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: identity.user_id.into(),
            name: identity.display_name.clone(),
            avatar: identity.avatar.clone(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| AuthError::InvalidToken(format!("token generation failed: {err}")))
    }

    /// 验证并解析 JWT token
    pub fn decode_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(err.to_string()),
            })
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        let claims = self.decode_claims(token)?;
        let display_name = claims.name.trim();
        if display_name.is_empty() {
            return Err(AuthError::InvalidToken("token has no display name".into()));
        }
        Ok(UserIdentity::new(
            UserId::from(claims.sub),
            display_name,
            claims.avatar,
        ))
    }
}
