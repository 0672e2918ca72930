//! Credentials consumed by claim negotiation.
//!
//! Token acquisition itself lives outside this crate; implement
//! [`TokenCredential`] over whatever identity provider is in use.

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;

/// Kind of token presented to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// OAuth bearer token.
    Jwt,
    /// Shared access signature.
    SharedAccessSignature,
}

impl TokenType {
    /// Value of the `type` property in a claim request.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::SharedAccessSignature => "servicebus.windows.net:sastoken",
        }
    }
}

/// A token and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw token.
    pub token: String,
    /// Token kind.
    pub token_type: TokenType,
    /// When the token expires. `None` means it can't be renewed and is
    /// negotiated exactly once.
    pub expires_on: Option<SystemTime>,
}

impl AccessToken {
    /// A bearer token expiring at `expires_on`.
    pub fn jwt(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: token.into(),
            token_type: TokenType::Jwt,
            expires_on: Some(expires_on),
        }
    }

    /// A shared access signature with no renewable expiry.
    pub fn sas(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type: TokenType::SharedAccessSignature,
            expires_on: None,
        }
    }
}

/// Source of tokens for an audience.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Get a token valid for `audience`.
    async fn get_token(&self, audience: &str) -> Result<AccessToken>;
}

/// Credential that always hands out the same token.
///
/// Matches a connection string with an embedded signature: the token
/// never changes, so it is never renewed.
#[derive(Debug, Clone)]
pub struct StaticTokenCredential {
    token: AccessToken,
}

impl StaticTokenCredential {
    /// Wrap a fixed token.
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _audience: &str) -> Result<AccessToken> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_type_values() {
        assert_eq!(TokenType::Jwt.as_str(), "jwt");
        assert_eq!(
            TokenType::SharedAccessSignature.as_str(),
            "servicebus.windows.net:sastoken"
        );
    }

    #[tokio::test]
    async fn test_static_credential() {
        let cred = StaticTokenCredential::new(AccessToken::sas("SharedAccessSignature sr=x"));
        let token = cred.get_token("amqp://ns/hub").await.unwrap();
        assert_eq!(token.expires_on, None);
        assert_eq!(token.token_type, TokenType::SharedAccessSignature);
    }
}
