//! MAAS API key handling
//!
//! MAAS authenticates API calls with OAuth 1.0 using the PLAINTEXT signature
//! method. The API key handed out by MAAS is `consumer_key:token_key:token_secret`.

use crate::error::MaasError;

/// Parsed MAAS API key
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    consumer_key: String,
    token_key: String,
    token_secret: String,
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("consumer_key", &self.consumer_key)
            .field("token_key", &"<redacted>")
            .field("token_secret", &"<redacted>")
            .finish()
    }
}

impl ApiKey {
    /// Parse an API key of the form `consumer:token:secret`
    pub fn parse(raw: &str) -> Result<Self, MaasError> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        match parts.as_slice() {
            [consumer, token, secret]
                if !consumer.is_empty() && !token.is_empty() && !secret.is_empty() =>
            {
                Ok(Self {
                    consumer_key: (*consumer).to_string(),
                    token_key: (*token).to_string(),
                    token_secret: (*secret).to_string(),
                })
            }
            _ => Err(MaasError::Authentication(
                "API key must have the form consumer:token:secret".to_string(),
            )),
        }
    }

    /// Build the `Authorization` header value for one request.
    ///
    /// Every call gets a fresh nonce and timestamp.
    pub fn authorization_header(&self) -> String {
        let nonce = uuid::Uuid::new_v4();
        let timestamp = chrono::Utc::now().timestamp();
        format!(
            "OAuth oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature=\"&{}\", \
             oauth_nonce=\"{}\", oauth_timestamp=\"{}\"",
            self.consumer_key, self.token_key, self.token_secret, nonce, timestamp
        )
    }
}
