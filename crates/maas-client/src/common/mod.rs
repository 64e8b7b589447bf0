//! Common utilities for the MAAS API client
//!
//! Provides the authenticated HTTP wrapper shared by all registry implementations.

pub mod auth;

use crate::error::{classify_api_error, MaasError};
use auth::ApiKey;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Path prefix of the MAAS 2.0 REST API
pub const API_PREFIX: &str = "/api/2.0";

/// Form body as ordered key/value pairs; MAAS accepts repeated keys (e.g. `tags`)
pub type Form = Vec<(&'static str, String)>;

/// HTTP client wrapper with MAAS OAuth authentication
pub struct HttpClient {
    client: Client,
    base_url: String,
    api_key: ApiKey,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Create a new HTTP client wrapper
    pub fn new(client: Client, base_url: String, api_key: ApiKey) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from an API path such as `/machines/`
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}{}", self.base_url, API_PREFIX, path)
        }
    }

    /// Build query string from filters
    pub fn build_query_string(filters: &[(&str, &str)]) -> String {
        filters
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", self.api_key.authorization_header())
            .header("Accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<String, MaasError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(MaasError::Http)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_api_error(status.as_u16(), &body, context));
        }
        Ok(body)
    }

    fn decode<T: DeserializeOwned>(body: &str, context: &str) -> Result<T, MaasError> {
        serde_json::from_str(body).map_err(|e| {
            MaasError::Api(format!(
                "{}: error decoding response body: {} - Response (first 500 chars): {}",
                context,
                e,
                body.chars().take(500).collect::<String>()
            ))
        })
    }

    /// Make a GET request, optionally with query filters
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        filters: &[(&str, &str)],
    ) -> Result<T, MaasError> {
        let mut url = self.build_url(path);
        if !filters.is_empty() {
            let separator = if url.contains('?') { '&' } else { '?' };
            url = format!("{}{}{}", url, separator, Self::build_query_string(filters));
        }
        debug!("GET {}", url);

        let context = format!("GET {path}");
        let body = self.send(self.client.get(&url), &context).await?;
        Self::decode(&body, &context)
    }

    /// Make a form-encoded POST request and decode the response
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &Form,
    ) -> Result<T, MaasError> {
        let body = self.post_form_raw(path, form).await?;
        Self::decode(&body, &format!("POST {path}"))
    }

    /// Make a form-encoded POST request whose response body is not needed
    pub async fn post_form_raw(&self, path: &str, form: &Form) -> Result<String, MaasError> {
        let url = self.build_url(path);
        debug!("POST {} with {} form fields", url, form.len());

        self.send(self.client.post(&url).form(form), &format!("POST {path}"))
            .await
    }

    /// Make a form-encoded PUT request and decode the response
    pub async fn put_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &Form,
    ) -> Result<T, MaasError> {
        let url = self.build_url(path);
        debug!("PUT {} with {} form fields", url, form.len());

        let context = format!("PUT {path}");
        let body = self.send(self.client.put(&url).form(form), &context).await?;
        Self::decode(&body, &context)
    }
}
