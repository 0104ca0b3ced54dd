use anyhow::Context;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};

const DEFAULT_CUSTOM_HEADER: &str = "X-ACCESS-TOKEN";

/// The single header scheme used to authenticate every upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    AccessToken,
    XApiKey,
    ApiKey,
    Bearer,
    Token,
    RawAuthorization,
    Custom(String),
}

impl AuthScheme {
    /// Parses `PIPELINES_AUTH_FORMAT`. Unknown formats fall back to a custom header.
    pub fn parse(format: Option<&str>, custom_header: Option<&str>) -> Self {
        let format = format.unwrap_or("apikey").trim().to_ascii_lowercase();
        match format.as_str() {
            "x-access-token" | "access-token" => AuthScheme::AccessToken,
            "apikey" => AuthScheme::XApiKey,
            "api-key" => AuthScheme::ApiKey,
            "bearer" => AuthScheme::Bearer,
            "token" => AuthScheme::Token,
            "authorization" => AuthScheme::RawAuthorization,
            _ => AuthScheme::Custom(
                custom_header
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_CUSTOM_HEADER)
                    .to_string(),
            ),
        }
    }

    pub fn header(&self, token: &str) -> anyhow::Result<(HeaderName, HeaderValue)> {
        let (name, value) = match self {
            AuthScheme::AccessToken => (HeaderName::from_static("x-access-token"), token.to_string()),
            AuthScheme::XApiKey => (HeaderName::from_static("x-api-key"), token.to_string()),
            AuthScheme::ApiKey => (HeaderName::from_static("api-key"), token.to_string()),
            AuthScheme::Bearer => (AUTHORIZATION, format!("Bearer {token}")),
            AuthScheme::Token => (AUTHORIZATION, format!("Token {token}")),
            AuthScheme::RawAuthorization => (AUTHORIZATION, token.to_string()),
            AuthScheme::Custom(header) => (
                HeaderName::from_bytes(header.as_bytes())
                    .with_context(|| format!("invalid auth header name: {header}"))?,
                token.to_string(),
            ),
        };
        let mut value = HeaderValue::from_str(&value).context("auth token is not a valid header value")?;
        value.set_sensitive(true);
        Ok((name, value))
    }
}
