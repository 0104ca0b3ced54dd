use crate::config::{env_or, Settings};
use crate::domain::pipeline::{Id, Opportunity, Pipeline, Stage};
use crate::upstream::auth::AuthScheme;
use crate::upstream::error::UpstreamError;
use crate::upstream::json;
use crate::upstream::{PageRequest, PipelineApi};
use anyhow::Context;
use reqwest::header::{HeaderName, HeaderValue, RETRY_AFTER};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Accounts rarely have more than a handful of pipelines; one page covers them.
const PIPELINES_PAGE: u64 = 100;

#[derive(Debug, Clone)]
pub struct HttpPipelineClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: HeaderName,
    auth_value: HeaderValue,
}

impl HttpPipelineClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let base_url = settings.require_pipelines_base_url()?;
        let token = settings.require_pipelines_api_token()?;
        let scheme = AuthScheme::parse(
            settings.pipelines_auth_format.as_deref(),
            settings.pipelines_api_key_header.as_deref(),
        );
        let timeout = Duration::from_secs(env_or("PIPELINES_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS));

        tracing::info!(%base_url, ?scheme, "pipelines client configured");
        Self::new(base_url, &scheme, token, timeout)
    }

    pub fn new(
        base_url: &str,
        scheme: &AuthScheme,
        token: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let (auth_header, auth_value) = scheme.header(token)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build pipelines http client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
            auth_value,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String, UpstreamError> {
        let res = self
            .http
            .get(self.url(path))
            .header(self.auth_header.clone(), self.auth_value.clone())
            .query(query)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = res.status();
        let retry_after = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = res
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(UpstreamError::Status {
                status,
                body: text,
                retry_after,
            });
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl PipelineApi for HttpPipelineClient {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, UpstreamError> {
        let query = [("offset", "0".to_string()), ("limit", PIPELINES_PAGE.to_string())];
        let text = self.get_text("/pipelines/", &query).await?;
        let pipelines = json::parse_records::<Pipeline>(&text, "pipelines");
        if pipelines.is_empty() {
            tracing::warn!("upstream returned no pipelines; check token permissions");
        }
        Ok(pipelines)
    }

    async fn list_stages(&self, pipeline_id: &Id) -> Result<Vec<Stage>, UpstreamError> {
        let text = self
            .get_text(&format!("/pipelines/{pipeline_id}/stages"), &[])
            .await?;
        Ok(json::parse_records(&text, "stages"))
    }

    async fn list_opportunities(
        &self,
        pipeline_id: &Id,
        page: &PageRequest,
    ) -> Result<Vec<Opportunity>, UpstreamError> {
        let mut query = vec![
            ("offset", page.offset.to_string()),
            ("limit", page.limit.to_string()),
        ];
        if let Some(contact_id) = &page.contact_id {
            query.push(("contact_id", contact_id.to_string()));
        }

        let text = self
            .get_text(&format!("/pipelines/{pipeline_id}/opportunities"), &query)
            .await?;
        Ok(json::parse_records(&text, "opportunities"))
    }

    async fn contact_tags(&self, contact_id: &Id) -> Result<Vec<String>, UpstreamError> {
        let text = self.get_text(&format!("/contacts/{contact_id}"), &[]).await?;
        Ok(json::tag_names(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, scheme: AuthScheme) -> HttpPipelineClient {
        HttpPipelineClient::new(&server.uri(), &scheme, "secret", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn sends_configured_auth_header_and_unwraps_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pipelines/"))
            .and(header("x-access-token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 665861, "name": "Suporte/SAC"}, {"id": "7", "name": "Vendas"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pipelines = client(&server, AuthScheme::AccessToken)
            .list_pipelines()
            .await
            .unwrap();
        assert_eq!(pipelines.len(), 2);
        assert_eq!(pipelines[0].id, Id::from(665861));
        assert_eq!(pipelines[1].name, "Vendas");
    }

    #[tokio::test]
    async fn passes_pagination_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pipelines/9/opportunities"))
            .and(query_param("offset", "200"))
            .and(query_param("limit", "100"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "stage_id": 3, "value": 10, "created_at": "2024-01-01 00:00:00"}
            ])))
            .mount(&server)
            .await;

        let opps = client(&server, AuthScheme::Bearer)
            .list_opportunities(&Id::from(9), &PageRequest::new(200, 100))
            .await
            .unwrap();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].stage_key(), Some(&Id::from(3)));
    }

    #[tokio::test]
    async fn surfaces_rate_limit_status_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pipelines/9/stages"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "30")
                    .set_body_string("too many"),
            )
            .mount(&server)
            .await;

        let err = client(&server, AuthScheme::XApiKey)
            .list_stages(&Id::from(9))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn reads_contact_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"tags": [{"name": "vip"}, {"name": "b2b"}]}
            })))
            .mount(&server)
            .await;

        let tags = client(&server, AuthScheme::XApiKey)
            .contact_tags(&Id::from(42))
            .await
            .unwrap();
        assert_eq!(tags, vec!["vip", "b2b"]);
    }

    #[tokio::test]
    async fn non_json_success_body_yields_empty_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pipelines/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let pipelines = client(&server, AuthScheme::XApiKey)
            .list_pipelines()
            .await
            .unwrap();
        assert!(pipelines.is_empty());
    }
}
