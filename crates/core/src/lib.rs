pub mod aggregate;
pub mod collect;
pub mod domain;
pub mod storage;
pub mod time;
pub mod upstream;
pub mod watch;

pub mod config {
    use anyhow::Context;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub pipelines_base_url: Option<String>,
        pub pipelines_api_token: Option<String>,
        pub pipelines_auth_format: Option<String>,
        pub pipelines_api_key_header: Option<String>,
        pub target_pipeline_id: Option<String>,
        pub target_pipeline_names: Vec<String>,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                pipelines_base_url: non_empty_var("PIPELINES_API_BASE_URL"),
                pipelines_api_token: non_empty_var("PIPELINES_API_TOKEN"),
                pipelines_auth_format: non_empty_var("PIPELINES_AUTH_FORMAT"),
                pipelines_api_key_header: non_empty_var("PIPELINES_API_KEY_HEADER"),
                target_pipeline_id: non_empty_var("PIPELINES_TARGET_ID"),
                target_pipeline_names: parse_names(non_empty_var("PIPELINES_TARGET_NAMES")),
                sentry_dsn: non_empty_var("SENTRY_DSN"),
            })
        }

        pub fn require_pipelines_base_url(&self) -> anyhow::Result<&str> {
            self.pipelines_base_url
                .as_deref()
                .context("PIPELINES_API_BASE_URL is required")
        }

        pub fn require_pipelines_api_token(&self) -> anyhow::Result<&str> {
            self.pipelines_api_token
                .as_deref()
                .context("PIPELINES_API_TOKEN is required")
        }
    }

    fn non_empty_var(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse_names(v: Option<String>) -> Vec<String> {
        let Some(v) = v else {
            return vec!["suporte".to_string(), "sac".to_string()];
        };
        v.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Reads an env knob, falling back to `default` when absent or unparsable.
    pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
            .unwrap_or(default)
    }

}
