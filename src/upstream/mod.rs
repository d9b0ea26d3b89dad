use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::task::parse::TIMESTAMP_FORMAT;

/// One task object exactly as the warehouse system sent it.
pub type RawRecord = serde_json::Value;

/// Callback type for recording upstream request metrics.
/// Receives (status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// Source of raw task records.
pub trait TaskSource: Send + Sync {
    /// Fetch every task created at or after `since`.
    fn fetch_since(
        &self,
        since: NaiveDateTime,
    ) -> impl Future<Output = Result<Vec<RawRecord>>> + Send;
}

/// Format a timestamp the way the upstream `date` parameter expects it.
pub fn format_upstream_date(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Fetch from `source`, turning any failure into an empty batch.
///
/// This is the only place upstream errors are reported; each failed fetch
/// logs exactly one warning.
pub async fn fetch_or_empty<S: TaskSource>(
    source: &S,
    since: NaiveDateTime,
) -> Vec<RawRecord> {
    match source.fetch_since(since).await {
        Ok(records) => records,
        Err(e) => {
            warn!(
                since = %format_upstream_date(since),
                error = %format!("{e:#}"),
                "upstream fetch failed, keeping previous snapshot",
            );
            Vec::new()
        }
    }
}

/// HTTP client for the warehouse task endpoint.
pub struct Client {
    http: reqwest::Client,
    url: Url,
    api_key: String,
    username: String,
    password: String,
    metrics: Option<MetricsCallback>,
}

#[derive(Deserialize)]
struct TasksApiResponse {
    data: Vec<RawRecord>,
}

impl Client {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self> {
        let url = Url::parse(&cfg.url())
            .with_context(|| format!("parsing upstream URL {:?}", cfg.url()))?;
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            url,
            api_key: cfg.api_key.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(status, duration);
        }
    }

    async fn get_tasks(&self, since: NaiveDateTime) -> Result<Vec<RawRecord>> {
        let date = format_upstream_date(since);

        let mut request = self
            .http
            .get(self.url.clone())
            .query(&[("api_key", self.api_key.as_str()), ("date", date.as_str())])
            .header("Accept", "application/json");
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {}", self.url))?;

        let status_code = response.status();
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {} from {}: {}", status_code, self.url, body);
        }

        let resp: TasksApiResponse = response
            .json()
            .await
            .with_context(|| format!("decoding response from {}", self.url))?;

        Ok(resp.data)
    }
}

impl TaskSource for Client {
    async fn fetch_since(&self, since: NaiveDateTime) -> Result<Vec<RawRecord>> {
        debug!(since = %format_upstream_date(since), "fetching tasks");

        let start = Instant::now();
        let result = self.get_tasks(since).await;
        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request(status, start.elapsed());

        let records = result.context("fetching tasks")?;
        debug!(count = records.len(), "fetched tasks");

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::*;

    fn since() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid timestamp")
    }

    struct Failing;

    impl TaskSource for Failing {
        async fn fetch_since(&self, _since: NaiveDateTime) -> Result<Vec<RawRecord>> {
            bail!("connection refused")
        }
    }

    struct Fixed(Vec<RawRecord>);

    impl TaskSource for Fixed {
        async fn fetch_since(&self, _since: NaiveDateTime) -> Result<Vec<RawRecord>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_client_rejects_invalid_url() {
        let cfg = UpstreamConfig {
            server: "bad host:notaport".to_string(),
            route: "/tasks".to_string(),
            ..Default::default()
        };
        let err = Client::new(&cfg).err().expect("should fail");
        assert!(format!("{err:#}").contains("parsing upstream URL"));
    }

    #[test]
    fn test_format_upstream_date() {
        let t = NaiveDate::from_ymd_opt(2024, 3, 7)
            .and_then(|d| d.and_hms_opt(9, 5, 3))
            .expect("valid timestamp");
        assert_eq!(format_upstream_date(t), "07.03.2024 09:05:03");
    }

    #[tokio::test]
    async fn test_fetch_or_empty_on_error() {
        assert!(fetch_or_empty(&Failing, since()).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_or_empty_passes_records() {
        let source = Fixed(vec![serde_json::json!({"Ссылка": "a"})]);
        assert_eq!(fetch_or_empty(&source, since()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_client_records_error_metric() {
        let cfg = UpstreamConfig {
            server: "127.0.0.1:1".to_string(),
            route: "/tasks".to_string(),
            api_key: "k".to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let client = Client::new(&cfg)
            .expect("client")
            .with_metrics(Box::new(move |status, _| {
                if status == "error" {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }));

        assert!(client.fetch_since(since()).await.is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
