use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use url::Url;

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, site_key: &str, page_url: &Url, action: &str) -> anyhow::Result<String>;
}

/// Provider codes worth another try.
const TRANSIENT_CODES: &[&str] = &[
    "CAPCHA_NOT_READY",
    "ERROR_CAPTCHA_UNSOLVABLE",
    "ERROR_BAD_DUPLICATES",
    "ERROR_NO_SLOT_AVAILABLE",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptchaSettings {
    pub api_key: String,
    /// Any service speaking the 2captcha `in.php` / `res.php` protocol.
    pub base_url: Url,
    pub polling_interval_secs: u64,
    pub timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: Url::parse("https://api.solvecaptcha.com/").expect("Valid URL literal"),
            polling_interval_secs: 10,
            timeout_secs: 600,
            retry_delay_secs: 5,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: u8,
    request: String,
}

#[derive(Debug, thiserror::Error)]
enum SolveError {
    #[error("Transient solver error: {0}")]
    Transient(String),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ApiResponse {
    fn into_result(self) -> Result<String, SolveError> {
        if self.status == 1 {
            Ok(self.request)
        } else if TRANSIENT_CODES.contains(&self.request.as_str()) {
            Err(SolveError::Transient(self.request))
        } else {
            Err(SolveError::Fatal(anyhow!("Solver error: {}", self.request)))
        }
    }
}

/// One request to the solving service.
#[async_trait]
trait SolverApi: Send + Sync {
    async fn call(&self, path: &str, query: &[(&str, &str)]) -> Result<ApiResponse, SolveError>;
}

struct HttpApi {
    base_url: Url,
    api_key: String,
    reqwest: reqwest::Client,
}

#[async_trait]
impl SolverApi for HttpApi {
    async fn call(&self, path: &str, query: &[(&str, &str)]) -> Result<ApiResponse, SolveError> {
        let url = self.base_url.join(path).map_err(anyhow::Error::from)?;
        let response = self
            .reqwest
            .get(url)
            .query(&[("key", self.api_key.as_str()), ("json", "1")])
            .query(query)
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?;
        Ok(response.json().await.map_err(anyhow::Error::from)?)
    }
}

pub struct TwoCaptchaSolver {
    settings: CaptchaSettings,
    api: Arc<dyn SolverApi>,
}

impl TwoCaptchaSolver {
    pub fn new(settings: CaptchaSettings) -> anyhow::Result<Self> {
        let api = HttpApi {
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            reqwest: reqwest::Client::builder().build()?,
        };
        Ok(Self {
            settings,
            api: Arc::new(api),
        })
    }

    async fn try_solve(&self, site_key: &str, page_url: &Url, action: &str) -> Result<String, SolveError> {
        let id = self
            .api
            .call(
                "in.php",
                &[
                    ("method", "userrecaptcha"),
                    ("googlekey", site_key),
                    ("pageurl", page_url.as_str()),
                    ("action", action),
                ],
            )
            .await?
            .into_result()?;
        info!("Submitted CAPTCHA {id}");

        let interval = Duration::from_secs(self.settings.polling_interval_secs);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.settings.timeout_secs);
        loop {
            tokio::time::sleep(interval).await;
            match self
                .api
                .call("res.php", &[("action", "get"), ("id", id.as_str())])
                .await?
                .into_result()
            {
                Err(SolveError::Transient(code))
                    if code == "CAPCHA_NOT_READY" && tokio::time::Instant::now() < deadline => {}
                result => return result,
            }
        }
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    async fn solve(&self, site_key: &str, page_url: &Url, action: &str) -> anyhow::Result<String> {
        let attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_solve(site_key, page_url, action).await {
                Ok(token) if token.trim().is_empty() => bail!("The solver returned an empty token"),
                Ok(token) => return Ok(token),
                Err(SolveError::Transient(code)) if attempt < attempts => {
                    warn!("CAPTCHA solver reported {code}.  Retrying...");
                    tokio::time::sleep(Duration::from_secs(self.settings.retry_delay_secs)).await;
                }
                Err(e) => return Err(anyhow!(e)),
            }
        }
        bail!("The CAPTCHA was not solved after {attempts} attempts")
    }
}
