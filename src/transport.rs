use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use url::Url;

/// A fully read response, after redirects.
#[derive(Clone, Debug)]
pub struct PortalResponse {
    pub status: StatusCode,
    pub url: Url,
    pub body: String,
}

/// HTTP access to the portal for one session, with its own cookie jar.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url) -> anyhow::Result<PortalResponse>;

    async fn post_form(&self, url: &Url, form: &[(&str, &str)]) -> anyhow::Result<PortalResponse>;

    fn set_cookie(&self, url: &Url, name: &str, value: &str) -> anyhow::Result<()>;

    fn cookie(&self, url: &Url, name: &str) -> Option<String>;
}

/// Creates a fresh [`Transport`] for each new session.
pub trait Connector: Send + Sync {
    fn connect(&self) -> anyhow::Result<Arc<dyn Transport>>;
}

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub struct ReqwestTransport {
    cookie_store: Arc<CookieStoreMutex>,
    reqwest: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let cookie_store = Arc::new(CookieStoreMutex::new(CookieStore::new(None)));
        let reqwest = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(Arc::clone(&cookie_store))
            .build()?;
        Ok(Self {
            cookie_store,
            reqwest,
        })
    }

    async fn read(response: reqwest::Response) -> anyhow::Result<PortalResponse> {
        let status = response.status();
        let url = response.url().clone();
        let body = response.text().await?;
        Ok(PortalResponse { status, url, body })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &Url) -> anyhow::Result<PortalResponse> {
        Self::read(self.reqwest.get(url.clone()).send().await?).await
    }

    async fn post_form(&self, url: &Url, form: &[(&str, &str)]) -> anyhow::Result<PortalResponse> {
        Self::read(self.reqwest.post(url.clone()).form(form).send().await?).await
    }

    fn set_cookie(&self, url: &Url, name: &str, value: &str) -> anyhow::Result<()> {
        self.cookie_store
            .lock()
            .map_err(|_| anyhow!("Cookie store was poisoned"))?
            .parse(&format!("{name}={value}; Path=/"), url)
            .map_err(|e| anyhow!("Failed to set cookie {name}: {e:#}"))?;
        Ok(())
    }

    fn cookie(&self, url: &Url, name: &str) -> Option<String> {
        let store = self.cookie_store.lock().ok()?;
        let found = store
            .matches(url)
            .into_iter()
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_owned());
        found
    }
}

#[derive(Default)]
pub struct ReqwestConnector;

impl Connector for ReqwestConnector {
    fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        Ok(Arc::new(ReqwestTransport::new()?))
    }
}
