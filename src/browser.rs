use std::{ffi::OsStr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use url::Url;

/// A real browser, used only when the portal insists on a CAPTCHA.
#[async_trait]
pub trait BrowserAutomation: Send {
    /// Opens the login page with a clean cookie jar and returns its markup.
    async fn load_login_page(&mut self, url: &Url) -> anyhow::Result<String>;

    async fn fill_field(&mut self, name: &str, value: &str) -> anyhow::Result<()>;

    async fn inject_captcha_token(&mut self, token: &str) -> anyhow::Result<()>;

    /// Submits the form and returns the markup of the page it lands on.
    async fn submit_and_wait(&mut self) -> anyhow::Result<String>;

    async fn cookies(&mut self) -> anyhow::Result<Vec<(String, String)>>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrowserSettings {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub ready_timeout_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            args: vec![
                "--no-sandbox".into(),
                "--disable-dev-shm-usage".into(),
                "--disable-gpu".into(),
            ],
            ready_timeout_secs: 30,
        }
    }
}

/// Runs a call of the synchronous DevTools client off the async workers.
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Chrome driven over the DevTools protocol, launched on first use.
///
/// Every login page is opened in a fresh incognito context, so no cookies
/// survive from a previous login.
pub struct ChromeBrowser {
    settings: BrowserSettings,
    browser: Option<Arc<Browser>>,
    tab: Option<Arc<Tab>>,
}

impl ChromeBrowser {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            browser: None,
            tab: None,
        }
    }

    async fn launch(&self) -> anyhow::Result<Arc<Browser>> {
        info!("Launching the browser");
        let settings = self.settings.clone();
        blocking(move || {
            let options = LaunchOptionsBuilder::default()
                .headless(settings.headless)
                .path(settings.executable.clone())
                .args(settings.args.iter().map(OsStr::new).collect())
                .build()?;
            let browser = Browser::new(options).context("Failed to launch the browser")?;
            Ok(Arc::new(browser))
        })
        .await
    }

    async fn open_tab(&self, browser: Arc<Browser>) -> anyhow::Result<Arc<Tab>> {
        let timeout = Duration::from_secs(self.settings.ready_timeout_secs);
        blocking(move || {
            let tab = browser.new_context()?.new_tab()?;
            tab.set_default_timeout(timeout);
            Ok(tab)
        })
        .await
    }

    async fn fresh_tab(&mut self) -> anyhow::Result<Arc<Tab>> {
        if let Some(browser) = self.browser.clone() {
            match self.open_tab(browser).await {
                Ok(tab) => return Ok(tab),
                Err(e) => warn!("The browser stopped responding ({e:#}).  Relaunching..."),
            }
        }
        let browser = self.launch().await?;
        self.browser = Some(browser.clone());
        self.open_tab(browser).await
    }

    fn tab(&self) -> anyhow::Result<Arc<Tab>> {
        self.tab.clone().context("The login page has not been loaded")
    }
}

#[async_trait]
impl BrowserAutomation for ChromeBrowser {
    async fn load_login_page(&mut self, url: &Url) -> anyhow::Result<String> {
        let tab = self.fresh_tab().await?;
        self.tab = Some(tab.clone());
        let url = url.to_string();
        blocking(move || {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            tab.get_content()
        })
        .await
    }

    async fn fill_field(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let tab = self.tab()?;
        let selector = format!("[name=\"{name}\"]");
        let value = value.to_owned();
        blocking(move || {
            tab.wait_for_element(&selector)
                .with_context(|| format!("Field {selector:?} was not found"))?
                .click()?
                .type_into(&value)?;
            Ok(())
        })
        .await
    }

    async fn inject_captcha_token(&mut self, token: &str) -> anyhow::Result<()> {
        let tab = self.tab()?;
        let script = format!(
            "(() => {{ \
                const area = document.getElementById('g-recaptcha-response'); \
                if (!area) return false; \
                area.style.display = 'block'; \
                area.value = {token}; \
                area.innerHTML = {token}; \
                return true; \
            }})()",
            token = serde_json::to_string(token)?,
        );
        let injected = blocking(move || Ok(tab.evaluate(&script, false)?.value)).await?;
        if injected != Some(serde_json::Value::Bool(true)) {
            bail!("The page has no reCAPTCHA response field");
        }
        Ok(())
    }

    async fn submit_and_wait(&mut self) -> anyhow::Result<String> {
        let tab = self.tab()?;
        blocking(move || {
            tab.wait_for_element("button[type='submit']")
                .context("Submit button was not found")?
                .click()?;
            tab.wait_until_navigated()?;
            tab.get_content()
        })
        .await
    }

    async fn cookies(&mut self) -> anyhow::Result<Vec<(String, String)>> {
        let tab = self.tab()?;
        let cookies = blocking(move || tab.get_cookies()).await?;
        Ok(cookies.into_iter().map(|c| (c.name, c.value)).collect())
    }
}
