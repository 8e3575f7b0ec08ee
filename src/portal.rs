use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    browser::BrowserAutomation, captcha::CaptchaSolver, course_cache::CourseUrlCache,
    fetcher::RetryPolicy, markup::MarkupConfig, store::SharedConfig, transport::Connector,
};

/// Where the portal lives and how its pages look.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortalConfig {
    pub base_url: Url,
    pub email_domain: String,
    pub home_path: String,
    pub my_courses_path: String,
    pub student_courses_path: String,
    /// The portal has used both names for its session cookie.
    pub session_cookie_names: Vec<String>,
    pub xsrf_cookie_name: String,
    pub recaptcha_site_key: String,
    pub recaptcha_action: String,
    pub markup: MarkupConfig,
    pub retry: RetryPolicy,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://eng.asu.edu.eg/").expect("Valid URL literal"),
            email_domain: "eng.asu.edu.eg".into(),
            home_path: "dashboard".into(),
            my_courses_path: "dashboard/my_courses".into(),
            student_courses_path: "study/studies/student_courses".into(),
            session_cookie_names: vec!["laravel_session".into(), "asueng_web".into()],
            xsrf_cookie_name: "XSRF-TOKEN".into(),
            recaptcha_site_key: "6Lf17rUUAAAAAKR0rgH6aM7g0xjtzmxBK6w2T5j1".into(),
            recaptcha_action: "verify".into(),
            markup: MarkupConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PortalConfig {
    pub fn url(&self, path: &str) -> anyhow::Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid portal path: {path:?}"))
    }
}

pub type SharedBrowser = Arc<Mutex<Box<dyn BrowserAutomation>>>;

/// Everything a session needs besides its own state.
#[derive(Clone)]
pub struct Services {
    pub portal: Arc<PortalConfig>,
    pub config: Arc<SharedConfig>,
    pub courses: Arc<CourseUrlCache>,
    pub connector: Arc<dyn Connector>,
    pub browser: SharedBrowser,
    pub captcha: Arc<dyn CaptchaSolver>,
}

impl Services {
    pub fn new(
        portal: PortalConfig,
        config: SharedConfig,
        connector: impl Connector + 'static,
        browser: impl BrowserAutomation + 'static,
        captcha: impl CaptchaSolver + 'static,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            portal: Arc::new(portal),
            courses: Arc::new(CourseUrlCache::new(Arc::clone(&config))),
            config,
            connector: Arc::new(connector),
            browser: Arc::new(Mutex::new(Box::new(browser))),
            captcha: Arc::new(captcha),
        }
    }
}
