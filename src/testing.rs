//! In-memory stand-ins for the portal, the browser, the CAPTCHA solver and
//! the config store.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use async_trait::async_trait;
use grade_monitor_utils::credentials::Credentials;
use reqwest::StatusCode;
use url::Url;

use crate::{
    browser::BrowserAutomation,
    captcha::CaptchaSolver,
    portal::{PortalConfig, Services},
    store::{Config, ConfigLoadError, ConfigStore, SharedConfig, UserId},
    transport::{Connector, PortalResponse, Transport},
};

pub const STUDENT_COURSES: &str = include_str!("../tests/fixtures/student_courses.html");

pub const AUTHENTICATED_HOME: &str = concat!(
    "<a href=\"https://eng.asu.edu.eg/dashboard/my_courses\">My Courses</a>\n",
    "<h3 class=\"text-white\">3.41</h3>\n",
);

pub const MY_COURSES: &str = concat!(
    "<a href=\"https://eng.asu.edu.eg/dashboard/course/1001?t=1\">CSE 111: Data Structures (Fall 2024)</a>\n",
    "<a href=\"https://eng.asu.edu.eg/dashboard/course/1002?t=1\">PHM 212: Complex Analysis (Fall 2024)</a>\n",
);

pub const COURSE_PAGE: &str = concat!(
    "<div class=\"float-left\">Midterm</div>\n",
    "<div class=\"float-right\">18 / 20</div>\n",
);

pub const LOGIN_PAGE: &str = concat!(
    "<meta name=\"csrf-token\" content=\"csrf-token\">\n",
    "<form method=\"POST\">\n",
    "<input type=\"email\" name=\"email\">\n",
    "<input type=\"password\" name=\"password\">\n",
    "<button type=\"submit\">Login</button>\n",
    "</form>\n",
);

#[derive(Clone)]
struct FakeResponse {
    status: StatusCode,
    body: String,
    cookies: Vec<(String, String)>,
}

#[derive(Default)]
struct TransportState {
    gets: HashMap<Url, VecDeque<FakeResponse>>,
    posts: HashMap<Url, VecDeque<FakeResponse>>,
    get_counts: HashMap<Url, usize>,
    forms: Vec<Vec<(String, String)>>,
    cookies: HashMap<String, String>,
}

/// Serves canned responses per URL. Queued responses are served in order and
/// the last one keeps being served. An unknown URL is a transport error.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<TransportState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &Url, body: &str) {
        self.respond_status(url, StatusCode::OK, body);
    }

    pub fn respond_status(&self, url: &Url, status: StatusCode, body: &str) {
        let response = FakeResponse {
            status,
            body: body.to_owned(),
            cookies: vec![],
        };
        let mut state = self.state.lock().unwrap();
        state.gets.entry(url.clone()).or_default().push_back(response);
    }

    pub fn respond_post(&self, url: &Url, body: &str, cookies: &[(&str, &str)]) {
        let response = FakeResponse {
            status: StatusCode::OK,
            body: body.to_owned(),
            cookies: cookies
                .iter()
                .map(|&(n, v)| (n.to_owned(), v.to_owned()))
                .collect(),
        };
        let mut state = self.state.lock().unwrap();
        state.posts.entry(url.clone()).or_default().push_back(response);
    }

    /// Drops the responses queued for `url`.
    pub fn forget(&self, url: &Url) {
        self.state.lock().unwrap().gets.remove(url);
    }

    pub fn get_count(&self, url: &Url) -> usize {
        let state = self.state.lock().unwrap();
        state.get_counts.get(url).copied().unwrap_or(0)
    }

    pub fn total_gets(&self) -> usize {
        self.state.lock().unwrap().get_counts.values().sum()
    }

    pub fn total_posts(&self) -> usize {
        self.state.lock().unwrap().forms.len()
    }

    pub fn last_form(&self) -> Option<Vec<(String, String)>> {
        self.state.lock().unwrap().forms.last().cloned()
    }

    pub fn cookie_value(&self, url: &Url, name: &str) -> Option<String> {
        self.cookie(url, name)
    }

    fn next(queue: Option<&mut VecDeque<FakeResponse>>, url: &Url) -> anyhow::Result<FakeResponse> {
        let queue = queue.ok_or_else(|| anyhow!("No route to {url}"))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| anyhow!("No route to {url}"))
    }

    fn serve(state: &mut TransportState, url: &Url, response: FakeResponse) -> PortalResponse {
        state.cookies.extend(response.cookies);
        PortalResponse {
            status: response.status,
            url: url.clone(),
            body: response.body,
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &Url) -> anyhow::Result<PortalResponse> {
        let mut state = self.state.lock().unwrap();
        *state.get_counts.entry(url.clone()).or_default() += 1;
        let response = Self::next(state.gets.get_mut(url), url)?;
        Ok(Self::serve(&mut state, url, response))
    }

    async fn post_form(&self, url: &Url, form: &[(&str, &str)]) -> anyhow::Result<PortalResponse> {
        let mut state = self.state.lock().unwrap();
        state.forms.push(
            form.iter()
                .map(|&(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        );
        let response = Self::next(state.posts.get_mut(url), url)?;
        Ok(Self::serve(&mut state, url, response))
    }

    fn set_cookie(&self, _url: &Url, name: &str, value: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cookies.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    fn cookie(&self, _url: &Url, name: &str) -> Option<String> {
        self.state.lock().unwrap().cookies.get(name).cloned()
    }
}

/// Hands out the same transport to every session.
pub struct FakeConnector(pub Arc<FakeTransport>);

impl Connector for FakeConnector {
    fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        Ok(Arc::clone(&self.0) as Arc<dyn Transport>)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<Config>>,
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<Config, ConfigLoadError> {
        self.saved
            .lock()
            .unwrap()
            .clone()
            .ok_or(ConfigLoadError::NotFound)
    }

    fn save(&self, config: &Config) -> anyhow::Result<()> {
        *self.saved.lock().unwrap() = Some(config.clone());
        Ok(())
    }
}

#[derive(Default)]
struct BrowserState {
    login_page: String,
    result: String,
    cookies: Vec<(String, String)>,
    filled: Vec<(String, String)>,
    injected: Option<String>,
    calls: usize,
}

/// Scripted browser; clones share their state.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    state: Arc<Mutex<BrowserState>>,
}

impl FakeBrowser {
    pub fn set_login_page(&self, page: &str) {
        self.state.lock().unwrap().login_page = page.to_owned();
    }

    pub fn set_result(&self, page: &str) {
        self.state.lock().unwrap().result = page.to_owned();
    }

    pub fn set_cookies(&self, cookies: &[(&str, &str)]) {
        self.state.lock().unwrap().cookies = cookies
            .iter()
            .map(|&(n, v)| (n.to_owned(), v.to_owned()))
            .collect();
    }

    pub fn filled(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().filled.clone()
    }

    pub fn injected_token(&self) -> Option<String> {
        self.state.lock().unwrap().injected.clone()
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    fn with<R>(&self, f: impl FnOnce(&mut BrowserState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        f(&mut state)
    }
}

#[async_trait]
impl BrowserAutomation for FakeBrowser {
    async fn load_login_page(&mut self, _url: &Url) -> anyhow::Result<String> {
        Ok(self.with(|s| s.login_page.clone()))
    }

    async fn fill_field(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        self.with(|s| s.filled.push((name.to_owned(), value.to_owned())));
        Ok(())
    }

    async fn inject_captcha_token(&mut self, token: &str) -> anyhow::Result<()> {
        self.with(|s| s.injected = Some(token.to_owned()));
        Ok(())
    }

    async fn submit_and_wait(&mut self) -> anyhow::Result<String> {
        Ok(self.with(|s| s.result.clone()))
    }

    async fn cookies(&mut self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self.with(|s| s.cookies.clone()))
    }
}

pub struct FakeCaptcha;

#[async_trait]
impl CaptchaSolver for FakeCaptcha {
    async fn solve(&self, _site_key: &str, _page_url: &Url, _action: &str) -> anyhow::Result<String> {
        Ok("solved-token".into())
    }
}

pub fn shared_config() -> SharedConfig {
    SharedConfig::open(MemoryStore::default()).unwrap()
}

pub fn credentials() -> Credentials {
    Credentials::builder()
        .student_id("2100123".to_owned().into())
        .password("secret".to_owned().into())
        .build()
}

pub fn register(config: &SharedConfig, user_id: UserId) {
    config
        .update(|c| c.register(user_id, credentials()))
        .unwrap();
}

/// Services over fakes, with user 1 registered.
pub struct Fixture {
    pub services: Services,
    pub transport: Arc<FakeTransport>,
    pub browser: FakeBrowser,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        let transport = Arc::new(FakeTransport::new());
        let browser = FakeBrowser::default();
        let config = shared_config();
        register(&config, UserId(1));
        let services = Services::new(
            PortalConfig::default(),
            config,
            FakeConnector(Arc::clone(&transport)),
            browser.clone(),
            FakeCaptcha,
        );
        Self {
            services,
            transport,
            browser,
        }
    }

    pub fn portal_url(&self, path: &str) -> Url {
        self.services.portal.url(path).unwrap()
    }

    pub fn home_url(&self) -> Url {
        self.portal_url(&self.services.portal.home_path)
    }

    pub fn login_url(&self, page: &str) -> Url {
        self.portal_url(page)
    }

    pub fn student_courses_url(&self) -> Url {
        self.portal_url(&self.services.portal.student_courses_path)
    }

    pub fn my_courses_url(&self) -> Url {
        self.portal_url(&self.services.portal.my_courses_path)
    }

    pub fn course_url(&self, id: &str) -> Url {
        self.portal_url(&format!("dashboard/course/{id}"))
    }

    pub fn store_cookie(&self, user_id: UserId, cookie: &str) {
        self.services
            .config
            .update(|c| c.user_mut(user_id).unwrap().session_cookie = Some(cookie.to_owned()))
            .unwrap();
    }

    pub fn seed_course_urls(&self, user_id: UserId, semester: &str, courses: &[(&str, Url)]) {
        self.services
            .config
            .update(|c| {
                for (course, url) in courses {
                    c.courses
                        .entry(semester.to_owned())
                        .or_default()
                        .insert((*course).to_owned(), url.clone());
                }
                c.user_mut(user_id)
                    .unwrap()
                    .semesters
                    .entry(semester.to_owned())
                    .or_default()
                    .extend(courses.iter().map(|(course, _)| (*course).to_owned()));
            })
            .unwrap();
    }

    /// Serves a logged-in home page, the student courses page and the
    /// course pages of the current semester.
    pub fn serve_portal(&self) {
        self.transport.respond(&self.home_url(), AUTHENTICATED_HOME);
        self.transport
            .respond(&self.student_courses_url(), STUDENT_COURSES);
        self.transport.respond(&self.my_courses_url(), MY_COURSES);
        for id in ["1001", "1002"] {
            self.transport.respond(&self.course_url(id), COURSE_PAGE);
        }
    }
}
