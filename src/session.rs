use std::fmt;

use anyhow::{bail, Context};
use grade_monitor_utils::credentials::Credentials;
use log::{debug, info};

use crate::{
    error::PortalError,
    extractor::StudentData,
    fetcher::Fetcher,
    markup::{LoginVariant, MarkupConfig},
    portal::Services,
    store::{UserAccount, UserId},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginState {
    Unauthenticated,
    Authenticated,
    Failed(String),
}

/// What the user picked in the controls of the last report.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Selection {
    pub semester: Option<String>,
    pub final_grades_only: Option<bool>,
}

/// Runtime state of one user: an authenticated cookie jar and the current
/// selection. Never persisted.
pub struct Session {
    user_id: UserId,
    fetcher: Fetcher,
    state: LoginState,
    requested_semester: Option<String>,
    final_grades_only: Option<bool>,
    cgpa: Option<String>,
    failures: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("state", &self.state)
            .field("requested_semester", &self.requested_semester)
            .field("final_grades_only", &self.final_grades_only)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(user_id: UserId, services: &Services) -> anyhow::Result<Self> {
        let transport = services.connector.connect()?;
        Ok(Self {
            user_id,
            fetcher: Fetcher::new(user_id, transport, services.portal.retry),
            state: LoginState::Unauthenticated,
            requested_semester: None,
            final_grades_only: None,
            cgpa: None,
            failures: 0,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn state(&self) -> &LoginState {
        &self.state
    }

    pub fn cgpa(&self) -> Option<&str> {
        self.cgpa.as_deref()
    }

    pub fn requested_semester(&self) -> Option<&str> {
        self.requested_semester.as_deref()
    }

    pub fn final_grades_only(&self) -> Option<bool> {
        self.final_grades_only
    }

    /// Consecutive failed cycles since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn select_semester(&mut self, semester: String) {
        self.requested_semester = Some(semester);
    }

    pub fn select_final_grades_only(&mut self, final_grades_only: bool) {
        self.final_grades_only = Some(final_grades_only);
    }

    /// Fixes the semester and mode of this cycle.
    ///
    /// An explicit choice wins over the one remembered by the last report,
    /// which wins over the current semester in detailed mode. A semester the
    /// student does not have falls back to the current one.
    pub fn resolve_selection(&mut self, student: &StudentData, remembered: &Selection) -> (String, bool) {
        let semester = [self.requested_semester.as_ref(), remembered.semester.as_ref()]
            .into_iter()
            .flatten()
            .find(|s| student.semesters.contains(*s))
            .unwrap_or(&student.current_semester)
            .clone();
        let final_grades_only = self
            .final_grades_only
            .or(remembered.final_grades_only)
            .unwrap_or(false);
        self.requested_semester = Some(semester.clone());
        self.final_grades_only = Some(final_grades_only);
        (semester, final_grades_only)
    }

    pub async fn login(&mut self, services: &Services) -> anyhow::Result<()> {
        match self.try_login(services).await {
            Ok(()) => {
                self.state = LoginState::Authenticated;
                Ok(())
            }
            Err(e) => {
                self.state = LoginState::Failed(format!("{e:#}"));
                Err(e)
            }
        }
    }

    async fn try_login(&mut self, services: &Services) -> anyhow::Result<()> {
        let portal = &services.portal;
        let markup = &portal.markup;
        let account = services
            .config
            .user(self.user_id)
            .with_context(|| format!("{} is not registered", self.user_id))?;

        self.seed_cookies(services, &account)?;
        let home = self.fetcher.fetch(&portal.url(&portal.home_path)?).await?;
        let (page, browser_xsrf) = if markup.is_authenticated(&home) {
            info!("{}: Stored session is still valid.  Reusing cookies.", self.user_id);
            (home, None)
        } else if markup.questionnaire.matches(&home) {
            return Err(PortalError::QuestionnaireRequired.into());
        } else {
            info!("{}: Not logged in yet.  Trying to log in.", self.user_id);
            let variant = markup.login_variant(&home);
            self.login_with_credentials(services, &account.credentials, variant)
                .await?
        };

        self.cgpa = markup.cgpa(&page).map(str::to_owned);
        self.persist_cookies(services, browser_xsrf)?;
        info!("{}: Logged in.", self.user_id);
        Ok(())
    }

    fn seed_cookies(&self, services: &Services, account: &UserAccount) -> anyhow::Result<()> {
        let portal = &services.portal;
        let transport = self.fetcher.transport();
        if let Some(cookie) = &account.session_cookie {
            for name in &portal.session_cookie_names {
                transport.set_cookie(&portal.base_url, name, cookie)?;
            }
            if let Some(token) = &account.xsrf_token {
                transport.set_cookie(&portal.base_url, &portal.xsrf_cookie_name, token)?;
            }
        }
        Ok(())
    }

    /// Returns the authenticated page and, after a browser login, the XSRF
    /// token the browser received.
    async fn login_with_credentials(
        &self,
        services: &Services,
        credentials: &Credentials,
        variant: LoginVariant,
    ) -> anyhow::Result<(String, Option<String>)> {
        let portal = &services.portal;
        let markup = &portal.markup;
        let login_url = portal.url(variant.page())?;
        let email = credentials.student_id.email(&portal.email_domain);

        let login_page = self.fetcher.fetch(&login_url).await?;
        let token = markup.csrf_token(&login_page).unwrap_or_default();
        let response = self
            .fetcher
            .transport()
            .post_form(
                &login_url,
                &[
                    (variant.email_field(), email.as_str()),
                    (variant.password_field(), credentials.password.expose()),
                    ("_token", token),
                ],
            )
            .await
            .context("Submitting the login form")?;
        debug!("{}: Login form answered {}", self.user_id, response.status);
        if !response.status.is_success() {
            bail!(PortalError::LoginFailed {
                reason: format!("the server responded with {}", response.status),
            });
        }
        if markup.is_authenticated(&response.body) {
            return Ok((response.body, None));
        }
        match rejection(markup, &response.body) {
            PortalError::CaptchaAssistRequired => {
                info!("{}: CAPTCHA detected.  Logging in with the browser.", self.user_id);
                self.login_with_browser(services, credentials, variant)
                    .await
            }
            e => Err(e.into()),
        }
    }

    async fn login_with_browser(
        &self,
        services: &Services,
        credentials: &Credentials,
        variant: LoginVariant,
    ) -> anyhow::Result<(String, Option<String>)> {
        let portal = &services.portal;
        let markup = &portal.markup;
        let login_url = portal.url(variant.page())?;

        let mut browser = services.browser.lock().await;
        let page = browser.load_login_page(&login_url).await?;
        browser
            .fill_field(
                variant.email_field(),
                &credentials.student_id.email(&portal.email_domain),
            )
            .await?;
        browser
            .fill_field(variant.password_field(), credentials.password.expose())
            .await?;
        if markup.captcha.matches(&page) {
            let token = services
                .captcha
                .solve(&portal.recaptcha_site_key, &login_url, &portal.recaptcha_action)
                .await
                .context("Solving the CAPTCHA")?;
            browser.inject_captcha_token(&token).await?;
        }
        let body = browser.submit_and_wait().await?;

        if !markup.is_authenticated(&body) {
            if markup.questionnaire.matches(&body) {
                return Err(PortalError::QuestionnaireRequired.into());
            }
            return Err(PortalError::LoginFailed {
                reason: "CAPTCHA might be invalid or credentials are incorrect".into(),
            }
            .into());
        }

        let transport = self.fetcher.transport();
        let mut xsrf = None;
        for (name, value) in browser.cookies().await? {
            if name == portal.xsrf_cookie_name {
                xsrf = Some(value);
            } else {
                transport.set_cookie(&portal.base_url, &name, &value)?;
            }
        }
        Ok((body, xsrf))
    }

    fn persist_cookies(&self, services: &Services, xsrf: Option<String>) -> anyhow::Result<()> {
        let portal = &services.portal;
        let transport = self.fetcher.transport();
        let session_cookie = portal
            .session_cookie_names
            .iter()
            .find_map(|name| transport.cookie(&portal.base_url, name));
        let xsrf = xsrf.or_else(|| transport.cookie(&portal.base_url, &portal.xsrf_cookie_name));
        let Some(account) = services.config.user(self.user_id) else {
            return Ok(());
        };
        let session_cookie = session_cookie.or(account.session_cookie.clone());
        let xsrf = xsrf.or(account.xsrf_token.clone());
        if account.session_cookie == session_cookie && account.xsrf_token == xsrf {
            return Ok(());
        }
        services.config.update(|config| {
            if let Some(account) = config.user_mut(self.user_id) {
                account.session_cookie = session_cookie;
                account.xsrf_token = xsrf;
            }
        })
    }
}

/// Why the portal sent the login form back.
fn rejection(markup: &MarkupConfig, page: &str) -> PortalError {
    if markup.questionnaire.matches(page) {
        PortalError::QuestionnaireRequired
    } else if markup.captcha.matches(page) {
        PortalError::CaptchaAssistRequired
    } else if markup.login_failed.matches(page) {
        PortalError::InvalidCredentials
    } else {
        PortalError::LoginFailed {
            reason: "the portal returned an unexpected page".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{rejection, LoginState, Selection, Session};
    use crate::{
        error::PortalError,
        extractor::StudentData,
        markup::MarkupConfig,
        store::UserId,
        testing::{Fixture, AUTHENTICATED_HOME, LOGIN_PAGE},
    };

    #[test]
    fn rejection_reasons() {
        let markup = MarkupConfig::default();
        assert!(matches!(
            rejection(&markup, "<div class=\"alert alert-danger\">These credentials do not match</div>"),
            PortalError::InvalidCredentials
        ));
        assert!(matches!(
            rejection(&markup, "<div class=\"alert alert-danger\"></div><div class=\"g-recaptcha\" data-recaptcha>"),
            PortalError::CaptchaAssistRequired
        ));
        assert!(matches!(
            rejection(&markup, "Please answer the questionnaire"),
            PortalError::QuestionnaireRequired
        ));
        assert!(matches!(
            rejection(&markup, "<h1>500</h1>"),
            PortalError::LoginFailed { .. }
        ));
    }

    #[tokio::test]
    async fn stored_cookie_is_reused_without_posting() {
        let fixture = Fixture::new();
        fixture.store_cookie(UserId(1), "stored");
        fixture.transport.respond(&fixture.home_url(), AUTHENTICATED_HOME);

        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        session.login(&fixture.services).await.unwrap();
        session.login(&fixture.services).await.unwrap();

        assert_eq!(fixture.transport.total_posts(), 0);
        assert_eq!(session.state(), &LoginState::Authenticated);
        assert_eq!(session.cgpa(), Some("3.41"));
        assert_eq!(
            fixture.transport.cookie_value(&fixture.home_url(), "asueng_web").as_deref(),
            Some("stored")
        );
    }

    #[tokio::test]
    async fn logs_in_once_then_reuses_the_session() {
        let fixture = Fixture::new();
        fixture.transport.respond(&fixture.home_url(), LOGIN_PAGE);
        fixture.transport.respond(&fixture.home_url(), AUTHENTICATED_HOME);
        fixture.transport.respond(&fixture.login_url("login"), LOGIN_PAGE);
        fixture.transport.respond_post(
            &fixture.login_url("login"),
            AUTHENTICATED_HOME,
            &[("laravel_session", "fresh"), ("XSRF-TOKEN", "xsrf")],
        );

        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        session.login(&fixture.services).await.unwrap();
        session.login(&fixture.services).await.unwrap();

        assert_eq!(fixture.transport.total_posts(), 1);
        let form = fixture.transport.last_form().unwrap();
        assert!(form.contains(&("email".to_owned(), "2100123@eng.asu.edu.eg".to_owned())));
        assert!(form.contains(&("_token".to_owned(), "csrf-token".to_owned())));

        let account = fixture.services.config.user(UserId(1)).unwrap();
        assert_eq!(account.session_cookie.as_deref(), Some("fresh"));
        assert_eq!(account.xsrf_token.as_deref(), Some("xsrf"));
    }

    #[tokio::test]
    async fn alternate_field_names() {
        let fixture = Fixture::new();
        let alternate = LOGIN_PAGE.replace("name=\"email\"", "name=\"email1\"");
        fixture.transport.respond(&fixture.home_url(), &alternate);
        fixture.transport.respond(&fixture.login_url("log1n"), &alternate);
        fixture
            .transport
            .respond_post(&fixture.login_url("log1n"), AUTHENTICATED_HOME, &[]);

        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        session.login(&fixture.services).await.unwrap();
        let form = fixture.transport.last_form().unwrap();
        assert!(form.iter().any(|(k, _)| k == "email1"));
        assert!(form.iter().any(|(k, _)| k == "password1"));
    }

    #[tokio::test]
    async fn wrong_password() {
        let fixture = Fixture::new();
        fixture.transport.respond(&fixture.home_url(), LOGIN_PAGE);
        fixture.transport.respond(&fixture.login_url("login"), LOGIN_PAGE);
        fixture.transport.respond_post(
            &fixture.login_url("login"),
            &format!("{LOGIN_PAGE}<div class=\"alert alert-danger\">Invalid</div>"),
            &[],
        );

        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        let error = session.login(&fixture.services).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<PortalError>(),
            Some(PortalError::InvalidCredentials)
        ));
        assert!(matches!(session.state(), LoginState::Failed(_)));
        assert_eq!(fixture.browser.calls(), 0);
    }

    #[tokio::test]
    async fn questionnaire_on_the_home_page() {
        let fixture = Fixture::new();
        fixture.store_cookie(UserId(1), "stored");
        fixture
            .transport
            .respond(&fixture.home_url(), "<h2>Course Evaluation QUESTIONNAIRE</h2>");

        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        let error = session.login(&fixture.services).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<PortalError>(),
            Some(PortalError::QuestionnaireRequired)
        ));
        assert_eq!(fixture.transport.total_posts(), 0);
    }

    #[tokio::test]
    async fn captcha_goes_through_the_browser() {
        let fixture = Fixture::new();
        let captcha_page = format!("{LOGIN_PAGE}<div class=\"g-recaptcha\"></div><script src=\"recaptcha/api.js\"></script>");
        fixture.transport.respond(&fixture.home_url(), LOGIN_PAGE);
        fixture.transport.respond(&fixture.login_url("login"), LOGIN_PAGE);
        fixture
            .transport
            .respond_post(&fixture.login_url("login"), &captcha_page, &[]);
        fixture.browser.set_login_page(&captcha_page);
        fixture.browser.set_result(AUTHENTICATED_HOME);
        fixture.browser.set_cookies(&[("laravel_session", "from-browser"), ("XSRF-TOKEN", "browser-xsrf")]);

        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        session.login(&fixture.services).await.unwrap();

        assert_eq!(fixture.browser.injected_token().as_deref(), Some("solved-token"));
        assert_eq!(
            fixture.browser.filled(),
            [
                ("email".to_owned(), "2100123@eng.asu.edu.eg".to_owned()),
                ("password".to_owned(), "secret".to_owned())
            ]
        );
        let account = fixture.services.config.user(UserId(1)).unwrap();
        assert_eq!(account.session_cookie.as_deref(), Some("from-browser"));
        assert_eq!(account.xsrf_token.as_deref(), Some("browser-xsrf"));
        assert_eq!(
            fixture.transport.cookie_value(&fixture.home_url(), "XSRF-TOKEN"),
            None
        );
    }

    #[tokio::test]
    async fn browser_login_that_still_fails() {
        let fixture = Fixture::new();
        let captcha_page = format!("{LOGIN_PAGE}<script src=\"recaptcha/api.js\"></script>");
        fixture.transport.respond(&fixture.home_url(), LOGIN_PAGE);
        fixture.transport.respond(&fixture.login_url("login"), LOGIN_PAGE);
        fixture
            .transport
            .respond_post(&fixture.login_url("login"), &captcha_page, &[]);
        fixture.browser.set_login_page(&captcha_page);
        fixture.browser.set_result(&captcha_page);

        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        let error = session.login(&fixture.services).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<PortalError>(),
            Some(PortalError::LoginFailed { .. })
        ));
    }

    #[test]
    fn selection_precedence() {
        let fixture = Fixture::new();
        let student = StudentData {
            student_courses: String::new(),
            current_semester: "Fall 2024".into(),
            semesters: BTreeSet::from(["Spring 2024".into(), "Fall 2024".into()]),
        };
        let mut session = Session::new(UserId(1), &fixture.services).unwrap();

        let remembered = Selection {
            semester: Some("Spring 2024".into()),
            final_grades_only: Some(true),
        };
        assert_eq!(
            session.resolve_selection(&student, &remembered),
            ("Spring 2024".to_owned(), true)
        );

        session.select_semester("Spring 2019".into());
        session.select_final_grades_only(false);
        assert_eq!(
            session.resolve_selection(&student, &Selection::default()),
            ("Fall 2024".to_owned(), false)
        );
        assert_eq!(session.requested_semester(), Some("Fall 2024"));
    }

    #[test]
    fn failures_reset_on_success() {
        let fixture = Fixture::new();
        let mut session = Session::new(UserId(1), &fixture.services).unwrap();
        assert_eq!(session.record_failure(), 1);
        assert_eq!(session.record_failure(), 2);
        session.record_success();
        assert_eq!(session.failures(), 0);
        assert_eq!(session.record_failure(), 1);
    }
}
