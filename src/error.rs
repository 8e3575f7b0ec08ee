use url::Url;

/// Failures of the portal interaction that the caller needs to tell apart.
///
/// Everything else travels as a plain `anyhow::Error`; the cycle boundary
/// recovers these by downcasting.
#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("Failed to fetch page after {attempts} attempts. Last error: {last_error}")]
    TransientNetwork {
        url: Url,
        attempts: u32,
        last_error: String,
    },
    #[error("Incorrect Student ID or Password.")]
    InvalidCredentials,
    #[error(
        "Unable to fetch grades: A mandatory questionnaire must be completed first. \
         Please visit the faculty website to fill it out and try again."
    )]
    QuestionnaireRequired,
    #[error("The login page asked for a CAPTCHA")]
    CaptchaAssistRequired,
    #[error("Login failed: {reason}")]
    LoginFailed { reason: String },
    #[error("No grade markup found for {course} at {url}")]
    PortalMarkupMismatch { course: String, url: Url },
}

impl PortalError {
    /// Errors the user has to fix on their side.
    /// They are reported once and never shorten the polling interval.
    pub fn is_user_actionable(&self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::QuestionnaireRequired)
    }

    /// Looks through an `anyhow` chain for a user-actionable portal error.
    pub fn user_actionable(error: &anyhow::Error) -> Option<&PortalError> {
        error
            .chain()
            .filter_map(|e| e.downcast_ref::<PortalError>())
            .find(|e| e.is_user_actionable())
    }
}
