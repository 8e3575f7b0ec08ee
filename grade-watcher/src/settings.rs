use std::path::PathBuf;

use grade_monitor::{browser::BrowserSettings, captcha::CaptchaSettings, portal::PortalConfig};
use serde::Deserialize;
use url::Url;

fn default_discord_api() -> Url {
    Url::parse("https://discord.com/api/v10/").expect("Valid URL literal")
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub port: u16,
    /// Path of the endpoint receiving `user_id` and `text` form posts.
    pub command_endpoint: String,
    pub bot_token: String,
    #[serde(default = "default_discord_api")]
    pub discord_api: Url,
    /// The JSON file holding users, course pages and intervals.
    pub config_path: PathBuf,
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub browser: BrowserSettings,
    pub captcha: CaptchaSettings,
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn minimal_settings() {
        let settings: Settings = toml::from_str(
            r#"
            port = 8080
            command_endpoint = "/grades"
            bot_token = "token"
            config_path = "ignore/grade-monitor.json"

            [captcha]
            api_key = "key"
            "#,
        )
        .unwrap();
        assert_eq!(settings.discord_api.as_str(), "https://discord.com/api/v10/");
        assert_eq!(settings.portal.email_domain, "eng.asu.edu.eg");
        assert!(settings.browser.headless);
        assert_eq!(settings.captcha.max_attempts, 5);
    }

    #[test]
    fn overrides_and_typos() {
        let settings: Settings = toml::from_str(
            r#"
            port = 8080
            command_endpoint = "/grades"
            bot_token = "token"
            config_path = "config.json"
            captcha = { api_key = "key" }

            [portal]
            base_url = "https://portal.example.edu/"

            [portal.retry]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(settings.portal.retry.max_attempts, 3);
        assert_eq!(settings.portal.retry.base_delay_ms, 3000);
        assert_eq!(settings.portal.base_url.as_str(), "https://portal.example.edu/");

        let typo = toml::from_str::<Settings>(
            r#"
            port = 8080
            command_endpoint = "/grades"
            bot_token = "token"
            config_path = "config.json"
            captcha = { api_key = "key" }
            interval = 5
            "#,
        );
        assert!(typo.is_err());
    }
}
