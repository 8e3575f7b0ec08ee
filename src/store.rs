use std::{
    collections::{BTreeMap, BTreeSet},
    io::{BufReader, ErrorKind},
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use anyhow::{ensure, Context};
use derive_more::{Display, From, FromStr};
use grade_monitor_utils::{credentials::Credentials, fs_json_util::write_json_pretty};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use url::Url;

/// Chat platform user (a Discord snowflake).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From, FromStr)]
pub struct UserId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervals {
    pub normal_minutes: u64,
    pub after_failure_minutes: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            normal_minutes: 60,
            after_failure_minutes: 1,
        }
    }
}

impl Intervals {
    pub fn validated(normal_minutes: u64, after_failure_minutes: u64) -> anyhow::Result<Self> {
        ensure!(
            normal_minutes >= 5,
            "The refresh interval must be at least 5 minutes."
        );
        ensure!(
            after_failure_minutes >= 1,
            "The interval after errors must be at least 1 minute."
        );
        Ok(Self {
            normal_minutes,
            after_failure_minutes,
        })
    }

    pub fn normal(&self) -> Duration {
        Duration::from_secs(self.normal_minutes * 60)
    }

    pub fn after_failure(&self) -> Duration {
        Duration::from_secs(self.after_failure_minutes * 60)
    }
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    #[serde_as(as = "DisplayFromStr")]
    pub user_id: UserId,
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xsrf_token: Option<String>,
    /// Semester name to the names of the courses known in it.
    #[serde(default)]
    pub semesters: BTreeMap<String, BTreeSet<String>>,
}

impl UserAccount {
    pub fn new(user_id: UserId, credentials: Credentials) -> Self {
        Self {
            user_id,
            credentials,
            session_cookie: None,
            xsrf_token: None,
            semesters: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub users: Vec<UserAccount>,
    /// Semester name to course name to course page, shared by all users.
    #[serde(default)]
    pub courses: BTreeMap<String, BTreeMap<String, Url>>,
    #[serde(default)]
    pub intervals: Intervals,
}

impl Config {
    pub fn user(&self, user_id: UserId) -> Option<&UserAccount> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn user_mut(&mut self, user_id: UserId) -> Option<&mut UserAccount> {
        self.users.iter_mut().find(|u| u.user_id == user_id)
    }

    /// Creates the account, or replaces its credentials and forgets its
    /// courses so that they are discovered again.
    pub fn register(&mut self, user_id: UserId, credentials: Credentials) {
        match self.user_mut(user_id) {
            Some(account) => {
                account.credentials = credentials;
                account.semesters.clear();
            }
            None => self.users.push(UserAccount::new(user_id, credentials)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("The config store was not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistence of [`Config`]. Saved after every mutation.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config, ConfigLoadError>;
    fn save(&self, config: &Config) -> anyhow::Result<()>;
}

pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<Config, ConfigLoadError> {
        let file = match fs_err::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ConfigLoadError::NotFound),
            Err(e) => return Err(anyhow::Error::from(e).into()),
        };
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("While trying to parse {:?} as a config", self.path))?;
        Ok(config)
    }

    fn save(&self, config: &Config) -> anyhow::Result<()> {
        write_json_pretty(&self.path, config)
    }
}

/// In-memory [`Config`] written through to its store on every update.
pub struct SharedConfig {
    store: Box<dyn ConfigStore>,
    config: Mutex<Config>,
}

impl SharedConfig {
    pub fn open(store: impl ConfigStore + 'static) -> anyhow::Result<Self> {
        let config = match store.load() {
            Ok(config) => config,
            Err(ConfigLoadError::NotFound) => {
                warn!("Config store was not found.  Starting with an empty one.");
                Config::default()
            }
            Err(ConfigLoadError::Other(e)) => return Err(e),
        };
        Ok(Self {
            store: Box::new(store),
            config: Mutex::new(config),
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        f(&self.config.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Config) -> R) -> anyhow::Result<R> {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        let ret = f(&mut config);
        self.store.save(&config).context("Failed to save the config")?;
        Ok(ret)
    }

    pub fn user(&self, user_id: UserId) -> Option<UserAccount> {
        self.read(|config| config.user(user_id).cloned())
    }

    pub fn intervals(&self) -> Intervals {
        self.read(|config| config.intervals)
    }
}
