use crate::backup::filter::{should_include, NamePattern};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::validate::{validate_backup_root, validate_server_names};
use bon::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// Immutable snapshot of everything a run needs, shared read-only by every job.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct BackupSettings {
    #[validate(nested)]
    #[getset(get = "pub")]
    credentials: Option<Credentials>,
    #[validate(custom(function = validate_server_names))]
    #[builder(into)]
    #[getset(get = "pub")]
    servers: Vec<String>,
    #[validate(custom(function = validate_backup_root))]
    #[builder(into)]
    #[getset(get = "pub")]
    backup_root: PathBuf,
    #[serde(default)]
    #[builder(default, into)]
    #[getset(get = "pub")]
    include: Vec<NamePattern>,
    #[serde(default)]
    #[builder(default, into)]
    #[getset(get = "pub")]
    exclude: Vec<NamePattern>,
    #[serde(default = "default_max_concurrency")]
    #[builder(default = DEFAULT_MAX_CONCURRENCY)]
    #[validate(range(min = 1, message = "max_concurrency must be a positive integer"))]
    #[getset(get_copy = "pub")]
    max_concurrency: usize,
}

impl BackupSettings {
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, Self>(f).map_err(Error::from))
            .add_msg(format!("Parse YAML settings failed: {:?}", path))
    }

    /// Include filter first, then exclude.
    pub fn should_back_up(&self, database: &str) -> bool {
        should_include(database, &self.include, &self.exclude)
    }
}

/// Logon credentials for the optional alternate identity.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct Credentials {
    #[builder(into)]
    domain: Option<String>,
    #[validate(length(min = 1, message = "username must not be empty"))]
    #[builder(into)]
    username: String,
    #[builder(into)]
    password: RedactedString,
}

impl Credentials {
    /// Splits `DOMAIN\user` on its first backslash; a plain `user` has no domain.
    pub fn from_qualified_user<P: Into<RedactedString>>(user: &str, password: P) -> Self {
        let (domain, username) = match user.split_once('\\') {
            Some((domain, username)) if !domain.is_empty() => (Some(domain), username),
            _ => (None, user),
        };
        Self::builder()
            .maybe_domain(domain)
            .username(username)
            .password(password)
            .build()
    }

    pub fn principal(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{domain}\\{}", self.username),
            None => self.username.clone(),
        }
    }
}
