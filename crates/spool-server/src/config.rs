use crate::error::{Result, ServerError};
use spool_cache::parse_size;
use spool_relay::{RelayConfig, RemoteTarget, DEFAULT_USER_DIR_PREFIX};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CACHE_SIZE: &str = "8GiB";
const DEFAULT_DELAY_SECS: u64 = 60;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 55;
const CACHE_SUBDIR: &str = "upload-cache";

/// Service configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub max_cache_size: u64,
    pub remote: RemoteTarget,
    pub user_dir_prefix: String,
    pub reconnect_delay: Duration,
    pub idle_timeout: Duration,
    pub fail_delay: Duration,
    /// How long `GET /files/{user}/next` waits for a change
    pub poll_timeout: Duration,
}

impl Config {
    /// Parse configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Parse configuration from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = parse_var(&var, "PORT")?.unwrap_or(DEFAULT_PORT);

        let cache_dir = match non_empty(&var, "CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_cache_dir(&var)?,
        };

        let max_cache_size = non_empty(&var, "MAX_CACHE_SIZE")
            .unwrap_or_else(|| DEFAULT_MAX_CACHE_SIZE.to_string());
        let max_cache_size = parse_size(&max_cache_size)
            .map_err(|e| ServerError::Config(format!("MAX_CACHE_SIZE: {}", e)))?;

        let remote_url = non_empty(&var, "REMOTE_URL").ok_or_else(|| {
            ServerError::Config("REMOTE_URL environment variable is required".to_string())
        })?;
        let remote = RemoteTarget::parse(&remote_url)
            .map_err(|e| ServerError::Config(format!("REMOTE_URL: {}", e)))?;

        let user_dir_prefix = non_empty(&var, "USER_DIR_PREFIX")
            .unwrap_or_else(|| DEFAULT_USER_DIR_PREFIX.to_string());

        Ok(Self {
            port,
            cache_dir,
            max_cache_size,
            remote,
            user_dir_prefix,
            reconnect_delay: secs(&var, "RECONNECT_DELAY_SECS", DEFAULT_DELAY_SECS)?,
            idle_timeout: secs(&var, "IDLE_TIMEOUT_SECS", DEFAULT_DELAY_SECS)?,
            fail_delay: secs(&var, "UPLOAD_FAIL_DELAY_SECS", DEFAULT_DELAY_SECS)?,
            poll_timeout: secs(&var, "POLL_TIMEOUT_SECS", DEFAULT_POLL_TIMEOUT_SECS)?,
        })
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            remote_dir: self.remote.remote_dir.clone(),
            user_dir_prefix: self.user_dir_prefix.clone(),
            reconnect_delay: self.reconnect_delay,
            idle_timeout: self.idle_timeout,
            fail_delay: self.fail_delay,
        }
    }
}

/// `$XDG_CACHE_HOME/upload-cache`, falling back to `$HOME/.cache`
fn default_cache_dir(var: &impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(xdg) = non_empty(var, "XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg).join(CACHE_SUBDIR));
    }
    match non_empty(var, "HOME") {
        Some(home) => Ok(PathBuf::from(home).join(".cache").join(CACHE_SUBDIR)),
        None => Err(ServerError::Config(
            "CACHE_DIR, XDG_CACHE_HOME or HOME must be set".to_string(),
        )),
    }
}

fn non_empty(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    var(name).filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match non_empty(var, name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ServerError::Config(format!("{}: invalid value {:?}", name, value))),
        None => Ok(None),
    }
}

fn secs(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_var(var, name)?.unwrap_or(default)))
}
