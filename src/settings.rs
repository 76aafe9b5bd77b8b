use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use http::Uri;
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

const ENV_PREFIX: &str = "SWR_PROXY";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_cleanup_interval() -> u64 {
    15 * 60
}

fn default_origin_timeout() -> u64 {
    30
}

fn default_via() -> String {
    "swr-cache-proxy".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub origin: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Size budget in bytes for the cleanup sweep; unlimited when absent.
    #[serde(default)]
    pub cache_max_size: Option<u64>,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_via")]
    pub via: String,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        if let Some(listen) = cli.listen_override() {
            builder = builder
                .set_override("listen", listen.to_string())
                .map_err(to_anyhow)?;
        }
        if let Some(origin) = &cli.origin {
            builder = builder
                .set_override("origin", origin.as_str())
                .map_err(to_anyhow)?;
        }

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }

    pub fn origin_uri(&self) -> Result<Uri> {
        let uri: Uri = self
            .origin
            .trim()
            .parse()
            .with_context(|| format!("invalid origin URL '{}'", self.origin))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            Some(other) => bail!("origin scheme must be http or https (got '{other}')"),
            None => bail!("origin URL '{}' must include http:// or https://", self.origin),
        }
        ensure!(
            uri.authority().is_some(),
            "origin URL '{}' must include a host",
            self.origin
        );
        let path_ok = uri
            .path_and_query()
            .map(|pq| pq.query().is_none() && matches!(pq.path(), "" | "/"))
            .unwrap_or(true);
        ensure!(
            path_ok,
            "origin URL '{}' must not include a path or query",
            self.origin
        );
        Ok(uri)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.origin.trim().is_empty(),
            "origin must be set (positional argument, config file or {ENV_PREFIX}__ORIGIN)"
        );
        self.origin_uri()?;
        ensure!(
            self.cleanup_interval > 0,
            "cleanup_interval must be greater than 0 seconds (got {})",
            self.cleanup_interval
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        if let Some(max_size) = self.cache_max_size {
            ensure!(
                max_size > 0,
                "cache_max_size must be greater than 0 when set (got {max_size})"
            );
        }
        ensure!(!self.via.trim().is_empty(), "via must not be empty");
        ensure!(
            http::HeaderValue::from_str(&self.via).is_ok(),
            "via '{}' is not a valid header value",
            self.via
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("swr-cache-proxy.toml"),
        PathBuf::from("/etc/swr-cache-proxy/swr-cache-proxy.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
