use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for mirrorgate.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "mirrorgate".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Limits and timings of the in-memory file cache.
///
/// All of these can be changed by a configuration reload and apply to the next lookup or
/// background load.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FileCacheConfig {
    /// How long a cached file is served before it is checked against the file system again.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Entries used more recently than this are never evicted to make room for other files.
    #[serde(with = "humantime_serde")]
    pub min_ttl: Duration,

    /// Entries unused for this long are dropped, regardless of cache pressure.
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,

    /// Files larger than this (in bytes) are never cached and are redirected to a mirror instead.
    pub max_file_size: u64,

    /// The maximum number of bytes held by the cache.
    pub max_total_size: u64,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(600),
            max_file_size: 1_000_000,
            max_total_size: 100_000_000,
        }
    }
}

/// Where and how access log lines are written.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Directory that receives the access log files.
    pub dir: PathBuf,

    /// A `strftime` template for the file name, evaluated with the local time a request completed.
    pub filename: String,

    /// Log files that received no line for this long are closed.
    #[serde(with = "humantime_serde")]
    pub close_after: Duration,

    /// How often open log files are flushed.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            filename: "access_log_%Y%m%d.log".to_owned(),
            close_after: Duration::from_secs(60),
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl AccessLogConfig {
    /// The file a line completed at `at` belongs to.
    ///
    /// A template with invalid `strftime` specifiers is used verbatim.
    pub fn file_for<Tz>(&self, at: &chrono::DateTime<Tz>) -> PathBuf
    where
        Tz: chrono::TimeZone,
        Tz::Offset: fmt::Display,
    {
        use std::fmt::Write;

        let mut name = String::new();
        if write!(name, "{}", at.format(&self.filename)).is_err() {
            name = self.filename.clone();
        }
        self.dir.join(name)
    }
}

/// Credentials required by the `/!` control endpoints.
#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("user", &self.user)
            .field("password", &"[redacted]")
            .finish()
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            user: "admin".to_owned(),
            password: "changeme".to_owned(),
        }
    }
}

/// A single destination of a [`RedirectConfig`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// The relative share of traffic. Only ratios between targets matter.
    ///
    /// `0` disables the target, negative values behave like their absolute value.
    pub weight: f64,

    /// The mirror that receives redirects. An empty string means this server.
    #[serde(default)]
    pub base_url: String,
}

/// One entry of the ordered redirect table.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RedirectConfig {
    /// Glob patterns, any of which selects this rule.
    pub patterns: Vec<String>,

    /// The weighted destinations of requests selected by this rule.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Directory that locally served files are read from.
    pub root_dir: PathBuf,

    /// Fine-tune the in-memory file cache.
    pub cache: FileCacheConfig,

    /// Access log destination.
    pub access_log: AccessLogConfig,

    /// Credentials for the control endpoints.
    pub admin: AdminConfig,

    /// The ordered redirect table. The first rule matching a path decides its destination.
    pub redirects: Vec<RedirectConfig>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:8080".to_owned()
    } else {
        "127.0.0.1:8080".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            root_dir: PathBuf::from("htdocs"),
            cache: FileCacheConfig::default(),
            access_log: AccessLogConfig::default(),
            admin: AdminConfig::default(),
            redirects: Vec::new(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The file system path that serves the raw request path `path`.
    ///
    /// Percent-escapes are decoded here, redirects keep the path as the client sent it.
    pub fn local_path(&self, path: &str) -> PathBuf {
        let path = percent_decode_str(path).decode_utf8_lossy();
        self.root_dir.join(path.trim_start_matches(['/', '\\']))
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache, FileCacheConfig::default());
        assert_eq!(cfg.cache.min_ttl, Duration::from_secs(60));
        assert_eq!(cfg.cache.max_ttl, Duration::from_secs(600));

        // Setting one value keeps the defaults of all others.
        let yaml = r#"
            cache:
              check_interval: 5s
              max_ttl: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.check_interval, Duration::from_secs(5));
        assert_eq!(cfg.cache.max_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.cache.min_ttl, Duration::from_secs(60));
        assert_eq!(cfg.cache.max_file_size, 1_000_000);
        assert_eq!(cfg.access_log, AccessLogConfig::default());
    }

    #[test]
    fn test_redirect_table() {
        let yaml = r#"
            redirects:
              - patterns: ["/tf2/sound/**/*", "/tf2/*"]
                targets:
                  - weight: 100
                    base_url: ""
                  - weight: 4
                    base_url: "http://foo.com/"
                  - weight: 0.5
                    base_url: "http://bar.com/"
              - patterns: ["/**/*"]
                targets:
                  - weight: 1
                    base_url: "http://foo.com/"
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.redirects.len(), 2);
        assert_eq!(cfg.redirects[0].patterns, ["/tf2/sound/**/*", "/tf2/*"]);
        assert_eq!(cfg.redirects[0].targets[0].base_url, "");
        assert_eq!(cfg.redirects[0].targets[2].weight, 0.5);
        assert_eq!(cfg.redirects[1].targets.len(), 1);
    }

    #[test]
    fn test_missing_base_url_is_local() {
        let yaml = r#"
            redirects:
              - patterns: ["/*"]
                targets:
                  - weight: 1
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.redirects[0].targets[0].base_url, "");
    }

    #[test]
    fn test_access_log_file() {
        let config = AccessLogConfig::default();
        let at = chrono::DateTime::parse_from_rfc3339("2011-05-04T23:59:59+09:00").unwrap();
        assert_eq!(
            config.file_for(&at),
            Path::new("logs").join("access_log_20110504.log")
        );
    }

    #[test]
    fn test_local_path() {
        let cfg = Config {
            root_dir: PathBuf::from("/srv/htdocs"),
            ..Default::default()
        };
        assert_eq!(
            cfg.local_path("/tf2/maps/a.bsp"),
            Path::new("/srv/htdocs/tf2/maps/a.bsp")
        );
        assert_eq!(
            cfg.local_path("/tf2/maps/a%20b%3F.bsp"),
            Path::new("/srv/htdocs/tf2/maps/a b?.bsp")
        );
    }

    #[test]
    fn test_admin_password_redacted() {
        let debug = format!("{:?}", AdminConfig::default());
        assert!(debug.contains("admin"));
        assert!(!debug.contains("changeme"));
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            cache:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
