//! The server context shared by all request handlers.
//!
//! [`EdgeService`] owns the redirect table, the file cache and the access log writer. The
//! background workers of the latter two run on a separate runtime dedicated to file I/O.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};

use crate::access_log::{AccessLogWriter, LogLine};
use crate::caching::FileCache;
use crate::config::Config;
use crate::redirect::RedirectTable;
use crate::serving::{self, Served};

#[derive(Debug)]
pub struct EdgeService {
    config_path: Option<PathBuf>,
    config: RwLock<Arc<Config>>,
    table: RwLock<Arc<RedirectTable>>,
    cache: FileCache,
    access_log: AccessLogWriter,
}

impl EdgeService {
    /// Compiles the redirect table and starts the background workers on `io_pool`.
    ///
    /// `config_path` is where [`reload`](Self::reload) reads the configuration from.
    pub fn create(
        config_path: Option<PathBuf>,
        config: Config,
        io_pool: &tokio::runtime::Handle,
    ) -> Result<Self> {
        let table = RedirectTable::from_config(&config)?;
        let cache = FileCache::start(config.cache, io_pool);
        let access_log = AccessLogWriter::start(&config.access_log, io_pool);

        tracing::info!(
            rules = table.rules().len(),
            root_dir = %config.root_dir.display(),
            "Edge service started"
        );

        Ok(Self {
            config_path,
            config: RwLock::new(Arc::new(config)),
            table: RwLock::new(Arc::new(table)),
            cache,
            access_log,
        })
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().unwrap().clone()
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// The redirect table currently in effect.
    pub fn table(&self) -> Arc<RedirectTable> {
        self.table.read().unwrap().clone()
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Reads the configuration file again and applies the redirect table and cache settings.
    ///
    /// Nothing is applied if the configuration cannot be loaded. The bind address, logging and
    /// metrics settings, and the timings of the access log writer only apply on restart.
    pub fn reload(&self) -> Result<()> {
        let config =
            Config::get(self.config_path.as_deref()).context("failed to reload configuration")?;
        let table = RedirectTable::from_config(&config)?;

        self.cache.configure(config.cache);
        *self.table.write().unwrap() = Arc::new(table);
        *self.config.write().unwrap() = Arc::new(config);

        tracing::info!("Configuration reloaded");
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Decides how to answer a request for `path`.
    pub async fn serve(&self, path: &str) -> Served {
        let config = self.config();
        let table = self.table();
        serving::serve(&config, &table, &self.cache, path).await
    }

    /// Queues an access log line for the file that covers `at`.
    pub fn log_access<Tz>(&self, line: &LogLine, at: &DateTime<Tz>)
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let path = self.config().access_log.file_for(at);
        self.access_log.puts(path, line.to_string());
    }

    /// Stops the background workers, writing out all queued access log lines.
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.access_log.shutdown().await;
        tracing::info!("Edge service stopped");
    }
}
