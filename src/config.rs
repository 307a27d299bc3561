// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Process-wide configuration, built with the donor's chained-setter style.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables recognized by the CLI/HTTP adapter (§6 EXTERNAL INTERFACES).
///
/// Every field has a sensible default; call the `with_*` setters to
/// override just the ones that matter for a given deployment.
#[derive(Debug, Clone)]
pub struct Config {
    data_dir: PathBuf,
    log_dir: PathBuf,
    lock_dir: PathBuf,
    shutdown_timeout: Duration,
    max_connections: usize,
    worker_threads: usize,
    search_timeout: Duration,
    apply_interval: Duration,
    auto_save: bool,
    save_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./log"),
            lock_dir: PathBuf::from("./lock"),
            shutdown_timeout: Duration::from_secs(30),
            max_connections: 100,
            worker_threads: num_cpus::get(),
            search_timeout: Duration::from_secs(10),
            apply_interval: Duration::from_secs(60),
            auto_save: true,
            save_concurrency: 4,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    #[must_use]
    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_apply_interval(mut self, interval: Duration) -> Self {
        self.apply_interval = interval;
        self
    }

    #[must_use]
    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }

    #[must_use]
    pub fn with_save_concurrency(mut self, concurrency: usize) -> Self {
        self.save_concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    #[must_use]
    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }

    #[must_use]
    pub fn lock_dir(&self) -> &std::path::Path {
        &self.lock_dir
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    #[must_use]
    pub fn search_timeout(&self) -> Duration {
        self.search_timeout
    }

    #[must_use]
    pub fn apply_interval(&self) -> Duration {
        self.apply_interval
    }

    #[must_use]
    pub fn auto_save(&self) -> bool {
        self.auto_save
    }

    #[must_use]
    pub fn save_concurrency(&self) -> usize {
        self.save_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_overrides() {
        let config = Config::new();
        assert!(config.max_connections() > 0);
        assert!(config.worker_threads() > 0);
    }

    #[test]
    fn chained_setters_override_defaults() {
        let config = Config::new()
            .with_data_dir("/tmp/annforest-data")
            .with_max_connections(8)
            .with_apply_interval(Duration::from_secs(5));

        assert_eq!(config.data_dir(), std::path::Path::new("/tmp/annforest-data"));
        assert_eq!(config.max_connections(), 8);
        assert_eq!(config.apply_interval(), Duration::from_secs(5));
    }
}
