//! Cache/scheduler/fallback orchestration in front of one or more
//! [`MetarFetcher`]s.
//!
//! Two operating modes: `cron` periodically refreshes a whole-cache
//! snapshot in the background (`query` is then a cache lookup), and
//! `once` fetches on demand per query, trying each configured fetcher in
//! order until one succeeds. Either mode can name the other as a
//! fallback for when its own path comes up empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::fetch::{MetarFetcher, NoaaMetarFetcher};
use super::metar::ParsedMetar;
use crate::config::MetarConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cron,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Cron,
    Once,
}

pub struct MetarManager {
    fetchers: Vec<Arc<dyn MetarFetcher>>,
    mode: Mode,
    fallback: Option<Fallback>,
    cron_time: Option<u64>,
    skip_previous_fetcher: bool,
    cache: RwLock<HashMap<String, ParsedMetar>>,
    /// Fetcher that most recently won the cron refresh, consulted by
    /// `skip_previous_fetcher` fallback so we don't retry a source the
    /// cron pass just proved can't see this station either.
    last_succeeded: RwLock<Option<&'static str>>,
    cron_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MetarManager {
    pub fn from_config(config: &MetarConfig) -> Self {
        let mode = match config.mode.as_str() {
            "cron" => Mode::Cron,
            _ => Mode::Once,
        };
        let fallback = match config.fallback.as_deref() {
            Some("cron") => Some(Fallback::Cron),
            Some("once") => Some(Fallback::Once),
            _ => None,
        };

        let mut fetchers: Vec<Arc<dyn MetarFetcher>> = Vec::new();
        let available: HashMap<&str, Arc<dyn MetarFetcher>> =
            HashMap::from([("NOAA", Arc::new(NoaaMetarFetcher::new()) as Arc<dyn MetarFetcher>)]);
        for name in &config.fetchers {
            match available.get(name.as_str()) {
                Some(fetcher) => fetchers.push(fetcher.clone()),
                None => error!("No such METAR fetcher: {}", name),
            }
        }

        Self {
            fetchers,
            mode,
            fallback,
            cron_time: config.cron_time,
            skip_previous_fetcher: config.skip_previous_fetcher,
            cache: RwLock::new(HashMap::new()),
            last_succeeded: RwLock::new(None),
            cron_task: std::sync::Mutex::new(None),
        }
    }

    pub fn is_cron(&self) -> bool {
        self.mode == Mode::Cron || self.fallback == Some(Fallback::Cron)
    }

    /// Build a manager around caller-supplied fetchers, bypassing the
    /// name-based lookup `from_config` does - used by other modules' tests
    /// that need a stubbed METAR source without a network call.
    #[cfg(test)]
    pub(crate) fn for_test(fetchers: Vec<Arc<dyn MetarFetcher>>) -> Self {
        Self {
            fetchers,
            mode: Mode::Once,
            fallback: None,
            cron_time: None,
            skip_previous_fetcher: false,
            cache: RwLock::new(HashMap::new()),
            last_succeeded: RwLock::new(None),
            cron_task: std::sync::Mutex::new(None),
        }
    }

    /// Start the periodic bulk-refresh loop. Only meaningful in cron mode
    /// (or once-mode-with-cron-fallback); calling it otherwise is a bug.
    pub fn start_cron(self: &Arc<Self>) {
        let Some(period) = self.cron_time else {
            error!("metar manager: cron requested without cron_time configured");
            return;
        };
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(period));
            loop {
                ticker.tick().await;
                manager.refresh_cache().await;
            }
        });
        *self.cron_task.lock().expect("cron task mutex poisoned") = Some(handle);
    }

    pub fn stop_cron(&self) {
        if let Some(handle) = self.cron_task.lock().expect("cron task mutex poisoned").take() {
            handle.abort();
        }
    }

    /// Try each fetcher's bulk endpoint in order; the first success wins
    /// and replaces the whole cache by pointer-swap, so readers never see
    /// a torn mix of old and new stations.
    async fn refresh_cache(&self) {
        info!("Fetching METAR");
        for fetcher in &self.fetchers {
            if !fetcher.supports_fetch_all() {
                continue;
            }
            match fetcher.fetch_all().await {
                Ok(metars) => {
                    info!("Fetched {} METARs from {}", metars.len(), fetcher.name());
                    *self.cache.write().await = metars;
                    *self.last_succeeded.write().await = Some(fetcher.name());
                    return;
                }
                Err(err) => {
                    error!("METAR fetcher {} failed: {:#}", fetcher.name(), err);
                }
            }
        }
        error!("No metar fetched");
    }

    /// Try each fetcher's single-station endpoint in order, skipping any
    /// listed in `to_skip`, until one returns a usable observation.
    async fn query_each(&self, icao: &str, to_skip: &[&str]) -> Option<ParsedMetar> {
        for fetcher in &self.fetchers {
            if !fetcher.supports_fetch() || to_skip.contains(&fetcher.name()) {
                continue;
            }
            match fetcher.fetch(icao).await {
                Ok(Some(metar)) => return Some(metar),
                Ok(None) => continue,
                Err(err) => {
                    error!("METAR fetcher {} failed for {}: {:#}", fetcher.name(), icao, err);
                }
            }
        }
        None
    }

    /// Resolve a station's current METAR, routing through cache/cron or
    /// per-query fetch depending on configured mode and fallback.
    pub async fn query(&self, icao: &str) -> Option<ParsedMetar> {
        let icao = icao.to_uppercase();
        if self.is_cron() {
            if let Some(metar) = self.cache.read().await.get(&icao).cloned() {
                return Some(metar);
            }
            match self.fallback {
                Some(Fallback::Once) => {
                    let to_skip: Vec<&str> = if self.skip_previous_fetcher {
                        self.last_succeeded.read().await.into_iter().collect()
                    } else {
                        Vec::new()
                    };
                    self.query_each(&icao, &to_skip).await
                }
                _ => None,
            }
        } else if self.fallback == Some(Fallback::Cron) {
            if let Some(metar) = self.query_each(&icao, &[]).await {
                Some(metar)
            } else {
                self.cache.read().await.get(&icao).cloned()
            }
        } else {
            self.query_each(&icao, &[]).await
        }
    }
}
