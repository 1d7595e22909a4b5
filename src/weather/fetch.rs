//! METAR fetchers: pluggable sources of weather observations.
//!
//! `MetarFetcher` is the trait a [`super::manager::MetarManager`] tries
//! in order; `NOAAMetarFetcher` is the one concrete implementation
//! shipped here, hitting the two fixed NOAA text endpoints.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, warn};

use super::metar::{parse, ParsedMetar};

#[async_trait]
pub trait MetarFetcher: Send + Sync {
    /// Name used to select this fetcher from the `metar.fetchers` config list.
    fn name(&self) -> &'static str;

    /// Whether this fetcher can serve a single-station [`Self::fetch`].
    /// A fetcher that only does bulk cycles overrides this to `false` so
    /// the manager skips straight to the next fetcher instead of calling in.
    fn supports_fetch(&self) -> bool {
        true
    }

    /// Whether this fetcher can serve [`Self::fetch_all`].
    fn supports_fetch_all(&self) -> bool {
        true
    }

    /// Fetch a single station's latest observation. `Ok(None)` means the
    /// station has no current report; an error means the fetch itself failed.
    async fn fetch(&self, icao: &str) -> Result<Option<ParsedMetar>>;

    /// Fetch every station in the current hourly cycle at once.
    async fn fetch_all(&self) -> Result<HashMap<String, ParsedMetar>>;
}

pub struct NoaaMetarFetcher {
    client: reqwest::Client,
}

impl Default for NoaaMetarFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NoaaMetarFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client builds with static config"),
        }
    }

    /// Parse a two-line observation block: an optional leading ISO
    /// datetime line (used to recover month/year), then the report body.
    fn parse_block(lines: &[&str]) -> Option<ParsedMetar> {
        if lines.is_empty() {
            return None;
        }
        let (_datetime, body) = if lines.len() >= 2 {
            let parsed_time = lines[0].replace('/', "-").parse::<DateTime<Utc>>().ok();
            (parsed_time.unwrap_or_else(Utc::now), lines[1])
        } else {
            (Utc::now(), lines[0])
        };
        Some(parse(body))
    }
}

#[async_trait]
impl MetarFetcher for NoaaMetarFetcher {
    fn name(&self) -> &'static str {
        "NOAA"
    }

    async fn fetch(&self, icao: &str) -> Result<Option<ParsedMetar>> {
        let url = format!(
            "https://tgftp.nws.noaa.gov/data/observations/metar/stations/{}.TXT",
            icao.to_uppercase()
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            debug!("NOAA station fetch for {} returned {}", icao, response.status());
            return Ok(None);
        }
        let body = response.text().await?;
        let lines: Vec<&str> = body.lines().collect();
        Ok(Self::parse_block(&lines))
    }

    async fn fetch_all(&self) -> Result<HashMap<String, ParsedMetar>> {
        let hour = Utc::now().hour();
        let url = format!(
            "https://tgftp.nws.noaa.gov/data/observations/metar/cycles/{:02}Z.TXT",
            hour
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("NOAA cycle fetch returned {}", response.status());
        }
        let body = response.text().await?;

        let mut all = HashMap::new();
        for block in body.split("\n\n") {
            let lines: Vec<&str> = block.lines().collect();
            if lines.len() < 2 {
                continue;
            }
            if let Some(metar) = Self::parse_block(&lines) {
                if let Some(station_id) = metar.station_id.clone() {
                    all.insert(station_id, metar);
                }
            }
        }
        if all.is_empty() {
            warn!("NOAA bulk fetch for {:02}Z produced no parseable stations", hour);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_with_leading_timestamp() {
        let lines = vec!["2024/06/01 12:55", "KJFK 011255Z 18010KT 10SM SCT030 18/12 A2992"];
        let metar = NoaaMetarFetcher::parse_block(&lines).unwrap();
        assert_eq!(metar.station_id.as_deref(), Some("KJFK"));
    }

    #[test]
    fn parses_block_without_timestamp() {
        let lines = vec!["KJFK 011255Z 18010KT 10SM SCT030 18/12 A2992"];
        let metar = NoaaMetarFetcher::parse_block(&lines).unwrap();
        assert_eq!(metar.station_id.as_deref(), Some("KJFK"));
    }

    #[test]
    fn empty_block_yields_none() {
        assert!(NoaaMetarFetcher::parse_block(&[]).is_none());
    }
}
