//! Day-ahead electricity prices
//!
//! Prices come from elprisetjustnu.se, one JSON document per day and bidding
//! area. The service has used several date layouts in its paths, so each day
//! is tried against four variants until one is found.

use crate::config::PricesConfig;
use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Entry as served by the price service
#[derive(Debug, Clone, Deserialize)]
struct RawPrice {
    time_start: DateTime<FixedOffset>,
    #[serde(default)]
    time_end: Option<DateTime<FixedOffset>>,
    #[serde(rename = "SEK_per_kWh")]
    sek_per_kwh: f64,
}

/// One interval of the price curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub time_start: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<DateTime<FixedOffset>>,
    #[serde(alias = "SEK_per_kWh")]
    pub price_per_kwh: f64,
    /// Day the interval was requested for
    pub date: NaiveDate,
}

impl PricePoint {
    /// End of the interval; one hour after the start when not given
    pub fn end(&self) -> DateTime<FixedOffset> {
        self.time_end
            .unwrap_or(self.time_start + TimeDelta::hours(1))
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let start = self.time_start.with_timezone(&Utc);
        let end = self.end().with_timezone(&Utc);
        start <= instant && instant < end
    }
}

/// Path variants tried for one day, in order
pub fn date_variants(date: NaiveDate, area: &str) -> [String; 4] {
    let (y, m, d) = (date.year(), date.month(), date.day());
    [
        format!("{}/{:02}-{:02}_{}.json", y, m, d, area),
        format!("{}-{:02}-{:02}_{}.json", y, m, d, area),
        format!("{}/{}-{}_{}.json", y, m, d, area),
        format!("{}-{}-{}_{}.json", y, m, d, area),
    ]
}

/// Price of the interval containing `instant`
pub fn price_at(curve: &[PricePoint], instant: DateTime<Utc>) -> Option<f64> {
    curve
        .iter()
        .find(|p| p.contains(instant))
        .map(|p| p.price_per_kwh)
}

/// Client for the day-ahead price service
pub struct PriceFetcher {
    client: reqwest::Client,
    base_url: String,
    area: String,
    tz: Tz,
    logger: StructuredLogger,
}

impl PriceFetcher {
    pub fn new(cfg: &PricesConfig, timeout: Duration) -> Result<Self> {
        let tz = cfg.timezone.parse::<Tz>().map_err(|_| {
            HeatwatchError::config(format!("Unknown price timezone '{}'", cfg.timezone))
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            area: cfg.area.clone(),
            tz,
            logger: get_logger("prices"),
        })
    }

    /// Prices for today and tomorrow in the price timezone
    ///
    /// Never fails; an empty curve means no day could be fetched.
    pub async fn fetch_curve(&self) -> Vec<PricePoint> {
        let today = Utc::now().with_timezone(&self.tz).date_naive();
        let mut dates = vec![today];
        if let Some(tomorrow) = today.checked_add_days(Days::new(1)) {
            dates.push(tomorrow);
        }
        self.fetch_for_dates(&dates).await
    }

    /// Prices for the given days, concatenated and sorted by start time
    pub async fn fetch_for_dates(&self, dates: &[NaiveDate]) -> Vec<PricePoint> {
        let mut curve = Vec::new();
        for date in dates {
            match self.fetch_day(*date).await {
                Ok(Some(mut points)) => curve.append(&mut points),
                Ok(None) => self
                    .logger
                    .warn(&format!("No price data published for {}", date)),
                Err(e) => self
                    .logger
                    .error(&format!("Price fetch for {} aborted: {}", date, e)),
            }
        }
        curve.sort_by_key(|p| p.time_start);
        if curve.is_empty() {
            self.logger.warn("Failed to fetch any electricity prices");
        }
        curve
    }

    /// Try each path variant for one day
    ///
    /// `Ok(None)` when every variant answered 404. Any other non-success
    /// status, a network error or a bad body ends the day with an error.
    async fn fetch_day(&self, date: NaiveDate) -> Result<Option<Vec<PricePoint>>> {
        for variant in date_variants(date, &self.area) {
            let url = format!("{}/{}", self.base_url, variant);
            self.logger.debug(&format!("Trying price URL {}", url));
            let resp = self.client.get(&url).send().await?;
            match resp.status() {
                StatusCode::OK => {
                    let raw: Vec<RawPrice> = resp.json().await?;
                    self.logger.info(&format!(
                        "Retrieved {} price entries for {}",
                        raw.len(),
                        date
                    ));
                    let points = raw
                        .into_iter()
                        .map(|r| PricePoint {
                            time_start: r.time_start,
                            time_end: r.time_end,
                            price_per_kwh: r.sek_per_kwh,
                            date,
                        })
                        .collect();
                    return Ok(Some(points));
                }
                StatusCode::NOT_FOUND => continue,
                other => {
                    return Err(HeatwatchError::network(format!(
                        "{} answered {}",
                        url, other
                    )));
                }
            }
        }
        Ok(None)
    }
}
