//! SMHI point forecast with a single-slot cache

use crate::config::WeatherConfig;
use crate::error::{HeatwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Forecast point coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lon, self.lat)
    }
}

impl FromStr for Coordinates {
    type Err = HeatwatchError;

    /// Parses `lon,lat`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            HeatwatchError::validation("location", format!("Expected 'lon,lat', got '{}'", s))
        };
        let (lon, lat) = s.split_once(',').ok_or_else(invalid)?;
        let lon = lon.trim().parse::<f64>().map_err(|_| invalid())?;
        let lat = lat.trim().parse::<f64>().map_err(|_| invalid())?;
        Ok(Self { lon, lat })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    pub valid_time: DateTime<Utc>,
    #[serde(default)]
    pub parameters: Vec<ForecastParameter>,
}

impl ForecastPoint {
    /// First value of the named parameter
    pub fn value(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.values.first().copied())
    }
}

/// Point forecast document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_series: Vec<ForecastPoint>,
}

/// Temperature at the forecast point closest to now
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentWeather {
    pub temperature: f64,
    pub time: DateTime<Utc>,
    pub location: String,
}

/// Series point closest to `now`
pub fn nearest_point(forecast: &Forecast, now: DateTime<Utc>) -> Option<&ForecastPoint> {
    forecast
        .time_series
        .iter()
        .min_by_key(|p| (p.valid_time - now).num_milliseconds().unsigned_abs())
}

/// Value of `parameter` at the series point closest to `now`
pub fn nearest_temperature(
    forecast: &Forecast,
    now: DateTime<Utc>,
    parameter: &str,
) -> Option<(f64, DateTime<Utc>)> {
    let point = nearest_point(forecast, now)?;
    point.value(parameter).map(|v| (v, point.valid_time))
}

struct CachedForecast {
    coords: Coordinates,
    fetched_at: Instant,
    forecast: Forecast,
}

/// Forecast client
pub struct WeatherFetcher {
    client: reqwest::Client,
    base_url: String,
    default_coords: Coordinates,
    location_name: String,
    parameter: String,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedForecast>>,
    logger: StructuredLogger,
}

impl WeatherFetcher {
    pub fn new(cfg: &WeatherConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            default_coords: Coordinates {
                lon: cfg.lon,
                lat: cfg.lat,
            },
            location_name: cfg.location_name.clone(),
            parameter: cfg.temperature_parameter.clone(),
            cache_ttl: Duration::from_secs(cfg.cache_secs),
            cache: Mutex::new(None),
            logger: get_logger("weather"),
        })
    }

    pub fn default_coords(&self) -> Coordinates {
        self.default_coords
    }

    fn url_for(&self, coords: Coordinates) -> String {
        format!(
            "{}/category/pmp3g/version/2/geotype/point/lon/{}/lat/{}/data.json",
            self.base_url, coords.lon, coords.lat
        )
    }

    async fn fetch(&self, coords: Coordinates) -> Result<Forecast> {
        let url = self.url_for(coords);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(HeatwatchError::network(format!(
                "Forecast service answered {}",
                resp.status()
            )));
        }
        let forecast: Forecast = resp.json().await?;
        Ok(forecast)
    }

    /// Forecast for the configured location
    pub async fn forecast(&self) -> Option<Forecast> {
        self.forecast_at(self.default_coords).await
    }

    /// Forecast for `coords`, served from cache when fresh
    ///
    /// The cache lock is released during the fetch, so readers of a cached
    /// location never wait on another location's request.
    pub async fn forecast_at(&self, coords: Coordinates) -> Option<Forecast> {
        if let Some(cached) = self.cached(coords).await {
            return Some(cached);
        }

        match self.fetch(coords).await {
            Ok(forecast) => {
                self.logger.debug(&format!(
                    "Fetched forecast for {} ({} points)",
                    coords,
                    forecast.time_series.len()
                ));
                *self.cache.lock().await = Some(CachedForecast {
                    coords,
                    fetched_at: Instant::now(),
                    forecast: forecast.clone(),
                });
                Some(forecast)
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Error fetching weather data for {}: {}", coords, e));
                None
            }
        }
    }

    async fn cached(&self, coords: Coordinates) -> Option<Forecast> {
        let slot = self.cache.lock().await;
        slot.as_ref()
            .filter(|c| c.coords == coords && c.fetched_at.elapsed() < self.cache_ttl)
            .map(|c| c.forecast.clone())
    }

    /// Temperature nearest to now for `coords`
    pub async fn current_at(&self, coords: Coordinates) -> Option<CurrentWeather> {
        let forecast = self.forecast_at(coords).await?;
        let (temperature, time) = nearest_temperature(&forecast, Utc::now(), &self.parameter)?;
        let location = if coords == self.default_coords {
            self.location_name.clone()
        } else {
            "Custom Location".to_string()
        };
        Some(CurrentWeather {
            temperature,
            time,
            location,
        })
    }

    /// Outdoor temperature at the configured location
    pub async fn current_outdoor_temp(&self) -> Option<f64> {
        self.current_at(self.default_coords)
            .await
            .map(|c| c.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coordinates_parse() {
        let c: Coordinates = "12.3167, 58.3833".parse().unwrap();
        assert_eq!(c.lon, 12.3167);
        assert_eq!(c.lat, 58.3833);
        assert!("12.3".parse::<Coordinates>().is_err());
        assert!("a,b".parse::<Coordinates>().is_err());
    }

    #[test]
    fn nearest_point_uses_absolute_distance() {
        let forecast: Forecast = serde_json::from_value(json!({
            "timeSeries": [
                {"validTime": "2025-01-01T10:00:00Z", "parameters": [{"name": "t", "values": [1.0]}]},
                {"validTime": "2025-01-01T11:00:00Z", "parameters": [{"name": "t", "values": [2.0]}]},
                {"validTime": "2025-01-01T12:00:00Z", "parameters": [{"name": "ws", "values": [5.0]}]}
            ]
        }))
        .unwrap();
        let now = "2025-01-01T10:40:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(nearest_temperature(&forecast, now, "t").map(|(t, _)| t), Some(2.0));

        let late = "2025-01-01T13:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(nearest_temperature(&forecast, late, "t"), None);

        let empty = Forecast {
            approved_time: None,
            reference_time: None,
            time_series: vec![],
        };
        assert_eq!(nearest_temperature(&empty, now, "t"), None);
    }
}
