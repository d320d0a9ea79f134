//! Retroactive savings estimate for hourly records
//!
//! Each record is scored against a fixed set of threshold rules: the rules
//! give the state the heat source should have been in, and savings are only
//! credited for hours where the recorded position matched it.

use crate::config::SavingsConfig;
use crate::registry::HeatState;
use crate::store::HourlyRecord;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Recommended state and target temperature for a record
///
/// Returns `(None, target)` when the rules cannot decide, i.e. a temperature
/// is missing or a price is needed but unknown.
pub fn optimal_state(record: &HourlyRecord, cfg: &SavingsConfig) -> (Option<HeatState>, f64) {
    let mut target = cfg.base_target_temp;
    let (Some(indoor), Some(_)) = (record.indoor_temp, record.outdoor_temp) else {
        return (None, target);
    };

    if record.solar_production < 0.0 {
        let excess = record.solar_production.abs();
        if excess > cfg.solar_high_excess_kw {
            target = cfg.solar_high_target_temp;
        } else if excess > cfg.solar_medium_excess_kw {
            target = cfg.solar_medium_target_temp;
        }
        return (Some(HeatState::On), target);
    }

    let price = record.electricity_price;
    let state = if indoor < cfg.cold_indoor_below {
        price.map(|p| {
            if p > cfg.cold_price_limit {
                HeatState::Off
            } else {
                HeatState::On
            }
        })
    } else if indoor <= cfg.comfort_indoor_max {
        price.map(|p| {
            if p > cfg.comfort_price_limit {
                HeatState::Off
            } else {
                HeatState::On
            }
        })
    } else if indoor > target {
        Some(HeatState::Off)
    } else {
        None
    };
    (state, target)
}

/// Annotated copy of `record` with all derived fields filled in
pub fn estimate(record: &HourlyRecord, cfg: &SavingsConfig) -> HourlyRecord {
    let mut out = record.clone();
    let solar = record.solar_production;
    let (optimal, target) = optimal_state(record, cfg);

    let mut solar_benefit = 0.0;
    let mut energy_saved = 0.0;

    if let (Some(optimal), Some(indoor), Some(outdoor)) =
        (optimal, record.indoor_temp, record.outdoor_temp)
        && HeatState::from(record.device_position) == optimal
    {
        let temp_diff = indoor - outdoor;
        let price = record.electricity_price;
        if solar < 0.0 {
            solar_benefit = price.map_or(0.0, |p| solar.abs() * p * cfg.solar_benefit_factor);
            let bonus = if indoor > cfg.thermal_bonus_base_temp {
                cfg.thermal_bonus_factor * (indoor - cfg.thermal_bonus_base_temp)
            } else {
                0.0
            };
            energy_saved = solar_benefit + bonus;
        } else if optimal == HeatState::Off {
            if let Some(p) = price {
                energy_saved = cfg.off_saving_kwh * p;
            }
        } else if temp_diff < 0.0 {
            energy_saved = cfg.on_saving;
        }
    }

    out.target_temp = Some(round2(target));
    out.grid_consumption = Some(round2(if solar >= 0.0 { solar } else { 0.0 }));
    out.solar_benefit = Some(round2(solar_benefit));
    out.energy_saved = Some(round2(energy_saved));
    out.optimal_state = optimal;
    out
}

/// Annotate a slice of records
pub fn annotate(records: &[HourlyRecord], cfg: &SavingsConfig) -> Vec<HourlyRecord> {
    records.iter().map(|r| estimate(r, cfg)).collect()
}

/// Sum of `energy_saved` over annotated records
pub fn total_saved(records: &[HourlyRecord]) -> f64 {
    round2(records.iter().filter_map(|r| r.energy_saved).sum())
}
