//! # Heatwatch - heat source helper driven by meter, climate and spot price
//!
//! Polls a three-phase energy meter and an indoor climate sensor on the
//! local network, infers the on/off state of a large heat source from steps
//! in measured power, and keeps an hourly history of indoor and outdoor
//! temperature, heater position and electricity price. The history is scored
//! retroactively to estimate what an optimal strategy would have saved.
//!
//! ## Architecture
//!
//! - `config`: YAML configuration, defaults and validation
//! - `logging`: Structured logging and tracing
//! - `registry`: Shared in-memory device registry
//! - `meter` / `sensor`: Shelly status readers for the meter and sensor
//! - `detector`: Power step detection on the meter's rolling window
//! - `prices` / `weather`: Day-ahead price and point forecast clients
//! - `store`: Persistent hourly time series
//! - `savings`: Retroactive optimal-state and savings estimate
//! - `controller` / `mqtt`: Device commands over HTTP RPC and MQTT
//! - `collector`: Periodic collection job
//! - `app`: Application context shared by the web API
//! - `web`: HTTP server and REST API

pub mod app;
pub mod collector;
pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod logging;
pub mod meter;
pub mod mqtt;
pub mod prices;
pub mod registry;
pub mod savings;
pub mod sensor;
pub mod store;
pub mod weather;
pub mod web;

// Re-export commonly used types
pub use app::AppContext;
pub use config::Config;
pub use error::{HeatwatchError, Result};
