use super::*;

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            meter_id: "em3".to_string(),
            sensor_id: "indoor".to_string(),
            heat_source_id: "heater".to_string(),
            power_step_threshold_w: 2000.0,
        }
    }
}

impl Default for PricesConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.elprisetjustnu.se/api/v1/prices".to_string(),
            area: "SE3".to_string(),
            timezone: "Europe/Stockholm".to_string(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://opendata-download-metfcst.smhi.se/api".to_string(),
            lon: 12.3167,
            lat: 58.3833,
            location_name: "Vänersborg".to_string(),
            cache_secs: 3600,
            temperature_parameter: "t".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "/data/heatwatch_history.json".to_string(),
            max_days: 30,
        }
    }
}

impl Default for SavingsConfig {
    fn default() -> Self {
        Self {
            base_target_temp: 22.0,
            solar_medium_excess_kw: 1.0,
            solar_medium_target_temp: 24.0,
            solar_high_excess_kw: 2.0,
            solar_high_target_temp: 25.0,
            cold_indoor_below: 21.0,
            comfort_indoor_max: 23.0,
            cold_price_limit: 3.0,
            comfort_price_limit: 2.0,
            solar_benefit_factor: 0.3,
            thermal_bonus_factor: 0.5,
            thermal_bonus_base_temp: 22.0,
            off_saving_kwh: 1.5,
            on_saving: 2.0,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            tls: false,
            keep_alive_secs: 60,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_timeout_secs: 5,
            service_timeout_secs: 10,
            app_id: "heatwatch".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/heatwatch.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8085,
            static_dir: None,
        }
    }
}

fn seed(id: &str, name: &str, kind: DeviceType) -> DeviceSeed {
    DeviceSeed {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        ip: None,
        mqtt_topic: None,
        threshold: None,
        description: String::new(),
        enabled: true,
    }
}

impl Default for Config {
    fn default() -> Self {
        let devices = vec![
            DeviceSeed {
                ip: Some("192.168.1.194".to_string()),
                description: "Three phase energy meter".to_string(),
                ..seed("em3", "Energy meter", DeviceType::Meter)
            },
            DeviceSeed {
                ip: Some("192.168.1.195".to_string()),
                description: "Living room temperature and humidity".to_string(),
                ..seed("indoor", "Indoor sensor", DeviceType::Sensor)
            },
            DeviceSeed {
                ip: Some("192.168.1.196".to_string()),
                mqtt_topic: Some("shellies/heater".to_string()),
                description: "Heat pump relay on a cover channel".to_string(),
                ..seed("heater", "Heat source", DeviceType::ShellyCover)
            },
            DeviceSeed {
                mqtt_topic: Some("home/device1".to_string()),
                threshold: Some(100.0),
                description: "First test device".to_string(),
                ..seed("device1", "Device 1", DeviceType::Switch)
            },
            DeviceSeed {
                mqtt_topic: Some("home/device2".to_string()),
                threshold: Some(80.0),
                description: "Second test device".to_string(),
                ..seed("device2", "Device 2", DeviceType::Switch)
            },
        ];

        Self {
            devices,
            collector: CollectorConfig::default(),
            prices: PricesConfig::default(),
            weather: WeatherConfig::default(),
            store: StoreConfig::default(),
            savings: SavingsConfig::default(),
            mqtt: MqttConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
            timezone: "Europe/Stockholm".to_string(),
        }
    }
}
