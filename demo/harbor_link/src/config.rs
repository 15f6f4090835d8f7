use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Scenario played by the harbor demo
#[derive(Clone, Debug)]
pub struct HarborConfig {
    pub station: String,
    pub harbor_lat: f64,
    pub harbor_lon: f64,
    /// Radius of the traffic area around the harbor, in meters
    pub area_radius_m: f64,
    pub vessels: Vec<VesselConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VesselConfig {
    pub mmsi: u32,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub length_m: f64,
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            station: std::env::var("HARBOR_STATION").unwrap_or_else(|_| "shore:dk-cph".to_string()),
            harbor_lat: 55.6930,
            harbor_lon: 12.6090,
            area_radius_m: std::env::var("HARBOR_AREA_RADIUS_M")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(8_000.0),
            vessels: vec![
                VesselConfig {
                    mmsi: 219_000_123,
                    name: "Pilot Boat".into(),
                    lat: 55.7050,
                    lon: 12.6250,
                    length_m: 18.0,
                },
                VesselConfig {
                    mmsi: 265_000_777,
                    name: "Ro-Ro Oresund".into(),
                    lat: 55.6500,
                    lon: 12.6800,
                    length_m: 186.0,
                },
                VesselConfig {
                    mmsi: 230_111_222,
                    name: "Baltic Trader".into(),
                    lat: 56.0400,
                    lon: 12.6100,
                    length_m: 142.0,
                },
            ],
        }
    }
}

impl HarborConfig {
    /// Load configuration from a TOML file (path via HARBOR_LINK_CONFIG or ./harbor_link.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("HARBOR_LINK_CONFIG").unwrap_or_else(|_| "harbor_link.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "harbor_link", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<HarborToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "harbor_link", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "harbor_link", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HarborToml {
    station: Option<String>,
    harbor_lat: Option<f64>,
    harbor_lon: Option<f64>,
    area_radius_m: Option<f64>,
    vessels: Option<Vec<VesselConfig>>,
}

impl HarborToml {
    fn overlay(self, mut base: HarborConfig) -> HarborConfig {
        if let Some(v) = self.station {
            base.station = v;
        }
        if let Some(v) = self.harbor_lat {
            base.harbor_lat = v;
        }
        if let Some(v) = self.harbor_lon {
            base.harbor_lon = v;
        }
        if let Some(v) = self.area_radius_m {
            base.area_radius_m = v;
        }
        if let Some(v) = self.vessels {
            base.vessels = v;
        }
        base
    }
}
