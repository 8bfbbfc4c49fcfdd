//! Unit conversions and the derived weather formulas.
//! Everything here is pure; device values arrive as fixed-point integers.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

const MB_PER_INHG: f64 = 33.864;
const METERS_PER_MILE: f64 = 1609.34;
const KM_PER_MILE: f64 = 1.609344;

/// Unit of the unsuffixed temperature fields in published records.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum TemperatureUnit {
    #[default]
    Fahrenheit,
    Celsius,
}

impl TemperatureUnit {
    /// Converts a Fahrenheit reading into this unit.
    pub fn from_fahrenheit(self, temp_f: f64) -> f64 {
        match self {
            TemperatureUnit::Fahrenheit => temp_f,
            TemperatureUnit::Celsius => f_to_c(temp_f),
        }
    }

    /// Converts a Fahrenheit temperature difference (e.g. a setpoint offset).
    pub fn delta_from_fahrenheit(self, delta_f: f64) -> f64 {
        match self {
            TemperatureUnit::Fahrenheit => delta_f,
            TemperatureUnit::Celsius => delta_f * 5.0 / 9.0,
        }
    }
}

impl Display for TemperatureUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TemperatureUnit::Fahrenheit => write!(f, "F"),
            TemperatureUnit::Celsius => write!(f, "C"),
        }
    }
}

impl FromStr for TemperatureUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "F" | "FAHRENHEIT" => Ok(TemperatureUnit::Fahrenheit),
            "C" | "CELSIUS" => Ok(TemperatureUnit::Celsius),
            other => Err(format!("unknown temperature unit '{}' (expected F or C)", other)),
        }
    }
}

/// Decodes the API's tenths-of-a-unit encoding.
pub fn tenths(value: i64) -> f64 {
    value as f64 / 10.0
}

pub fn f_to_c(temp_f: f64) -> f64 {
    (temp_f - 32.0) * 5.0 / 9.0
}

pub fn mb_to_inhg(pressure_mb: f64) -> f64 {
    pressure_mb / MB_PER_INHG
}

pub fn meters_to_miles(meters: f64) -> f64 {
    meters / METERS_PER_MILE
}

pub fn miles_to_km(miles: f64) -> f64 {
    miles * KM_PER_MILE
}

/// Wind chill in °F. The formula is only valid at or below 50 °F with wind of
/// at least 3 mph; outside that range the temperature is returned unchanged.
pub fn wind_chill(temp_f: f64, wind_speed_mph: f64) -> f64 {
    if temp_f > 50.0 || wind_speed_mph < 3.0 {
        return temp_f;
    }
    let v = wind_speed_mph.powf(0.16);
    35.74 + 0.6215 * temp_f - 35.75 * v + 0.4275 * temp_f * v
}

/// Maximum recommended indoor relative humidity (%) for an outdoor temperature in °F.
pub fn indoor_humidity_recommendation(outdoor_temp_f: f64) -> i64 {
    const BANDS: [(f64, i64); 7] = [
        (50.0, 50),
        (40.0, 45),
        (30.0, 40),
        (20.0, 35),
        (10.0, 30),
        (0.0, 25),
        (-10.0, 20),
    ];
    BANDS
        .iter()
        .find(|(floor, _)| outdoor_temp_f >= *floor)
        .map(|(_, pct)| *pct)
        .unwrap_or(15)
}
