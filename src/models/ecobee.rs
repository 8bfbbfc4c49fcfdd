//! Models for the subset of the ecobee v1 API this service reads.
//!
//! Notes
//! - Temperatures are integer tenths of a degree Fahrenheit, as delivered by the API.
//! - Timestamps are `YYYY-MM-DD HH:MM:SS` strings in UTC; they stay strings here and
//!   are parsed with [`parse_timestamp`] where they are consumed, so that one bad value
//!   surfaces as a [`DecodeError`] instead of failing the whole response.

use chrono::{DateTime, NaiveDateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use std::error::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Number of samples the extended runtime block carries per metric.
pub const EXTENDED_RUNTIME_SAMPLES: usize = 3;

// =====================
// Decode errors
// =====================

/// A response decoded as JSON but does not have the shape the engine relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    MissingSample { field: &'static str, index: usize },
    NoForecast,
    Timestamp { field: &'static str, value: String },
    SummaryLengthMismatch { revisions: usize, statuses: usize },
    MalformedRevision(String),
    MalformedStatus(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MissingSample { field, index } => {
                write!(f, "extended runtime field {} has no sample {}", field, index)
            }
            DecodeError::NoForecast => write!(f, "weather block contains no forecasts"),
            DecodeError::Timestamp { field, value } => {
                write!(f, "unparsable {} timestamp '{}'", field, value)
            }
            DecodeError::SummaryLengthMismatch { revisions, statuses } => write!(
                f,
                "thermostat summary has {} revision entries but {} status entries",
                revisions, statuses
            ),
            DecodeError::MalformedRevision(s) => write!(f, "malformed revision entry '{}'", s),
            DecodeError::MalformedStatus(s) => write!(f, "malformed status entry '{}'", s),
        }
    }
}

impl Error for DecodeError {}

pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, DecodeError> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::Timestamp {
            field,
            value: value.to_string(),
        })
}

// =====================
// Requests
// =====================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub selection_type: String,
    pub selection_match: String,
    pub include_runtime: bool,
    pub include_extended_runtime: bool,
    pub include_sensors: bool,
    pub include_weather: bool,
    pub include_equipment_status: bool,
}

impl Selection {
    /// Everything the synchronization engine consumes for a single thermostat.
    pub fn snapshot(thermostat_id: &str) -> Self {
        Selection {
            selection_type: "thermostats".to_string(),
            selection_match: thermostat_id.to_string(),
            include_runtime: true,
            include_extended_runtime: true,
            include_sensors: true,
            include_weather: true,
            include_equipment_status: false,
        }
    }

    /// All thermostats registered to the account.
    pub fn registered() -> Self {
        Selection {
            selection_type: "registered".to_string(),
            include_equipment_status: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionRequest<'a> {
    pub selection: &'a Selection,
}

// =====================
// Responses
// =====================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Page {
    pub page: i64,
    pub total_pages: i64,
    pub page_size: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThermostatsResponse {
    pub page: Page,
    pub thermostat_list: Vec<Thermostat>,
    pub status: Status,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThermostatSummaryResponse {
    pub thermostat_count: usize,
    pub revision_list: Vec<String>,
    pub status_list: Vec<String>,
    pub status: Status,
}

/// Body returned alongside non-2xx responses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorEnvelope {
    pub status: Status,
}

// =====================
// Snapshot
// =====================

/// One point-in-time read of a thermostat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Thermostat {
    pub identifier: String,
    pub name: String,
    pub thermostat_rev: String,
    pub is_registered: bool,
    pub model_number: String,
    pub brand: String,
    pub last_modified: String,
    pub thermostat_time: String,
    pub utc_time: String,
    pub runtime: Runtime,
    pub extended_runtime: ExtendedRuntime,
    pub remote_sensors: Vec<RemoteSensor>,
    pub weather: Weather,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Runtime {
    pub runtime_rev: String,
    pub connected: bool,
    pub first_connected: String,
    pub connect_date_time: String,
    pub disconnect_date_time: String,
    pub last_modified: String,
    pub last_status_modified: String,
    pub runtime_date: String,
    pub runtime_interval: i64,
    pub actual_temperature: i64,
    pub actual_humidity: i64,
    #[serde(rename = "actualAQAccuracy")]
    pub actual_aq_accuracy: Option<i64>,
    #[serde(rename = "actualAQScore")]
    pub actual_aq_score: Option<i64>,
    #[serde(rename = "actualCO2")]
    pub actual_co2: Option<i64>,
    #[serde(rename = "actualVOC")]
    pub actual_voc: Option<i64>,
    pub desired_heat: i64,
    pub desired_cool: i64,
    pub desired_humidity: i64,
    pub desired_dehumidity: i64,
    pub desired_fan_mode: String,
    pub desired_heat_range: Vec<i64>,
    pub desired_cool_range: Vec<i64>,
}

/// Rolling window of the last three five-minute samples, aligned to
/// `last_reading_timestamp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtendedRuntime {
    pub last_reading_timestamp: String,
    pub runtime_date: String,
    pub runtime_interval: i64,
    pub actual_temperature: Vec<i64>,
    pub actual_humidity: Vec<i64>,
    pub desired_heat: Vec<i64>,
    pub desired_cool: Vec<i64>,
    pub desired_humidity: Vec<i64>,
    pub desired_dehumidity: Vec<i64>,
    pub dm_offset: Vec<i64>,
    pub hvac_mode: Vec<String>,
    pub heat_pump1: Vec<i64>,
    pub heat_pump2: Vec<i64>,
    pub aux_heat1: Vec<i64>,
    pub aux_heat2: Vec<i64>,
    pub aux_heat3: Vec<i64>,
    pub cool1: Vec<i64>,
    pub cool2: Vec<i64>,
    pub fan: Vec<i64>,
    pub humidifier: Vec<i64>,
    pub dehumidifier: Vec<i64>,
    pub economizer: Vec<i64>,
    pub ventilator: Vec<i64>,
}

/// The `index`-th column of [`ExtendedRuntime`], still in device units.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSample {
    pub time: DateTime<Utc>,
    pub temperature: i64,
    pub humidity: i64,
    pub desired_heat: i64,
    pub desired_cool: i64,
    pub desired_humidity: i64,
    pub desired_dehumidity: i64,
    pub dm_offset: i64,
    pub hvac_mode: String,
    pub heat_pump_1: i64,
    pub heat_pump_2: i64,
    pub aux_heat_1: i64,
    pub aux_heat_2: i64,
    pub cool_1: i64,
    pub cool_2: i64,
    pub fan: i64,
    pub humidifier: i64,
    pub dehumidifier: i64,
}

fn sample_at<T: Clone>(values: &[T], field: &'static str, index: usize) -> Result<T, DecodeError> {
    values
        .get(index)
        .cloned()
        .ok_or(DecodeError::MissingSample { field, index })
}

impl ExtendedRuntime {
    pub fn base_time(&self) -> Result<DateTime<Utc>, DecodeError> {
        parse_timestamp("lastReadingTimestamp", &self.last_reading_timestamp)
    }

    /// Sample `index` (0..3), stamped with `time`.
    pub fn sample(&self, index: usize, time: DateTime<Utc>) -> Result<RuntimeSample, DecodeError> {
        Ok(RuntimeSample {
            time,
            temperature: sample_at(&self.actual_temperature, "actualTemperature", index)?,
            humidity: sample_at(&self.actual_humidity, "actualHumidity", index)?,
            desired_heat: sample_at(&self.desired_heat, "desiredHeat", index)?,
            desired_cool: sample_at(&self.desired_cool, "desiredCool", index)?,
            desired_humidity: sample_at(&self.desired_humidity, "desiredHumidity", index)?,
            desired_dehumidity: sample_at(&self.desired_dehumidity, "desiredDehumidity", index)?,
            dm_offset: sample_at(&self.dm_offset, "dmOffset", index)?,
            hvac_mode: sample_at(&self.hvac_mode, "hvacMode", index)?,
            heat_pump_1: sample_at(&self.heat_pump1, "heatPump1", index)?,
            heat_pump_2: sample_at(&self.heat_pump2, "heatPump2", index)?,
            aux_heat_1: sample_at(&self.aux_heat1, "auxHeat1", index)?,
            aux_heat_2: sample_at(&self.aux_heat2, "auxHeat2", index)?,
            cool_1: sample_at(&self.cool1, "cool1", index)?,
            cool_2: sample_at(&self.cool2, "cool2", index)?,
            fan: sample_at(&self.fan, "fan", index)?,
            humidifier: sample_at(&self.humidifier, "humidifier", index)?,
            dehumidifier: sample_at(&self.dehumidifier, "dehumidifier", index)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteSensor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub code: String,
    pub in_use: bool,
    pub capability: Vec<RemoteSensorCapability>,
}

impl RemoteSensor {
    /// Raw value of the first capability of the given type (`temperature`, `occupancy`, ...).
    pub fn capability_value(&self, capability_type: &str) -> Option<&str> {
        self.capability
            .iter()
            .find(|c| c.capability_type == capability_type)
            .map(|c| c.value.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSensorCapability {
    pub id: String,
    #[serde(rename = "type")]
    pub capability_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Weather {
    pub timestamp: String,
    pub weather_station: String,
    pub forecasts: Vec<WeatherForecast>,
}

impl Weather {
    pub fn observed_at(&self) -> Result<DateTime<Utc>, DecodeError> {
        parse_timestamp("weather", &self.timestamp)
    }

    /// The entry describing current conditions.
    pub fn current(&self) -> Result<&WeatherForecast, DecodeError> {
        self.forecasts.first().ok_or(DecodeError::NoForecast)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WeatherForecast {
    pub weather_symbol: i64,
    pub date_time: String,
    pub condition: String,
    /// Tenths of a degree F.
    pub temperature: i64,
    /// Millibar.
    pub pressure: i64,
    pub relative_humidity: i64,
    /// Tenths of a degree F.
    pub dewpoint: i64,
    /// Meters.
    pub visibility: i64,
    /// Miles per hour.
    pub wind_speed: i64,
    pub wind_gust: i64,
    pub wind_direction: String,
    pub wind_bearing: i64,
    pub pop: i64,
    pub temp_high: i64,
    pub temp_low: i64,
    pub sky: i64,
}

// =====================
// Thermostat summary
// =====================

/// Equipment currently running, decoded from a status-list entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EquipmentStatus {
    pub heat_pump: bool,
    pub heat_pump_2: bool,
    pub heat_pump_3: bool,
    pub comp_cool_1: bool,
    pub comp_cool_2: bool,
    pub aux_heat_1: bool,
    pub aux_heat_2: bool,
    pub aux_heat_3: bool,
    pub fan: bool,
    pub humidifier: bool,
    pub dehumidifier: bool,
    pub ventilator: bool,
    pub economizer: bool,
    pub comp_hot_water: bool,
    pub aux_hot_water: bool,
}

impl EquipmentStatus {
    /// Parses `"<identifier>:<token>,<token>,..."`. Unknown tokens are ignored.
    pub fn parse(entry: &str) -> Result<Self, DecodeError> {
        let (_, running) = entry
            .split_once(':')
            .ok_or_else(|| DecodeError::MalformedStatus(entry.to_string()))?;

        let mut status = EquipmentStatus::default();
        for token in running.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(flag) = status.flag_mut(token) {
                *flag = true;
            }
        }
        Ok(status)
    }

    fn flag_mut(&mut self, token: &str) -> Option<&mut bool> {
        let flag = match token {
            "heatPump" => &mut self.heat_pump,
            "heatPump2" => &mut self.heat_pump_2,
            "heatPump3" => &mut self.heat_pump_3,
            "compCool1" => &mut self.comp_cool_1,
            "compCool2" => &mut self.comp_cool_2,
            "auxHeat1" => &mut self.aux_heat_1,
            "auxHeat2" => &mut self.aux_heat_2,
            "auxHeat3" => &mut self.aux_heat_3,
            "fan" => &mut self.fan,
            "humidifier" => &mut self.humidifier,
            "dehumidifier" => &mut self.dehumidifier,
            "ventilator" => &mut self.ventilator,
            "economizer" => &mut self.economizer,
            "compHotWater" => &mut self.comp_hot_water,
            "auxHotWater" => &mut self.aux_hot_water,
            _ => return None,
        };
        Some(flag)
    }

    /// API names of the equipment that is on.
    pub fn running(&self) -> Vec<&'static str> {
        [
            ("heatPump", self.heat_pump),
            ("heatPump2", self.heat_pump_2),
            ("heatPump3", self.heat_pump_3),
            ("compCool1", self.comp_cool_1),
            ("compCool2", self.comp_cool_2),
            ("auxHeat1", self.aux_heat_1),
            ("auxHeat2", self.aux_heat_2),
            ("auxHeat3", self.aux_heat_3),
            ("fan", self.fan),
            ("humidifier", self.humidifier),
            ("dehumidifier", self.dehumidifier),
            ("ventilator", self.ventilator),
            ("economizer", self.economizer),
            ("compHotWater", self.comp_hot_water),
            ("auxHotWater", self.aux_hot_water),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThermostatSummary {
    pub identifier: String,
    pub name: String,
    pub connected: bool,
    pub thermostat_revision: String,
    pub alerts_revision: String,
    pub runtime_revision: String,
    pub interval_revision: String,
    pub equipment: EquipmentStatus,
}

impl ThermostatSummary {
    fn parse(revision: &str, status: &str) -> Result<Self, DecodeError> {
        let parts: Vec<&str> = revision.split(':').collect();
        if parts.len() < 7 {
            return Err(DecodeError::MalformedRevision(revision.to_string()));
        }
        let connected = parts[2]
            .parse::<bool>()
            .map_err(|_| DecodeError::MalformedRevision(revision.to_string()))?;

        Ok(ThermostatSummary {
            identifier: parts[0].to_string(),
            name: parts[1].to_string(),
            connected,
            thermostat_revision: parts[3].to_string(),
            alerts_revision: parts[4].to_string(),
            runtime_revision: parts[5].to_string(),
            interval_revision: parts[6].to_string(),
            equipment: EquipmentStatus::parse(status)?,
        })
    }
}

impl ThermostatSummaryResponse {
    /// Pairs revision and status entries positionally; the API emits both in the same order.
    pub fn summaries(&self) -> Result<Vec<ThermostatSummary>, DecodeError> {
        if self.revision_list.len() != self.status_list.len() {
            return Err(DecodeError::SummaryLengthMismatch {
                revisions: self.revision_list.len(),
                statuses: self.status_list.len(),
            });
        }
        self.revision_list
            .iter()
            .zip(&self.status_list)
            .map(|(revision, status)| ThermostatSummary::parse(revision, status))
            .collect()
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    pub fn load_thermostat_fixture() -> Thermostat {
        let json = std::fs::read_to_string("tests/data/thermostat.json").expect("fixture present");
        let response: ThermostatsResponse = serde_json::from_str(&json).expect("parse thermostat response");
        response.thermostat_list.into_iter().next().expect("one thermostat")
    }

    pub fn load_summary_fixture() -> ThermostatSummaryResponse {
        let json = std::fs::read_to_string("tests/data/thermostat-summary.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse summary response")
    }
}
