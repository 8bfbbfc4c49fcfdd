//! Turns a decoded snapshot into normalized per-stream records.
//!
//! Field sets are declared as tables of `(equipment flag, field name, extractor)`;
//! a row gated on a flag is emitted only when that equipment is configured, and an
//! extractor returning `None` leaves the field out.

use crate::config::{Equipment, EquipmentFlags};
use crate::models::ecobee::{
    DecodeError, EXTENDED_RUNTIME_SAMPLES, RemoteSensor, Runtime, RuntimeSample, Thermostat, parse_timestamp,
};
use crate::sinks::{FieldValue, Record};
use crate::units::{self, TemperatureUnit};
use crate::watermark::{Marker, Stream};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, warn};
use std::collections::BTreeMap;

pub const RUNTIME_MEASUREMENT: &str = "ecobee_runtime";
pub const SENSOR_MEASUREMENT: &str = "ecobee_sensor";
pub const AIR_QUALITY_MEASUREMENT: &str = "ecobee_air_quality";
pub const WEATHER_MEASUREMENT: &str = "ecobee_weather";

const THERMOSTAT_NAME_TAG: &str = "thermostat_name";

/// Spacing of the extended runtime samples around `lastReadingTimestamp`.
const SAMPLE_SPACING: TimeDelta = TimeDelta::minutes(5);

#[derive(Debug, Copy, Clone, Default)]
pub struct RecordOptions {
    pub equipment: EquipmentFlags,
    pub unit: TemperatureUnit,
    /// Stamp weather with the cycle time instead of the observation time.
    pub always_current_weather: bool,
}

/// Records for one stream, with the marker its watermark advances to once delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub stream: Stream,
    pub marker: Marker,
    pub records: Vec<Record>,
    /// Published even when the watermark already holds `marker`.
    pub always_publish: bool,
}

struct FieldDef<T> {
    equipment: Option<Equipment>,
    name: &'static str,
    extract: fn(&T, TemperatureUnit) -> Option<FieldValue>,
}

const fn field<T>(name: &'static str, extract: fn(&T, TemperatureUnit) -> Option<FieldValue>) -> FieldDef<T> {
    FieldDef {
        equipment: None,
        name,
        extract,
    }
}

const fn gated<T>(
    equipment: Equipment,
    name: &'static str,
    extract: fn(&T, TemperatureUnit) -> Option<FieldValue>,
) -> FieldDef<T> {
    FieldDef {
        equipment: Some(equipment),
        name,
        extract,
    }
}

fn build_fields<T>(defs: &[FieldDef<T>], source: &T, options: &RecordOptions) -> BTreeMap<&'static str, FieldValue> {
    defs
        .iter()
        .filter(|def| def.equipment.is_none_or(|e| options.equipment.includes(e)))
        .filter_map(|def| (def.extract)(source, options.unit).map(|v| (def.name, v)))
        .collect()
}

fn temp(tenths_f: i64, unit: TemperatureUnit) -> Option<FieldValue> {
    Some(FieldValue::Float(unit.from_fahrenheit(units::tenths(tenths_f))))
}

fn int(v: i64) -> Option<FieldValue> {
    Some(FieldValue::Int(v))
}

fn float(v: f64) -> Option<FieldValue> {
    Some(FieldValue::Float(v))
}

fn base_tags(thermostat: &Thermostat) -> BTreeMap<&'static str, String> {
    let mut tags = BTreeMap::new();
    tags.insert(THERMOSTAT_NAME_TAG, thermostat.name.clone());
    tags
}

// =====================
// Runtime
// =====================

const RUNTIME_FIELDS: &[FieldDef<RuntimeSample>] = &[
    field("temperature", |s, u| temp(s.temperature, u)),
    field("humidity", |s, _| int(s.humidity)),
    field("heat_set_point", |s, u| temp(s.desired_heat, u)),
    field("cool_set_point", |s, u| temp(s.desired_cool, u)),
    field("demand_mgmt_offset", |s, u| float(u.delta_from_fahrenheit(units::tenths(s.dm_offset)))),
    field("hvac_mode", |s, _| Some(FieldValue::Text(s.hvac_mode.clone()))),
    field("fan_run_time", |s, _| int(s.fan)),
    gated(Equipment::Humidifier, "humidity_set_point", |s, _| int(s.desired_humidity)),
    gated(Equipment::Humidifier, "humidifier_run_time", |s, _| int(s.humidifier)),
    gated(Equipment::Dehumidifier, "dehumidity_set_point", |s, _| int(s.desired_dehumidity)),
    gated(Equipment::Dehumidifier, "dehumidifier_run_time", |s, _| int(s.dehumidifier)),
    gated(Equipment::AuxHeat1, "aux_heat_1_run_time", |s, _| int(s.aux_heat_1)),
    gated(Equipment::AuxHeat2, "aux_heat_2_run_time", |s, _| int(s.aux_heat_2)),
    gated(Equipment::HeatPump1, "heat_pump_1_run_time", |s, _| int(s.heat_pump_1)),
    gated(Equipment::HeatPump2, "heat_pump_2_run_time", |s, _| int(s.heat_pump_2)),
    gated(Equipment::Cool1, "cool_1_run_time", |s, _| int(s.cool_1)),
    gated(Equipment::Cool2, "cool_2_run_time", |s, _| int(s.cool_2)),
];

/// One record per extended runtime sample, at −5, 0 and +5 minutes from the
/// last reading timestamp.
pub fn runtime_records(thermostat: &Thermostat, options: &RecordOptions) -> Result<Vec<Record>, DecodeError> {
    let ext = &thermostat.extended_runtime;
    let base = ext.base_time()?;

    (0..EXTENDED_RUNTIME_SAMPLES)
        .map(|i| {
            let time = base + SAMPLE_SPACING * (i as i32 - 1);
            let sample = ext.sample(i, time)?;
            debug!("Thermostat conditions at {}: {:?}", time, sample);
            Ok(Record {
                measurement: RUNTIME_MEASUREMENT,
                category: "runtime".to_string(),
                time,
                tags: base_tags(thermostat),
                fields: build_fields(RUNTIME_FIELDS, &sample, options),
            })
        })
        .collect()
}

// =====================
// Sensors and air quality
// =====================

#[derive(Debug, Clone, PartialEq)]
struct SensorSample {
    temperature_f: f64,
    occupied: Option<bool>,
    humidity: Option<i64>,
}

const SENSOR_FIELDS: &[FieldDef<SensorSample>] = &[
    field("temperature", |s, u| float(u.from_fahrenheit(s.temperature_f))),
    field("occupied", |s, _| s.occupied.map(FieldValue::Bool)),
    field("humidity", |s, _| s.humidity.map(FieldValue::Int)),
];

/// `None` when the sensor has no usable temperature; a reading of exactly zero
/// means the sensor is offline.
fn sensor_sample(sensor: &RemoteSensor) -> Option<SensorSample> {
    let raw = sensor.capability_value("temperature")?;
    if raw.eq_ignore_ascii_case("unknown") {
        return None;
    }
    let tenths_f = match raw.trim().parse::<i64>() {
        Ok(v) => v,
        Err(e) => {
            warn!("error reading temperature '{}' for sensor {}: {}", raw, sensor.name, e);
            return None;
        }
    };
    if tenths_f == 0 {
        return None;
    }
    Some(SensorSample {
        temperature_f: units::tenths(tenths_f),
        occupied: sensor.capability_value("occupancy").map(|v| v == "true"),
        humidity: sensor.capability_value("humidity").and_then(|v| v.trim().parse().ok()),
    })
}

pub fn sensor_records(thermostat: &Thermostat, time: DateTime<Utc>, options: &RecordOptions) -> Vec<Record> {
    thermostat
        .remote_sensors
        .iter()
        .filter_map(|sensor| {
            let Some(sample) = sensor_sample(sensor) else {
                debug!("Sensor '{}' ({}) has no reading; skipped", sensor.name, sensor.id);
                return None;
            };
            debug!("Sensor '{}' at {}: {:?}", sensor.name, time, sample);
            let mut tags = base_tags(thermostat);
            tags.insert("sensor_name", sensor.name.clone());
            tags.insert("sensor_id", sensor.id.clone());
            Some(Record {
                measurement: SENSOR_MEASUREMENT,
                category: format!("sensor/{}", sensor.id),
                time,
                tags,
                fields: build_fields(SENSOR_FIELDS, &sample, options),
            })
        })
        .collect()
}

const AIR_QUALITY_FIELDS: &[FieldDef<Runtime>] = &[
    field("air_quality_score", |r, _| r.actual_aq_score.map(FieldValue::Int)),
    field("air_quality_accuracy", |r, _| r.actual_aq_accuracy.map(FieldValue::Int)),
    field("co2_ppm", |r, _| r.actual_co2.map(FieldValue::Int)),
    field("voc_ppb", |r, _| r.actual_voc.map(FieldValue::Int)),
];

/// `None` for thermostats without an air quality sensor.
pub fn air_quality_record(thermostat: &Thermostat, time: DateTime<Utc>, options: &RecordOptions) -> Option<Record> {
    let fields = build_fields(AIR_QUALITY_FIELDS, &thermostat.runtime, options);
    if fields.is_empty() {
        return None;
    }
    debug!("Air quality at {}: {:?}", time, fields);
    Some(Record {
        measurement: AIR_QUALITY_MEASUREMENT,
        category: "air_quality".to_string(),
        time,
        tags: base_tags(thermostat),
        fields,
    })
}

// =====================
// Weather
// =====================

#[derive(Debug, Clone, PartialEq)]
struct WeatherSample {
    temperature_f: f64,
    humidity: i64,
    pressure_mb: i64,
    dew_point_f: f64,
    wind_speed_mph: i64,
    wind_bearing: i64,
    visibility_mi: f64,
    condition: String,
}

impl WeatherSample {
    fn wind_chill_f(&self) -> f64 {
        units::wind_chill(self.temperature_f, self.wind_speed_mph as f64)
    }
}

const WEATHER_FIELDS: &[FieldDef<WeatherSample>] = &[
    field("outdoor_temp", |w, u| float(u.from_fahrenheit(w.temperature_f))),
    field("outdoor_temp_f", |w, _| float(w.temperature_f)),
    field("outdoor_temp_c", |w, _| float(units::f_to_c(w.temperature_f))),
    field("outdoor_humidity", |w, _| int(w.humidity)),
    field("barometric_pressure_mb", |w, _| int(w.pressure_mb)),
    field("barometric_pressure_inHg", |w, _| float(units::mb_to_inhg(w.pressure_mb as f64))),
    field("dew_point", |w, u| float(u.from_fahrenheit(w.dew_point_f))),
    field("wind_speed", |w, _| int(w.wind_speed_mph)),
    field("wind_bearing", |w, _| int(w.wind_bearing)),
    field("visibility_mi", |w, _| float(w.visibility_mi)),
    field("visibility_km", |w, _| float(units::miles_to_km(w.visibility_mi))),
    field("recommended_max_indoor_humidity", |w, _| {
        int(units::indoor_humidity_recommendation(w.temperature_f))
    }),
    field("wind_chill_f", |w, _| float(w.wind_chill_f())),
    field("wind_chill_c", |w, _| float(units::f_to_c(w.wind_chill_f()))),
    field("condition", |w, _| {
        (!w.condition.is_empty()).then(|| FieldValue::Text(w.condition.clone()))
    }),
];

pub fn weather_record(thermostat: &Thermostat, time: DateTime<Utc>, options: &RecordOptions) -> Result<Record, DecodeError> {
    let current = thermostat.weather.current()?;
    let sample = WeatherSample {
        temperature_f: units::tenths(current.temperature),
        humidity: current.relative_humidity,
        pressure_mb: current.pressure,
        dew_point_f: units::tenths(current.dewpoint),
        wind_speed_mph: current.wind_speed,
        wind_bearing: current.wind_bearing,
        visibility_mi: units::meters_to_miles(current.visibility as f64),
        condition: current.condition.clone(),
    };
    debug!("Weather at {}: {:?}", time, sample);
    Ok(Record {
        measurement: WEATHER_MEASUREMENT,
        category: "weather".to_string(),
        time,
        tags: base_tags(thermostat),
        fields: build_fields(WEATHER_FIELDS, &sample, options),
    })
}

// =====================
// Snapshot
// =====================

/// Decodes every stream of a snapshot up front, so that a malformed snapshot
/// yields an error before anything is published.
pub fn plan(thermostat: &Thermostat, options: &RecordOptions, now: DateTime<Utc>) -> Result<Vec<StreamBatch>, DecodeError> {
    let runtime = StreamBatch {
        stream: Stream::Runtime,
        marker: Marker::Interval(thermostat.extended_runtime.runtime_interval),
        records: runtime_records(thermostat, options)?,
        always_publish: false,
    };

    let sensor_time = parse_timestamp("utcTime", &thermostat.utc_time)?;
    let mut sensor_batch = sensor_records(thermostat, sensor_time, options);
    sensor_batch.extend(air_quality_record(thermostat, sensor_time, options));
    let sensors = StreamBatch {
        stream: Stream::Sensors,
        marker: Marker::Timestamp(sensor_time),
        records: sensor_batch,
        always_publish: false,
    };

    let observed = thermostat.weather.observed_at()?;
    let weather_time = if options.always_current_weather { now } else { observed };
    let weather = StreamBatch {
        stream: Stream::Weather,
        marker: Marker::Timestamp(observed),
        records: vec![weather_record(thermostat, weather_time, options)?],
        always_publish: options.always_current_weather,
    };

    Ok(vec![runtime, sensors, weather])
}
