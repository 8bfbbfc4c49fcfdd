//! Diesel model structs for the `measurements` hypertable.
//!
//! Tags and fields are stored as JSONB so that equipment-dependent field sets do not
//! need schema changes; `series` distinguishes rows of the same measurement at the
//! same instant (one per remote sensor).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;
use crate::sinks::Record;

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::measurements)]
pub struct NewMeasurement {
    pub time: DateTime<Utc>,
    pub thermostat_id: String,
    pub measurement: String,
    pub series: String,
    pub tags: serde_json::Value,
    pub fields: serde_json::Value,
}

impl NewMeasurement {
    pub fn from_record(thermostat_id: &str, record: &Record) -> Result<Self, serde_json::Error> {
        Ok(NewMeasurement {
            time: record.time,
            thermostat_id: thermostat_id.to_string(),
            measurement: record.measurement.to_string(),
            series: record.category.clone(),
            tags: serde_json::to_value(&record.tags)?,
            fields: serde_json::to_value(&record.fields)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::FieldValue;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn record_maps_to_jsonb_columns() {
        let mut tags = BTreeMap::new();
        tags.insert("thermostat_name", "Hallway".to_string());
        tags.insert("sensor_id", "rs:100".to_string());
        let mut fields = BTreeMap::new();
        fields.insert("temperature", FieldValue::Float(68.8));
        fields.insert("occupied", FieldValue::Bool(false));
        let record = Record {
            measurement: "ecobee_sensor",
            category: "sensor/rs:100".to_string(),
            time: Utc.with_ymd_and_hms(2024, 1, 15, 13, 7, 41).unwrap(),
            tags,
            fields,
        };

        let row = NewMeasurement::from_record("318324702718", &record).unwrap();
        assert_eq!(row.series, "sensor/rs:100");
        assert_eq!(row.measurement, "ecobee_sensor");
        assert_eq!(row.tags, json!({"sensor_id": "rs:100", "thermostat_name": "Hallway"}));
        assert_eq!(row.fields, json!({"occupied": false, "temperature": 68.8}));
    }
}
