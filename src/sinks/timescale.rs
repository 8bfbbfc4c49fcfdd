//! TimescaleDB sink: one row per record in the `measurements` hypertable.

use crate::db::models::NewMeasurement;
use crate::retry::Attempt;
use crate::schema;
use crate::sinks::{Record, SinkError, TimeSeriesSink};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{debug, info, warn};
use std::sync::Mutex;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub struct TimescaleSink {
    database_url: String,
    thermostat_id: String,
    /// `None` after a failed write; the next attempt reconnects.
    conn: Mutex<Option<PgConnection>>,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

/// Caps every statement on this connection at the attempt's remaining budget.
fn bound_statements(conn: &mut PgConnection, budget: Duration) -> QueryResult<()> {
    let millis = budget.as_millis().max(1);
    diesel::sql_query(format!("SET statement_timeout = {}", millis))
        .execute(conn)
        .map(|_| ())
}

/// Adds a libpq `connect_timeout` of `budget` (whole seconds, libpq's minimum of
/// 2) unless the URL already sets one.
fn with_connect_timeout(database_url: &str, budget: Duration) -> String {
    if database_url.contains("connect_timeout=") {
        return database_url.to_string();
    }
    let secs = budget.as_secs_f64().ceil().max(2.0) as u64;
    if !database_url.contains("://") {
        format!("{} connect_timeout={}", database_url, secs)
    } else if database_url.contains('?') {
        format!("{}&connect_timeout={}", database_url, secs)
    } else {
        format!("{}?connect_timeout={}", database_url, secs)
    }
}

impl TimescaleSink {
    /// Connects and migrates; failure here is a startup precondition failure.
    pub fn connect(database_url: &str, thermostat_id: &str) -> Result<Self, String> {
        let mut conn =
            PgConnection::establish(database_url).map_err(|e| format!("DB connection failed: {}", e))?;
        info!("Connected to database");
        apply_database_migrations(&mut conn)?;

        Ok(TimescaleSink {
            database_url: database_url.to_string(),
            thermostat_id: thermostat_id.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    fn insert(&self, conn: &mut PgConnection, points: &[Record], attempt: Attempt) -> Result<usize, SinkError> {
        use schema::measurements::dsl as M;

        let rows = points
            .iter()
            .map(|p| NewMeasurement::from_record(&self.thermostat_id, p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SinkError::Write(format!("encode rows failed: {}", e)))?;

        if attempt.expired() {
            return Err(SinkError::Timeout("attempt budget spent before insert".to_string()));
        }
        bound_statements(conn, attempt.remaining())
            .map_err(|e| SinkError::Connection(format!("set statement_timeout failed: {}", e)))?;

        diesel::insert_into(M::measurements)
            .values(&rows)
            .on_conflict((M::time, M::thermostat_id, M::measurement, M::series))
            .do_nothing()
            .execute(conn)
            .map_err(|e| SinkError::Write(format!("insert measurement rows failed: {}", e)))
    }
}

impl TimeSeriesSink for TimescaleSink {
    fn name(&self) -> &str {
        "timescale"
    }

    fn write_points(&self, points: &[Record], attempt: Attempt) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut guard = self
            .conn
            .lock()
            .map_err(|_| SinkError::Connection("connection mutex poisoned".to_string()))?;

        if guard.is_none() {
            debug!("Reconnecting to database");
            let url = with_connect_timeout(&self.database_url, attempt.remaining());
            let conn = PgConnection::establish(&url)
                .map_err(|e| SinkError::Connection(format!("DB connection failed: {}", e)))?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(SinkError::Connection("no database connection".to_string()));
        };

        match self.insert(conn, points, attempt) {
            Ok(inserted) => {
                // duplicates of an earlier cycle re-run are skipped by the conflict clause
                debug!("Inserted {} of {} measurement row(s)", inserted, points.len());
                Ok(())
            }
            Err(e) => {
                warn!("Dropping database connection after failed write");
                *guard = None;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_url_carries_the_attempt_budget() {
        let budget = Duration::from_millis(2500);
        assert_eq!(
            with_connect_timeout("postgres://u:p@db:5432/ecobee", budget),
            "postgres://u:p@db:5432/ecobee?connect_timeout=3"
        );
        assert_eq!(
            with_connect_timeout("postgres://db/ecobee?sslmode=disable", budget),
            "postgres://db/ecobee?sslmode=disable&connect_timeout=3"
        );
        assert_eq!(
            with_connect_timeout("host=db dbname=ecobee", Duration::from_millis(100)),
            "host=db dbname=ecobee connect_timeout=2"
        );
        assert_eq!(
            with_connect_timeout("postgres://db/ecobee?connect_timeout=10", budget),
            "postgres://db/ecobee?connect_timeout=10"
        );
    }
}
