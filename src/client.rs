//! Blocking HTTP client for the ecobee v1 API (read-only subset).
//!
//! - `ureq` agent with a global per-request timeout.
//! - Requests carry the selection as URL-encoded JSON in the `json` query parameter.
//! - Bearer tokens come from [`CredentialStore`]; on HTTP 401 or the API's
//!   "token expired" status the token is force-refreshed and the request retried once.

use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::time::Duration;

use crate::auth::{self, CredentialStore};
use crate::models::ecobee::*;
use log::{debug, warn};

const THERMOSTAT_URL: &str = "https://api.ecobee.com/1/thermostat";
const THERMOSTAT_SUMMARY_URL: &str = "https://api.ecobee.com/1/thermostatSummary";

/// API status code for an expired access token.
const TOKEN_EXPIRED: i64 = 14;

#[derive(Debug)]
pub enum EcobeeClientError {
    Transport(String),
    Http { status: u16, message: String },
    Json(serde_path_to_error::Error<serde_json::Error>),
    Api { code: i64, message: String },
    Auth(String),
    NotFound(String),
    Decode(DecodeError),
}

impl core::fmt::Display for EcobeeClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EcobeeClientError::Transport(s) => write!(f, "transport error: {}", s),
            EcobeeClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            EcobeeClientError::Json(e) => write!(f, "json error at {}: {}", e.path(), e.inner()),
            EcobeeClientError::Api { code, message } => write!(f, "api error {}: {}", code, message),
            EcobeeClientError::Auth(e) => write!(f, "auth error: {}", e),
            EcobeeClientError::NotFound(e) => write!(f, "not found: {}", e),
            EcobeeClientError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for EcobeeClientError {}

impl From<DecodeError> for EcobeeClientError {
    fn from(value: DecodeError) -> Self {
        EcobeeClientError::Decode(value)
    }
}

/// Where the synchronization engine gets device snapshots from.
pub trait SnapshotSource {
    fn fetch_snapshot(&self, thermostat_id: &str) -> Result<Thermostat, EcobeeClientError>;
}

/// Responses that carry an API-level status block.
trait ApiResponse {
    fn status(&self) -> &Status;
}

impl ApiResponse for ThermostatsResponse {
    fn status(&self) -> &Status {
        &self.status
    }
}

impl ApiResponse for ThermostatSummaryResponse {
    fn status(&self) -> &Status {
        &self.status
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, EcobeeClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(EcobeeClientError::Json)
}

fn envelope_status(body: &str) -> Option<Status> {
    serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.status)
}

/// A response that needs a fresh token before it is worth retrying.
fn is_expired_token(status: u16, body: &str) -> bool {
    status == http::StatusCode::UNAUTHORIZED.as_u16()
        || envelope_status(body).is_some_and(|s| s.code == TOKEN_EXPIRED)
}

pub struct EcobeeClient {
    agent: ureq::Agent,
    credentials: RefCell<CredentialStore>,
}

impl EcobeeClient {
    pub fn new(credentials: CredentialStore, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        EcobeeClient {
            agent: ureq::Agent::new_with_config(config),
            credentials: RefCell::new(credentials),
        }
    }

    /// Obtains a usable access token up front, refreshing an expired one.
    pub fn ensure_token(&self) -> Result<(), EcobeeClientError> {
        self.bearer(false).map(|_| ())
    }

    /// Runs interactive PIN pairing and stores the resulting credentials.
    pub fn authorize(&self) -> Result<(), EcobeeClientError> {
        let mut store = self.credentials.borrow_mut();
        auth::authorize_interactive(&mut store, &self.agent).map_err(EcobeeClientError::Auth)
    }

    fn bearer(&self, force_refresh: bool) -> Result<String, EcobeeClientError> {
        let mut store = self.credentials.borrow_mut();
        if force_refresh {
            store.refresh(&self.agent).map_err(EcobeeClientError::Auth)?;
        }
        store.access_token(&self.agent).map_err(EcobeeClientError::Auth)
    }

    fn send(&self, url: &str, request: &str, token: &str) -> Result<(u16, String), EcobeeClientError> {
        let mut resp = self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json;charset=UTF-8")
            .header("Authorization", &format!("Bearer {}", token))
            .query("json", request)
            .call()
            .map_err(|e| EcobeeClientError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| EcobeeClientError::Transport(format!("reading body failed: {}", e)))?;
        Ok((status, body))
    }

    fn get_json<T>(&self, url: &str, selection: &Selection) -> Result<T, EcobeeClientError>
    where
        T: DeserializeOwned + ApiResponse,
    {
        let request = serde_json::to_string(&SelectionRequest { selection })
            .map_err(|e| EcobeeClientError::Transport(format!("encoding request failed: {}", e)))?;
        debug!("GET {}?json={}", url, request);

        let token = self.bearer(false)?;
        let (mut status, mut body) = self.send(url, &request, &token)?;
        if is_expired_token(status, &body) {
            warn!("ecobee rejected the access token (http {}); refreshing and retrying", status);
            let token = self.bearer(true)?;
            (status, body) = self.send(url, &request, &token)?;
        }

        if !(200..300).contains(&status) {
            return Err(match envelope_status(&body) {
                Some(s) if s.code != 0 => EcobeeClientError::Api {
                    code: s.code,
                    message: s.message,
                },
                _ => EcobeeClientError::Http { status, message: body },
            });
        }

        let parsed: T = decode(&body)?;
        let api_status = parsed.status();
        if api_status.code != 0 {
            return Err(EcobeeClientError::Api {
                code: api_status.code,
                message: api_status.message.clone(),
            });
        }
        Ok(parsed)
    }

    pub fn get_thermostats(&self, selection: &Selection) -> Result<Vec<Thermostat>, EcobeeClientError> {
        let response: ThermostatsResponse = self.get_json(THERMOSTAT_URL, selection)?;
        Ok(response.thermostat_list)
    }

    pub fn get_thermostat(&self, thermostat_id: &str) -> Result<Thermostat, EcobeeClientError> {
        let mut thermostats = self.get_thermostats(&Selection::snapshot(thermostat_id))?;
        if thermostats.len() != 1 {
            return Err(EcobeeClientError::NotFound(format!(
                "got {} thermostats for id {}, wanted 1",
                thermostats.len(),
                thermostat_id
            )));
        }
        Ok(thermostats.remove(0))
    }

    pub fn get_thermostat_summary(&self) -> Result<Vec<ThermostatSummary>, EcobeeClientError> {
        let response: ThermostatSummaryResponse = self.get_json(THERMOSTAT_SUMMARY_URL, &Selection::registered())?;
        Ok(response.summaries()?)
    }
}

impl SnapshotSource for EcobeeClient {
    fn fetch_snapshot(&self, thermostat_id: &str) -> Result<Thermostat, EcobeeClientError> {
        self.get_thermostat(thermostat_id)
    }
}
