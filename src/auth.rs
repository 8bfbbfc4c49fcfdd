//! ecobee credential handling.
//!
//! - PIN pairing: request a PIN, the user approves it in the ecobee portal under
//!   "My Apps", then the authorization code is exchanged for tokens.
//! - Tokens are cached as JSON in a file and refreshed with the refresh-token grant
//!   shortly before they expire. ecobee rotates the refresh token on every refresh,
//!   so the cache is rewritten each time.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

const AUTHORIZE_URL: &str = "https://api.ecobee.com/authorize";
const TOKEN_URL: &str = "https://api.ecobee.com/token";
const SCOPE: &str = "smartRead,smartWrite";
const PORTAL_URL: &str = "https://www.ecobee.com/consumerportal";

/// Tokens closer than this to expiry are refreshed before use.
const REFRESH_MARGIN: TimeDelta = TimeDelta::seconds(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expiry: DateTime<Utc>,
}

impl Credentials {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && now + REFRESH_MARGIN < self.expiry
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    #[serde(default)]
    token_type: String,
}

impl TokenResponse {
    fn into_credentials(self, now: DateTime<Utc>) -> Credentials {
        Credentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            expiry: now + TimeDelta::seconds(self.expires_in),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinResponse {
    #[serde(rename = "ecobeePin")]
    pub ecobee_pin: String,
    pub code: String,
}

#[derive(Debug)]
pub struct CredentialStore {
    api_key: String,
    cache_file: PathBuf,
    credentials: Option<Credentials>,
}

fn read_body(resp: &mut http::Response<ureq::Body>) -> String {
    resp.body_mut()
        .read_to_string()
        .unwrap_or_else(|_| String::from("<no body>"))
}

impl CredentialStore {
    /// Reads the cache file; a missing or unreadable cache starts without credentials.
    pub fn load(api_key: impl Into<String>, cache_file: impl Into<PathBuf>) -> Self {
        let cache_file = cache_file.into();
        let credentials = match fs::read_to_string(&cache_file) {
            Ok(s) => match serde_json::from_str::<Credentials>(&s) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("Ignoring unreadable credential cache {}: {}", cache_file.display(), e);
                    None
                }
            },
            Err(e) => {
                debug!("No credential cache at {}: {}", cache_file.display(), e);
                None
            }
        };
        CredentialStore {
            api_key: api_key.into(),
            cache_file,
            credentials,
        }
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    /// A valid access token, refreshing first when it is about to expire.
    pub fn access_token(&mut self, agent: &ureq::Agent) -> Result<String, String> {
        match &self.credentials {
            Some(c) if c.is_fresh(Utc::now()) => return Ok(c.access_token.clone()),
            Some(_) => self.refresh(agent)?,
            None => {
                return Err(format!(
                    "no cached credentials in {}; run with --authorize first",
                    self.cache_file.display()
                ));
            }
        }
        self.credentials
            .as_ref()
            .map(|c| c.access_token.clone())
            .ok_or_else(|| "refresh produced no credentials".to_string())
    }

    pub fn refresh(&mut self, agent: &ureq::Agent) -> Result<(), String> {
        let refresh_token = match &self.credentials {
            Some(c) if !c.refresh_token.is_empty() => c.refresh_token.clone(),
            _ => return Err("no refresh token available; run with --authorize".to_string()),
        };
        debug!("Refreshing ecobee access token");
        let api_key = self.api_key.clone();
        self.request_token(
            agent,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", api_key.as_str()),
            ],
        )
    }

    pub fn request_pin(&self, agent: &ureq::Agent) -> Result<PinResponse, String> {
        let mut resp = agent
            .get(AUTHORIZE_URL)
            .query("response_type", "ecobeePin")
            .query("client_id", &self.api_key)
            .query("scope", SCOPE)
            .call()
            .map_err(|e| format!("PIN request failed: {}", e))?;
        let body = read_body(&mut resp);
        if !resp.status().is_success() {
            return Err(format!("PIN request failed: http {}: {}", resp.status().as_u16(), body));
        }
        serde_json::from_str(&body).map_err(|e| format!("unexpected PIN response: {}", e))
    }

    pub fn exchange_pin(&mut self, agent: &ureq::Agent, code: &str) -> Result<(), String> {
        let api_key = self.api_key.clone();
        self.request_token(
            agent,
            &[
                ("grant_type", "ecobeePin"),
                ("code", code),
                ("client_id", api_key.as_str()),
            ],
        )
    }

    fn request_token(&mut self, agent: &ureq::Agent, params: &[(&str, &str)]) -> Result<(), String> {
        let mut req = agent.post(TOKEN_URL).header("Accept", "application/json");
        for (k, v) in params {
            req = req.query(*k, *v);
        }
        let mut resp = req.send_empty().map_err(|e| format!("token request failed: {}", e))?;
        let body = read_body(&mut resp);
        if !resp.status().is_success() {
            return Err(format!("token request failed: http {}: {}", resp.status().as_u16(), body));
        }
        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| format!("unexpected token response: {}", e))?;
        let credentials = token.into_credentials(Utc::now());
        if !credentials.is_fresh(Utc::now()) {
            return Err("token endpoint returned an already-expired token".to_string());
        }
        self.credentials = Some(credentials);
        self.save()
    }

    pub fn save(&self) -> Result<(), String> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(credentials)
            .map_err(|e| format!("failed to encode credentials: {}", e))?;
        fs::write(&self.cache_file, json)
            .map_err(|e| format!("failed to write credential cache {}: {}", self.cache_file.display(), e))?;
        debug!("Credential cache written to {}", self.cache_file.display());
        Ok(())
    }
}

/// Interactive PIN pairing on the terminal.
pub fn authorize_interactive(store: &mut CredentialStore, agent: &ureq::Agent) -> Result<(), String> {
    let pin = store.request_pin(agent)?;
    println!(
        "PIN is {}\nAuthorize it at {} under 'My Apps', then press <enter>.",
        pin.ecobee_pin, PORTAL_URL
    );
    io::stdout().flush().map_err(|e| format!("stdout: {}", e))?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| format!("failed to read confirmation: {}", e))?;

    store.exchange_pin(agent, &pin.code)?;
    info!("Authorization complete; credentials stored in {}", store.cache_file().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_cache(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ecobee-timescale-{}-{}", name, std::process::id()))
    }

    fn credentials(expiry: DateTime<Utc>) -> Credentials {
        Credentials {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_type: "Bearer".to_string(),
            expiry,
        }
    }

    #[test]
    fn token_response_expiry_is_relative_to_now() {
        let json = r#"{"access_token":"a","token_type":"Bearer","expires_in":3599,"refresh_token":"r","scope":"smartRead"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();
        let c = token.into_credentials(now);
        assert_eq!(c.access_token, "a");
        assert_eq!(c.refresh_token, "r");
        assert_eq!(c.expiry, now + TimeDelta::seconds(3599));
    }

    #[test]
    fn tokens_near_expiry_are_not_fresh() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();
        assert!(credentials(now + TimeDelta::minutes(5)).is_fresh(now));
        assert!(!credentials(now + TimeDelta::seconds(10)).is_fresh(now));
        assert!(!credentials(now - TimeDelta::minutes(1)).is_fresh(now));
    }

    #[test]
    fn cache_round_trips_through_the_file() {
        let path = temp_cache("roundtrip");
        let expiry = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let store = CredentialStore {
            api_key: "key".to_string(),
            cache_file: path.clone(),
            credentials: Some(credentials(expiry)),
        };
        store.save().unwrap();

        let loaded = CredentialStore::load("key", &path);
        assert_eq!(loaded.credentials, Some(credentials(expiry)));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_or_missing_cache_starts_empty() {
        let path = temp_cache("corrupt");
        fs::write(&path, "not json").unwrap();
        assert!(CredentialStore::load("key", &path).credentials.is_none());
        let _ = fs::remove_file(&path);

        assert!(CredentialStore::load("key", temp_cache("missing")).credentials.is_none());
    }

    #[test]
    fn refresh_without_refresh_token_fails_before_any_request() {
        let agent = ureq::Agent::new_with_defaults();
        let mut store = CredentialStore {
            api_key: "key".to_string(),
            cache_file: temp_cache("no-refresh"),
            credentials: Some(Credentials {
                refresh_token: String::new(),
                ..credentials(Utc::now() - TimeDelta::hours(1))
            }),
        };
        let err = store.refresh(&agent).unwrap_err();
        assert!(err.contains("--authorize"), "{}", err);
        assert!(store.access_token(&agent).is_err());
    }

    #[test]
    fn pin_response_uses_ecobee_field_names() {
        let pin: PinResponse = serde_json::from_str(
            r#"{"ecobeePin":"bv29","code":"uiMD3s","scope":"smartWrite","expires_in":9,"interval":5}"#,
        )
        .unwrap();
        assert_eq!(pin.ecobee_pin, "bv29");
        assert_eq!(pin.code, "uiMD3s");
    }
}
