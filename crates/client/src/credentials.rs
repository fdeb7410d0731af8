//! Credential profiles, session cookies and the installation id.
//!
//! Layout in the key-value store:
//! - `auth-<friendlyName>`: profile as JSON
//! - `cookie_<server>_<friendlyName>`: `{server, name, cookie}`
//! - `client-id`: UUID generated on first use

use std::sync::Arc;

use protocol::{CredentialProfile, Exchange, DEFAULT_PROFILE_NAME};
use serde::{Deserialize, Serialize};

use crate::storage::{KeyValueStore, StorageResult};

const AUTH_PREFIX: &str = "auth-";
const COOKIE_PREFIX: &str = "cookie_";
const CLIENT_ID_KEY: &str = "client-id";

/// Session cookie record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub server: String,
    pub name: String,
    pub cookie: String,
}

fn auth_key(name: &str) -> String {
    format!("{AUTH_PREFIX}{name}")
}

fn cookie_key(server: &str, name: &str) -> String {
    format!("{COOKIE_PREFIX}{server}_{name}")
}

/// Persisted credential profiles.
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Finds a profile.
    ///
    /// With a name only that profile can match. Without one, `"default"` wins,
    /// then the first stored profile by key order. An exchange filter is
    /// applied in both cases.
    pub fn resolve(
        &self,
        exchange: Option<Exchange>,
        name: Option<&str>,
    ) -> StorageResult<Option<CredentialProfile>> {
        let accepts = |p: &CredentialProfile| exchange.map_or(true, |ex| p.exchange == ex);

        if let Some(name) = name {
            return Ok(self.load(name)?.filter(|p| accepts(p)));
        }

        if let Some(profile) = self.load(DEFAULT_PROFILE_NAME)?.filter(|p| accepts(p)) {
            return Ok(Some(profile));
        }

        Ok(self.list()?.into_iter().find(|p| accepts(p)))
    }

    fn load(&self, name: &str) -> StorageResult<Option<CredentialProfile>> {
        match self.kv.get(&auth_key(name))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every stored profile, ordered by friendly name.
    pub fn list(&self) -> StorageResult<Vec<CredentialProfile>> {
        let mut profiles = Vec::new();
        for (key, json) in self.kv.filter(AUTH_PREFIX, &|_, _| true)? {
            match serde_json::from_str::<CredentialProfile>(&json) {
                Ok(profile) => profiles.push(profile),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable profile"),
            }
        }
        Ok(profiles)
    }

    /// Stores or overwrites the profile under its friendly name.
    pub fn save(&self, profile: &CredentialProfile) -> StorageResult<()> {
        let json = serde_json::to_string(profile)?;
        self.kv.set(&auth_key(&profile.friendly_name), &json)?;
        tracing::debug!(name = %profile.friendly_name, exchange = %profile.exchange, "profile saved");
        Ok(())
    }

    /// Deletes the profile and all of its session cookies.
    pub fn forget(&self, name: &str) -> StorageResult<()> {
        self.kv.delete(&auth_key(name))?;
        self.clear_cookies(name)?;
        Ok(())
    }

    pub fn cookie(&self, server: &str, name: &str) -> StorageResult<Option<String>> {
        match self.kv.get(&cookie_key(server, name))? {
            Some(json) => {
                let record: SessionCookie = serde_json::from_str(&json)?;
                Ok(Some(record.cookie))
            }
            None => Ok(None),
        }
    }

    pub fn set_cookie(&self, server: &str, name: &str, cookie: &str) -> StorageResult<()> {
        let record = SessionCookie {
            server: server.to_string(),
            name: name.to_string(),
            cookie: cookie.to_string(),
        };
        self.kv
            .set(&cookie_key(server, name), &serde_json::to_string(&record)?)
    }

    /// Removes every cookie recorded for `name`, whatever the server.
    pub fn clear_cookies(&self, name: &str) -> StorageResult<usize> {
        let matches = self.kv.filter(COOKIE_PREFIX, &|_, json| {
            serde_json::from_str::<SessionCookie>(json).is_ok_and(|c| c.name == name)
        })?;
        for (key, _) in &matches {
            self.kv.delete(key)?;
        }
        Ok(matches.len())
    }

    /// Stable installation id, created on first call.
    pub fn client_id(&self) -> StorageResult<String> {
        if let Some(id) = self.kv.get(CLIENT_ID_KEY)? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.kv.set(CLIENT_ID_KEY, &id)?;
        tracing::info!(client_id = %id, "generated client id");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryStore::new()))
    }

    fn profile(exchange: Exchange, name: &str) -> CredentialProfile {
        CredentialProfile::new(exchange, format!("key-{name}"), "secret", name)
    }

    #[test]
    fn test_resolve_prefers_default() {
        let creds = store();
        creds.save(&profile(Exchange::Binance, "alpha")).unwrap();
        creds.save(&profile(Exchange::Binance, "default")).unwrap();

        let resolved = creds.resolve(None, None).unwrap().unwrap();
        assert_eq!(resolved.friendly_name, "default");
    }

    #[test]
    fn test_resolve_falls_back_to_first_profile() {
        let creds = store();
        creds.save(&profile(Exchange::Ftx, "zulu")).unwrap();
        creds.save(&profile(Exchange::Binance, "bravo")).unwrap();

        let resolved = creds.resolve(None, None).unwrap().unwrap();
        assert_eq!(resolved.friendly_name, "bravo");
    }

    #[test]
    fn test_resolve_by_exchange_never_crosses_exchanges() {
        let creds = store();
        creds.save(&profile(Exchange::Binance, "default")).unwrap();
        creds.save(&profile(Exchange::Binance, "bravo")).unwrap();
        creds.save(&profile(Exchange::Ftx, "zulu")).unwrap();

        let ftx = creds.resolve(Some(Exchange::Ftx), None).unwrap().unwrap();
        assert_eq!(ftx.exchange, Exchange::Ftx);

        assert!(creds
            .resolve(Some(Exchange::BinanceSpot), None)
            .unwrap()
            .is_none());
        assert!(creds
            .resolve(Some(Exchange::Ftx), Some("default"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_resolve_by_name() {
        let creds = store();
        creds.save(&profile(Exchange::Binance, "main")).unwrap();

        assert!(creds.resolve(None, Some("main")).unwrap().is_some());
        assert!(creds.resolve(None, Some("other")).unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_same_name() {
        let creds = store();
        creds.save(&profile(Exchange::Binance, "main")).unwrap();
        creds.save(&profile(Exchange::Ftx, "main")).unwrap();

        let profiles = creds.list().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].exchange, Exchange::Ftx);
    }

    #[test]
    fn test_forget_removes_profile_and_cookies() {
        let creds = store();
        creds.save(&profile(Exchange::Binance, "main")).unwrap();
        creds.set_cookie("wss://a", "main", "sid=1").unwrap();
        creds.set_cookie("wss://b", "main", "sid=2").unwrap();
        creds.set_cookie("wss://a", "other", "sid=3").unwrap();

        creds.forget("main").unwrap();

        assert!(creds.resolve(None, Some("main")).unwrap().is_none());
        assert_eq!(creds.cookie("wss://a", "main").unwrap(), None);
        assert_eq!(creds.cookie("wss://b", "main").unwrap(), None);
        assert_eq!(
            creds.cookie("wss://a", "other").unwrap(),
            Some("sid=3".to_string())
        );
    }

    #[test]
    fn test_client_id_is_stable() {
        let creds = store();
        let first = creds.client_id().unwrap();
        let second = creds.client_id().unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }
}
