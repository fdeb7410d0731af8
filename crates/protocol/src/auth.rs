//! Credential profiles and the exchanges they authenticate against.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Friendly name used when the user does not pick one.
pub const DEFAULT_PROFILE_NAME: &str = "default";

/// Returned when an exchange label is not one of the supported venues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported exchange '{0}', expected one of: binance, binance-spot, ftx")]
pub struct UnknownExchange(pub String);

/// Supported trading venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Exchange {
    /// Binance USDⓈ-M futures.
    Binance,
    /// Binance spot.
    BinanceSpot,
    /// FTX.
    Ftx,
}

/// Exchange-specific field collected during an interactive login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraField {
    /// Optional sub-account name.
    SubAccount,
}

impl Exchange {
    /// Every supported exchange, in menu order.
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::BinanceSpot, Exchange::Ftx];

    /// Wire and storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::BinanceSpot => "binance-spot",
            Exchange::Ftx => "ftx",
        }
    }

    /// The extra credential field this exchange asks for, if any.
    pub fn extra_field(&self) -> Option<ExtraField> {
        match self {
            Exchange::Ftx => Some(ExtraField::SubAccount),
            Exchange::Binance | Exchange::BinanceSpot => None,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Exchange::ALL
            .into_iter()
            .find(|exchange| exchange.as_str() == wanted)
            .ok_or_else(|| UnknownExchange(s.trim().to_string()))
    }
}

/// One exchange account the server can trade on behalf of.
///
/// Profiles are immutable; logging in again under the same friendly name
/// replaces the stored profile.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProfile {
    pub exchange: Exchange,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_account: Option<String>,
    #[serde(default = "default_friendly_name")]
    pub friendly_name: String,
}

fn default_friendly_name() -> String {
    DEFAULT_PROFILE_NAME.to_string()
}

impl CredentialProfile {
    /// Creates a profile without passphrase or sub-account.
    pub fn new(
        exchange: Exchange,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        friendly_name: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
            sub_account: None,
            friendly_name: friendly_name.into(),
        }
    }

    /// Sets the sub-account; empty strings mean "none".
    pub fn with_sub_account(mut self, sub_account: impl Into<String>) -> Self {
        let sub_account = sub_account.into();
        self.sub_account = (!sub_account.is_empty()).then_some(sub_account);
        self
    }

    /// Sets the API passphrase.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

// Secrets stay out of logs.
impl fmt::Debug for CredentialProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProfile")
            .field("exchange", &self.exchange)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("sub_account", &self.sub_account)
            .field("friendly_name", &self.friendly_name)
            .finish()
    }
}
