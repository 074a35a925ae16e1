//! Boundary to the trading protocol that reports live account equity.
//!
//! The dashboard never talks to the chain itself. It asks an [`EquitySource`]
//! for collateral and unrealised PnL and stores the sum.

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{invalid, DashboardError, Result};

const HTTP_TIMEOUT_SECS: u64 = 20;

fn base58_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("base58 regex"))
}

pub fn is_valid_address(raw: &str) -> bool {
    base58_address_re().is_match(raw.trim())
}

fn validated_key(raw: &str, field_name: &str) -> Result<String> {
    let text = raw.trim();
    if !is_valid_address(text) {
        return Err(invalid(format!("{field_name} is not a valid base58 address")));
    }
    Ok(text.to_string())
}

/// Which protocol account to read: an authority wallet plus sub account, or a
/// user account key directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRef {
    pub address: Option<String>,
    pub user_account: Option<String>,
    pub sub_account: u16,
}

impl AccountRef {
    pub fn new(
        address: Option<String>,
        user_account: Option<String>,
        sub_account: u16,
    ) -> Result<Self> {
        let address = address
            .filter(|s| !s.trim().is_empty())
            .map(|s| validated_key(&s, "address"))
            .transpose()?;
        let user_account = user_account
            .filter(|s| !s.trim().is_empty())
            .map(|s| validated_key(&s, "user_account"))
            .transpose()?;
        if address.is_none() && user_account.is_none() {
            return Err(invalid("address or user_account is required"));
        }
        Ok(Self {
            address,
            user_account,
            sub_account,
        })
    }

    pub fn authority(address: &str, sub_account: u16) -> Result<Self> {
        Self::new(Some(address.to_string()), None, sub_account)
    }

    /// Lower-cased key snapshots are stored under.
    pub fn snapshot_key(&self) -> String {
        self.address
            .as_deref()
            .or(self.user_account.as_deref())
            .unwrap_or_default()
            .to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityReading {
    pub settled_usd: f64,
    #[serde(default)]
    pub unsettled_usd: f64,
}

impl EquityReading {
    pub fn equity_usd(&self) -> f64 {
        self.settled_usd + self.unsettled_usd
    }

    fn check_finite(self) -> Result<Self> {
        if self.settled_usd.is_finite() && self.unsettled_usd.is_finite() {
            Ok(self)
        } else {
            Err(DashboardError::Upstream(
                "equity reading is not a finite number".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredAccount {
    pub user_account: Option<String>,
    #[serde(default)]
    pub sub_account_id: u16,
    #[serde(flatten)]
    pub reading: EquityReading,
}

pub trait EquitySource {
    fn fetch_equity(&self, account: &AccountRef) -> Result<EquityReading>;

    /// Every protocol account owned by `address`, with its current reading.
    fn discover_accounts(&self, address: &str) -> Result<Vec<DiscoveredAccount>>;
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<DiscoveredAccount>,
}

/// Blocking JSON client for an equity gateway exposing `GET /equity` and
/// `GET /accounts`.
#[derive(Debug, Clone)]
pub struct HttpEquitySource {
    http: Client,
    base_url: Url,
}

impl HttpEquitySource {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut text = base_url.trim().to_string();
        if !text.ends_with('/') {
            text.push('/');
        }
        let base_url = Url::parse(&text)
            .map_err(|e| DashboardError::Config(format!("invalid equity gateway url {text}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(DashboardError::Config(format!(
                "unsupported equity gateway scheme: {}",
                base_url.scheme()
            )));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| DashboardError::Config(format!("build http client: {e}")))?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| DashboardError::Config(format!("build {path} url: {e}")))
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .map_err(|e| DashboardError::Upstream(format!("GET {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| DashboardError::Upstream(format!("GET {url} returned {e}")))?;
        response
            .json::<T>()
            .map_err(|e| DashboardError::Upstream(format!("GET {url} returned bad json: {e}")))
    }
}

impl EquitySource for HttpEquitySource {
    fn fetch_equity(&self, account: &AccountRef) -> Result<EquityReading> {
        let mut url = self.endpoint("equity")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(address) = &account.address {
                query.append_pair("address", address);
            }
            if let Some(user_account) = &account.user_account {
                query.append_pair("userAccount", user_account);
            }
            query.append_pair("sub", &account.sub_account.to_string());
        }
        self.get_json::<EquityReading>(url)?.check_finite()
    }

    fn discover_accounts(&self, address: &str) -> Result<Vec<DiscoveredAccount>> {
        let mut url = self.endpoint("accounts")?;
        url.query_pairs_mut().append_pair("address", address);
        let response = self.get_json::<AccountsResponse>(url)?;
        response
            .accounts
            .into_iter()
            .map(|item| {
                item.reading.check_finite()?;
                Ok(item)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

    #[test]
    fn base58_addresses_are_validated() {
        assert!(is_valid_address(ADDR));
        assert!(is_valid_address(&format!(" {ADDR} ")));
        assert!(!is_valid_address("0xabc"));
        assert!(!is_valid_address("short"));
        // 0, O, I and l are not in the alphabet.
        assert!(!is_valid_address("0OIl0OIl0OIl0OIl0OIl0OIl0OIl0OIl"));
    }

    #[test]
    fn account_ref_needs_one_valid_key() {
        let err = AccountRef::new(None, Some("  ".to_string()), 0).expect_err("empty");
        assert_eq!(err.category(), "VALIDATION_ERROR");
        assert!(AccountRef::new(Some("not-base58!".to_string()), None, 0).is_err());

        let account = AccountRef::new(None, Some(ADDR.to_string()), 2).expect("user account");
        assert_eq!(account.snapshot_key(), ADDR.to_lowercase());
        assert_eq!(account.sub_account, 2);
    }

    #[test]
    fn readings_sum_to_equity_and_parse_gateway_json() {
        let reading: EquityReading =
            serde_json::from_str(r#"{"settledUsd": 1000.5, "unsettledUsd": -20.25}"#)
                .expect("parse reading");
        assert_eq!(reading.equity_usd(), 980.25);

        let listed: AccountsResponse = serde_json::from_str(
            r#"{"accounts": [{"userAccount": "abc", "subAccountId": 1, "settledUsd": 5.0}]}"#,
        )
        .expect("parse accounts");
        assert_eq!(listed.accounts[0].sub_account_id, 1);
        assert_eq!(listed.accounts[0].reading.unsettled_usd, 0.0);
    }

    #[test]
    fn http_source_normalises_base_url() {
        let source = HttpEquitySource::new("http://127.0.0.1:8787/api").expect("source");
        assert_eq!(
            source.endpoint("equity").expect("url").as_str(),
            "http://127.0.0.1:8787/api/equity"
        );
        let err = HttpEquitySource::new("ftp://example.com").expect_err("scheme");
        assert_eq!(err.category(), "CONFIG_ERROR");
    }
}
