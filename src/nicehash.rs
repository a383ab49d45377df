//! NiceHash pricing: current pay rate per sub-algorithm.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const API_HOST: &str = "https://api2.nicehash.com";
const MULTIALGO_INFO_PATH: &str = "/main/api/v2/public/simplemultialgo/info";

/// Quoted per GH/s per day; we work in H/s.
const PAY_FACTOR: f64 = 1e-9;

/// sub-algorithm (lowercase) -> BTC per (H/s) per day
pub type Payrates = HashMap<String, f64>;

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn payrates(&self) -> Result<Payrates>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiAlgoInfo {
    mining_algorithms: Vec<MiningAlgorithm>,
}

#[derive(Debug, Deserialize)]
struct MiningAlgorithm {
    algorithm: String,
    /// Sent as a decimal string by the live API; numbers are accepted too
    paying: serde_json::Value,
}

pub struct NiceHashApi {
    http: Client,
    host: String,
}

impl NiceHashApi {
    pub fn new() -> Result<Self> {
        Self::with_host(API_HOST)
    }

    pub fn with_host(host: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("hashswitch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            host: host.into(),
        })
    }
}

#[async_trait]
impl PriceSource for NiceHashApi {
    async fn payrates(&self) -> Result<Payrates> {
        let url = format!("{}{}", self.host, MULTIALGO_INFO_PATH);
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("simplemultialgo request")?
            .error_for_status()
            .context("simplemultialgo status")?
            .json()
            .await
            .context("simplemultialgo json")?;
        parse_payrates(body)
    }
}

/// Decode a `simplemultialgo/info` response.
pub fn parse_payrates(body: serde_json::Value) -> Result<Payrates> {
    let info: MultiAlgoInfo =
        serde_json::from_value(body).context("unexpected simplemultialgo response")?;
    info.mining_algorithms
        .into_iter()
        .map(|entry| {
            let paying = match &entry.paying {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .with_context(|| format!("bad paying value for {}: {}", entry.algorithm, entry.paying))?;
            Ok((entry.algorithm.to_lowercase(), paying * PAY_FACTOR))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payrates() {
        let body = json!({
            "miningAlgorithms": [
                {"algorithm": "DAGGERHASHIMOTO", "paying": "0.0123", "title": "DaggerHashimoto"},
                {"algorithm": "CRYPTONIGHTV7", "paying": 2.5},
            ]
        });
        let rates = parse_payrates(body).unwrap();
        assert!((rates["daggerhashimoto"] - 0.0123e-9).abs() < 1e-20);
        assert!((rates["cryptonightv7"] - 2.5e-9).abs() < 1e-20);
        assert_eq!(rates.len(), 2);
    }

    #[test]
    fn test_parse_payrates_rejects_garbage() {
        assert!(parse_payrates(json!({"error": "nope"})).is_err());
        assert!(parse_payrates(json!({
            "miningAlgorithms": [{"algorithm": "X16R", "paying": "abc"}]
        }))
        .is_err());
    }
}
