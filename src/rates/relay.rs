use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use crate::error::{OverlayError, Result};
use crate::types::RateSnapshot;

/// The external call that returns current rates for a set of token addresses.
pub trait RateRelay: Send + Sync {
    fn fetch_rates<'a>(&'a self, addresses: &'a [String]) -> BoxFuture<'a, Result<RateSnapshot>>;
}

/// Raw relay body: `{ "result": { addr: { code: number } } }` or `{ "error": "..." }`.
#[derive(Debug, Deserialize)]
struct RelayBody {
    result: Option<HashMap<String, HashMap<String, serde_json::Value>>>,
    error: Option<String>,
}

/// Decodes a relay body. Non-numeric rate values are dropped, anything that is
/// not the expected shape is `Malformed`.
pub fn parse_relay_body(body: &str) -> Result<RateSnapshot> {
    let raw: RelayBody =
        serde_json::from_str(body).map_err(|e| OverlayError::Malformed(e.to_string()))?;
    if let Some(err) = raw.error {
        return Err(OverlayError::Network(format!("relay reported: {err}")));
    }
    let result = raw
        .result
        .ok_or_else(|| OverlayError::Malformed("missing `result` field".to_string()))?;

    let mut snapshot = RateSnapshot::with_capacity(result.len());
    for (address, codes) in result {
        let mut rates = HashMap::with_capacity(codes.len());
        for (code, value) in codes {
            match value.as_f64() {
                Some(v) if v.is_finite() => {
                    rates.insert(code.to_ascii_lowercase(), v);
                }
                _ => debug!(%address, %code, "dropping non-numeric rate"),
            }
        }
        snapshot.insert(address, rates);
    }
    Ok(snapshot)
}

/// Relay reached over HTTP: POST `{"addresses": [...]}` to a single URL.
pub struct HttpRateRelay {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpRateRelay {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OverlayError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, url: url.into(), timeout })
    }

    async fn fetch(&self, addresses: &[String]) -> Result<RateSnapshot> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "addresses": addresses }))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OverlayError::Network(format!("relay answered HTTP {status}")));
        }
        let body = resp.text().await.map_err(|e| self.map_transport(e))?;
        parse_relay_body(&body)
    }

    fn map_transport(&self, e: reqwest::Error) -> OverlayError {
        if e.is_timeout() {
            OverlayError::Timeout(self.timeout.as_millis() as u64)
        } else {
            OverlayError::Network(e.to_string())
        }
    }
}

impl RateRelay for HttpRateRelay {
    fn fetch_rates<'a>(&'a self, addresses: &'a [String]) -> BoxFuture<'a, Result<RateSnapshot>> {
        Box::pin(self.fetch(addresses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_map() {
        let snap = parse_relay_body(r#"{"result": {"A": {"USD": 0.02, "eur": 0.018}, "B": {"usd": 150}}}"#)
            .unwrap();
        assert_eq!(snap["A"]["usd"], 0.02);
        assert_eq!(snap["A"]["eur"], 0.018);
        assert_eq!(snap["B"]["usd"], 150.0);
    }

    #[test]
    fn non_numeric_rates_are_dropped() {
        let snap = parse_relay_body(r#"{"result": {"A": {"usd": "n/a", "eur": 1.5}}}"#).unwrap();
        assert!(!snap["A"].contains_key("usd"));
        assert_eq!(snap["A"]["eur"], 1.5);
    }

    #[test]
    fn wrong_shape_is_malformed() {
        assert!(matches!(parse_relay_body("[1,2]"), Err(OverlayError::Malformed(_))));
        assert!(matches!(parse_relay_body("{}"), Err(OverlayError::Malformed(_))));
        assert!(matches!(parse_relay_body("not json"), Err(OverlayError::Malformed(_))));
    }

    #[test]
    fn relay_error_is_network() {
        let err = parse_relay_body(r#"{"error": "upstream down"}"#).unwrap_err();
        assert!(matches!(err, OverlayError::Network(_)));
    }
}
