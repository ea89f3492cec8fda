use crate::error::{OverlayError, Result};
use crate::types::{ConversionKind, ConversionSpec, RateSnapshot};

/// Bridge currency for token-to-token conversion.
const BRIDGE: &str = "usd";

/// A rounded conversion result ready for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Converted {
    pub key: &'static str,
    pub symbol: &'static str,
    /// Already rounded to 2 decimals.
    pub value: f64,
}

impl Converted {
    pub fn display(&self) -> String {
        format!("{:.2}", self.value)
    }
}

/// Balance text as shown by the host. Thousands separators and whitespace are
/// ignored; anything else unparsable counts as 0.
pub fn parse_numeric(text: &str) -> f64 {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn rate(snapshot: &RateSnapshot, address: &str, code: &str) -> Option<f64> {
    snapshot.get(address)?.get(code).copied().filter(|r| r.is_finite())
}

pub fn fiat_value(snapshot: &RateSnapshot, base: &str, fiat: &str, balance: f64) -> Result<f64> {
    let r = rate(snapshot, base, fiat)
        .ok_or_else(|| OverlayError::RatesUnavailable(format!("{fiat} rate of base token")))?;
    Ok(balance * r)
}

/// USD-bridged cross rate: `balance * base.usd / target.usd`.
pub fn token_value(snapshot: &RateSnapshot, base: &str, target: &str, balance: f64) -> Result<f64> {
    let numerator = rate(snapshot, base, BRIDGE)
        .ok_or_else(|| OverlayError::RatesUnavailable("usd rate of base token".to_string()))?;
    let denominator = rate(snapshot, target, BRIDGE)
        .filter(|d| *d != 0.0)
        .ok_or_else(|| OverlayError::RatesUnavailable(format!("usd rate of {target}")))?;
    Ok(balance * (numerator / denominator))
}

pub fn convert(
    snapshot: &RateSnapshot,
    base: &str,
    spec: &'static ConversionSpec,
    balance_text: &str,
) -> Result<Converted> {
    let balance = parse_numeric(balance_text);
    let raw = match (spec.kind, spec.token_address) {
        (ConversionKind::Fiat, _) => fiat_value(snapshot, base, spec.key, balance)?,
        (ConversionKind::Token, Some(address)) => token_value(snapshot, base, address, balance)?,
        (ConversionKind::Token, None) => {
            return Err(OverlayError::InvalidConversion(spec.key.to_string()));
        }
    };
    Ok(Converted { key: spec.key, symbol: spec.symbol, value: round2(raw) })
}
