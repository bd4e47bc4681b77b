// =============================================================================
// Advisor — external reasoning service contract
// =============================================================================
//
// One operation, one envelope shape. Prompt construction and model selection
// are the advisor's own business; this module only owns the wire contract and
// the HTTP transport. `decision` is kept as a raw string rather than parsed
// into `Decision` here -- the Trading Cycle is the one place that validates it
// and turns anything outside {long, short, flat} into `invalid_decision`.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Entry directive: how to open the position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryDirective {
    pub order_type: Option<String>,
    pub price: Option<f64>,
}

/// Position sizing, in contracts or quote value, plus optional leverage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SizeDirective {
    pub contracts: Option<f64>,
    pub quote_value_usdt: Option<f64>,
    pub leverage: Option<f64>,
}

/// Protective stop-loss: trigger price plus whether it watches mark or last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopLossDirective {
    pub price: Option<f64>,
    pub trigger_on: Option<String>,
}

/// One take-profit rung: absolute price and the percent of the filled
/// quantity it closes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub price: Option<f64>,
    pub size_pct: Option<f64>,
}

/// Trailing stop: activation price plus callback percent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrailingStopDirective {
    pub activate_price: Option<f64>,
    pub callback_pct: Option<f64>,
}

/// Everything about the requested position: how to enter, how big, and the
/// reduce-only orders to protect it once filled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionDirective {
    #[serde(default)]
    pub entry: EntryDirective,
    #[serde(default)]
    pub size: SizeDirective,
    pub stop_loss: Option<StopLossDirective>,
    #[serde(default)]
    pub take_profits: Vec<TakeProfitLevel>,
    pub trailing_stop: Option<TrailingStopDirective>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskInfo {
    pub max_loss_usdt: Option<f64>,
}

/// The full advisory envelope. Everything but `decision`
/// is optional -- the advisor is free-form and the cycle tolerates absence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Advice {
    pub decision: Option<String>,
    pub confidence: Option<f64>,
    pub timeframe: Option<String>,
    pub rationale: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub position: PositionDirective,
    #[serde(default)]
    pub risk: RiskInfo,
    #[serde(default)]
    pub invalidations: Vec<serde_json::Value>,
}

/// External reasoning service contract: submit a market snapshot, get back a
/// structured decision. No strategy logic lives on this side of the trait.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn advise(&self, snapshot: &serde_json::Value) -> anyhow::Result<Advice>;
}

/// POSTs the snapshot to a configured HTTP endpoint and parses the JSON
/// response as an [`Advice`] envelope.
pub struct HttpAdvisor {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAdvisor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    #[instrument(skip(self, snapshot), name = "advisor::advise")]
    async fn advise(&self, snapshot: &serde_json::Value) -> anyhow::Result<Advice> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(snapshot)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("advisor request failed: {e}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("advisor response was not JSON: {e}"))?;

        if !status.is_success() {
            anyhow::bail!("advisor returned HTTP {status}: {body}");
        }

        let advice: Advice = serde_json::from_value(body)
            .map_err(|e| anyhow::anyhow!("advisor envelope did not match expected shape: {e}"))?;
        Ok(advice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advice_deserializes_from_minimal_envelope() {
        let json = serde_json::json!({ "decision": "flat", "confidence": 0.9 });
        let advice: Advice = serde_json::from_value(json).unwrap();
        assert_eq!(advice.decision.as_deref(), Some("flat"));
        assert_eq!(advice.position.take_profits.len(), 0);
    }

    #[test]
    fn advice_deserializes_full_envelope() {
        let json = serde_json::json!({
            "decision": "long",
            "confidence": 0.8,
            "timeframe": "1h",
            "rationale": "breakout",
            "position": {
                "entry": {"order_type": "market"},
                "size": {"contracts": 0.1},
                "stop_loss": {"price": 2950.0, "trigger_on": "mark"},
                "take_profits": [
                    {"price": 3050.0, "size_pct": 50.0},
                    {"price": 3100.0, "size_pct": 50.0}
                ],
                "trailing_stop": {"activate_price": 3200.0, "callback_pct": 1.0}
            },
            "risk": {"max_loss_usdt": 50.0},
            "invalidations": ["close below 2900"]
        });
        let advice: Advice = serde_json::from_value(json).unwrap();
        assert_eq!(advice.position.take_profits.len(), 2);
        assert_eq!(advice.position.stop_loss.unwrap().price, Some(2950.0));
        assert_eq!(advice.risk.max_loss_usdt, Some(50.0));
    }

    #[test]
    fn missing_optional_sections_default_to_empty() {
        let json = serde_json::json!({ "decision": "short" });
        let advice: Advice = serde_json::from_value(json).unwrap();
        assert!(advice.position.stop_loss.is_none());
        assert!(advice.position.trailing_stop.is_none());
        assert!(advice.invalidations.is_empty());
    }
}
