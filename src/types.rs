// =============================================================================
// Shared closed-set types for the trading pipeline
// =============================================================================
//
// Event kinds, decisions, order sides and statuses are all closed sets on the
// wire; modeling them as enums instead of raw strings catches a typo'd status
// at the parse boundary instead of three hops downstream.
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => anyhow::bail!("unrecognized order side: {other}"),
        }
    }
}

/// Position side. `None` in one-way mode; `Some(_)` in hedge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            "BOTH" | "" => anyhow::bail!("position side is one-way (none)"),
            other => anyhow::bail!("unrecognized position side: {other}"),
        }
    }
}

/// Order type, including the protective-order family used by the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopMarket,
    TakeProfit,
    TakeProfitMarket,
    TrailingStopMarket,
    /// Anything the venue reports that we don't have a dedicated variant for;
    /// preserved verbatim so cleanup-predicate matching still works.
    Other(String),
}

impl OrderType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Stop => "STOP",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            Self::TrailingStopMarket => "TRAILING_STOP_MARKET",
            Self::Other(s) => s.as_str(),
        }
    }

    /// Protective-order family eligible for the cleanup predicate.
    pub fn is_protective_family(&self) -> bool {
        matches!(
            self,
            Self::Stop
                | Self::TakeProfit
                | Self::StopMarket
                | Self::TakeProfitMarket
                | Self::TrailingStopMarket
                | Self::Limit
        )
    }
}

impl From<&str> for OrderType {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "MARKET" => Self::Market,
            "LIMIT" => Self::Limit,
            "STOP" => Self::Stop,
            "STOP_MARKET" => Self::StopMarket,
            "TAKE_PROFIT" => Self::TakeProfit,
            "TAKE_PROFIT_MARKET" => Self::TakeProfitMarket,
            "TRAILING_STOP_MARKET" => Self::TrailingStopMarket,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order lifecycle status. Terminal variants are {Filled, Canceled, Rejected,
/// Expired} — see [`OrderStatus::is_terminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" | "CANCELLED" => Ok(Self::Canceled),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            other => anyhow::bail!("unrecognized order status: {other}"),
        }
    }
}

/// Advisory direction — a closed set of three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Long,
    Short,
    Flat,
}

impl Decision {
    /// The side an entry order takes for this decision ("flat" has none).
    pub fn entry_side(self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Buy),
            Self::Short => Some(Side::Sell),
            Self::Flat => None,
        }
    }

    pub fn position_side(self) -> Option<PositionSide> {
        match self {
            Self::Long => Some(PositionSide::Long),
            Self::Short => Some(PositionSide::Short),
            Self::Flat => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Long => "long",
            Self::Short => "short",
            Self::Flat => "flat",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            "flat" => Ok(Self::Flat),
            other => anyhow::bail!("invalid decision: {other}"),
        }
    }
}

/// Kind of event flowing through the bounded channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Mark,
    Kline,
    User,
}

/// Which of the three trigger modes the loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Timer,
    Kline,
    Event,
}

impl FromStr for TriggerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timer" => Ok(Self::Timer),
            "kline" => Ok(Self::Kline),
            "event" => Ok(Self::Event),
            other => anyhow::bail!("unrecognized LOOP_TRIGGER: {other}"),
        }
    }
}

/// Deployment environment — selects testnet vs mainnet URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Paper,
    Live,
}

impl FromStr for Env {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paper" | "testnet" | "demo" => Ok(Self::Paper),
            "live" | "mainnet" => Ok(Self::Live),
            other => anyhow::bail!("unrecognized ENV: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips_through_string() {
        assert_eq!(Side::from_str("buy").unwrap(), Side::Buy);
        assert_eq!(Side::from_str("SELL").unwrap(), Side::Sell);
        assert!(Side::from_str("bogus").is_err());
    }

    #[test]
    fn side_opposite_flips() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn order_type_preserves_unknown_variant() {
        let ty = OrderType::from("SOME_FUTURE_TYPE");
        assert_eq!(ty.as_str(), "SOME_FUTURE_TYPE");
        assert!(!ty.is_protective_family());
    }

    #[test]
    fn protective_family_matches_cleanup_predicate_set() {
        for ty in [
            OrderType::Stop,
            OrderType::TakeProfit,
            OrderType::StopMarket,
            OrderType::TakeProfitMarket,
            OrderType::TrailingStopMarket,
            OrderType::Limit,
        ] {
            assert!(ty.is_protective_family());
        }
        assert!(!OrderType::Market.is_protective_family());
    }

    #[test]
    fn order_status_terminal_set_is_exactly_four_variants() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn decision_rejects_anything_outside_the_three_variants() {
        assert_eq!(Decision::from_str("long").unwrap(), Decision::Long);
        assert!(Decision::from_str("hold").is_err());
    }

    #[test]
    fn decision_entry_side_is_none_for_flat() {
        assert_eq!(Decision::Flat.entry_side(), None);
        assert_eq!(Decision::Long.entry_side(), Some(Side::Buy));
        assert_eq!(Decision::Short.entry_side(), Some(Side::Sell));
    }
}
