//! Type definitions for Polymarket API payloads.

use crate::market::{Cohort, Market, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

// ==================== Market Discovery ====================

/// Market metadata as returned by the Gamma markets endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarket {
    pub condition_id: String,
    pub slug: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// JSON-encoded string array, e.g. `"[\"123\", \"456\"]"`
    #[serde(default)]
    pub clob_token_ids: Option<String>,
    /// JSON-encoded string array, e.g. `"[\"Up\", \"Down\"]"`
    #[serde(default)]
    pub outcomes: Option<String>,
    /// JSON-encoded string array, e.g. `"[\"0.515\", \"0.485\"]"`
    #[serde(default)]
    pub outcome_prices: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub active: bool,
}

/// A discovered market together with its last quoted outcome prices.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub market: Market,
    pub up_price: Option<Decimal>,
    pub down_price: Option<Decimal>,
    pub closed: bool,
}

/// Decode one of Gamma's stringified arrays. Malformed input yields an empty list.
pub fn parse_string_array(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

impl GammaMarket {
    /// Index of each outcome, honouring the venue's outcome labels.
    fn outcome_index(&self, side: Side) -> Option<usize> {
        let outcomes = parse_string_array(self.outcomes.as_deref());
        if outcomes.is_empty() {
            // Up/Down markets list Up first
            return Some(match side {
                Side::Up => 0,
                Side::Down => 1,
            });
        }
        outcomes
            .iter()
            .position(|o| o.parse::<Side>().map(|s| s == side).unwrap_or(false))
    }

    fn outcome_price(&self, side: Side) -> Option<Decimal> {
        let prices = parse_string_array(self.outcome_prices.as_deref());
        let idx = self.outcome_index(side)?;
        prices.get(idx).and_then(|p| Decimal::from_str(p).ok())
    }

    /// Convert to the internal market model.
    ///
    /// Returns `None` when token ids are missing.
    pub fn to_market_info(&self, asset: &str, cohort: Cohort, slot_end: DateTime<Utc>) -> Option<MarketInfo> {
        let tokens = parse_string_array(self.clob_token_ids.as_deref());
        let up_token = tokens.get(self.outcome_index(Side::Up)?)?.clone();
        let down_token = tokens.get(self.outcome_index(Side::Down)?)?.clone();

        let market = Market {
            condition_id: self.condition_id.clone(),
            label: self.slug.clone(),
            asset: asset.to_lowercase(),
            expiry: self.end_date.unwrap_or(slot_end),
            up_token,
            down_token,
            cohort,
        };

        Some(MarketInfo {
            market,
            up_price: self.outcome_price(Side::Up),
            down_price: self.outcome_price(Side::Down),
            closed: self.closed,
        })
    }

    /// Winning side once the market is closed and prices have snapped to 0/1.
    pub fn winning_side(&self) -> Option<Side> {
        if !self.closed {
            return None;
        }
        let up = self.outcome_price(Side::Up)?;
        let down = self.outcome_price(Side::Down)?;
        if up == Decimal::ONE && down == Decimal::ZERO {
            Some(Side::Up)
        } else if down == Decimal::ONE && up == Decimal::ZERO {
            Some(Side::Down)
        } else {
            None
        }
    }
}

// ==================== Orders ====================

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order time-in-force types accepted by the CLOB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Gtc, // Good Till Cancel
    Fok, // Fill or Kill (all or nothing)
    Fak, // Fill and Kill (partial fills allowed)
}

/// New order request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(rename = "tokenID")]
    pub token_id: String,
    pub side: OrderSide,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub order_type: OrderType,
}

impl OrderRequest {
    /// Fill-and-kill buy at a limit price.
    pub fn fak_buy(token_id: &str, size: Decimal, price: Decimal) -> Self {
        Self {
            token_id: token_id.to_string(),
            side: OrderSide::Buy,
            size,
            price,
            order_type: OrderType::Fak,
        }
    }
}

/// One execution against a resting order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradeFill {
    #[serde(deserialize_with = "decimal_from_any")]
    pub price: Decimal,
    #[serde(deserialize_with = "decimal_from_any")]
    pub size: Decimal,
}

/// Order response from the trading API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default, rename = "orderID")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Collateral given up (USDC for a buy)
    #[serde(default, deserialize_with = "opt_decimal_from_any")]
    pub making_amount: Option<Decimal>,
    /// Asset received (shares for a buy)
    #[serde(default, deserialize_with = "opt_decimal_from_any")]
    pub taking_amount: Option<Decimal>,
    /// Per-fill records when the API reports them
    #[serde(default)]
    pub fills: Vec<TradeFill>,
}

impl OrderResponse {
    pub fn rejected(reason: &str) -> Self {
        Self {
            success: false,
            error_msg: Some(reason.to_string()),
            order_id: None,
            status: None,
            making_amount: None,
            taking_amount: None,
            fills: Vec::new(),
        }
    }
}

/// Accepts decimals encoded as JSON strings or numbers.
fn decimal_from_any<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    let raw = Raw::deserialize(deserializer)?;
    let text = match raw {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(serde::de::Error::custom)
}

fn opt_decimal_from_any<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "decimal_from_any")] Decimal);

    let opt: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match opt {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(value) => serde_json::from_value::<Wrapper>(value)
            .map(|w| Some(w.0))
            .map_err(serde::de::Error::custom),
    }
}

// ==================== Market Data Stream ====================

/// Subscription request sent to the market channel.
#[derive(Debug, Serialize)]
pub struct SubscribeMessage {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub msg_type: String,
}

impl SubscribeMessage {
    pub fn market(asset_ids: Vec<String>) -> Self {
        Self {
            assets_ids: asset_ids,
            msg_type: "market".to_string(),
        }
    }
}

/// Price level as received from the stream (strings, not decimals).
#[derive(Debug, Clone, Deserialize)]
pub struct WsPriceLevel {
    pub price: String,
    pub size: String,
}

/// Full book snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct WsBookMessage {
    pub asset_id: String,
    #[serde(default, alias = "sells")]
    pub asks: Vec<WsPriceLevel>,
    #[serde(default, alias = "buys")]
    pub bids: Vec<WsPriceLevel>,
}

/// One top-of-book change.
#[derive(Debug, Clone, Deserialize)]
pub struct WsPriceChange {
    pub asset_id: String,
    pub price: String,
    pub size: String,
    pub side: OrderSide,
}

/// Batch of top-of-book changes.
#[derive(Debug, Clone, Deserialize)]
pub struct WsPriceChangeMessage {
    #[serde(default)]
    pub price_changes: Vec<WsPriceChange>,
}

/// Messages received on the market channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event_type")]
pub enum WsMessage {
    #[serde(rename = "book")]
    Book(WsBookMessage),
    #[serde(rename = "price_change")]
    PriceChange(WsPriceChangeMessage),
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn gamma(closed: bool, prices: &str) -> GammaMarket {
        GammaMarket {
            condition_id: "0xabc".to_string(),
            slug: "btc-updown-15m-1768533300".to_string(),
            question: None,
            end_date: None,
            clob_token_ids: Some(r#"["111", "222"]"#.to_string()),
            outcomes: Some(r#"["Up", "Down"]"#.to_string()),
            outcome_prices: Some(prices.to_string()),
            closed,
            active: !closed,
        }
    }

    #[test]
    fn test_gamma_market_conversion() {
        let slot_end = Utc.timestamp_opt(1_768_534_200, 0).unwrap();
        let info = gamma(false, r#"["0.52", "0.48"]"#)
            .to_market_info("BTC", Cohort::FifteenMin, slot_end)
            .unwrap();

        assert_eq!(info.market.asset, "btc");
        assert_eq!(info.market.up_token, "111");
        assert_eq!(info.market.down_token, "222");
        assert_eq!(info.market.expiry, slot_end);
        assert_eq!(info.up_price, Some(dec!(0.52)));
        assert_eq!(info.down_price, Some(dec!(0.48)));
    }

    #[test]
    fn test_gamma_outcome_order_is_respected() {
        let mut m = gamma(false, r#"["0.3", "0.7"]"#);
        m.outcomes = Some(r#"["Down", "Up"]"#.to_string());
        let info = m
            .to_market_info("eth", Cohort::Hourly, Utc::now())
            .unwrap();
        assert_eq!(info.market.up_token, "222");
        assert_eq!(info.up_price, Some(dec!(0.7)));
    }

    #[test]
    fn test_gamma_missing_tokens() {
        let mut m = gamma(false, "[]");
        m.clob_token_ids = None;
        assert!(m.to_market_info("btc", Cohort::FifteenMin, Utc::now()).is_none());
    }

    #[test]
    fn test_winning_side() {
        assert_eq!(gamma(true, r#"["0", "1"]"#).winning_side(), Some(Side::Down));
        assert_eq!(gamma(true, r#"["1", "0"]"#).winning_side(), Some(Side::Up));
        assert_eq!(gamma(false, r#"["1", "0"]"#).winning_side(), None);
        assert_eq!(gamma(true, r#"["0.5", "0.5"]"#).winning_side(), None);
    }

    #[test]
    fn test_order_response_parsing() {
        let json = r#"{
            "success": true,
            "errorMsg": "",
            "orderID": "0x1",
            "status": "matched",
            "makingAmount": "12.6",
            "takingAmount": 30
        }"#;
        let resp: OrderResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        assert_eq!(resp.making_amount, Some(dec!(12.6)));
        assert_eq!(resp.taking_amount, Some(dec!(30)));
        assert!(resp.fills.is_empty());
    }

    #[test]
    fn test_order_request_serialization() {
        let req = OrderRequest::fak_buy("111", dec!(30), dec!(0.31));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["tokenID"], "111");
        assert_eq!(json["side"], "BUY");
        assert_eq!(json["size"], "30");
        assert_eq!(json["orderType"], "FAK");
    }
}
