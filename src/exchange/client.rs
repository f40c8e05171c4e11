//! Polymarket REST client: Gamma market discovery, resolution and CLOB orders.

use crate::config::PolymarketConfig;
use crate::exchange::traits::{MarketDiscovery, OrderGateway, ResolutionSource};
use crate::exchange::types::*;
use crate::market::{Cohort, Side};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Attempts for idempotent GET requests.
const MAX_GET_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Polymarket API client.
pub struct PolymarketClient {
    http: Client,
    clob_url: String,
    gamma_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    address: String,
}

/// Order body as posted to the CLOB.
#[derive(Serialize)]
struct OrderEnvelope<'a> {
    order: &'a OrderRequest,
    owner: &'a str,
    #[serde(rename = "orderType")]
    order_type: OrderType,
}

impl PolymarketClient {
    /// Create a new client from configuration.
    pub fn new(config: &PolymarketConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            clob_url: config.clob_url.trim_end_matches('/').to_string(),
            gamma_url: config.gamma_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            passphrase: config.passphrase.clone(),
            address: config.address.clone(),
        })
    }

    /// L2 HMAC-SHA256 signature over `timestamp + method + path + body`.
    fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> Result<String> {
        let key = URL_SAFE
            .decode(self.api_secret.as_bytes())
            .context("API secret is not valid base64")?;
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&key).context("Failed to initialise HMAC")?;
        mac.update(format!("{}{}{}{}", timestamp, method, path, body).as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    /// GET with bounded retries and exponential backoff.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .context("Request failed")?
                    .error_for_status()
                    .context("Request returned error status")?;
                response.json::<T>().await.context("Failed to parse response")
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < MAX_GET_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    warn!(url, attempt, delay_ms = delay, error = %e, "GET failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch Gamma markets matching a slug.
    #[instrument(skip(self))]
    pub async fn get_markets_by_slug(&self, slug: &str) -> Result<Vec<GammaMarket>> {
        let url = format!(
            "{}/markets?slug={}",
            self.gamma_url,
            urlencoding::encode(slug)
        );
        self.get_json(&url)
            .await
            .with_context(|| format!("Failed to fetch market {}", slug))
    }

    /// Post a signed order.
    #[instrument(skip(self), fields(token = %order.token_id, size = %order.size, price = %order.price))]
    pub async fn post_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        let path = "/order";
        let body = serde_json::to_string(&OrderEnvelope {
            order,
            owner: &self.api_key,
            order_type: order.order_type,
        })
        .context("Failed to serialize order")?;

        let timestamp = Utc::now().timestamp();
        let signature = self.sign(timestamp, "POST", path, &body)?;

        debug!("Placing order: {:?}", order);

        let response = self
            .http
            .post(format!("{}{}", self.clob_url, path))
            .header("POLY_ADDRESS", &self.address)
            .header("POLY_SIGNATURE", signature)
            .header("POLY_TIMESTAMP", timestamp.to_string())
            .header("POLY_API_KEY", &self.api_key)
            .header("POLY_PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .context("Failed to place order")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read order response")?;

        // Rejections come back as 4xx with the same body shape
        match serde_json::from_str::<OrderResponse>(&text) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Ok(OrderResponse::rejected(&format!(
                "HTTP {}: {}",
                status, text
            ))),
            Err(e) => Err(e).context("Failed to parse order response"),
        }
    }
}

#[async_trait]
impl MarketDiscovery for PolymarketClient {
    async fn fetch_market(
        &self,
        slug: &str,
        asset: &str,
        cohort: Cohort,
        slot_end: DateTime<Utc>,
    ) -> Result<Option<MarketInfo>> {
        let markets = self.get_markets_by_slug(slug).await?;
        let Some(raw) = markets.into_iter().find(|m| m.slug == slug) else {
            return Ok(None);
        };

        let info = raw.to_market_info(asset, cohort, slot_end);
        if info.is_none() {
            warn!(slug, "Market listed without token ids");
        }
        Ok(info)
    }
}

#[async_trait]
impl ResolutionSource for PolymarketClient {
    async fn resolve(&self, label: &str) -> Result<Option<Side>> {
        let markets = self.get_markets_by_slug(label).await?;
        Ok(markets
            .iter()
            .find(|m| m.slug == label)
            .and_then(GammaMarket::winning_side))
    }
}

#[async_trait]
impl OrderGateway for PolymarketClient {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        self.post_order(order).await
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<()> {
        self.http
            .get(format!("{}/", self.clob_url))
            .send()
            .await
            .context("Trading API unreachable")?
            .error_for_status()
            .context("Trading API health check failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> PolymarketClient {
        let config = PolymarketConfig {
            api_key: "key".to_string(),
            api_secret: URL_SAFE.encode(b"secret"),
            passphrase: "pass".to_string(),
            address: "0xabc".to_string(),
            clob_url: server.uri(),
            gamma_url: server.uri(),
            ..PolymarketConfig::default()
        };
        PolymarketClient::new(&config).unwrap()
    }

    fn gamma_body(closed: bool, prices: &str) -> serde_json::Value {
        serde_json::json!([{
            "conditionId": "0xcond",
            "slug": "btc-updown-15m-1768533300",
            "endDate": "2026-01-16T03:30:00Z",
            "clobTokenIds": "[\"111\", \"222\"]",
            "outcomes": "[\"Up\", \"Down\"]",
            "outcomePrices": prices,
            "closed": closed,
            "active": !closed
        }])
    }

    #[tokio::test]
    async fn test_fetch_market_by_slug() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .and(query_param("slug", "btc-updown-15m-1768533300"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(gamma_body(false, "[\"0.51\", \"0.49\"]")),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let info = client
            .fetch_market("btc-updown-15m-1768533300", "btc", Cohort::FifteenMin, Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(info.market.condition_id, "0xcond");
        assert_eq!(info.market.up_token, "111");
        assert_eq!(info.market.expiry.timestamp(), 1_768_534_200);
        assert_eq!(info.down_price, Some(dec!(0.49)));
    }

    #[tokio::test]
    async fn test_unlisted_market_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let info = client
            .fetch_market("eth-updown-1h-1768532400", "eth", Cohort::Hourly, Utc::now())
            .await
            .unwrap();
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn test_get_retries_transient_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(gamma_body(true, "[\"0\", \"1\"]")),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let outcome = client.resolve("btc-updown-15m-1768533300").await.unwrap();
        assert_eq!(outcome, Some(Side::Down));
    }

    #[tokio::test]
    async fn test_unresolved_market() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(gamma_body(false, "[\"0.9\", \"0.1\"]")),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.resolve("btc-updown-15m-1768533300").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_post_order_signs_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order"))
            .and(header_exists("POLY_SIGNATURE"))
            .and(header_exists("POLY_TIMESTAMP"))
            .and(header_exists("POLY_API_KEY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errorMsg": "",
                "orderID": "0x1",
                "status": "matched",
                "makingAmount": "40",
                "takingAmount": "100"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let resp = client
            .submit_order(&OrderRequest::fak_buy("111", dec!(100), dec!(0.41)))
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.taking_amount, Some(dec!(100)));
        assert_eq!(resp.making_amount, Some(dec!(40)));
    }

    #[tokio::test]
    async fn test_post_order_rejection_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order"))
            .respond_with(ResponseTemplate::new(400).set_body_string("not enough balance"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let resp = client
            .submit_order(&OrderRequest::fak_buy("111", dec!(10), dec!(0.5)))
            .await
            .unwrap();
        assert!(!resp.success);
        assert!(resp.error_msg.unwrap().contains("not enough balance"));
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.health_check().await.is_ok());
    }

    #[test]
    fn test_signature_is_deterministic() {
        let config = PolymarketConfig {
            api_secret: URL_SAFE.encode(b"secret"),
            ..PolymarketConfig::default()
        };
        let client = PolymarketClient::new(&config).unwrap();
        let a = client.sign(1_700_000_000, "POST", "/order", "{}").unwrap();
        let b = client.sign(1_700_000_000, "POST", "/order", "{}").unwrap();
        let c = client.sign(1_700_000_001, "POST", "/order", "{}").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
