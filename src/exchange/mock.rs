//! Paper trading venue that fills orders against the mirrored book.

use super::traits::OrderGateway;
use super::types::*;
use crate::market::QuoteBook;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Depth already taken from one quote, so back-to-back orders in the same
/// tick cannot both consume the full top of book.
#[derive(Debug, Clone)]
struct ConsumedDepth {
    quote_at: DateTime<Utc>,
    shares: Decimal,
}

/// Simulated account state.
#[derive(Debug, Clone)]
pub struct PaperAccount {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub order_count: u64,
    pub fill_count: u64,
    pub total_spent: Decimal,
}

impl Default for PaperAccount {
    fn default() -> Self {
        Self {
            initial_balance: dec!(1000),
            balance: dec!(1000),
            order_count: 0,
            fill_count: 0,
            total_spent: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct VenueState {
    account: PaperAccount,
    consumed: HashMap<String, ConsumedDepth>,
}

/// Fill-and-kill order simulator backed by live quotes.
pub struct MockVenue {
    book: Arc<QuoteBook>,
    state: RwLock<VenueState>,
    order_id_counter: AtomicU64,
}

impl MockVenue {
    pub fn new(book: Arc<QuoteBook>, initial_balance: Decimal) -> Self {
        let account = PaperAccount {
            initial_balance,
            balance: initial_balance,
            ..PaperAccount::default()
        };

        Self {
            book,
            state: RwLock::new(VenueState {
                account,
                consumed: HashMap::new(),
            }),
            order_id_counter: AtomicU64::new(1),
        }
    }

    pub async fn account(&self) -> PaperAccount {
        self.state.read().await.account.clone()
    }

    /// Add settlement proceeds to the paper balance.
    pub async fn credit(&self, amount: Decimal) {
        if amount > Decimal::ZERO {
            self.state.write().await.account.balance += amount;
        }
    }

    /// Forget consumed depth for tokens of markets that rolled away.
    pub async fn retain_tokens(&self, keep: &[String]) {
        let mut state = self.state.write().await;
        let before = state.consumed.len();
        state.consumed.retain(|token, _| keep.contains(token));
        let removed = before - state.consumed.len();
        if removed > 0 {
            debug!(removed, "Dropped consumed depth for retired tokens");
        }
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    async fn fill(&self, order: &OrderRequest) -> OrderResponse {
        if order.side != OrderSide::Buy {
            return OrderResponse::rejected("paper venue only supports buys");
        }

        let Some(quote) = self.book.read(&order.token_id) else {
            return OrderResponse::rejected("no fresh quote");
        };

        let mut state = self.state.write().await;
        state.account.order_count += 1;
        let order_id = self.next_order_id();

        // Depth taken from this exact quote by earlier orders
        let already = state
            .consumed
            .get(&order.token_id)
            .filter(|c| c.quote_at == quote.updated_at)
            .map(|c| c.shares)
            .unwrap_or(Decimal::ZERO);
        let available = (quote.ask_size - already).max(Decimal::ZERO);

        let crosses = quote.has_ask() && quote.best_ask <= order.price;
        let mut shares = if crosses {
            order.size.min(available)
        } else {
            Decimal::ZERO
        };
        if order.order_type == OrderType::Fok && shares < order.size {
            shares = Decimal::ZERO;
        }

        let cost = shares * quote.best_ask;
        if cost > state.account.balance {
            return OrderResponse::rejected("not enough balance");
        }

        if shares == Decimal::ZERO {
            debug!(
                order_id = %order_id,
                token = %order.token_id,
                ask = %quote.best_ask,
                limit = %order.price,
                "Paper order killed without fill"
            );
            return OrderResponse {
                success: true,
                error_msg: None,
                order_id: Some(order_id),
                status: Some("unmatched".to_string()),
                making_amount: Some(Decimal::ZERO),
                taking_amount: Some(Decimal::ZERO),
                fills: Vec::new(),
            };
        }

        state.account.balance -= cost;
        state.account.total_spent += cost;
        state.account.fill_count += 1;
        state.consumed.insert(
            order.token_id.clone(),
            ConsumedDepth {
                quote_at: quote.updated_at,
                shares: already + shares,
            },
        );

        info!(
            order_id = %order_id,
            token = %order.token_id,
            shares = %shares,
            price = %quote.best_ask,
            cost = %cost,
            "Paper order filled"
        );

        OrderResponse {
            success: true,
            error_msg: None,
            order_id: Some(order_id),
            status: Some("matched".to_string()),
            making_amount: Some(cost),
            taking_amount: Some(shares),
            fills: vec![TradeFill {
                price: quote.best_ask,
                size: shares,
            }],
        }
    }
}

#[async_trait]
impl OrderGateway for MockVenue {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        Ok(self.fill(order).await)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::PriceLevel;

    fn venue_with_ask(price: Decimal, size: Decimal) -> MockVenue {
        let book = Arc::new(QuoteBook::default());
        book.apply_snapshot("up", &[PriceLevel::new(price, size)], &[]);
        MockVenue::new(book, dec!(1000))
    }

    #[tokio::test]
    async fn test_fills_up_to_depth() {
        let venue = venue_with_ask(dec!(0.40), dec!(50));
        let resp = venue
            .submit_order(&OrderRequest::fak_buy("up", dec!(80), dec!(0.41)))
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.taking_amount, Some(dec!(50)));
        assert_eq!(resp.making_amount, Some(dec!(20)));
        assert_eq!(resp.fills.len(), 1);

        let account = venue.account().await;
        assert_eq!(account.balance, dec!(980));
        assert_eq!(account.fill_count, 1);
    }

    #[tokio::test]
    async fn test_depth_is_consumed_within_one_quote() {
        let venue = venue_with_ask(dec!(0.40), dec!(50));
        let order = OrderRequest::fak_buy("up", dec!(30), dec!(0.41));

        let first = venue.submit_order(&order).await.unwrap();
        let second = venue.submit_order(&order).await.unwrap();

        assert_eq!(first.taking_amount, Some(dec!(30)));
        assert_eq!(second.taking_amount, Some(dec!(20)));
    }

    #[tokio::test]
    async fn test_retired_tokens_are_pruned() {
        let venue = venue_with_ask(dec!(0.40), dec!(50));
        venue
            .submit_order(&OrderRequest::fak_buy("up", dec!(10), dec!(0.41)))
            .await
            .unwrap();
        assert_eq!(venue.state.read().await.consumed.len(), 1);

        venue.retain_tokens(&["up".to_string()]).await;
        assert_eq!(venue.state.read().await.consumed.len(), 1);
        venue.retain_tokens(&["next-up".to_string()]).await;
        assert_eq!(venue.state.read().await.consumed.len(), 0);
    }

    #[tokio::test]
    async fn test_limit_below_ask_kills_order() {
        let venue = venue_with_ask(dec!(0.40), dec!(50));
        let resp = venue
            .submit_order(&OrderRequest::fak_buy("up", dec!(10), dec!(0.39)))
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.taking_amount, Some(Decimal::ZERO));
        assert!(resp.fills.is_empty());
    }

    #[tokio::test]
    async fn test_missing_quote_is_rejected() {
        let venue = MockVenue::new(Arc::new(QuoteBook::default()), dec!(1000));
        let resp = venue
            .submit_order(&OrderRequest::fak_buy("none", dec!(10), dec!(0.5)))
            .await
            .unwrap();
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let book = Arc::new(QuoteBook::default());
        book.apply_snapshot("up", &[PriceLevel::new(dec!(0.50), dec!(100))], &[]);
        let venue = MockVenue::new(book, dec!(10));

        let resp = venue
            .submit_order(&OrderRequest::fak_buy("up", dec!(100), dec!(0.5)))
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(venue.account().await.balance, dec!(10));

        venue.credit(dec!(5)).await;
        assert_eq!(venue.account().await.balance, dec!(15));
    }
}
