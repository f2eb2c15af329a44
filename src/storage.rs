// ===============================
// src/storage.rs
// ===============================
//
// Order log capability. Orders are never deleted: filled and canceled orders
// stay for profit replay and audit.
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{Order, OrderStatus};
use crate::error::{EngineError, Result};

/// Conjunction of optional predicates; an empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    statuses: Option<Vec<OrderStatus>>,
    pair: Option<String>,
    updated_before_or_equal: Option<DateTime<Utc>>,
}

impl OrderFilter {
    pub fn new() -> Self { Self::default() }

    pub fn with_status(self, status: OrderStatus) -> Self { self.with_status_in(&[status]) }

    pub fn with_status_in(mut self, statuses: &[OrderStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn with_pair(mut self, pair: &str) -> Self {
        self.pair = Some(pair.to_string());
        self
    }

    pub fn with_updated_at_before_or_equal(mut self, t: DateTime<Utc>) -> Self {
        self.updated_before_or_equal = Some(t);
        self
    }

    pub fn matches(&self, o: &Order) -> bool {
        if let Some(st) = &self.statuses {
            if !st.contains(&o.status) {
                return false;
            }
        }
        if let Some(p) = &self.pair {
            if &o.pair != p {
                return false;
            }
        }
        if let Some(t) = self.updated_before_or_equal {
            if o.updated_at > t {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists a new order and assigns its storage id.
    async fn create_order(&self, order: &mut Order) -> Result<()>;
    /// Replaces the stored order with the same storage id.
    async fn update_order(&self, order: &Order) -> Result<()>;
    /// Matching orders in insertion order.
    async fn orders(&self, filter: &OrderFilter) -> Result<Vec<Order>>;
}

#[derive(Default)]
pub struct MemoryStorage {
    orders: RwLock<Vec<Order>>,
}

impl MemoryStorage {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_order(&self, order: &mut Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        order.id = orders.len() as u64 + 1;
        orders.push(order.clone());
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        let slot = orders
            .iter_mut()
            .find(|o| o.id == order.id)
            .ok_or_else(|| EngineError::Storage(format!("order id {} not stored", order.id)))?;
        *slot = order.clone();
        Ok(())
    }

    async fn orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.iter().filter(|o| filter.matches(o)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, Side};
    use chrono::TimeZone;

    fn order(pair: &str, status: OrderStatus, minute: i64) -> Order {
        let t = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Order {
            id: 0,
            exchange_id: minute,
            pair: pair.into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            status,
            quantity: 1.0,
            price: 10.0,
            stop: None,
            group_id: None,
            created_at: t,
            updated_at: t,
            profit: 0.0,
        }
    }

    #[tokio::test]
    async fn assigns_ids_and_filters() {
        let s = MemoryStorage::new();
        let mut a = order("BTCUSDT", OrderStatus::Filled, 1);
        let mut b = order("BTCUSDT", OrderStatus::New, 2);
        let mut c = order("ETHUSDT", OrderStatus::Filled, 3);
        for o in [&mut a, &mut b, &mut c] {
            s.create_order(o).await.unwrap();
        }
        assert_eq!((a.id, b.id, c.id), (1, 2, 3));

        let filled = s.orders(&OrderFilter::new().with_status(OrderStatus::Filled)).await.unwrap();
        assert_eq!(filled.len(), 2);

        let btc_filled = s
            .orders(&OrderFilter::new().with_status(OrderStatus::Filled).with_pair("BTCUSDT"))
            .await
            .unwrap();
        assert_eq!(btc_filled.len(), 1);

        let early = s
            .orders(&OrderFilter::new().with_updated_at_before_or_equal(b.updated_at))
            .await
            .unwrap();
        assert_eq!(early.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1, 2]);

        let pending = s
            .orders(&OrderFilter::new().with_status_in(&OrderStatus::PENDING))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn update_replaces_and_unknown_fails() {
        let s = MemoryStorage::new();
        let mut a = order("BTCUSDT", OrderStatus::New, 1);
        s.create_order(&mut a).await.unwrap();
        a.status = OrderStatus::Filled;
        s.update_order(&a).await.unwrap();
        assert_eq!(s.orders(&OrderFilter::new()).await.unwrap()[0].status, OrderStatus::Filled);

        let mut ghost = a.clone();
        ghost.id = 42;
        assert!(matches!(s.update_order(&ghost).await, Err(EngineError::Storage(_))));
    }
}
