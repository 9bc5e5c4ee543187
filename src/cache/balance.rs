//! The balance aggregate and its cache wiring.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AggregateCache;
use crate::client::{ApiClient, ApiRequest};
use crate::session::storage::Storage;

const BALANCE_CACHE_KEY: &str = "cache.balance";
const BALANCE_PATH: &str = "/reports/balance";

/// Derived balance figure across all wallets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSummary {
    pub total: Decimal,
    pub currency: String,
    #[serde(default)]
    pub wallets: Vec<WalletBalance>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub wallet_id: String,
    pub name: String,
    pub balance: Decimal,
}

impl ApiClient {
    /// A stale-while-revalidate cache over `GET /reports/balance`.
    ///
    /// The cache talks to the pipeline only through the injected fetch
    /// closure, so tests can substitute any fetch function.
    pub fn balance_cache(
        &self,
        storage: Arc<dyn Storage>,
        ttl: Duration,
    ) -> Arc<AggregateCache<BalanceSummary>> {
        let client = self.clone();
        AggregateCache::new(
            storage,
            BALANCE_CACHE_KEY,
            ttl,
            Arc::new(move || {
                let client = client.clone();
                async move {
                    client
                        .request::<BalanceSummary>(ApiRequest::get(BALANCE_PATH))
                        .await
                }
                .boxed()
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_summary_deserializes() {
        let json = r#"{
            "total": "1250.75",
            "currency": "EUR",
            "wallets": [
                { "walletId": "w-1", "name": "Checking", "balance": "1000.00" },
                { "walletId": "w-2", "name": "Savings", "balance": "250.75" }
            ]
        }"#;
        let summary: BalanceSummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.currency, "EUR");
        assert_eq!(summary.wallets.len(), 2);
        assert_eq!(summary.total, Decimal::new(125075, 2));
    }

    #[test]
    fn test_wallets_default_to_empty() {
        let json = r#"{ "total": "0", "currency": "USD" }"#;
        let summary: BalanceSummary = serde_json::from_str(json).unwrap();
        assert!(summary.wallets.is_empty());
    }
}
