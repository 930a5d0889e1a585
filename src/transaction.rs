//! Purchase history records.

use crate::catalog::{ProductId, ProviderId};
use crate::entitlement::LicenseType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One purchase, renewal or claim reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Provider that recorded the transaction.
    pub provider_id: ProviderId,

    /// Provider-specific transaction identifier.
    pub identifier: String,

    /// Licensed product, when the transaction maps to one.
    pub product_id: Option<ProductId>,

    /// How the license was obtained.
    pub license_type: LicenseType,

    /// Number of items.
    pub quantity: u32,

    /// Purchase date.
    pub date: Option<DateTime<Utc>>,

    /// End of the purchased period (subscriptions, trials).
    pub end_date: Option<DateTime<Utc>>,

    /// Set when the transaction was refunded or revoked.
    pub cancellation_date: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Whether the transaction was refunded or revoked.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_date.is_some()
    }
}

/// Transactions of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTransactions {
    /// Provider identifier.
    pub provider_id: ProviderId,

    /// Provider display name.
    pub provider_name: String,

    /// Undated transactions first, then newest first.
    pub transactions: Vec<Transaction>,
}

/// Order transactions undated first, then by date descending.
pub fn sort_newest_first(transactions: &mut [Transaction]) {
    transactions.sort_by(|a, b| match (a.date, b.date) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => b.cmp(&a),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tx(identifier: &str, date: Option<DateTime<Utc>>) -> Transaction {
        Transaction {
            provider_id: ProviderId::from("store"),
            identifier: identifier.to_string(),
            product_id: Some(ProductId::from("bundle.pro")),
            license_type: LicenseType::Purchase,
            quantity: 1,
            date,
            end_date: None,
            cancellation_date: None,
        }
    }

    #[test]
    fn test_sort_undated_first_then_newest() {
        let jan = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let mut list = vec![tx("jan", Some(jan)), tx("undated", None), tx("feb", Some(feb))];

        sort_newest_first(&mut list);

        let ids: Vec<_> = list.iter().map(|t| t.identifier.as_str()).collect();
        assert_eq!(ids, vec!["undated", "feb", "jan"]);
    }

    #[test]
    fn test_is_cancelled() {
        let mut t = tx("a", None);
        assert!(!t.is_cancelled());
        t.cancellation_date = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(t.is_cancelled());
    }
}
