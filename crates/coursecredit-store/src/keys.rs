//! Key encoding for the `RocksDB` column families.

use coursecredit_core::{TransactionId, UsageWindow, UserId};

/// Create a balance key from a user ID.
#[must_use]
pub fn balance_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
///
/// ULIDs are time-ordered, so a user's entries sort by time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Prefix shared by all index keys of a user.
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// The greatest possible index key of a user; the start of a reverse scan.
#[must_use]
pub fn user_transactions_upper(user_id: &UserId) -> Vec<u8> {
    let mut key = user_transactions_prefix(user_id);
    key.extend_from_slice(&[0xff; 16]);
    key
}

/// Extract the transaction ID from a user-transaction index key.
///
/// Returns `None` if the key is not 32 bytes long.
#[must_use]
pub fn extract_transaction_id_from_user_key(key: &[u8]) -> Option<TransactionId> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

/// Create a usage counter key.
///
/// Format: `user_id (16 bytes) || start micros (8 bytes BE) || end micros (8 bytes BE)`
#[must_use]
pub fn usage_counter_key(user_id: &UserId, window: UsageWindow) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&window.start.timestamp_micros().to_be_bytes());
    key.extend_from_slice(&window.end.timestamp_micros().to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn user_transaction_key_format() {
        let user_id = UserId::generate();
        let tx_id = TransactionId::generate();
        let key = user_transaction_key(&user_id, &tx_id);

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], user_id.as_bytes());
        assert_eq!(&key[16..], tx_id.to_bytes());
        assert_eq!(extract_transaction_id_from_user_key(&key), Some(tx_id));
    }

    #[test]
    fn short_index_key_has_no_id() {
        assert_eq!(extract_transaction_id_from_user_key(&[0u8; 20]), None);
    }

    #[test]
    fn upper_bound_sorts_after_every_entry() {
        let user_id = UserId::generate();
        let key = user_transaction_key(&user_id, &TransactionId::generate());
        assert!(key < user_transactions_upper(&user_id));
    }

    #[test]
    fn counter_keys_differ_per_window() {
        let user_id = UserId::generate();
        let now = Utc::now();
        let a = UsageWindow::new(now, now + Duration::days(1));
        let b = UsageWindow::new(now, now + Duration::days(30));

        assert_eq!(usage_counter_key(&user_id, a).len(), 32);
        assert_ne!(usage_counter_key(&user_id, a), usage_counter_key(&user_id, b));
    }
}
