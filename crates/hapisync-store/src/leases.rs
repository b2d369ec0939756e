//! Time-limited leases so that two processes sharing one database never sync
//! the same user at once.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::debug;

use crate::codec::ts;
use crate::error::StoreResult;
use crate::Store;

impl Store {
    /// Takes or extends the lease on `key` for `holder`.
    ///
    /// Returns false while another holder owns an unexpired lease.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let expires_at = ts(now + ttl);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM sync_leases WHERE lease_key = ?1 AND expires_at <= ?2",
            params![key, ts(now)],
        )?;
        tx.execute(
            "INSERT INTO sync_leases (lease_key, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(lease_key) DO UPDATE SET expires_at = excluded.expires_at
             WHERE sync_leases.holder = excluded.holder",
            params![key, holder, expires_at],
        )?;
        let owner: String = tx.query_row(
            "SELECT holder FROM sync_leases WHERE lease_key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        tx.commit()?;

        let acquired = owner == holder;
        debug!(key, holder, acquired, "lease attempt");
        Ok(acquired)
    }

    /// Drops the lease if `holder` still owns it.
    pub fn release_lease(&self, key: &str, holder: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM sync_leases WHERE lease_key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::store;
    use chrono::{Duration, Utc};

    #[test]
    fn lease_excludes_other_holders_until_expiry() {
        let store = store();
        let now = Utc::now();
        let ttl = Duration::minutes(5);

        assert!(store.try_acquire_lease("user:u-1", "a", ttl, now).unwrap());
        assert!(!store.try_acquire_lease("user:u-1", "b", ttl, now).unwrap());
        // same holder renews
        assert!(store.try_acquire_lease("user:u-1", "a", ttl, now + Duration::minutes(4)).unwrap());
        assert!(!store.try_acquire_lease("user:u-1", "b", ttl, now + Duration::minutes(6)).unwrap());
        assert!(store.try_acquire_lease("user:u-1", "b", ttl, now + Duration::minutes(10)).unwrap());
        assert!(store.try_acquire_lease("user:u-2", "a", ttl, now).unwrap());
    }

    #[test]
    fn release_only_by_owner() {
        let store = store();
        let now = Utc::now();
        let ttl = Duration::minutes(5);
        assert!(store.try_acquire_lease("k", "a", ttl, now).unwrap());

        store.release_lease("k", "b").unwrap();
        assert!(!store.try_acquire_lease("k", "b", ttl, now).unwrap());

        store.release_lease("k", "a").unwrap();
        assert!(store.try_acquire_lease("k", "b", ttl, now).unwrap());
    }
}
