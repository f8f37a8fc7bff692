//! Offline re-encryption of every stored credential value.
//!
//! Three scenarios, distinguished by which passphrases are given: enable
//! encryption (`--to` only), disable (`--from` only), rotate (both). The
//! pipeline stages new values into a temp table, verifies them, and swaps
//! them into the live table in one transaction; any failure before the
//! swap leaves the live table untouched.

use crate::crypto::{self, CryptoService, PassthroughCrypto};
use crate::error::{Error, Result};
use crate::infrastructure::{keys, Database, Dialect};
use crate::keypool::CACHE_CLEARED_CHANNEL;
use crate::store::Store;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

const BATCH_SIZE: i64 = 1000;
const SAMPLE_SIZE: i64 = 20;
const VERIFY_LIMIT: i64 = 1000;
const TEMP_TABLE: &str = "temp_migration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Enable,
    Disable,
    Rotate,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enable => write!(f, "enable encryption"),
            Self::Disable => write!(f, "disable encryption"),
            Self::Rotate => write!(f, "change encryption key"),
        }
    }
}

pub struct MigrateKeysCommand {
    db: Database,
    cache: Option<Arc<dyn Store>>,
    from_key: String,
    to_key: String,
}

impl MigrateKeysCommand {
    pub fn new(
        db: Database,
        cache: Option<Arc<dyn Store>>,
        from_key: String,
        to_key: String,
    ) -> Self {
        Self {
            db,
            cache,
            from_key,
            to_key,
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let scenario = self.validate_scenario()?;
        info!("starting key migration, scenario: {scenario}");

        self.precheck(scenario).await?;
        self.stage().await?;
        self.verify_staged().await?;
        self.swap().await?;

        // From here on the new values are live; the rest is cleanup.
        if let Err(e) = self.clear_cache().await {
            warn!("cache cleanup failed, restart every instance manually: {e}");
        }
        if let Err(e) = self.drop_temp_table().await {
            warn!("temp table cleanup failed, drop {TEMP_TABLE} manually: {e}");
        }

        info!("key migration completed successfully");
        Ok(())
    }

    fn validate_scenario(&self) -> Result<Scenario> {
        match (!self.from_key.is_empty(), !self.to_key.is_empty()) {
            (false, true) => {
                crypto::validate_passphrase_strength(&self.to_key, "new encryption key");
                Ok(Scenario::Enable)
            }
            (true, false) => Ok(Scenario::Disable),
            (true, true) => {
                if self.from_key == self.to_key {
                    return Err(Error::validation("new and old keys cannot be the same"));
                }
                crypto::validate_passphrase_strength(&self.to_key, "new encryption key");
                Ok(Scenario::Rotate)
            }
            (false, false) => Err(Error::validation(
                "must specify --from or --to, or both",
            )),
        }
    }

    fn from_service(&self) -> Arc<dyn CryptoService> {
        crypto::new_service(&self.from_key)
    }

    fn to_service(&self) -> Arc<dyn CryptoService> {
        crypto::new_service(&self.to_key)
    }

    /// Verify the *from* scheme decrypts every row before touching anything.
    async fn precheck(&self, scenario: Scenario) -> Result<()> {
        info!("executing pre-check");

        if scenario == Scenario::Enable {
            self.detect_already_encrypted().await?;
        }

        let total = keys::count_all(&self.db).await?;
        if total == 0 {
            info!("no key data in database, skipping pre-check");
            return Ok(());
        }

        let current = self.from_service();
        let mut failed = 0u64;
        let mut verified = 0i64;
        let mut last_id = 0i64;

        loop {
            let page = keys::page_after(&self.db, last_id, BATCH_SIZE).await?;
            if page.is_empty() {
                break;
            }

            for key in &page {
                if current.decrypt(&key.key_value).is_err() {
                    warn!("key id {} failed to decrypt", key.id);
                    failed += 1;
                }
            }

            verified += page.len() as i64;
            last_id = page.last().map(|k| k.id).unwrap_or(last_id);
            info!("verified {verified}/{total} keys");
        }

        if failed > 0 {
            return Err(Error::validation(format!(
                "found {failed} keys that cannot be decrypted, check the --from parameter"
            )));
        }

        info!("pre-check passed, all keys verified successfully");
        Ok(())
    }

    /// Guard against double encryption: sample rows and compare the stored
    /// digest against the unkeyed digest of the stored value. All matching
    /// means plaintext, none matching means already encrypted, a partial
    /// match means corruption.
    async fn detect_already_encrypted(&self) -> Result<()> {
        info!("detecting whether data is already encrypted");

        let sample = keys::sample_with_hash(&self.db, SAMPLE_SIZE).await?;
        if sample.is_empty() {
            info!("no keys found in database, safe to proceed");
            return Ok(());
        }

        let unkeyed = PassthroughCrypto;
        let consistent = sample
            .iter()
            .filter(|k| unkeyed.digest(&k.key_value) == k.key_hash)
            .count();

        if consistent == sample.len() {
            info!("hash check passed: data appears to be unencrypted");
            return Ok(());
        }

        if consistent == 0 {
            // Already encrypted. If the target passphrase decrypts it, the
            // caller is about to double encrypt with the same key.
            let target = self.to_service();
            let decryptable = sample
                .iter()
                .filter(|k| {
                    target
                        .decrypt(&k.key_value)
                        .map(|plain| target.digest(&plain) == k.key_hash)
                        .unwrap_or(false)
                })
                .count();

            if decryptable > 0 {
                return Err(Error::validation(format!(
                    "data is already encrypted with the target key ({decryptable}/{} rows decrypt)",
                    sample.len()
                )));
            }
            return Err(Error::validation(format!(
                "data appears to be already encrypted (0/{} rows match the unkeyed digest)",
                sample.len()
            )));
        }

        Err(Error::validation(format!(
            "inconsistent data state: {consistent}/{} rows appear unencrypted, the rest encrypted",
            sample.len()
        )))
    }

    /// Stage (encrypted value, digest) for every row into the temp table,
    /// in id-ordered chunks inside transactions.
    async fn stage(&self) -> Result<()> {
        info!("staging re-encrypted keys into {TEMP_TABLE}");
        self.drop_temp_table().await.ok();
        self.create_temp_table().await?;

        let total = keys::count_all(&self.db).await?;
        if total == 0 {
            info!("no keys to migrate");
            return Ok(());
        }

        let old_service = self.from_service();
        let new_service = self.to_service();
        let mut processed = 0i64;
        let mut last_id = 0i64;

        loop {
            let page = keys::page_after(&self.db, last_id, BATCH_SIZE).await?;
            if page.is_empty() {
                break;
            }

            let mut staged = Vec::with_capacity(page.len());
            for key in &page {
                let plaintext = old_service.decrypt(&key.key_value).map_err(|e| {
                    Error::validation(format!("key id {} decryption failed: {e}", key.id))
                })?;
                let encrypted = new_service.encrypt(&plaintext)?;
                let digest = new_service.digest(&plaintext);
                staged.push((key.id, encrypted, digest));
            }

            self.insert_staged(&staged).await?;
            processed += page.len() as i64;
            last_id = page.last().map(|k| k.id).unwrap_or(last_id);
            info!("processed {processed}/{total} keys");
        }

        info!("staging completed");
        Ok(())
    }

    async fn create_temp_table(&self) -> Result<()> {
        let id_type = match self.db.dialect() {
            Dialect::Postgres | Dialect::MySql => "BIGINT",
            Dialect::Sqlite => "INTEGER",
        };
        sqlx::query(&format!(
            "CREATE TABLE {TEMP_TABLE} ( \
                 id {id_type} PRIMARY KEY, \
                 key_value_new TEXT, \
                 key_hash_new VARCHAR(255) \
             )"
        ))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn insert_staged(&self, staged: &[(i64, String, String)]) -> Result<()> {
        let values = vec!["(?, ?, ?)"; staged.len()].join(", ");
        let template = format!(
            "INSERT INTO {TEMP_TABLE} (id, key_value_new, key_hash_new) VALUES {values}"
        );

        let sql = self.db.sql(&template);
        let mut tx = self.db.pool().begin().await?;
        let mut query = sqlx::query(&sql);
        for (id, value, hash) in staged {
            query = query.bind(id).bind(value).bind(hash);
        }
        query.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Row counts must match and a sample of staged values must decrypt
    /// with the *to* scheme.
    async fn verify_staged(&self) -> Result<()> {
        info!("verifying staged data integrity");

        let total = keys::count_all(&self.db).await?;
        if total == 0 {
            return Ok(());
        }

        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {TEMP_TABLE}"))
            .fetch_one(self.db.pool())
            .await?;
        let staged: i64 = sqlx::Row::try_get(&row, "n")?;
        if staged != total {
            return Err(Error::validation(format!(
                "migration incomplete: {staged}/{total} keys staged"
            )));
        }

        let new_service = self.to_service();
        let rows = sqlx::query(&self.db.sql(&format!(
            "SELECT id, key_value_new FROM {TEMP_TABLE} ORDER BY id LIMIT ?"
        )))
        .bind(VERIFY_LIMIT)
        .fetch_all(self.db.pool())
        .await?;

        for row in &rows {
            let id: i64 = sqlx::Row::try_get(row, "id")?;
            let value: String = sqlx::Row::try_get(row, "key_value_new")?;
            new_service.decrypt(&value).map_err(|e| {
                Error::validation(format!("staged key id {id} failed verification: {e}"))
            })?;
        }

        info!("verified {} staged keys successfully", rows.len());
        Ok(())
    }

    /// Cross-table UPDATE from the temp table inside one transaction;
    /// dialect-specific SQL.
    async fn swap(&self) -> Result<()> {
        info!("updating live table from {TEMP_TABLE}");

        let update_sql = match self.db.dialect() {
            Dialect::MySql => format!(
                "UPDATE api_keys a \
                 INNER JOIN {TEMP_TABLE} t ON a.id = t.id \
                 SET a.key_value = t.key_value_new, a.key_hash = t.key_hash_new"
            ),
            Dialect::Postgres => format!(
                "UPDATE api_keys \
                 SET key_value = t.key_value_new, key_hash = t.key_hash_new \
                 FROM {TEMP_TABLE} t WHERE api_keys.id = t.id"
            ),
            Dialect::Sqlite => format!(
                "UPDATE api_keys \
                 SET key_value = (SELECT key_value_new FROM {TEMP_TABLE} \
                                  WHERE {TEMP_TABLE}.id = api_keys.id), \
                     key_hash = (SELECT key_hash_new FROM {TEMP_TABLE} \
                                 WHERE {TEMP_TABLE}.id = api_keys.id) \
                 WHERE EXISTS (SELECT 1 FROM {TEMP_TABLE} \
                               WHERE {TEMP_TABLE}.id = api_keys.id)"
            ),
        };

        let mut tx = self.db.pool().begin().await?;
        sqlx::query(&update_sql).execute(&mut *tx).await?;
        tx.commit().await?;

        info!("live table updated with migrated data");
        Ok(())
    }

    /// Wipe the shared namespace and tell running peers to reload.
    async fn clear_cache(&self) -> Result<()> {
        let Some(cache) = &self.cache else {
            info!("no cache store configured, skipping cache cleanup");
            return Ok(());
        };

        cache.clear().await?;
        cache.publish(CACHE_CLEARED_CHANNEL, b"migrated").await?;
        info!("cache cleared");
        Ok(())
    }

    async fn drop_temp_table(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {TEMP_TABLE}"))
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key, AesGcmCrypto};
    use crate::infrastructure::migrations;
    use sqlx::any::AnyPoolOptions;
    use sqlx::Row;

    const PASSPHRASE: &str = "Str0ngPass!234567";

    async fn test_db() -> Database {
        crate::infrastructure::database::install_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let db = Database::from_pool(pool, Dialect::Sqlite);
        migrations::migrate(&db).await.expect("schema");
        db
    }

    async fn seed_plaintext_keys(db: &Database, count: usize) -> Vec<String> {
        let unkeyed = PassthroughCrypto;
        let mut plaintexts = Vec::with_capacity(count);
        for i in 0..count {
            let plaintext = format!("sk-plain-{i:04}");
            let hash = unkeyed.digest(&plaintext);
            sqlx::query(&db.sql(
                "INSERT INTO api_keys \
                 (group_id, key_value, key_hash, status, failure_count, created_at, updated_at) \
                 VALUES (1, ?, ?, 'active', 0, 0, 0)",
            ))
            .bind(&plaintext)
            .bind(&hash)
            .execute(db.pool())
            .await
            .expect("seed row");
            plaintexts.push(plaintext);
        }
        plaintexts
    }

    async fn temp_table_exists(db: &Database) -> bool {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = 'temp_migration'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        row.try_get::<i64, _>("n").unwrap() > 0
    }

    #[tokio::test]
    async fn test_enable_encryption_roundtrip() {
        let db = test_db().await;
        // More rows than one staging batch, so chunked staging is exercised.
        let plaintexts = seed_plaintext_keys(&db, 2500).await;

        let cmd = MigrateKeysCommand::new(db.clone(), None, String::new(), PASSPHRASE.to_string());
        cmd.execute().await.expect("migration succeeds");

        let keyed = AesGcmCrypto::new(derive_key(PASSPHRASE));
        let rows = sqlx::query("SELECT key_value, key_hash FROM api_keys ORDER BY id")
            .fetch_all(db.pool())
            .await
            .unwrap();
        assert_eq!(rows.len(), plaintexts.len());

        for (row, original) in rows.iter().zip(&plaintexts) {
            let value: String = row.try_get("key_value").unwrap();
            let hash: String = row.try_get("key_hash").unwrap();

            // No plaintext survives at rest.
            assert_ne!(&value, original);
            // Every value decrypts back to its original plaintext and the
            // stored digest was recomputed under the new scheme.
            assert_eq!(&keyed.decrypt(&value).unwrap(), original);
            assert_eq!(hash, keyed.digest(original));
        }

        assert!(!temp_table_exists(&db).await);
    }

    #[tokio::test]
    async fn test_disable_encryption_restores_plaintext() {
        let db = test_db().await;
        let plaintexts = seed_plaintext_keys(&db, 30).await;

        MigrateKeysCommand::new(db.clone(), None, String::new(), PASSPHRASE.to_string())
            .execute()
            .await
            .expect("enable");

        MigrateKeysCommand::new(db.clone(), None, PASSPHRASE.to_string(), String::new())
            .execute()
            .await
            .expect("disable");

        let rows = sqlx::query("SELECT key_value FROM api_keys ORDER BY id")
            .fetch_all(db.pool())
            .await
            .unwrap();
        let values: Vec<String> = rows
            .iter()
            .map(|r| r.try_get("key_value").unwrap())
            .collect();
        assert_eq!(values, plaintexts);
    }

    #[tokio::test]
    async fn test_enable_twice_aborts_before_touching_data() {
        let db = test_db().await;
        seed_plaintext_keys(&db, 25).await;

        MigrateKeysCommand::new(db.clone(), None, String::new(), PASSPHRASE.to_string())
            .execute()
            .await
            .expect("first enable");

        let before: Vec<String> = sqlx::query("SELECT key_value FROM api_keys ORDER BY id")
            .fetch_all(db.pool())
            .await
            .unwrap()
            .iter()
            .map(|r| r.try_get("key_value").unwrap())
            .collect();

        // Enabling again with no --from must trip the already-encrypted
        // detector and leave the table untouched.
        let result = MigrateKeysCommand::new(
            db.clone(),
            None,
            String::new(),
            "An0therPass!7654321".to_string(),
        )
        .execute()
        .await;
        assert!(result.is_err());

        let after: Vec<String> = sqlx::query("SELECT key_value FROM api_keys ORDER BY id")
            .fetch_all(db.pool())
            .await
            .unwrap()
            .iter()
            .map(|r| r.try_get("key_value").unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_missing_parameters_rejected() {
        let db = test_db().await;
        let cmd = MigrateKeysCommand::new(db, None, String::new(), String::new());
        assert!(matches!(
            cmd.execute().await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_same_keys_rejected() {
        let db = test_db().await;
        let cmd = MigrateKeysCommand::new(
            db,
            None,
            PASSPHRASE.to_string(),
            PASSPHRASE.to_string(),
        );
        assert!(matches!(
            cmd.execute().await,
            Err(Error::Validation { .. })
        ));
    }
}
