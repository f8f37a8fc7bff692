//! Database connection handling with dialect selection by DSN shape.

use crate::config::DatabaseSettings;
use crate::error::{Error, Result};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::path::Path;

/// SQL dialect tag surfaced to callers that need dialect-specific SQL
/// (migrations, upserts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Register the sqlx Any drivers exactly once per process.
pub fn install_drivers() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(sqlx::any::install_default_drivers);
}

/// Connection pool plus the dialect it talks.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: Dialect,
}

impl Database {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        install_drivers();
        let (url, dialect) = resolve_dsn(&settings.dsn, &settings.db_path)?;

        let pool = AnyPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&url)
            .await?;

        Ok(Self { pool, dialect })
    }

    /// Pool built elsewhere (tests use single-connection sqlite pools).
    pub fn from_pool(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Rewrite `?` placeholders for the active dialect.
    pub fn sql(&self, template: &str) -> String {
        rewrite_placeholders(self.dialect, template)
    }
}

/// Rewrite `?` placeholders to `$n` for Postgres; MySQL and SQLite use `?`
/// natively. None of our statements embed literal question marks.
pub fn rewrite_placeholders(dialect: Dialect, template: &str) -> String {
    match dialect {
        Dialect::Postgres => {
            let mut out = String::with_capacity(template.len() + 8);
            let mut n = 0;
            for ch in template.chars() {
                if ch == '?' {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                } else {
                    out.push(ch);
                }
            }
            out
        }
        Dialect::MySql | Dialect::Sqlite => template.to_string(),
    }
}

/// Select the dialect by DSN shape. Anything that is not Postgres or MySQL
/// is treated as a SQLite file; relative paths land under `db_path`.
fn resolve_dsn(dsn: &str, db_path: &str) -> Result<(String, Dialect)> {
    if dsn.is_empty() {
        return Err(Error::validation("DATABASE_DSN is not configured"));
    }

    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        return Ok((dsn.to_string(), Dialect::Postgres));
    }
    if dsn.starts_with("mysql://") {
        return Ok((dsn.to_string(), Dialect::MySql));
    }
    if dsn.starts_with("sqlite:") {
        // Already a sqlx sqlite URL (tests pass sqlite::memory:).
        return Ok((dsn.to_string(), Dialect::Sqlite));
    }

    let file = if Path::new(dsn).is_absolute() {
        dsn.to_string()
    } else {
        Path::new(db_path).join(dsn).to_string_lossy().into_owned()
    };

    if let Some(parent) = Path::new(&file).parent() {
        std::fs::create_dir_all(parent)?;
    }

    Ok((format!("sqlite://{file}?mode=rwc"), Dialect::Sqlite))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_selection_by_dsn_shape() {
        let (url, dialect) = resolve_dsn("postgres://u:p@localhost/db", "/tmp/data").unwrap();
        assert_eq!(dialect, Dialect::Postgres);
        assert_eq!(url, "postgres://u:p@localhost/db");

        let (_, dialect) = resolve_dsn("mysql://u:p@localhost/db", "/tmp/data").unwrap();
        assert_eq!(dialect, Dialect::MySql);

        let (url, dialect) = resolve_dsn("gpt-load.db", "/tmp/data").unwrap();
        assert_eq!(dialect, Dialect::Sqlite);
        assert!(url.starts_with("sqlite:///tmp/data/"));
    }

    #[test]
    fn test_empty_dsn_is_rejected() {
        assert!(resolve_dsn("", "/tmp/data").is_err());
    }

    #[test]
    fn test_postgres_placeholder_rewrite() {
        assert_eq!(
            rewrite_placeholders(Dialect::Postgres, "SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
    }

    #[test]
    fn test_sqlite_placeholders_untouched() {
        assert_eq!(
            rewrite_placeholders(Dialect::Sqlite, "UPDATE t SET a = ?"),
            "UPDATE t SET a = ?"
        );
    }
}
