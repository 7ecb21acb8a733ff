//! # Schema Migrations
//!
//! Discovers `YYYYMMDDHHMMSS_description.sql` files in a migrations directory and applies
//! the ones not yet recorded in `argus_schema_migrations`, in version order.
//!
//! Several orchestrator instances may start at once, so the whole run is serialized by a
//! PostgreSQL advisory lock held on a single connection.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::{ArgusError, ArgusResult};

/// Advisory lock key for "argus_schema_migrations"
const MIGRATION_LOCK_KEY: i64 = 0x0A26_05C0_DE00_0001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// YYYYMMDDHHMMSS
    pub version: String,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DatabaseMigrations {
    directory: PathBuf,
}

impl Default for DatabaseMigrations {
    fn default() -> Self {
        Self::new("migrations")
    }
}

impl DatabaseMigrations {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Apply every outstanding migration. Returns the versions applied by this call.
    pub async fn run_all(&self, pool: &PgPool) -> ArgusResult<Vec<String>> {
        let migrations = self.discover()?;
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = async {
            sqlx::raw_sql(
                r#"
                CREATE TABLE IF NOT EXISTS argus_schema_migrations (
                    version VARCHAR(14) PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
            "#,
            )
            .execute(&mut *conn)
            .await?;

            let applied: HashSet<String> =
                sqlx::query("SELECT version FROM argus_schema_migrations")
                    .fetch_all(&mut *conn)
                    .await?
                    .into_iter()
                    .map(|row| row.get::<String, _>("version"))
                    .collect();

            let mut newly_applied = Vec::new();
            for migration in migrations.values() {
                if applied.contains(&migration.version) {
                    continue;
                }
                info!(
                    version = %migration.version,
                    name = %migration.name,
                    "📦 Applying migration"
                );
                let sql = fs::read_to_string(&migration.path).map_err(|e| {
                    ArgusError::Database(format!(
                        "failed to read migration {}: {e}",
                        migration.path.display()
                    ))
                })?;
                sqlx::raw_sql(&sql).execute(&mut *conn).await?;
                sqlx::query("INSERT INTO argus_schema_migrations (version) VALUES ($1)")
                    .bind(&migration.version)
                    .execute(&mut *conn)
                    .await?;
                newly_applied.push(migration.version.clone());
            }
            Ok::<_, ArgusError>(newly_applied)
        }
        .await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    /// Migration files keyed (and therefore ordered) by version.
    pub fn discover(&self) -> ArgusResult<BTreeMap<String, Migration>> {
        let mut migrations = BTreeMap::new();
        if !self.directory.exists() {
            return Ok(migrations);
        }

        let entries = fs::read_dir(&self.directory).map_err(|e| {
            ArgusError::Database(format!(
                "failed to list migrations in {}: {e}",
                self.directory.display()
            ))
        })?;

        for entry in entries {
            let path = entry
                .map_err(|e| ArgusError::Database(format!("failed to read migration entry: {e}")))?
                .path();
            if !is_sql_file(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some((version, name)) = parse_migration_filename(stem) {
                migrations.insert(
                    version.clone(),
                    Migration {
                        version,
                        name,
                        path,
                    },
                );
            }
        }

        Ok(migrations)
    }
}

fn is_sql_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "sql")
}

fn parse_migration_filename(stem: &str) -> Option<(String, String)> {
    if stem.len() < 15 || !stem.is_char_boundary(14) {
        return None;
    }
    let (version, rest) = stem.split_at(14);
    if !version.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let name = rest.strip_prefix('_')?.replace('_', " ");
    Some((version.to_string(), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_migration_filename() {
        assert_eq!(
            parse_migration_filename("20260301000000_create_batch_tables"),
            Some(("20260301000000".to_string(), "create batch tables".to_string()))
        );
        assert_eq!(parse_migration_filename("2026_create"), None);
        assert_eq!(parse_migration_filename("2026030100000x_create"), None);
        assert_eq!(parse_migration_filename("20260301000000create"), None);
    }

    #[test]
    fn test_discover_orders_by_version_and_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20260302000000_second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("20260301000000_first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "notes").unwrap();
        fs::write(dir.path().join("bad_name.sql"), "SELECT 3;").unwrap();

        let found = DatabaseMigrations::new(dir.path()).discover().unwrap();
        let versions: Vec<_> = found.keys().cloned().collect();
        assert_eq!(versions, vec!["20260301000000", "20260302000000"]);
        assert_eq!(found["20260301000000"].name, "first");
    }

    #[test]
    fn test_discover_missing_directory_is_empty() {
        let found = DatabaseMigrations::new("/definitely/not/here")
            .discover()
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_shipped_migrations_are_discoverable() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let found = DatabaseMigrations::new(dir).discover().unwrap();
        assert!(found.len() >= 2);
    }
}
