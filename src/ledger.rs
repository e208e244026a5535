use chrono::Utc;
use sqlx::{
    SqlitePool,
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use thiserror::Error;
use tracing::debug;

use crate::model::{LatestVersion, VersionRecord};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Error while interacting with the version ledger: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Error while migrating the version ledger: {0}")]
    Migrate(#[from] MigrateError),
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn ensure_context(&self, name: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            insert into context (name)
            values (?1)
            on conflict (name) do nothing
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn ensure_application(&self, name: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            insert into application (name)
            values (?1)
            on conflict (name) do nothing
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn context_exists(&self, name: &str) -> Result<bool, LedgerError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            select count(*)
            from context
            where name = ?1
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn last_version(
        &self,
        application: &str,
        context: &str,
    ) -> Result<Option<String>, LedgerError> {
        let version = sqlx::query_scalar::<_, String>(
            r#"
            select v.version_no
            from version_history v
            join application a on a.id = v.application_id
            join context c on c.id = v.context_id
            where a.name = ?1 and c.name = ?2
            order by v.created desc, v.id desc
            limit 1
            "#,
        )
        .bind(application)
        .bind(context)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version)
    }

    /// Returns `true` when a record was written. The application and the context must be
    /// registered already, otherwise nothing is written.
    pub async fn append_if_changed(
        &self,
        application: &str,
        context: &str,
        version: &str,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            insert into version_history (application_id, context_id, version_no, created)
            select a.id, c.id, ?3, ?4
            from application a, context c
            where a.name = ?1
              and c.name = ?2
              and (
                select v.version_no
                from version_history v
                where v.application_id = a.id and v.context_id = c.id
                order by v.created desc, v.id desc
                limit 1
              ) is not ?3
            "#,
        )
        .bind(application)
        .bind(context)
        .bind(version)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() == 1;
        debug!(application, context, version, changed, "Checked version");

        Ok(changed)
    }

    pub async fn all_versions(
        &self,
        application: &str,
        context: &str,
    ) -> Result<Vec<VersionRecord>, LedgerError> {
        let records = sqlx::query_as::<_, VersionRecord>(
            r#"
            select v.version_no as version, v.created as created
            from version_history v
            join application a on a.id = v.application_id
            join context c on c.id = v.context_id
            where a.name = ?1 and c.name = ?2
            order by v.created desc, v.id desc
            "#,
        )
        .bind(application)
        .bind(context)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn latest_versions(&self, context: &str) -> Result<Vec<LatestVersion>, LedgerError> {
        let versions = sqlx::query_as::<_, LatestVersion>(
            r#"
            select application, version
            from (
                select a.name as application,
                       v.version_no as version,
                       row_number() over (
                           partition by v.application_id
                           order by v.created desc, v.id desc
                       ) as position
                from version_history v
                join application a on a.id = v.application_id
                join context c on c.id = v.context_id
                where c.name = ?1
            )
            where position = 1
            order by application
            "#,
        )
        .bind(context)
        .fetch_all(&self.pool)
        .await?;

        Ok(versions)
    }

    pub async fn list_contexts(&self) -> Result<Vec<String>, LedgerError> {
        let contexts = sqlx::query_scalar::<_, String>(
            r#"
            select name
            from context
            order by name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(contexts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{DateTime, TimeZone};
    use tempfile::TempDir;

    use super::*;

    /// A ledger backed by a private in-memory database with the migrations applied.
    pub(crate) async fn memory_ledger() -> Ledger {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("failed to open in-memory database");
        let ledger = Ledger::new(pool);
        ledger.migrate().await.expect("failed to migrate");
        ledger
    }

    async fn registered(application: &str, context: &str) -> Ledger {
        let ledger = memory_ledger().await;
        ledger.ensure_application(application).await.unwrap();
        ledger.ensure_context(context).await.unwrap();
        ledger
    }

    async fn history_len(ledger: &Ledger, application: &str, context: &str) -> usize {
        ledger.all_versions(application, context).await.unwrap().len()
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let ledger = memory_ledger().await;

        ledger.ensure_context("prod-eu").await.unwrap();
        ledger.ensure_context("prod-eu").await.unwrap();
        ledger.ensure_context("dev").await.unwrap();
        ledger.ensure_application("web").await.unwrap();
        ledger.ensure_application("web").await.unwrap();

        assert_eq!(ledger.list_contexts().await.unwrap(), vec!["dev", "prod-eu"]);
        assert!(ledger.context_exists("dev").await.unwrap());
        assert!(!ledger.context_exists("staging").await.unwrap());
    }

    #[tokio::test]
    async fn same_version_is_appended_once() {
        let ledger = registered("web", "staging").await;

        assert!(ledger.append_if_changed("web", "staging", "1.0").await.unwrap());
        assert!(!ledger.append_if_changed("web", "staging", "1.0").await.unwrap());

        assert_eq!(history_len(&ledger, "web", "staging").await, 1);
    }

    #[tokio::test]
    async fn changed_version_is_appended() {
        let ledger = registered("web", "staging").await;

        assert_eq!(ledger.last_version("web", "staging").await.unwrap(), None);
        assert!(ledger.append_if_changed("web", "staging", "1.0").await.unwrap());
        assert!(ledger.append_if_changed("web", "staging", "1.1").await.unwrap());

        assert_eq!(
            ledger.last_version("web", "staging").await.unwrap().as_deref(),
            Some("1.1")
        );
        let history = ledger.all_versions("web", "staging").await.unwrap();
        let versions: Vec<_> = history.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["1.1", "1.0"]);
    }

    #[tokio::test]
    async fn rollback_to_an_older_version_is_a_change() {
        let ledger = registered("web", "staging").await;

        for version in ["1.0", "1.1", "1.0"] {
            assert!(ledger.append_if_changed("web", "staging", version).await.unwrap());
        }

        assert_eq!(history_len(&ledger, "web", "staging").await, 3);
        assert_eq!(
            ledger.last_version("web", "staging").await.unwrap().as_deref(),
            Some("1.0")
        );
    }

    #[tokio::test]
    async fn pairs_are_tracked_independently() {
        let ledger = registered("web", "staging").await;
        ledger.ensure_context("prod").await.unwrap();

        assert!(ledger.append_if_changed("web", "staging", "2.0").await.unwrap());
        assert!(ledger.append_if_changed("web", "prod", "2.0").await.unwrap());

        assert_eq!(history_len(&ledger, "web", "staging").await, 1);
        assert_eq!(history_len(&ledger, "web", "prod").await, 1);
    }

    #[tokio::test]
    async fn unregistered_pair_is_not_written() {
        let ledger = registered("web", "staging").await;

        assert!(!ledger.append_if_changed("api", "staging", "1.0").await.unwrap());
        assert!(!ledger.append_if_changed("web", "prod", "1.0").await.unwrap());
        assert_eq!(ledger.last_version("api", "staging").await.unwrap(), None);
    }

    #[tokio::test]
    async fn latest_versions_lists_one_row_per_application() {
        let ledger = registered("web", "staging").await;
        ledger.ensure_application("api").await.unwrap();
        ledger.ensure_application("worker").await.unwrap();
        ledger.ensure_context("prod").await.unwrap();

        ledger.append_if_changed("web", "staging", "1.0").await.unwrap();
        ledger.append_if_changed("web", "staging", "1.2").await.unwrap();
        ledger.append_if_changed("api", "staging", "0.9").await.unwrap();
        ledger.append_if_changed("worker", "prod", "3.1").await.unwrap();

        assert_eq!(
            ledger.latest_versions("staging").await.unwrap(),
            vec![
                LatestVersion {
                    application: "api".to_string(),
                    version: "0.9".to_string(),
                },
                LatestVersion {
                    application: "web".to_string(),
                    version: "1.2".to_string(),
                },
            ]
        );
        assert!(ledger.latest_versions("unknown").await.unwrap().is_empty());
    }

    async fn file_ledger(dir: &TempDir, max_connections: u32) -> Ledger {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("versions.db"))
            .create_if_missing(true);
        let ledger = Ledger::connect(options, max_connections)
            .await
            .expect("failed to open database file");
        ledger.migrate().await.expect("failed to migrate");
        ledger
    }

    async fn insert_at(
        ledger: &Ledger,
        application: &str,
        context: &str,
        version: &str,
        created: DateTime<Utc>,
    ) {
        sqlx::query(
            r#"
            insert into version_history (application_id, context_id, version_no, created)
            select a.id, c.id, ?3, ?4
            from application a, context c
            where a.name = ?1 and c.name = ?2
            "#,
        )
        .bind(application)
        .bind(context)
        .bind(version)
        .bind(created)
        .execute(&ledger.pool)
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_of_one_version_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = file_ledger(&dir, 8).await;
        ledger.ensure_application("web").await.unwrap();
        ledger.ensure_context("prod").await.unwrap();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.append_if_changed("web", "prod", "1.0").await })
            })
            .collect();

        let mut recorded = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                recorded += 1;
            }
        }

        assert_eq!(recorded, 1);
        assert_eq!(history_len(&ledger, "web", "prod").await, 1);
        ledger.close().await;
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_insertion_order() {
        let ledger = registered("web", "staging").await;
        let created = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        insert_at(&ledger, "web", "staging", "1.0", created).await;
        insert_at(&ledger, "web", "staging", "2.0", created).await;

        assert_eq!(
            ledger.last_version("web", "staging").await.unwrap().as_deref(),
            Some("2.0")
        );
        let history = ledger.all_versions("web", "staging").await.unwrap();
        assert_eq!(history[0].version, "2.0");
        assert_eq!(history[1].version, "1.0");
        assert_eq!(ledger.latest_versions("staging").await.unwrap()[0].version, "2.0");

        assert!(!ledger.append_if_changed("web", "staging", "2.0").await.unwrap());
        assert!(ledger.append_if_changed("web", "staging", "1.0").await.unwrap());
    }

    #[tokio::test]
    async fn closed_pool_reports_database_error() {
        let ledger = memory_ledger().await;
        ledger.close().await;

        let err = ledger.list_contexts().await.unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));
    }
}
