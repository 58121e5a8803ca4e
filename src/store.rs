//! Durable metadata store on SQLite.
//!
//! Three tables, compatible with databases written by earlier deployments:
//!
//! - `simple_links`: project name -> JSON object `{label: href}`
//! - `packages`: project name -> `info`, `releases`, `urls` (JSON text) and `last_serial`
//! - `settings`: key -> value
//!
//! Every public call is a single auto-committed statement (or a short series
//! of them, see [`MetadataStore::delete_project`]) and returns only after
//! SQLite has synced it (`synchronous = FULL`).

use crate::error::{OffgridError, Result};
use crate::models::{Link, ProjectInfo, ProjectMetadata, ReleaseFile};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS packages (
        name TEXT PRIMARY KEY,
        info TEXT,
        releases TEXT,
        urls TEXT,
        last_serial INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS simple_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pkg_name TEXT UNIQUE,
        links TEXT
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT UNIQUE,
        value TEXT
    )",
];

/// Persistent store for project links, project metadata and settings.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Metadata store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// A single connection is kept alive for the lifetime of the pool; each
    /// new SQLite connection to `:memory:` would otherwise see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ── Links ────────────────────────────────────────────────────────────

    /// Replace the whole link set of `project`.
    ///
    /// Labels are unique per project; when `links` repeats a label the last href wins.
    /// An empty `links` is a no-op and never erases a stored set.
    pub async fn upsert_project_links(&self, project: &str, links: &[Link]) -> Result<()> {
        if links.is_empty() {
            debug!("No links for {}, keeping the stored set", project);
            return Ok(());
        }

        let map: BTreeMap<&str, &str> = links
            .iter()
            .map(|l| (l.label.as_str(), l.href.as_str()))
            .collect();
        let serialized = serde_json::to_string(&map)
            .map_err(|e| OffgridError::InvalidMetadata(e.to_string()))?;

        sqlx::query(
            "INSERT INTO simple_links (pkg_name, links) VALUES (?, ?)
             ON CONFLICT(pkg_name) DO UPDATE SET links = excluded.links",
        )
        .bind(project)
        .bind(serialized)
        .execute(&self.pool)
        .await?;

        debug!("Stored {} link(s) for {}", map.len(), project);
        Ok(())
    }

    /// Link set of `project`, ordered by label.
    ///
    /// `None` means the project was never stored.
    pub async fn get_project_links(&self, project: &str) -> Result<Option<Vec<Link>>> {
        let row: Option<Option<String>> =
            sqlx::query_scalar("SELECT links FROM simple_links WHERE pkg_name = ?")
                .bind(project)
                .fetch_optional(&self.pool)
                .await?;

        let Some(raw) = row else {
            return Ok(None);
        };

        let map: BTreeMap<String, String> = match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                OffgridError::InvalidMetadata(format!("stored links for {project}: {e}"))
            })?,
            None => BTreeMap::new(),
        };

        Ok(Some(
            map.into_iter()
                .map(|(label, href)| Link { label, href })
                .collect(),
        ))
    }

    // ── Project metadata ─────────────────────────────────────────────────

    /// Insert or fully replace the JSON metadata of `project`.
    pub async fn upsert_project_metadata(
        &self,
        project: &str,
        metadata: &ProjectMetadata,
    ) -> Result<()> {
        metadata.validate()?;

        let encode = |value: serde_json::Result<String>| {
            value.map_err(|e| OffgridError::InvalidMetadata(e.to_string()))
        };
        let info = encode(serde_json::to_string(&metadata.info))?;
        let releases = encode(serde_json::to_string(&metadata.releases))?;
        let urls = encode(serde_json::to_string(&metadata.urls))?;

        sqlx::query(
            "INSERT INTO packages (name, info, releases, urls, last_serial)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                info = excluded.info,
                releases = excluded.releases,
                urls = excluded.urls,
                last_serial = excluded.last_serial",
        )
        .bind(project)
        .bind(info)
        .bind(releases)
        .bind(urls)
        .bind(metadata.last_serial)
        .execute(&self.pool)
        .await?;

        debug!(
            "Stored metadata for {} (serial {:?})",
            project, metadata.last_serial
        );
        Ok(())
    }

    pub async fn get_project_metadata(&self, project: &str) -> Result<Option<ProjectMetadata>> {
        let row: Option<(Option<String>, Option<String>, Option<String>, Option<i64>)> =
            sqlx::query_as("SELECT info, releases, urls, last_serial FROM packages WHERE name = ?")
                .bind(project)
                .fetch_optional(&self.pool)
                .await?;

        let Some((info, releases, urls, last_serial)) = row else {
            return Ok(None);
        };

        let metadata = ProjectMetadata {
            info: decode_column::<ProjectInfo>(project, "info", info)?.unwrap_or_default(),
            releases: decode_column::<BTreeMap<String, Vec<ReleaseFile>>>(
                project, "releases", releases,
            )?
            .unwrap_or_default(),
            urls: decode_column::<Vec<ReleaseFile>>(project, "urls", urls)?.unwrap_or_default(),
            last_serial,
        };
        Ok(Some(metadata))
    }

    /// `info.summary` of a stored project, if any.
    pub async fn get_project_summary(&self, project: &str) -> Result<Option<String>> {
        let row: Option<Option<String>> =
            sqlx::query_scalar("SELECT info FROM packages WHERE name = ?")
                .bind(project)
                .fetch_optional(&self.pool)
                .await?;

        let info = decode_column::<ProjectInfo>(project, "info", row.flatten())?;
        Ok(info.and_then(|i| i.summary))
    }

    /// Remove the link set and the metadata of `project`.
    ///
    /// The two deletes are separate statements; a crash between them leaves
    /// one of the two records behind.
    pub async fn delete_project(&self, project: &str) -> Result<()> {
        sqlx::query("DELETE FROM simple_links WHERE pkg_name = ?")
            .bind(project)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM packages WHERE name = ?")
            .bind(project)
            .execute(&self.pool)
            .await?;

        info!("Deleted stored records for {}", project);
        Ok(())
    }

    /// Names of projects with a stored link set, ordered by name.
    ///
    /// `name_mask` is a case-insensitive substring filter; `None`, empty or `*`
    /// disables it. Pagination applies only when both `page_size` and
    /// `page_number` (1-based) are given.
    pub async fn list_projects(
        &self,
        name_mask: Option<&str>,
        page_size: Option<u32>,
        page_number: Option<u32>,
    ) -> Result<Vec<String>> {
        let mask = name_mask
            .map(str::trim)
            .filter(|m| !m.is_empty() && *m != "*");
        let page = page_size.zip(page_number);

        let mut sql = String::from("SELECT pkg_name FROM simple_links");
        if mask.is_some() {
            sql.push_str(" WHERE pkg_name LIKE ? ESCAPE '\\'");
        }
        sql.push_str(" ORDER BY pkg_name");
        if page.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        if let Some(mask) = mask {
            query = query.bind(format!("%{}%", escape_like(mask)));
        }
        if let Some((size, number)) = page {
            let offset = i64::from(number.saturating_sub(1)) * i64::from(size);
            query = query.bind(i64::from(size)).bind(offset);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    // ── Settings ─────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str, default: &str) -> Result<String> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.flatten().unwrap_or_else(|| default.to_string()))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn decode_column<T: serde::de::DeserializeOwned>(
    project: &str,
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
            OffgridError::InvalidMetadata(format!("stored {column} for {project}: {e}"))
        }),
        None => Ok(None),
    }
}

/// Escape LIKE wildcards so the mask matches literally.
fn escape_like(mask: &str) -> String {
    let mut escaped = String::with_capacity(mask.len());
    for c in mask.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn seeded(names: &[&str]) -> MetadataStore {
        let store = MetadataStore::in_memory().await.unwrap();
        for name in names {
            store
                .upsert_project_links(name, &[Link::new(format!("{name}-1.0.tar.gz"), "https://x/a")])
                .await
                .unwrap();
        }
        store
    }

    fn metadata(summary: &str, serial: i64) -> ProjectMetadata {
        ProjectMetadata::from_json(json!({
            "info": {"name": "demo", "summary": summary},
            "releases": {"1.0": [{"filename": "demo-1.0.tar.gz", "url": "https://x/demo-1.0.tar.gz"}]},
            "urls": [],
            "last_serial": serial
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn links_absent_until_written() {
        let store = MetadataStore::in_memory().await.unwrap();
        assert_eq!(store.get_project_links("requests").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_links_replaces_whole_set() {
        let store = MetadataStore::in_memory().await.unwrap();
        let first = vec![
            Link::new("demo-1.0.tar.gz", "https://x/demo-1.0.tar.gz"),
            Link::new("demo-1.1.tar.gz", "https://x/demo-1.1.tar.gz"),
        ];
        let second = vec![Link::new("demo-2.0.tar.gz", "https://x/demo-2.0.tar.gz")];

        store.upsert_project_links("demo", &first).await.unwrap();
        store.upsert_project_links("demo", &second).await.unwrap();

        assert_eq!(store.get_project_links("demo").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn empty_link_set_keeps_prior_links() {
        let store = MetadataStore::in_memory().await.unwrap();
        let stored = vec![Link::new("demo-1.0.tar.gz", "https://x/demo-1.0.tar.gz")];
        store.upsert_project_links("demo", &stored).await.unwrap();

        store.upsert_project_links("demo", &[]).await.unwrap();
        assert_eq!(store.get_project_links("demo").await.unwrap(), Some(stored));

        store.upsert_project_links("ghost", &[]).await.unwrap();
        assert_eq!(store.get_project_links("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn metadata_round_trip_and_replace() {
        let store = MetadataStore::in_memory().await.unwrap();
        assert!(store.get_project_metadata("demo").await.unwrap().is_none());

        store
            .upsert_project_metadata("demo", &metadata("first", 1))
            .await
            .unwrap();
        store
            .upsert_project_metadata("demo", &metadata("second", 2))
            .await
            .unwrap();

        let stored = store.get_project_metadata("demo").await.unwrap().unwrap();
        assert_eq!(stored, metadata("second", 2));
        assert_eq!(
            store.get_project_summary("demo").await.unwrap().as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn summary_absent_for_unknown_project() {
        let store = MetadataStore::in_memory().await.unwrap();
        assert_eq!(store.get_project_summary("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_links_and_metadata() {
        let store = seeded(&["demo"]).await;
        store
            .upsert_project_metadata("demo", &metadata("x", 1))
            .await
            .unwrap();

        store.delete_project("demo").await.unwrap();

        assert!(store.get_project_links("demo").await.unwrap().is_none());
        assert!(store.get_project_metadata("demo").await.unwrap().is_none());
        // Deleting again is harmless
        store.delete_project("demo").await.unwrap();
    }

    #[tokio::test]
    async fn list_projects_pages_concatenate_to_full_listing() {
        let store = seeded(&["flask", "abc-tools", "django", "xabcx", "numpy"]).await;

        let all = store.list_projects(None, None, None).await.unwrap();
        assert_eq!(all, vec!["abc-tools", "django", "flask", "numpy", "xabcx"]);

        let mut paged = store.list_projects(Some("*"), Some(2), Some(1)).await.unwrap();
        paged.extend(store.list_projects(Some("*"), Some(2), Some(2)).await.unwrap());
        paged.extend(store.list_projects(Some("*"), Some(2), Some(3)).await.unwrap());
        assert_eq!(paged, all);

        assert!(store
            .list_projects(None, Some(2), Some(4))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_projects_filters_by_substring() {
        let store = seeded(&["flask", "abc-tools", "xabcx", "a_c"]).await;

        let matched = store.list_projects(Some("abc"), None, None).await.unwrap();
        assert_eq!(matched, vec!["abc-tools", "xabcx"]);

        // LIKE wildcards in the mask are literal
        let underscore = store.list_projects(Some("_"), None, None).await.unwrap();
        assert_eq!(underscore, vec!["a_c"]);
    }

    #[tokio::test]
    async fn settings_default_then_upsert() {
        let store = MetadataStore::in_memory().await.unwrap();
        assert_eq!(store.get_setting("offline_mode", "off").await.unwrap(), "off");

        store.set_setting("offline_mode", "on").await.unwrap();
        store.set_setting("offline_mode", "off").await.unwrap();
        assert_eq!(store.get_setting("offline_mode", "on").await.unwrap(), "off");
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("remote_index.sqlite");

        {
            let store = MetadataStore::open(&path).await.unwrap();
            store
                .upsert_project_links("demo", &[Link::new("demo-1.0.tar.gz", "https://x/a")])
                .await
                .unwrap();
            store.set_setting("offline_mode", "on").await.unwrap();
        }

        let reopened = MetadataStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get_project_links("demo").await.unwrap(),
            Some(vec![Link::new("demo-1.0.tar.gz", "https://x/a")])
        );
        assert_eq!(reopened.get_setting("offline_mode", "off").await.unwrap(), "on");
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("a_b%c\\"), "a\\_b\\%c\\\\");
    }
}
