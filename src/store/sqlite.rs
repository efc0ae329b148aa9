//! SQLite backed category store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, params_from_iter};
use tracing::debug;

use super::{Category, CategoryStore, DomainCategory};
use crate::error::StoreError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const AGGREGATE_QUERY: &str = "SELECT lower(domain) AS name, GROUP_CONCAT(category_id) \
     FROM domains GROUP BY name ORDER BY name";

/// Read-only store over the `categories(id, name)` and
/// `domains(domain, category_id)` tables.
///
/// Holds a small pool of connections handed out round robin so concurrent
/// lookups do not serialise on a single handle. Domain names compare without
/// regard to ASCII case.
pub struct SqliteStore {
    path: PathBuf,
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl SqliteStore {
    /// Open `connections` read-only handles to the database at `path`.
    pub fn open(path: impl AsRef<Path>, connections: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conns = (0..connections.max(1))
            .map(|_| open_read_only(path).map(Mutex::new))
            .collect::<Result<Vec<_>, StoreError>>()?;

        debug!(path = %path.display(), connections = conns.len(), "opened category store");
        Ok(Self {
            path: path.to_path_buf(),
            conns,
            next: AtomicUsize::new(0),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let Ok(conn) = self.conns[idx].lock() else {
            return Err(StoreError::Unavailable("connection lock poisoned".into()));
        };
        f(&conn)
    }
}

fn open_read_only(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn longest_match_sql(count: usize) -> String {
    let placeholders = (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT lower(domain), category_id FROM domains \
         WHERE domain COLLATE NOCASE IN ({}) \
         ORDER BY LENGTH(domain) DESC, category_id ASC LIMIT 1",
        placeholders
    )
}

fn parse_ids(concat: &str) -> Vec<u32> {
    let mut ids: Vec<u32> = concat
        .split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

impl CategoryStore for SqliteStore {
    fn categories(&self) -> Result<Vec<Category>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id, name FROM categories")?;
            let rows = stmt.query_map([], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?;
            let categories = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(categories)
        })
    }

    fn longest_match(&self, candidates: &[&str]) -> Result<Option<DomainCategory>, StoreError> {
        if candidates.is_empty() {
            return Ok(None);
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&longest_match_sql(candidates.len()))?;
            let mut rows = stmt.query(params_from_iter(candidates.iter()))?;
            let found = match rows.next()? {
                Some(row) => Some(DomainCategory {
                    domain: row.get(0)?,
                    category_id: row.get(1)?,
                }),
                None => None,
            };
            Ok(found)
        })
    }

    /// Runs on its own connection so a long scan never holds a pooled slot
    /// that lookups are waiting on.
    fn for_each_domain(&self, visit: &mut dyn FnMut(String, Vec<u32>)) -> Result<usize, StoreError> {
        let conn = open_read_only(&self.path)?;
        let mut stmt = conn.prepare(AGGREGATE_QUERY)?;
        let mut rows = stmt.query([])?;
        let mut count = 0;
        while let Some(row) = rows.next()? {
            let domain: String = row.get(0)?;
            let concat: String = row.get(1)?;
            visit(domain, parse_ids(&concat));
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Create a populated database file unique to `name`.
    fn fixture(name: &str, domains: &[(&str, u32)]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sieve-{}-{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&path);

        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE categories (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE domains (domain TEXT NOT NULL, category_id INTEGER NOT NULL);
             INSERT INTO categories VALUES (1, 'news'), (3, 'ads'), (7, 'malware');",
        )
        .unwrap();
        for (domain, id) in domains {
            conn.execute(
                "INSERT INTO domains (domain, category_id) VALUES (?1, ?2)",
                rusqlite::params![domain, id],
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn categories_loads_whole_table() {
        let path = fixture("categories", &[]);
        let store = SqliteStore::open(&path, 1).unwrap();

        let mut categories = store.categories().unwrap();
        categories.sort_by_key(|c| c.id);

        assert_eq!(categories.len(), 3);
        assert_eq!(categories[1], Category { id: 3, name: "ads".into() });
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn longest_match_prefers_most_specific() {
        let path = fixture("longest", &[("example.com", 1), ("b.example.com", 3)]);
        let store = SqliteStore::open(&path, 2).unwrap();

        let row = store
            .longest_match(&["a.b.example.com", "b.example.com", "example.com"])
            .unwrap();

        assert_eq!(
            row,
            Some(DomainCategory { domain: "b.example.com".into(), category_id: 3 })
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn longest_match_treats_candidates_as_values() {
        let path = fixture("injection", &[("example.com", 1)]);
        let store = SqliteStore::open(&path, 1).unwrap();

        let row = store.longest_match(&["x') OR 1=1 --", "nothing.test"]).unwrap();

        assert_eq!(row, None);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn longest_match_multi_category_returns_lowest_id() {
        let path = fixture("multi", &[("example.com", 7), ("example.com", 3)]);
        let store = SqliteStore::open(&path, 1).unwrap();

        let row = store.longest_match(&["example.com"]).unwrap().unwrap();

        assert_eq!(row.category_id, 3);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn for_each_domain_aggregates_sorted_ids() {
        let path = fixture(
            "aggregate",
            &[("b.example.com", 7), ("a.example.com", 1), ("b.example.com", 3)],
        );
        let store = SqliteStore::open(&path, 1).unwrap();

        let mut seen = Vec::new();
        let count = store
            .for_each_domain(&mut |domain, ids| seen.push((domain, ids)))
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            seen,
            vec![
                ("a.example.com".to_string(), vec![1]),
                ("b.example.com".to_string(), vec![3, 7]),
            ]
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stored_names_match_regardless_of_case() {
        let path = fixture(
            "case",
            &[("Ads.Example.com", 7), ("ads.example.COM", 3), ("example.com", 1)],
        );
        let store = SqliteStore::open(&path, 1).unwrap();

        let row = store.longest_match(&["ads.example.com", "example.com"]).unwrap();
        let mut seen = Vec::new();
        store
            .for_each_domain(&mut |domain, ids| seen.push((domain, ids)))
            .unwrap();

        assert_eq!(
            row,
            Some(DomainCategory { domain: "ads.example.com".into(), category_id: 3 })
        );
        assert_eq!(
            seen,
            vec![
                ("ads.example.com".to_string(), vec![3, 7]),
                ("example.com".to_string(), vec![1]),
            ]
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn lookups_proceed_during_slow_scan() {
        let path = fixture("scan", &[("a.test", 1), ("b.test", 1), ("c.test", 3)]);
        let store = SqliteStore::open(&path, 1).unwrap();
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);

        std::thread::scope(|scope| {
            let scan = scope.spawn(|| {
                store.for_each_domain(&mut |_, _| {
                    let _ = started_tx.try_send(());
                    std::thread::sleep(Duration::from_millis(300));
                })
            });

            started_rx.recv().unwrap();
            let begin = std::time::Instant::now();
            let row = store.longest_match(&["c.test"]).unwrap();

            assert!(begin.elapsed() < Duration::from_millis(200));
            assert_eq!(row.unwrap().category_id, 3);
            assert_eq!(scan.join().unwrap().unwrap(), 3);
        });
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn open_missing_database_fails() {
        let path = std::env::temp_dir().join("sieve-does-not-exist.db");

        assert!(SqliteStore::open(path, 1).is_err());
    }

    #[test]
    fn parse_ids_sorts_and_dedups() {
        assert_eq!(parse_ids("7,3,3, 1"), vec![1, 3, 7]);
        assert!(parse_ids("").is_empty());
    }
}
