//! Persistent store: a pooled SQLite-backed implementation of the
//! read/write queries the sync worker and read layer need, plus the
//! memoised catalog-ready flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::models::{Collection, Exterior, Rarity, Skin};

const CATALOG_READY_TTL: Duration = Duration::from_secs(30);

fn rarity_str(r: Rarity) -> &'static str {
    r.key()
}

fn rarity_from_str(s: &str) -> Option<Rarity> {
    Rarity::from_key(s)
}

fn exterior_str(e: Exterior) -> &'static str {
    match e {
        Exterior::FactoryNew => "factory_new",
        Exterior::MinimalWear => "minimal_wear",
        Exterior::FieldTested => "field_tested",
        Exterior::WellWorn => "well_worn",
        Exterior::BattleScarred => "battle_scarred",
    }
}

fn exterior_from_str(s: &str) -> Option<Exterior> {
    Exterior::ALL.into_iter().find(|e| exterior_str(*e) == s)
}

#[derive(Debug, Clone, Default)]
pub struct SkinFilter {
    pub collection_id: Option<String>,
    pub rarity: Option<Rarity>,
    pub normal_only: bool,
}

struct CatalogReadyMemo {
    value: bool,
    checked_at: Option<Instant>,
}

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    catalog_ready: Mutex<CatalogReadyMemo>,
}

impl SqliteStore {
    pub fn new(database_path: &str) -> AppResult<Arc<Self>> {
        let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| AppError::Fatal(format!("failed to build sqlite pool: {e}")))?;

        let store = Self {
            pool,
            catalog_ready: Mutex::new(CatalogReadyMemo {
                value: false,
                checked_at: None,
            }),
        };
        store.migrate()?;
        Ok(Arc::new(store))
    }

    fn migrate(&self) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS collections (
                id              TEXT PRIMARY KEY,
                display_name    TEXT NOT NULL,
                steam_tag       TEXT NOT NULL UNIQUE,
                normalized_name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS skins (
                market_hash_name TEXT PRIMARY KEY,
                collection_id    TEXT NOT NULL REFERENCES collections(id),
                base_name        TEXT NOT NULL,
                exterior         TEXT NOT NULL,
                rarity           TEXT NOT NULL,
                is_stattrak      INTEGER NOT NULL,
                is_souvenir      INTEGER NOT NULL,
                sell_listings    INTEGER NOT NULL,
                last_known_price REAL,
                float_min        REAL,
                float_max        REAL
            );
            CREATE INDEX IF NOT EXISTS idx_skins_collection ON skins(collection_id);
            CREATE INDEX IF NOT EXISTS idx_skins_rarity ON skins(rarity);",
        )
        .map_err(|e| AppError::Fatal(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn conn(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::Fatal(format!("sqlite pool exhausted: {e}")))
    }

    /// The catalog-ready flag, memoised for 30 seconds across concurrent
    /// callers so hot-path reads don't hit the store on every request.
    pub fn catalog_ready(&self) -> AppResult<bool> {
        {
            let memo = self.catalog_ready.lock();
            if let Some(checked_at) = memo.checked_at {
                if checked_at.elapsed() < CATALOG_READY_TTL {
                    return Ok(memo.value);
                }
            }
        }

        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let mut memo = self.catalog_ready.lock();
        memo.value = count > 0;
        memo.checked_at = Some(Instant::now());
        Ok(memo.value)
    }

    /// Forces the next `catalog_ready` call to re-check the store.
    pub fn invalidate_catalog_ready(&self) {
        let mut memo = self.catalog_ready.lock();
        memo.checked_at = None;
    }

    pub fn list_collections(&self) -> AppResult<Vec<Collection>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, display_name, steam_tag, normalized_name FROM collections ORDER BY display_name ASC")
            .map_err(|e| AppError::Transport(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Collection {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    steam_tag: row.get(2)?,
                    normalized_name: row.get(3)?,
                })
            })
            .map_err(|e| AppError::Transport(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| AppError::Transport(e.to_string()))
    }

    /// `collection.findUnique({steamTag})` with nested `skins` filtered by
    /// rarity and quality flags.
    pub fn find_collection_by_tag(
        &self,
        steam_tag: &str,
        filter: &SkinFilter,
    ) -> AppResult<Option<(Collection, Vec<Skin>)>> {
        let conn = self.conn()?;
        let collection = conn
            .query_row(
                "SELECT id, display_name, steam_tag, normalized_name FROM collections WHERE steam_tag = ?1",
                params![steam_tag],
                |row| {
                    Ok(Collection {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        steam_tag: row.get(2)?,
                        normalized_name: row.get(3)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(steam_tag.to_string()),
                other => AppError::Transport(other.to_string()),
            });

        let collection = match collection {
            Ok(c) => c,
            Err(AppError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut scoped_filter = filter.clone();
        scoped_filter.collection_id = Some(collection.id.clone());
        let skins = self.find_skins_with_conn(&conn, &scoped_filter, None, None, None)?;

        Ok(Some((collection, skins)))
    }

    /// `skin.groupBy({by: rarity, where})`.
    pub fn group_counts_by_rarity(&self, filter: &SkinFilter) -> AppResult<HashMap<Rarity, u64>> {
        let conn = self.conn()?;
        let (where_clause, binds) = build_where(filter);
        let sql = format!("SELECT rarity, COUNT(*) FROM skins {where_clause} GROUP BY rarity");
        let mut stmt = conn.prepare(&sql).map_err(|e| AppError::Transport(e.to_string()))?;
        let params_ref: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b.as_ref() as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                let rarity_str: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((rarity_str, count))
            })
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let mut out = HashMap::new();
        for row in rows {
            let (rarity_str, count) = row.map_err(|e| AppError::Transport(e.to_string()))?;
            if let Some(rarity) = rarity_from_str(&rarity_str) {
                out.insert(rarity, count as u64);
            }
        }
        Ok(out)
    }

    /// `skin.count`.
    pub fn count_skins(&self, filter: &SkinFilter) -> AppResult<u64> {
        let conn = self.conn()?;
        let (where_clause, binds) = build_where(filter);
        let sql = format!("SELECT COUNT(*) FROM skins {where_clause}");
        let params_ref: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b.as_ref() as &dyn rusqlite::ToSql).collect();
        let count: i64 = conn
            .query_row(&sql, params_ref.as_slice(), |row| row.get(0))
            .map_err(|e| AppError::Transport(e.to_string()))?;
        Ok(count as u64)
    }

    /// `skin.findMany({where, orderBy, skip, take})`.
    pub fn find_skins_paged(
        &self,
        filter: &SkinFilter,
        skip: u32,
        take: u32,
    ) -> AppResult<Vec<Skin>> {
        let conn = self.conn()?;
        self.find_skins_with_conn(&conn, filter, Some("base_name ASC"), Some(skip), Some(take))
    }

    fn find_skins_with_conn(
        &self,
        conn: &r2d2::PooledConnection<SqliteConnectionManager>,
        filter: &SkinFilter,
        order_by: Option<&str>,
        skip: Option<u32>,
        take: Option<u32>,
    ) -> AppResult<Vec<Skin>> {
        let (mut where_clause, mut binds) = build_where(filter);
        if where_clause.is_empty() {
            where_clause = String::new();
        }

        let mut sql = format!(
            "SELECT market_hash_name, collection_id, base_name, exterior, rarity, is_stattrak, \
             is_souvenir, sell_listings, last_known_price, float_min, float_max FROM skins {where_clause}"
        );
        if let Some(order) = order_by {
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(take) = take {
            sql.push_str(" LIMIT ?");
            binds.push(Box::new(take));
        }
        if let Some(skip) = skip {
            sql.push_str(" OFFSET ?");
            binds.push(Box::new(skip));
        }

        let mut stmt = conn.prepare(&sql).map_err(|e| AppError::Transport(e.to_string()))?;
        let params_ref: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b.as_ref() as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), row_to_skin)
            .map_err(|e| AppError::Transport(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| AppError::Transport(e.to_string()))
    }

    /// Upserts `collection`, upserts every skin in `skins`, and deletes
    /// every existing skin for that collection not present in `skins` —
    /// all inside a single transaction.
    #[instrument(skip(self, skins), fields(collection = %collection.steam_tag, observed = skins.len()))]
    pub fn sync_collection(&self, collection: &Collection, skins: &[Skin]) -> AppResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Transport(e.to_string()))?;

        tx.execute(
            "INSERT INTO collections (id, display_name, steam_tag, normalized_name)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                steam_tag = excluded.steam_tag,
                normalized_name = excluded.normalized_name",
            params![
                collection.id,
                collection.display_name,
                collection.steam_tag,
                collection.normalized_name
            ],
        )
        .map_err(|e| AppError::Transport(e.to_string()))?;

        for skin in skins {
            tx.execute(
                "INSERT INTO skins (market_hash_name, collection_id, base_name, exterior, rarity, \
                 is_stattrak, is_souvenir, sell_listings, last_known_price, float_min, float_max)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(market_hash_name) DO UPDATE SET
                    collection_id = excluded.collection_id,
                    base_name = excluded.base_name,
                    exterior = excluded.exterior,
                    rarity = excluded.rarity,
                    is_stattrak = excluded.is_stattrak,
                    is_souvenir = excluded.is_souvenir,
                    sell_listings = excluded.sell_listings,
                    last_known_price = excluded.last_known_price,
                    float_min = excluded.float_min,
                    float_max = excluded.float_max",
                params![
                    skin.market_hash_name,
                    skin.collection_id,
                    skin.base_name,
                    exterior_str(skin.exterior),
                    rarity_str(skin.rarity),
                    skin.is_stattrak,
                    skin.is_souvenir,
                    skin.sell_listings as i64,
                    skin.last_known_price,
                    skin.float_min,
                    skin.float_max,
                ],
            )
            .map_err(|e| AppError::Transport(e.to_string()))?;
        }

        let observed_names: Vec<&str> = skins.iter().map(|s| s.market_hash_name.as_str()).collect();
        let placeholders = observed_names
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let delete_sql = format!(
            "DELETE FROM skins WHERE collection_id = ? AND market_hash_name NOT IN ({})",
            if placeholders.is_empty() {
                "''".to_string()
            } else {
                placeholders
            }
        );
        let mut delete_binds: Vec<&dyn rusqlite::ToSql> = vec![&collection.id];
        delete_binds.extend(observed_names.iter().map(|n| n as &dyn rusqlite::ToSql));
        tx.execute(&delete_sql, delete_binds.as_slice())
            .map_err(|e| AppError::Transport(e.to_string()))?;

        tx.commit().map_err(|e| AppError::Transport(e.to_string()))?;
        Ok(())
    }
}

fn build_where(filter: &SkinFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses = Vec::new();
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(collection_id) = &filter.collection_id {
        clauses.push("collection_id = ?".to_string());
        binds.push(Box::new(collection_id.clone()));
    }
    if let Some(rarity) = filter.rarity {
        clauses.push("rarity = ?".to_string());
        binds.push(Box::new(rarity_str(rarity).to_string()));
    }
    if filter.normal_only {
        clauses.push("is_stattrak = 0 AND is_souvenir = 0".to_string());
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), binds)
    }
}

fn row_to_skin(row: &rusqlite::Row) -> rusqlite::Result<Skin> {
    let exterior_raw: String = row.get(3)?;
    let rarity_raw: String = row.get(4)?;
    Ok(Skin {
        market_hash_name: row.get(0)?,
        collection_id: row.get(1)?,
        base_name: row.get(2)?,
        exterior: exterior_from_str(&exterior_raw).unwrap_or(Exterior::FieldTested),
        rarity: rarity_from_str(&rarity_raw).unwrap_or(Rarity::Consumer),
        is_stattrak: row.get(5)?,
        is_souvenir: row.get(6)?,
        sell_listings: row.get::<_, i64>(7)? as u64,
        last_known_price: row.get(8)?,
        float_min: row.get(9)?,
        float_max: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Arc<SqliteStore> {
        SqliteStore::new(":memory:").unwrap()
    }

    fn sample_collection() -> Collection {
        Collection {
            id: "c1".to_string(),
            display_name: "The Operation Riptide Collection".to_string(),
            steam_tag: "set_community_16".to_string(),
            normalized_name: "riptide".to_string(),
        }
    }

    fn sample_skin(name: &str) -> Skin {
        Skin {
            market_hash_name: name.to_string(),
            collection_id: "c1".to_string(),
            base_name: "AK-47 | Slate".to_string(),
            exterior: Exterior::FieldTested,
            rarity: Rarity::Covert,
            is_stattrak: false,
            is_souvenir: false,
            sell_listings: 10,
            last_known_price: Some(12.5),
            float_min: Some(0.0),
            float_max: Some(1.0),
        }
    }

    #[test]
    fn catalog_ready_is_false_until_a_collection_exists() {
        let store = test_store();
        assert!(!store.catalog_ready().unwrap());
        store
            .sync_collection(&sample_collection(), &[sample_skin("AK-47 | Slate (Field-Tested)")])
            .unwrap();
        store.invalidate_catalog_ready();
        assert!(store.catalog_ready().unwrap());
    }

    #[test]
    fn sync_reconciles_removed_skins() {
        let store = test_store();
        let collection = sample_collection();

        store
            .sync_collection(
                &collection,
                &[
                    sample_skin("AK-47 | Slate (Field-Tested)"),
                    sample_skin("AK-47 | Slate (Minimal Wear)"),
                ],
            )
            .unwrap();

        let filter = SkinFilter {
            collection_id: Some(collection.id.clone()),
            ..Default::default()
        };
        assert_eq!(store.count_skins(&filter).unwrap(), 2);

        // A second sync that only observed one of the two skins must
        // delete the one that disappeared.
        store
            .sync_collection(&collection, &[sample_skin("AK-47 | Slate (Field-Tested)")])
            .unwrap();
        assert_eq!(store.count_skins(&filter).unwrap(), 1);
    }

    #[test]
    fn find_collection_by_tag_returns_nested_skins() {
        let store = test_store();
        let collection = sample_collection();
        store
            .sync_collection(&collection, &[sample_skin("AK-47 | Slate (Field-Tested)")])
            .unwrap();

        let (found, skins) = store
            .find_collection_by_tag(&collection.steam_tag, &SkinFilter::default())
            .unwrap()
            .unwrap();
        assert_eq!(found.id, collection.id);
        assert_eq!(skins.len(), 1);
    }

    #[test]
    fn find_collection_by_unknown_tag_returns_none() {
        let store = test_store();
        assert!(store
            .find_collection_by_tag("unknown_tag", &SkinFilter::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn reopening_a_file_backed_store_preserves_synced_data() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        {
            let store = SqliteStore::new(db_path).unwrap();
            store
                .sync_collection(&sample_collection(), &[sample_skin("AK-47 | Slate (Field-Tested)")])
                .unwrap();
        }

        let reopened = SqliteStore::new(db_path).unwrap();
        assert!(reopened.catalog_ready().unwrap());
        let filter = SkinFilter {
            collection_id: Some("c1".to_string()),
            ..Default::default()
        };
        assert_eq!(reopened.count_skins(&filter).unwrap(), 1);
    }
}
