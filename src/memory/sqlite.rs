//! SQLite-backed fact store for the L1 and L2 tiers.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

use super::ports::*;
use super::schema::initialize_schema;
use super::types::*;

const FACT_COLUMNS: &str = "id, scope, text, subject, predicate, object, certainty, impact,
    criticality, ciar_score, created_at, valid_from, valid_to, superseded_by, source_ref,
    access_count, last_accessed_at, promoted_at, scored_at";

/// Fact store persisted in SQLite.
///
/// L1 and L2 handles can share one connection via [`SqliteFactStore::for_tier`];
/// rows are keyed by `(id, tier)`.
pub struct SqliteFactStore {
    conn: Arc<Mutex<Connection>>,
    tier: Tier,
}

impl SqliteFactStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, tier: Tier) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        // Creates a fresh schema or migrates an older one
        initialize_schema(&conn).map_err(sql_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tier,
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(tier: Tier) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        initialize_schema(&conn).map_err(sql_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tier,
        })
    }

    /// Handle for another tier on the same database.
    pub fn for_tier(&self, tier: Tier) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            tier,
        }
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::connection(format!("Failed to lock connection: {}", e)))?;
        f(&conn)
    }

    fn load(&self, conn: &Connection, id: &FactId) -> Result<Fact, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM facts WHERE id = ?1 AND tier = ?2", FACT_COLUMNS),
            params![id.to_string(), self.tier as i64],
            row_to_fact,
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StoreError::not_found(Fact::KIND, id))
    }

    fn write(&self, conn: &Connection, fact: &Fact) -> Result<(), StoreError> {
        let (subject, predicate, object) = match &fact.triple {
            Some(t) => (
                Some(t.subject.as_str()),
                Some(t.predicate.as_str()),
                Some(t.object.as_str()),
            ),
            None => (None, None, None),
        };

        conn.execute(
            "INSERT OR REPLACE INTO facts (
                id, tier, scope, text, subject, predicate, object, certainty, impact,
                criticality, ciar_score, created_at, valid_from, valid_to, superseded_by,
                source_ref, access_count, last_accessed_at, promoted_at, scored_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
            )",
            params![
                fact.id.to_string(),
                self.tier as i64,
                fact.scope.as_str(),
                fact.text,
                subject,
                predicate,
                object,
                fact.certainty,
                fact.impact,
                fact.criticality,
                fact.ciar_score,
                ts(fact.created_at),
                ts(fact.validity.valid_from),
                fact.validity.valid_to.map(ts),
                fact.superseded_by.as_ref().map(|e| e.to_string()),
                fact.source_ref,
                fact.access_count as i64,
                fact.last_accessed_at.map(ts),
                fact.promoted_at.map(ts),
                fact.scored_at.map(ts),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

#[async_trait]
impl TierStore<Fact> for SqliteFactStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn put(&self, item: &Fact) -> Result<FactId, StoreError> {
        self.with_conn(|conn| self.write(conn, item))?;
        Ok(item.id.clone())
    }

    async fn get(&self, id: &FactId) -> Result<Fact, StoreError> {
        self.with_conn(|conn| self.load(conn, id))
    }

    async fn query(&self, query: &ItemQuery) -> Result<Vec<Fact>, StoreError> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {} FROM facts WHERE tier = ?", FACT_COLUMNS);
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(self.tier as i64)];

            if let Some(ref scope) = query.scope {
                sql.push_str(" AND scope = ?");
                params_vec.push(Box::new(scope.as_str().to_string()));
            }

            if query.current_only {
                sql.push_str(" AND valid_to IS NULL");
            }

            if let Some(at) = query.as_of {
                sql.push_str(" AND valid_from <= ? AND (valid_to IS NULL OR valid_to > ?)");
                params_vec.push(Box::new(ts(at)));
                params_vec.push(Box::new(ts(at)));
            }

            if let Some(window) = query.valid_from_in {
                sql.push_str(" AND valid_from >= ? AND valid_from <= ?");
                params_vec.push(Box::new(ts(window.start)));
                params_vec.push(Box::new(ts(window.end)));
            }

            if let Some(before) = query.recorded_before {
                sql.push_str(" AND created_at <= ?");
                params_vec.push(Box::new(ts(before)));
            }

            sql.push_str(" ORDER BY created_at, id");

            // Text matching happens after the fetch, so paging must too
            let page_in_sql = query.text.is_none();
            if page_in_sql {
                if let Some(limit) = query.limit {
                    sql.push_str(&format!(" LIMIT {}", limit));
                    if let Some(offset) = query.offset {
                        sql.push_str(&format!(" OFFSET {}", offset));
                    }
                } else if let Some(offset) = query.offset {
                    sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset));
                }
            }

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let facts = stmt
                .query_map(params_refs.as_slice(), row_to_fact)
                .map_err(sql_err)?
                .collect::<rusqlite::Result<Vec<Fact>>>()
                .map_err(sql_err)?;

            if page_in_sql {
                return Ok(facts);
            }
            Ok(facts
                .into_iter()
                .filter(|f| query.matches(f))
                .skip(query.offset.unwrap_or(0))
                .take(query.limit.unwrap_or(usize::MAX))
                .collect())
        })
    }

    async fn mark_superseded(
        &self,
        id: &FactId,
        valid_to: DateTime<Utc>,
        superseded_by: Option<EpisodeId>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let mut fact = self.load(conn, id)?;
            close_item(&mut fact, valid_to, superseded_by)?;
            conn.execute(
                "UPDATE facts SET valid_to = ?3, superseded_by = ?4
                 WHERE id = ?1 AND tier = ?2 AND valid_to IS NULL",
                params![
                    id.to_string(),
                    self.tier as i64,
                    fact.validity.valid_to.map(ts),
                    fact.superseded_by.as_ref().map(|e| e.to_string()),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn record_access(&self, id: &FactId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let rows = conn
                .execute(
                    "UPDATE facts SET access_count = access_count + 1, last_accessed_at = ?3
                     WHERE id = ?1 AND tier = ?2",
                    params![id.to_string(), self.tier as i64, ts(at)],
                )
                .map_err(sql_err)?;
            if rows == 0 {
                return Err(StoreError::not_found(Fact::KIND, id));
            }
            Ok(())
        })
    }
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::connection(e.to_string())
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, e)),
        None => Ok(None),
    }
}

fn row_to_fact(row: &rusqlite::Row) -> rusqlite::Result<Fact> {
    let id_str: String = row.get(0)?;
    let id = FactId::parse(&id_str).map_err(|e| conversion_err(0, e))?;

    let triple = match (
        row.get::<_, Option<String>>(3)?,
        row.get::<_, Option<String>>(4)?,
        row.get::<_, Option<String>>(5)?,
    ) {
        (Some(s), Some(p), Some(o)) => Some(Triple::new(s, p, o)),
        _ => None,
    };

    let superseded_by = match row.get::<_, Option<String>>(13)? {
        Some(s) => Some(EpisodeId::parse(&s).map_err(|e| conversion_err(13, e))?),
        None => None,
    };

    Ok(Fact {
        id,
        scope: Scope::new(row.get::<_, String>(1)?),
        text: row.get(2)?,
        triple,
        certainty: row.get(6)?,
        impact: row.get(7)?,
        criticality: row.get(8)?,
        ciar_score: row.get(9)?,
        created_at: parse_ts(row, 10)?,
        validity: Validity {
            valid_from: parse_ts(row, 11)?,
            valid_to: parse_opt_ts(row, 12)?,
        },
        superseded_by,
        source_ref: row.get(14)?,
        access_count: row.get::<_, i64>(15)? as u64,
        last_accessed_at: parse_opt_ts(row, 16)?,
        promoted_at: parse_opt_ts(row, 17)?,
        scored_at: parse_opt_ts(row, 18)?,
    })
}
