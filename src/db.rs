use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::model::{Embedding, Question, QuestionCluster, Scope, SessionStatus};

/// A cluster about to be written, with the questions it owns
#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub iteration: u32,
    pub label: Option<String>,
    pub representative_question: String,
    pub centroid: Option<Embedding>,
    pub question_ids: Vec<String>,
}

/// What the analysis pipeline needs from the question store.
///
/// Implementations are shared by every worker and may block; async callers
/// go through `spawn_blocking`. Each call is independent except
/// `replace_clusters`, which must be all-or-nothing.
pub trait QuestionStore: Send + Sync {
    /// Questions in `scope`, oldest submission first
    fn questions_in_scope(&self, scope: &Scope) -> Result<Vec<Question>>;

    fn set_embedding(&self, question_id: &str, embedding: &[f32]) -> Result<()>;

    /// Drop every cluster of `scope`, and every older cluster holding a
    /// question of `scope`, then write `clusters` in their place and assign
    /// each listed question. Members of a dropped cluster that fall outside
    /// `scope` end up unclustered. Either everything lands or nothing.
    fn replace_clusters(&self, scope: &Scope, clusters: &[NewCluster])
        -> Result<Vec<QuestionCluster>>;

    fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()>;
}

/// Connections kept open against a database file
pub const DEFAULT_POOL_SIZE: u32 = 8;

/// How long a writer waits for another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Create a new in-memory database.
    ///
    /// Each `:memory:` connection is its own database, so the pool holds one
    /// and never retires it.
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.pragma_update(None, "foreign_keys", "ON"));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .context("Failed to create in-memory database")?;
        Self::init(pool)
    }

    /// Open (or create) a database file
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_pool_size(path, DEFAULT_POOL_SIZE)
    }

    /// Open a database file behind a pool of `max_connections` connections
    pub fn open_with_pool_size(path: &str, max_connections: u32) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.busy_timeout(BUSY_TIMEOUT)?;
            c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            c.pragma_update(None, "foreign_keys", "ON")
        });
        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .build(manager)
            .with_context(|| format!("Failed to open database at {}", path))?;
        Self::init(pool)
    }

    fn init(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        let store = Self { pool };
        store.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                analyzed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS question_clusters (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                cluster_label TEXT,
                representative_question TEXT NOT NULL,
                question_count INTEGER NOT NULL,
                centroid_embedding BLOB,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS questions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                question_text TEXT NOT NULL,
                embedding BLOB,
                cluster_id TEXT,
                iteration INTEGER NOT NULL DEFAULT 1,
                submitted_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id),
                FOREIGN KEY (cluster_id) REFERENCES question_clusters(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_questions_session ON questions(session_id, iteration);
            CREATE INDEX IF NOT EXISTS idx_questions_cluster ON questions(cluster_id);
            CREATE INDEX IF NOT EXISTS idx_clusters_session ON question_clusters(session_id, iteration);
            "#,
        )
        .context("Failed to initialize database schema")?;

        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("Failed to get database connection")
    }

    pub fn create_session(&self, id: &str, title: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO sessions (id, title) VALUES (?1, ?2)",
                params![id, title],
            )
            .with_context(|| format!("Failed to create session: {}", id))?;
        Ok(())
    }

    /// Record a submission; returns the stored question
    pub fn insert_question(
        &self,
        session_id: &str,
        text: &str,
        iteration: u32,
        submitted_at: DateTime<Utc>,
    ) -> Result<Question> {
        let id = Uuid::new_v4().to_string();
        self.conn()?
            .execute(
                "INSERT INTO questions (id, session_id, question_text, iteration, submitted_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, session_id, text, iteration, submitted_at],
            )
            .with_context(|| format!("Failed to insert question for session: {}", session_id))?;

        Ok(Question {
            id,
            session_id: session_id.to_string(),
            text: text.to_string(),
            embedding: None,
            cluster_id: None,
            iteration,
            submitted_at,
        })
    }

    pub fn session_status(&self, session_id: &str) -> Result<Option<SessionStatus>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read session status")?;

        match raw {
            Some(s) => match SessionStatus::parse(&s) {
                Some(status) => Ok(Some(status)),
                None => bail!("Unknown session status {:?} for {}", s, session_id),
            },
            None => Ok(None),
        }
    }

    pub fn get_question(&self, question_id: &str) -> Result<Option<Question>> {
        self.conn()?
            .query_row(
                "SELECT id, session_id, question_text, embedding, cluster_id, iteration, submitted_at FROM questions WHERE id = ?1",
                params![question_id],
                question_from_row,
            )
            .optional()
            .context("Failed to query question")
    }

    /// Clusters of `scope`, oldest first
    pub fn clusters_in_scope(&self, scope: &Scope) -> Result<Vec<QuestionCluster>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, iteration, cluster_label, representative_question, question_count, centroid_embedding, created_at
                 FROM question_clusters
                 WHERE session_id = ?1 AND (?2 IS NULL OR iteration = ?2)
                 ORDER BY created_at ASC, rowid ASC",
            )
            .context("Failed to prepare statement")?;

        let clusters = stmt
            .query_map(params![scope.session_id, scope.iteration], cluster_from_row)
            .context("Failed to query clusters")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect clusters")?;

        Ok(clusters)
    }

    pub fn question_ids_in_cluster(&self, cluster_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM questions WHERE cluster_id = ?1 ORDER BY submitted_at ASC, rowid ASC")
            .context("Failed to prepare statement")?;

        let ids = stmt
            .query_map(params![cluster_id], |row| row.get(0))
            .context("Failed to query cluster members")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to collect cluster members")?;

        Ok(ids)
    }
}

impl QuestionStore for SqliteStore {
    fn questions_in_scope(&self, scope: &Scope) -> Result<Vec<Question>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, question_text, embedding, cluster_id, iteration, submitted_at
                 FROM questions
                 WHERE session_id = ?1 AND (?2 IS NULL OR iteration = ?2)
                 ORDER BY submitted_at ASC, rowid ASC",
            )
            .context("Failed to prepare statement")?;

        let questions = stmt
            .query_map(params![scope.session_id, scope.iteration], question_from_row)
            .context("Failed to query questions")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect questions")?;

        Ok(questions)
    }

    fn set_embedding(&self, question_id: &str, embedding: &[f32]) -> Result<()> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE questions SET embedding = ?1 WHERE id = ?2",
                params![encode_vector(embedding), question_id],
            )
            .with_context(|| format!("Failed to store embedding for question: {}", question_id))?;

        if updated == 0 {
            bail!("Question not found: {}", question_id);
        }
        Ok(())
    }

    fn replace_clusters(
        &self,
        scope: &Scope,
        clusters: &[NewCluster],
    ) -> Result<Vec<QuestionCluster>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        // The scope's own clusters, plus older clusters that reach into it
        let superseded: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM question_clusters
                     WHERE session_id = ?1
                       AND ((?2 IS NULL OR iteration = ?2)
                            OR id IN (SELECT cluster_id FROM questions
                                      WHERE session_id = ?1
                                        AND (?2 IS NULL OR iteration = ?2)
                                        AND cluster_id IS NOT NULL))",
                )
                .context("Failed to prepare statement")?;
            let ids = stmt
                .query_map(params![scope.session_id, scope.iteration], |row| row.get(0))
                .context("Failed to find previous clusters")?
                .collect::<Result<Vec<String>, _>>()
                .context("Failed to collect previous clusters")?;
            ids
        };

        for cluster_id in &superseded {
            tx.execute(
                "UPDATE questions SET cluster_id = NULL WHERE cluster_id = ?1",
                params![cluster_id],
            )
            .with_context(|| format!("Failed to release members of cluster: {}", cluster_id))?;
            tx.execute(
                "DELETE FROM question_clusters WHERE id = ?1",
                params![cluster_id],
            )
            .with_context(|| format!("Failed to delete cluster: {}", cluster_id))?;
        }

        let now = Utc::now();
        let mut written = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            let id = Uuid::new_v4().to_string();
            let count = cluster.question_ids.len() as u32;

            tx.execute(
                "INSERT INTO question_clusters (id, session_id, iteration, cluster_label, representative_question, question_count, centroid_embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    scope.session_id,
                    cluster.iteration,
                    cluster.label,
                    cluster.representative_question,
                    count,
                    cluster.centroid.as_deref().map(encode_vector),
                    now
                ],
            )
            .with_context(|| format!("Failed to insert cluster for session: {}", scope.session_id))?;

            for question_id in &cluster.question_ids {
                let updated = tx
                    .execute(
                        "UPDATE questions SET cluster_id = ?1 WHERE id = ?2 AND session_id = ?3",
                        params![id, question_id, scope.session_id],
                    )
                    .with_context(|| format!("Failed to assign question: {}", question_id))?;
                if updated != 1 {
                    bail!(
                        "Question {} does not belong to session {}",
                        question_id,
                        scope.session_id
                    );
                }
            }

            written.push(QuestionCluster {
                id,
                session_id: scope.session_id.clone(),
                iteration: cluster.iteration,
                label: cluster.label.clone(),
                representative_question: cluster.representative_question.clone(),
                question_count: count,
                centroid: cluster.centroid.clone(),
                created_at: now,
            });
        }

        tx.commit().context("Failed to commit clusters")?;
        Ok(written)
    }

    fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let analyzed_at = (status == SessionStatus::Analyzed).then(Utc::now);
        let updated = self
            .conn()?
            .execute(
                "UPDATE sessions SET status = ?1, analyzed_at = COALESCE(?2, analyzed_at) WHERE id = ?3",
                params![status.as_str(), analyzed_at, session_id],
            )
            .with_context(|| format!("Failed to update status of session: {}", session_id))?;

        if updated == 0 {
            bail!("Session not found: {}", session_id);
        }
        Ok(())
    }
}

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<Question> {
    let embedding: Option<Vec<u8>> = row.get(3)?;
    Ok(Question {
        id: row.get(0)?,
        session_id: row.get(1)?,
        text: row.get(2)?,
        embedding: embedding.and_then(|b| decode_vector(&b)),
        cluster_id: row.get(4)?,
        iteration: row.get(5)?,
        submitted_at: row.get(6)?,
    })
}

fn cluster_from_row(row: &Row<'_>) -> rusqlite::Result<QuestionCluster> {
    let centroid: Option<Vec<u8>> = row.get(6)?;
    Ok(QuestionCluster {
        id: row.get(0)?,
        session_id: row.get(1)?,
        iteration: row.get(2)?,
        label: row.get(3)?,
        representative_question: row.get(4)?,
        question_count: row.get(5)?,
        centroid: centroid.and_then(|b| decode_vector(&b)),
        created_at: row.get(7)?,
    })
}

/// Little-endian f32 bytes
fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// `None` for a blob that is not a whole number of f32s
fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        warn!(bytes = bytes.len(), "discarding truncated vector blob");
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_session() -> SqliteStore {
        let store = SqliteStore::new_in_memory().unwrap();
        store.create_session("s1", "Intro lecture").unwrap();
        store
    }

    fn add(store: &SqliteStore, text: &str, iteration: u32, offset_secs: i64) -> Question {
        let at = DateTime::parse_from_rfc3339("2026-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(offset_secs);
        store.insert_question("s1", text, iteration, at).unwrap()
    }

    fn cluster(ids: &[&str], iteration: u32) -> NewCluster {
        NewCluster {
            iteration,
            label: Some("label".into()),
            representative_question: "rep?".into(),
            centroid: Some(vec![0.5, -0.25]),
            question_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_vector_blob_round_trip() {
        let v = vec![0.0, -1.5, 3.25, f32::MIN_POSITIVE];
        assert_eq!(decode_vector(&encode_vector(&v)), Some(v));
    }

    #[test]
    fn test_truncated_embedding_blob_reads_as_missing() {
        let store = store_with_session();
        let q = add(&store, "q", 1, 0);
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE questions SET embedding = ?1 WHERE id = ?2",
                params![vec![0u8; 5], q.id],
            )
            .unwrap();

        assert!(store.get_question(&q.id).unwrap().unwrap().embedding.is_none());
        let in_scope = store.questions_in_scope(&Scope::session("s1")).unwrap();
        assert!(in_scope[0].embedding.is_none());
    }

    #[test]
    fn test_questions_ordered_by_submission() {
        let store = store_with_session();
        let late = add(&store, "late", 1, 30);
        let early = add(&store, "early", 1, 0);
        let other = add(&store, "round two", 2, 10);

        let all = store.questions_in_scope(&Scope::session("s1")).unwrap();
        let ids: Vec<&str> = all.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec![early.id.as_str(), other.id.as_str(), late.id.as_str()]);

        let round_two = store.questions_in_scope(&Scope::iteration("s1", 2)).unwrap();
        assert_eq!(round_two.len(), 1);
        assert_eq!(round_two[0].text, "round two");
    }

    #[test]
    fn test_set_embedding_persists_vector() {
        let store = store_with_session();
        let q = add(&store, "q", 1, 0);
        store.set_embedding(&q.id, &[0.1, 0.2, 0.3]).unwrap();

        let loaded = store.get_question(&q.id).unwrap().unwrap();
        assert_eq!(loaded.embedding, Some(vec![0.1, 0.2, 0.3]));
        assert!(store.set_embedding("missing", &[1.0]).is_err());
    }

    #[test]
    fn test_replace_clusters_assigns_members() {
        let store = store_with_session();
        let a = add(&store, "a", 1, 0);
        let b = add(&store, "b", 1, 1);
        let c = add(&store, "c", 1, 2);

        let scope = Scope::session("s1");
        let written = store
            .replace_clusters(&scope, &[cluster(&[&a.id, &c.id], 1)])
            .unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].question_count, 2);

        let members = store.question_ids_in_cluster(&written[0].id).unwrap();
        assert_eq!(members, vec![a.id.clone(), c.id.clone()]);
        assert!(store.get_question(&b.id).unwrap().unwrap().cluster_id.is_none());

        let stored = store.clusters_in_scope(&scope).unwrap();
        assert_eq!(stored[0].centroid, Some(vec![0.5, -0.25]));
        assert_eq!(stored[0].label.as_deref(), Some("label"));
    }

    #[test]
    fn test_rerun_supersedes_previous_clusters() {
        let store = store_with_session();
        let a = add(&store, "a", 1, 0);
        let b = add(&store, "b", 1, 1);
        let scope = Scope::session("s1");

        store.replace_clusters(&scope, &[cluster(&[&a.id, &b.id], 1)]).unwrap();
        store.replace_clusters(&scope, &[cluster(&[&a.id, &b.id], 1)]).unwrap();

        let clusters = store.clusters_in_scope(&scope).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(
            store.question_ids_in_cluster(&clusters[0].id).unwrap().len() as u32,
            clusters[0].question_count
        );

        store.replace_clusters(&scope, &[]).unwrap();
        assert!(store.clusters_in_scope(&scope).unwrap().is_empty());
        assert!(store.get_question(&a.id).unwrap().unwrap().cluster_id.is_none());
    }

    #[test]
    fn test_iteration_rerun_leaves_other_iterations() {
        let store = store_with_session();
        let a1 = add(&store, "a1", 1, 0);
        let b1 = add(&store, "b1", 1, 1);
        let a2 = add(&store, "a2", 2, 2);
        let b2 = add(&store, "b2", 2, 3);

        store
            .replace_clusters(&Scope::iteration("s1", 1), &[cluster(&[&a1.id, &b1.id], 1)])
            .unwrap();
        store
            .replace_clusters(&Scope::iteration("s1", 2), &[cluster(&[&a2.id, &b2.id], 2)])
            .unwrap();
        store.replace_clusters(&Scope::iteration("s1", 2), &[]).unwrap();

        let all = store.clusters_in_scope(&Scope::session("s1")).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].iteration, 1);
        assert_eq!(all[0].question_count, 2);
    }

    #[test]
    fn test_iteration_rerun_drops_straddling_cluster() {
        let store = store_with_session();
        let a1 = add(&store, "a1", 1, 0);
        let a2 = add(&store, "a2", 2, 1);
        let b2 = add(&store, "b2", 2, 2);

        // Session-wide run tags the cluster with the first question's round
        let old = store
            .replace_clusters(&Scope::session("s1"), &[cluster(&[&a1.id, &a2.id, &b2.id], 1)])
            .unwrap();
        let new = store
            .replace_clusters(&Scope::iteration("s1", 2), &[cluster(&[&a2.id, &b2.id], 2)])
            .unwrap();

        let all = store.clusters_in_scope(&Scope::session("s1")).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, new[0].id);
        assert_eq!(all[0].question_count, 2);
        assert!(store.question_ids_in_cluster(&old[0].id).unwrap().is_empty());
        assert!(store.get_question(&a1.id).unwrap().unwrap().cluster_id.is_none());

        // Same again with nothing to write back
        store
            .replace_clusters(&Scope::session("s1"), &[cluster(&[&a1.id, &a2.id, &b2.id], 1)])
            .unwrap();
        store.replace_clusters(&Scope::iteration("s1", 2), &[]).unwrap();
        assert!(store.clusters_in_scope(&Scope::session("s1")).unwrap().is_empty());
        assert!(store.get_question(&a1.id).unwrap().unwrap().cluster_id.is_none());
    }

    #[test]
    fn test_failed_replace_rolls_back() {
        let store = store_with_session();
        let a = add(&store, "a", 1, 0);
        let b = add(&store, "b", 1, 1);
        let scope = Scope::session("s1");
        let original = store
            .replace_clusters(&scope, &[cluster(&[&a.id, &b.id], 1)])
            .unwrap();

        let err = store.replace_clusters(
            &scope,
            &[cluster(&[&a.id], 1), cluster(&[&b.id, "no-such-question"], 1)],
        );
        assert!(err.is_err());

        let clusters = store.clusters_in_scope(&scope).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, original[0].id);
        assert_eq!(store.question_ids_in_cluster(&original[0].id).unwrap().len(), 2);
    }

    #[test]
    fn test_file_pool_serves_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("questions.db");
        let store = SqliteStore::open_with_pool_size(path.to_str().unwrap(), 4).unwrap();
        store.create_session("s1", "Pooled").unwrap();

        let mode: String = store
            .conn()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..5 {
                        let q = add(store, &format!("w{worker} q{i}"), 1, i);
                        store.set_embedding(&q.id, &[worker as f32, i as f32]).unwrap();
                    }
                });
            }
        });

        let all = store.questions_in_scope(&Scope::session("s1")).unwrap();
        assert_eq!(all.len(), 20);
        assert!(all.iter().all(|q| q.embedding.is_some()));

        let reopened = SqliteStore::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reopened.questions_in_scope(&Scope::session("s1")).unwrap().len(), 20);
    }

    #[test]
    fn test_session_status_updates() {
        let store = store_with_session();
        assert_eq!(store.session_status("s1").unwrap(), Some(SessionStatus::Waiting));

        store.set_session_status("s1", SessionStatus::Analyzed).unwrap();
        assert_eq!(store.session_status("s1").unwrap(), Some(SessionStatus::Analyzed));

        assert!(store.set_session_status("nope", SessionStatus::Analyzed).is_err());
        assert_eq!(store.session_status("nope").unwrap(), None);
    }
}
