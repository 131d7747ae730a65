use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rank_kernel_core::{
    created_at_score, GroupId, OrderKey, PostId, PostMeta, PostResolver, RankError, RankingStore,
    UserId, VoteCounts, VoteDirection,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS posts (
  post_id INTEGER PRIMARY KEY,
  group_id INTEGER NOT NULL CHECK (group_id >= 1),
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS post_votes (
  post_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  direction INTEGER NOT NULL CHECK (direction IN (-1, 1)),
  PRIMARY KEY (post_id, user_id)
);

CREATE TABLE IF NOT EXISTS ranking_entries (
  order_key TEXT NOT NULL CHECK (order_key IN ('time','score')),
  group_id INTEGER NOT NULL,
  post_id INTEGER NOT NULL,
  score REAL NOT NULL,
  PRIMARY KEY (order_key, group_id, post_id)
);

CREATE INDEX IF NOT EXISTS idx_posts_group ON posts(group_id);
CREATE INDEX IF NOT EXISTS idx_ranking_entries_range
  ON ranking_entries(order_key, group_id, score DESC, post_id DESC);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed ranking store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist a newly created post row, making it resolvable for vote checks.
    ///
    /// # Errors
    /// Returns an error when the post id collides or the write fails.
    pub fn insert_post(&mut self, post: PostId, group: GroupId, created_at: i64) -> Result<()> {
        if group == GroupId::GLOBAL {
            return Err(anyhow!("group id 0 is reserved for the global scope"));
        }

        self.conn
            .execute(
                "INSERT INTO posts(post_id, group_id, created_at) VALUES (?1, ?2, ?3)",
                params![db_id(post.0)?, db_id(group.0)?, created_at],
            )
            .with_context(|| format!("failed to insert post {post}"))?;
        Ok(())
    }
}

impl PostResolver for SqliteStore {
    fn resolve_post(&self, post: PostId) -> Result<Option<PostMeta>, RankError> {
        let row = self
            .conn
            .query_row(
                "SELECT group_id, created_at FROM posts WHERE post_id = ?1",
                params![db_id(post.0)?],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(|err| store_err("failed to resolve post", &err))?;

        match row {
            Some((group_id, created_at)) => {
                Ok(Some(PostMeta { group_id: GroupId(domain_id(group_id)?), created_at }))
            }
            None => Ok(None),
        }
    }
}

impl RankingStore for SqliteStore {
    fn seed_rankings(
        &mut self,
        post: PostId,
        group: GroupId,
        created_at: i64,
    ) -> Result<(), RankError> {
        let post_id = db_id(post.0)?;
        let group_id = db_id(group.0)?;
        let score = created_at_score(created_at);

        let tx = self
            .conn
            .transaction()
            .map_err(|err| store_err("failed to start seed transaction", &err))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO ranking_entries(order_key, group_id, post_id, score)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(order_key, group_id, post_id)
                     DO UPDATE SET score = excluded.score",
                )
                .map_err(|err| store_err("failed to prepare seed statement", &err))?;

            for order in [OrderKey::Time, OrderKey::Score] {
                for scope in [0_i64, group_id] {
                    stmt.execute(params![order.as_str(), scope, post_id, score])
                        .map_err(|err| store_err("failed to seed ranking entry", &err))?;
                }
            }
        }
        tx.commit().map_err(|err| store_err("failed to commit seed transaction", &err))?;
        Ok(())
    }

    fn vote_direction(&self, post: PostId, user: UserId) -> Result<VoteDirection, RankError> {
        let raw = self
            .conn
            .query_row(
                "SELECT direction FROM post_votes WHERE post_id = ?1 AND user_id = ?2",
                params![db_id(post.0)?, db_id(user.0)?],
                |row| row.get::<_, i8>(0),
            )
            .optional()
            .map_err(|err| store_err("failed to read vote direction", &err))?;

        match raw {
            Some(raw) => VoteDirection::from_i8(raw)
                .ok_or_else(|| RankError::Store(format!("invalid vote direction in store: {raw}"))),
            None => Ok(VoteDirection::None),
        }
    }

    fn apply_vote(
        &mut self,
        post: PostId,
        group: GroupId,
        user: UserId,
        direction: VoteDirection,
        delta: f64,
    ) -> Result<(), RankError> {
        let post_id = db_id(post.0)?;
        let group_id = db_id(group.0)?;
        let user_id = db_id(user.0)?;

        let tx = self
            .conn
            .transaction()
            .map_err(|err| store_err("failed to start vote transaction", &err))?;

        // Incrementing a missing score row creates it at the delta, so votes
        // cast before seeding (or after a failed seed) still rank the post.
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO ranking_entries(order_key, group_id, post_id, score)
                     VALUES ('score', ?1, ?2, ?3)
                     ON CONFLICT(order_key, group_id, post_id)
                     DO UPDATE SET score = score + excluded.score",
                )
                .map_err(|err| store_err("failed to prepare score delta statement", &err))?;
            for scope in [0_i64, group_id] {
                stmt.execute(params![scope, post_id, delta])
                    .map_err(|err| store_err("failed to apply score delta", &err))?;
            }
        }

        match direction {
            VoteDirection::None => {
                tx.execute(
                    "DELETE FROM post_votes WHERE post_id = ?1 AND user_id = ?2",
                    params![post_id, user_id],
                )
                .map_err(|err| store_err("failed to delete vote row", &err))?;
            }
            VoteDirection::Up | VoteDirection::Down => {
                tx.execute(
                    "INSERT INTO post_votes(post_id, user_id, direction) VALUES (?1, ?2, ?3)
                     ON CONFLICT(post_id, user_id) DO UPDATE SET direction = excluded.direction",
                    params![post_id, user_id, direction.as_i8()],
                )
                .map_err(|err| store_err("failed to upsert vote row", &err))?;
            }
        }

        tx.commit().map_err(|err| store_err("failed to commit vote transaction", &err))?;
        Ok(())
    }

    fn post_ids_in_order(
        &self,
        scope: Option<GroupId>,
        order: OrderKey,
        page: u64,
        size: u64,
    ) -> Result<Vec<PostId>, RankError> {
        let group_id = match scope {
            Some(group) => db_id(group.0)?,
            None => 0,
        };
        let limit = db_id(size)?;
        let offset = db_id(page.saturating_sub(1).saturating_mul(size))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT post_id FROM ranking_entries
                 WHERE order_key = ?1 AND group_id = ?2
                 ORDER BY score DESC, post_id DESC
                 LIMIT ?3 OFFSET ?4",
            )
            .map_err(|err| store_err("failed to prepare ranking query", &err))?;
        let rows = stmt
            .query_map(params![order.as_str(), group_id, limit, offset], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|err| store_err("failed to query ranking entries", &err))?;

        let mut ids = Vec::new();
        for row in rows {
            let raw = row.map_err(|err| store_err("failed to read ranking row", &err))?;
            ids.push(PostId(domain_id(raw)?));
        }
        Ok(ids)
    }

    fn vote_counts(&self, post: PostId) -> Result<VoteCounts, RankError> {
        let (upvotes, downvotes) = self
            .conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN direction = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN direction = -1 THEN 1 ELSE 0 END), 0)
                 FROM post_votes WHERE post_id = ?1",
                params![db_id(post.0)?],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(|err| store_err("failed to count votes", &err))?;

        Ok(VoteCounts { upvotes: domain_id(upvotes)?, downvotes: domain_id(downvotes)? })
    }

    fn vote_counts_batch(&self, posts: &[PostId]) -> Result<Vec<u64>, RankError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT COUNT(*) FROM post_votes WHERE post_id = ?1 AND direction = 1",
            )
            .map_err(|err| store_err("failed to prepare batch count statement", &err))?;

        let mut counts = Vec::with_capacity(posts.len());
        for post in posts {
            let count = stmt
                .query_row(params![db_id(post.0)?], |row| row.get::<_, i64>(0))
                .map_err(|err| store_err("failed to count votes in batch", &err))?;
            counts.push(domain_id(count)?);
        }
        Ok(counts)
    }

    fn vote_status_batch(
        &self,
        user: UserId,
        posts: &[PostId],
    ) -> Result<BTreeMap<PostId, VoteDirection>, RankError> {
        let user_id = db_id(user.0)?;
        let mut stmt = self
            .conn
            .prepare("SELECT direction FROM post_votes WHERE post_id = ?1 AND user_id = ?2")
            .map_err(|err| store_err("failed to prepare batch status statement", &err))?;

        let mut statuses = BTreeMap::new();
        for post in posts {
            let raw = stmt
                .query_row(params![db_id(post.0)?, user_id], |row| row.get::<_, i8>(0))
                .optional()
                .map_err(|err| store_err("failed to read vote status in batch", &err))?;
            let direction = match raw {
                Some(raw) => VoteDirection::from_i8(raw).ok_or_else(|| {
                    RankError::Store(format!("invalid vote direction in store: {raw}"))
                })?,
                None => VoteDirection::None,
            };
            statuses.insert(*post, direction);
        }
        Ok(statuses)
    }

    fn post_score(&self, post: PostId) -> Result<Option<f64>, RankError> {
        self.conn
            .query_row(
                "SELECT score FROM ranking_entries
                 WHERE order_key = 'score' AND group_id = 0 AND post_id = ?1",
                params![db_id(post.0)?],
                |row| row.get::<_, f64>(0),
            )
            .optional()
            .map_err(|err| store_err("failed to read post score", &err))
    }
}

fn store_err(what: &str, err: &dyn Display) -> RankError {
    RankError::Store(format!("{what}: {err}"))
}

// SQLite integers are signed; ids above i64::MAX cannot be stored.
fn db_id(value: u64) -> Result<i64, RankError> {
    i64::try_from(value)
        .map_err(|_| RankError::Validation(format!("id {value} exceeds the storable range")))
}

fn domain_id(value: i64) -> Result<u64, RankError> {
    u64::try_from(value)
        .map_err(|_| RankError::Store(format!("negative id in store: {value}")))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
