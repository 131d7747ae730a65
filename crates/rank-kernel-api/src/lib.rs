mod snowflake;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rank_kernel_core::{
    GroupId, OrderKey, PostId, PostResolver, RankError, RankingStore, UserId, VoteDirection,
    VoteEngine,
};
use rank_kernel_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use snowflake::SnowflakeNode;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePostResult {
    pub post_id: u64,
    pub group_id: u64,
    pub created_at: i64,
    /// False when the post row was written but ranking seeding failed;
    /// the post record stays the source of truth either way.
    pub rankings_seeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRequest {
    pub user_id: u64,
    pub post_id: u64,
    /// 1 upvote, -1 downvote, 0 cancel.
    pub direction: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListPostsRequest {
    pub group_id: Option<u64>,
    #[serde(default = "default_order")]
    pub order: OrderKey,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_size")]
    pub size: u64,
}

fn default_order() -> OrderKey {
    OrderKey::Time
}

fn default_page() -> u64 {
    1
}

fn default_size() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostVotesResult {
    pub post_id: u64,
    pub upvotes: u64,
    pub downvotes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostScoreResult {
    pub post_id: u64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteStatusResult {
    pub post_id: u64,
    pub user_id: u64,
    pub direction: i8,
}

/// Stable application surface over the vote engine and sqlite store. Cheap to
/// clone; each operation opens its own connection against `db_path`.
#[derive(Clone)]
pub struct RankingApi {
    db_path: PathBuf,
    node: Arc<SnowflakeNode>,
}

impl RankingApi {
    /// # Errors
    /// Returns an error when `machine_id` is out of range for the id
    /// generator.
    pub fn new(db_path: PathBuf, machine_id: u64) -> Result<Self> {
        Ok(Self { db_path, node: Arc::new(SnowflakeNode::new(machine_id)?) })
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_engine(&self) -> Result<VoteEngine<SqliteStore>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(VoteEngine::new(store))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create a post: allocate an id, persist the post row, then seed its
    /// four ranking entries. Seeding is best-effort; a seeding failure is
    /// logged and reported in the result but never fails the creation.
    ///
    /// # Errors
    /// Returns an error when id allocation or the post write fails.
    pub fn create_post(&self, group_id: u64) -> Result<CreatePostResult> {
        if group_id == 0 {
            return Err(RankError::Validation("group_id MUST be >= 1".to_string()).into());
        }

        let post_id = self.node.next_id()?;
        let created_at = OffsetDateTime::now_utc().unix_timestamp();

        let mut store = self.open_store()?;
        store.migrate()?;
        store.insert_post(PostId(post_id), GroupId(group_id), created_at)?;

        let mut engine = VoteEngine::new(store);
        let rankings_seeded =
            seed_rankings_best_effort(&mut engine, PostId(post_id), GroupId(group_id), created_at);

        Ok(CreatePostResult { post_id, group_id, created_at, rankings_seeded })
    }

    /// Cast, change, or cancel a vote.
    ///
    /// # Errors
    /// Returns a validation error for a direction outside `{-1, 0, 1}`, and
    /// otherwise the engine's rejection or store error.
    pub fn cast_vote(&self, input: &VoteRequest) -> Result<()> {
        let direction = VoteDirection::from_i8(input.direction).ok_or_else(|| {
            RankError::Validation(format!("direction MUST be 1, 0, or -1, got {}", input.direction))
        })?;

        let mut engine = self.open_engine()?;
        engine.cast_vote(UserId(input.user_id), PostId(input.post_id), direction)?;
        Ok(())
    }

    /// Paginated post ids for one scope and ordering.
    ///
    /// # Errors
    /// Returns a validation error for page or size below 1, or a store error.
    pub fn list_posts(&self, input: &ListPostsRequest) -> Result<Vec<u64>> {
        let engine = self.open_engine()?;
        let ids =
            engine.list_post_ids(input.group_id.map(GroupId), input.order, input.page, input.size)?;
        Ok(ids.into_iter().map(|post| post.0).collect())
    }

    /// Up/down vote totals for one post.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub fn post_votes(&self, post_id: u64) -> Result<PostVotesResult> {
        let engine = self.open_engine()?;
        let counts = engine.vote_counts(PostId(post_id))?;
        Ok(PostVotesResult { post_id, upvotes: counts.upvotes, downvotes: counts.downvotes })
    }

    /// Upvote totals for many posts, preserving input order.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub fn post_votes_batch(&self, post_ids: &[u64]) -> Result<Vec<u64>> {
        let engine = self.open_engine()?;
        let posts = post_ids.iter().map(|id| PostId(*id)).collect::<Vec<_>>();
        Ok(engine.vote_counts_batch(&posts)?)
    }

    /// Current global score for one post.
    ///
    /// # Errors
    /// Returns [`RankError::PostNotFound`] when the post has no ranking
    /// entries, or a store error.
    pub fn post_score(&self, post_id: u64) -> Result<PostScoreResult> {
        let engine = self.open_engine()?;
        let score =
            engine.post_score(PostId(post_id))?.ok_or(RankError::PostNotFound(PostId(post_id)))?;
        Ok(PostScoreResult { post_id, score })
    }

    /// One user's current direction on one post (0 when never voted).
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub fn vote_status(&self, user_id: u64, post_id: u64) -> Result<VoteStatusResult> {
        let engine = self.open_engine()?;
        let direction = engine.vote_status(UserId(user_id), PostId(post_id))?;
        Ok(VoteStatusResult { post_id, user_id, direction: direction.as_i8() })
    }

    /// One user's directions across many posts, output order matching input.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub fn vote_status_batch(
        &self,
        user_id: u64,
        post_ids: &[u64],
    ) -> Result<Vec<VoteStatusResult>> {
        let engine = self.open_engine()?;
        let posts = post_ids.iter().map(|id| PostId(*id)).collect::<Vec<_>>();
        let statuses = engine.vote_status_batch(UserId(user_id), &posts)?;

        Ok(post_ids
            .iter()
            .map(|id| VoteStatusResult {
                post_id: *id,
                user_id,
                direction: statuses.get(&PostId(*id)).copied().unwrap_or_default().as_i8(),
            })
            .collect())
    }
}

/// Seed the four ranking entries for a freshly created post, reporting
/// success as a flag. A seeding failure is logged and never propagated; the
/// post row already written stays the source of truth.
fn seed_rankings_best_effort<B>(
    engine: &mut VoteEngine<B>,
    post: PostId,
    group: GroupId,
    created_at: i64,
) -> bool
where
    B: RankingStore + PostResolver,
{
    match engine.seed_ranking_entries(post, group, created_at) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(post_id = post.0, %err, "ranking seeding failed for new post");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rank_kernel_core::{MemoryStore, PostMeta, VoteCounts};

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("rankkernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn temp_api() -> Result<(RankingApi, PathBuf)> {
        let db_path = unique_temp_db_path();
        let api = RankingApi::new(db_path.clone(), 1)?;
        Ok((api, db_path))
    }

    fn rank_error<T: std::fmt::Debug>(result: Result<T>) -> RankError {
        match result {
            Ok(value) => panic!("expected a rank error, got {value:?}"),
            Err(err) => match err.downcast::<RankError>() {
                Ok(rank) => rank,
                Err(other) => panic!("expected a rank error, got {other}"),
            },
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn create_vote_and_list_round_trip() -> Result<()> {
        let (api, db_path) = temp_api()?;

        let created = api.create_post(9)?;
        assert!(created.rankings_seeded);
        assert_eq!(created.group_id, 9);

        api.cast_vote(&VoteRequest { user_id: 7, post_id: created.post_id, direction: 1 })?;

        let votes = api.post_votes(created.post_id)?;
        assert_eq!((votes.upvotes, votes.downvotes), (1, 0));

        let score = api.post_score(created.post_id)?;
        #[allow(clippy::cast_precision_loss)]
        let expected = created.created_at as f64 + 432.0;
        assert_eq!(score.score, expected);

        let listed = api.list_posts(&ListPostsRequest {
            group_id: Some(9),
            order: OrderKey::Score,
            page: 1,
            size: 10,
        })?;
        assert_eq!(listed, vec![created.post_id]);

        let status = api.vote_status(7, created.post_id)?;
        assert_eq!(status.direction, 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn rejections_surface_as_rank_errors() -> Result<()> {
        let (api, db_path) = temp_api()?;
        let created = api.create_post(9)?;

        api.cast_vote(&VoteRequest { user_id: 7, post_id: created.post_id, direction: 1 })?;
        let repeat =
            api.cast_vote(&VoteRequest { user_id: 7, post_id: created.post_id, direction: 1 });
        assert_eq!(rank_error(repeat), RankError::VoteRepeated);

        let missing = api.cast_vote(&VoteRequest { user_id: 7, post_id: 404, direction: 1 });
        assert_eq!(rank_error(missing), RankError::PostNotFound(PostId(404)));

        let invalid =
            api.cast_vote(&VoteRequest { user_id: 7, post_id: created.post_id, direction: 2 });
        assert!(matches!(rank_error(invalid), RankError::Validation(_)));

        let no_score = api.post_score(404);
        assert_eq!(rank_error(no_score), RankError::PostNotFound(PostId(404)));

        assert!(api.create_post(0).is_err());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn batch_reads_preserve_request_order() -> Result<()> {
        let (api, db_path) = temp_api()?;

        let first = api.create_post(9)?;
        let second = api.create_post(9)?;
        api.cast_vote(&VoteRequest { user_id: 7, post_id: second.post_id, direction: 1 })?;
        api.cast_vote(&VoteRequest { user_id: 8, post_id: second.post_id, direction: 1 })?;
        api.cast_vote(&VoteRequest { user_id: 7, post_id: first.post_id, direction: -1 })?;

        let request = [second.post_id, 404, first.post_id];
        assert_eq!(api.post_votes_batch(&request)?, vec![2, 0, 0]);

        let statuses = api.vote_status_batch(7, &request)?;
        let directions = statuses.iter().map(|status| status.direction).collect::<Vec<_>>();
        assert_eq!(directions, vec![1, 0, -1]);
        assert_eq!(statuses[0].post_id, second.post_id);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn migrate_dry_run_plans_without_applying() -> Result<()> {
        let (api, db_path) = temp_api()?;

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(applied.target_version));
        assert_eq!(applied.up_to_date, Some(true));

        assert!(api.schema_status()?.pending_versions.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    /// Store double whose seeding always fails while every other operation
    /// behaves normally.
    struct SeedFailingStore {
        inner: MemoryStore,
    }

    impl PostResolver for SeedFailingStore {
        fn resolve_post(&self, post: PostId) -> std::result::Result<Option<PostMeta>, RankError> {
            self.inner.resolve_post(post)
        }
    }

    impl RankingStore for SeedFailingStore {
        fn seed_rankings(
            &mut self,
            _post: PostId,
            _group: GroupId,
            _created_at: i64,
        ) -> std::result::Result<(), RankError> {
            Err(RankError::Store("ranking store offline".to_string()))
        }

        fn vote_direction(
            &self,
            post: PostId,
            user: UserId,
        ) -> std::result::Result<VoteDirection, RankError> {
            self.inner.vote_direction(post, user)
        }

        fn apply_vote(
            &mut self,
            post: PostId,
            group: GroupId,
            user: UserId,
            direction: VoteDirection,
            delta: f64,
        ) -> std::result::Result<(), RankError> {
            self.inner.apply_vote(post, group, user, direction, delta)
        }

        fn post_ids_in_order(
            &self,
            scope: Option<GroupId>,
            order: OrderKey,
            page: u64,
            size: u64,
        ) -> std::result::Result<Vec<PostId>, RankError> {
            self.inner.post_ids_in_order(scope, order, page, size)
        }

        fn vote_counts(&self, post: PostId) -> std::result::Result<VoteCounts, RankError> {
            self.inner.vote_counts(post)
        }

        fn vote_counts_batch(&self, posts: &[PostId]) -> std::result::Result<Vec<u64>, RankError> {
            self.inner.vote_counts_batch(posts)
        }

        fn vote_status_batch(
            &self,
            user: UserId,
            posts: &[PostId],
        ) -> std::result::Result<BTreeMap<PostId, VoteDirection>, RankError> {
            self.inner.vote_status_batch(user, posts)
        }

        fn post_score(&self, post: PostId) -> std::result::Result<Option<f64>, RankError> {
            self.inner.post_score(post)
        }
    }

    // Test IDs: TAPI-004
    #[test]
    fn seeding_failure_reports_unseeded_without_failing_creation() -> Result<()> {
        let inner = MemoryStore::new();
        inner.register_post(PostId(1), GroupId(9), 1_700_000_000)?;
        let mut engine = VoteEngine::new(SeedFailingStore { inner });

        let seeded = seed_rankings_best_effort(&mut engine, PostId(1), GroupId(9), 1_700_000_000);
        assert!(!seeded);

        // The post row survives the seeding failure and keeps taking votes.
        engine.cast_vote_at(UserId(7), PostId(1), VoteDirection::Up, 1_700_000_005)?;
        assert_eq!(engine.vote_status(UserId(7), PostId(1))?, VoteDirection::Up);
        assert_eq!(engine.post_score(PostId(1))?, Some(432.0));
        Ok(())
    }

    #[test]
    fn list_request_defaults_apply_when_fields_are_omitted() -> Result<()> {
        let parsed: ListPostsRequest = serde_json::from_str("{}")?;
        assert_eq!(parsed.group_id, None);
        assert_eq!(parsed.order, OrderKey::Time);
        assert_eq!((parsed.page, parsed.size), (1, 10));
        Ok(())
    }
}
