use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Seconds after a post's creation during which votes may still be cast.
pub const VOTE_WINDOW_SECONDS: i64 = 7 * 24 * 3600;

/// Score units contributed by one unit of vote-direction change.
///
/// 86400 seconds per day divided by 200 votes: a post needs 200 net upvotes
/// to hold its hot-ranking position for one extra day against pure recency.
pub const SCORE_PER_VOTE: f64 = 432.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RankError {
    #[error("post not found: {0}")]
    PostNotFound(PostId),
    #[error("vote window expired")]
    VoteWindowExpired,
    #[error("vote already recorded with the same direction")]
    VoteRepeated,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    Store(String),
}

impl RankError {
    /// Stable machine-readable discriminator, used by callers that must map
    /// business-rule rejections and system failures to different responses.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PostNotFound(_) => "post_not_found",
            Self::VoteWindowExpired => "vote_window_expired",
            Self::VoteRepeated => "vote_repeated",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store_unavailable",
        }
    }

    /// True for rejections a client caused, false for system failures.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PostId(pub u64);

impl Display for PostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub u64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group (community) identifier. Id 0 is reserved: it never names a real
/// group and is used by stores to key the global ranking rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GroupId(pub u64);

impl GroupId {
    pub const GLOBAL: GroupId = GroupId(0);
}

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user's current vote on a post. `None` is equivalent to "no ledger row":
/// casting a vote and then cancelling it removes the record entirely.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum VoteDirection {
    Down,
    #[default]
    None,
    Up,
}

impl VoteDirection {
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Down => -1,
            Self::None => 0,
            Self::Up => 1,
        }
    }

    #[must_use]
    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            -1 => Some(Self::Down),
            0 => Some(Self::None),
            1 => Some(Self::Up),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    Time,
    Score,
}

impl OrderKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Score => "score",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "time" => Some(Self::Time),
            "score" => Some(Self::Score),
            _ => None,
        }
    }
}

/// The two post attributes this engine reads from the external post store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PostMeta {
    pub group_id: GroupId,
    /// Creation time, unix seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteCounts {
    pub upvotes: u64,
    pub downvotes: u64,
}

/// Signed score change for a vote transition, exact by construction:
/// `sign(new - old) * |new - old| * SCORE_PER_VOTE`.
#[must_use]
pub fn score_delta(old: VoteDirection, new: VoteDirection) -> f64 {
    let old_value = f64::from(old.as_i8());
    let new_value = f64::from(new.as_i8());
    let op = if new_value > old_value { 1.0 } else { -1.0 };
    op * (new_value - old_value).abs() * SCORE_PER_VOTE
}

/// Read access to the external post/group storage collaborator.
pub trait PostResolver {
    /// Resolve a post's group and creation time. `Ok(None)` means the post
    /// does not exist; only infrastructure failures are errors.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn resolve_post(&self, post: PostId) -> Result<Option<PostMeta>, RankError>;
}

/// The injected ranking/ledger store abstraction.
///
/// Implementations must make `seed_rankings` and `apply_vote` atomic units:
/// either every write in the call is visible or none is. Nothing here spans
/// more than one call; in particular a `vote_direction` read followed by an
/// `apply_vote` is NOT a compare-and-swap (see [`VoteEngine::cast_vote_at`]).
pub trait RankingStore {
    /// Upsert all four ranking rows (global/group x time/score) for a newly
    /// created post, each at `created_at` so recency is the initial order.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn seed_rankings(
        &mut self,
        post: PostId,
        group: GroupId,
        created_at: i64,
    ) -> Result<(), RankError>;

    /// Current ledger direction for `(post, user)`; absence reads as
    /// [`VoteDirection::None`], never as an error.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn vote_direction(&self, post: PostId, user: UserId) -> Result<VoteDirection, RankError>;

    /// Atomically add `delta` to the global and group score rankings and set
    /// the ledger direction (upsert for non-zero, delete for zero).
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn apply_vote(
        &mut self,
        post: PostId,
        group: GroupId,
        user: UserId,
        direction: VoteDirection,
        delta: f64,
    ) -> Result<(), RankError>;

    /// Post ids strictly descending by score at offset `(page - 1) * size`.
    /// `scope = None` queries the global pair; ties break on a stable,
    /// store-native rule. An offset past the end yields an empty list.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn post_ids_in_order(
        &self,
        scope: Option<GroupId>,
        order: OrderKey,
        page: u64,
        size: u64,
    ) -> Result<Vec<PostId>, RankError>;

    /// Partition the post's ledger rows by sign.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn vote_counts(&self, post: PostId) -> Result<VoteCounts, RankError>;

    /// Upvote counts for many posts, output order matching input order.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn vote_counts_batch(&self, posts: &[PostId]) -> Result<Vec<u64>, RankError>;

    /// One user's directions across many posts; missing rows read as `None`.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn vote_status_batch(
        &self,
        user: UserId,
        posts: &[PostId],
    ) -> Result<BTreeMap<PostId, VoteDirection>, RankError>;

    /// Current global score ranking value for a post, if seeded.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    fn post_score(&self, post: PostId) -> Result<Option<f64>, RankError>;
}

/// Orchestrates vote transitions and ranking reads over one backend that
/// serves as both the ranking store and the post resolver.
#[derive(Debug)]
pub struct VoteEngine<B> {
    backend: B,
}

impl<B> VoteEngine<B>
where
    B: RankingStore + PostResolver,
{
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Seed the four ranking rows for a newly created post. Callers on the
    /// post-creation path treat a failure here as best-effort: log it and do
    /// not fail the creation, since the post record itself is the source of
    /// truth.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] when the backing store is unavailable.
    pub fn seed_ranking_entries(
        &mut self,
        post: PostId,
        group: GroupId,
        created_at: i64,
    ) -> Result<(), RankError> {
        self.backend.seed_rankings(post, group, created_at)
    }

    /// Cast, change, or cancel a vote using the wall clock for the window
    /// check.
    ///
    /// # Errors
    /// See [`VoteEngine::cast_vote_at`].
    pub fn cast_vote(
        &mut self,
        user: UserId,
        post: PostId,
        direction: VoteDirection,
    ) -> Result<(), RankError> {
        self.cast_vote_at(user, post, direction, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Cast, change, or cancel a vote, evaluating the vote window at `now`.
    ///
    /// The read of the previous direction and the atomic apply are two store
    /// calls, not one compare-and-swap: two racing revotes by the same user
    /// can both observe the same old direction and double-apply a stale
    /// delta. Callers needing strict correctness under concurrent same-user
    /// revotes must serialize per `(user, post)` externally.
    ///
    /// # Errors
    /// [`RankError::PostNotFound`] when the post cannot be resolved,
    /// [`RankError::VoteWindowExpired`] when the post is older than the vote
    /// window, [`RankError::VoteRepeated`] when `direction` equals the
    /// recorded direction, and [`RankError::Store`] on store failure. The
    /// first three leave all state untouched.
    pub fn cast_vote_at(
        &mut self,
        user: UserId,
        post: PostId,
        direction: VoteDirection,
        now: i64,
    ) -> Result<(), RankError> {
        let meta = self.backend.resolve_post(post)?.ok_or(RankError::PostNotFound(post))?;
        if now - meta.created_at > VOTE_WINDOW_SECONDS {
            return Err(RankError::VoteWindowExpired);
        }

        let old = self.backend.vote_direction(post, user)?;
        if direction == old {
            return Err(RankError::VoteRepeated);
        }

        let delta = score_delta(old, direction);
        self.backend.apply_vote(post, meta.group_id, user, direction, delta)
    }

    /// Paginated post ids for one scope and ordering. A group id of 0 (or no
    /// group) selects the global ranking pair.
    ///
    /// # Errors
    /// Returns [`RankError::Validation`] when `page` or `size` is below 1,
    /// and [`RankError::Store`] on store failure.
    pub fn list_post_ids(
        &self,
        group: Option<GroupId>,
        order: OrderKey,
        page: u64,
        size: u64,
    ) -> Result<Vec<PostId>, RankError> {
        if page < 1 {
            return Err(RankError::Validation("page MUST be >= 1".to_string()));
        }
        if size < 1 {
            return Err(RankError::Validation("size MUST be >= 1".to_string()));
        }

        let scope = group.filter(|group_id| *group_id != GroupId::GLOBAL);
        self.backend.post_ids_in_order(scope, order, page, size)
    }

    /// Up/down vote totals for one post.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] on store failure.
    pub fn vote_counts(&self, post: PostId) -> Result<VoteCounts, RankError> {
        self.backend.vote_counts(post)
    }

    /// Upvote totals for many posts, preserving input order.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] on store failure.
    pub fn vote_counts_batch(&self, posts: &[PostId]) -> Result<Vec<u64>, RankError> {
        self.backend.vote_counts_batch(posts)
    }

    /// The user's current direction on one post (0 when never voted).
    ///
    /// # Errors
    /// Returns [`RankError::Store`] on store failure.
    pub fn vote_status(&self, user: UserId, post: PostId) -> Result<VoteDirection, RankError> {
        self.backend.vote_direction(post, user)
    }

    /// The user's current directions across many posts.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] on store failure.
    pub fn vote_status_batch(
        &self,
        user: UserId,
        posts: &[PostId],
    ) -> Result<BTreeMap<PostId, VoteDirection>, RankError> {
        self.backend.vote_status_batch(user, posts)
    }

    /// Current global score for one post, if its rankings were seeded.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] on store failure.
    pub fn post_score(&self, post: PostId) -> Result<Option<f64>, RankError> {
        self.backend.post_score(post)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: BTreeMap<PostId, PostMeta>,
    ledger: BTreeMap<(PostId, UserId), VoteDirection>,
    rankings: BTreeMap<(OrderKey, GroupId, PostId), f64>,
}

/// In-memory backend implementing both [`RankingStore`] and [`PostResolver`].
///
/// Reference implementation and test double; the mutex makes each call an
/// atomic unit, matching the store contract.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a post with the in-memory stand-in for the external post
    /// store, making it resolvable for vote-window checks.
    ///
    /// # Errors
    /// Returns [`RankError::Validation`] for the reserved group id 0 and
    /// [`RankError::Store`] if the store mutex is poisoned.
    pub fn register_post(
        &self,
        post: PostId,
        group: GroupId,
        created_at: i64,
    ) -> Result<(), RankError> {
        if group == GroupId::GLOBAL {
            return Err(RankError::Validation(
                "group id 0 is reserved for the global scope".to_string(),
            ));
        }
        let mut state = self.lock()?;
        state.posts.insert(post, PostMeta { group_id: group, created_at });
        Ok(())
    }

    /// Whether the ledger currently holds a row for `(post, user)`.
    ///
    /// # Errors
    /// Returns [`RankError::Store`] if the store mutex is poisoned.
    pub fn has_ledger_row(&self, post: PostId, user: UserId) -> Result<bool, RankError> {
        let state = self.lock()?;
        Ok(state.ledger.contains_key(&(post, user)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RankError> {
        self.inner.lock().map_err(|_| RankError::Store("memory store mutex poisoned".to_string()))
    }
}

impl PostResolver for MemoryStore {
    fn resolve_post(&self, post: PostId) -> Result<Option<PostMeta>, RankError> {
        let state = self.lock()?;
        Ok(state.posts.get(&post).copied())
    }
}

impl RankingStore for MemoryStore {
    fn seed_rankings(
        &mut self,
        post: PostId,
        group: GroupId,
        created_at: i64,
    ) -> Result<(), RankError> {
        let score = created_at_score(created_at);
        let mut state = self.lock()?;
        for order in [OrderKey::Time, OrderKey::Score] {
            state.rankings.insert((order, GroupId::GLOBAL, post), score);
            state.rankings.insert((order, group, post), score);
        }
        Ok(())
    }

    fn vote_direction(&self, post: PostId, user: UserId) -> Result<VoteDirection, RankError> {
        let state = self.lock()?;
        Ok(state.ledger.get(&(post, user)).copied().unwrap_or_default())
    }

    fn apply_vote(
        &mut self,
        post: PostId,
        group: GroupId,
        user: UserId,
        direction: VoteDirection,
        delta: f64,
    ) -> Result<(), RankError> {
        let mut state = self.lock()?;
        // Incrementing a missing score row creates it at the delta, so votes
        // cast before seeding still rank the post.
        for scope in [GroupId::GLOBAL, group] {
            *state.rankings.entry((OrderKey::Score, scope, post)).or_insert(0.0) += delta;
        }

        match direction {
            VoteDirection::None => {
                state.ledger.remove(&(post, user));
            }
            VoteDirection::Up | VoteDirection::Down => {
                state.ledger.insert((post, user), direction);
            }
        }

        Ok(())
    }

    fn post_ids_in_order(
        &self,
        scope: Option<GroupId>,
        order: OrderKey,
        page: u64,
        size: u64,
    ) -> Result<Vec<PostId>, RankError> {
        let scope = scope.unwrap_or(GroupId::GLOBAL);
        let state = self.lock()?;

        let mut entries: Vec<(PostId, f64)> = state
            .rankings
            .range((order, scope, PostId(0))..=(order, scope, PostId(u64::MAX)))
            .map(|((_, _, post), score)| (*post, *score))
            .collect();
        entries.sort_by(|lhs, rhs| {
            rhs.1.total_cmp(&lhs.1).then_with(|| rhs.0.cmp(&lhs.0))
        });

        let offset = usize::try_from((page - 1).saturating_mul(size)).unwrap_or(usize::MAX);
        let limit = usize::try_from(size).unwrap_or(usize::MAX);
        Ok(entries.into_iter().skip(offset).take(limit).map(|(post, _)| post).collect())
    }

    fn vote_counts(&self, post: PostId) -> Result<VoteCounts, RankError> {
        let state = self.lock()?;
        let mut counts = VoteCounts::default();
        for direction in state
            .ledger
            .range((post, UserId(0))..=(post, UserId(u64::MAX)))
            .map(|(_, direction)| *direction)
        {
            match direction {
                VoteDirection::Up => counts.upvotes += 1,
                VoteDirection::Down => counts.downvotes += 1,
                VoteDirection::None => {}
            }
        }
        Ok(counts)
    }

    fn vote_counts_batch(&self, posts: &[PostId]) -> Result<Vec<u64>, RankError> {
        posts.iter().map(|post| Ok(self.vote_counts(*post)?.upvotes)).collect()
    }

    fn vote_status_batch(
        &self,
        user: UserId,
        posts: &[PostId],
    ) -> Result<BTreeMap<PostId, VoteDirection>, RankError> {
        let state = self.lock()?;
        let mut statuses = BTreeMap::new();
        for post in posts {
            let direction = state.ledger.get(&(*post, user)).copied().unwrap_or_default();
            statuses.insert(*post, direction);
        }
        Ok(statuses)
    }

    fn post_score(&self, post: PostId) -> Result<Option<f64>, RankError> {
        let state = self.lock()?;
        Ok(state.rankings.get(&(OrderKey::Score, GroupId::GLOBAL, post)).copied())
    }
}

/// Initial ranking score for a post: its creation timestamp, so that new
/// posts rank by recency in both orderings until votes accumulate.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn created_at_score(created_at: i64) -> f64 {
    created_at as f64
}
