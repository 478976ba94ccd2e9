use std::collections::{BTreeSet, HashMap, HashSet};

use strand_models::Snowflake;

/// Guild ids per member request or sync request.
pub const REQUEST_BATCH: usize = 50;

#[derive(Debug, Clone, Copy)]
struct MemberProgress {
    expected: u64,
    received: u64,
    chunks: u32,
}

/// What the caller has to do after feeding the tracker.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BootstrapStep {
    pub member_requests: Vec<Vec<Snowflake>>,
    pub sync_requests: Vec<Vec<Snowflake>>,
    /// Every guild is either loaded or unavailable.
    pub complete: bool,
}

/// Tracks which guilds of a READY still owe their initial state.
///
/// `incomplete` holds guilds whose setup has not finished; `acknowledged`
/// the subset whose snapshot (available or not) has arrived; `unavailable`
/// the subset reported unavailable, which will not load during bootstrap.
/// Once every incomplete guild is acknowledged the pending member and sync
/// requests are released, and once only unavailable guilds remain the
/// bootstrap is complete.
#[derive(Debug, Default)]
pub struct BootstrapTracker {
    active: bool,
    requests_sent: bool,
    incomplete: HashSet<Snowflake>,
    acknowledged: HashSet<Snowflake>,
    unavailable: HashSet<Snowflake>,
    requiring_chunking: BTreeSet<Snowflake>,
    requiring_sync: BTreeSet<Snowflake>,
    members: HashMap<Snowflake, MemberProgress>,
    awaiting_sync: HashSet<Snowflake>,
}

impl BootstrapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking the guilds listed in READY.
    pub fn start(&mut self, guilds: impl IntoIterator<Item = Snowflake>) {
        self.clear();
        self.active = true;
        self.incomplete.extend(guilds);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_tracking(&self, guild: Snowflake) -> bool {
        self.active && self.incomplete.contains(&guild)
    }

    /// Member and sync requests have been released; later guild snapshots
    /// are joins rather than bootstrap data.
    pub fn requests_sent(&self) -> bool {
        self.requests_sent
    }

    pub fn incomplete_len(&self) -> usize {
        self.incomplete.len()
    }

    pub fn acknowledged_len(&self) -> usize {
        self.acknowledged.len()
    }

    pub fn unavailable_len(&self) -> usize {
        self.unavailable.len()
    }

    /// A guild snapshot arrived. `missing_members` is the member count to
    /// fetch when the snapshot was partial.
    pub fn acknowledge(
        &mut self,
        guild: Snowflake,
        available: bool,
        missing_members: Option<u64>,
        needs_sync: bool,
    ) -> BootstrapStep {
        if !self.is_tracking(guild) {
            return BootstrapStep::default();
        }
        self.acknowledged.insert(guild);

        if available {
            self.unavailable.remove(&guild);
            let mut pending = false;
            if let Some(expected) = missing_members {
                self.members.insert(
                    guild,
                    MemberProgress {
                        expected,
                        received: 0,
                        chunks: 0,
                    },
                );
                self.requiring_chunking.insert(guild);
                pending = true;
            }
            if needs_sync {
                self.awaiting_sync.insert(guild);
                self.requiring_sync.insert(guild);
                pending = true;
            }
            if !pending {
                self.setup_complete(guild);
            }
        } else {
            self.unavailable.insert(guild);
        }

        self.check()
    }

    pub fn members_chunk(
        &mut self,
        guild: Snowflake,
        received: u64,
        chunk_count: Option<u32>,
    ) -> BootstrapStep {
        if !self.active {
            return BootstrapStep::default();
        }
        let Some(progress) = self.members.get_mut(&guild) else {
            return BootstrapStep::default();
        };
        progress.received += received;
        progress.chunks += 1;
        let done = match chunk_count {
            Some(count) => progress.chunks >= count,
            None => progress.received >= progress.expected,
        };
        if done {
            self.members_loaded(guild);
        }
        self.check()
    }

    /// GUILD_MEMBER_ADD (+1) or GUILD_MEMBER_REMOVE (-1) while members of the
    /// guild are still being fetched.
    pub fn adjust_expected(&mut self, guild: Snowflake, delta: i64) -> BootstrapStep {
        if !self.active {
            return BootstrapStep::default();
        }
        let Some(progress) = self.members.get_mut(&guild) else {
            return BootstrapStep::default();
        };
        progress.expected = progress.expected.saturating_add_signed(delta);
        if progress.chunks > 0 && progress.received >= progress.expected {
            self.members_loaded(guild);
        }
        self.check()
    }

    pub fn guild_synced(&mut self, guild: Snowflake) -> BootstrapStep {
        if !self.active || !self.awaiting_sync.remove(&guild) {
            return BootstrapStep::default();
        }
        if !self.members.contains_key(&guild) {
            self.setup_complete(guild);
        }
        self.check()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn members_loaded(&mut self, guild: Snowflake) {
        self.members.remove(&guild);
        if !self.awaiting_sync.contains(&guild) {
            self.setup_complete(guild);
        }
    }

    fn setup_complete(&mut self, guild: Snowflake) {
        self.incomplete.remove(&guild);
        self.acknowledged.remove(&guild);
        self.unavailable.remove(&guild);
    }

    fn check(&mut self) -> BootstrapStep {
        let mut step = BootstrapStep::default();
        if self.acknowledged.len() == self.incomplete.len() {
            self.requests_sent = true;
            step.member_requests = batches(std::mem::take(&mut self.requiring_chunking));
            step.sync_requests = batches(std::mem::take(&mut self.requiring_sync));
        }
        if self.incomplete.len() == self.unavailable.len() {
            step.complete = true;
            self.active = false;
        }
        step
    }

    /// Evaluate the thresholds without new input; completes an empty READY.
    pub fn poll(&mut self) -> BootstrapStep {
        if !self.active {
            return BootstrapStep::default();
        }
        self.check()
    }
}

fn batches(ids: BTreeSet<Snowflake>) -> Vec<Vec<Snowflake>> {
    let ids: Vec<Snowflake> = ids.into_iter().collect();
    ids.chunks(REQUEST_BATCH).map(<[Snowflake]>::to_vec).collect()
}
