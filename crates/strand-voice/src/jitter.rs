// Per-participant audio queues feeding the 20 ms mixer.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use strand_models::Snowflake;
use tokio::time::Instant;

/// Maximum frames queued per participant before dropping the oldest.
pub const MAX_QUEUED_FRAMES: usize = 50;

#[derive(Debug, Clone)]
struct QueuedFrame {
    arrived: Instant,
    samples: Vec<i16>,
}

/// Decoded frames waiting to be mixed, one FIFO per participant.
///
/// The receive loop pushes and the mixing loop takes; each queue is guarded
/// by its map shard so the two never touch a queue at the same time.
#[derive(Debug)]
pub struct JitterQueues {
    queues: DashMap<Snowflake, VecDeque<QueuedFrame>>,
    staleness: Duration,
}

impl JitterQueues {
    pub fn new(staleness: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            staleness,
        }
    }

    pub fn push(&self, user_id: Snowflake, samples: Vec<i16>, arrived: Instant) {
        let mut queue = self.queues.entry(user_id).or_default();
        if queue.len() >= MAX_QUEUED_FRAMES {
            queue.pop_front();
            tracing::debug!(user_id, "jitter queue full; dropped oldest frame");
        }
        queue.push_back(QueuedFrame { arrived, samples });
    }

    /// Oldest frame of `user_id` that is not stale at `now`. Stale frames in
    /// front of it are discarded.
    pub fn take_fresh(&self, user_id: Snowflake, now: Instant) -> Option<Vec<i16>> {
        let mut queue = self.queues.get_mut(&user_id)?;
        self.pop_fresh(&mut queue, now)
    }

    /// One fresh frame per participant, ordered by participant id.
    pub fn take_tick(&self, now: Instant) -> Vec<(Snowflake, Vec<i16>)> {
        let mut taken: Vec<(Snowflake, Vec<i16>)> = self
            .queues
            .iter_mut()
            .filter_map(|mut entry| {
                let user_id = *entry.key();
                self.pop_fresh(entry.value_mut(), now)
                    .map(|samples| (user_id, samples))
            })
            .collect();
        taken.sort_unstable_by_key(|(user_id, _)| *user_id);
        taken
    }

    pub fn queued(&self, user_id: Snowflake) -> usize {
        self.queues.get(&user_id).map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn remove(&self, user_id: Snowflake) {
        self.queues.remove(&user_id);
    }

    pub fn clear(&self) {
        self.queues.clear();
    }

    fn pop_fresh(&self, queue: &mut VecDeque<QueuedFrame>, now: Instant) -> Option<Vec<i16>> {
        while let Some(frame) = queue.pop_front() {
            if now.saturating_duration_since(frame.arrived) <= self.staleness {
                return Some(frame.samples);
            }
        }
        None
    }
}
