use dashmap::DashMap;
use strand_models::Snowflake;

/// Maps synchronization sources of one voice connection to participants.
///
/// Written by signaling (SPEAKING, CLIENT_DISCONNECT), read by the receive
/// loop for every datagram.
#[derive(Debug, Default)]
pub struct SsrcTable {
    users: DashMap<u32, Snowflake>,
}

impl SsrcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `ssrc` to `user_id`. A binding that changes owner is logged and
    /// replaced; the previous owner is returned.
    pub fn update(&self, ssrc: u32, user_id: Snowflake) -> Option<Snowflake> {
        let previous = self.users.insert(ssrc, user_id);
        if let Some(previous) = previous.filter(|previous| *previous != user_id) {
            tracing::warn!(
                ssrc,
                old_user_id = previous,
                new_user_id = user_id,
                "ssrc rebound to a different participant"
            );
        }
        previous
    }

    /// Drop every binding of `user_id`. Returns the removed sources.
    pub fn remove_user(&self, user_id: Snowflake) -> Vec<u32> {
        let mut removed = Vec::new();
        self.users.retain(|ssrc, owner| {
            if *owner == user_id {
                removed.push(*ssrc);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn user_for(&self, ssrc: u32) -> Option<Snowflake> {
        self.users.get(&ssrc).map(|entry| *entry.value())
    }

    pub fn ssrc_for(&self, user_id: Snowflake) -> Option<u32> {
        self.users
            .iter()
            .find(|entry| *entry.value() == user_id)
            .map(|entry| *entry.key())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&self) {
        self.users.clear();
    }
}
