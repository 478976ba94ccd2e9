use strand_models::Snowflake;

use crate::mixer::CombinedAudio;

/// Receives audio from a voice relay. Called from the relay's own tasks; a
/// panic is caught and logged per call.
pub trait AudioReceiveHandler: Send + Sync {
    /// Whether to run the 20 ms mixer.
    fn can_receive_combined(&self) -> bool {
        true
    }

    /// Whether to get every decoded frame per participant.
    fn can_receive_user(&self) -> bool {
        false
    }

    /// One mixed frame every 20 ms, silence included.
    fn handle_combined_audio(&self, _audio: CombinedAudio) {}

    fn handle_user_audio(&self, _user_id: Snowflake, _samples: &[i16]) {}
}

/// Resolves participant ids announced by signaling to known users.
pub trait ParticipantDirectory: Send + Sync {
    fn contains(&self, user_id: Snowflake) -> bool;
}

impl<F> ParticipantDirectory for F
where
    F: Fn(Snowflake) -> bool + Send + Sync,
{
    fn contains(&self, user_id: Snowflake) -> bool {
        self(user_id)
    }
}

/// Directory that accepts every participant.
#[derive(Debug, Default, Clone, Copy)]
pub struct Everyone;

impl ParticipantDirectory for Everyone {
    fn contains(&self, _user_id: Snowflake) -> bool {
        true
    }
}
