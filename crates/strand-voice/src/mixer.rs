// 20 ms mixing of participant audio into one combined frame.

use std::time::Duration;

use strand_models::Snowflake;
use tokio::time::Instant;

use crate::jitter::JitterQueues;

/// Samples in one mixed frame: 960 per channel, 2 channels, 48 kHz.
pub const FRAME_SAMPLES: usize = 1920;
pub const MIX_INTERVAL: Duration = Duration::from_millis(20);

/// One mixing tick: who contributed and the summed samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedAudio {
    pub users: Vec<Snowflake>,
    pub samples: Vec<i16>,
}

impl CombinedAudio {
    /// 20 ms of silence with no contributors.
    pub fn silence() -> Self {
        Self {
            users: Vec::new(),
            samples: vec![0; FRAME_SAMPLES],
        }
    }

    pub fn is_silence(&self) -> bool {
        self.users.is_empty()
    }
}

/// Sum `parts` sample by sample, clamping to the i16 range. The result is
/// always [`FRAME_SAMPLES`] long; short parts contribute zeros past their end.
pub fn mix(parts: &[&[i16]]) -> Vec<i16> {
    let mut acc = vec![0i32; FRAME_SAMPLES];
    for part in parts {
        for (sum, sample) in acc.iter_mut().zip(part.iter()) {
            *sum += i32::from(*sample);
        }
    }
    acc.into_iter()
        .map(|sum| sum.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16)
        .collect()
}

/// Take one fresh frame from every participant and mix them. Produces a
/// silence frame when nobody contributed.
pub fn mix_tick(queues: &JitterQueues, now: Instant) -> CombinedAudio {
    let taken = queues.take_tick(now);
    if taken.is_empty() {
        return CombinedAudio::silence();
    }
    let parts: Vec<&[i16]> = taken.iter().map(|(_, samples)| samples.as_slice()).collect();
    let samples = mix(&parts);
    CombinedAudio {
        users: taken.iter().map(|(user_id, _)| *user_id).collect(),
        samples,
    }
}
