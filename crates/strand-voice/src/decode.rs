use crate::error::VoiceError;

/// Turns a decrypted voice payload into 48 kHz stereo PCM.
///
/// Decoders may keep per-source state (codec history, packet loss
/// concealment); `ssrc` identifies the source of every call.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, ssrc: u32, payload: &[u8]) -> Result<Vec<i16>, VoiceError>;

    /// The source left the connection.
    fn forget(&self, _ssrc: u32) {}
}

/// Payloads that already are big-endian 16-bit PCM.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmDecoder;

impl AudioDecoder for PcmDecoder {
    fn decode(&self, _ssrc: u32, payload: &[u8]) -> Result<Vec<i16>, VoiceError> {
        if payload.len() % 2 != 0 {
            return Err(VoiceError::Decode(format!(
                "odd PCM payload length {}",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Encode samples the way [`PcmDecoder`] reads them.
pub fn encode_pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|sample| sample.to_be_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_is_big_endian() {
        let decoded = PcmDecoder.decode(1, &[0x7F, 0xFF, 0x80, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(decoded, vec![i16::MAX, i16::MIN, 1]);
        assert_eq!(encode_pcm(&decoded), vec![0x7F, 0xFF, 0x80, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn odd_length_is_rejected() {
        assert!(matches!(
            PcmDecoder.decode(1, &[1, 2, 3]),
            Err(VoiceError::Decode(_))
        ));
    }
}
