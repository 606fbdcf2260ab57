//! PCM → WAV container framing for the egress socket.

use std::io::Cursor;

use crate::error::{CoreError, Result};

/// Wrap raw 16-bit LE mono PCM in a RIFF/WAV header.
///
/// # Errors
///
/// Returns a TTS error if the PCM byte length is odd or the header cannot
/// be written.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    if pcm.len() % 2 != 0 {
        return Err(CoreError::Tts(format!(
            "PCM length {} is not a whole number of 16-bit samples",
            pcm.len()
        )));
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| CoreError::Tts(format!("failed to start WAV writer: {e}")))?;
        for sample in pcm.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            writer
                .write_sample(value)
                .map_err(|e| CoreError::Tts(format!("failed to write WAV sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| CoreError::Tts(format!("failed to finalize WAV: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_has_riff_header_and_sample_rate() {
        let pcm: Vec<u8> = (0u16..64).flat_map(|v| v.to_le_bytes()).collect();
        let wav = pcm_to_wav(&pcm, 32_000).expect("wav");
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        let rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(rate, 32_000);
        let channels = u16::from_le_bytes([wav[22], wav[23]]);
        assert_eq!(channels, 1);
    }

    #[test]
    fn wav_preserves_payload_bytes() {
        let pcm: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let wav = pcm_to_wav(&pcm, 32_000).expect("wav");
        assert!(wav.len() > pcm.len());
        assert!(wav.windows(pcm.len()).any(|w| w == pcm.as_slice()));
    }

    #[test]
    fn odd_length_pcm_is_rejected() {
        let err = pcm_to_wav(&[0x01, 0x02, 0x03], 32_000).expect_err("odd length");
        assert!(matches!(err, CoreError::Tts(_)));
    }

    #[test]
    fn empty_pcm_yields_header_only() {
        let wav = pcm_to_wav(&[], 32_000).expect("wav");
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44);
    }
}
