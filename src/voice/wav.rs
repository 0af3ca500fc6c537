//! WAV encoding for synthesized PCM

use crate::{Error, Result};

/// Wrap 16-bit little-endian mono PCM in a WAV container
///
/// # Errors
///
/// Returns error if the PCM has an odd length or WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    if pcm.len() % 2 != 0 {
        return Err(Error::Audio(format!(
            "PCM length {} is not a whole number of samples",
            pcm.len()
        )));
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for sample in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
