use hound::{SampleFormat, WavReader};
use std::io::{Cursor, Read};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Decoded audio, downmixed to mono.
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count of the uploaded file
    pub channels: u16,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Upload filter for playback: anything `audio/*`, or an .mp3/.wav name.
pub fn is_playable_upload(name: &str, media_type: &str) -> bool {
    let name = name.to_lowercase();
    media_type.starts_with("audio/") || name.ends_with(".mp3") || name.ends_with(".wav")
}

fn looks_like_wav(bytes: &[u8], name: &str, media_type: &str) -> bool {
    bytes.starts_with(b"RIFF")
        || name.to_lowercase().ends_with(".wav")
        || media_type.contains("wav")
}

/// Decode an uploaded file. WAV goes through `hound`, everything else is
/// treated as MP3. Either the whole file decodes or nothing is returned.
pub fn decode_audio(bytes: &[u8], name: &str, media_type: &str) -> Result<AudioBuffer> {
    let buffer = if looks_like_wav(bytes, name, media_type) {
        decode_wav(bytes)?
    } else {
        decode_mp3(bytes)?
    };

    if buffer.samples.is_empty() || buffer.sample_rate == 0 {
        return Err(Error::Processing(format!("{name}: no audio frames decoded")));
    }

    info!(
        name,
        frames = buffer.frames(),
        duration = buffer.duration_secs(),
        sample_rate = buffer.sample_rate,
        channels = buffer.channels,
        "Audio decoded"
    );
    Ok(buffer)
}

fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let mut reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::Processing(format!("invalid WAV data: {e}")))?;
    let spec = reader.spec();
    debug!(?spec, "Audio format");

    let interleaved = extract_samples(&mut reader)?;
    Ok(AudioBuffer {
        samples: downmix(&interleaved, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

fn extract_samples<R: Read>(reader: &mut WavReader<R>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    let wav_error = |e: hound::Error| Error::Processing(format!("WAV decode error: {e}"));

    let samples = if spec.sample_format == SampleFormat::Float {
        reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(wav_error)?
    } else {
        // Convert integer samples to float
        let scale = match spec.bits_per_sample {
            8 => 1.0 / 128.0,
            16 => 1.0 / 32768.0,
            24 => 1.0 / 8388608.0,
            32 => 1.0 / 2147483648.0,
            bits => {
                return Err(Error::Processing(format!(
                    "unsupported bit depth: {bits}"
                )));
            }
        };
        reader
            .samples::<i32>()
            .map(|s| s.map(|s| s as f32 * scale))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(wav_error)?
    };

    Ok(samples)
}

fn decode_mp3(bytes: &[u8]) -> Result<AudioBuffer> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 0;
    let mut channels = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                channels = frame.channels;
                let data: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&data, frame.channels));
            }
            // Junk between frames (ID3 tags, padding)
            Err(minimp3::Error::SkippedData) => continue,
            Err(minimp3::Error::Eof | minimp3::Error::InsufficientData) => break,
            Err(e) => return Err(Error::Processing(format!("MP3 decode error: {e:?}"))),
        }
    }

    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels: u16::try_from(channels).unwrap_or(u16::MAX),
    })
}

/// Average interleaved frames down to one channel.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    /// In-memory 16-bit WAV
    pub(crate) fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..frames {
                for ch in 0..channels {
                    let v: i16 = if ch == 0 { 8192 } else { -8192 };
                    writer.write_sample(v).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_mono_wav() {
        let bytes = wav_bytes(8000, 1, 16_000);
        let buf = decode_audio(&bytes, "tone.wav", "audio/wav").unwrap();
        assert_eq!(buf.sample_rate, 8000);
        assert_eq!(buf.frames(), 16_000);
        assert!((buf.duration_secs() - 2.0).abs() < 1e-9);
        assert!((buf.samples[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let bytes = wav_bytes(44_100, 2, 100);
        let buf = decode_audio(&bytes, "stereo.WAV", "").unwrap();
        assert_eq!(buf.channels, 2);
        assert_eq!(buf.frames(), 100);
        // +0.25 and -0.25 cancel out
        assert!(buf.samples.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn riff_magic_wins_over_name() {
        let bytes = wav_bytes(8000, 1, 10);
        let buf = decode_audio(&bytes, "mislabeled.mp3", "audio/mpeg").unwrap();
        assert_eq!(buf.frames(), 10);
    }

    #[test]
    fn garbage_is_a_processing_error() {
        let err = decode_audio(b"definitely not audio", "x.wav", "audio/wav").unwrap_err();
        assert!(matches!(err, Error::Processing(_)));

        let err = decode_audio(&[0u8; 512], "x.mp3", "audio/mpeg").unwrap_err();
        assert!(matches!(err, Error::Processing(_)));
    }

    #[test]
    fn empty_wav_is_rejected() {
        let bytes = wav_bytes(8000, 1, 0);
        assert!(matches!(
            decode_audio(&bytes, "empty.wav", "audio/wav"),
            Err(Error::Processing(_))
        ));
    }

    #[test]
    fn playable_upload_filter() {
        assert!(is_playable_upload("a.flac", "audio/flac"));
        assert!(is_playable_upload("a.MP3", ""));
        assert!(!is_playable_upload("a.txt", "text/plain"));
    }
}
