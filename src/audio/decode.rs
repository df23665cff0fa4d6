use std::io::Cursor;

use anyhow::{Context, Result};
use base64::Engine as _;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::AudioBuffer;

/// Decode a base64 speech payload all the way to interleaved f32 samples.
pub fn decode_payload(payload: &str) -> Result<AudioBuffer> {
    let bytes = decode_base64(payload)?;
    decode_clip(&bytes)
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("response payload is not valid base64")
}

/// Decode compressed audio bytes. There is no filename to hint the format,
/// so the container is probed from the bytes alone.
pub fn decode_clip(bytes: &[u8]) -> Result<AudioBuffer> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("payload is not a recognized audio container")?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("no audio track in payload")?;

    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1) as u16;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("no decoder available for payload codec")?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break; // end of stream
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(e).context("failed to read audio packet"),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_buf.is_none() {
                    let spec = *decoded.spec();
                    sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("audio decode failed"),
        }
    }

    if samples.is_empty() {
        anyhow::bail!("payload decoded to zero samples");
    }

    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels,
    })
}
