use anyhow::Result;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::AudioBuffer;

/// Convert a decoded clip to the interleaved layout the output device runs
/// at: resample each channel to the device rate, then spread or fold the
/// channels to match the device channel count.
pub fn adapt_to_device(clip: &AudioBuffer, device_rate: u32, device_channels: u16) -> Result<Vec<f32>> {
    if clip.samples.is_empty() || device_channels == 0 {
        return Ok(Vec::new());
    }

    let src_channels = clip.channels.max(1) as usize;
    let mut planes = deinterleave(&clip.samples, src_channels);

    if clip.sample_rate != device_rate {
        for plane in planes.iter_mut() {
            *plane = resample(plane, clip.sample_rate, device_rate)?;
        }
    }

    Ok(interleave_for(&planes, device_channels as usize))
}

pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0,
        params,
        samples.len(),
        1, // one plane at a time
    )?;

    let input = vec![samples.to_vec()];
    let output = resampler.process(&input, None)?;

    Ok(output.into_iter().next().unwrap_or_default())
}

fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for (i, &sample) in samples.iter().enumerate() {
        planes[i % channels].push(sample);
    }
    planes
}

/// Interleave planes for `out_channels` outputs. Extra outputs repeat the
/// source channels (mono clips duplicate to every speaker); fewer outputs
/// get the per-frame average of all source channels.
fn interleave_for(planes: &[Vec<f32>], out_channels: usize) -> Vec<f32> {
    let frames = planes.iter().map(|p| p.len()).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * out_channels);

    for frame in 0..frames {
        if out_channels >= planes.len() {
            for ch in 0..out_channels {
                out.push(planes[ch % planes.len()][frame]);
            }
        } else {
            let mixed: f32 = planes.iter().map(|p| p[frame]).sum::<f32>() / planes.len() as f32;
            for _ in 0..out_channels {
                out.push(mixed);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(samples: Vec<f32>, sample_rate: u32, channels: u16) -> AudioBuffer {
        AudioBuffer {
            samples,
            sample_rate,
            channels,
        }
    }

    #[test]
    fn passthrough_when_layout_matches() {
        let samples = vec![0.1, -0.2, 0.3, -0.4];
        let out = adapt_to_device(&clip(samples.clone(), 44_100, 2), 44_100, 2).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn mono_is_duplicated_to_stereo() {
        let out = adapt_to_device(&clip(vec![0.5, -0.5], 44_100, 1), 44_100, 2).unwrap();
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let out = adapt_to_device(&clip(vec![1.0, 0.0, 0.0, 1.0], 44_100, 2), 44_100, 1).unwrap();
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn empty_clip_adapts_to_nothing() {
        let out = adapt_to_device(&clip(vec![], 44_100, 1), 48_000, 2).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn resample_changes_length_by_roughly_the_ratio() {
        let samples: Vec<f32> = (0..4410).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample(&samples, 44_100, 22_050).unwrap();
        assert!(!out.is_empty());
        let expected = samples.len() as f64 / 2.0;
        let error = (out.len() as f64 - expected).abs() / expected;
        assert!(error < 0.3, "unexpected resampled length {}", out.len());
    }

    #[test]
    fn resample_is_identity_for_equal_rates() {
        let samples = vec![0.25, -0.25, 0.5];
        assert_eq!(resample(&samples, 44_100, 44_100).unwrap(), samples);
    }
}
