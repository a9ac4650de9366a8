//! ALSA PCM device setup for playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::format::{AudioFormat, SampleType};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual format after negotiation; the rate may differ from the request.
    pub format: AudioFormat,
    /// Period size in frames (one frame = channels × sample width)
    pub period_size: usize,
}

fn alsa_format(sample_type: SampleType) -> Format {
    match sample_type {
        SampleType::Int16 => Format::S16LE,
        SampleType::Float32 => Format::FloatLE,
    }
}

/// Open a PCM device for playback in the requested format.
pub fn open_playback(
    device: &str,
    requested: AudioFormat,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Playback, false)
        .with_context(|| format!("Failed to open PCM device '{}' for Playback", device))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(alsa_format(requested.sample_type()))
            .with_context(|| format!("Device '{}' rejects {}", device, requested.sample_type()))?;
        hwp.set_channels(requested.channels() as u32)
            .with_context(|| format!("Device '{}' rejects {} channels", device, requested.channels()))?;
        hwp.set_rate_near(requested.sample_rate(), ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    let format = AudioFormat::new(actual_rate, requested.sample_type(), actual_channels as u16)
        .with_context(|| format!("Device '{}' negotiated an unusable format", device))?;

    log::info!(
        "ALSA Playback: device={}, format={}, period_size={}",
        device,
        format,
        period_size,
    );

    Ok((pcm, AlsaParams { format, period_size }))
}
