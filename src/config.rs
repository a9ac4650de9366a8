use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::format::{AudioFormat, Codec, Encoding, SampleType};

/// 上游音频流的编码方式
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceEncoding {
    #[default]
    Pcm,
    OggOpus,
    /// Decide per stream from its first bytes.
    Auto,
}

impl SourceEncoding {
    /// `None` means sniff the stream.
    pub fn declared(self) -> Option<Encoding> {
        match self {
            SourceEncoding::Pcm => Some(Encoding::RawPcm),
            SourceEncoding::OggOpus => Some(Encoding::Compressed(Codec::OggOpus)),
            SourceEncoding::Auto => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub encoding: SourceEncoding,
    pub sample_rate: u32,
    pub sample_type: SampleType,
    pub channels: u16,
}

impl Default for SourceConfig {
    // 语音服务 TTS 默认输出: 24kHz float32 单声道
    fn default() -> Self {
        Self {
            encoding: SourceEncoding::Pcm,
            sample_rate: 24000,
            sample_type: SampleType::Float32,
            channels: 1,
        }
    }
}

impl SourceConfig {
    pub fn format(&self) -> Result<AudioFormat> {
        AudioFormat::new(self.sample_rate, self.sample_type, self.channels)
            .context("Invalid [source] format")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SpeakerConfig {
    pub enabled: bool,
    /// ALSA playback device name (e.g. "default", "plughw:0,0")
    pub device: String,
    /// Desired playback rate; the hardware may negotiate another one.
    pub sample_rate: u32,
    pub sample_type: SampleType,
    pub channels: u16,
    /// Desired ALSA period size in frames (0 = let ALSA decide)
    pub period_size: usize,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "default".to_string(),
            sample_rate: 48000,
            sample_type: SampleType::Int16,
            channels: 2,
            period_size: 1024,
        }
    }
}

impl SpeakerConfig {
    pub fn format(&self) -> Result<AudioFormat> {
        AudioFormat::new(self.sample_rate, self.sample_type, self.channels)
            .context("Invalid [speaker] format")
    }

    pub fn period_size(&self) -> Option<usize> {
        (self.period_size > 0).then_some(self.period_size)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrackConfig {
    pub enabled: bool,
    /// Frames held before the oldest is dropped.
    pub queue_frames: usize,
    pub frame_ms: u32,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_frames: 200,
            frame_ms: 20,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    /// Decoder output granularity in ms.
    pub block_ms: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { block_ms: 20 }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub speaker: SpeakerConfig,
    pub track: TrackConfig,
    pub decoder: DecoderConfig,
}

/// Which destinations are active. Overrides the `enabled` flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    Speaker,
    Track,
    Both,
}

impl FromStr for OutputMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "speaker" => Ok(OutputMode::Speaker),
            "track" => Ok(OutputMode::Track),
            "both" => Ok(OutputMode::Both),
            other => anyhow::bail!("Unknown output mode: {}", other),
        }
    }
}

impl Config {
    /// 从 TOML 文件加载配置，文件不存在时使用默认值；随后应用环境变量覆盖
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml_str(&text)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Ok(mode) = std::env::var("OUTPUT_MODE") {
            let mode: OutputMode = mode.parse().context("Invalid OUTPUT_MODE")?;
            log::info!("OUTPUT_MODE override: {:?}", mode);
            config.apply_output_mode(mode);
        }
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_output_mode(&mut self, mode: OutputMode) {
        self.speaker.enabled = matches!(mode, OutputMode::Speaker | OutputMode::Both);
        self.track.enabled = matches!(mode, OutputMode::Track | OutputMode::Both);
    }

    fn validate(&self) -> Result<()> {
        self.source.format()?;
        self.speaker.format()?;
        if self.track.frame_ms == 0 || self.decoder.block_ms == 0 {
            anyhow::bail!("frame_ms and block_ms must be positive");
        }
        if self.track.queue_frames == 0 {
            anyhow::bail!("track.queue_frames must be positive");
        }
        Ok(())
    }
}
