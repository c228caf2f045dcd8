//! Stream configuration types.

use serde::{Deserialize, Serialize};

/// Configuration for one publish attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Destination URL (e.g. "rtmp://host/app/streamkey").
    pub url: String,

    /// Video encoder parameters.
    pub video: VideoConfig,

    /// Audio encoder parameters.
    pub audio: AudioConfig,
}

impl StreamConfig {
    /// Build a config for the given URL with default encoder settings.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::for_url(String::new())
    }
}

/// Video encoder parameters, validated at prepare time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Frames per second.
    pub fps: u32,

    /// Target bitrate in bits per second.
    pub bitrate_bps: u32,

    /// Keyframe interval in seconds.
    pub keyframe_interval_secs: u32,

    /// Capture rotation in degrees (0, 90, 180, 270).
    pub rotation_deg: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_bps: 2500 * 1024,
            keyframe_interval_secs: 2,
            rotation_deg: 0,
        }
    }
}

/// Audio encoder parameters, validated at prepare time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Target bitrate in bits per second.
    pub bitrate_bps: u32,

    /// Sample rate in Hz.
    pub sample_rate_hz: u32,

    /// Stereo (true) or mono (false).
    pub stereo: bool,

    /// Enable echo cancellation.
    pub echo_cancellation: bool,

    /// Enable noise suppression.
    pub noise_suppression: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: 128 * 1024,
            sample_rate_hz: 44_100,
            stereo: true,
            echo_cancellation: false,
            noise_suppression: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_carry_publishing_defaults() {
        let config = StreamConfig::for_url("rtmp://example.com/live/key");

        assert_eq!(config.video.width, 1280);
        assert_eq!(config.video.height, 720);
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.video.bitrate_bps, 2_560_000);
        assert_eq!(config.audio.sample_rate_hz, 44_100);
        assert!(config.audio.stereo);
    }
}
