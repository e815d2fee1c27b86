//! Server configuration from environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::modules::media::MediaOptions;
use crate::modules::server::{StreamConfig, StreamMode};
use crate::modules::session::{SessionConfig, DEFAULT_PROGRESS_INTERVAL};
use crate::{ErrorKind, DEFAULT_MAX_SESSIONS, DEFAULT_STREAM_PORT};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

impl SettingsError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Environment
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub bind_address: String,
    pub mode: StreamMode,
    pub max_sessions: usize,
    pub media_path: Option<PathBuf>,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub jpeg_quality: u8,
    pub still_frame_count: u64,
    pub still_fps: f64,
    pub progress_log_interval: u64,
    pub enable_timing_logs: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let media = MediaOptions::default();
        ServerSettings {
            port: DEFAULT_STREAM_PORT,
            bind_address: "0.0.0.0".to_string(),
            mode: StreamMode::Playback,
            max_sessions: DEFAULT_MAX_SESSIONS,
            media_path: None,
            ffmpeg_path: media.ffmpeg_path,
            ffprobe_path: media.ffprobe_path,
            jpeg_quality: media.jpeg_quality,
            still_frame_count: media.still_frame_count,
            still_fps: media.still_fps,
            progress_log_interval: DEFAULT_PROGRESS_INTERVAL,
            enable_timing_logs: false,
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from any variable source; unset variables take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerSettings::default();
        let mode: StreamMode = parse_or(&lookup, "STREAM_MODE", defaults.mode)?;
        let max_sessions = parse_or(&lookup, "MAX_SESSIONS", defaults.max_sessions)?;
        let jpeg_quality: u32 = parse_or(&lookup, "JPEG_QUALITY", defaults.jpeg_quality as u32)?;

        Ok(ServerSettings {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            bind_address: lookup("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            mode,
            max_sessions: mode.session_cap(max_sessions),
            media_path: lookup("MEDIA_PATH").map(PathBuf::from),
            ffmpeg_path: lookup("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: lookup("FFPROBE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffprobe_path),
            jpeg_quality: jpeg_quality.clamp(1, 100) as u8,
            still_frame_count: parse_or(&lookup, "STILL_FRAME_COUNT", defaults.still_frame_count)?,
            still_fps: parse_or(&lookup, "STILL_FPS", defaults.still_fps)?,
            progress_log_interval: parse_or(
                &lookup,
                "PROGRESS_LOG_INTERVAL",
                defaults.progress_log_interval,
            )?,
            enable_timing_logs: lookup("ENABLE_TIMING_LOGS")
                .unwrap_or_else(|| "false".to_string())
                .parse()
                .unwrap_or(false),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn media_options(&self) -> MediaOptions {
        MediaOptions {
            ffmpeg_path: self.ffmpeg_path.clone(),
            ffprobe_path: self.ffprobe_path.clone(),
            jpeg_quality: self.jpeg_quality,
            still_frame_count: self.still_frame_count,
            still_fps: self.still_fps,
            timing_logs: self.enable_timing_logs,
        }
    }

    /// Acceptor configuration; requires `MEDIA_PATH`
    pub fn stream_config(&self) -> Result<StreamConfig, SettingsError> {
        let media_path = self
            .media_path
            .clone()
            .ok_or(SettingsError::Missing("MEDIA_PATH"))?;
        let mut session = SessionConfig::new(media_path, self.media_options());
        session.progress_interval = self.progress_log_interval;

        Ok(StreamConfig {
            mode: self.mode,
            max_sessions: self.max_sessions,
            session,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| SettingsError::Invalid {
                name,
                value,
                reason: e.to_string(),
            })
        }
    }
}
