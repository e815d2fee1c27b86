//! ffprobe wrappers
//!
//! Video probing failures are fatal (no descriptor can be built). Audio
//! probing failures fall back to the default format with audio disabled.

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

use super::{sanitize_fps, AudioFormat, AudioProbe, MediaError, VideoInfo};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe width, height, fps and frame count of the first video stream
pub async fn probe_video(ffprobe: &Path, path: &Path) -> Result<VideoInfo, MediaError> {
    if !path.is_file() {
        return Err(MediaError::open(path, "no such file"));
    }
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames,duration:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| MediaError::open(path, format!("ffprobe spawn error: {}", e)))?;

    if !output.status.success() {
        return Err(MediaError::open(
            path,
            format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    parse_video_probe(&output.stdout).map_err(|reason| MediaError::open(path, reason))
}

/// Probe sample rate and channel count of the first audio stream
pub async fn probe_audio(ffprobe: &Path, path: &Path) -> AudioProbe {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "a:0",
            "-show_entries",
            "stream=sample_rate,channels",
            "-of",
            "json",
        ])
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => match parse_audio_probe(&output.stdout) {
            Some(format) => AudioProbe {
                format,
                available: true,
            },
            None => {
                log::info!("No audio stream in {}", path.display());
                AudioProbe::unavailable()
            }
        },
        Ok(output) => {
            log::warn!(
                "Audio probe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            AudioProbe::unavailable()
        }
        Err(e) => {
            log::warn!("Audio probe unavailable ({}), streaming video only", e);
            AudioProbe::unavailable()
        }
    }
}

/// Parse `ffprobe -of json` output for the first video stream
pub fn parse_video_probe(json: &[u8]) -> Result<VideoInfo, String> {
    let probe: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| format!("ffprobe json parse: {}", e))?;
    let stream = probe
        .streams
        .into_iter()
        .find(|s| s.width.is_some() && s.height.is_some())
        .ok_or_else(|| "no video stream".to_string())?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(format!("invalid frame size {}x{}", width, height));
    }

    let fps = sanitize_fps(
        stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
            .unwrap_or(0.0),
    );

    let duration = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            probe
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok())
        });

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .or_else(|| {
            duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| (d * fps).round() as u64)
        })
        .unwrap_or(0);

    Ok(VideoInfo {
        width,
        height,
        fps,
        total_frames,
    })
}

/// Parse `ffprobe -of json` output for the first audio stream
pub fn parse_audio_probe(json: &[u8]) -> Option<AudioFormat> {
    let probe: ProbeOutput = serde_json::from_slice(json).ok()?;
    let stream = probe.streams.into_iter().next()?;
    let sample_rate = stream.sample_rate?.parse::<u32>().ok().filter(|r| *r > 0)?;
    let channels = stream.channels.filter(|c| *c > 0)?;
    Some(AudioFormat {
        sample_rate,
        channels,
    })
}

/// Parse an ffprobe rational such as `30000/1001`; `0/0` yields `None`
fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse::<f64>().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}
