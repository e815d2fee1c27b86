//! Shell-script stand-ins for ffmpeg and ffprobe

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{AudioFormat, MediaOptions};

/// Geometry every fake clip reports: 4x2 at 50 fps, so one raw frame is
/// 24 bytes on the decoder pipe
pub(crate) const FRAME_BYTES: usize = 4 * 2 * 3;
pub(crate) const FPS: f64 = 50.0;

/// A clip placeholder plus scripted tools that describe and "decode" it
pub(crate) struct FakeTools {
    dir: PathBuf,
    pub clip: PathBuf,
    pub options: MediaOptions,
}

impl FakeTools {
    /// `frames` is the container frame count, `audio` the track reported by
    /// the audio query (with `audio_bytes` of PCM behind it), `decoder` the
    /// command whose stdout stands in for the raw RGB pipe.
    pub(crate) fn install(
        dir: &Path,
        frames: u64,
        audio: Option<(AudioFormat, usize)>,
        decoder: &str,
    ) -> FakeTools {
        let clip = dir.join("clip.mp4");
        fs::write(&clip, b"not really a clip").unwrap();

        let audio_query = match audio {
            Some((format, _)) => format!(
                r#"echo '{{"streams":[{{"sample_rate":"{}","channels":{}}}]}}'"#,
                format.sample_rate, format.channels
            ),
            None => "echo 'no audio stream' >&2; exit 1".to_string(),
        };
        let ffprobe = format!(
            "#!/bin/sh\ncase \"$*\" in\n  *v:0*) echo '{{\"streams\":[{{\"width\":4,\"height\":2,\"avg_frame_rate\":\"50/1\",\"nb_frames\":\"{}\"}}]}}' ;;\n  *a:0*) {} ;;\nesac\n",
            frames, audio_query
        );

        let audio_bytes = audio.map(|(_, bytes)| bytes).unwrap_or(0);
        let ffmpeg = format!(
            "#!/bin/sh\necho \"$@\" >> '{dir}/ffmpeg_args'\ncase \"$*\" in\n  *s16le*) head -c {audio_bytes} /dev/zero ;;\n  *) echo $$ > '{dir}/decoder.pid'; exec {decoder} ;;\nesac\n",
            dir = dir.display(),
            audio_bytes = audio_bytes,
            decoder = decoder
        );

        let options = MediaOptions {
            ffmpeg_path: write_script(dir, "ffmpeg", &ffmpeg),
            ffprobe_path: write_script(dir, "ffprobe", &ffprobe),
            ..MediaOptions::default()
        };
        FakeTools {
            dir: dir.to_path_buf(),
            clip,
            options,
        }
    }

    /// One line per ffmpeg invocation
    pub(crate) fn recorded_args(&self) -> String {
        fs::read_to_string(self.dir.join("ffmpeg_args")).unwrap_or_default()
    }

    pub(crate) fn decoder_pid(&self) -> String {
        fs::read_to_string(self.dir.join("decoder.pid"))
            .unwrap()
            .trim()
            .to_string()
    }
}

/// True while `pid` names a live (or unreaped) process
pub(crate) fn process_exists(pid: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {} 2>/dev/null", pid))
        .status()
        .unwrap()
        .success()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
