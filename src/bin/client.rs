use std::env;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use tokio::sync::watch;

use framecast::modules::client::{connect, receive_stream, AudioSink, FrameSink};
use framecast::StreamDescriptor;

/// Writes every frame as `frame_NNNNNN.jpg`
struct DirectoryFrameSink {
    dir: PathBuf,
}

impl FrameSink for DirectoryFrameSink {
    fn render(&mut self, frame_number: u64, image: &[u8]) -> io::Result<()> {
        fs::write(self.dir.join(format!("frame_{:06}.jpg", frame_number)), image)
    }
}

/// Appends raw s16le PCM to a single file
struct PcmFileSink {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl AudioSink for PcmFileSink {
    fn open(&mut self, descriptor: &StreamDescriptor) -> io::Result<()> {
        info!(
            "Writing {} Hz, {} channel s16le audio to {}",
            descriptor.audio_sample_rate,
            descriptor.audio_channels,
            self.path.display()
        );
        self.file = Some(BufWriter::new(File::create(&self.path)?));
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let mut args = env::args().skip(1);
    let addr = args
        .next()
        .or_else(|| env::var("STREAM_ADDR").ok())
        .unwrap_or_else(|| format!("127.0.0.1:{}", framecast::DEFAULT_STREAM_PORT));
    let out_dir = PathBuf::from(
        args.next()
            .or_else(|| env::var("OUTPUT_DIR").ok())
            .unwrap_or_else(|| "received".to_string()),
    );
    fs::create_dir_all(&out_dir)?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping");
            let _ = cancel_tx.send(true);
        }
    });

    let stream = connect(addr.as_str()).await?;
    info!("Connected to {}", addr);

    let mut frames = DirectoryFrameSink {
        dir: out_dir.clone(),
    };
    let mut audio = PcmFileSink {
        path: Path::new(&out_dir).join("audio.pcm"),
        file: None,
    };

    match receive_stream(stream, &mut frames, Some(&mut audio), cancel_rx).await {
        Ok(summary) => {
            if summary.frames_received < summary.descriptor.total_frames {
                warn!(
                    "Stream ended after {} of {} frames",
                    summary.frames_received, summary.descriptor.total_frames
                );
            }
            info!(
                "Saved {} frames and {} audio chunks to {} ({:?})",
                summary.frames_received,
                summary.audio_chunks_received,
                out_dir.display(),
                summary.outcome
            );
            Ok(())
        }
        Err(e) => {
            error!("Stream failed: {}", e);
            Err(e.into())
        }
    }
}
