//! Encoder processes for live channels

pub mod ffmpeg;

pub use ffmpeg::{build_encoder_command, write_source_list, EncodeParams};

use std::io;
use tokio::process::Child;

/// Starts encoder processes.
///
/// The supervisor needs a child handle back whose stdout is piped and
/// carries the encoded stream; how the process is built is up to the
/// launcher.
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, params: &EncodeParams) -> io::Result<Child>;
}

/// Launches an ffmpeg-compatible encoder binary.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: String,
}

impl FfmpegLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl EncoderLauncher for FfmpegLauncher {
    /// The child's stdout is piped; the encoder dies with its handle.
    fn launch(&self, params: &EncodeParams) -> io::Result<Child> {
        let cmd = build_encoder_command(&self.program, params);
        tokio::process::Command::from(cmd).kill_on_drop(true).spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamType;
    use std::path::PathBuf;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_launch_pipes_encoder_output() {
        // `echo` stands in for the encoder and prints its arguments.
        let params = EncodeParams {
            channel_id: 4,
            source_list: PathBuf::from("/tmp/list.ffconcat"),
            stream_type: StreamType::Mp3,
            bitrate: 96,
            looping: true,
        };
        let mut child = FfmpegLauncher::new("echo").launch(&params).unwrap();
        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert!(out.contains("-stream_loop -1"));
        assert!(out.contains("-b:a 96k"));
        assert!(out.trim_end().ends_with("pipe:1"));
        assert!(child.wait().await.unwrap().success());
    }
}
