//! ffmpeg relay encoder
//!
//! Builds the encoder invocation for a live channel: read the channel's
//! source list in real time, transcode to the channel's stream type and
//! write the muxed stream to stdout, where the channel relay fans it out.

use crate::catalog::CatalogObject;
use crate::channel::{Channel, StreamType};
use rand::seq::SliceRandom;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use uuid::Uuid;

/// Parameters for one encoder run
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeParams {
    /// Channel being relayed (used for logging only)
    pub channel_id: i64,
    /// ffconcat list of source files
    pub source_list: PathBuf,
    pub stream_type: StreamType,
    /// Audio bitrate in kbps
    pub bitrate: u32,
    /// Restart the source list when it ends
    pub looping: bool,
}

impl EncodeParams {
    /// Encoder parameters for `channel` reading from `source_list`.
    pub fn for_channel(channel: &Channel, source_list: PathBuf) -> Self {
        Self {
            channel_id: channel.id,
            source_list,
            stream_type: channel.stream_type,
            bitrate: channel.bitrate,
            looping: channel.looping,
        }
    }
}

/// Build the encoder command line for `params`.
///
/// The encoder:
/// - reads the source list at native rate (`-re`) so listeners hear real time
/// - loops the list forever when the channel loops
/// - drops video and transcodes audio to the channel codec and bitrate
/// - writes one continuous stream to stdout; stderr stays attached for errors
pub fn build_encoder_command(program: &str, params: &EncodeParams) -> Command {
    let mut cmd = Command::new(program);

    cmd.arg("-hide_banner").arg("-nostdin");
    cmd.arg("-loglevel").arg("error");
    cmd.arg("-re");

    if params.looping {
        cmd.arg("-stream_loop").arg("-1");
    }

    cmd.arg("-f").arg("concat");
    cmd.arg("-safe").arg("0");
    cmd.arg("-i").arg(&params.source_list);

    cmd.arg("-vn");
    cmd.arg("-c:a").arg(params.stream_type.codec());
    cmd.arg("-b:a").arg(format!("{}k", params.bitrate));

    cmd.arg("-f").arg(params.stream_type.container());
    cmd.arg("pipe:1");

    cmd.stdin(Stdio::null()).stdout(Stdio::piped());

    cmd
}

/// Quote a path for an ffconcat `file` directive.
fn concat_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

/// Render the ffconcat list for `media`, in order.
pub fn render_source_list(media: &[CatalogObject]) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for path in media.iter().filter_map(|m| m.path.as_deref()) {
        out.push_str("file ");
        out.push_str(&concat_quote(path));
        out.push('\n');
    }
    out
}

/// Write the source list for one encoder run into `work_dir`.
///
/// Entries without a file are skipped. When `shuffle` is set the order is
/// randomised for this run only.
pub fn write_source_list(
    work_dir: &Path,
    channel_id: i64,
    media: &[CatalogObject],
    shuffle: bool,
) -> io::Result<PathBuf> {
    fs::create_dir_all(work_dir)?;

    let mut media = media.to_vec();
    if shuffle {
        media.shuffle(&mut rand::rng());
    }

    let path = work_dir.join(format!("channel-{}-{}.ffconcat", channel_id, Uuid::new_v4()));
    fs::write(&path, render_source_list(&media))?;
    Ok(path)
}
