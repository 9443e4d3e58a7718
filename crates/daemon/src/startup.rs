//! Startup checks for relaycast
//!
//! Preflight checks run before the daemon opens its store:
//! - external base URL is absolute
//! - interface access list parses
//! - encoder work directory is writable (channels only)
//! - encoder binary runs and is recent enough (channels only)

use crate::config::Config;
use crate::gateway::AccessPolicy;
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Oldest encoder major version the channel relay is run against.
pub const MIN_ENCODER_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Encoder version requirement not met: {0}")]
    EncoderVersion(String),

    #[error("Invalid interface access list: {0}")]
    AccessList(String),

    #[error("Invalid web_path: {0}")]
    WebPath(String),

    #[error("Work directory {path} not usable: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse `<program> -version` output and extract the major version.
///
/// Handles the usual ffmpeg formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_encoder_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;

    let version_part = version_line
        .to_lowercase()
        .split(" version ")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that the encoder runs and is new enough.
pub fn check_encoder_available(program: &str) -> Result<u32, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_encoder_version(&version_output).ok_or_else(|| {
        StartupError::EncoderVersion(format!(
            "Could not parse encoder version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_ENCODER_MAJOR {
        return Err(StartupError::EncoderVersion(format!(
            "{}.x or newer required, got: {}",
            MIN_ENCODER_MAJOR, major
        )));
    }

    Ok(major)
}

/// Check that the base URL handed to players is absolute.
pub fn check_web_path(web_path: &str) -> Result<(), StartupError> {
    let lower = web_path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(())
    } else {
        Err(StartupError::WebPath(format!(
            "{:?} must start with http:// or https://",
            web_path
        )))
    }
}

pub fn check_access_list(cfg: &Config) -> Result<(), StartupError> {
    AccessPolicy::from_config(cfg)
        .map(|_| ())
        .map_err(|e| StartupError::AccessList(e.to_string()))
}

/// Create the work directory and prove a file can be written into it.
pub fn check_work_dir(path: &Path) -> Result<(), StartupError> {
    let wrap = |source| StartupError::WorkDir {
        path: path.display().to_string(),
        source,
    };
    fs::create_dir_all(path).map_err(wrap)?;
    let probe = path.join(format!(".probe-{}", Uuid::new_v4()));
    fs::write(&probe, b"").map_err(wrap)?;
    fs::remove_file(&probe).map_err(wrap)?;
    Ok(())
}

/// Run all startup checks in order
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_web_path(&cfg.server.web_path)?;
    check_access_list(cfg)?;
    if cfg.features.channel {
        check_work_dir(&cfg.encoder.work_dir)?;
        let major = check_encoder_available(&cfg.encoder.program)?;
        info!(program = %cfg.encoder.program, major, "encoder available");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_encoder_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_encoder_version(&version_output), Some(major));
        }

        #[test]
        fn prop_encoder_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024\nbuilt with gcc 12.2.0",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_encoder_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_unparseable_version() {
        assert_eq!(parse_encoder_version(""), None);
        assert_eq!(parse_encoder_version("ffmpeg version git-master"), None);
    }

    #[test]
    fn test_missing_encoder_is_reported() {
        let err = check_encoder_available("relaycast-no-such-encoder").unwrap_err();
        assert!(matches!(err, StartupError::EncoderUnavailable(_)));
    }

    #[test]
    fn test_web_path_must_be_absolute() {
        assert!(check_web_path("https://music.example.org").is_ok());
        assert!(check_web_path("HTTP://LOCALHOST:7878").is_ok());
        assert!(matches!(
            check_web_path("/relay"),
            Err(StartupError::WebPath(_))
        ));
    }

    #[test]
    fn test_access_list_must_parse() {
        let mut cfg = Config::default();
        assert!(check_access_list(&cfg).is_ok());
        cfg.access.interface_ranges.push("10.0.0.0/33".to_string());
        assert!(matches!(
            check_access_list(&cfg),
            Err(StartupError::AccessList(_))
        ));
    }

    #[test]
    fn test_work_dir_created() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a/b/c");
        check_work_dir(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(fs::read_dir(&nested).unwrap().count(), 0);
    }

    #[test]
    fn test_checks_skip_encoder_when_channels_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.features.channel = false;
        cfg.encoder.program = "relaycast-no-such-encoder".to_string();
        cfg.encoder.work_dir = temp_dir.path().join("work");
        assert!(run_startup_checks(&cfg).is_ok());

        cfg.features.channel = true;
        assert!(matches!(
            run_startup_checks(&cfg),
            Err(StartupError::EncoderUnavailable(_))
        ));
    }
}
