//! Ad-hoc playlists for shared objects.
//!
//! Assembly is a pure function of the target and the share credentials:
//! containers expand to their child media in catalog order, anything else
//! becomes a single entry. Every entry carries the share id and secret so
//! the player's per-track requests can be checked again on their own.

use crate::catalog::{CatalogError, ObjectCatalog};
use crate::object::ObjectRef;
use quick_xml::escape::escape;
use serde::Serialize;
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

/// Share id and secret embedded into each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareCredentials<'a> {
    pub share_id: i64,
    pub secret: &'a str,
}

impl ShareCredentials<'_> {
    /// Query suffix appended to every entry URL.
    pub fn continuation_query(&self) -> String {
        format!("&share_id={}&share_secret={}", self.share_id, self.secret)
    }
}

/// One playable unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistEntry {
    pub object: ObjectRef,
    pub title: String,
    pub continuation_query: String,
}

impl PlaylistEntry {
    pub fn url(&self, web_path: &str) -> String {
        format!(
            "{}/play?type={}&oid={}{}",
            web_path.trim_end_matches('/'),
            self.object.object_type,
            self.object.object_id,
            self.continuation_query
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Playlist {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
}

impl Playlist {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self, format: PlaylistFormat, web_path: &str) -> String {
        match format {
            PlaylistFormat::M3u => render_m3u(self, web_path),
            PlaylistFormat::Pls => render_pls(self, web_path),
            PlaylistFormat::Xspf => render_xspf(self, web_path),
        }
    }
}

/// Expand `target` into a playlist.
pub fn assemble(
    target: &ObjectRef,
    credentials: Option<ShareCredentials<'_>>,
    catalog: &dyn ObjectCatalog,
) -> Result<Playlist, CatalogError> {
    let continuation_query = credentials
        .map(|c| c.continuation_query())
        .unwrap_or_default();

    let found = catalog.lookup(target)?;

    if target.object_type.is_container() {
        let entries = catalog
            .children(target)?
            .into_iter()
            .filter(|child| child.object.object_type.is_media())
            .map(|child| PlaylistEntry {
                object: child.object,
                title: child.title,
                continuation_query: continuation_query.clone(),
            })
            .collect();
        let title = found.map(|o| o.title).unwrap_or_else(|| target.to_string());
        return Ok(Playlist { title, entries });
    }

    let object = found.ok_or(CatalogError::NotFound(*target))?;
    Ok(Playlist {
        title: object.title.clone(),
        entries: vec![PlaylistEntry {
            object: object.object,
            title: object.title,
            continuation_query,
        }],
    })
}

/// Text formats a playlist can be delivered in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaylistFormat {
    #[default]
    M3u,
    Pls,
    Xspf,
}

impl PlaylistFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PlaylistFormat::M3u => "m3u",
            PlaylistFormat::Pls => "pls",
            PlaylistFormat::Xspf => "xspf",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            PlaylistFormat::M3u => "audio/x-mpegurl",
            PlaylistFormat::Pls => "audio/x-scpls",
            PlaylistFormat::Xspf => "application/xspf+xml",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown playlist format: {0}")]
pub struct UnknownPlaylistFormat(pub String);

impl FromStr for PlaylistFormat {
    type Err = UnknownPlaylistFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "m3u" | "m3u8" => Ok(PlaylistFormat::M3u),
            "pls" => Ok(PlaylistFormat::Pls),
            "xspf" => Ok(PlaylistFormat::Xspf),
            _ => Err(UnknownPlaylistFormat(s.to_string())),
        }
    }
}

/// Keep titles on a single line.
fn one_line(title: &str) -> String {
    title.replace(['\r', '\n'], " ")
}

fn render_m3u(playlist: &Playlist, web_path: &str) -> String {
    let mut out = String::from("#EXTM3U\n");
    for entry in &playlist.entries {
        let _ = writeln!(out, "#EXTINF:-1,{}", one_line(&entry.title));
        let _ = writeln!(out, "{}", entry.url(web_path));
    }
    out
}

fn render_pls(playlist: &Playlist, web_path: &str) -> String {
    let mut out = String::from("[playlist]\n");
    let _ = writeln!(out, "NumberOfEntries={}", playlist.len());
    for (i, entry) in playlist.entries.iter().enumerate() {
        let n = i + 1;
        let _ = writeln!(out, "File{}={}", n, entry.url(web_path));
        let _ = writeln!(out, "Title{}={}", n, one_line(&entry.title));
        let _ = writeln!(out, "Length{}=-1", n);
    }
    out.push_str("Version=2\n");
    out
}

fn render_xspf(playlist: &Playlist, web_path: &str) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<playlist version=\"1\" xmlns=\"http://xspf.org/ns/0/\">\n");
    let _ = writeln!(out, "  <title>{}</title>", escape(playlist.title.as_str()));
    out.push_str("  <trackList>\n");
    for entry in &playlist.entries {
        out.push_str("    <track>\n");
        let _ = writeln!(
            out,
            "      <location>{}</location>",
            escape(entry.url(web_path).as_str())
        );
        let _ = writeln!(out, "      <title>{}</title>", escape(entry.title.as_str()));
        out.push_str("    </track>\n");
    }
    out.push_str("  </trackList>\n</playlist>\n");
    out
}
