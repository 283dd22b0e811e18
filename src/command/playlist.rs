//! Playlist expansion.
//!
//! Cast receivers play streams, not playlists. A `.pls` or `.m3u` URL is fetched and
//! replaced by its first entry before it is sent to a device.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("Playlist fetch failed: {0}")]
    Fetch(String),

    #[error("Playlist request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Resolves a playlist URL to its first playable entry; `None` for an empty playlist.
pub trait PlaylistResolver: Send + Sync {
    fn first_entry<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<String>, PlaylistError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaylistFormat {
    Pls,
    M3u,
}

fn format_of(url: &str) -> Option<PlaylistFormat> {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".pls") {
        Some(PlaylistFormat::Pls)
    } else if path.ends_with(".m3u") {
        Some(PlaylistFormat::M3u)
    } else {
        None
    }
}

/// `true` if `url` points at a `.pls` or `.m3u` file (query string ignored).
pub fn is_playlist(url: &str) -> bool {
    format_of(url).is_some()
}

/// First `FileN=` entry, lowest `N` wins.
pub fn parse_pls(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let index: u32 = key.trim().strip_prefix("File")?.parse().ok()?;
            let value = value.trim();
            (!value.is_empty()).then(|| (index, value.to_string()))
        })
        .min_by_key(|(index, _)| *index)
        .map(|(_, url)| url)
}

/// First line that is neither blank nor a `#` directive.
pub fn parse_m3u(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

fn first_entry_of(url: &str, body: &str) -> Option<String> {
    match format_of(url)? {
        PlaylistFormat::Pls => parse_pls(body),
        PlaylistFormat::M3u => parse_m3u(body),
    }
}

/// Fetches playlists over HTTP.
#[derive(Clone)]
pub struct HttpPlaylistResolver {
    client: reqwest::Client,
}

impl HttpPlaylistResolver {
    pub fn new() -> Result<Self, PlaylistError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl PlaylistResolver for HttpPlaylistResolver {
    fn first_entry<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<String>, PlaylistError>> {
        async move {
            let body = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            let entry = first_entry_of(url, &body);
            debug!("Playlist {} starts with {:?}", url, entry);
            Ok(entry)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_playlists_by_extension() {
        assert!(is_playlist("http://radio/live.pls"));
        assert!(is_playlist("http://radio/live.M3U?token=1"));
        assert!(!is_playlist("http://x/a.mp3"));
        assert!(!is_playlist("http://radio/hls.m3u8"));
    }

    #[test]
    fn pls_takes_the_lowest_file_index() {
        let body = "[playlist]\nNumberOfEntries=2\nFile2=http://b/2.mp3\nTitle1=One\nFile1=http://a/1.mp3\n";
        assert_eq!(parse_pls(body).as_deref(), Some("http://a/1.mp3"));
        assert_eq!(parse_pls("[playlist]\nNumberOfEntries=0\n"), None);
    }

    #[test]
    fn m3u_skips_directives_and_blank_lines() {
        let body = "#EXTM3U\n\n#EXTINF:-1,Radio\r\nhttp://stream/one.mp3\r\nhttp://stream/two.mp3\n";
        assert_eq!(parse_m3u(body).as_deref(), Some("http://stream/one.mp3"));
        assert_eq!(parse_m3u("#EXTM3U\n"), None);
    }
}
