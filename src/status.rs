//! NIP-38 user status events built from the playing track.

use nostr_sdk::{EventBuilder, Kind, PublicKey, Tag, Tags, Timestamp, UnsignedEvent};

/// Kind for user statuses (parameterized replaceable).
pub const KIND_USER_STATUS: u16 = 30315;

/// `d` tag value identifying the music status stream.
pub const MUSIC_STATUS: &str = "music";

/// Snapshot of the track the player reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackInfo {
    pub track_number: i32,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Track length in whole seconds, `0` when the player does not know it.
    pub length_seconds: u64,
}

/// Status text shown by clients, e.g. `3 Song - Band (Album)`.
pub fn format_content(track: &TrackInfo) -> String {
    format!(
        "{} {} - {} ({})",
        track.track_number, track.title, track.artist, track.album
    )
}

/// Build the unsigned status event for `track` published at `now`.
///
/// The status expires when the track would finish. A track of unknown
/// length gets no `expiration` tag at all; the next status replaces it.
pub fn build_status_event(track: &TrackInfo, now: u64, pubkey: PublicKey) -> UnsignedEvent {
    let mut tags = vec![Tag::identifier(MUSIC_STATUS)];
    if track.length_seconds > 0 {
        let expires = now.saturating_add(track.length_seconds);
        tags.push(Tag::expiration(Timestamp::from_secs(expires)));
    }
    EventBuilder::new(Kind::from(KIND_USER_STATUS), format_content(track))
        .tags(tags)
        .custom_created_at(Timestamp::from_secs(now))
        .build(pubkey)
}

/// First value of the first tag named `name`.
pub fn tag_value<'a>(tags: &'a Tags, name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.as_slice().first().map(String::as_str) == Some(name))
        .and_then(|t| t.content())
}
