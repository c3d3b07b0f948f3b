//! Media player telemetry as seen by the watch loop.

use std::fmt;

use async_trait::async_trait;

use crate::status::TrackInfo;

/// Playback state reported by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Playing,
    Paused,
    Stopped,
    /// Connected but no state reported yet.
    Unknown,
    /// The telemetry connection is gone.
    Disconnected,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlayerState::Playing => "Playing",
            PlayerState::Paused => "Paused",
            PlayerState::Stopped => "Stopped",
            PlayerState::Unknown => "Unknown",
            PlayerState::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// Source of "now playing" snapshots.
///
/// Reads are cheap snapshots of state maintained in the background;
/// `disconnect` is called once during teardown.
#[async_trait]
pub trait Telemetry: Send {
    fn current_track(&self) -> Option<TrackInfo>;
    fn state(&self) -> PlayerState;
    async fn disconnect(&mut self);
}
