//! Subset of Clementine's network remote protocol (`remotecontrolmessages.proto`,
//! package `pb.remote`).
//!
//! Frames are a big-endian `u32` length followed by a protobuf `Message`.
//! Only the fields needed to follow playback are modelled; prost skips the
//! rest on decode.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message as _;

use crate::error::{Error, Result};

/// Upper bound for a single frame; metadata may carry cover art.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Message types exchanged with the player.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MsgType {
    Unknown = 0,
    Connect = 1,
    Disconnect = 2,
    Play = 20,
    Playpause = 21,
    Pause = 22,
    Stop = 23,
    Next = 24,
    Previous = 25,
    Info = 40,
    CurrentMetainfo = 41,
    Playlists = 42,
    PlaylistSongs = 43,
    EngineStateChanged = 44,
    KeepAlive = 45,
    UpdateTrackPosition = 46,
    ActivePlaylistChanged = 47,
    FirstDataSentComplete = 48,
}

/// Player engine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EngineState {
    Empty = 0,
    Idle = 1,
    Playing = 2,
    Paused = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SongMetadata {
    #[prost(int32, optional, tag = "1")]
    pub id: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub title: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub album: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub artist: Option<String>,
    #[prost(int32, optional, tag = "7")]
    pub track: Option<i32>,
    #[prost(string, optional, tag = "12")]
    pub pretty_length: Option<String>,
    /// Seconds.
    #[prost(int32, optional, tag = "14")]
    pub length: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestConnect {
    #[prost(int32, optional, tag = "1")]
    pub auth_code: Option<i32>,
    #[prost(bool, optional, tag = "2")]
    pub send_playlist_songs: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub downloader: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClementineInfo {
    #[prost(string, optional, tag = "1")]
    pub version: Option<String>,
    #[prost(enumeration = "EngineState", optional, tag = "2")]
    pub state: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CurrentMetadata {
    #[prost(message, optional, tag = "1")]
    pub song_metadata: Option<SongMetadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EngineStateChanged {
    #[prost(enumeration = "EngineState", optional, tag = "1")]
    pub state: Option<i32>,
}

/// Top level protocol message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(int32, optional, tag = "1")]
    pub version: Option<i32>,
    #[prost(enumeration = "MsgType", optional, tag = "2")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "15")]
    pub clementine_info: Option<ClementineInfo>,
    #[prost(message, optional, tag = "16")]
    pub current_metadata: Option<CurrentMetadata>,
    #[prost(message, optional, tag = "19")]
    pub engine_state_changed: Option<EngineStateChanged>,
    #[prost(message, optional, tag = "21")]
    pub request_connect: Option<RequestConnect>,
}

impl Message {
    pub fn of_type(msg_type: MsgType) -> Self {
        Message {
            r#type: Some(msg_type as i32),
            ..Default::default()
        }
    }

    pub fn connect(auth_code: Option<i32>) -> Self {
        Message {
            request_connect: Some(RequestConnect {
                auth_code,
                ..Default::default()
            }),
            ..Message::of_type(MsgType::Connect)
        }
    }

    /// Message type, `None` for types this client does not model.
    pub fn kind(&self) -> Option<MsgType> {
        MsgType::try_from(self.r#type.unwrap_or_default()).ok()
    }
}

/// Decode one frame body.
pub fn decode_message(body: &[u8]) -> Result<Message> {
    Message::decode(body).map_err(|e| Error::Telemetry(format!("bad frame: {e}")))
}

/// Prefix an encoded message with its length.
pub fn encode_frame(msg: &Message) -> Bytes {
    let body = msg.encode_to_vec();
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    frame.freeze()
}
