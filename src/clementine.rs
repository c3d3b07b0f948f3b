//! Clementine network remote client.
//!
//! The player pushes state and metadata after `CONNECT`; a background task
//! folds those messages into a snapshot the watch loop reads on every tick.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    proto::{
        decode_message, encode_frame, EngineState, Message, MsgType, SongMetadata, MAX_FRAME_LEN,
    },
    status::TrackInfo,
    telemetry::{PlayerState, Telemetry},
};

#[derive(Debug, Clone)]
struct Snapshot {
    state: PlayerState,
    track: Option<TrackInfo>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: PlayerState::Unknown,
            track: None,
        }
    }
}

/// Connection to a running Clementine with the network remote enabled.
pub struct ClementineRemote {
    addr: String,
    snapshot: Arc<Mutex<Snapshot>>,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
}

impl ClementineRemote {
    /// Connect and authenticate; `auth_code` is required when the player
    /// has one configured.
    pub async fn connect(host: &str, port: u16, auth_code: Option<i32>) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Telemetry(format!("connecting to {addr}: {e}")))?;
        let (read, mut write) = stream.into_split();
        write
            .write_all(&encode_frame(&Message::connect(auth_code)))
            .await
            .map_err(|e| Error::Telemetry(format!("sending CONNECT to {addr}: {e}")))?;

        let snapshot = Arc::new(Mutex::new(Snapshot::default()));
        let reader = tokio::spawn(read_loop(read, snapshot.clone(), addr.clone()));
        info!("connected to clementine at {addr}");
        Ok(Self {
            addr,
            snapshot,
            writer: Some(write),
            reader: Some(reader),
        })
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Telemetry for ClementineRemote {
    fn current_track(&self) -> Option<TrackInfo> {
        self.snapshot().track
    }

    fn state(&self) -> PlayerState {
        self.snapshot().state
    }

    async fn disconnect(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let frame = encode_frame(&Message::of_type(MsgType::Disconnect));
            if let Err(e) = writer.write_all(&frame).await {
                debug!("sending DISCONNECT to {}: {e}", self.addr);
            }
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).state = PlayerState::Disconnected;
        info!("disconnected from clementine at {}", self.addr);
    }
}

async fn read_loop<R>(mut read: R, snapshot: Arc<Mutex<Snapshot>>, addr: String)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut read).await {
            Ok(msg) => {
                let mut snap = snapshot.lock().unwrap_or_else(|e| e.into_inner());
                apply(&mut snap, msg);
                if snap.state == PlayerState::Disconnected {
                    info!("clementine at {addr} closed the session");
                    break;
                }
            }
            Err(e) => {
                warn!("clementine connection to {addr} lost: {e}");
                snapshot.lock().unwrap_or_else(|e| e.into_inner()).state =
                    PlayerState::Disconnected;
                break;
            }
        }
    }
}

async fn read_frame<R>(read: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let len = read.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Telemetry(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len];
    read.read_exact(&mut buf).await?;
    decode_message(&buf)
}

/// Fold one player message into the snapshot.
fn apply(snap: &mut Snapshot, msg: Message) {
    match msg.kind() {
        Some(MsgType::Info) => {
            if let Some(info) = msg.clementine_info {
                info!(
                    "player reports {}",
                    info.version.as_deref().unwrap_or("an unknown version")
                );
                if let Some(state) = info.state.and_then(engine_state) {
                    snap.state = state;
                }
            }
        }
        Some(MsgType::CurrentMetainfo) => {
            snap.track = msg
                .current_metadata
                .and_then(|m| m.song_metadata)
                .and_then(track_info);
        }
        Some(MsgType::Play) => snap.state = PlayerState::Playing,
        Some(MsgType::Pause) => snap.state = PlayerState::Paused,
        Some(MsgType::Stop) => snap.state = PlayerState::Stopped,
        Some(MsgType::EngineStateChanged) => {
            let changed = msg.engine_state_changed.and_then(|c| c.state);
            if let Some(state) = changed.and_then(engine_state) {
                snap.state = state;
            }
        }
        Some(MsgType::Disconnect) => snap.state = PlayerState::Disconnected,
        _ => trace!("ignoring clementine message type {:?}", msg.r#type),
    }
}

fn engine_state(raw: i32) -> Option<PlayerState> {
    match EngineState::try_from(raw).ok()? {
        EngineState::Playing => Some(PlayerState::Playing),
        EngineState::Paused => Some(PlayerState::Paused),
        EngineState::Idle | EngineState::Empty => Some(PlayerState::Stopped),
    }
}

fn track_info(song: SongMetadata) -> Option<TrackInfo> {
    let title = song.title?;
    Some(TrackInfo {
        track_number: song.track.unwrap_or_default(),
        title,
        artist: song.artist.unwrap_or_default(),
        album: song.album.unwrap_or_default(),
        length_seconds: song.length.and_then(|l| u64::try_from(l).ok()).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ClementineInfo, CurrentMetadata, EngineStateChanged};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn with_song(song: SongMetadata) -> Message {
        Message {
            current_metadata: Some(CurrentMetadata {
                song_metadata: Some(song),
            }),
            ..Message::of_type(MsgType::CurrentMetainfo)
        }
    }

    fn metainfo(title: &str) -> Message {
        with_song(SongMetadata {
            title: Some(title.into()),
            album: Some("Album".into()),
            artist: Some("Band".into()),
            track: Some(3),
            length: Some(200),
            ..Default::default()
        })
    }

    async fn wait_for(remote: &ClementineRemote, state: PlayerState) {
        for _ in 0..100 {
            if remote.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("state never became {state}");
    }

    #[test]
    fn applies_state_and_metadata() {
        let mut snap = Snapshot::default();
        apply(&mut snap, metainfo("Song"));
        assert_eq!(snap.track.as_ref().unwrap().title, "Song");
        assert_eq!(snap.track.as_ref().unwrap().length_seconds, 200);
        assert_eq!(snap.state, PlayerState::Unknown);

        apply(&mut snap, Message::of_type(MsgType::Play));
        assert_eq!(snap.state, PlayerState::Playing);
        apply(&mut snap, Message::of_type(MsgType::Pause));
        assert_eq!(snap.state, PlayerState::Paused);

        let mut changed = Message::of_type(MsgType::EngineStateChanged);
        changed.engine_state_changed = Some(EngineStateChanged {
            state: Some(EngineState::Idle as i32),
        });
        apply(&mut snap, changed);
        assert_eq!(snap.state, PlayerState::Stopped);

        let mut info = Message::of_type(MsgType::Info);
        info.clementine_info = Some(ClementineInfo {
            version: Some("Clementine 1.4".into()),
            state: Some(EngineState::Playing as i32),
        });
        apply(&mut snap, info);
        assert_eq!(snap.state, PlayerState::Playing);

        apply(&mut snap, Message::of_type(MsgType::KeepAlive));
        assert_eq!(snap.state, PlayerState::Playing);

        let mut unknown_state = Message::of_type(MsgType::EngineStateChanged);
        unknown_state.engine_state_changed = Some(EngineStateChanged { state: Some(9) });
        apply(&mut snap, unknown_state);
        assert_eq!(snap.state, PlayerState::Playing);
    }

    #[test]
    fn metadata_without_title_clears_track() {
        let mut snap = Snapshot::default();
        apply(&mut snap, metainfo("Song"));
        apply(&mut snap, with_song(SongMetadata::default()));
        assert!(snap.track.is_none());
    }

    #[test]
    fn negative_length_is_unknown() {
        let song = SongMetadata {
            title: Some("x".into()),
            length: Some(-1),
            ..Default::default()
        };
        assert_eq!(track_info(song).unwrap().length_seconds, 0);
    }

    #[tokio::test]
    async fn follows_a_live_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = read_frame(&mut stream).await.unwrap();
            assert_eq!(hello.kind(), Some(MsgType::Connect));
            assert_eq!(hello.request_connect.unwrap().auth_code, Some(4242));

            stream.write_all(&encode_frame(&metainfo("Song"))).await.unwrap();
            stream
                .write_all(&encode_frame(&Message::of_type(MsgType::Play)))
                .await
                .unwrap();

            let bye = read_frame(&mut stream).await.unwrap();
            assert_eq!(bye.kind(), Some(MsgType::Disconnect));
        });

        let mut remote = ClementineRemote::connect("127.0.0.1", port, Some(4242))
            .await
            .unwrap();
        wait_for(&remote, PlayerState::Playing).await;
        assert_eq!(remote.current_track().unwrap().title, "Song");

        remote.disconnect().await;
        assert_eq!(remote.state(), PlayerState::Disconnected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_reports_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await;
            stream
                .write_all(&encode_frame(&Message::of_type(MsgType::Play)))
                .await
                .unwrap();
        });

        let remote = ClementineRemote::connect("127.0.0.1", port, None)
            .await
            .unwrap();
        wait_for(&remote, PlayerState::Disconnected).await;
    }

    #[tokio::test]
    async fn unreachable_player_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = ClementineRemote::connect("127.0.0.1", port, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Telemetry(_)));
    }
}
