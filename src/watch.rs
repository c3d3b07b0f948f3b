//! Poll the player, turn new titles into signed statuses, publish them.

use std::time::Duration;

use nostr_sdk::{Event, PublicKey, Timestamp};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    lifecycle::RunFlag,
    relay::RelayPool,
    signer::Signer,
    status::build_status_event,
    telemetry::{PlayerState, Telemetry},
};

/// What a single poll did.
#[derive(Debug)]
pub enum Tick {
    /// Not playing or no track reported.
    Idle(PlayerState),
    /// Still the title that was last handled.
    Unchanged,
    /// New title signed and handed to `relays` connections.
    Published { event: Event, relays: usize },
    /// New title whose status could not be signed.
    Failed(Error),
}

pub struct Watcher<T, S> {
    telemetry: T,
    signer: S,
    pool: RelayPool,
    pubkey: PublicKey,
    poll_interval: Duration,
    last_title: Option<String>,
    last_state: Option<PlayerState>,
}

impl<T: Telemetry, S: Signer> Watcher<T, S> {
    /// `pubkey` is the key statuses are authored with, as reported by
    /// `signer`.
    pub fn new(
        telemetry: T,
        signer: S,
        pool: RelayPool,
        pubkey: PublicKey,
        poll_interval: Duration,
    ) -> Self {
        Self {
            telemetry,
            signer,
            pool,
            pubkey,
            poll_interval,
            last_title: None,
            last_state: None,
        }
    }

    /// Sample the player once at time `now`.
    ///
    /// The title is remembered as soon as its status is built, so a failed
    /// signature is not retried until the title changes.
    pub async fn tick(&mut self, now: u64) -> Tick {
        let state = self.telemetry.state();
        let track = match (state, self.telemetry.current_track()) {
            (PlayerState::Playing, Some(track)) => track,
            _ => {
                self.echo_state(state);
                return Tick::Idle(state);
            }
        };
        self.echo_state(state);
        if self.last_title.as_deref() == Some(track.title.as_str()) {
            return Tick::Unchanged;
        }

        let status = build_status_event(&track, now, self.pubkey);
        self.last_title = Some(track.title);
        info!("now playing: {}", status.content);
        match self.signer.sign_event(status).await {
            Ok(event) => {
                let relays = self.pool.publish(&event);
                Tick::Published { event, relays }
            }
            Err(e) => {
                warn!("status not published: {e}");
                Tick::Failed(e)
            }
        }
    }

    fn echo_state(&mut self, state: PlayerState) {
        if self.last_state != Some(state) {
            info!("player state: {state}");
            self.last_state = Some(state);
        } else {
            debug!("player state: {state}");
        }
    }

    /// Poll until `flag` is cleared, then stop the relay pool and drop the
    /// player connection.
    pub async fn run(mut self, flag: &RunFlag) {
        while flag.is_running() {
            self.tick(Timestamp::now().as_u64()).await;
            sleep(self.poll_interval).await;
        }
        self.pool.end().await;
        self.telemetry.disconnect().await;
    }
}
