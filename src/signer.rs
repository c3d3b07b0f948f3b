//! Signing backends and the policy that picks one from the `user` setting.

use std::{fmt::Display, future::Future, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use nostr_connect::prelude::NostrConnect;
use nostr_sdk::{
    nips::nip46::NostrConnectURI,
    prelude::{ConnectionMode, RelayOptions},
    Event, Keys, NostrSigner, PublicKey, ToBech32, UnsignedEvent,
};
use tracing::info;

use crate::{
    config::Settings,
    error::{Error, Result},
    keystore::{CachedPassword, KeyStore, PasswordProvider, PromptPassword, StoredKey},
};

/// nostr-connect's own request timeout sits past ours, so callers see
/// `SigningTimeout` rather than a transport error.
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Something that can vouch for events on behalf of the user.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Key events are authored with.
    async fn get_public_key(&self) -> Result<PublicKey>;

    /// Produce the id and signature for `event`.
    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event>;
}

/// `npub1…` form of `pubkey` for logs.
pub fn npub(pubkey: &PublicKey) -> String {
    pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex())
}

/// Signs with a key held in memory.
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn get_public_key(&self) -> Result<PublicKey> {
        Ok(self.keys.public_key())
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event> {
        if event.pubkey != self.keys.public_key() {
            return Err(Error::Signing(format!(
                "event author {} is not the local key",
                event.pubkey
            )));
        }
        event
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Signing(e.to_string()))
    }
}

/// NIP-46 client talking to a bunker over its relays.
pub struct RemoteSigner {
    client: NostrConnect,
    user: PublicKey,
    timeout: Duration,
}

impl RemoteSigner {
    /// Open the bunker session and learn the user key. Each request to the
    /// bunker is bounded by `timeout`.
    pub async fn connect(
        uri: NostrConnectURI,
        timeout: Duration,
        tor_socks: Option<&str>,
    ) -> Result<Self> {
        let opts = match tor_socks {
            Some(proxy) => {
                let addr: SocketAddr = proxy
                    .parse()
                    .map_err(|e| Error::Config(format!("TOR_SOCKS {proxy}: {e}")))?;
                Some(RelayOptions::default().connection_mode(ConnectionMode::Proxy(addr)))
            }
            None => None,
        };
        let request_timeout = timeout + CLIENT_TIMEOUT_SLACK;
        let client = NostrConnect::new(uri, Keys::generate(), request_timeout, opts)
            .map_err(|e| Error::Signing(e.to_string()))?;
        let user = bounded(timeout, NostrSigner::get_public_key(&client)).await?;
        Ok(Self {
            client,
            user,
            timeout,
        })
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn get_public_key(&self) -> Result<PublicKey> {
        Ok(self.user)
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event> {
        let call = NostrSigner::sign_event(&self.client, event.clone());
        let signed = bounded(self.timeout, call).await?;
        check_signed(&event, &signed, &self.user)?;
        Ok(signed)
    }
}

async fn bounded<T, E, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Signing(e.to_string())),
        Err(_) => Err(Error::SigningTimeout(limit)),
    }
}

/// A remote answer must be the requested event, by the user, validly signed.
fn check_signed(requested: &UnsignedEvent, signed: &Event, user: &PublicKey) -> Result<()> {
    if signed.pubkey != *user {
        return Err(Error::Signing(format!(
            "signer answered as {} instead of {user}",
            signed.pubkey
        )));
    }
    let same = signed.kind == requested.kind
        && signed.created_at == requested.created_at
        && signed.content == requested.content
        && signed.tags.iter().eq(requested.tags.iter());
    if !same {
        return Err(Error::Signing("signer altered the event".into()));
    }
    signed
        .verify()
        .map_err(|e| Error::Signing(format!("invalid signature: {e}")))
}

/// The signer chosen at startup, fixed for the life of the process.
pub enum UserSigner {
    Local(LocalSigner),
    Remote(RemoteSigner),
}

#[async_trait]
impl Signer for UserSigner {
    async fn get_public_key(&self) -> Result<PublicKey> {
        match self {
            UserSigner::Local(s) => s.get_public_key().await,
            UserSigner::Remote(s) => s.get_public_key().await,
        }
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event> {
        match self {
            UserSigner::Local(s) => s.sign_event(event).await,
            UserSigner::Remote(s) => s.sign_event(event).await,
        }
    }
}

/// What the `user` setting refers to.
#[derive(Debug)]
enum Identity {
    Remote(NostrConnectURI),
    Key(Keys),
    Alias(String),
}

fn classify(user: &str) -> Result<Identity> {
    let user = user.trim();
    if user.is_empty() {
        return Err(Error::Config("no user identity configured".into()));
    }
    let scheme = user.get(..9).filter(|p| p.eq_ignore_ascii_case("bunker://"));
    if scheme.is_some() {
        return bunker_uri(user.get(9..).unwrap_or_default()).map(Identity::Remote);
    }
    if let Ok(keys) = Keys::parse(user) {
        return Ok(Identity::Key(keys));
    }
    if PublicKey::parse(user).is_ok() {
        return Err(Error::Config(format!(
            "{user} is a public key only and cannot sign"
        )));
    }
    Ok(Identity::Alias(user.to_string()))
}

fn bunker_uri(rest: &str) -> Result<NostrConnectURI> {
    let uri = NostrConnectURI::parse(format!("bunker://{rest}"))
        .map_err(|e| Error::Config(format!("bad bunker URI: {e}")))?;
    match &uri {
        NostrConnectURI::Bunker { relays, .. } if !relays.is_empty() => Ok(uri),
        NostrConnectURI::Bunker { .. } => Err(Error::Config("bunker URI lists no relay".into())),
        _ => Err(Error::Config("not a bunker URI".into())),
    }
}

/// Build the signer for `settings.user`.
///
/// A `bunker://` URI selects remote signing; otherwise the value is tried as
/// key material and finally as a key store alias. Every way of ending up
/// without a usable private key is a configuration error.
pub async fn resolve_signer(settings: &Settings) -> Result<UserSigner> {
    match classify(&settings.user)? {
        Identity::Remote(uri) => {
            info!("using remote signer");
            let remote =
                RemoteSigner::connect(uri, settings.sign_timeout, settings.tor_socks.as_deref())
                    .await
                    .map_err(|e| Error::Config(format!("remote signer unavailable: {e}")))?;
            Ok(UserSigner::Remote(remote))
        }
        Identity::Key(keys) => {
            info!("using local key {}", npub(&keys.public_key()));
            Ok(UserSigner::Local(LocalSigner::new(keys)))
        }
        Identity::Alias(alias) => {
            let keys = lookup_alias(settings, &alias)?;
            info!("using key store alias {alias} ({})", npub(&keys.public_key()));
            Ok(UserSigner::Local(LocalSigner::new(keys)))
        }
    }
}

fn lookup_alias(settings: &Settings, alias: &str) -> Result<Keys> {
    let password: Box<dyn PasswordProvider> = match settings.keystore_password.clone() {
        Some(pw) => Box::new(move || -> Result<String> { Ok(pw.clone()) }),
        None => Box::new(CachedPassword::new(PromptPassword::new("keystore key: "))),
    };
    let path = &settings.keystore_file;
    let store = KeyStore::open(path, password).map_err(|e| {
        Error::Config(format!("cannot open key store {}: {e}", path.display()))
    })?;
    match store.get(alias) {
        Ok(Some(StoredKey::Secret(keys))) => Ok(keys),
        Ok(Some(StoredKey::PublicOnly(pk))) => Err(Error::Config(format!(
            "{alias} ({}) has no private key and cannot sign",
            npub(&pk)
        ))),
        Ok(None) => Err(Error::Config(format!(
            "{alias} is neither a key nor a known alias"
        ))),
        Err(e) => Err(Error::Config(format!("cannot load key for {alias}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keystore::create_store, status::build_status_event, status::TrackInfo};
    use futures_util::StreamExt;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn settings(user: &str, store: &Path) -> Settings {
        Settings {
            user: user.into(),
            keystore_file: store.to_path_buf(),
            keystore_password: Some("pw".into()),
            ..Default::default()
        }
    }

    fn unsigned(pubkey: PublicKey) -> UnsignedEvent {
        let track = TrackInfo {
            track_number: 1,
            title: "x".into(),
            ..Default::default()
        };
        build_status_event(&track, 1, pubkey)
    }

    fn bunker(pubkey: &PublicKey, relay: &str) -> String {
        format!("bunker://{}?relay={relay}", pubkey.to_hex())
    }

    #[test]
    fn bunker_prefix_is_case_insensitive() {
        let pk = Keys::generate().public_key();
        for scheme in ["bunker", "Bunker", "BUNKER"] {
            let uri = bunker(&pk, "wss://r.example").replacen("bunker", scheme, 1);
            let id = classify(&uri).unwrap();
            assert!(matches!(id, Identity::Remote(_)), "{scheme}");
        }
    }

    #[test]
    fn bunker_without_relay_is_a_config_error() {
        let pk = Keys::generate().public_key();
        let uri = format!("bunker://{}", pk.to_hex());
        assert!(matches!(classify(&uri), Err(Error::Config(_))));
        assert!(matches!(classify("bunker://nothex?relay=wss://r.example"), Err(Error::Config(_))));
    }

    #[test]
    fn key_material_is_tried_before_alias() {
        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        let hex_sk = keys.secret_key().to_secret_hex();
        for input in [nsec.as_str(), hex_sk.as_str()] {
            match classify(input).unwrap() {
                Identity::Key(k) => assert_eq!(k.public_key(), keys.public_key()),
                other => panic!("{input} classified as {other:?}"),
            }
        }
        assert!(matches!(classify("alice").unwrap(), Identity::Alias(a) if a == "alice"));
    }

    #[test]
    fn empty_user_is_a_config_error() {
        assert!(matches!(classify("  "), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn nsec_resolves_without_key_store() {
        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        let s = settings(&nsec, Path::new("/nonexistent/keys.db"));
        let signer = resolve_signer(&s).await.unwrap();
        assert!(matches!(signer, UserSigner::Local(_)));
        assert_eq!(signer.get_public_key().await.unwrap(), keys.public_key());
        let ev = signer.sign_event(unsigned(keys.public_key())).await.unwrap();
        ev.verify().unwrap();
    }

    #[tokio::test]
    async fn npub_cannot_sign() {
        let npub = Keys::generate().public_key().to_bech32().unwrap();
        let s = settings(&npub, Path::new("/nonexistent/keys.db"));
        assert!(matches!(resolve_signer(&s).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn alias_resolves_through_key_store() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("keys.db");
        let alice = Keys::generate();
        let watcher = Keys::generate();
        create_store(&db, &[("alice", &alice, Some("pw")), ("watcher", &watcher, None)]).unwrap();

        let signer = resolve_signer(&settings("alice", &db)).await.unwrap();
        assert_eq!(signer.get_public_key().await.unwrap(), alice.public_key());

        for (alias, why) in [("watcher", "public only"), ("bob", "unknown"), ("Alice", "case")] {
            let res = resolve_signer(&settings(alias, &db)).await;
            assert!(matches!(res, Err(Error::Config(_))), "{why}");
        }
    }

    #[tokio::test]
    async fn wrong_password_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("keys.db");
        create_store(&db, &[("alice", &Keys::generate(), Some("pw"))]).unwrap();
        let mut s = settings("alice", &db);
        s.keystore_password = Some("nope".into());
        assert!(matches!(resolve_signer(&s).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn missing_key_store_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let s = settings("alice", &dir.path().join("missing.db"));
        assert!(matches!(resolve_signer(&s).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn local_signer_refuses_foreign_author() {
        let signer = LocalSigner::new(Keys::generate());
        let other = Keys::generate();
        let err = signer.sign_event(unsigned(other.public_key())).await.unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
    }

    #[test]
    fn remote_answers_are_checked() {
        let user = Keys::generate();
        let requested = unsigned(user.public_key());
        let honest = requested.clone().sign_with_keys(&user).unwrap();
        check_signed(&requested, &honest, &user.public_key()).unwrap();

        let stranger = Keys::generate();
        let forged = unsigned(stranger.public_key()).sign_with_keys(&stranger).unwrap();
        assert!(check_signed(&requested, &forged, &user.public_key()).is_err());

        let mut other_content = requested.clone();
        other_content.content = "something else".into();
        let altered = other_content.sign_with_keys(&user).unwrap();
        assert!(check_signed(&requested, &altered, &user.public_key()).is_err());

        let mut json = serde_json::to_value(&honest).unwrap();
        json["content"] = "tampered".into();
        let tampered: Event = serde_json::from_value(json).unwrap();
        let mut expected = requested;
        expected.content = "tampered".into();
        assert!(matches!(
            check_signed(&expected, &tampered, &user.public_key()),
            Err(Error::Signing(_))
        ));
    }

    #[tokio::test]
    async fn silent_bunker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accepts the client and never answers
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let remote = Keys::generate().public_key();
        let id = classify(&bunker(&remote, &format!("ws://{addr}"))).unwrap();
        let Identity::Remote(uri) = id else {
            panic!("expected a bunker identity");
        };
        let limit = Duration::from_millis(500);
        let res = RemoteSigner::connect(uri, limit, None).await;
        assert!(matches!(res, Err(Error::SigningTimeout(d)) if d == limit));
    }

    #[tokio::test]
    async fn unreachable_bunker_is_a_config_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let remote = Keys::generate().public_key();
        let mut s = settings(&bunker(&remote, &format!("ws://127.0.0.1:{port}")), Path::new("x"));
        s.sign_timeout = Duration::from_millis(300);
        assert!(matches!(resolve_signer(&s).await, Err(Error::Config(_))));
    }
}
