//! Settings layered from built-in defaults, a `KEY=value` file and the
//! command line, in that order of precedence.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_RELAYS: &str = "ws://localhost:8081";
pub const DEFAULT_CLEMENTINE_PORT: u16 = 5500;
pub const CONFIG_FILE: &str = "tunestr.env";
pub const KEYSTORE_FILE: &str = "keystore.db";

/// Values given on the command line. `None` leaves lower layers in place.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub conf: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub relays: Option<String>,
    pub user: Option<String>,
    pub clementine_host: Option<String>,
    pub clementine_port: Option<u16>,
    pub clementine_auth: Option<i32>,
    pub keystore_file: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub sign_timeout_secs: Option<u64>,
    pub tor_socks: Option<String>,
    pub debug: bool,
}

/// Runtime settings.
#[derive(Clone)]
pub struct Settings {
    /// Base directory for files given without a directory part.
    pub work_dir: PathBuf,
    /// Relays statuses are published to.
    pub relays: Vec<String>,
    /// `bunker://` URI, `nsec`/hex secret key, or key store alias.
    pub user: String,
    pub clementine_host: String,
    pub clementine_port: u16,
    pub clementine_auth: Option<i32>,
    pub keystore_file: PathBuf,
    /// Key store password; prompted for when absent.
    pub keystore_password: Option<String>,
    pub poll_interval: Duration,
    /// Bound on every remote signer round trip.
    pub sign_timeout: Duration,
    /// Optional SOCKS5 proxy (host:port) for relay connections.
    pub tor_socks: Option<String>,
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let work_dir = default_work_dir();
        Self {
            keystore_file: work_dir.join(KEYSTORE_FILE),
            work_dir,
            relays: csv_strings(DEFAULT_RELAYS),
            user: String::new(),
            clementine_host: String::new(),
            clementine_port: DEFAULT_CLEMENTINE_PORT,
            clementine_auth: None,
            keystore_password: None,
            poll_interval: Duration::from_millis(1000),
            sign_timeout: Duration::from_secs(30),
            tor_socks: None,
            debug: false,
        }
    }
}

impl Settings {
    /// Build settings from defaults, the config file and `cli`.
    ///
    /// The config file is `cli.conf` or `<work dir>/tunestr.env`; a missing
    /// file is skipped, an unreadable or malformed one is an error.
    pub fn load(cli: Overrides) -> Result<Self> {
        let work_dir = cli.work_dir.clone().unwrap_or_else(default_work_dir);
        let conf = resolve_in(&work_dir, cli.conf.as_deref().unwrap_or(Path::new(CONFIG_FILE)));
        let file = read_config_file(&conf)?;

        let mut settings = Settings {
            keystore_file: work_dir.join(KEYSTORE_FILE),
            work_dir,
            ..Default::default()
        };
        settings.apply_file(&file)?;
        settings.apply_overrides(cli);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_file(&mut self, file: &HashMap<String, String>) -> Result<()> {
        let get = |key: &str| file.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = get("RELAYS") {
            self.relays = csv_strings(v);
        }
        if let Some(v) = get("USER") {
            self.user = v.to_string();
        }
        if let Some(v) = get("CLEMENTINE_HOST") {
            self.clementine_host = v.to_string();
        }
        if let Some(v) = get("CLEMENTINE_PORT") {
            self.clementine_port = parse_number("CLEMENTINE_PORT", v)?;
        }
        if let Some(v) = get("CLEMENTINE_AUTH") {
            self.clementine_auth = Some(parse_number("CLEMENTINE_AUTH", v)?);
        }
        if let Some(v) = get("KEYSTORE_FILE") {
            self.keystore_file = resolve_in(&self.work_dir, Path::new(v));
        }
        if let Some(v) = get("KEYSTORE_PASSWORD") {
            self.keystore_password = Some(v.to_string());
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(parse_number("POLL_INTERVAL_MS", v)?);
        }
        if let Some(v) = get("SIGN_TIMEOUT_SECS") {
            self.sign_timeout = Duration::from_secs(parse_number("SIGN_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = get("TOR_SOCKS") {
            self.tor_socks = Some(v.to_string());
        }
        if let Some(v) = get("DEBUG") {
            self.debug = parse_flag("DEBUG", v)?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, cli: Overrides) {
        if let Some(v) = cli.relays {
            self.relays = csv_strings(v);
        }
        if let Some(v) = cli.user {
            self.user = v;
        }
        if let Some(v) = cli.clementine_host {
            self.clementine_host = v;
        }
        if let Some(v) = cli.clementine_port {
            self.clementine_port = v;
        }
        if let Some(v) = cli.clementine_auth {
            self.clementine_auth = Some(v);
        }
        if let Some(v) = cli.keystore_file {
            self.keystore_file = resolve_in(&self.work_dir, &v);
        }
        if let Some(v) = cli.poll_interval_ms {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = cli.sign_timeout_secs {
            self.sign_timeout = Duration::from_secs(v);
        }
        if let Some(v) = cli.tor_socks.filter(|s| !s.is_empty()) {
            self.tor_socks = Some(v);
        }
        self.debug |= cli.debug;
    }

    fn validate(&self) -> Result<()> {
        if self.clementine_host.trim().is_empty() {
            return Err(Error::Config(
                "clementine host is required (--ip or CLEMENTINE_HOST)".into(),
            ));
        }
        if self.user.trim().is_empty() {
            return Err(Error::Config(
                "user is required: bunker URI, nsec or key store alias (--user or USER)".into(),
            ));
        }
        if self.relays.is_empty() {
            return Err(Error::Config("at least one relay is required".into()));
        }
        for relay in &self.relays {
            let url = Url::parse(relay)
                .map_err(|e| Error::Config(format!("invalid relay {relay}: {e}")))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(Error::Config(format!("relay {relay} is not a ws:// or wss:// URL")));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".into()));
        }
        if self.sign_timeout.is_zero() {
            return Err(Error::Config("sign timeout must be positive".into()));
        }
        Ok(())
    }

    /// `user` with any secret material hidden.
    fn redacted_user(&self) -> String {
        let user = self.user.trim();
        if user
            .get(..9)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bunker://"))
        {
            return match user.split_once('?') {
                Some((base, _)) => format!("{base}?…"),
                None => user.to_string(),
            };
        }
        if user.starts_with("nsec1")
            || (user.len() == 64 && user.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return "<secret key>".into();
        }
        user.to_string()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("work_dir", &self.work_dir)
            .field("relays", &self.relays)
            .field("user", &self.redacted_user())
            .field("clementine_host", &self.clementine_host)
            .field("clementine_port", &self.clementine_port)
            .field("clementine_auth", &self.clementine_auth.map(|_| "<set>"))
            .field("keystore_file", &self.keystore_file)
            .field("keystore_password", &self.keystore_password.as_ref().map(|_| "<set>"))
            .field("poll_interval", &self.poll_interval)
            .field("sign_timeout", &self.sign_timeout)
            .field("tor_socks", &self.tor_socks)
            .field("debug", &self.debug)
            .finish()
    }
}

fn default_work_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tunestr"))
        .unwrap_or_else(|| PathBuf::from(".tunestr"))
}

/// Bare file names live in `work_dir`; anything with a directory part is
/// taken as given.
fn resolve_in(work_dir: &Path, path: &Path) -> PathBuf {
    if path.is_relative() && path.components().count() == 1 {
        work_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

fn read_config_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    iter.map(|item| {
        item.map_err(|e| Error::Config(format!("malformed config file {}: {e}", path.display())))
    })
    .collect()
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got {value:?}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key} must be true or false, got {value:?}"))),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
