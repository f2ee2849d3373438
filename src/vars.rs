//! Runtime settings: a flat `(hub-id, name) -> string` store persisted in the
//! `vars` table, with a write-through cache so reads never wait on the db
//! thread. Hub id 0 is the global scope; per-hub lookups fall back to it.

use crate::db::{DbError, DbHandle, Query, Value};
use crate::util::{parse_bool, parse_interval};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Global scope for settings that are not hub-specific.
pub const HUB_GLOBAL: u64 = 0;

pub const DEFAULT_SLOTS: u32 = 10;
pub const DEFAULT_DOWNLOAD_SLOTS: u32 = 3;
pub const DEFAULT_AUTOREFRESH: u64 = 3600;
pub const DEFAULT_FILELIST_MAXAGE: u64 = 7 * 24 * 3600;
const MIN_AUTOREFRESH: u64 = 600;
const MAX_NICK_BYTES: usize = 32;

#[derive(Debug)]
pub enum VarError {
    Invalid { name: &'static str, reason: String },
    Db(DbError),
}

impl std::fmt::Display for VarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { name, reason } => write!(f, "invalid value for `{name}': {reason}"),
            Self::Db(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for VarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Db(source) => Some(source),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<DbError> for VarError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

/// Per-hub TLS disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    Disabled,
    #[default]
    Allow,
    Prefer,
}

impl TlsPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(Self::Disabled),
            "allow" => Some(Self::Allow),
            "prefer" => Some(Self::Prefer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
        }
    }
}

#[derive(Debug)]
pub struct Vars {
    db: DbHandle,
    data_dir: PathBuf,
    cache: Mutex<HashMap<(u64, String), String>>,
}

impl Vars {
    /// Loads the whole table into the cache. Run once at startup.
    pub fn load(db: DbHandle, data_dir: PathBuf) -> Result<Self, DbError> {
        let mut cache = HashMap::new();
        for row in db.query_rows(Query::VarListAll, vec![])? {
            let (Some(name), Some(hub), Some(value)) =
                (row[0].as_str(), row[1].as_i64(), row[2].as_str())
            else {
                continue;
            };
            cache.insert((hub as u64, name.to_string()), value.to_string());
        }
        Ok(Self {
            db,
            data_dir,
            cache: Mutex::new(cache),
        })
    }

    /// Raw lookup in exactly one scope.
    pub fn get_raw(&self, hub: u64, name: &str) -> Option<String> {
        self.cache
            .lock()
            .expect("vars cache")
            .get(&(hub, name.to_string()))
            .cloned()
    }

    /// Lookup with global fallback.
    pub fn get(&self, hub: u64, name: &str) -> Option<String> {
        self.get_raw(hub, name)
            .or_else(|| (hub != HUB_GLOBAL).then(|| self.get_raw(HUB_GLOBAL, name)).flatten())
    }

    pub fn get_bool(&self, hub: u64, name: &str, default: bool) -> bool {
        self.get(hub, name)
            .and_then(|v| parse_bool(&v))
            .unwrap_or(default)
    }

    pub fn get_u64(&self, hub: u64, name: &str, default: u64) -> u64 {
        self.get(hub, name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Validates and stores a setting. The write is queued on the db thread;
    /// the cache is updated synchronously so later reads observe it.
    pub fn set(&self, hub: u64, name: &str, value: &str) -> Result<(), VarError> {
        let value = validate(name, value)?;
        self.cache
            .lock()
            .expect("vars cache")
            .insert((hub, name.to_string()), value.clone());
        self.db.exec(
            Query::VarSet,
            vec![
                Value::Text(name.to_string()),
                Value::Int64(hub as i64),
                Value::Text(value),
            ],
        )?;
        Ok(())
    }

    pub fn unset(&self, hub: u64, name: &str) -> Result<(), VarError> {
        self.cache
            .lock()
            .expect("vars cache")
            .remove(&(hub, name.to_string()));
        self.db.exec(
            Query::VarDel,
            vec![Value::Text(name.to_string()), Value::Int64(hub as i64)],
        )?;
        Ok(())
    }

    // Typed accessors for the options the engine consumes.

    pub fn nick(&self) -> Option<String> {
        self.get_raw(HUB_GLOBAL, "nick")
    }

    pub fn slots(&self) -> u32 {
        self.get_u64(HUB_GLOBAL, "slots", DEFAULT_SLOTS as u64).max(1) as u32
    }

    pub fn download_slots(&self) -> u32 {
        self.get_u64(HUB_GLOBAL, "download_slots", DEFAULT_DOWNLOAD_SLOTS as u64)
            .max(1) as u32
    }

    pub fn download_dir(&self) -> PathBuf {
        self.get(HUB_GLOBAL, "download_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir.join("dl"))
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.get(HUB_GLOBAL, "incoming_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir.join("inc"))
    }

    /// Share rescan interval in seconds; 0 disables.
    pub fn autorefresh(&self) -> u64 {
        self.get(HUB_GLOBAL, "autorefresh")
            .and_then(|v| parse_interval(&v))
            .unwrap_or(DEFAULT_AUTOREFRESH)
    }

    /// Age in seconds after which downloaded file lists are removed.
    pub fn filelist_maxage(&self) -> u64 {
        self.get(HUB_GLOBAL, "filelist_maxage")
            .and_then(|v| parse_interval(&v))
            .unwrap_or(DEFAULT_FILELIST_MAXAGE)
    }

    pub fn flush_file_cache(&self) -> bool {
        self.get_bool(HUB_GLOBAL, "flush_file_cache", false)
    }

    pub fn tls_policy(&self, hub: u64) -> TlsPolicy {
        self.get(hub, "tls_policy")
            .and_then(|v| TlsPolicy::parse(&v))
            .unwrap_or_default()
    }

    pub fn active(&self, hub: u64) -> bool {
        self.get_bool(hub, "active", false)
    }

    pub fn local_address(&self, hub: u64) -> Option<std::net::Ipv4Addr> {
        self.get(hub, "local_address").and_then(|v| v.parse().ok())
    }

    pub fn active_port(&self, hub: u64) -> u16 {
        self.get_u64(hub, "active_port", 0) as u16
    }

    pub fn active_udp_port(&self, hub: u64) -> u16 {
        self.get_u64(hub, "active_udp_port", 0) as u16
    }

    pub fn active_tls_port(&self, hub: u64) -> u16 {
        self.get_u64(hub, "active_tls_port", 0) as u16
    }
}

/// Per-name validation; returns the canonical value to store.
fn validate(name: &str, value: &str) -> Result<String, VarError> {
    match name {
        "nick" => {
            if value.is_empty() {
                return Err(invalid("nick", "may not be empty"));
            }
            if value.len() > MAX_NICK_BYTES {
                return Err(invalid("nick", "longer than 32 bytes"));
            }
            if value
                .bytes()
                .any(|b| matches!(b, b'$' | b'|' | b' ' | b'<' | b'>'))
            {
                return Err(invalid("nick", "may not contain $, |, <, > or spaces"));
            }
            Ok(value.to_string())
        }
        "autorefresh" => {
            let secs = parse_interval(value)
                .ok_or_else(|| invalid("autorefresh", format!("not an interval: {value}")))?;
            if secs != 0 && secs < MIN_AUTOREFRESH {
                return Err(invalid("autorefresh", "must be 0 or at least 10 minutes"));
            }
            Ok(secs.to_string())
        }
        "filelist_maxage" => {
            let secs = parse_interval(value)
                .ok_or_else(|| invalid("filelist_maxage", format!("not an interval: {value}")))?;
            Ok(secs.to_string())
        }
        "slots" | "download_slots" => {
            let n: u32 = value
                .trim()
                .parse()
                .map_err(|_| invalid("slots", format!("not a number: {value}")))?;
            if n < 1 {
                return Err(invalid("slots", "must be at least 1"));
            }
            Ok(n.to_string())
        }
        "tls_policy" => TlsPolicy::parse(value)
            .map(|p| p.as_str().to_string())
            .ok_or_else(|| invalid("tls_policy", "expected disabled, allow or prefer")),
        "active" | "flush_file_cache" | "log_debug" | "log_downloads" | "log_uploads" => {
            let b = parse_bool(value)
                .ok_or_else(|| invalid("boolean", format!("not a boolean: {value}")))?;
            Ok(if b { "1" } else { "0" }.to_string())
        }
        "active_port" | "active_udp_port" | "active_tls_port" => {
            let port: u16 = value
                .trim()
                .parse()
                .map_err(|_| invalid("port", format!("not a port number: {value}")))?;
            Ok(port.to_string())
        }
        "local_address" => {
            let ip: std::net::Ipv4Addr = value
                .trim()
                .parse()
                .map_err(|_| invalid("local_address", format!("not an IPv4 address: {value}")))?;
            Ok(ip.to_string())
        }
        // Free-form values (email, description, connection, paths, ...).
        _ => Ok(value.to_string()),
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> VarError {
    VarError::Invalid {
        name,
        reason: reason.into(),
    }
}
