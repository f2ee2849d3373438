//! Process assembly: the data directory, the `version` ownership lock, and
//! construction/teardown of the subsystems in dependency order. Handles are
//! passed down explicitly; nothing here is a global.

use crate::config::Config;
use crate::db::DbService;
use crate::dl::{self, DlQueueHandle};
use crate::fl::local::ShareStore;
use crate::hub::HubRegistry;
use crate::listener::{BindRequest, BindType, ListenerEvent, ListenerSet, RandomPorts};
use crate::vars::{TlsPolicy, Vars};
use anyhow::Context as _;
use fs2::FileExt as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Data-directory format version, written to the `version` file.
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Exclusive claim on a data directory, held for the process lifetime. The
/// 2-byte `version` file doubles as the lock file.
#[derive(Debug)]
pub struct VersionLock {
    _file: std::fs::File,
    path: PathBuf,
}

#[derive(Debug)]
pub enum LockError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    AlreadyRunning {
        path: PathBuf,
    },
    Incompatible {
        major: u8,
        minor: u8,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot use '{}': {source}", path.display())
            }
            Self::AlreadyRunning { path } => write!(
                f,
                "another instance is using '{}' (version file locked)",
                path.display()
            ),
            Self::Incompatible { major, minor } => write!(
                f,
                "data directory version {major}.{minor} is not supported by this client"
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl VersionLock {
    /// Opens (creating if needed) `<dir>/version`, takes the exclusive lock
    /// and checks the stored version pair.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join("version");
        let io = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io)?;
        // The OS drops the lock if the process dies, so a stale file never
        // wedges the directory.
        if file.try_lock_exclusive().is_err() {
            return Err(LockError::AlreadyRunning { path });
        }
        let mut buf = Vec::new();
        use std::io::Read as _;
        file.read_to_end(&mut buf).map_err(io)?;
        match buf.as_slice() {
            [] => {
                file.write_all(&[VERSION_MAJOR, VERSION_MINOR]).map_err(io)?;
                file.flush().map_err(io)?;
            }
            [major, minor] if *major == VERSION_MAJOR => {
                let _ = minor;
            }
            [major, minor] => {
                return Err(LockError::Incompatible {
                    major: *major,
                    minor: *minor,
                })
            }
            _ => {
                return Err(LockError::Incompatible {
                    major: 0,
                    minor: 0,
                })
            }
        }
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The assembled engine. Keeps every subsystem handle alive; dropping it
/// (via [`App::shutdown`]) tears them down in reverse order.
pub struct App {
    pub data_dir: PathBuf,
    pub vars: Arc<Vars>,
    pub hubs: Arc<HubRegistry>,
    pub share: ShareStore,
    pub queue: DlQueueHandle,
    pub listeners: ListenerSet,
    pub listener_events: mpsc::UnboundedReceiver<ListenerEvent>,
    pub dl_events: mpsc::UnboundedReceiver<dl::DlEvent>,
    pub connect_requests: mpsc::UnboundedReceiver<crate::hub::ConnectRequest>,
    pub stats: Arc<crate::util::NetStats>,
    db: Option<DbService>,
    _lock: VersionLock,
}

impl App {
    pub async fn init(config: &Config) -> anyhow::Result<App> {
        let dir = &config.data_dir;
        for sub in ["logs", "inc", "fl", "cert"] {
            std::fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("creating {}", dir.join(sub).display()))?;
        }
        let lock = VersionLock::acquire(dir)?;
        tracing::debug!(lock = %lock.path().display(), "data directory claimed");

        let db = DbService::open(&dir.join("db.sqlite3"))?;
        let vars = Arc::new(Vars::load(db.handle(), dir.clone())?);
        let share = ShareStore::load(db.handle())?;
        let (hubs, connect_requests) = HubRegistry::new();
        let hubs = Arc::new(hubs);

        let random = RandomPorts::draw();
        tracing::debug!(
            tcp = random.tcp,
            udp = random.udp,
            tls = random.tls,
            "random listen ports drawn"
        );
        let (listen_tx, listener_events) = mpsc::unbounded_channel();
        let listeners = ListenerSet::new(random, listen_tx);

        let (queue, dl_events, _queue_join) =
            dl::start_queue(db.handle(), vars.clone(), hubs.clone(), dir).await;

        Ok(App {
            data_dir: dir.clone(),
            vars,
            hubs,
            share,
            queue,
            listeners,
            listener_events,
            dl_events,
            connect_requests,
            stats: crate::util::NetStats::new(),
            db: Some(db),
            _lock: lock,
        })
    }

    /// Rebuilds the listener set from the per-hub `active` configuration.
    /// Call whenever a hub is opened/closed or an `active_*` setting changed.
    pub fn refresh_listeners(&mut self, hub_ids: &[u64]) {
        let mut requests = Vec::new();
        for &hub in hub_ids {
            if !self.vars.active(hub) {
                continue;
            }
            let ip = self
                .vars
                .local_address(hub)
                .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
            requests.push(BindRequest {
                hub,
                kind: BindType::Tcp,
                ip,
                port: self.vars.active_port(hub),
            });
            requests.push(BindRequest {
                hub,
                kind: BindType::Udp,
                ip,
                port: self.vars.active_udp_port(hub),
            });
            if self.vars.tls_policy(hub) != TlsPolicy::Disabled {
                requests.push(BindRequest {
                    hub,
                    kind: BindType::Tls,
                    ip,
                    port: self.vars.active_tls_port(hub),
                });
            }
        }
        if let Err(err) = self.listeners.refresh(&requests) {
            tracing::warn!(error = %err, "listener refresh failed");
        }
    }

    pub async fn shutdown(mut self) {
        self.listeners.stop();
        self.queue.shutdown().await;
        if let Some(db) = self.db.take() {
            db.shutdown();
        }
    }
}

/// Binary entry point: bring the engine up, surface its events in the log,
/// and wait for termination.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut app = App::init(&config).await?;
    tracing::info!(dir = %app.data_dir.display(), "engine running");

    let autorefresh = app.vars.autorefresh();
    let period = std::time::Duration::from_secs(autorefresh.max(1));
    let mut rescan = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = rescan.tick(), if autorefresh > 0 => {
                if let Err(err) = tokio::task::block_in_place(|| app.share.scan()) {
                    tracing::warn!(error = %err, "share rescan failed");
                }
            }
            event = app.dl_events.recv() => {
                match event {
                    Some(dl::DlEvent::Message(msg)) => tracing::info!("{msg}"),
                    Some(other) => tracing::debug!(?other, "queue event"),
                    None => break,
                }
            }
            event = app.listener_events.recv() => {
                match event {
                    Some(ListenerEvent::Stopped { reason }) => {
                        tracing::warn!(reason, "listeners stopped; passive mode");
                        app.listeners.stop();
                    }
                    Some(other) => tracing::debug!(?other, "listener event"),
                    None => break,
                }
            }
            request = app.connect_requests.recv() => {
                match request {
                    // The hub/protocol layer opens the peer session; the
                    // engine only logs it here.
                    Some(req) => tracing::debug!(uid = format_args!("{:016x}", req.uid),
                        "peer session requested"),
                    None => break,
                }
            }
        }
    }

    tracing::info!("shutting down");
    app.shutdown().await;
    Ok(())
}
