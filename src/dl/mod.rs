//! Download orchestration: the queue of downloads, per-user sub-queues, the
//! slot scheduler, hash verification and resume logic.

pub mod queue;
pub mod recv;

pub use queue::{start_queue, DlQueueHandle, QueueSnapshot, RecordInfo, UserInfo};

use crate::cc::CcHandle;
use crate::fl::{FileTree, NodeId};
use crate::tth::TthDigest;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Minimum per-leaf block size kept when shrinking received TTHL data.
pub const MIN_BLOCK_SIZE: u64 = 1 << 20;
/// Files below this size skip TTHL entirely and verify against the root.
pub const MIN_TTHL_SIZE: u64 = 2 << 20;
/// Delay before a user in `WaitingReconnect` is considered again.
pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(60);
/// Timeout for an expected incoming peer connection.
pub const EXPECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
/// Debounce between a state change and the next selection pass.
pub const EVAL_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

/// Download priority. Stored in the database; keep the values stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum Priority {
    /// Disabled due to a (permanent) error.
    Error = -65,
    /// Disabled by the user.
    Off = -64,
    VeryLow = -2,
    Low = -1,
    Med = 0,
    High = 1,
    VeryHigh = 2,
}

impl Priority {
    pub fn enabled(self) -> bool {
        self > Priority::Off
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            -65 => Self::Error,
            -64 => Self::Off,
            -2 => Self::VeryLow,
            -1 => Self::Low,
            1 => Self::High,
            2 => Self::VeryHigh,
            _ => Self::Med,
        }
    }

    pub fn code(self) -> i64 {
        self as i8 as i64
    }
}

/// Download error kinds, global or per-user. Stored in the database; keep
/// the values stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DlErrorKind {
    #[default]
    None,
    /// TTHL data does not match the file root.
    BadTthl,
    /// The user does not have the file.
    NotAvailable,
    /// I/O error on the incoming file.
    IoIncoming,
    /// I/O error moving the file to its destination.
    IoDestination,
    /// A content block failed its hash check.
    HashMismatch,
}

impl DlErrorKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::BadTthl,
            2 => Self::NotAvailable,
            3 => Self::IoIncoming,
            4 => Self::IoDestination,
            5 => Self::HashMismatch,
            _ => Self::None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::BadTthl => 1,
            Self::NotAvailable => 2,
            Self::IoIncoming => 3,
            Self::IoDestination => 4,
            Self::HashMismatch => 5,
        }
    }

    /// Human-readable description, with the optional detail recorded when
    /// the error was set.
    pub fn describe(self, detail: Option<&str>) -> String {
        let base = match self {
            Self::None => "No error",
            Self::BadTthl => "TTHL data does not match TTH root",
            Self::NotAvailable => "File not available from this user",
            Self::IoIncoming => "Error writing to temporary file",
            Self::IoDestination => "Error moving file to destination",
            Self::HashMismatch => "Hash chunk does not match downloaded data",
        };
        match detail {
            Some(d) if !d.is_empty() => format!("{base}: {d}"),
            _ => base.to_string(),
        }
    }
}

/// Per-user connection/transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    NotConnected,
    Expecting,
    Idle,
    Active,
    WaitingReconnect,
}

/// Result of associating a known source with an existing download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    NotInQueue,
    AlreadyAssociated,
    Associated,
}

/// What the orchestrator hands a peer session to start a transfer.
#[derive(Debug, Clone)]
pub struct DlAssignment {
    pub uid: u64,
    pub tth: TthDigest,
    pub islist: bool,
    /// Fetch TTHL before any file data.
    pub need_tthl: bool,
    pub offset: u64,
    pub size: u64,
}

/// Events surfaced to the embedding layer (UI, logging).
#[derive(Debug)]
pub enum DlEvent {
    Added { tth: TthDigest },
    Removed { tth: TthDigest },
    UserState { uid: u64, state: UserState },
    /// A finished file-list download, ready for browsing or queue matching.
    ListReady {
        uid: u64,
        path: PathBuf,
        open: bool,
        match_queue: bool,
    },
    Message(String),
}

/// Exclusion predicate for [`DlQueueHandle::add_tree`]; applied to descendant
/// names only, never the subtree root.
pub type ExcludeFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub(crate) enum DlCommand {
    AddFile {
        uid: u64,
        tth: TthDigest,
        size: u64,
        name: String,
        reply: oneshot::Sender<bool>,
    },
    AddList {
        uid: u64,
        open_after: bool,
        match_after: bool,
        reply: oneshot::Sender<bool>,
    },
    AddTree {
        uid: u64,
        tree: Box<FileTree>,
        node: NodeId,
        exclude: Option<ExcludeFn>,
        reply: oneshot::Sender<usize>,
    },
    MatchFile {
        uid: u64,
        tth: TthDigest,
        reply: oneshot::Sender<MatchResult>,
    },
    SetPriority {
        tth: TthDigest,
        prio: Priority,
    },
    SetError {
        tth: TthDigest,
        kind: DlErrorKind,
        msg: Option<String>,
    },
    SetUserError {
        uid: u64,
        tth: Option<TthDigest>,
        kind: DlErrorKind,
        msg: Option<String>,
    },
    RemoveUser {
        uid: u64,
        tth: Option<TthDigest>,
    },
    Remove {
        tth: TthDigest,
    },
    UserOnline {
        uid: u64,
    },
    UserCc {
        uid: u64,
        cc: Option<CcHandle>,
    },
    SetTthl {
        uid: u64,
        tth: TthDigest,
        blob: Vec<u8>,
    },
    ListSize {
        uid: u64,
        size: u64,
    },
    RecvData {
        uid: u64,
        data: Vec<u8>,
    },
    TransferDone {
        uid: u64,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
