//! Persistence service: the only component that touches the SQLite store.
//!
//! All other components submit [`DbRequest`] values through a process-wide
//! work queue owned by a dedicated worker thread, and read results back from
//! per-request reply queues. Submission never blocks; two requests submitted
//! by the same thread execute in submission order.

pub mod errors;
pub mod service;

pub use errors::{DbError, DbInitError};
pub use service::DbService;

use std::sync::mpsc;

/// This query and the next one must share a transaction.
pub const DBF_CHAIN_NEXT: u8 = 1 << 0;
/// Flush (commit) the open transaction right after this query.
pub const DBF_LAST_IN_BATCH: u8 = 1 << 1;
/// Execute outside any transaction; an open transaction is committed first.
pub const DBF_SINGLE: u8 = 1 << 2;
/// Do not prepare-and-cache the statement.
pub const DBF_NOCACHE: u8 = 1 << 3;
/// Terminate the service after committing outstanding work.
pub const DBF_SHUTDOWN: u8 = 1 << 4;

/// A positional SQL parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Int64(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Int(v) => ToSqlOutput::Owned((*v as i64).into()),
            Value::Int64(v) => ToSqlOutput::Owned((*v).into()),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Statement templates. The prepared-statement cache is keyed by the template
/// itself, so every query the engine runs is listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    VarGet,
    VarSet,
    VarDel,
    VarListAll,
    HashDataSet,
    HashDataGet,
    HashFileSet,
    HashFileDel,
    HashFileListAll,
    DlAdd,
    DlSetStatus,
    DlSetTthl,
    DlGetTthl,
    DlDel,
    DlListAll,
    DlUserAdd,
    DlUserSetError,
    DlUserSetErrorAll,
    DlUserDel,
    DlUserDelByTth,
    DlUserDelByUid,
    DlUserListAll,
    ShareAdd,
    ShareDel,
    ShareListAll,
}

impl Query {
    pub fn sql(self) -> &'static str {
        match self {
            Query::VarGet => "SELECT value FROM vars WHERE name = ? AND hub = ?",
            Query::VarSet => "INSERT OR REPLACE INTO vars (name, hub, value) VALUES (?, ?, ?)",
            Query::VarDel => "DELETE FROM vars WHERE name = ? AND hub = ?",
            Query::VarListAll => "SELECT name, hub, value FROM vars",
            Query::HashDataSet => {
                "INSERT OR REPLACE INTO hashdata (root, size, tthl) VALUES (?, ?, ?)"
            }
            Query::HashDataGet => "SELECT size, tthl FROM hashdata WHERE root = ?",
            Query::HashFileSet => {
                "INSERT OR REPLACE INTO hashfiles (filename, tth, lastmod) VALUES (?, ?, ?)"
            }
            Query::HashFileDel => "DELETE FROM hashfiles WHERE filename = ?",
            Query::HashFileListAll => "SELECT id, filename, tth, lastmod FROM hashfiles",
            Query::DlAdd => {
                "INSERT INTO dl (tth, size, dest, priority, error, error_msg, tthl) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)"
            }
            Query::DlSetStatus => {
                "UPDATE dl SET priority = ?, error = ?, error_msg = ? WHERE tth = ?"
            }
            Query::DlSetTthl => "UPDATE dl SET tthl = ? WHERE tth = ?",
            Query::DlGetTthl => "SELECT tthl FROM dl WHERE tth = ?",
            Query::DlDel => "DELETE FROM dl WHERE tth = ?",
            Query::DlListAll => {
                "SELECT tth, size, dest, priority, error, error_msg, length(tthl) FROM dl"
            }
            Query::DlUserAdd => {
                "INSERT OR REPLACE INTO dl_users (tth, uid, error, error_msg) VALUES (?, ?, ?, ?)"
            }
            Query::DlUserSetError => {
                "UPDATE dl_users SET error = ?, error_msg = ? WHERE tth = ? AND uid = ?"
            }
            Query::DlUserSetErrorAll => {
                "UPDATE dl_users SET error = ?, error_msg = ? WHERE uid = ?"
            }
            Query::DlUserDel => "DELETE FROM dl_users WHERE tth = ? AND uid = ?",
            Query::DlUserDelByTth => "DELETE FROM dl_users WHERE tth = ?",
            Query::DlUserDelByUid => "DELETE FROM dl_users WHERE uid = ?",
            Query::DlUserListAll => "SELECT tth, uid, error, error_msg FROM dl_users",
            Query::ShareAdd => "INSERT OR REPLACE INTO share (name, path) VALUES (?, ?)",
            Query::ShareDel => "DELETE FROM share WHERE name = ?",
            Query::ShareListAll => "SELECT name, path FROM share",
        }
    }
}

/// Overall status delivered in the final reply message of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum DbStatus {
    Ok,
    Error(String),
}

/// Reply-queue messages: one `Row` per result row, then exactly one `Done`.
/// For requests executed inside a batched transaction, `Done` is delivered
/// when the transaction resolves, carrying its outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum DbReply {
    Row(Vec<Value>),
    Done {
        status: DbStatus,
        last_insert_id: Option<i64>,
    },
}

#[derive(Debug)]
pub struct DbRequest {
    pub flags: u8,
    pub query: Query,
    pub params: Vec<Value>,
    /// Indices of the result columns to deliver; empty selects all.
    pub columns: Vec<usize>,
    /// Deliver the auto-generated row id of the last insert with `Done`.
    pub want_last_insert_id: bool,
    pub reply: Option<mpsc::Sender<DbReply>>,
}

impl DbRequest {
    pub fn new(query: Query, params: Vec<Value>) -> Self {
        Self {
            flags: 0,
            query,
            params,
            columns: Vec::new(),
            want_last_insert_id: false,
            reply: None,
        }
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn reply_to(mut self, tx: mpsc::Sender<DbReply>) -> Self {
        self.reply = Some(tx);
        self
    }
}

/// Cloneable submission handle. Dropping all handles shuts the service down
/// once the queue drains.
#[derive(Debug, Clone)]
pub struct DbHandle {
    tx: mpsc::Sender<DbRequest>,
}

impl DbHandle {
    pub(crate) fn new(tx: mpsc::Sender<DbRequest>) -> Self {
        Self { tx }
    }

    /// Non-blocking submission.
    pub fn submit(&self, req: DbRequest) -> Result<(), DbError> {
        self.tx.send(req).map_err(|_| DbError::Closed)
    }

    /// Fire-and-forget write.
    pub fn exec(&self, query: Query, params: Vec<Value>) -> Result<(), DbError> {
        self.submit(DbRequest::new(query, params))
    }

    /// Write and block until the enclosing transaction resolves. Callers on
    /// the async runtime should wrap this in `spawn_blocking`.
    pub fn exec_wait(&self, query: Query, params: Vec<Value>, flags: u8) -> Result<Option<i64>, DbError> {
        let (tx, rx) = mpsc::channel();
        self.submit(
            DbRequest {
                want_last_insert_id: true,
                ..DbRequest::new(query, params)
            }
            .flags(flags | DBF_LAST_IN_BATCH)
            .reply_to(tx),
        )?;
        loop {
            match rx.recv().map_err(|_| DbError::Closed)? {
                DbReply::Row(_) => continue,
                DbReply::Done {
                    status: DbStatus::Ok,
                    last_insert_id,
                } => return Ok(last_insert_id),
                DbReply::Done {
                    status: DbStatus::Error(msg),
                    ..
                } => return Err(DbError::Query(msg)),
            }
        }
    }

    /// Read outside any transaction, collecting all rows.
    pub fn query_rows(&self, query: Query, params: Vec<Value>) -> Result<Vec<Vec<Value>>, DbError> {
        let (tx, rx) = mpsc::channel();
        self.submit(DbRequest::new(query, params).flags(DBF_SINGLE).reply_to(tx))?;
        let mut rows = Vec::new();
        loop {
            match rx.recv().map_err(|_| DbError::Closed)? {
                DbReply::Row(row) => rows.push(row),
                DbReply::Done {
                    status: DbStatus::Ok,
                    ..
                } => return Ok(rows),
                DbReply::Done {
                    status: DbStatus::Error(msg),
                    ..
                } => return Err(DbError::Query(msg)),
            }
        }
    }

    /// Asks the worker to commit outstanding work and exit, waiting for the
    /// acknowledgement.
    pub fn shutdown(&self) {
        let (tx, rx) = mpsc::channel();
        let req = DbRequest {
            flags: DBF_SHUTDOWN,
            query: Query::VarGet, // unused
            params: Vec::new(),
            columns: Vec::new(),
            want_last_insert_id: false,
            reply: Some(tx),
        };
        if self.tx.send(req).is_ok() {
            let _ = rx.recv();
        }
    }
}
