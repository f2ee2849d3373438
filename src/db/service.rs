//! Worker-thread implementation of the persistence service.
//!
//! The worker owns the only [`rusqlite::Connection`] in the process. Requests
//! arrive on an unbounded queue; writes are grouped into a transaction that is
//! committed after five seconds of write inactivity, when a request carries
//! [`DBF_LAST_IN_BATCH`], or at shutdown. Replies for requests executed inside
//! a transaction are held back until the transaction resolves, so a caller
//! that blocks on its reply queue observes the durable outcome.

use super::errors::DbInitError;
use super::{
    DbHandle, DbReply, DbRequest, DbStatus, Value, DBF_CHAIN_NEXT, DBF_LAST_IN_BATCH, DBF_NOCACHE,
    DBF_SHUTDOWN, DBF_SINGLE,
};
use rusqlite::Connection;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Schema generation understood by this client.
pub const DB_USER_VERSION: i32 = 2;

const TXN_WRITE_IDLE: Duration = Duration::from_secs(5);

const SCHEMA: &str = "\
CREATE TABLE hashdata (
  root TEXT NOT NULL PRIMARY KEY,
  size INTEGER NOT NULL,
  tthl BLOB
);
CREATE TABLE hashfiles (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  filename TEXT NOT NULL UNIQUE,
  tth TEXT NOT NULL,
  lastmod INTEGER NOT NULL
);
CREATE INDEX hashfiles_tth ON hashfiles (tth);
CREATE TABLE dl (
  tth TEXT NOT NULL PRIMARY KEY,
  size INTEGER NOT NULL,
  dest TEXT NOT NULL,
  priority INTEGER NOT NULL DEFAULT 0,
  error INTEGER NOT NULL DEFAULT 0,
  error_msg TEXT,
  tthl BLOB
);
CREATE TABLE dl_users (
  tth TEXT NOT NULL,
  uid INTEGER NOT NULL,
  error INTEGER NOT NULL DEFAULT 0,
  error_msg TEXT,
  PRIMARY KEY (tth, uid)
);
CREATE TABLE share (
  name TEXT NOT NULL PRIMARY KEY,
  path TEXT NOT NULL
);
CREATE TABLE vars (
  name TEXT NOT NULL,
  hub INTEGER NOT NULL DEFAULT 0,
  value TEXT NOT NULL,
  PRIMARY KEY (name, hub)
);
";

#[derive(Debug)]
pub struct DbService {
    handle: DbHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl DbService {
    /// Opens (creating if absent) the store and starts the worker thread.
    pub fn open(path: &Path) -> Result<Self, DbInitError> {
        let conn = Connection::open(path).map_err(|source| DbInitError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(Duration::from_millis(10))
            .map_err(|source| DbInitError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        init_schema(&conn)?;
        conn.set_prepared_statement_cache_capacity(64);

        let (tx, rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("db".to_string())
            .spawn(move || worker(conn, rx))
            .expect("failed to spawn db thread");
        Ok(Self {
            handle: DbHandle::new(tx),
            join: Some(join),
        })
    }

    pub fn handle(&self) -> DbHandle {
        self.handle.clone()
    }

    /// Flushes outstanding work and joins the worker.
    pub fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn init_schema(conn: &Connection) -> Result<(), DbInitError> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|source| DbInitError::Pragma { source })?;
    if version == 0 {
        let existing: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'vars'",
                [],
                |row| row.get(0),
            )
            .map_err(|source| DbInitError::Pragma { source })?;
        if existing > 0 {
            // Tables exist but the version was never stamped: a store from
            // before the version gate, which we cannot migrate here.
            return Err(DbInitError::VersionTooOld {
                found: version,
                expected: DB_USER_VERSION,
            });
        }
        conn.execute_batch(SCHEMA)
            .map_err(|source| DbInitError::Schema { source })?;
        conn.pragma_update(None, "user_version", DB_USER_VERSION)
            .map_err(|source| DbInitError::Schema { source })?;
        tracing::info!(version = DB_USER_VERSION, "created fresh database");
        return Ok(());
    }
    if version < DB_USER_VERSION {
        return Err(DbInitError::VersionTooOld {
            found: version,
            expected: DB_USER_VERSION,
        });
    }
    if version > DB_USER_VERSION {
        return Err(DbInitError::VersionTooNew {
            found: version,
            expected: DB_USER_VERSION,
        });
    }
    Ok(())
}

/// Reply sentinel held back until the enclosing transaction resolves.
struct HeldDone {
    reply: Option<mpsc::Sender<DbReply>>,
    last_insert_id: Option<i64>,
}

fn send_done(reply: &Option<mpsc::Sender<DbReply>>, status: DbStatus, last_insert_id: Option<i64>) {
    if let Some(tx) = reply {
        let _ = tx.send(DbReply::Done {
            status,
            last_insert_id,
        });
    }
}

fn worker(conn: Connection, rx: mpsc::Receiver<DbRequest>) {
    let mut txn_open = false;
    let mut held: Vec<HeldDone> = Vec::new();
    // The previous request had CHAIN_NEXT: the next one must join its
    // transaction regardless of the commit deadline.
    let mut chain_next = false;
    // A chained request failed: answer the rest of the chain without
    // executing it.
    let mut chain_failed = false;
    let mut last_write = Instant::now();

    loop {
        let req = if txn_open && !chain_next {
            let deadline = last_write + TXN_WRITE_IDLE;
            let now = Instant::now();
            if now >= deadline {
                resolve_txn(&conn, &mut txn_open, &mut held, true);
                continue;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(req) => req,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    resolve_txn(&conn, &mut txn_open, &mut held, true);
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(req) => req,
                Err(_) => break,
            }
        };

        if req.flags & DBF_SHUTDOWN != 0 {
            if txn_open {
                resolve_txn(&conn, &mut txn_open, &mut held, true);
            }
            send_done(&req.reply, DbStatus::Ok, None);
            tracing::debug!("db service shut down");
            return;
        }

        if chain_failed {
            send_done(
                &req.reply,
                DbStatus::Error("not executed: earlier query in the transaction failed".into()),
                None,
            );
            chain_failed = req.flags & DBF_CHAIN_NEXT != 0;
            chain_next = false;
            continue;
        }
        chain_next = false;

        if req.flags & DBF_SINGLE != 0 {
            if txn_open {
                resolve_txn(&conn, &mut txn_open, &mut held, true);
            }
            match execute(&conn, &req) {
                Ok(last_id) => send_done(&req.reply, DbStatus::Ok, last_id),
                Err(err) => {
                    tracing::warn!(query = ?req.query, error = %err, "query failed");
                    send_done(&req.reply, DbStatus::Error(err.to_string()), None);
                }
            }
            continue;
        }

        if !txn_open {
            if let Err(err) = conn.execute_batch("BEGIN") {
                tracing::error!(error = %err, "cannot open transaction");
                send_done(&req.reply, DbStatus::Error(err.to_string()), None);
                continue;
            }
            txn_open = true;
            last_write = Instant::now();
        }

        match execute(&conn, &req) {
            Ok(last_id) => {
                held.push(HeldDone {
                    reply: req.reply,
                    last_insert_id: last_id,
                });
                last_write = Instant::now();
                chain_next = req.flags & DBF_CHAIN_NEXT != 0;
                if req.flags & DBF_LAST_IN_BATCH != 0 && !chain_next {
                    resolve_txn(&conn, &mut txn_open, &mut held, true);
                }
            }
            Err(err) => {
                tracing::warn!(query = ?req.query, error = %err, "query failed, rolling back");
                resolve_txn(&conn, &mut txn_open, &mut held, false);
                send_done(&req.reply, DbStatus::Error(err.to_string()), None);
                chain_failed = req.flags & DBF_CHAIN_NEXT != 0;
            }
        }
    }

    // All handles dropped; flush whatever is left.
    if txn_open {
        resolve_txn(&conn, &mut txn_open, &mut held, true);
    }
}

/// Commits (or rolls back) the open transaction and flushes held replies with
/// the outcome.
fn resolve_txn(conn: &Connection, txn_open: &mut bool, held: &mut Vec<HeldDone>, commit: bool) {
    let result = if commit {
        conn.execute_batch("COMMIT")
    } else {
        conn.execute_batch("ROLLBACK")
    };
    let status = match (&result, commit) {
        (Ok(()), true) => DbStatus::Ok,
        (Ok(()), false) => DbStatus::Error("transaction rolled back".into()),
        (Err(err), _) => {
            tracing::error!(error = %err, commit, "transaction resolution failed");
            DbStatus::Error(format!("transaction failed: {err}"))
        }
    };
    for done in held.drain(..) {
        send_done(&done.reply, status.clone(), done.last_insert_id);
    }
    *txn_open = false;
}

fn execute(conn: &Connection, req: &DbRequest) -> Result<Option<i64>, rusqlite::Error> {
    let sql = req.query.sql();
    if req.flags & DBF_NOCACHE != 0 {
        let mut stmt = conn.prepare(sql)?;
        run_statement(conn, &mut stmt, req)
    } else {
        let mut stmt = conn.prepare_cached(sql)?;
        run_statement(conn, &mut stmt, req)
    }
}

fn run_statement(
    conn: &Connection,
    stmt: &mut rusqlite::Statement<'_>,
    req: &DbRequest,
) -> Result<Option<i64>, rusqlite::Error> {
    let column_count = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(req.params.iter()))?;
    while let Some(row) = rows.next()? {
        let Some(reply) = &req.reply else { continue };
        let out = if req.columns.is_empty() {
            (0..column_count)
                .map(|i| read_cell(row, i))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            req.columns
                .iter()
                .map(|&i| read_cell(row, i))
                .collect::<Result<Vec<_>, _>>()?
        };
        let _ = reply.send(DbReply::Row(out));
    }
    Ok(req
        .want_last_insert_id
        .then(|| conn.last_insert_rowid()))
}

fn read_cell(row: &rusqlite::Row<'_>, idx: usize) -> Result<Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int64(v),
        ValueRef::Real(v) => Value::Text(v.to_string()),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}
