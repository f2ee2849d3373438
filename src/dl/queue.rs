//! The download queue actor.
//!
//! One task owns every record and per-user sub-queue; commands arrive on a
//! channel and all observable transitions are emitted in causal order. A
//! 500 ms debounce coalesces selection passes; a coarse one-second tick
//! drives the reconnect and expect timers.

use super::recv::{self, ReceiveContext, RecvOutcome};
use super::{
    DlAssignment, DlCommand, DlErrorKind, DlEvent, ExcludeFn, MatchResult, Priority, UserState,
    EVAL_DEBOUNCE, EXPECT_TIMEOUT, MIN_BLOCK_SIZE, MIN_TTHL_SIZE, RECONNECT_DELAY,
};
use crate::cc::CcHandle;
use crate::db::{DbHandle, Query, Value, DBF_CHAIN_NEXT};
use crate::fl::{FileTree, NodeId};
use crate::hub::HubRegistry;
use crate::tth::{self, TthDigest};
use crate::vars::Vars;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
struct DlRecord {
    tth: TthDigest,
    islist: bool,
    hastthl: bool,
    prio: Priority,
    error: DlErrorKind,
    error_msg: Option<String>,
    size: u64,
    have: u64,
    dest: PathBuf,
    inc: PathBuf,
    hash_block: u64,
    /// Shrunk TTHL leaves; `None` for sub-threshold files and lists.
    leaves: Option<Vec<TthDigest>>,
    users: Vec<u64>,
    active_uid: Option<u64>,
    open_after: bool,
    match_after: bool,
}

impl DlRecord {
    fn enabled(&self) -> bool {
        self.prio.enabled() && self.error == DlErrorKind::None
    }
}

#[derive(Debug)]
struct UserEntry {
    tth: TthDigest,
    error: DlErrorKind,
    error_msg: Option<String>,
}

#[derive(Debug)]
struct DlUser {
    uid: u64,
    state: UserState,
    cc: Option<CcHandle>,
    queue: Vec<UserEntry>,
    active: Option<TthDigest>,
    wait_until: Option<Instant>,
}

/// Stable total order of a user's queue entries: enabled before disabled,
/// lists before files, higher priority first, destination path and hash as
/// tiebreakers. Never ties for distinct records.
fn entry_cmp(a: (&UserEntry, &DlRecord), b: (&UserEntry, &DlRecord)) -> Ordering {
    let enabled = |e: &UserEntry, r: &DlRecord| r.enabled() && e.error == DlErrorKind::None;
    enabled(b.0, b.1)
        .cmp(&enabled(a.0, a.1))
        .then_with(|| b.1.islist.cmp(&a.1.islist))
        .then_with(|| b.1.prio.cmp(&a.1.prio))
        .then_with(|| a.1.dest.cmp(&b.1.dest))
        .then_with(|| a.1.tth.cmp(&b.1.tth))
}

/// Read-only view for the UI and tests.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub records: Vec<RecordInfo>,
    pub users: Vec<UserInfo>,
}

#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub tth: TthDigest,
    pub islist: bool,
    pub hastthl: bool,
    pub prio: Priority,
    pub error: DlErrorKind,
    pub error_msg: Option<String>,
    pub size: u64,
    pub have: u64,
    pub dest: PathBuf,
    pub hash_block: u64,
    pub users: Vec<u64>,
    pub active_uid: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UserInfo {
    pub uid: u64,
    pub state: UserState,
    /// Entry hashes in queue order, paired with the per-user error.
    pub queue: Vec<(TthDigest, DlErrorKind)>,
    pub active: Option<TthDigest>,
}

#[derive(Debug, Clone)]
pub struct DlQueueHandle {
    tx: mpsc::UnboundedSender<DlCommand>,
}

impl DlQueueHandle {
    /// Enqueues a regular file for `uid`. Returns false when the hash is
    /// already queued.
    pub async fn add_file(&self, uid: u64, tth: TthDigest, size: u64, name: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DlCommand::AddFile {
            uid,
            tth,
            size,
            name: name.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Enqueues a user's file list.
    pub async fn add_list(&self, uid: u64, open_after: bool, match_after: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DlCommand::AddList {
            uid,
            open_after,
            match_after,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Walks a remote file-list subtree and enqueues every file. The
    /// exclusion predicate applies to descendants only. Returns the number
    /// of files enqueued.
    pub async fn add_tree(
        &self,
        uid: u64,
        tree: FileTree,
        node: NodeId,
        exclude: Option<ExcludeFn>,
    ) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DlCommand::AddTree {
            uid,
            tree: Box::new(tree),
            node,
            exclude,
            reply,
        });
        rx.await.unwrap_or(0)
    }

    /// Associates an already-known download with a new source.
    pub async fn match_file(&self, uid: u64, tth: TthDigest) -> MatchResult {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DlCommand::MatchFile { uid, tth, reply });
        rx.await.unwrap_or(MatchResult::NotInQueue)
    }

    pub fn set_priority(&self, tth: TthDigest, prio: Priority) {
        let _ = self.tx.send(DlCommand::SetPriority { tth, prio });
    }

    pub fn set_error(&self, tth: TthDigest, kind: DlErrorKind, msg: Option<String>) {
        let _ = self.tx.send(DlCommand::SetError { tth, kind, msg });
    }

    /// A null `tth` applies to all of the user's entries.
    pub fn set_user_error(
        &self,
        uid: u64,
        tth: Option<TthDigest>,
        kind: DlErrorKind,
        msg: Option<String>,
    ) {
        let _ = self.tx.send(DlCommand::SetUserError {
            uid,
            tth,
            kind,
            msg,
        });
    }

    pub fn remove_user(&self, uid: u64, tth: Option<TthDigest>) {
        let _ = self.tx.send(DlCommand::RemoveUser { uid, tth });
    }

    pub fn remove(&self, tth: TthDigest) {
        let _ = self.tx.send(DlCommand::Remove { tth });
    }

    /// Hub-layer notification: the user appeared on a hub.
    pub fn user_online(&self, uid: u64) {
        let _ = self.tx.send(DlCommand::UserOnline { uid });
    }

    /// Peer-session report: handshake complete (`Some`) or gone (`None`).
    pub fn user_cc(&self, uid: u64, cc: Option<CcHandle>) {
        let _ = self.tx.send(DlCommand::UserCc { uid, cc });
    }

    pub fn set_tthl(&self, uid: u64, tth: TthDigest, blob: Vec<u8>) {
        let _ = self.tx.send(DlCommand::SetTthl { uid, tth, blob });
    }

    /// Size of a list transfer, learned from the peer's answer.
    pub fn list_size(&self, uid: u64, size: u64) {
        let _ = self.tx.send(DlCommand::ListSize { uid, size });
    }

    pub fn recv_data(&self, uid: u64, data: Vec<u8>) {
        let _ = self.tx.send(DlCommand::RecvData { uid, data });
    }

    pub fn transfer_done(&self, uid: u64) {
        let _ = self.tx.send(DlCommand::TransferDone { uid });
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DlCommand::Snapshot { reply });
        rx.await.unwrap_or(QueueSnapshot {
            records: Vec::new(),
            users: Vec::new(),
        })
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(DlCommand::Shutdown { reply });
        let _ = rx.await;
    }
}

struct QueueState {
    db: DbHandle,
    vars: Arc<Vars>,
    hubs: Arc<HubRegistry>,
    events: mpsc::UnboundedSender<DlEvent>,
    inc_dir: PathBuf,
    fl_dir: PathBuf,
    records: HashMap<TthDigest, DlRecord>,
    users: HashMap<u64, DlUser>,
    /// Open receive contexts, keyed by the transferring user.
    recv: HashMap<u64, ReceiveContext>,
    eval_at: Option<Instant>,
}

/// Builds the queue: loads persisted records, verifies partial incoming
/// files, sweeps stale spool entries and starts the actor.
pub async fn start_queue(
    db: DbHandle,
    vars: Arc<Vars>,
    hubs: Arc<HubRegistry>,
    data_dir: &Path,
) -> (
    DlQueueHandle,
    mpsc::UnboundedReceiver<DlEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let mut state = QueueState {
        db,
        vars,
        hubs,
        events: ev_tx,
        inc_dir: data_dir.join("inc"),
        fl_dir: data_dir.join("fl"),
        records: HashMap::new(),
        users: HashMap::new(),
        recv: HashMap::new(),
        eval_at: None,
    };
    let join = tokio::spawn(async move {
        if let Err(err) = state.load().await {
            tracing::error!(error = %err, "failed to load the download queue");
        }
        state.clean_spool().await;
        state.run(rx).await;
    });
    (DlQueueHandle { tx }, ev_rx, join)
}

impl QueueState {
    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<DlCommand>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let eval_sleep = self.eval_at.map(tokio::time::Instant::from_std);
            tokio::select! {
                _ = async { tokio::time::sleep_until(eval_sleep.expect("checked")).await },
                    if eval_sleep.is_some() => {
                    self.eval_at = None;
                    self.evaluate().await;
                }
                _ = tick.tick() => self.check_timers(),
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    if self.dispatch(cmd).await {
                        return;
                    }
                }
            }
        }
    }

    /// Handles one command; returns true on shutdown.
    async fn dispatch(&mut self, cmd: DlCommand) -> bool {
        match cmd {
            DlCommand::AddFile {
                uid,
                tth,
                size,
                name,
                reply,
            } => {
                let added = self.add_file(uid, tth, size, &name).await;
                let _ = reply.send(added);
            }
            DlCommand::AddList {
                uid,
                open_after,
                match_after,
                reply,
            } => {
                let _ = reply.send(self.add_list(uid, open_after, match_after));
            }
            DlCommand::AddTree {
                uid,
                tree,
                node,
                exclude,
                reply,
            } => {
                let count = self.add_tree(uid, &tree, node, exclude.as_deref()).await;
                let _ = reply.send(count);
            }
            DlCommand::MatchFile { uid, tth, reply } => {
                let _ = reply.send(self.match_file(uid, tth));
            }
            DlCommand::SetPriority { tth, prio } => self.set_priority(tth, prio),
            DlCommand::SetError { tth, kind, msg } => self.set_global_error(tth, kind, msg),
            DlCommand::SetUserError {
                uid,
                tth,
                kind,
                msg,
            } => self.set_user_error(uid, tth, kind, msg),
            DlCommand::RemoveUser { uid, tth } => self.remove_user(uid, tth),
            DlCommand::Remove { tth } => self.remove_record(tth).await,
            DlCommand::UserOnline { uid } => {
                if self.users.contains_key(&uid) {
                    self.schedule_eval();
                }
            }
            DlCommand::UserCc { uid, cc } => self.user_cc(uid, cc).await,
            DlCommand::SetTthl { uid, tth, blob } => self.set_tthl(uid, tth, blob),
            DlCommand::ListSize { uid, size } => self.list_size(uid, size),
            DlCommand::RecvData { uid, data } => self.recv_data(uid, &data).await,
            DlCommand::TransferDone { uid } => self.transfer_done(uid).await,
            DlCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            DlCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn emit(&self, event: DlEvent) {
        let _ = self.events.send(event);
    }

    fn schedule_eval(&mut self) {
        if self.eval_at.is_none() {
            self.eval_at = Some(Instant::now() + EVAL_DEBOUNCE);
        }
    }

    fn set_user_state(&mut self, uid: u64, state: UserState) {
        if let Some(user) = self.users.get_mut(&uid) {
            if user.state != state {
                user.state = state;
                user.wait_until = match state {
                    UserState::WaitingReconnect => Some(Instant::now() + RECONNECT_DELAY),
                    UserState::Expecting => Some(Instant::now() + EXPECT_TIMEOUT),
                    _ => None,
                };
                self.emit(DlEvent::UserState { uid, state });
            }
        }
    }

    fn check_timers(&mut self) {
        let now = Instant::now();
        let expired: Vec<(u64, UserState)> = self
            .users
            .values()
            .filter(|u| u.wait_until.is_some_and(|t| t <= now))
            .map(|u| (u.uid, u.state))
            .collect();
        for (uid, state) in expired {
            match state {
                UserState::WaitingReconnect => {
                    tracing::debug!(uid = format_args!("{uid:016x}"), "reconnect timer expired");
                    self.set_user_state(uid, UserState::NotConnected);
                    self.schedule_eval();
                }
                UserState::Expecting => {
                    tracing::debug!(uid = format_args!("{uid:016x}"), "expected connection timed out");
                    self.set_user_state(uid, UserState::WaitingReconnect);
                }
                _ => {
                    if let Some(user) = self.users.get_mut(&uid) {
                        user.wait_until = None;
                    }
                }
            }
        }
    }

    fn active_count(&self) -> u32 {
        self.users
            .values()
            .filter(|u| u.state == UserState::Active)
            .count() as u32
    }

    fn sort_user_queue(&mut self, uid: u64) {
        let Some(mut entries) = self
            .users
            .get_mut(&uid)
            .map(|u| std::mem::take(&mut u.queue))
        else {
            return;
        };
        entries.sort_by(
            |a, b| match (self.records.get(&a.tth), self.records.get(&b.tth)) {
                (Some(ra), Some(rb)) => entry_cmp((a, ra), (b, rb)),
                _ => Ordering::Equal,
            },
        );
        if let Some(user) = self.users.get_mut(&uid) {
            user.queue = entries;
        }
    }

    /// First enabled entry whose record is not already being transferred by
    /// another user. Inspects at most a slot's worth of entries.
    fn best_entry(&self, user: &DlUser) -> Option<TthDigest> {
        for entry in &user.queue {
            let Some(rec) = self.records.get(&entry.tth) else {
                continue;
            };
            if !rec.enabled() || entry.error != DlErrorKind::None {
                // The queue is sorted enabled-first; nothing further down
                // can be eligible.
                return None;
            }
            if rec.active_uid.is_some() {
                continue;
            }
            return Some(entry.tth);
        }
        None
    }

    /// The slot scheduler: picks the best candidate user, initiates, and
    /// repeats until slots or candidates run out.
    async fn evaluate(&mut self) {
        let slots = self.vars.download_slots();
        let mut free = slots.saturating_sub(self.active_count());
        tracing::debug!(slots, free, "queue evaluation");
        while free > 0 {
            let mut best: Option<(u64, UserState, TthDigest)> = None;
            for user in self.users.values() {
                let eligible = match user.state {
                    UserState::Idle => true,
                    UserState::NotConnected => self.hubs.is_online(user.uid),
                    _ => false,
                };
                if !eligible {
                    continue;
                }
                let Some(tth) = self.best_entry(user) else {
                    continue;
                };
                let better = match &best {
                    None => true,
                    Some((_, best_state, best_tth)) => {
                        // Prefer an open idle connection over dialing out.
                        let state_rank = |s: UserState| s == UserState::Idle;
                        match state_rank(user.state).cmp(&state_rank(*best_state)) {
                            Ordering::Greater => true,
                            Ordering::Less => false,
                            Ordering::Equal => {
                                let cand = self.records.get(&tth).expect("record");
                                let cur = self.records.get(best_tth).expect("record");
                                let dummy = UserEntry {
                                    tth,
                                    error: DlErrorKind::None,
                                    error_msg: None,
                                };
                                let dummy2 = UserEntry {
                                    tth: *best_tth,
                                    error: DlErrorKind::None,
                                    error_msg: None,
                                };
                                entry_cmp((&dummy, cand), (&dummy2, cur)) == Ordering::Less
                            }
                        }
                    }
                };
                if better {
                    best = Some((user.uid, user.state, tth));
                }
            }
            let Some((uid, state, tth)) = best else { break };
            match state {
                UserState::NotConnected => {
                    tracing::debug!(uid = format_args!("{uid:016x}"), "requesting peer session");
                    self.hubs.request_connect(uid);
                    self.set_user_state(uid, UserState::Expecting);
                    // The slot is not consumed until the transfer starts.
                }
                UserState::Idle => {
                    self.start_transfer(uid, tth).await;
                    free = free.saturating_sub(1);
                }
                _ => unreachable!(),
            }
        }
    }

    async fn start_transfer(&mut self, uid: u64, tth: TthDigest) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        // Lists are never resumed: the remote may have changed its list
        // between attempts, so any partial data is thrown away.
        if rec.islist && rec.have > 0 {
            rec.have = 0;
            rec.size = 0;
            let _ = tokio::fs::remove_file(&rec.inc).await;
        }
        rec.active_uid = Some(uid);
        let assignment = DlAssignment {
            uid,
            tth,
            islist: rec.islist,
            need_tthl: !rec.islist && !rec.hastthl,
            offset: rec.have,
            size: rec.size,
        };
        let Some(user) = self.users.get_mut(&uid) else {
            return;
        };
        user.active = Some(tth);
        let cc = user.cc.clone();
        self.set_user_state(uid, UserState::Active);
        match cc {
            Some(cc) => cc.download(assignment),
            None => {
                tracing::warn!(uid = format_args!("{uid:016x}"), "idle user without a session");
                self.abort_transfer(uid, UserState::NotConnected).await;
            }
        }
    }

    /// Clears the active transfer of `uid` (if any), restores the at-rest
    /// block alignment of the record, and moves the user to `next`.
    async fn abort_transfer(&mut self, uid: u64, next: UserState) {
        let active = self.users.get(&uid).and_then(|u| u.active);
        if let Some(mut ctx) = self.recv.remove(&uid) {
            match ctx.abort_to_boundary().await {
                Ok(have) => {
                    if let Some(tth) = active {
                        if let Some(rec) = self.records.get_mut(&tth) {
                            rec.have = have;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to realign incoming file");
                }
            }
        }
        if let Some(tth) = active {
            if let Some(rec) = self.records.get_mut(&tth) {
                if rec.active_uid == Some(uid) {
                    rec.active_uid = None;
                }
            }
        }
        if let Some(user) = self.users.get_mut(&uid) {
            user.active = None;
        }
        self.set_user_state(uid, next);
        self.schedule_eval();
    }

    async fn user_cc(&mut self, uid: u64, cc: Option<CcHandle>) {
        let Some(user) = self.users.get_mut(&uid) else {
            // Not a queued user; nothing to manage.
            return;
        };
        tracing::debug!(uid = format_args!("{uid:016x}"), connected = cc.is_some(), "session change");
        match cc {
            Some(handle) => {
                user.cc = Some(handle);
                match user.state {
                    UserState::Active => {}
                    _ => self.set_user_state(uid, UserState::Idle),
                }
                self.schedule_eval();
            }
            None => {
                user.cc = None;
                match user.state {
                    UserState::Active => self.abort_transfer(uid, UserState::WaitingReconnect).await,
                    UserState::Expecting => self.set_user_state(uid, UserState::WaitingReconnect),
                    UserState::Idle => {
                        self.set_user_state(uid, UserState::NotConnected);
                        self.schedule_eval();
                    }
                    _ => {}
                }
                self.drop_user_if_empty(uid);
            }
        }
    }

    fn drop_user_if_empty(&mut self, uid: u64) {
        if let Some(user) = self.users.get(&uid) {
            if user.queue.is_empty() && user.cc.is_none() {
                self.users.remove(&uid);
            }
        }
    }

    // -- enqueueing ----------------------------------------------------

    fn dest_in_use(&self, dest: &Path) -> bool {
        self.records.values().any(|r| r.dest == dest) || dest.exists()
    }

    /// Picks a destination that collides with neither the queue nor the
    /// file system, appending `.N` as needed.
    fn unique_dest(&self, base: PathBuf) -> PathBuf {
        if !self.dest_in_use(&base) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let mut cand = base.as_os_str().to_os_string();
            cand.push(format!(".{n}"));
            let cand = PathBuf::from(cand);
            if !self.dest_in_use(&cand) {
                return cand;
            }
            n += 1;
        }
    }

    fn attach_user(&mut self, uid: u64, tth: TthDigest, error: DlErrorKind) {
        let user = self.users.entry(uid).or_insert_with(|| DlUser {
            uid,
            state: UserState::NotConnected,
            cc: None,
            queue: Vec::new(),
            active: None,
            wait_until: None,
        });
        user.queue.push(UserEntry {
            tth,
            error,
            error_msg: None,
        });
        if let Some(rec) = self.records.get_mut(&tth) {
            if !rec.users.contains(&uid) {
                rec.users.push(uid);
            }
        }
        self.sort_user_queue(uid);
    }

    async fn add_file(&mut self, uid: u64, tth: TthDigest, size: u64, name: &str) -> bool {
        if self.records.contains_key(&tth) {
            tracing::debug!(name, "already queued");
            return false;
        }
        let dest = self.unique_dest(self.vars.download_dir().join(name));

        // A zero-byte file has nothing to transfer; complete it on the spot.
        if size == 0 {
            if let Err(err) = create_empty_dest(&dest).await {
                self.emit(DlEvent::Message(format!(
                    "Download of `{}' failed: {}",
                    dest.display(),
                    DlErrorKind::IoDestination.describe(Some(&err.to_string()))
                )));
                return false;
            }
            self.emit(DlEvent::Message(format!(
                "Finished downloading `{}'",
                dest.display()
            )));
            return true;
        }

        let (hastthl, hash_block) = if size < MIN_TTHL_SIZE {
            (true, MIN_TTHL_SIZE)
        } else {
            (false, 0)
        };
        let rec = DlRecord {
            tth,
            islist: false,
            hastthl,
            prio: Priority::Med,
            error: DlErrorKind::None,
            error_msg: None,
            size,
            have: 0,
            dest: dest.clone(),
            inc: self.inc_dir.join(tth::base32_encode(&tth)),
            hash_block,
            leaves: None,
            users: Vec::new(),
            active_uid: None,
            open_after: false,
            match_after: false,
        };
        self.records.insert(tth, rec);
        self.attach_user(uid, tth, DlErrorKind::None);

        // Persist the record and its first source atomically.
        let tth_s = tth::base32_encode(&tth);
        let _ = self.db.submit(
            crate::db::DbRequest::new(
                Query::DlAdd,
                vec![
                    Value::Text(tth_s.clone()),
                    Value::Int64(size as i64),
                    Value::Text(dest.display().to_string()),
                    Value::Int64(Priority::Med.code()),
                    Value::Int64(0),
                    Value::Null,
                    Value::Null,
                ],
            )
            .flags(DBF_CHAIN_NEXT),
        );
        let _ = self.db.exec(
            Query::DlUserAdd,
            vec![
                Value::Text(tth_s),
                Value::Int64(uid as i64),
                Value::Int64(0),
                Value::Null,
            ],
        );
        tracing::debug!(uid = format_args!("{uid:016x}"), name, size, "queued file");
        self.emit(DlEvent::Added { tth });
        self.schedule_eval();
        true
    }

    fn add_list(&mut self, uid: u64, open_after: bool, match_after: bool) -> bool {
        let tth = tth::tiger(&uid.to_le_bytes());
        if self.records.contains_key(&tth) {
            tracing::debug!(uid = format_args!("{uid:016x}"), "file list already queued");
            return false;
        }
        let dest = self.fl_dir.join(format!("{uid:016x}.xml.bz2"));
        let rec = DlRecord {
            tth,
            islist: true,
            hastthl: false,
            prio: Priority::Med,
            error: DlErrorKind::None,
            error_msg: None,
            size: 0,
            have: 0,
            dest,
            inc: self.inc_dir.join(tth::base32_encode(&tth)),
            hash_block: 0,
            leaves: None,
            users: Vec::new(),
            active_uid: None,
            open_after,
            match_after,
        };
        self.records.insert(tth, rec);
        self.attach_user(uid, tth, DlErrorKind::None);
        // File lists are transient; they are not persisted.
        tracing::debug!(uid = format_args!("{uid:016x}"), "queued files.xml.bz2");
        self.emit(DlEvent::Added { tth });
        self.schedule_eval();
        true
    }

    async fn add_tree(
        &mut self,
        uid: u64,
        tree: &FileTree,
        node: NodeId,
        exclude: Option<&(dyn Fn(&str) -> bool + Send + Sync)>,
    ) -> usize {
        let mut added = 0;
        let mut stack: Vec<(NodeId, String, bool)> = vec![(node, String::new(), true)];
        while let Some((id, base, is_root)) = stack.pop() {
            let n = tree.node(id);
            // The exclusion predicate never applies to the subtree root.
            if !is_root && exclude.is_some_and(|f| f(n.name())) {
                continue;
            }
            let rel = if base.is_empty() {
                n.name().to_string()
            } else {
                format!("{base}/{}", n.name())
            };
            if n.is_file() {
                let Some(&digest) = n.tth() else { continue };
                if self.add_file(uid, digest, n.size(), &rel).await {
                    added += 1;
                }
            } else {
                for &c in n.children() {
                    stack.push((c, rel.clone(), false));
                }
            }
        }
        added
    }

    fn match_file(&mut self, uid: u64, tth: TthDigest) -> MatchResult {
        let Some(rec) = self.records.get(&tth) else {
            return MatchResult::NotInQueue;
        };
        if rec.users.contains(&uid) {
            return MatchResult::AlreadyAssociated;
        }
        self.attach_user(uid, tth, DlErrorKind::None);
        let _ = self.db.exec(
            Query::DlUserAdd,
            vec![
                Value::Text(tth::base32_encode(&tth)),
                Value::Int64(uid as i64),
                Value::Int64(0),
                Value::Null,
            ],
        );
        self.schedule_eval();
        MatchResult::Associated
    }

    // -- disposition ---------------------------------------------------

    fn persist_status(&self, rec: &DlRecord) {
        if rec.islist {
            return;
        }
        let _ = self.db.exec(
            Query::DlSetStatus,
            vec![
                Value::Int64(rec.prio.code()),
                Value::Int64(rec.error.code()),
                rec.error_msg
                    .as_ref()
                    .map(|m| Value::Text(m.clone()))
                    .unwrap_or(Value::Null),
                Value::Text(tth::base32_encode(&rec.tth)),
            ],
        );
    }

    fn resort_all_with(&mut self, tth: TthDigest) {
        let uids: Vec<u64> = self
            .records
            .get(&tth)
            .map(|r| r.users.clone())
            .unwrap_or_default();
        for uid in uids {
            self.sort_user_queue(uid);
        }
    }

    fn set_priority(&mut self, tth: TthDigest, prio: Priority) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        let was_enabled = rec.enabled();
        rec.prio = prio;
        if prio != Priority::Error && rec.error != DlErrorKind::None {
            // Re-enabling clears the sticky error.
            rec.error = DlErrorKind::None;
            rec.error_msg = None;
        }
        let now_enabled = rec.enabled();
        self.persist_status(self.records.get(&tth).expect("record"));
        self.resort_all_with(tth);
        if !was_enabled && now_enabled {
            self.schedule_eval();
        }
    }

    /// A global error is sticky: it disables the record until the user
    /// clears it by setting a priority.
    fn set_global_error(&mut self, tth: TthDigest, kind: DlErrorKind, msg: Option<String>) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        rec.error = kind;
        rec.error_msg = msg.clone();
        rec.prio = Priority::Error;
        let dest = rec.dest.clone();
        let active = rec.active_uid;
        self.persist_status(self.records.get(&tth).expect("record"));
        self.resort_all_with(tth);
        self.emit(DlEvent::Message(format!(
            "Download of `{}' failed: {}",
            dest.display(),
            kind.describe(msg.as_deref())
        )));
        if let Some(uid) = active {
            if let Some(cc) = self.users.get(&uid).and_then(|u| u.cc.clone()) {
                cc.disconnect(true);
            }
        }
    }

    fn set_user_error(
        &mut self,
        uid: u64,
        tth: Option<TthDigest>,
        kind: DlErrorKind,
        msg: Option<String>,
    ) {
        let Some(user) = self.users.get_mut(&uid) else {
            return;
        };
        let mut touched = Vec::new();
        for entry in &mut user.queue {
            if tth.is_none() || tth == Some(entry.tth) {
                entry.error = kind;
                entry.error_msg = msg.clone();
                touched.push(entry.tth);
            }
        }
        self.sort_user_queue(uid);
        for t in touched {
            let is_list = self.records.get(&t).map(|r| r.islist).unwrap_or(true);
            if is_list {
                continue;
            }
            match tth {
                Some(_) => {
                    let _ = self.db.exec(
                        Query::DlUserSetError,
                        vec![
                            Value::Int64(kind.code()),
                            msg.as_ref().map(|m| Value::Text(m.clone())).unwrap_or(Value::Null),
                            Value::Text(tth::base32_encode(&t)),
                            Value::Int64(uid as i64),
                        ],
                    );
                }
                None => {}
            }
        }
        if tth.is_none() {
            let _ = self.db.exec(
                Query::DlUserSetErrorAll,
                vec![
                    Value::Int64(kind.code()),
                    msg.map(Value::Text).unwrap_or(Value::Null),
                    Value::Int64(uid as i64),
                ],
            );
        }
        self.schedule_eval();
    }

    fn remove_user(&mut self, uid: u64, tth: Option<TthDigest>) {
        let Some(user) = self.users.get(&uid) else {
            return;
        };
        // Never drop the entry under a live transfer.
        if let Some(active) = user.active {
            if tth.is_none() || tth == Some(active) {
                if let Some(cc) = user.cc.clone() {
                    cc.disconnect(true);
                }
            }
        }
        let removed: Vec<TthDigest> = self
            .users
            .get_mut(&uid)
            .map(|u| {
                let (gone, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut u.queue)
                    .into_iter()
                    .partition(|e| tth.is_none() || tth == Some(e.tth));
                u.queue = keep;
                gone.into_iter().map(|e| e.tth).collect()
            })
            .unwrap_or_default();
        for t in &removed {
            if let Some(rec) = self.records.get_mut(t) {
                rec.users.retain(|&u| u != uid);
            }
        }
        match tth {
            Some(t) => {
                let _ = self.db.exec(
                    Query::DlUserDel,
                    vec![
                        Value::Text(tth::base32_encode(&t)),
                        Value::Int64(uid as i64),
                    ],
                );
            }
            None => {
                let _ = self
                    .db
                    .exec(Query::DlUserDelByUid, vec![Value::Int64(uid as i64)]);
            }
        }
        self.drop_user_if_empty(uid);
        self.schedule_eval();
    }

    async fn remove_record(&mut self, tth: TthDigest) {
        let Some(rec) = self.records.remove(&tth) else {
            return;
        };
        if let Some(uid) = rec.active_uid {
            self.recv.remove(&uid);
            if let Some(user) = self.users.get_mut(&uid) {
                user.active = None;
                if let Some(cc) = user.cc.clone() {
                    cc.disconnect(true);
                }
            }
            self.set_user_state(uid, UserState::WaitingReconnect);
        }
        if tokio::fs::try_exists(&rec.inc).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&rec.inc).await;
        }
        for uid in &rec.users {
            if let Some(user) = self.users.get_mut(uid) {
                user.queue.retain(|e| e.tth != tth);
            }
            self.drop_user_if_empty(*uid);
        }
        if !rec.islist {
            let tth_s = tth::base32_encode(&tth);
            let _ = self.db.submit(
                crate::db::DbRequest::new(Query::DlDel, vec![Value::Text(tth_s.clone())])
                    .flags(DBF_CHAIN_NEXT),
            );
            let _ = self
                .db
                .exec(Query::DlUserDelByTth, vec![Value::Text(tth_s)]);
        }
        self.emit(DlEvent::Removed { tth });
        self.schedule_eval();
    }

    // -- TTHL ----------------------------------------------------------

    fn set_tthl(&mut self, uid: u64, tth: TthDigest, blob: Vec<u8>) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        if rec.islist || rec.hastthl || rec.have > 0 {
            return;
        }
        let leaves: Option<Vec<TthDigest>> = (!blob.is_empty() && blob.len() % 24 == 0).then(|| {
            blob.chunks_exact(24)
                .map(|c| {
                    let mut d = [0u8; 24];
                    d.copy_from_slice(c);
                    d
                })
                .collect()
        });
        let valid = leaves
            .as_ref()
            .is_some_and(|ls| tth::tth_root(ls) == rec.tth);
        if !valid {
            tracing::warn!(uid = format_args!("{uid:016x}"), "received TTHL does not match the root");
            if let Some(cc) = self.users.get(&uid).and_then(|u| u.cc.clone()) {
                cc.disconnect(true);
            }
            self.set_user_error(uid, Some(tth), DlErrorKind::BadTthl, None);
            return;
        }
        let leaves = leaves.expect("validated");
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        let (leaves, block) = tth::shrink_tthl(leaves, rec.size, MIN_BLOCK_SIZE);
        rec.hash_block = block;
        rec.hastthl = true;
        let mut blob_out = Vec::with_capacity(leaves.len() * 24);
        for leaf in &leaves {
            blob_out.extend_from_slice(leaf);
        }
        rec.leaves = Some(leaves);
        tracing::debug!(
            uid = format_args!("{uid:016x}"),
            block,
            leaves = rec.leaves.as_ref().map(|l| l.len()).unwrap_or(0),
            "TTHL accepted"
        );
        let _ = self.db.exec(
            Query::DlSetTthl,
            vec![
                Value::Blob(blob_out),
                Value::Text(tth::base32_encode(&tth)),
            ],
        );
    }

    fn list_size(&mut self, uid: u64, size: u64) {
        let Some(tth) = self.users.get(&uid).and_then(|u| u.active) else {
            return;
        };
        if let Some(rec) = self.records.get_mut(&tth) {
            if rec.islist {
                rec.size = size;
            }
        }
    }

    // -- data receipt --------------------------------------------------

    async fn recv_data(&mut self, uid: u64, data: &[u8]) {
        let Some(tth) = self.users.get(&uid).and_then(|u| u.active) else {
            return;
        };
        let Some(rec) = self.records.get(&tth) else {
            return;
        };
        // Data before the TTHL is established cannot be verified.
        if !rec.islist && !rec.hastthl {
            tracing::warn!(uid = format_args!("{uid:016x}"), "file data before TTHL, dropping");
            return;
        }
        if !self.recv.contains_key(&uid) {
            let ctx = ReceiveContext::open(
                uid,
                &rec.inc,
                rec.have,
                if rec.islist && rec.size == 0 {
                    u64::MAX
                } else {
                    rec.size
                },
                rec.hash_block,
                rec.islist,
                rec.tth,
                rec.leaves.clone(),
                self.vars.flush_file_cache(),
            )
            .await;
            match ctx {
                Ok(ctx) => {
                    self.recv.insert(uid, ctx);
                }
                Err(err) => {
                    self.incoming_io_error(uid, tth, err).await;
                    return;
                }
            }
        }
        let ctx = self.recv.get_mut(&uid).expect("just inserted");
        match ctx.receive(data).await {
            Ok(RecvOutcome::Progress) => {
                let have = ctx.have;
                if let Some(rec) = self.records.get_mut(&tth) {
                    rec.have = have;
                }
            }
            Ok(RecvOutcome::Complete) => {
                let mut ctx = self.recv.remove(&uid).expect("present");
                let _ = ctx.flush().await;
                if let Some(rec) = self.records.get_mut(&tth) {
                    rec.have = rec.size;
                }
                drop(ctx);
                self.finalize(uid, tth).await;
            }
            Ok(RecvOutcome::HashMismatch { block }) => {
                tracing::warn!(
                    uid = format_args!("{uid:016x}"),
                    block,
                    "hash check failed, rewinding"
                );
                let have = ctx.have;
                self.recv.remove(&uid);
                if let Some(rec) = self.records.get_mut(&tth) {
                    rec.have = have;
                }
                if let Some(cc) = self.users.get(&uid).and_then(|u| u.cc.clone()) {
                    cc.disconnect(true);
                }
                self.set_user_error(
                    uid,
                    Some(tth),
                    DlErrorKind::HashMismatch,
                    Some(format!("block {block}")),
                );
                self.abort_transfer(uid, UserState::WaitingReconnect).await;
            }
            Err(err) => {
                self.incoming_io_error(uid, tth, err).await;
            }
        }
    }

    async fn incoming_io_error(&mut self, uid: u64, tth: TthDigest, err: std::io::Error) {
        tracing::warn!(error = %err, "incoming file I/O error");
        self.recv.remove(&uid);
        self.set_global_error(tth, DlErrorKind::IoIncoming, Some(err.to_string()));
        self.abort_transfer(uid, UserState::WaitingReconnect).await;
    }

    async fn transfer_done(&mut self, uid: u64) {
        let Some(tth) = self.users.get(&uid).and_then(|u| u.active) else {
            return;
        };
        let islist = self.records.get(&tth).map(|r| r.islist).unwrap_or(false);
        if islist {
            // Lists finish on explicit transfer end, not on a size match.
            if let Some(mut ctx) = self.recv.remove(&uid) {
                let _ = ctx.flush().await;
                let have = ctx.have;
                if let Some(rec) = self.records.get_mut(&tth) {
                    rec.have = have;
                    rec.size = have;
                }
            }
            if self.records.get(&tth).map(|r| r.have > 0).unwrap_or(false) {
                self.finalize(uid, tth).await;
                return;
            }
        }
        // Chunk done: back to idle, the slot frees up.
        if self.users.get(&uid).is_some_and(|u| u.active.is_some()) {
            self.abort_transfer(uid, UserState::Idle).await;
        }
    }

    // -- finalization --------------------------------------------------

    async fn finalize(&mut self, uid: u64, tth: TthDigest) {
        let Some(rec) = self.records.get_mut(&tth) else {
            return;
        };
        rec.active_uid = None;
        let (islist, inc, mut dest) = (rec.islist, rec.inc.clone(), rec.dest.clone());
        let (open_after, match_after) = (rec.open_after, rec.match_after);
        if let Some(user) = self.users.get_mut(&uid) {
            user.active = None;
        }

        if let Some(parent) = dest.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                self.set_global_error(tth, DlErrorKind::IoDestination, Some(err.to_string()));
                self.set_user_state(uid, UserState::Idle);
                self.schedule_eval();
                return;
            }
        }
        // Regular files never overwrite: resolve collisions with `.N`.
        if !islist {
            let mut n = 1u32;
            while tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                let mut cand = self.records.get(&tth).expect("record").dest.as_os_str().to_os_string();
                cand.push(format!(".{n}"));
                dest = PathBuf::from(cand);
                n += 1;
            }
        }
        match tokio::fs::rename(&inc, &dest).await {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(error = %err, from = %inc.display(), to = %dest.display(),
                    "finalize failed");
                self.set_global_error(tth, DlErrorKind::IoDestination, Some(err.to_string()));
                self.set_user_state(uid, UserState::Idle);
                self.schedule_eval();
                return;
            }
        }
        tracing::debug!(uid = format_args!("{uid:016x}"), dest = %dest.display(), "download finished");
        self.emit(DlEvent::Message(format!(
            "Finished downloading `{}'",
            dest.display()
        )));
        if islist {
            self.emit(DlEvent::ListReady {
                uid,
                path: dest,
                open: open_after,
                match_queue: match_after,
            });
        }
        self.remove_record(tth).await;
        self.set_user_state(uid, UserState::Idle);
        self.schedule_eval();
    }

    // -- startup and cleanup -------------------------------------------

    async fn load(&mut self) -> Result<(), crate::db::DbError> {
        let db = self.db.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let recs = db.query_rows(Query::DlListAll, vec![])?;
            let users = db.query_rows(Query::DlUserListAll, vec![])?;
            let mut tthls = HashMap::new();
            for row in &recs {
                let Some(tth_s) = row[0].as_str() else { continue };
                let has_tthl = row[6].as_i64().unwrap_or(0) > 0;
                if has_tthl {
                    let blob_rows =
                        db.query_rows(Query::DlGetTthl, vec![Value::Text(tth_s.to_string())])?;
                    if let Some(blob) = blob_rows.first().and_then(|r| r[0].as_blob()) {
                        tthls.insert(tth_s.to_string(), blob.to_vec());
                    }
                }
            }
            Ok::<_, crate::db::DbError>((recs, users, tthls))
        })
        .await
        .map_err(|_| crate::db::DbError::Closed)??;
        let (recs, user_rows, tthls) = loaded;

        for row in recs {
            let (Some(tth_s), Some(size), Some(dest)) =
                (row[0].as_str(), row[1].as_i64(), row[2].as_str())
            else {
                continue;
            };
            let Some(digest) = tth::tth_from_str(tth_s) else {
                continue;
            };
            let size = size as u64;
            let prio = Priority::from_code(row[3].as_i64().unwrap_or(0));
            let error = DlErrorKind::from_code(row[4].as_i64().unwrap_or(0));
            let error_msg = row[5].as_str().map(str::to_string);
            let inc = self.inc_dir.join(tth_s);

            let (mut hastthl, mut hash_block, mut leaves) = (false, 0u64, None::<Vec<TthDigest>>);
            if size < MIN_TTHL_SIZE {
                hastthl = true;
                hash_block = MIN_TTHL_SIZE;
            } else if let Some(blob) = tthls.get(tth_s) {
                let ls: Vec<TthDigest> = blob
                    .chunks_exact(24)
                    .map(|c| {
                        let mut d = [0u8; 24];
                        d.copy_from_slice(c);
                        d
                    })
                    .collect();
                if !ls.is_empty() {
                    hastthl = true;
                    hash_block = tth::tth_blocksize(size, ls.len());
                    leaves = Some(ls);
                }
            }

            let mut have = 0;
            let mut load_error = (error, error_msg);
            if hastthl {
                match recv::resume_offset(&inc, size, hash_block, &digest, leaves.as_deref()).await
                {
                    Ok(Ok(offset)) => have = offset,
                    Ok(Err(block)) => {
                        // Stored data disagrees with the hash tree.
                        have = block as u64 * hash_block;
                        load_error = (
                            DlErrorKind::HashMismatch,
                            Some(format!("stored block {block} failed verification")),
                        );
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, inc = %inc.display(),
                            "cannot inspect incoming file");
                    }
                }
            } else {
                // No TTHL for a large file: any partial data is unverifiable.
                let _ = tokio::fs::remove_file(&inc).await;
            }

            let mut prio = prio;
            if load_error.0 != DlErrorKind::None {
                prio = Priority::Error;
            }
            tracing::debug!(
                dest,
                size,
                have,
                block = hash_block,
                "loaded queued download"
            );
            self.records.insert(
                digest,
                DlRecord {
                    tth: digest,
                    islist: false,
                    hastthl,
                    prio,
                    error: load_error.0,
                    error_msg: load_error.1,
                    size,
                    have,
                    dest: PathBuf::from(dest),
                    inc,
                    hash_block,
                    leaves,
                    users: Vec::new(),
                    active_uid: None,
                    open_after: false,
                    match_after: false,
                },
            );
        }

        for row in user_rows {
            let (Some(tth_s), Some(uid)) = (row[0].as_str(), row[1].as_i64()) else {
                continue;
            };
            let Some(digest) = tth::tth_from_str(tth_s) else {
                continue;
            };
            if !self.records.contains_key(&digest) {
                continue;
            }
            let error = DlErrorKind::from_code(row[2].as_i64().unwrap_or(0));
            self.attach_user(uid as u64, digest, error);
        }
        if !self.records.is_empty() {
            tracing::info!(count = self.records.len(), "download queue loaded");
            self.schedule_eval();
        }
        Ok(())
    }

    /// Removes spool files not referenced by the queue and file lists older
    /// than the configured age.
    async fn clean_spool(&self) {
        if let Ok(mut dir) = tokio::fs::read_dir(&self.inc_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !tth::is_tth_str(name) {
                    continue;
                }
                let Some(digest) = tth::tth_from_str(name) else {
                    continue;
                };
                if !self.records.contains_key(&digest) {
                    tracing::debug!(name, "removing stale incoming file");
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
        let maxage = self.vars.filelist_maxage();
        if let Ok(mut dir) = tokio::fs::read_dir(&self.fl_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                let stale = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .is_some_and(|age| age.as_secs() > maxage);
                if stale {
                    tracing::debug!(path = %entry.path().display(), "removing old file list");
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        // Incomplete file lists are useless across restarts.
        for rec in self.records.values() {
            if rec.islist {
                let _ = tokio::fs::remove_file(&rec.inc).await;
            }
        }
        tracing::debug!("download queue shut down");
    }

    fn snapshot(&self) -> QueueSnapshot {
        let mut records: Vec<RecordInfo> = self
            .records
            .values()
            .map(|r| RecordInfo {
                tth: r.tth,
                islist: r.islist,
                hastthl: r.hastthl,
                prio: r.prio,
                error: r.error,
                error_msg: r.error_msg.clone(),
                size: r.size,
                have: r.have,
                dest: r.dest.clone(),
                hash_block: r.hash_block,
                users: r.users.clone(),
                active_uid: r.active_uid,
            })
            .collect();
        records.sort_by(|a, b| a.dest.cmp(&b.dest));
        let mut users: Vec<UserInfo> = self
            .users
            .values()
            .map(|u| UserInfo {
                uid: u.uid,
                state: u.state,
                queue: u.queue.iter().map(|e| (e.tth, e.error)).collect(),
                active: u.active,
            })
            .collect();
        users.sort_by_key(|u| u.uid);
        QueueSnapshot { records, users }
    }
}

async fn create_empty_dest(dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(dest).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::CcCmd;
    use crate::db::DbService;
    use crate::tth::TthContext;
    use std::time::Duration;

    const BLOCK: u64 = 1 << 20;
    const U1: u64 = 0x1111;
    const U2: u64 = 0x2222;

    struct Fixture {
        dir: PathBuf,
        svc: Option<DbService>,
        vars: Arc<Vars>,
        hubs: Arc<HubRegistry>,
        connect_rx: mpsc::UnboundedReceiver<crate::hub::ConnectRequest>,
        handle: DlQueueHandle,
        _events: mpsc::UnboundedReceiver<DlEvent>,
    }

    async fn fixture(tag: &str) -> Fixture {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        dir.push(format!("rust-dc-queue-{tag}-{nanos}"));
        for sub in ["inc", "fl", "dl"] {
            std::fs::create_dir_all(dir.join(sub)).expect("mkdir");
        }
        let svc = DbService::open(&dir.join("db.sqlite3")).expect("open db");
        let vars = Arc::new(Vars::load(svc.handle(), dir.clone()).expect("vars"));
        vars.set(
            crate::vars::HUB_GLOBAL,
            "download_dir",
            dir.join("dl").to_str().expect("utf8"),
        )
        .expect("set download_dir");
        let (hubs, connect_rx) = HubRegistry::new();
        let hubs = Arc::new(hubs);
        let (handle, events, _join) =
            start_queue(svc.handle(), vars.clone(), hubs.clone(), &dir).await;
        Fixture {
            dir,
            svc: Some(svc),
            vars,
            hubs,
            connect_rx,
            handle,
            _events: events,
        }
    }

    impl Fixture {
        async fn restart_queue(&mut self) {
            self.handle.shutdown().await;
            let svc = self.svc.as_ref().expect("db alive");
            let (handle, events, _join) = start_queue(
                svc.handle(),
                self.vars.clone(),
                self.hubs.clone(),
                &self.dir,
            )
            .await;
            self.handle = handle;
            self._events = events;
        }

        fn cleanup(mut self) {
            if let Some(svc) = self.svc.take() {
                svc.shutdown();
            }
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    /// Waits out the selection debounce.
    async fn settle() {
        tokio::time::sleep(EVAL_DEBOUNCE + Duration::from_millis(250)).await;
    }

    /// Builds file content of `blocks` 1 MiB blocks, its TTHL leaves and
    /// root.
    fn blocks_of(blocks: usize) -> (Vec<u8>, Vec<TthDigest>, TthDigest) {
        let data: Vec<u8> = (0..blocks * BLOCK as usize)
            .map(|i| (i % 249) as u8)
            .collect();
        let leaves: Vec<TthDigest> = data
            .chunks(BLOCK as usize)
            .map(|c| {
                let mut ctx = TthContext::new();
                ctx.update(c);
                ctx.finish()
            })
            .collect();
        let root = tth::tth_root(&leaves);
        (data, leaves, root)
    }

    fn blob_of(leaves: &[TthDigest]) -> Vec<u8> {
        let mut out = Vec::with_capacity(leaves.len() * 24);
        for l in leaves {
            out.extend_from_slice(l);
        }
        out
    }

    async fn expect_download(rx: &mut mpsc::UnboundedReceiver<CcCmd>) -> DlAssignment {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("cc command timeout")
                .expect("cc channel open")
            {
                CcCmd::Download(a) => return a,
                CcCmd::Disconnect { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn add_persists_and_reloads() {
        let mut fx = fixture("persist").await;
        let (_, leaves, root) = blocks_of(4);
        assert!(fx.handle.add_file(U1, root, 4 * BLOCK, "a/movie.mkv").await);
        assert!(!fx.handle.add_file(U1, root, 4 * BLOCK, "a/movie.mkv").await);
        fx.handle.set_tthl(U1, root, blob_of(&leaves));
        fx.handle.set_priority(root, Priority::High);

        fx.restart_queue().await;
        let snap = fx.handle.snapshot().await;
        assert_eq!(snap.records.len(), 1);
        let rec = &snap.records[0];
        assert_eq!(rec.tth, root);
        assert_eq!(rec.size, 4 * BLOCK);
        assert_eq!(rec.prio, Priority::High);
        assert!(rec.hastthl);
        assert_eq!(rec.hash_block, BLOCK);
        assert_eq!(rec.users, vec![U1]);
        assert!(rec.dest.ends_with("a/movie.mkv"));
        assert_eq!(snap.users.len(), 1);
        assert_eq!(snap.users[0].state, UserState::NotConnected);
        fx.cleanup();
    }

    #[tokio::test]
    async fn selection_dials_out_then_assigns() {
        let mut fx = fixture("select").await;
        let (_, _, root) = blocks_of(4);
        fx.handle.add_file(U1, root, 4 * BLOCK, "f.bin").await;
        fx.hubs.user_online(1, U1);
        fx.handle.user_online(U1);
        settle().await;
        assert_eq!(
            fx.connect_rx.try_recv().ok(),
            Some(crate::hub::ConnectRequest { uid: U1 })
        );
        let snap = fx.handle.snapshot().await;
        assert_eq!(snap.users[0].state, UserState::Expecting);

        // Handshake completes.
        let (cc, mut cc_rx) = CcHandle::test_handle(U1);
        fx.handle.user_cc(U1, Some(cc));
        settle().await;
        let assignment = expect_download(&mut cc_rx).await;
        assert!(assignment.need_tthl);
        assert_eq!(assignment.offset, 0);
        assert_eq!(assignment.size, 4 * BLOCK);
        let snap = fx.handle.snapshot().await;
        assert_eq!(snap.users[0].state, UserState::Active);
        assert_eq!(snap.records[0].active_uid, Some(U1));
        fx.cleanup();
    }

    #[tokio::test]
    async fn complete_transfer_finalizes_and_forgets() {
        let fx = fixture("complete").await;
        let (data, leaves, root) = blocks_of(4);
        fx.handle.add_file(U1, root, 4 * BLOCK, "out.bin").await;
        let (cc, mut cc_rx) = CcHandle::test_handle(U1);
        fx.handle.user_cc(U1, Some(cc));
        settle().await;
        let _ = expect_download(&mut cc_rx).await;

        fx.handle.set_tthl(U1, root, blob_of(&leaves));
        for chunk in data.chunks(256 * 1024) {
            fx.handle.recv_data(U1, chunk.to_vec());
        }
        fx.handle.transfer_done(U1);
        settle().await;

        let dest = fx.dir.join("dl/out.bin");
        assert_eq!(std::fs::read(&dest).expect("dest exists"), data);
        let inc = fx
            .dir
            .join("inc")
            .join(tth::base32_encode(&root));
        assert!(!inc.exists(), "incoming file must be gone");
        let snap = fx.handle.snapshot().await;
        assert!(snap.records.is_empty());
        let rows = fx
            .svc
            .as_ref()
            .expect("db")
            .handle()
            .query_rows(Query::DlListAll, vec![])
            .expect("query");
        assert!(rows.is_empty(), "record must be gone from the store");
        fx.cleanup();
    }

    #[tokio::test]
    async fn hash_mismatch_rewinds_and_demotes_user() {
        let fx = fixture("mismatch").await;
        let (mut data, leaves, root) = blocks_of(4);
        // Corrupt the last byte of the second block.
        let bad = (2 * BLOCK - 1) as usize;
        data[bad] ^= 0x01;
        fx.handle.add_file(U1, root, 4 * BLOCK, "bad.bin").await;
        let (cc, mut cc_rx) = CcHandle::test_handle(U1);
        fx.handle.user_cc(U1, Some(cc));
        settle().await;
        let _ = expect_download(&mut cc_rx).await;
        fx.handle.set_tthl(U1, root, blob_of(&leaves));
        for chunk in data.chunks(256 * 1024) {
            fx.handle.recv_data(U1, chunk.to_vec());
        }
        settle().await;

        let snap = fx.handle.snapshot().await;
        let rec = &snap.records[0];
        assert_eq!(rec.have, BLOCK, "have rewinds to the last good block");
        assert_eq!(rec.error, DlErrorKind::None, "the error is per-user");
        assert_eq!(rec.active_uid, None);
        let user = &snap.users[0];
        assert_eq!(user.state, UserState::WaitingReconnect);
        assert_eq!(user.queue[0].1, DlErrorKind::HashMismatch);
        let inc = fx.dir.join("inc").join(tth::base32_encode(&root));
        assert_eq!(
            std::fs::metadata(&inc).expect("inc").len(),
            BLOCK,
            "incoming file truncated at the failed block"
        );
        // The session was told to go away.
        let got_disconnect = matches!(
            tokio::time::timeout(Duration::from_secs(2), cc_rx.recv()).await,
            Ok(Some(CcCmd::Disconnect { force: true }))
        );
        assert!(got_disconnect);
        // And the per-user error reached the store.
        let rows = fx
            .svc
            .as_ref()
            .expect("db")
            .handle()
            .query_rows(Query::DlUserListAll, vec![])
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][2].as_i64(), Some(DlErrorKind::HashMismatch.code()));
        fx.cleanup();
    }

    #[tokio::test]
    async fn failed_user_does_not_block_siblings() {
        let fx = fixture("siblings").await;
        let (_, _, root) = blocks_of(4);
        fx.handle.add_file(U1, root, 4 * BLOCK, "s.bin").await;
        assert_eq!(
            fx.handle.match_file(U2, root).await,
            MatchResult::Associated
        );
        assert_eq!(
            fx.handle.match_file(U2, root).await,
            MatchResult::AlreadyAssociated
        );
        assert_eq!(
            fx.handle.match_file(U2, [9u8; 24]).await,
            MatchResult::NotInQueue
        );

        let (cc1, mut cc1_rx) = CcHandle::test_handle(U1);
        let (cc2, mut cc2_rx) = CcHandle::test_handle(U2);
        // U1 cannot serve the file; U2 connects a moment later.
        fx.handle
            .set_user_error(U1, Some(root), DlErrorKind::NotAvailable, None);
        fx.handle.user_cc(U1, Some(cc1));
        fx.handle.user_cc(U2, Some(cc2));
        settle().await;

        let assignment = expect_download(&mut cc2_rx).await;
        assert_eq!(assignment.uid, U2);
        assert!(
            cc1_rx.try_recv().is_err(),
            "the failed user must not be scheduled"
        );
        let snap = fx.handle.snapshot().await;
        let u1 = snap.users.iter().find(|u| u.uid == U1).expect("u1");
        assert_eq!(u1.state, UserState::Idle);
        assert_eq!(u1.queue[0].1, DlErrorKind::NotAvailable);
        fx.cleanup();
    }

    #[tokio::test]
    async fn bad_tthl_sets_user_error() {
        let fx = fixture("badtthl").await;
        let (_, _, root) = blocks_of(4);
        fx.handle.add_file(U1, root, 4 * BLOCK, "t.bin").await;
        // Leaves that do not hash to the root.
        fx.handle.set_tthl(U1, root, vec![0u8; 4 * 24]);
        settle().await;
        let snap = fx.handle.snapshot().await;
        assert!(!snap.records[0].hastthl);
        assert_eq!(snap.users[0].queue[0].1, DlErrorKind::BadTthl);
        fx.cleanup();
    }

    #[tokio::test]
    async fn zero_size_file_is_complete_immediately() {
        let fx = fixture("zero").await;
        assert!(fx.handle.add_file(U1, [3u8; 24], 0, "empty.txt").await);
        let snap = fx.handle.snapshot().await;
        assert!(snap.records.is_empty());
        assert!(fx.dir.join("dl/empty.txt").exists());
        fx.cleanup();
    }

    #[tokio::test]
    async fn tree_add_respects_exclusions_but_not_on_root() {
        let fx = fixture("tree").await;
        let mut tree = FileTree::new();
        let d = tree.create_dir("Album", false).unwrap();
        tree.add(tree.root(), d).unwrap();
        for (i, name) in ["01.flac", "02.flac", "cover.txt"].iter().enumerate() {
            let f = tree
                .create_file(name, 1000, Some([i as u8 + 1; 24]), None)
                .unwrap();
            tree.add(d, f).unwrap();
        }
        let added = fx
            .handle
            .add_tree(
                U1,
                tree,
                d,
                Some(Box::new(|name: &str| name.ends_with(".txt"))),
            )
            .await;
        assert_eq!(added, 2);
        let snap = fx.handle.snapshot().await;
        assert_eq!(snap.records.len(), 2);
        assert!(snap
            .records
            .iter()
            .all(|r| r.dest.to_string_lossy().contains("Album/")));

        // A file node as the subtree root ignores the exclusion.
        let mut single = FileTree::new();
        let f = single
            .create_file("readme.txt", 500, Some([7u8; 24]), None)
            .unwrap();
        single.add(single.root(), f).unwrap();
        let added = fx
            .handle
            .add_tree(
                U1,
                single,
                f,
                Some(Box::new(|name: &str| name.ends_with(".txt"))),
            )
            .await;
        assert_eq!(added, 1);
        fx.cleanup();
    }

    #[tokio::test]
    async fn duplicate_destinations_get_suffixes() {
        let fx = fixture("dupes").await;
        fx.handle.add_file(U1, [1u8; 24], 100, "same.bin").await;
        fx.handle.add_file(U1, [2u8; 24], 100, "same.bin").await;
        let snap = fx.handle.snapshot().await;
        let mut dests: Vec<String> = snap
            .records
            .iter()
            .map(|r| r.dest.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        dests.sort();
        assert_eq!(dests, ["same.bin", "same.bin.1"]);
        fx.cleanup();
    }

    #[tokio::test]
    async fn resume_picks_up_verified_blocks() {
        let mut fx = fixture("resume").await;
        let (data, leaves, root) = blocks_of(4);
        fx.handle.add_file(U1, root, 4 * BLOCK, "r.bin").await;
        fx.handle.set_tthl(U1, root, blob_of(&leaves));
        // Two good blocks and change appear on disk (say, from a previous
        // run), then the process restarts.
        let inc = fx.dir.join("inc").join(tth::base32_encode(&root));
        std::fs::write(&inc, &data[..(2 * BLOCK + 777) as usize]).expect("seed");
        fx.restart_queue().await;
        let snap = fx.handle.snapshot().await;
        assert_eq!(snap.records[0].have, 2 * BLOCK);
        assert_eq!(std::fs::metadata(&inc).expect("inc").len(), 2 * BLOCK);
        fx.cleanup();
    }

    #[tokio::test]
    async fn stale_spool_files_are_swept() {
        let mut fx = fixture("sweep").await;
        let stray = fx
            .dir
            .join("inc")
            .join(tth::base32_encode(&[0xee; 24]));
        std::fs::write(&stray, b"junk").expect("stray");
        std::fs::write(fx.dir.join("inc/not-a-hash.tmp"), b"keep").expect("other");
        fx.restart_queue().await;
        assert!(!stray.exists(), "unreferenced spool file must be removed");
        assert!(
            fx.dir.join("inc/not-a-hash.tmp").exists(),
            "only base32-named files are ours to delete"
        );
        fx.cleanup();
    }

    #[test]
    fn entry_ordering_is_total() {
        fn rec(islist: bool, prio: Priority, error: DlErrorKind, dest: &str) -> DlRecord {
            DlRecord {
                tth: [0u8; 24],
                islist,
                hastthl: false,
                prio,
                error,
                error_msg: None,
                size: 1,
                have: 0,
                dest: PathBuf::from(dest),
                inc: PathBuf::new(),
                hash_block: 0,
                leaves: None,
                users: Vec::new(),
                active_uid: None,
                open_after: false,
                match_after: false,
            }
        }
        let entry = |error| UserEntry {
            tth: [0u8; 24],
            error,
            error_msg: None,
        };
        let e = entry(DlErrorKind::None);

        // Lists come before files.
        let list = rec(true, Priority::Med, DlErrorKind::None, "/l");
        let file = rec(false, Priority::VeryHigh, DlErrorKind::None, "/f");
        assert_eq!(entry_cmp((&e, &list), (&e, &file)), Ordering::Less);
        // Higher priority first.
        let hi = rec(false, Priority::High, DlErrorKind::None, "/x");
        let lo = rec(false, Priority::Low, DlErrorKind::None, "/x");
        assert_eq!(entry_cmp((&e, &hi), (&e, &lo)), Ordering::Less);
        // Disabled (off, global error, or per-user error) sinks.
        let off = rec(false, Priority::Off, DlErrorKind::None, "/a");
        assert_eq!(entry_cmp((&e, &lo), (&e, &off)), Ordering::Less);
        let errored = rec(false, Priority::High, DlErrorKind::IoIncoming, "/a");
        assert_eq!(entry_cmp((&e, &lo), (&e, &errored)), Ordering::Less);
        let user_err = entry(DlErrorKind::NotAvailable);
        assert_eq!(entry_cmp((&e, &lo), (&user_err, &hi)), Ordering::Less);
        // Destination path breaks priority ties.
        let a = rec(false, Priority::Med, DlErrorKind::None, "/aaa");
        let b = rec(false, Priority::Med, DlErrorKind::None, "/bbb");
        assert_eq!(entry_cmp((&e, &a), (&e, &b)), Ordering::Less);
    }
}
