//! Peer sessions (client-client connections), download side.
//!
//! A session owns one framed [`Conn`] and translates between the wire and
//! the download queue: the queue calls [`CcHandle::download`] /
//! [`CcHandle::disconnect`], the session reports back through
//! `user_cc`, `set_tthl` and `recv_data` on the queue handle. Hub-level
//! handshake and protocol negotiation happen before a session is handed to
//! this module.

use crate::dl::{DlAssignment, DlQueueHandle};
use crate::net::{Conn, ConnEvent};
use crate::tth;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum CcCmd {
    Download(DlAssignment),
    Disconnect { force: bool },
}

/// Cloneable handle to a running peer session.
#[derive(Debug, Clone)]
pub struct CcHandle {
    uid: u64,
    tx: mpsc::UnboundedSender<CcCmd>,
}

impl CcHandle {
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Starts (or continues with) a transfer on this session.
    pub fn download(&self, assignment: DlAssignment) {
        let _ = self.tx.send(CcCmd::Download(assignment));
    }

    pub fn disconnect(&self, force: bool) {
        let _ = self.tx.send(CcCmd::Disconnect { force });
    }

    /// Detached handle for queue tests: commands land on the returned
    /// receiver instead of a live session.
    #[cfg(test)]
    pub(crate) fn test_handle(uid: u64) -> (Self, mpsc::UnboundedReceiver<CcCmd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { uid, tx }, rx)
    }
}

/// What the pending raw range carries.
#[derive(Debug, PartialEq, Eq)]
enum RawSink {
    None,
    Tthl,
    Data,
}

/// Spawns the session task for an established (handshaken) connection and
/// announces it to the queue.
pub fn start_session(
    uid: u64,
    conn: Conn,
    events: mpsc::UnboundedReceiver<ConnEvent>,
    queue: DlQueueHandle,
) -> CcHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = CcHandle { uid, tx };
    queue.user_cc(uid, Some(handle.clone()));
    tokio::spawn(run_session(uid, conn, events, rx, queue));
    handle
}

fn fmt_tthl_request(digest: &tth::TthDigest) -> Vec<u8> {
    format!("CGET tthl TTH/{} 0 -1", tth::base32_encode(digest)).into_bytes()
}

fn fmt_file_request(assignment: &DlAssignment) -> Vec<u8> {
    if assignment.islist {
        b"CGET file files.xml.bz2 0 -1".to_vec()
    } else {
        format!(
            "CGET file TTH/{} {} {}",
            tth::base32_encode(&assignment.tth),
            assignment.offset,
            assignment.size - assignment.offset
        )
        .into_bytes()
    }
}

/// Parsed `CSND <type> <id> <start> <len>` answer.
#[derive(Debug, PartialEq, Eq)]
struct Snd<'a> {
    kind: &'a str,
    id: &'a str,
    start: u64,
    len: u64,
}

fn parse_snd(msg: &str) -> Option<Snd<'_>> {
    let mut it = msg.split(' ');
    if it.next()? != "CSND" {
        return None;
    }
    let kind = it.next()?;
    let id = it.next()?;
    let start = it.next()?.parse().ok()?;
    let len = it.next()?.parse().ok()?;
    if it.next().is_some() {
        return None;
    }
    Some(Snd {
        kind,
        id,
        start,
        len,
    })
}

/// `CSTA <code> <description>`; code 0 is informational.
fn parse_sta(msg: &str) -> Option<(u32, String)> {
    let rest = msg.strip_prefix("CSTA ")?;
    let (code, desc) = rest.split_once(' ').unwrap_or((rest, ""));
    Some((code.parse().ok()?, desc.replace('\\', " ")))
}

async fn run_session(
    uid: u64,
    conn: Conn,
    mut events: mpsc::UnboundedReceiver<ConnEvent>,
    mut cmds: mpsc::UnboundedReceiver<CcCmd>,
    queue: DlQueueHandle,
) {
    let mut current: Option<DlAssignment> = None;
    let mut sink = RawSink::None;
    let mut tthl_buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(CcCmd::Download(assignment)) => {
                    if assignment.need_tthl && !assignment.islist {
                        conn.send(fmt_tthl_request(&assignment.tth));
                    } else {
                        conn.send(fmt_file_request(&assignment));
                    }
                    current = Some(assignment);
                }
                Some(CcCmd::Disconnect { force }) => {
                    tracing::debug!(uid = format_args!("{uid:016x}"), force, "disconnecting");
                    conn.disconnect();
                    queue.user_cc(uid, None);
                    return;
                }
                None => {
                    conn.disconnect();
                    queue.user_cc(uid, None);
                    return;
                }
            },
            event = events.recv() => match event {
                Some(ConnEvent::Message(msg)) => {
                    let Ok(text) = std::str::from_utf8(&msg) else {
                        continue;
                    };
                    if let Some(snd) = parse_snd(text) {
                        let Some(assignment) = &current else { continue };
                        match snd.kind {
                            "tthl" => {
                                tthl_buf = Vec::with_capacity(snd.len as usize);
                                sink = RawSink::Tthl;
                                conn.recv_raw(snd.len);
                            }
                            "file" => {
                                if assignment.islist {
                                    queue.list_size(uid, snd.len);
                                }
                                sink = RawSink::Data;
                                conn.recv_raw(snd.len);
                            }
                            other => {
                                tracing::debug!(kind = other, "ignoring unknown CSND type");
                            }
                        }
                    } else if let Some((code, desc)) = parse_sta(text) {
                        if code == 0 {
                            continue;
                        }
                        // The peer cannot serve the request; demote it for
                        // this file and free the slot.
                        if let Some(assignment) = current.take() {
                            queue.set_user_error(
                                uid,
                                Some(assignment.tth),
                                crate::dl::DlErrorKind::NotAvailable,
                                Some(desc),
                            );
                            queue.transfer_done(uid);
                        }
                    }
                }
                Some(ConnEvent::RawData(chunk)) => match sink {
                    RawSink::Tthl => tthl_buf.extend_from_slice(&chunk),
                    RawSink::Data => queue.recv_data(uid, chunk),
                    RawSink::None => {
                        tracing::warn!(uid = format_args!("{uid:016x}"),
                            "raw data with no transfer in progress");
                    }
                },
                Some(ConnEvent::RawDone) => match std::mem::replace(&mut sink, RawSink::None) {
                    RawSink::Tthl => {
                        if let Some(assignment) = &current {
                            queue.set_tthl(uid, assignment.tth, std::mem::take(&mut tthl_buf));
                            conn.send(fmt_file_request(assignment));
                        }
                    }
                    RawSink::Data => {
                        current = None;
                        queue.transfer_done(uid);
                    }
                    RawSink::None => {}
                },
                Some(ConnEvent::Error { kind, msg }) => {
                    tracing::debug!(uid = format_args!("{uid:016x}"), %kind, msg,
                        "peer connection failed");
                    queue.user_cc(uid, None);
                    return;
                }
                Some(ConnEvent::Connected { .. }) | Some(ConnEvent::FileSent) => {}
                None => {
                    queue.user_cc(uid, None);
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snd_parsing() {
        let snd = parse_snd("CSND file TTH/AAAA 1048576 2097152").expect("parse");
        assert_eq!(snd.kind, "file");
        assert_eq!(snd.id, "TTH/AAAA");
        assert_eq!(snd.start, 1048576);
        assert_eq!(snd.len, 2097152);
        assert!(parse_snd("CGET file x 0 1").is_none());
        assert!(parse_snd("CSND file x 0").is_none());
        assert!(parse_snd("CSND file x 0 nan").is_none());
        assert!(parse_snd("CSND file x 0 1 extra").is_none());
    }

    #[test]
    fn sta_parsing() {
        assert_eq!(parse_sta("CSTA 0 ok"), Some((0, "ok".to_string())));
        assert_eq!(
            parse_sta("CSTA 151 File\\not\\available"),
            Some((151, "File not available".to_string()))
        );
        assert_eq!(parse_sta("CSND file x 0 1"), None);
    }

    #[test]
    fn request_formatting() {
        let digest = [0u8; 24];
        assert_eq!(
            fmt_tthl_request(&digest),
            b"CGET tthl TTH/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA 0 -1".to_vec()
        );
        let a = DlAssignment {
            uid: 1,
            tth: digest,
            islist: false,
            need_tthl: false,
            offset: 1 << 20,
            size: 4 << 20,
        };
        assert_eq!(
            fmt_file_request(&a),
            format!(
                "CGET file TTH/{} 1048576 3145728",
                "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
            )
            .into_bytes()
        );
        let l = DlAssignment {
            islist: true,
            ..a
        };
        assert_eq!(fmt_file_request(&l), b"CGET file files.xml.bz2 0 -1".to_vec());
    }
}
