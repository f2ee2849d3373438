//! End-to-end download flows: a fake peer on a real TCP socket serves TTHL
//! and file data through the reduced client-client protocol, and the engine
//! verifies, finalizes and persists.

use rust_dc::cc;
use rust_dc::db::DbService;
use rust_dc::dl::{self, DlEvent};
use rust_dc::fl;
use rust_dc::hub::HubRegistry;
use rust_dc::net::{Conn, ConnEvent};
use rust_dc::tth::{self, TthContext, TthDigest};
use rust_dc::util::NetStats;
use rust_dc::vars::{Vars, HUB_GLOBAL};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const BLOCK: u64 = 1 << 20;

fn temp_dir(tag: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    p.push(format!("rust-dc-e2e-{tag}-{nanos}"));
    for sub in ["inc", "fl", "dl"] {
        std::fs::create_dir_all(p.join(sub)).expect("mkdir");
    }
    p
}

struct Engine {
    dir: PathBuf,
    svc: DbService,
    queue: dl::DlQueueHandle,
    events: tokio::sync::mpsc::UnboundedReceiver<DlEvent>,
}

async fn engine(tag: &str) -> Engine {
    let dir = temp_dir(tag);
    let svc = DbService::open(&dir.join("db.sqlite3")).expect("db");
    let vars = Arc::new(Vars::load(svc.handle(), dir.clone()).expect("vars"));
    vars.set(HUB_GLOBAL, "download_dir", dir.join("dl").to_str().unwrap())
        .expect("download_dir");
    let (hubs, _connect_rx) = HubRegistry::new();
    let (queue, events, _join) =
        dl::start_queue(svc.handle(), vars, Arc::new(hubs), &dir).await;
    Engine {
        dir,
        svc,
        queue,
        events,
    }
}

/// Reads one `\n`-terminated line from the peer socket.
async fn read_line(sock: &mut TcpStream, buf: &mut Vec<u8>) -> String {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if text.is_empty() {
                continue;
            }
            return text;
        }
        let mut chunk = [0u8; 4096];
        let n = sock.read(&mut chunk).await.expect("peer read");
        assert!(n > 0, "client closed unexpectedly");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Serves TTHL and ranged file data for one download, then keeps the
/// connection open.
async fn serve_file(mut sock: TcpStream, data: Vec<u8>, tthl: Vec<u8>) {
    let mut buf = Vec::new();
    loop {
        let line = read_line(&mut sock, &mut buf).await;
        let fields: Vec<&str> = line.split(' ').collect();
        match fields.as_slice() {
            ["CGET", "tthl", id, "0", "-1"] => {
                let head = format!("CSND tthl {id} 0 {}\n", tthl.len());
                sock.write_all(head.as_bytes()).await.expect("send head");
                sock.write_all(&tthl).await.expect("send tthl");
            }
            ["CGET", "file", id, off, len] => {
                let off: u64 = off.parse().expect("offset");
                let len: u64 = len.parse().expect("length");
                let range = &data[off as usize..(off + len) as usize];
                let head = format!("CSND file {id} {off} {len}\n");
                sock.write_all(head.as_bytes()).await.expect("send head");
                sock.write_all(range).await.expect("send data");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}

fn make_blocks(blocks: usize) -> (Vec<u8>, Vec<TthDigest>, TthDigest) {
    let data: Vec<u8> = (0..blocks * BLOCK as usize)
        .map(|i| (i % 251) as u8)
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

#[tokio::test]
async fn tth_verified_download_over_tcp() {
    let eng = engine("file").await;
    let (data, leaves, root) = make_blocks(4);
    let mut tthl = Vec::new();
    for l in &leaves {
        tthl.extend_from_slice(l);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let peer_data = data.clone();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.expect("accept");
        serve_file(sock, peer_data, tthl).await;
    });

    const UID: u64 = 0xabcd;
    assert!(eng.queue.add_file(UID, root, 4 * BLOCK, "big.bin").await);

    // Connect and hand the established session to the queue, as the hub
    // layer would after a handshake.
    let (conn, mut conn_events) = Conn::connect(addr, None, b'\n', NetStats::new());
    match tokio::time::timeout(Duration::from_secs(5), conn_events.recv())
        .await
        .expect("connect timeout")
        .expect("event")
    {
        ConnEvent::Connected { .. } => {}
        other => panic!("expected Connected, got {other:?}"),
    }
    let _session = cc::start_session(UID, conn, conn_events, eng.queue.clone());

    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    loop {
        if eng.queue.snapshot().await.records.is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for download completion"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let dest = eng.dir.join("dl/big.bin");
    assert_eq!(std::fs::read(&dest).expect("dest"), data);
    assert!(!eng
        .dir
        .join("inc")
        .join(tth::base32_encode(&root))
        .exists());
    let rows = eng
        .svc
        .handle()
        .query_rows(rust_dc::db::Query::DlListAll, vec![])
        .expect("rows");
    assert!(rows.is_empty());

    eng.queue.shutdown().await;
    eng.svc.shutdown();
    let _ = std::fs::remove_dir_all(&eng.dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_list_download_reports_ready() {
    let mut eng = engine("list").await;

    // The peer's share, serialized the way lists travel on the wire.
    let mut share = fl::FileTree::new();
    let d = share.create_dir("shared", false).unwrap();
    share.add(share.root(), d).unwrap();
    let f = share
        .create_file("track.mp3", 4242, Some([5u8; 24]), None)
        .unwrap();
    share.add(d, f).unwrap();
    let xml = fl::xml::serialize_filelist(&share, "peer 1.0");
    let packed = {
        use bzip2::write::BzEncoder;
        use std::io::Write as _;
        let mut enc = BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(xml.as_bytes()).expect("compress");
        enc.finish().expect("finish")
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let body = packed.clone();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let mut buf = Vec::new();
        let line = read_line(&mut sock, &mut buf).await;
        assert_eq!(line, "CGET file files.xml.bz2 0 -1");
        let head = format!("CSND file files.xml.bz2 0 {}\n", body.len());
        sock.write_all(head.as_bytes()).await.expect("head");
        sock.write_all(&body).await.expect("body");
        // Hold the socket open; the client disconnects on its own terms.
        let mut hold = [0u8; 16];
        let _ = sock.read(&mut hold).await;
    });

    const UID: u64 = 0x00feed;
    assert!(eng.queue.add_list(UID, true, false).await);
    let (conn, mut conn_events) = Conn::connect(addr, None, b'\n', NetStats::new());
    match tokio::time::timeout(Duration::from_secs(5), conn_events.recv())
        .await
        .expect("connect timeout")
        .expect("event")
    {
        ConnEvent::Connected { .. } => {}
        other => panic!("expected Connected, got {other:?}"),
    }
    let _session = cc::start_session(UID, conn, conn_events, eng.queue.clone());

    let ready = loop {
        match tokio::time::timeout(Duration::from_secs(20), eng.events.recv())
            .await
            .expect("list download timed out")
            .expect("events open")
        {
            DlEvent::ListReady {
                uid, path, open, ..
            } => break (uid, path, open),
            _ => continue,
        }
    };
    assert_eq!(ready.0, UID);
    assert!(ready.2, "open-after flag must be carried through");
    assert_eq!(
        ready.1,
        eng.dir.join("fl").join(format!("{UID:016x}.xml.bz2"))
    );
    let loaded = fl::xml::load_from_file(&ready.1).expect("parse downloaded list");
    let dir = loaded.find(loaded.root(), "shared", false).expect("dir");
    let track = loaded.find(dir, "track.mp3", true).expect("file");
    assert_eq!(loaded.node(track).size(), 4242);

    eng.queue.shutdown().await;
    eng.svc.shutdown();
    let _ = std::fs::remove_dir_all(&eng.dir);
}
