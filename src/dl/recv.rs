//! Block-by-block receipt of download data: writes to the incoming file,
//! keeps the running Tiger-tree context for the block in flight, verifies
//! each completed block and rolls back to the last good block boundary on a
//! mismatch.

use crate::tth::{TthContext, TthDigest};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Per-transfer receive state. The incoming file descriptor is owned here;
/// nothing else writes to it while a transfer runs.
#[derive(Debug)]
pub struct ReceiveContext {
    pub uid: u64,
    file: File,
    pub have: u64,
    size: u64,
    hash_block: u64,
    islist: bool,
    root: TthDigest,
    /// TTHL leaves; `None` for files below the TTHL threshold, which verify
    /// against the root instead.
    leaves: Option<Vec<TthDigest>>,
    ctx: TthContext,
    fadvise_dropped: u64,
    flush_cache: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// More data expected.
    Progress,
    /// `have == size`; ready for finalization. Never returned for lists.
    Complete,
    /// A block failed verification; `have` has been rewound to the start of
    /// that block and the incoming file truncated there.
    HashMismatch { block: u32 },
}

impl ReceiveContext {
    /// Opens (creating if needed) the incoming file positioned at `have`.
    /// `have` must sit on a block boundary.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        uid: u64,
        inc: &Path,
        have: u64,
        size: u64,
        hash_block: u64,
        islist: bool,
        root: TthDigest,
        leaves: Option<Vec<TthDigest>>,
        flush_cache: bool,
    ) -> std::io::Result<Self> {
        debug_assert!(islist || hash_block == 0 || have % hash_block == 0);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(inc)
            .await?;
        file.seek(SeekFrom::Start(have)).await?;
        Ok(Self {
            uid,
            file,
            have,
            size,
            hash_block,
            islist,
            root,
            leaves,
            ctx: TthContext::new(),
            fadvise_dropped: 0,
            flush_cache,
        })
    }

    fn expected_block_hash(&self, block: u64) -> Option<&TthDigest> {
        match &self.leaves {
            None => (block == 0).then_some(&self.root),
            Some(leaves) => leaves.get(block as usize),
        }
    }

    /// Ingests one received chunk. An `Err` is an incoming-file I/O problem
    /// (`IOIncoming` at the call site).
    pub async fn receive(&mut self, data: &[u8]) -> std::io::Result<RecvOutcome> {
        if self.have + data.len() as u64 > self.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "more data than the remaining file range",
            ));
        }
        self.file.write_all(data).await?;

        if self.islist {
            self.have += data.len() as u64;
            return Ok(RecvOutcome::Progress);
        }

        let mut rest = data;
        while !rest.is_empty() {
            let block = self.have / self.hash_block;
            let in_block = self.have % self.hash_block;
            let take = ((self.hash_block - in_block).min(rest.len() as u64)) as usize;
            self.ctx.update(&rest[..take]);
            self.have += take as u64;
            rest = &rest[take..];

            let boundary = self.have % self.hash_block == 0;
            let at_end = self.have == self.size;
            if boundary || at_end {
                let digest = std::mem::take(&mut self.ctx).finish();
                let ok = self
                    .expected_block_hash(block)
                    .is_some_and(|want| *want == digest);
                if !ok {
                    let rewind = block * self.hash_block;
                    self.rollback(rewind).await?;
                    return Ok(RecvOutcome::HashMismatch {
                        block: block as u32,
                    });
                }
                self.drop_cache_hint();
            }
        }

        if self.have == self.size {
            Ok(RecvOutcome::Complete)
        } else {
            Ok(RecvOutcome::Progress)
        }
    }

    /// Rewinds to `offset` (a block boundary), truncating everything after
    /// it so the next attempt can resume cleanly.
    async fn rollback(&mut self, offset: u64) -> std::io::Result<()> {
        self.have = offset;
        self.ctx = TthContext::new();
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.set_len(offset).await?;
        Ok(())
    }

    /// Called when the transfer stops mid-block (disconnect, abort): rounds
    /// `have` down to the last block boundary and truncates, restoring the
    /// at-rest invariant.
    pub async fn abort_to_boundary(&mut self) -> std::io::Result<u64> {
        if !self.islist && self.hash_block > 0 {
            let aligned = self.have - self.have % self.hash_block;
            if aligned != self.have {
                self.rollback(aligned).await?;
            }
        }
        self.file.flush().await?;
        Ok(self.have)
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    /// Hints the kernel to drop cached pages for verified data when the user
    /// asked for it.
    fn drop_cache_hint(&mut self) {
        if !self.flush_cache || self.have <= self.fadvise_dropped {
            return;
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let len = (self.have - self.fadvise_dropped) as libc::off_t;
            let start = self.fadvise_dropped as libc::off_t;
            unsafe {
                libc::posix_fadvise(
                    self.file.as_raw_fd(),
                    start,
                    len,
                    libc::POSIX_FADV_DONTNEED,
                );
            }
        }
        self.fadvise_dropped = self.have;
    }
}

/// Re-seeds a receive context from an existing incoming file at startup:
/// rounds the file down to whole blocks, re-hashes the last whole block and
/// verifies it. Returns the resume offset, or the failed block on a stored
/// mismatch (the file is truncated to just before it).
pub async fn resume_offset(
    inc: &Path,
    size: u64,
    hash_block: u64,
    root: &TthDigest,
    leaves: Option<&[TthDigest]>,
) -> std::io::Result<Result<u64, u32>> {
    let meta = match tokio::fs::metadata(inc).await {
        Ok(m) => m,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Ok(0)),
        Err(err) => return Err(err),
    };
    let on_disk = meta.len().min(size);
    let mut have = on_disk - on_disk % hash_block;
    let file = OpenOptions::new().read(true).write(true).open(inc).await?;
    if meta.len() != have {
        file.set_len(have).await?;
    }
    if have == 0 {
        return Ok(Ok(0));
    }

    // Verify the last whole block against the stored hashes.
    let block = have / hash_block - 1;
    let start = block * hash_block;
    let mut ctx = TthContext::new();
    let mut reader = file;
    reader.seek(SeekFrom::Start(start)).await?;
    let mut left = have - start;
    let mut buf = vec![0u8; 64 * 1024];
    use tokio::io::AsyncReadExt;
    while left > 0 {
        let want = (left.min(buf.len() as u64)) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
        left -= n as u64;
    }
    let digest = ctx.finish();
    let expect = match leaves {
        None => (block == 0).then_some(root),
        Some(ls) => ls.get(block as usize),
    };
    if expect.is_some_and(|want| *want == digest) {
        Ok(Ok(have))
    } else {
        have = start;
        reader.set_len(have).await?;
        Ok(Err(block as u32))
    }
}
