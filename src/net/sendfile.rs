//! Kernel-assisted file-to-socket copy. The caller falls back to a plain
//! read+write loop when the fast path is unavailable.

use tokio::fs::File;
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum SendfileError {
    /// The kernel (or platform) cannot sendfile here; nothing was sent.
    Unsupported,
    Io(std::io::Error),
}

/// Copies up to `len` bytes of `file` starting at `offset` into the socket.
/// Returns the number of bytes actually sent, which may be short when the
/// file ends early. `Unsupported` is only returned before any byte went out.
#[cfg(target_os = "linux")]
pub async fn send(
    tcp: &TcpStream,
    file: &mut File,
    offset: u64,
    len: u64,
) -> Result<u64, SendfileError> {
    use std::os::unix::io::AsRawFd;

    let file_fd = file.as_raw_fd();
    let mut sent: u64 = 0;
    while sent < len {
        tcp.writable().await.map_err(SendfileError::Io)?;
        let want = (len - sent).min(1 << 20) as usize;
        let result = tcp.try_io(tokio::io::Interest::WRITABLE, || {
            let mut off = (offset + sent) as libc::off_t;
            let n = unsafe { libc::sendfile(tcp.as_raw_fd(), file_fd, &mut off, want) };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as u64)
            }
        });
        match result {
            Ok(0) => break, // file ended before the range
            Ok(n) => sent += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                let unsupported = matches!(
                    err.raw_os_error(),
                    Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
                );
                if unsupported && sent == 0 {
                    return Err(SendfileError::Unsupported);
                }
                return Err(SendfileError::Io(err));
            }
        }
    }
    Ok(sent)
}

#[cfg(not(target_os = "linux"))]
pub async fn send(
    _tcp: &TcpStream,
    _file: &mut File,
    _offset: u64,
    _len: u64,
) -> Result<u64, SendfileError> {
    Err(SendfileError::Unsupported)
}
