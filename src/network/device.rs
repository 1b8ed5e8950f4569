//! The tunnel device: a non-blocking descriptor carrying raw IP packets.

use std::fs::File;
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// A virtual network interface exchanging one IP packet per read or write.
pub trait TunnelDevice: Send {
    /// Read one packet into `buf`, returning its length.
    ///
    /// A return of `Ok(0)` means the tunnel was closed.
    fn read_packet(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write one packet.
    fn write_packet(&mut self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Tunnel device backed by a file descriptor handed over by the platform.
pub struct FdDevice {
    inner: AsyncFd<File>,
}

impl FdDevice {
    /// Take ownership of `fd` and register it with the reactor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        let inner = AsyncFd::with_interest(File::from(fd), Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { inner })
    }
}

impl AsRawFd for FdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl TunnelDevice for FdDevice {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(packet)) {
                Ok(result) => {
                    let written = result?;
                    if written != packet.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short tunnel write: {written} of {} bytes", packet.len()),
                        ));
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid open descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; only the O_NONBLOCK bit is added.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
