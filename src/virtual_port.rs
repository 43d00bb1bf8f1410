//! Virtual serial ports backed by pseudo terminals.
//!
//! A virtual port is a pty pair.
//! We keep the master side and write to it, consumers open the slave side.
//! The slave is reachable via a symlink at the endpoint path, e.g. `/dev/gps0 -> /dev/pts/3`.
//!
//! Both sides are driven through [`AsyncTty`], a non-blocking file registered with the runtime.
//! A full pty buffer therefore parks only the task writing to it.

use std::{
    fs::{File, OpenOptions, Permissions},
    io::{self, Read, Write},
    os::unix::{
        fs::{OpenOptionsExt, PermissionsExt},
        io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    },
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use futures::ready;
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    pty::openpty,
    sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg},
    unistd::ttyname,
};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::{broadcast::SinkFactory, endpoint::EndpointSpec, error::Error};

/// Any local process may open the virtual port.
const PERMISSIVE: u32 = 0o666;

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

    Ok(())
}

fn set_raw(fd: RawFd) -> nix::Result<()> {
    let mut termios = tcgetattr(fd)?;
    cfmakeraw(&mut termios);
    tcsetattr(fd, SetArg::TCSANOW, &termios)
}

/// A tty (or any pollable file) in non-blocking mode, usable from async code.
#[derive(Debug)]
pub struct AsyncTty {
    inner: AsyncFd<File>,
}

impl AsyncTty {
    /// Wrap a file.
    /// It is switched to non-blocking mode.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(file: File) -> io::Result<Self> {
        set_nonblocking(file.as_raw_fd())?;

        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }

    /// Open a tty by path for reading, as a consumer would.
    ///
    /// A missing path is [`Error::EndpointUnavailable`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::EndpointUnavailable(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        Ok(Self::new(file)?)
    }
}

impl AsyncRead for AsyncTty {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                // The other side of the pty is gone, which we treat as end of stream.
                Ok(Err(e)) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                    return Poll::Ready(Ok(()))
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for AsyncTty {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// One virtual serial port.
///
/// Writing to it makes the bytes readable by whoever opened [`VirtualPort::link`].
#[derive(Debug)]
pub struct VirtualPort {
    link: PathBuf,
    slave_path: PathBuf,

    master: AsyncTty,

    // Held open for as long as the port lives.
    // Otherwise the pty is torn down when the last consumer detaches,
    // and writes to the master start failing.
    _slave: OwnedFd,
}

impl VirtualPort {
    /// Allocate a pty pair in raw mode, open it up to everyone, and link it at `link`.
    ///
    /// Whatever is at `link` already is not removed here, see [`crate::provision`].
    pub fn allocate<P: AsRef<Path>>(link: P) -> io::Result<Self> {
        let link = link.as_ref().to_path_buf();

        let pty = openpty(None, None)?;

        // Safety: `openpty` just handed us these, nothing else owns them.
        let (master, slave) = unsafe {
            (
                OwnedFd::from_raw_fd(pty.master),
                OwnedFd::from_raw_fd(pty.slave),
            )
        };

        set_raw(slave.as_raw_fd())?;

        let slave_path = ttyname(slave.as_raw_fd())?;

        if let Err(e) = std::fs::set_permissions(&slave_path, Permissions::from_mode(PERMISSIVE)) {
            warn!(?slave_path, ?e, "Could not open up permissions of virtual port");
        }

        std::os::unix::fs::symlink(&slave_path, &link)?;
        debug!(?link, ?slave_path, "Virtual port allocated");

        Ok(Self {
            link,
            slave_path,
            master: AsyncTty::new(File::from(master))?,
            _slave: slave,
        })
    }

    /// The stable path consumers open.
    pub fn link(&self) -> &Path {
        &self.link
    }

    /// The pty slave the link points at, e.g. `/dev/pts/3`.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Remove the link, if it still points at our slave.
    pub fn remove_link(&self) -> io::Result<()> {
        match std::fs::read_link(&self.link) {
            Ok(target) if target == self.slave_path => std::fs::remove_file(&self.link),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsyncWrite for VirtualPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.master).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.master).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.master).poll_shutdown(cx)
    }
}

/// Allocates a [`VirtualPort`] per endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtyFactory {
    /// Remove the link when the port is dropped.
    pub remove_on_drop: bool,
}

impl SinkFactory for PtyFactory {
    type Sink = PtyPort;

    fn allocate(&self, endpoint: &EndpointSpec) -> Result<Self::Sink, Error> {
        let port = VirtualPort::allocate(&endpoint.path).map_err(|e| Error::Provision {
            id: endpoint.id,
            path: endpoint.path.clone(),
            problem: e.to_string(),
        })?;

        Ok(PtyPort {
            port,
            remove_on_drop: self.remove_on_drop,
        })
    }
}

/// A [`VirtualPort`] as handed to a worker.
/// Optionally cleans up its link once the worker is done with it.
#[derive(Debug)]
pub struct PtyPort {
    port: VirtualPort,
    remove_on_drop: bool,
}

impl Drop for PtyPort {
    fn drop(&mut self) {
        if self.remove_on_drop {
            match self.port.remove_link() {
                Ok(()) => debug!(link = ?self.port.link(), "Removed link"),
                Err(e) => warn!(link = ?self.port.link(), ?e, "Could not remove link"),
            }
        }
    }
}

impl AsyncWrite for PtyPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.port).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_shutdown(cx)
    }
}
