//! Wakeups for consumers that would rather sleep than spin.
//!
//! The rings themselves never block. A party that has nothing to do can park
//! on a [`Doorbell`] and have the far side ring it after publishing work. Each
//! side owns one end of a Unix datagram socketpair; a ring is a single byte.
//!
//! ```ignore
//! let (ours, theirs) = Doorbell::pair()?;
//! let pair = NotificationBufPair::attach_device_side(region, cap)?.with_doorbell(theirs);
//! ours.wait().await?;
//! ```

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// One end of a wakeup channel.
pub struct Doorbell {
    fd: AsyncFd<OwnedFd>,
}

impl Doorbell {
    /// Both ends, for two parties in the same process.
    ///
    /// Must be called from within a tokio runtime.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = socketpair(libc::SOCK_CLOEXEC)?;
        Ok((Self::from_owned(a)?, Self::from_owned(b)?))
    }

    /// Our end, plus a raw descriptor for a child process to inherit.
    ///
    /// The returned descriptor is not close-on-exec. Close it with
    /// [`close_peer_fd`] once the child has been spawned.
    pub fn pair_for_child() -> io::Result<(Self, RawFd)> {
        let (ours, theirs) = socketpair(0)?;
        Ok((Self::from_owned(ours)?, theirs.into_raw_fd()))
    }

    /// Wrap an inherited descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socketpair end that nothing else owns.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: ownership is transferred by the caller.
        Self::from_owned(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn from_owned(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd: AsyncFd::new(fd)? })
    }

    /// Wake the far side. Never blocks; if the socket buffer is full the far
    /// side has unread rings already, so the byte is dropped.
    pub fn signal(&self) {
        let byte = 1u8;
        // SAFETY: valid descriptor, one-byte buffer on the stack.
        let ret = unsafe {
            libc::send(
                self.as_raw_fd(),
                (&byte as *const u8).cast::<libc::c_void>(),
                1,
                libc::MSG_DONTWAIT,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %err, "doorbell signal failed");
            }
        }
    }

    /// Wait until the far side has rung at least once since the last wait.
    pub async fn wait(&self) -> io::Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            if self.drain() > 0 {
                return Ok(());
            }
            guard.clear_ready();
        }
    }

    /// Consume pending rings without waiting. Returns how many there were.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut rings = 0;
        loop {
            // SAFETY: valid descriptor and buffer.
            let ret = unsafe {
                libc::recv(
                    self.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            match ret {
                n if n > 0 => rings += 1,
                0 => break,
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::WouldBlock {
                        tracing::warn!(error = %err, "doorbell drain failed");
                    }
                    break;
                }
            }
        }
        rings
    }
}

impl AsRawFd for Doorbell {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doorbell").field("fd", &self.as_raw_fd()).finish()
    }
}

/// Close the child's end after spawning it.
pub fn close_peer_fd(fd: RawFd) {
    // SAFETY: the caller owns `fd` and does not use it afterwards.
    unsafe {
        libc::close(fd);
    }
}

fn socketpair(extra_flags: libc::c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for two descriptors.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | extra_flags,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair succeeded and we own both descriptors.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_ring_wakes_far_side() {
        let (a, b) = Doorbell::pair().unwrap();
        a.signal();
        tokio::time::timeout(Duration::from_millis(200), b.wait())
            .await
            .expect("doorbell never rang")
            .unwrap();

        b.signal();
        tokio::time::timeout(Duration::from_millis(200), a.wait())
            .await
            .expect("doorbell never rang")
            .unwrap();
    }

    #[tokio::test]
    async fn test_rings_coalesce() {
        let (a, b) = Doorbell::pair().unwrap();
        for _ in 0..5 {
            a.signal();
        }
        b.wait().await.unwrap();
        assert_eq!(b.drain(), 0);
    }

    #[tokio::test]
    async fn test_child_end_round_trip() {
        let (ours, raw) = Doorbell::pair_for_child().unwrap();
        let theirs = unsafe { Doorbell::from_raw_fd(raw) }.unwrap();
        theirs.signal();
        tokio::time::timeout(Duration::from_millis(200), ours.wait())
            .await
            .expect("doorbell never rang")
            .unwrap();
    }
}
