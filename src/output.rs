//! Native output suppression.
//!
//! While a [`NativeOutputGuard`] is alive, the process's stdout points at the
//! null device. Stderr is left alone so log lines keep flowing, and protocol
//! traffic uses its own socket.

use anyhow::Result;

pub struct NativeOutputGuard {
    #[cfg(unix)]
    saved: Option<i32>,
}

#[cfg(unix)]
impl NativeOutputGuard {
    pub fn suppress() -> Result<Self> {
        use anyhow::Context;
        use std::io::Write;

        let _ = std::io::stdout().flush();

        let null = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .context("Failed to open /dev/null")?;

        let fd = libc::STDOUT_FILENO;
        // SAFETY: `fd` is a standard descriptor.
        let saved = unsafe { libc::dup(fd) };
        if saved < 0 {
            return Err(std::io::Error::last_os_error())
                .context("Failed to duplicate stdout");
        }
        let null_fd = std::os::unix::io::AsRawFd::as_raw_fd(&null);
        // SAFETY: both descriptors are valid and `null` outlives the call.
        if unsafe { libc::dup2(null_fd, fd) } < 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: `saved` came from dup above.
            unsafe { libc::close(saved) };
            return Err(err).context("Failed to redirect stdout to /dev/null");
        }
        tracing::debug!("native output suppressed");
        Ok(Self { saved: Some(saved) })
    }
}

#[cfg(unix)]
impl Drop for NativeOutputGuard {
    fn drop(&mut self) {
        use std::io::Write;

        let _ = std::io::stdout().flush();
        if let Some(saved) = self.saved.take() {
            // SAFETY: `saved` is a descriptor this guard owns.
            unsafe {
                libc::dup2(saved, libc::STDOUT_FILENO);
                libc::close(saved);
            }
        }
    }
}

#[cfg(not(unix))]
impl NativeOutputGuard {
    pub fn suppress() -> Result<Self> {
        tracing::warn!("native output suppression is only supported on unix");
        Ok(Self {})
    }
}

/// Suppress native output when `enabled`.
pub fn suppress_if(enabled: bool) -> Result<Option<NativeOutputGuard>> {
    if enabled {
        NativeOutputGuard::suppress().map(Some)
    } else {
        Ok(None)
    }
}
