//! Renderer child processes, reaped together with their own resource usage.
//!
//! tokio's `Child` reaps with `waitpid` and throws the child's rusage away,
//! and `getrusage(RUSAGE_CHILDREN)` only ever grows and blends concurrent
//! renderers together. So the renderer is spawned with `std::process`, its
//! pipes are handed to tokio, and it is reaped here with `wait4`, which
//! reports the usage of exactly that process.
//!
//! On unix the reap happens in two steps: `waitid(WNOWAIT)` blocks until the
//! process has exited without reaping it, then `wait4` reaps it under the
//! same lock [`RendererProcess::start_kill`] takes. A pid is therefore never
//! signalled after it was reaped and possibly reused.

use crate::config::RendererCommand;
use crate::render::diagnostics::ResourceUsage;
use std::io;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::debug;

/// How a reaped renderer ended and what it cost.
#[derive(Debug, Clone, Copy)]
pub struct Exit {
    pub status: ExitStatus,
    pub usage: Option<ResourceUsage>,
}

/// A running renderer with async pipes.
///
/// Dropping it before [`wait`](Self::wait) or [`kill`](Self::kill) finished
/// kills the process and reaps it in the background.
pub struct RendererProcess {
    pid: u32,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    handle: Arc<sys::Handle>,
}

impl RendererProcess {
    /// Start `command` with all three standard streams piped.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(command: &RendererCommand) -> io::Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // From here on, an early return kills and reaps through Drop.
        let mut process = Self {
            pid: child.id(),
            stdin: None,
            stdout: None,
            stderr: None,
            handle: Arc::new(sys::Handle::new(child)),
        };
        process.stdin = stdin.map(ChildStdin::from_std).transpose()?;
        process.stdout = stdout.map(ChildStdout::from_std).transpose()?;
        process.stderr = stderr.map(ChildStderr::from_std).transpose()?;
        Ok(process)
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Send SIGKILL unless the process was already reaped.
    pub fn start_kill(&self) {
        if let Err(e) = self.handle.kill() {
            debug!(pid = self.pid, error = %e, "renderer kill");
        }
    }

    /// Wait for the process to exit and reap it.
    pub async fn wait(&self) -> io::Result<Exit> {
        let handle = Arc::clone(&self.handle);
        tokio::task::spawn_blocking(move || handle.reap())
            .await
            .map_err(io::Error::other)?
    }

    /// Kill the process and reap it.
    pub async fn kill(&self) -> io::Result<Exit> {
        self.start_kill();
        self.wait().await
    }
}

impl Drop for RendererProcess {
    fn drop(&mut self) {
        if self.handle.is_reaped() {
            return;
        }
        self.start_kill();
        let handle = Arc::clone(&self.handle);
        let reap = move || {
            let _ = handle.reap();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn_blocking(reap);
            }
            Err(_) => {
                std::thread::spawn(reap);
            }
        }
    }
}

#[cfg(unix)]
mod sys {
    use super::Exit;
    use crate::render::diagnostics::ResourceUsage;
    use std::io;
    use std::mem::MaybeUninit;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Child, ExitStatus};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    pub(super) struct Handle {
        pid: libc::pid_t,
        reaped: Mutex<bool>,
    }

    impl Handle {
        pub(super) fn new(child: Child) -> Self {
            // `Child` holds nothing but the pid once its pipes are taken.
            Self {
                pid: child.id() as libc::pid_t,
                reaped: Mutex::new(false),
            }
        }

        fn lock(&self) -> MutexGuard<'_, bool> {
            self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(super) fn is_reaped(&self) -> bool {
            *self.lock()
        }

        pub(super) fn kill(&self) -> io::Result<()> {
            let reaped = self.lock();
            if *reaped {
                return Ok(());
            }
            // SAFETY: the pid is still our unreaped child (alive or zombie),
            // and `reaped` stays locked until the signal is sent.
            if unsafe { libc::kill(self.pid, libc::SIGKILL) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Block until the process exits, then reap it.
        pub(super) fn reap(&self) -> io::Result<Exit> {
            let mut info = MaybeUninit::<libc::siginfo_t>::zeroed();
            loop {
                // SAFETY: `info` is writable memory of the right size.
                let rc = unsafe {
                    libc::waitid(
                        libc::P_PID,
                        self.pid as libc::id_t,
                        info.as_mut_ptr(),
                        libc::WEXITED | libc::WNOWAIT,
                    )
                };
                if rc == 0 {
                    break;
                }
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e);
                }
            }

            let mut reaped = self.lock();
            if *reaped {
                return Err(io::Error::other("renderer already reaped"));
            }
            let mut raw = 0;
            let mut ru = MaybeUninit::<libc::rusage>::zeroed();
            loop {
                // SAFETY: both out-pointers are valid; the child has exited,
                // so this returns at once.
                let rc = unsafe { libc::wait4(self.pid, &mut raw, 0, ru.as_mut_ptr()) };
                if rc == self.pid {
                    break;
                }
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e);
                }
            }
            *reaped = true;
            // SAFETY: filled in by the successful wait4 above.
            let ru = unsafe { ru.assume_init() };
            Ok(Exit {
                status: ExitStatus::from_raw(raw),
                usage: Some(ResourceUsage::from_rusage(&ru)),
            })
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use super::Exit;
    use std::io;
    use std::process::Child;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    pub(super) struct Handle {
        child: Mutex<Child>,
    }

    impl Handle {
        pub(super) fn new(child: Child) -> Self {
            Self {
                child: Mutex::new(child),
            }
        }

        fn lock(&self) -> MutexGuard<'_, Child> {
            self.child.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(super) fn is_reaped(&self) -> bool {
            matches!(self.lock().try_wait(), Ok(Some(_)) | Err(_))
        }

        pub(super) fn kill(&self) -> io::Result<()> {
            let mut child = self.lock();
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            child.kill()
        }

        pub(super) fn reap(&self) -> io::Result<Exit> {
            loop {
                if let Some(status) = self.lock().try_wait()? {
                    return Ok(Exit {
                        status,
                        usage: None,
                    });
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
