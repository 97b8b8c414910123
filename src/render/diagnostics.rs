//! Human-readable renderer diagnostics.
//!
//! A finished renderer run is summarised as a [`ConversionReport`]: why the
//! process ended, how long it took and what it cost. The summary is for
//! operators only and never reaches an HTTP response.
//!
//! Exit reasons follow the shell convention: a normal exit is reported as
//! `exit code N`, a death by signal `S` as `exit code 128+S (name)`.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

/// Translate an exit status into `exit code N` or `exit code 128+S (name)`.
pub fn exit_reason(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(sig) = status.signal() {
            return format!("exit code {} ({})", 128 + sig, signal_name(sig));
        }
    }
    status.to_string()
}

/// Short description of a signal, in the style of `strsignal(3)`.
#[cfg(unix)]
pub fn signal_name(sig: i32) -> String {
    let name = match sig {
        libc::SIGHUP => "hangup",
        libc::SIGINT => "interrupt",
        libc::SIGQUIT => "quit",
        libc::SIGILL => "illegal instruction",
        libc::SIGABRT => "aborted",
        libc::SIGBUS => "bus error",
        libc::SIGFPE => "floating point exception",
        libc::SIGKILL => "killed",
        libc::SIGSEGV => "segmentation fault",
        libc::SIGPIPE => "broken pipe",
        libc::SIGALRM => "alarm clock",
        libc::SIGTERM => "terminated",
        libc::SIGXCPU => "CPU time limit exceeded",
        libc::SIGXFSZ => "file size limit exceeded",
        _ => return format!("signal {sig}"),
    };
    name.to_string()
}

#[cfg(not(unix))]
pub fn signal_name(sig: i32) -> String {
    format!("signal {sig}")
}

/// Byte count printed with binary units and two decimals (`1.50MB`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 6] = ["KB", "MB", "GB", "TB", "PB", "EB"];
        let mut value = self.0 as f64;
        let mut unit = None;
        for u in UNITS {
            if value < 1024.0 {
                break;
            }
            value /= 1024.0;
            unit = Some(u);
        }
        match unit {
            Some(u) => write!(f, "{value:.2}{u}"),
            None => write!(f, "{:.2}B", self.0 as f64),
        }
    }
}

/// Duration rounded to milliseconds, e.g. `1.234s`, `15ms`, `0s`.
pub fn fmt_duration(d: Duration) -> String {
    let ms = (d.as_micros() + 500) / 1000;
    match ms {
        0 => "0s".to_string(),
        ms if ms < 1000 => format!("{ms}ms"),
        ms => {
            let secs = ms as f64 / 1000.0;
            let s = format!("{secs:.3}");
            format!("{}s", s.trim_end_matches('0').trim_end_matches('.'))
        }
    }
}

/// CPU time and peak memory of one renderer process.
///
/// Filled from the `rusage` that `wait4` returns when the process is reaped,
/// so it covers that process and whatever descendants it waited for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user: Duration,
    pub system: Duration,
    pub max_rss: Option<u64>,
}

impl ResourceUsage {
    #[cfg(unix)]
    pub fn from_rusage(ru: &libc::rusage) -> Self {
        Self {
            user: timeval(ru.ru_utime),
            system: timeval(ru.ru_stime),
            max_rss: Some(max_rss_bytes(ru.ru_maxrss)),
        }
    }
}

#[cfg(unix)]
fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

// Linux reports kilobytes, macOS bytes.
#[cfg(all(unix, target_os = "macos"))]
fn max_rss_bytes(raw: libc::c_long) -> u64 {
    raw.max(0) as u64
}

#[cfg(all(unix, not(target_os = "macos")))]
fn max_rss_bytes(raw: libc::c_long) -> u64 {
    (raw.max(0) as u64) << 10
}

impl fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sys: {}, user: {}",
            fmt_duration(self.system),
            fmt_duration(self.user)
        )?;
        if let Some(rss) = self.max_rss {
            write!(f, ", maxRSS: {}", ByteSize(rss))?;
        }
        Ok(())
    }
}

/// How a renderer run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited; carries the translated exit reason.
    Exited { success: bool, reason: String },
    /// Killed because the deadline passed.
    TimedOut,
    /// Killed because the request was cancelled.
    Cancelled,
    /// Killed because its output went over the cap.
    OutputCapped,
    /// Never started.
    SpawnFailed(String),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Exited { reason, .. } => f.write_str(reason),
            RunOutcome::TimedOut => f.write_str("killed after deadline"),
            RunOutcome::Cancelled => f.write_str("killed on cancellation"),
            RunOutcome::OutputCapped => f.write_str("killed for oversized output"),
            RunOutcome::SpawnFailed(e) => write!(f, "spawn failed: {e}"),
        }
    }
}

/// Summary of one renderer run.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub program: String,
    pub pid: Option<u32>,
    pub outcome: RunOutcome,
    pub wall: Duration,
    pub usage: Option<ResourceUsage>,
    pub input_bytes: u64,
    pub output_bytes: u64,
    /// Leading bytes of the renderer's stderr, lossily decoded.
    pub stderr: String,
}

impl ConversionReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Exited { success: true, .. })
    }
}

impl fmt::Display for ConversionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / wall: {}", self.outcome, fmt_duration(self.wall))?;
        match &self.usage {
            Some(usage) => write!(f, ", {usage}"),
            None => f.write_str(", n/a"),
        }
    }
}
