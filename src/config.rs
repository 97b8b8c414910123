//! Configuration types for the conversion service.
//!
//! Everything the service needs is carried by [`ServiceConfig`], built via
//! [`ServiceConfigBuilder`]. The two core components only ever see already
//! validated values: the body spooler gets a [`SpoolPolicy`], the renderer a
//! [`RendererCommand`] plus limits.
//!
//! All values are immutable once the server starts; the config is cloned into
//! shared state at router construction.

use crate::error::PdfSvcError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Bodies at or below this many bytes (with a declared length) are spooled
/// in memory unless configured otherwise.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 32 * 1024;

/// Default maximum request body size.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1 << 20;

/// Default cap on renderer output kept in memory.
pub const DEFAULT_MAX_OUTPUT_SIZE: u64 = 64 << 20;

/// Process-wide request body spooling policy.
///
/// Zero means "unlimited" for `max_body_size` and `max_spool_files`, and
/// "wait until the caller gives up" for `spool_wait`. A zero
/// `memory_threshold` disables in-memory spooling entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolPolicy {
    /// Reject bodies larger than this with `413`. Default: 1 MiB.
    pub max_body_size: u64,

    /// Bodies with a declared length at or below this use a memory buffer.
    /// Default: 32 KiB.
    ///
    /// Chunked uploads never qualify, whatever their eventual size: without a
    /// declared length there is no way to size the buffer up front.
    pub memory_threshold: u64,

    /// Directory for transient spool files. `None` uses the system temp dir.
    pub spool_dir: Option<PathBuf>,

    /// Maximum number of spool files open at once. Default: unlimited.
    pub max_spool_files: usize,

    /// How long a request may queue for a spool slot. Default: indefinitely.
    #[serde(with = "duration_ms")]
    pub spool_wait: Duration,
}

impl Default for SpoolPolicy {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            spool_dir: None,
            max_spool_files: 0,
            spool_wait: Duration::ZERO,
        }
    }
}

impl SpoolPolicy {
    pub fn max_body_size(mut self, bytes: u64) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold = bytes;
        self
    }

    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Bound concurrently open spool files, queueing up to `wait` for a slot.
    pub fn file_limit(mut self, max_files: usize, wait: Duration) -> Self {
        self.max_spool_files = max_files;
        self.spool_wait = wait;
        self
    }
}

/// The external renderer invocation: program plus fixed arguments.
///
/// The renderer must read HTML from stdin and write the document to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendererCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for RendererCommand {
    fn default() -> Self {
        Self {
            program: "wkhtmltopdf".to_string(),
            args: [
                "--disable-javascript",
                "--disable-local-file-access",
                "--encoding",
                "utf8",
                "-q",
                "-",
                "-",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl RendererCommand {
    /// A renderer with the given program and no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Full service configuration.
///
/// Built via [`ServiceConfig::builder()`] or [`ServiceConfig::default()`].
///
/// # Example
/// ```rust
/// use pdfsvc::ServiceConfig;
/// use std::time::Duration;
///
/// let config = ServiceConfig::builder()
///     .procs(2)
///     .timeout(Duration::from_secs(10))
///     .token("secret")
///     .build()
///     .unwrap();
/// assert_eq!(config.procs, 2);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Listen address. Default: `localhost:8080`.
    pub addr: String,

    /// Maximum number of renderer processes running at once. Default: 3.
    ///
    /// Each permit is one live external process with its own memory and CPU
    /// appetite, so this stays small.
    pub procs: usize,

    /// Maximum time a single renderer run may take. Default: 5s.
    /// Zero leaves only the request deadline in charge.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Overall per-request deadline, covering spooling, queueing and
    /// rendering. Default: 60s. Zero disables it.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Bearer token clients must present. `None` disables the check.
    pub token: Option<String>,

    /// Log a diagnostic summary after every renderer run. Default: true.
    pub diagnostics: bool,

    /// Cap on renderer output held in memory. Default: 64 MiB. Zero = no cap.
    pub max_output_size: u64,

    /// Request body spooling policy.
    pub spool: SpoolPolicy,

    /// External renderer invocation.
    pub renderer: RendererCommand,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:8080".to_string(),
            procs: 3,
            timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            token: None,
            diagnostics: true,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            spool: SpoolPolicy::default(),
            renderer: RendererCommand::default(),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("addr", &self.addr)
            .field("procs", &self.procs)
            .field("timeout", &self.timeout)
            .field("request_timeout", &self.request_timeout)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("diagnostics", &self.diagnostics)
            .field("max_output_size", &self.max_output_size)
            .field("spool", &self.spool)
            .field("renderer", &self.renderer)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// JSON rendition for startup logging, with the token redacted.
    pub fn to_redacted_json(&self) -> String {
        let mut redacted = self.clone();
        if redacted.token.is_some() {
            redacted.token = Some("<redacted>".to_string());
        }
        serde_json::to_string(&redacted).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Values below one are clamped to one.
    pub fn procs(mut self, n: usize) -> Self {
        self.config.procs = n.max(1);
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.config.timeout = d;
        self
    }

    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.config.request_timeout = d;
        self
    }

    /// An empty token disables authentication.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.config.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn diagnostics(mut self, v: bool) -> Self {
        self.config.diagnostics = v;
        self
    }

    pub fn max_output_size(mut self, bytes: u64) -> Self {
        self.config.max_output_size = bytes;
        self
    }

    pub fn spool(mut self, policy: SpoolPolicy) -> Self {
        self.config.spool = policy;
        self
    }

    pub fn renderer(mut self, renderer: RendererCommand) -> Self {
        self.config.renderer = renderer;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, PdfSvcError> {
        let c = &self.config;
        if c.addr.trim().is_empty() {
            return Err(PdfSvcError::InvalidConfig("listen address is empty".into()));
        }
        if c.procs == 0 {
            return Err(PdfSvcError::InvalidConfig("procs must be ≥ 1".into()));
        }
        if c.renderer.program.trim().is_empty() {
            return Err(PdfSvcError::InvalidConfig(
                "renderer program is empty".into(),
            ));
        }
        if let Some(dir) = &c.spool.spool_dir {
            if !dir.is_dir() {
                return Err(PdfSvcError::InvalidConfig(format!(
                    "spool directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(self.config)
    }
}

/// Durations travel as integer milliseconds in serialised configs.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
