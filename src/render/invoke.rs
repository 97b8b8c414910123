//! Run the external renderer as a supervised subprocess.
//!
//! The renderer reads HTML on stdin and writes the finished document to
//! stdout. While it runs, three streams are pumped at once (input in, output
//! and stderr out) and the whole run races the request context. Whatever
//! ends the run (exit, deadline, cancellation, oversized output, bad input),
//! the process is killed if still alive and always reaped before returning.
//!
//! ## Why cap stdout?
//!
//! The document is collected in memory before the response is written. An
//! uncapped read would let one pathological input consume unbounded memory,
//! so stdout goes through the same size-limited copy as request bodies.

use crate::config::RendererCommand;
use crate::context::{ContextError, RequestContext};
use crate::error::PdfSvcError;
use crate::render::diagnostics::{exit_reason, ConversionReport, ResourceUsage, RunOutcome};
use crate::render::gate::ConversionPermit;
use crate::render::observer::ObserverRef;
use crate::render::process::RendererProcess;
use crate::spool::copy::copy_limited;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::debug;

/// Stderr bytes kept for diagnostics. The rest is read and discarded.
const STDERR_KEEP: usize = 4 * 1024;

/// Renderer invocation plus its per-run limits.
pub struct Renderer {
    command: RendererCommand,
    max_duration: Duration,
    max_output: u64,
    observer: Option<ObserverRef>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("command", &self.command)
            .field("max_duration", &self.max_duration)
            .field("max_output", &self.max_output)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Everything collected from a run that reached `wait()`.
struct Drained {
    status: ExitStatus,
    usage: Option<ResourceUsage>,
    stdout: Vec<u8>,
    exceeded: bool,
    stderr: Vec<u8>,
    input_bytes: u64,
    input_error: Option<io::Error>,
}

impl Renderer {
    /// No duration limit, no output cap, no observer.
    pub fn new(command: RendererCommand) -> Self {
        Self {
            command,
            max_duration: Duration::ZERO,
            max_output: 0,
            observer: None,
        }
    }

    /// Longest a single run may take. Zero leaves only the caller's deadline.
    pub fn max_duration(mut self, d: Duration) -> Self {
        self.max_duration = d;
        self
    }

    /// Largest output accepted, in bytes. Zero means no cap.
    pub fn max_output(mut self, bytes: u64) -> Self {
        self.max_output = bytes;
        self
    }

    pub fn observer(mut self, observer: ObserverRef) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Render `input` and return the renderer's stdout.
    ///
    /// The permit is only borrowed: holding one is the caller's proof of
    /// admission, and it is released when the caller drops it.
    ///
    /// The effective deadline is the tighter of `ctx`'s and `max_duration`.
    pub async fn run<S>(
        &self,
        _permit: &ConversionPermit,
        input: S,
        ctx: &RequestContext,
    ) -> Result<Bytes, PdfSvcError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        let ctx = ctx.clone().with_timeout(self.max_duration);
        if let Some(why) = ctx.err() {
            return Err(why.into());
        }

        let program = self.command.program.as_str();
        let started = Instant::now();

        let mut child = match RendererProcess::spawn(&self.command) {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("cannot start {program}: {e}");
                self.report(ConversionReport {
                    program: program.to_string(),
                    pid: None,
                    outcome: RunOutcome::SpawnFailed(e.to_string()),
                    wall: started.elapsed(),
                    usage: None,
                    input_bytes: 0,
                    output_bytes: 0,
                    stderr: String::new(),
                });
                return Err(PdfSvcError::ProcessFailure { reason });
            }
        };
        let pid = Some(child.id());
        debug!(program, ?pid, "renderer started");
        if let Some(observer) = &self.observer {
            observer.on_conversion_start(program, pid);
        }

        let run = tokio::select! {
            res = drive(&mut child, input, self.max_output) => Ok(res),
            why = ctx.done() => Err(why),
        };

        let mut report = ConversionReport {
            program: program.to_string(),
            pid,
            outcome: RunOutcome::Cancelled,
            wall: Duration::ZERO,
            usage: None,
            input_bytes: 0,
            output_bytes: 0,
            stderr: String::new(),
        };

        let result = match run {
            Ok(Ok(drained)) => {
                report.input_bytes = drained.input_bytes;
                report.output_bytes = drained.stdout.len() as u64;
                report.stderr = String::from_utf8_lossy(&drained.stderr).into_owned();
                report.usage = drained.usage;
                self.settle(drained, &mut report)
            }
            Ok(Err(e)) => {
                // Pipe plumbing failed; the process may still be running.
                report.usage = reap(&child).await;
                report.outcome = RunOutcome::Exited {
                    success: false,
                    reason: e.to_string(),
                };
                Err(PdfSvcError::ProcessFailure {
                    reason: format!("renderer i/o: {e}"),
                })
            }
            Err(why) => {
                report.usage = reap(&child).await;
                report.outcome = match why {
                    ContextError::DeadlineExceeded => RunOutcome::TimedOut,
                    ContextError::Cancelled => RunOutcome::Cancelled,
                };
                debug!(?why, ?pid, "renderer killed");
                Err(why.into())
            }
        };

        report.wall = started.elapsed();
        self.report(report);
        result
    }

    /// Turn a completed run into a result, filling in the outcome.
    fn settle(
        &self,
        drained: Drained,
        report: &mut ConversionReport,
    ) -> Result<Bytes, PdfSvcError> {
        let reason = exit_reason(&drained.status);
        let success = drained.status.success();

        if let Some(e) = drained.input_error {
            report.outcome = RunOutcome::Exited { success, reason };
            return Err(PdfSvcError::storage("renderer input", e));
        }
        if drained.exceeded {
            report.outcome = RunOutcome::OutputCapped;
            return Err(PdfSvcError::OutputTooLarge {
                limit: self.max_output,
            });
        }
        report.outcome = RunOutcome::Exited {
            success,
            reason: reason.clone(),
        };
        if !success {
            return Err(PdfSvcError::ProcessFailure { reason });
        }
        Ok(Bytes::from(drained.stdout))
    }

    fn report(&self, report: ConversionReport) {
        if let Some(observer) = &self.observer {
            observer.on_conversion_finished(&report);
        }
    }
}

/// Pump the child's pipes until its output streams close, then wait for it.
async fn drive<S>(child: &mut RendererProcess, input: S, max_output: u64) -> io::Result<Drained>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("renderer stdout not captured"))?;
    let mut input_bytes = 0u64;
    let mut feed = Box::pin(feed_stdin(child.stdin.take(), input, &mut input_bytes));
    let mut out = Box::pin(collect_stdout(stdout, max_output));
    let mut err = Box::pin(collect_stderr(child.stderr.take()));

    let mut fed: Option<Option<io::Error>> = None;
    let mut collected: Option<io::Result<(Vec<u8>, bool)>> = None;
    let mut stderr: Option<Vec<u8>> = None;

    while collected.is_none() || stderr.is_none() {
        tokio::select! {
            res = &mut feed, if fed.is_none() => {
                if res.is_some() {
                    // Bad input; don't let the renderer finish on a truncated document.
                    child.start_kill();
                }
                fed = Some(res);
            }
            res = &mut out, if collected.is_none() => {
                if !matches!(res, Ok((_, false))) {
                    child.start_kill();
                }
                collected = Some(res);
            }
            res = &mut err, if stderr.is_none() => stderr = Some(res),
        }
    }
    // The renderer stopped writing; anything not yet fed is moot.
    drop(feed);

    let exit = child.wait().await?;
    let (stdout, exceeded) = collected.unwrap_or_else(|| Ok((Vec::new(), false)))?;
    Ok(Drained {
        status: exit.status,
        usage: exit.usage,
        stdout,
        exceeded,
        stderr: stderr.unwrap_or_default(),
        input_bytes,
        input_error: fed.flatten(),
    })
}

/// Write `input` to the renderer's stdin, closing it at the end.
///
/// Returns the input stream's error, if any. Write failures are not errors
/// here: a renderer that stops reading has exited or is about to, and its
/// exit status tells the story.
async fn feed_stdin<S>(
    stdin: Option<ChildStdin>,
    mut input: S,
    fed: &mut u64,
) -> Option<io::Error>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut stdin = stdin?;
    while let Some(chunk) = input.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Some(e),
        };
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!(error = %e, "renderer stopped reading input");
            return None;
        }
        *fed += chunk.len() as u64;
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "closing renderer input");
    }
    None
}

async fn collect_stdout(mut stdout: ChildStdout, max_output: u64) -> io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    if max_output == 0 {
        stdout.read_to_end(&mut buf).await?;
        return Ok((buf, false));
    }
    let outcome = copy_limited(&mut stdout, &mut buf, max_output).await?;
    Ok((buf, outcome.exceeded))
}

async fn collect_stderr(stderr: Option<ChildStderr>) -> Vec<u8> {
    let Some(mut stderr) = stderr else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_KEEP.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

/// Kill the child if it is still running and wait for it to go away.
async fn reap(child: &RendererProcess) -> Option<ResourceUsage> {
    match child.kill().await {
        Ok(exit) => exit.usage,
        Err(e) => {
            debug!(error = %e, "renderer kill");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::render::gate::ConversionGate;
    use crate::render::observer::ConversionObserver;
    use futures::stream;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    // ── Test helpers ──────────────────────────────────────────────────────

    #[derive(Default)]
    struct Recorder {
        pids: Mutex<Vec<Option<u32>>>,
        reports: Mutex<Vec<ConversionReport>>,
    }

    impl ConversionObserver for Recorder {
        fn on_conversion_start(&self, _program: &str, pid: Option<u32>) {
            self.pids.lock().unwrap().push(pid);
        }

        fn on_conversion_finished(&self, report: &ConversionReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    impl Recorder {
        fn last(&self) -> ConversionReport {
            self.reports.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn sh(script: &str) -> RendererCommand {
        RendererCommand::new("sh").args(["-c", script])
    }

    fn input(parts: &[&'static str]) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn render(
        renderer: &Renderer,
        parts: &[&'static str],
        ctx: &RequestContext,
    ) -> Result<Bytes, PdfSvcError> {
        let gate = ConversionGate::new(1);
        let permit = gate.acquire(&RequestContext::background()).await.unwrap();
        renderer.run(&permit, input(parts), ctx).await
    }

    fn is_alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks whether the pid exists.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    // ── Outcomes ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stdout_is_the_result() {
        let recorder = Arc::new(Recorder::default());
        let renderer = Renderer::new(RendererCommand::new("cat")).observer(recorder.clone());
        let out = render(
            &renderer,
            &["<html>", "<body>hi</body>", "</html>"],
            &RequestContext::background(),
        )
        .await
        .unwrap();
        assert_eq!(out, "<html><body>hi</body></html>");

        let report = recorder.last();
        assert!(report.succeeded());
        assert_eq!(report.input_bytes, 28);
        assert_eq!(report.output_bytes, 28);
        assert!(report.to_string().starts_with("exit code 0 / wall: "));
    }

    #[tokio::test]
    async fn non_zero_exit_is_process_failure() {
        let renderer = Renderer::new(sh("cat >/dev/null; exit 3"));
        let err = render(&renderer, &["<p>x</p>"], &RequestContext::background())
            .await
            .unwrap_err();
        match err {
            PdfSvcError::ProcessFailure { reason } => assert_eq!(reason, "exit code 3"),
            other => panic!("expected ProcessFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stderr_is_captured_for_diagnostics() {
        let recorder = Arc::new(Recorder::default());
        let renderer = Renderer::new(sh("cat >/dev/null; echo 'bad markup' >&2; exit 1"))
            .observer(recorder.clone());
        assert!(render(&renderer, &["<p>"], &RequestContext::background())
            .await
            .is_err());
        assert_eq!(recorder.last().stderr.trim_end(), "bad markup");
    }

    #[tokio::test]
    async fn missing_program_is_process_failure() {
        let recorder = Arc::new(Recorder::default());
        let renderer = Renderer::new(RendererCommand::new("/nonexistent/renderer"))
            .observer(recorder.clone());
        let err = render(&renderer, &["<p>"], &RequestContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, PdfSvcError::ProcessFailure { .. }), "got {err:?}");
        assert!(matches!(recorder.last().outcome, RunOutcome::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn renderer_that_ignores_input_still_succeeds() {
        let renderer = Renderer::new(sh("echo done"));
        let big: &'static str = Box::leak("x".repeat(1 << 20).into_boxed_str());
        let out = render(&renderer, &[big], &RequestContext::background())
            .await
            .unwrap();
        assert_eq!(out, "done\n");
    }

    #[tokio::test]
    async fn input_error_kills_renderer() {
        let renderer = Renderer::new(RendererCommand::new("cat"));
        let gate = ConversionGate::new(1);
        let permit = gate.acquire(&RequestContext::background()).await.unwrap();
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"<html>")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "spool read")),
        ]);
        let err = renderer
            .run(&permit, chunks, &RequestContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, PdfSvcError::StorageFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn usage_is_reported_per_run() {
        let recorder = Arc::new(Recorder::default());
        // dd touches its whole 64 MiB block buffer.
        let heavy = Renderer::new(RendererCommand::new("dd").args([
            "if=/dev/zero",
            "of=/dev/null",
            "bs=67108864",
            "count=1",
        ]))
        .observer(recorder.clone());
        let light = Renderer::new(sh("cat >/dev/null")).observer(recorder.clone());

        assert!(render(&heavy, &["<p>"], &RequestContext::background())
            .await
            .is_ok());
        let heavy_rss = recorder.last().usage.unwrap().max_rss.unwrap();

        render(&light, &["<p>"], &RequestContext::background())
            .await
            .unwrap();
        let light_report = recorder.last();
        let light_rss = light_report.usage.unwrap().max_rss.unwrap();

        assert!(heavy_rss > 48 << 20, "heavy run reported {heavy_rss} bytes");
        assert!(light_rss < 32 << 20, "light run reported {light_report}");
    }

    // ── Limits ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn deadline_kills_and_reaps_renderer() {
        let recorder = Arc::new(Recorder::default());
        let renderer = Renderer::new(sh("exec sleep 30"))
            .max_duration(Duration::from_millis(100))
            .observer(recorder.clone());

        let started = Instant::now();
        let err = render(&renderer, &[], &RequestContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, PdfSvcError::DeadlineExceeded), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = recorder.pids.lock().unwrap()[0].unwrap();
        assert!(!is_alive(pid), "renderer {pid} still running");
        assert_eq!(recorder.last().outcome, RunOutcome::TimedOut);
    }

    #[tokio::test]
    async fn caller_deadline_tighter_than_max_duration() {
        let renderer = Renderer::new(sh("exec sleep 30")).max_duration(Duration::from_secs(60));
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(100));
        let err = render(&renderer, &[], &ctx).await.unwrap_err();
        assert!(matches!(err, PdfSvcError::DeadlineExceeded), "got {err:?}");
    }

    #[tokio::test]
    async fn cancellation_kills_renderer() {
        let recorder = Arc::new(Recorder::default());
        let renderer = Renderer::new(sh("exec sleep 30")).observer(recorder.clone());
        let (tx, rx) = watch::channel(false);
        let ctx = RequestContext::background().with_cancel(rx);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
        });
        let err = render(&renderer, &[], &ctx).await.unwrap_err();
        cancel.await.unwrap();

        assert!(matches!(err, PdfSvcError::Cancelled), "got {err:?}");
        let pid = recorder.pids.lock().unwrap()[0].unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn oversized_output_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let renderer = Renderer::new(RendererCommand::new("yes"))
            .max_output(1000)
            .observer(recorder.clone());
        let err = render(&renderer, &[], &RequestContext::background())
            .await
            .unwrap_err();
        assert!(
            matches!(err, PdfSvcError::OutputTooLarge { limit: 1000 }),
            "got {err:?}"
        );
        assert_eq!(recorder.last().outcome, RunOutcome::OutputCapped);
    }
}
