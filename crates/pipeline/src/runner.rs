use crate::error::{ErrorKind, Result};
use crate::fork::ForkingSink;
use crate::stage::{Output, Source, Stage};
use crate::{BYTES_PER_SAMPLE, CHANNELS, SAMPLE_RATE};
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::instrument;

/// Diagnostic report for an encoder stage that exited unsuccessfully.
#[derive(Debug, Clone, Display)]
#[display("stage {index} ({program}) exited with {}: {diagnostics}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
pub struct StageFailure {
    pub index: usize,
    pub program: String,
    pub code: Option<i32>,
    pub diagnostics: String,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Bytes written to the final destination (the cache file when there is
    /// one, otherwise the live consumer).
    pub bytes_written: u64,
    /// The cache file the output was written to, if any.
    pub cache_path: Option<PathBuf>,
    /// Whether a forked live consumer was abandoned mid-stream.
    pub live_collapsed: bool,
}

/// Chained external processes: `source | stage 1 | ... | stage n > output`.
pub struct Pipeline {
    stages: Vec<Stage>,
    source: Source,
    output: Output,
    timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>, source: Source, output: Output) -> Self {
        Self { stages, source, output, timeout: None }
    }

    /// Kill every stage and fail if the whole run takes longer than `limit`.
    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run all stages to completion.
    ///
    /// Succeeds only when every stage exits with status zero and the output
    /// was fully delivered. A failing live consumer of a forked output does
    /// not fail the run.
    #[instrument(skip_all, fields(stages = self.stages.len()))]
    pub async fn run(self) -> Result<Completion> {
        let Self { stages, source, output, timeout } = self;
        if stages.is_empty() {
            exn::bail!(ErrorKind::NoStages);
        }
        let started = std::time::Instant::now();
        let result = match timeout {
            // Dropping the run future drops every child, and children are
            // spawned with kill_on_drop.
            Some(limit) => match tokio::time::timeout(limit, execute(stages, source, output)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(limit_secs = limit.as_secs(), "Pipeline timed out; stages killed");
                    exn::bail!(ErrorKind::TimedOut(limit));
                },
            },
            None => execute(stages, source, output).await,
        };
        if let Ok(completion) = &result {
            tracing::debug!(
                bytes = completion.bytes_written,
                elapsed_ms = started.elapsed().as_millis() as u64,
                live_collapsed = completion.live_collapsed,
                "Pipeline finished"
            );
        }
        result
    }
}

async fn execute(stages: Vec<Stage>, source: Source, output: Output) -> Result<Completion> {
    let count = stages.len();
    let mut children: Vec<Child> = Vec::with_capacity(count);
    let mut drains: Vec<JoinHandle<String>> = Vec::with_capacity(count);
    let mut upstream: Option<ChildStdout> = None;
    let mut first_stdin: Option<ChildStdin> = None;

    for (index, stage) in stages.iter().enumerate() {
        let last = index + 1 == count;
        let mut command = Command::new(&stage.program);
        command.args(&stage.args).stderr(Stdio::piped()).kill_on_drop(true);
        match upstream.take() {
            Some(stdout) => {
                let stdin: Stdio = TryInto::<Stdio>::try_into(stdout).or_raise(|| ErrorKind::Stdio(stage.program.clone()))?;
                command.stdin(stdin);
            },
            None => {
                command.stdin(Stdio::piped());
            },
        }
        command.stdout(if !last || output.captures_stdout() { Stdio::piped() } else { Stdio::null() });

        let mut child = command.spawn().or_raise(|| ErrorKind::Spawn(stage.program.clone()))?;
        tracing::trace!(stage = index, program = %stage.program, pid = child.id(), "Spawned pipeline stage");
        if index == 0 {
            first_stdin = child.stdin.take();
        }
        if !last {
            upstream = child.stdout.take();
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain(stderr)));
        }
        children.push(child);
    }

    let captured = output.captures_stdout();
    let stdout = children.last_mut().and_then(|child| child.stdout.take());
    let feeder = tokio::spawn(feed(source, first_stdin));
    let waits = futures::future::join_all(children.iter_mut().map(|child| child.wait()));
    let (statuses, delivered) = tokio::join!(waits, deliver(stdout, output));

    let mut diagnostics = Vec::with_capacity(drains.len());
    for drain in drains {
        diagnostics.push(drain.await.unwrap_or_default());
    }
    let fed = feeder.await;

    // A broken destination is the cause of whatever the stages did afterwards.
    let mut completion = delivered?;
    let mut failures = Vec::new();
    for (index, (stage, status)) in stages.iter().zip(statuses).enumerate() {
        let status: ExitStatus = status.or_raise(|| ErrorKind::Wait(stage.program.clone()))?;
        let stderr = diagnostics.get(index).map(|text| text.trim()).unwrap_or_default();
        if status.success() {
            if !stderr.is_empty() {
                tracing::debug!(stage = index, program = %stage.program, diagnostics = %stderr, "Pipeline stage reported diagnostics");
            }
            continue;
        }
        tracing::warn!(stage = index, program = %stage.program, code = ?status.code(), diagnostics = %stderr, "Pipeline stage failed");
        failures.push(StageFailure {
            index,
            program: stage.program.clone(),
            code: status.code(),
            diagnostics: stderr.to_string(),
        });
    }
    if let Some(failure) = culprit(failures) {
        exn::bail!(ErrorKind::StageFailed(failure));
    }
    match fed {
        Ok(result) => {
            result?;
        },
        Err(join) => {
            tracing::error!(error = %join, "Feeder task failed");
            exn::bail!(ErrorKind::Feed);
        },
    }
    if !captured && let Some(path) = &completion.cache_path {
        completion.bytes_written = tokio::fs::metadata(path).await.or_raise(|| ErrorKind::Sink)?.len();
    }
    Ok(completion)
}

/// Pick the stage that caused a failed run.
///
/// A stage that dies downstream takes its upstream neighbours with it by
/// SIGPIPE, and one that dies upstream leaves the stages after it with
/// truncated input. The earliest stage that exited on its own is the cause;
/// signalled stages are only blamed when nothing exited.
fn culprit(mut failures: Vec<StageFailure>) -> Option<StageFailure> {
    let index = failures.iter().position(|failure| failure.code.is_some()).unwrap_or(0);
    (index < failures.len()).then(|| failures.swap_remove(index))
}

/// Number of bytes of silent PCM lasting `seconds`.
pub(crate) fn silence_len(seconds: u32) -> u64 {
    u64::from(seconds) * u64::from(SAMPLE_RATE) * u64::from(CHANNELS) * u64::from(BYTES_PER_SAMPLE)
}

async fn feed(source: Source, stdin: Option<ChildStdin>) -> Result<u64> {
    let Some(mut stdin) = stdin else {
        return Ok(0);
    };
    let copied = match source {
        Source::Reader(mut reader) => tokio::io::copy(&mut reader, &mut stdin).await,
        Source::Silence { seconds } => {
            let mut zeros = tokio::io::repeat(0).take(silence_len(seconds));
            tokio::io::copy(&mut zeros, &mut stdin).await
        },
    };
    match copied {
        Ok(bytes) => {
            // Closing stdin signals end of input to the first stage.
            if let Err(err) = stdin.shutdown().await
                && err.kind() != IoErrorKind::BrokenPipe
            {
                return Err(err).or_raise(|| ErrorKind::Feed);
            }
            Ok(bytes)
        },
        // The first stage stopped reading; its exit status tells the story.
        Err(err) if err.kind() == IoErrorKind::BrokenPipe => {
            tracing::trace!("First stage closed its input early");
            Ok(0)
        },
        Err(err) => Err(err).or_raise(|| ErrorKind::Feed),
    }
}

async fn drain(mut stderr: impl AsyncRead + Unpin) -> String {
    let mut buffer = Vec::new();
    if let Err(err) = stderr.read_to_end(&mut buffer).await {
        tracing::trace!(error = %err, "Failed reading stage diagnostics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn deliver(stdout: Option<ChildStdout>, output: Output) -> Result<Completion> {
    match output {
        Output::File(path) => {
            // The last stage writes the file; its size is read once it exits.
            Ok(Completion { bytes_written: 0, cache_path: Some(path), live_collapsed: false })
        },
        Output::Stream(mut live) => {
            let mut stdout = stdout.ok_or_raise(|| ErrorKind::Sink)?;
            let bytes = copy_out(&mut stdout, &mut live).await?;
            Ok(Completion { bytes_written: bytes, cache_path: None, live_collapsed: false })
        },
        Output::Fork { cache, live } => {
            let mut stdout = stdout.ok_or_raise(|| ErrorKind::Sink)?;
            let file = tokio::fs::File::create(&cache).await.or_raise(|| ErrorKind::Sink)?;
            let mut sink = ForkingSink::new(file, live);
            let bytes = copy_out(&mut stdout, &mut sink).await?;
            let live_collapsed = sink.is_collapsed();
            if live_collapsed {
                tracing::debug!(cache = %cache.display(), "Live consumer went away; cache file completed regardless");
            }
            Ok(Completion { bytes_written: bytes, cache_path: Some(cache), live_collapsed })
        },
    }
}

async fn copy_out<W: AsyncWrite + Unpin>(stdout: &mut ChildStdout, sink: &mut W) -> Result<u64> {
    let bytes = tokio::io::copy(stdout, sink).await.or_raise(|| ErrorKind::Sink)?;
    sink.shutdown().await.or_raise(|| ErrorKind::Sink)?;
    Ok(bytes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tempfile::TempDir;

    fn sh(script: &str) -> Stage {
        Stage::new("sh", ["-c", script])
    }

    /// Live consumer capturing everything written to it.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);
    impl Capture {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }
    impl AsyncWrite for Capture {
        fn poll_write(self: std::pin::Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: std::pin::Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: std::pin::Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_single_stage_streams_output() {
        let capture = Capture::default();
        let pipeline = Pipeline::new(
            vec![Stage::new("cat", Vec::<String>::new())],
            Source::reader(Cursor::new(b"hello pipeline".to_vec())),
            Output::Stream(Box::pin(capture.clone())),
        );
        let completion = pipeline.run().await.unwrap();
        assert_eq!(completion.bytes_written, 14);
        assert_eq!(capture.bytes(), b"hello pipeline");
        assert!(completion.cache_path.is_none());
    }

    #[tokio::test]
    async fn test_stages_are_chained_in_order() {
        let capture = Capture::default();
        let pipeline = Pipeline::new(
            vec![sh("tr a-z A-Z"), sh("rev"), Stage::new("cat", Vec::<String>::new())],
            Source::reader(Cursor::new(b"abc\n".to_vec())),
            Output::Stream(Box::pin(capture.clone())),
        );
        pipeline.run().await.unwrap();
        assert_eq!(capture.bytes(), b"CBA\n");
    }

    #[tokio::test]
    async fn test_failing_stage_reports_diagnostics() {
        let pipeline = Pipeline::new(
            vec![Stage::new("cat", Vec::<String>::new()), sh("cat >/dev/null; echo boom >&2; exit 3")],
            Source::reader(Cursor::new(b"data".to_vec())),
            Output::Stream(Box::pin(tokio::io::sink())),
        );
        let err = pipeline.run().await.unwrap_err();
        let ErrorKind::StageFailed(failure) = &*err else {
            panic!("expected stage failure, got {err:?}");
        };
        assert_eq!(failure.index, 1);
        assert_eq!(failure.code, Some(3));
        assert_eq!(failure.diagnostics, "boom");
        assert_eq!(err.diagnostics(), Some("boom"));
    }

    #[tokio::test]
    async fn test_downstream_failure_blamed_over_broken_pipe() {
        // The first stage is still writing when the second gives up, so it
        // dies of a broken pipe with nothing to say.
        let payload = vec![0u8; 8 * 1024 * 1024];
        let pipeline = Pipeline::new(
            vec![Stage::new("cat", Vec::<String>::new()), sh("head -c 10 >/dev/null; echo boom >&2; exit 1")],
            Source::reader(Cursor::new(payload)),
            Output::Stream(Box::pin(tokio::io::sink())),
        );
        let err = pipeline.run().await.unwrap_err();
        let ErrorKind::StageFailed(failure) = &*err else {
            panic!("expected stage failure, got {err:?}");
        };
        assert_eq!(failure.index, 1);
        assert_eq!(failure.code, Some(1));
        assert_eq!(err.diagnostics(), Some("boom"));
    }

    #[tokio::test]
    async fn test_upstream_failure_blamed_over_truncated_input() {
        let pipeline = Pipeline::new(
            vec![sh("echo bad master >&2; exit 2"), sh("cat >/dev/null; echo no input >&2; exit 1")],
            Source::reader(Cursor::new(b"data".to_vec())),
            Output::Stream(Box::pin(tokio::io::sink())),
        );
        let err = pipeline.run().await.unwrap_err();
        assert_eq!(err.diagnostics(), Some("bad master"));
    }

    #[test]
    fn test_culprit_falls_back_to_signalled_stage() {
        let failure = |index, code| StageFailure { index, program: "sh".into(), code, diagnostics: String::new() };
        assert_eq!(culprit(vec![failure(0, None), failure(2, Some(1))]).map(|f| f.index), Some(2));
        assert_eq!(culprit(vec![failure(0, None), failure(1, None)]).map(|f| f.index), Some(0));
        assert!(culprit(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_first_stage_may_ignore_input() {
        let capture = Capture::default();
        let pipeline = Pipeline::new(
            vec![sh("printf ignored")],
            Source::Silence { seconds: 30 },
            Output::Stream(Box::pin(capture.clone())),
        );
        pipeline.run().await.unwrap();
        assert_eq!(capture.bytes(), b"ignored");
    }

    #[tokio::test]
    async fn test_silence_source_length() {
        let capture = Capture::default();
        let pipeline = Pipeline::new(
            vec![sh("wc -c | tr -d ' \\n'")],
            Source::Silence { seconds: 2 },
            Output::Stream(Box::pin(capture.clone())),
        );
        pipeline.run().await.unwrap();
        assert_eq!(String::from_utf8(capture.bytes()).unwrap(), silence_len(2).to_string());
        assert_eq!(silence_len(1), 192_000);
    }

    #[tokio::test]
    async fn test_file_output_written_by_last_stage() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.bin");
        let output = Output::File(target.clone());
        let script = format!("cat > '{}'", output.target().to_string_lossy());
        let pipeline = Pipeline::new(vec![sh(&script)], Source::reader(Cursor::new(b"to disk".to_vec())), output);
        let completion = pipeline.run().await.unwrap();
        assert_eq!(completion.cache_path.as_deref(), Some(target.as_path()));
        assert_eq!(std::fs::read(&target).unwrap(), b"to disk");
    }

    #[tokio::test]
    async fn test_fork_writes_cache_and_live() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("artifact.bin");
        let capture = Capture::default();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let pipeline = Pipeline::new(
            vec![Stage::new("cat", Vec::<String>::new())],
            Source::reader(Cursor::new(payload.clone())),
            Output::Fork { cache: cache.clone(), live: Box::pin(capture.clone()) },
        );
        let completion = pipeline.run().await.unwrap();
        assert_eq!(completion.bytes_written, payload.len() as u64);
        assert!(!completion.live_collapsed);
        assert_eq!(std::fs::read(&cache).unwrap(), payload);
        assert_eq!(capture.bytes(), payload);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let pipeline = Pipeline::new(
            vec![Stage::new("encore-no-such-program", Vec::<String>::new())],
            Source::Silence { seconds: 0 },
            Output::Stream(Box::pin(tokio::io::sink())),
        );
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Spawn(program) if program == "encore-no-such-program"));
    }

    #[tokio::test]
    async fn test_empty_pipeline_rejected() {
        let pipeline = Pipeline::new(vec![], Source::Silence { seconds: 0 }, Output::Stream(Box::pin(tokio::io::sink())));
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoStages));
    }

    #[tokio::test]
    async fn test_timeout_kills_stages() {
        let pipeline = Pipeline::new(
            vec![sh("sleep 30")],
            Source::Silence { seconds: 0 },
            Output::Stream(Box::pin(tokio::io::sink())),
        )
        .with_timeout(Some(Duration::from_millis(200)));
        let started = std::time::Instant::now();
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
