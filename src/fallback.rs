//! Degraded playback paths used when neither the cache nor the relay can
//! serve an episode.
//!
//! Two flavors exist. The URL flavor just points the client at the original
//! host (embed or watch page); bandwidth stays client-side but mobile
//! browsers may pause it in the background. The subprocess flavor runs
//! `yt-dlp` locally and pipes its stdout straight into the HTTP response.

use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result, anyhow};
use axum::body::Bytes;
use futures::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Content type announced for subprocess-streamed audio.
pub const STREAM_CONTENT_TYPE: &str = "audio/mp4";

/// `yt-dlp` format selector: prefer an m4a audio track, else any audio.
const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio";

/// Cap on how much stderr is kept for error messages.
const STDERR_LIMIT: usize = 4 * 1024;

pub fn embed_url(id: &str) -> String {
    format!("https://www.youtube.com/embed/{id}?autoplay=1&modestbranding=1")
}

pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

pub fn thumbnail_url(id: &str) -> String {
    format!("https://img.youtube.com/vi/{id}/mqdefault.jpg")
}

/// Backend route that streams `id` through the local subprocess.
pub fn fallback_audio_url(id: &str) -> String {
    format!("/api/youtube-audio/{id}")
}

/// Spawns `yt-dlp` processes that write audio to stdout.
#[derive(Debug, Clone)]
pub struct SubprocessStreamer {
    program: PathBuf,
}

impl SubprocessStreamer {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    fn command(&self, source_url: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["-f", AUDIO_FORMAT, "-o", "-", "--quiet", "--no-warnings"])
            .arg(source_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Starts streaming `source_url`.
    ///
    /// Resolves only once the process has produced its first chunk, so a
    /// caller that has not sent headers yet can still answer with an error
    /// when the process fails to start or exits without output. The returned
    /// stream owns the child; dropping it (for instance because the client
    /// went away) kills the process.
    pub async fn start(&self, source_url: &str) -> Result<BoxStream<'static, io::Result<Bytes>>> {
        let mut child = self
            .command(source_url)
            .spawn()
            .with_context(|| format!("starting {}", self.program.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{} stdout was not captured", self.program.display()))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut collected = Vec::new();
            if let Some(stderr) = stderr {
                let mut limited = stderr.take(STDERR_LIMIT as u64);
                let _ = limited.read_to_end(&mut collected).await;
                // Keep draining so a chatty process never blocks on a full pipe.
                let mut rest = limited.into_inner();
                let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
            }
            String::from_utf8_lossy(&collected).trim().to_string()
        });

        let mut process = AudioProcess {
            stdout: ReaderStream::new(stdout),
            child,
        };

        match process.next().await {
            Some(Ok(first)) => {
                debug!(program = %self.program.display(), url = source_url, "audio subprocess streaming");
                Ok(stream::iter([Ok(first)]).chain(process).boxed())
            }
            Some(Err(err)) => {
                Err(anyhow!(err).context(format!("reading {} output", self.program.display())))
            }
            None => {
                let status = process.child.wait().await.ok();
                let stderr = stderr_task.await.unwrap_or_default();
                warn!(program = %self.program.display(), url = source_url, ?status, stderr = %stderr, "audio subprocess produced no output");
                let detail = if stderr.is_empty() {
                    "no output".to_string()
                } else {
                    stderr
                };
                Err(anyhow!(
                    "{} exited without audio ({}): {detail}",
                    self.program.display(),
                    status.map(|s| s.to_string()).unwrap_or_else(|| "unknown status".into())
                ))
            }
        }
    }
}

/// Audio stdout of a running child. The child is spawned with
/// `kill_on_drop`, so this stream going away terminates the process.
struct AudioProcess {
    stdout: ReaderStream<ChildStdout>,
    child: Child,
}

impl Stream for AudioProcess {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stdout).poll_next(cx)
    }
}
