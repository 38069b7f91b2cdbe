use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use extdev_core::{Error, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ndjson::{parse_event_line, HarnessEvent};

pub struct TargetProcess {
    child: Child,
    pgid: Option<Pid>,
    lines: mpsc::Receiver<String>,
    transcript: String,
}

impl TargetProcess {
    pub fn spawn(program: &str, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn {}: {}", program, e)))?;
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        info!(program, pid = ?child.id(), "target process started");

        let (tx, lines) = mpsc::channel(1024);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        Ok(Self {
            child,
            pgid,
            lines,
            transcript: String::new(),
        })
    }

    /// Everything read so far, one line per output line.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Next output line, or `None` once both streams are closed. Lines
    /// are appended to the transcript as they are read.
    pub async fn next_line(&mut self) -> Option<String> {
        let line = self.lines.recv().await?;
        self.transcript.push_str(&line);
        self.transcript.push('\n');
        Some(line)
    }

    /// Read until an event matching `accept` shows up.
    pub async fn wait_for_event<F>(&mut self, timeout: Duration, accept: F) -> Result<HarnessEvent>
    where
        F: Fn(&HarnessEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let line = match tokio::time::timeout_at(deadline, self.next_line()).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(Error::Process("target process output closed".to_string()))
                }
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "no matching event within {} ms",
                        timeout.as_millis()
                    )))
                }
            };
            match parse_event_line(&line) {
                Some(event) if accept(&event) => return Ok(event),
                Some(event) => debug!(event = ?event, "skipping event"),
                None => debug!(line = %extdev_core::truncate_for_log(&line, 200), "target output"),
            }
        }
    }

    /// Read the remaining output into the transcript until both streams
    /// close or `timeout` passes.
    pub async fn drain(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while let Ok(Some(_)) = tokio::time::timeout_at(deadline, self.next_line()).await {}
    }

    /// SIGTERM the process group, then SIGKILL it if the leader is still
    /// running after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        if let Some(pgid) = self.pgid {
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                debug!(pgid = pgid.as_raw(), error = %e, "SIGTERM failed");
            }
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "target ignored SIGTERM, killing");
                if let Some(pgid) = self.pgid {
                    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                        debug!(pgid = pgid.as_raw(), error = %e, "SIGKILL failed");
                    }
                }
                Ok(self.child.wait().await?)
            }
        }
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "target output read error");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndjson::STAGE_UPDATED;

    fn sh(script: &str) -> Result<TargetProcess> {
        TargetProcess::spawn("sh", &["-c".to_string(), script.to_string()], None)
    }

    #[tokio::test]
    async fn test_reads_events_from_mixed_output() {
        let mut proc = sh(r#"echo building; echo '{"type":"page_html","stage":"updated","html":"<p>x</p>"}' >&2; sleep 30"#)
            .unwrap();
        let event = proc
            .wait_for_event(Duration::from_secs(5), |e| e.is_updated_html())
            .await
            .unwrap();
        assert_eq!(event, HarnessEvent::page_html(STAGE_UPDATED, "<p>x</p>"));
        assert!(proc.transcript().contains("page_html"));

        let status = proc.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut proc = sh("sleep 30").unwrap();
        let res = proc.wait_for_event(Duration::from_millis(100), |_| true).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
        proc.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_escalates_to_sigkill() {
        let mut proc = sh("trap '' TERM; echo ready; sleep 30").unwrap();
        assert_eq!(proc.next_line().await.as_deref(), Some("ready"));
        let started = std::time::Instant::now();
        let status = proc.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_drain_collects_trailing_output() {
        let mut proc = sh("i=0; while [ $i -lt 300 ]; do i=$((i+1)); echo line$i; done").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        proc.terminate(Duration::from_secs(2)).await.unwrap();
        proc.drain(Duration::from_secs(2)).await;
        assert!(proc.transcript().contains("line1\n"));
        assert!(proc.transcript().ends_with("line300\n"));
        assert_eq!(proc.transcript().lines().count(), 300);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_error() {
        let res = TargetProcess::spawn("/definitely/not/a/binary", &[], None);
        assert!(matches!(res, Err(Error::Process(_))));
    }
}
