//! Supervises `lbc-scout scrape` as a child process.
//!
//! The child reports only through its output lines and its exit code; the
//! orchestrator owns the run record while the child runs, except for the
//! `paused` transition the captcha escalation writes itself.

use crate::error::{Result, ScoutError};
use crate::models::{RunRecord, RunStatus};
use crate::protocol::{parse_line, MetricsEvent, ProgressEvent, ProtocolLine, RunOutcome};
use crate::store::RunStore;
use chrono::{DateTime, Utc};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Characters of child output kept on the run record
pub const LOG_TAIL_CHARS: usize = 4000;

/// Create the `running` record for a new run.
///
/// An existing running record blocks the new run unless `force` is set, in
/// which case the stale run is killed (best effort) and marked `aborted` first.
pub fn begin_run<S: RunStore + ?Sized>(store: &S, force: bool, now: DateTime<Utc>) -> Result<RunRecord> {
    if let Some(mut stale) = store.find_running()? {
        if !force {
            return Err(ScoutError::RunInProgress { id: stale.id });
        }

        warn!(id = %stale.id, "Forcing a new run, aborting the stale one");
        if let Some(pid) = stale.pid {
            if let Err(e) = terminate(pid) {
                debug!(pid, error = %e, "Stale scraper process not signalled");
            }
        }
        stale.finish(RunStatus::Aborted, now, Some("Superseded by a forced run".into()));
        stale.message = Some("Aborted".into());
        store.update_run(&stale)?;
    }

    let run = RunRecord::start(now);
    store.insert_run(&run)?;
    info!(id = %run.id, "Run started");
    Ok(run)
}

/// Stop the running scraper, if any, and mark its record `aborted`
pub fn abort_running<S: RunStore + ?Sized>(store: &S, now: DateTime<Utc>) -> Result<Option<RunRecord>> {
    let Some(mut run) = store.find_running()? else {
        return Ok(None);
    };

    if let Some(pid) = run.pid {
        match terminate(pid) {
            Ok(()) => info!(pid, "Termination signal sent"),
            Err(e) => warn!(pid, error = %e, "Could not signal scraper process"),
        }
    }
    run.finish(RunStatus::Aborted, now, Some("Aborted by operator".into()));
    run.message = Some("Aborted".into());
    store.update_run(&run)?;
    Ok(Some(run))
}

/// Ask the OS to terminate `pid`, which this process did not spawn
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let mut command = if cfg!(windows) {
        let mut c = std::process::Command::new("taskkill");
        c.args(["/PID", &pid.to_string(), "/T", "/F"]);
        c
    } else {
        let mut c = std::process::Command::new("kill");
        c.args(["-TERM", &pid.to_string()]);
        c
    };

    let status = command.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("{command:?} exited with {status}")))
    }
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    /// Killed by a signal, no exit code
    Signal,
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ChildExit::Code(code),
            None => ChildExit::Signal,
        }
    }
}

/// What the orchestrator has learned from the child's output so far
#[derive(Debug, Default)]
pub struct OutputTracker {
    tail: String,
    progress: Option<ProgressEvent>,
    metrics: Option<MetricsEvent>,
    collected: Option<u32>,
    dirty: bool,
}

impl OutputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) {
        self.tail.push_str(line);
        self.tail.push('\n');
        let excess = self.tail.chars().count().saturating_sub(LOG_TAIL_CHARS);
        if excess > 0 {
            let cut = self
                .tail
                .char_indices()
                .nth(excess)
                .map_or(self.tail.len(), |(idx, _)| idx);
            self.tail.drain(..cut);
        }

        match parse_line(line) {
            Some(ProtocolLine::Progress(event)) => self.progress = Some(event),
            Some(ProtocolLine::Metrics(metrics)) => self.metrics = Some(metrics),
            Some(ProtocolLine::Collected(count)) => self.collected = Some(count),
            None => {}
        }
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copy progress, log tail and counters onto the record
    pub fn apply(&mut self, run: &mut RunRecord) {
        if let Some(event) = &self.progress {
            run.progress = event.fraction();
            run.message = Some(event.describe());
        }
        if let Some(metrics) = self.metrics {
            run.created = metrics.created;
            run.updated = metrics.updated;
            run.skipped_recent = metrics.skipped_recent;
        }
        if let Some(collected) = self.collected {
            run.collected = collected;
        }
        run.log_tail = self.tail.clone();
        self.dirty = false;
    }
}

#[cfg(test)]
impl OutputTracker {
    pub fn tail(&self) -> &str {
        &self.tail
    }
}

/// Terminal status for the record once the child has exited
pub fn finalize(run: &mut RunRecord, tracker: &mut OutputTracker, exit: ChildExit, now: DateTime<Utc>) {
    tracker.apply(run);

    let (status, error) = match exit {
        ChildExit::Code(code) => match RunOutcome::from_code(code) {
            Some(RunOutcome::Success) => (RunStatus::Success, None),
            Some(RunOutcome::PausedForCaptcha) => (RunStatus::Paused, None),
            Some(RunOutcome::Failed) | None => {
                (RunStatus::Error, Some(format!("Scraper exited with code {code}")))
            }
        },
        ChildExit::Signal => (RunStatus::Aborted, Some("Scraper terminated by a signal".into())),
    };

    run.finish(status, now, error);
    run.message = Some(
        match status {
            RunStatus::Success => "Completed",
            RunStatus::Paused => "Paused: waiting for captcha resolution",
            RunStatus::Aborted => "Aborted",
            _ => "Failed",
        }
        .to_string(),
    );
}

fn forward_lines<R>(reader: R, tx: UnboundedSender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Stopped reading child output");
                    break;
                }
            }
        }
    })
}

/// Re-read the record so a `paused` written by the child is not overwritten
fn refresh<S: RunStore + ?Sized>(store: &S, run: &RunRecord, tracker: &mut OutputTracker) -> Result<()> {
    let mut current = store.get_run(&run.id)?.unwrap_or_else(|| run.clone());
    if current.status != RunStatus::Running {
        return Ok(());
    }
    tracker.apply(&mut current);
    store.update_run(&current)
}

/// Spawn the scraper, track its output every `tick`, and settle the record when it exits
pub async fn run_tracked<S: RunStore + ?Sized>(
    store: &S,
    mut run: RunRecord,
    mut command: Command,
    interactive: bool,
    tick: Duration,
) -> Result<RunRecord> {
    command
        .stdin(if interactive { Stdio::inherit() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            run.finish(RunStatus::Error, Utc::now(), Some(format!("Failed to start scraper: {e}")));
            store.update_run(&run)?;
            return Err(e.into());
        }
    };

    run.pid = child.id();
    run.message = Some("Scraper started".into());
    store.update_run(&run)?;
    info!(pid = ?run.pid, "Scraper process spawned");

    let (tx, mut rx) = unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    let mut tracker = OutputTracker::new();
    let mut ticks = interval(tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let status = loop {
        tokio::select! {
            Some(line) = rx.recv() => {
                eprintln!("{line}");
                tracker.push_line(&line);
            }
            _ = ticks.tick() => {
                if tracker.is_dirty() {
                    if let Err(e) = refresh(store, &run, &mut tracker) {
                        warn!(error = %e, "Failed to update run progress");
                    }
                }
            }
            status = child.wait() => break status?,
        }
    };

    for reader in readers {
        if let Err(e) = reader.await {
            debug!(error = %e, "Output reader ended abnormally");
        }
    }
    while let Ok(line) = rx.try_recv() {
        eprintln!("{line}");
        tracker.push_line(&line);
    }

    let mut current = store.get_run(&run.id)?.unwrap_or(run);
    finalize(&mut current, &mut tracker, ChildExit::from(status), Utc::now());
    store.update_run(&current)?;
    info!(id = %current.id, status = current.status.as_str(), "Run settled");
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_second_run_rejected_without_force() {
        let store = MemoryStore::new();
        let first = begin_run(&store, false, Utc::now()).unwrap();

        let err = begin_run(&store, false, Utc::now()).unwrap_err();
        assert!(matches!(err, ScoutError::RunInProgress { ref id } if *id == first.id));
        assert_eq!(store.recent_runs(10).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_starts_leave_one_running_record() {
        use crate::store::SqliteStore;
        use std::sync::Barrier;

        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("scout.db")).unwrap();
        let barrier = Barrier::new(4);

        let started: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        match begin_run(&store, false, Utc::now()) {
                            Ok(_) => true,
                            Err(ScoutError::RunInProgress { .. }) => false,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(started.iter().filter(|ok| **ok).count(), 1);
        let running = store
            .recent_runs(10)
            .unwrap()
            .into_iter()
            .filter(|r| r.status == RunStatus::Running)
            .count();
        assert_eq!(running, 1);
    }

    #[test]
    fn test_force_aborts_stale_run_first() {
        let store = MemoryStore::new();
        let stale = begin_run(&store, false, Utc::now()).unwrap();

        let fresh = begin_run(&store, true, Utc::now()).unwrap();

        let stale = store.get_run(&stale.id).unwrap().unwrap();
        assert_eq!(stale.status, RunStatus::Aborted);
        assert!(stale.ended_at.is_some());
        assert_eq!(store.find_running().unwrap().unwrap().id, fresh.id);
    }

    #[test]
    fn test_abort_marks_running_record() {
        let store = MemoryStore::new();
        assert!(abort_running(&store, Utc::now()).unwrap().is_none());

        let run = begin_run(&store, false, Utc::now()).unwrap();
        let aborted = abort_running(&store, Utc::now()).unwrap().unwrap();
        assert_eq!(aborted.id, run.id);
        assert_eq!(aborted.status, RunStatus::Aborted);
        assert!(store.find_running().unwrap().is_none());
    }

    #[test]
    fn test_exit_codes_map_to_statuses() {
        let cases = [
            (ChildExit::Code(0), RunStatus::Success),
            (ChildExit::Code(1), RunStatus::Error),
            (ChildExit::Code(2), RunStatus::Paused),
            (ChildExit::Code(101), RunStatus::Error),
            (ChildExit::Signal, RunStatus::Aborted),
        ];
        for (exit, expected) in cases {
            let mut run = RunRecord::start(Utc::now());
            finalize(&mut run, &mut OutputTracker::new(), exit, Utc::now());
            assert_eq!(run.status, expected, "{exit:?}");
        }
    }

    #[test]
    fn test_tracker_reads_protocol_lines() {
        let mut tracker = OutputTracker::new();
        tracker.push_line(r#"[[LBC_PROGRESS]] {"phase":"list","page":1,"totalPages":2}"#);
        tracker.push_line(r#"[[LBC_METRICS]] {"created":2,"updated":1,"skippedRecent":0,"cooldownHours":0}"#);
        tracker.push_line("Scraping completed: 3 listings collected");

        let mut run = RunRecord::start(Utc::now());
        tracker.apply(&mut run);
        assert_eq!(run.progress, 0.25);
        assert_eq!(run.message.as_deref(), Some("Listing page 1/2"));
        assert_eq!((run.created, run.updated, run.collected), (2, 1, 3));
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_log_tail_is_bounded() {
        let mut tracker = OutputTracker::new();
        for i in 0..2000 {
            tracker.push_line(&format!("log line {i}"));
        }
        assert!(tracker.tail().chars().count() <= LOG_TAIL_CHARS);
        assert!(tracker.tail().ends_with("log line 1999\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_stops_foreign_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();

        terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(ChildExit::from(status), ChildExit::Signal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tracked_child_settles_record() {
        let store = MemoryStore::new();
        let run = begin_run(&store, false, Utc::now()).unwrap();

        let mut command = Command::new("sh");
        command.arg("-c").arg(
            r#"echo '[[LBC_METRICS]] {"created":3,"updated":0,"skippedRecent":0,"cooldownHours":0}'; echo 'Scraping completed: 3 listings collected'; exit 0"#,
        );

        let settled = run_tracked(&store, run, command, false, Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(settled.status, RunStatus::Success);
        assert_eq!(settled.created, 3);
        assert_eq!(settled.collected, 3);
        assert_eq!(settled.progress, 1.0);
        assert!(settled.log_tail.contains("Scraping completed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_paused_child_keeps_paused_status() {
        let store = MemoryStore::new();
        let run = begin_run(&store, false, Utc::now()).unwrap();

        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 2");

        let settled = run_tracked(&store, run, command, false, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(settled.status, RunStatus::Paused);
    }
}
