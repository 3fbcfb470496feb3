use crate::config::ResolverKind;
use crate::error::ScoutError;
use crate::models::CaptchaNotification;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Where the "captcha solved" confirmation comes from
#[async_trait]
pub trait ResolutionSignal: Send + Sync {
    /// Block until the operator reports the challenge solved.
    /// An error means no resolution will ever arrive.
    async fn wait(&self, notification: &CaptchaNotification) -> Result<(), ScoutError>;

    /// Forget confirmations left over from an earlier pause
    async fn arm(&self) -> Result<(), ScoutError> {
        Ok(())
    }
}

/// Waits for the operator to press Enter on the controlling terminal
pub struct TerminalSignal;

#[async_trait]
impl ResolutionSignal for TerminalSignal {
    async fn wait(&self, notification: &CaptchaNotification) -> Result<(), ScoutError> {
        eprintln!("\n{}", notification.message);
        eprintln!("Press Enter once the captcha is solved...");

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            return Err(ScoutError::CaptchaUnresolved(
                "standard input closed before confirmation".into(),
            ));
        }
        Ok(())
    }
}

/// Waits for a marker file next to the notification, then consumes it
pub struct FileSignal {
    marker: PathBuf,
    poll: Duration,
}

impl FileSignal {
    pub fn new(marker: PathBuf, poll: Duration) -> Self {
        Self { marker, poll }
    }

    /// `<notification>.resolved`
    pub fn beside(notification_path: &Path) -> Self {
        let mut name = notification_path.as_os_str().to_owned();
        name.push(".resolved");
        Self::new(PathBuf::from(name), Duration::from_secs(2))
    }
}

#[cfg(test)]
impl FileSignal {
    pub fn marker(&self) -> &Path {
        &self.marker
    }
}

#[async_trait]
impl ResolutionSignal for FileSignal {
    async fn arm(&self) -> Result<(), ScoutError> {
        match tokio::fs::remove_file(&self.marker).await {
            Ok(()) => {
                info!(marker = %self.marker.display(), "Removed stale resolution marker");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait(&self, _notification: &CaptchaNotification) -> Result<(), ScoutError> {
        info!(marker = %self.marker.display(), "Waiting for captcha resolution marker");
        loop {
            if tokio::fs::try_exists(&self.marker).await? {
                if let Err(e) = tokio::fs::remove_file(&self.marker).await {
                    debug!(error = %e, "Resolution marker not removed");
                }
                return Ok(());
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

/// Unattended runs: nobody will ever solve the challenge
pub struct NoSignal;

#[async_trait]
impl ResolutionSignal for NoSignal {
    async fn wait(&self, _notification: &CaptchaNotification) -> Result<(), ScoutError> {
        Err(ScoutError::CaptchaUnresolved(
            "no resolution channel configured".into(),
        ))
    }
}

pub fn signal_for(kind: ResolverKind, notification_path: &Path) -> Box<dyn ResolutionSignal> {
    match kind {
        ResolverKind::Terminal => Box::new(TerminalSignal),
        ResolverKind::File => Box::new(FileSignal::beside(notification_path)),
        ResolverKind::None => Box::new(NoSignal),
    }
}

/// Hand the URL to the desktop's default browser. The launcher is reaped in the background.
pub fn open_in_browser(url: &str) -> std::io::Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        let mut c = Command::new("open");
        c.arg(url);
        c
    } else if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.args(["/C", "start", "", url]);
        c
    } else {
        let mut c = Command::new("xdg-open");
        c.arg(url);
        c
    };

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => debug!(%status, "Browser launcher exited"),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Browser launcher not reaped"),
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CaptchaDiagnostics, ChallengeType};
    use chrono::Utc;
    use tempfile::TempDir;

    fn notification() -> CaptchaNotification {
        CaptchaNotification {
            detected: true,
            challenge_type: ChallengeType::Unknown,
            url: "https://www.leboncoin.fr/".into(),
            diagnostics: CaptchaDiagnostics::default(),
            timestamp: Utc::now(),
            message: "solve it".into(),
        }
    }

    #[tokio::test]
    async fn test_file_signal_consumes_marker() {
        let dir = TempDir::new().unwrap();
        let signal = FileSignal::new(dir.path().join("solved"), Duration::from_millis(10));
        let marker = signal.marker().to_path_buf();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&marker, "ok").unwrap();
        });

        signal.wait(&notification()).await.unwrap();
        writer.await.unwrap();
        assert!(!signal.marker().exists());
    }

    #[tokio::test]
    async fn test_arming_discards_stale_marker() {
        let dir = TempDir::new().unwrap();
        let signal = FileSignal::new(dir.path().join("solved"), Duration::from_millis(10));
        std::fs::write(signal.marker(), "left from last run").unwrap();

        signal.arm().await.unwrap();
        assert!(!signal.marker().exists());

        let waited = tokio::time::timeout(Duration::from_millis(100), signal.wait(&notification())).await;
        assert!(waited.is_err(), "wait must not accept a marker from an earlier pause");

        // arming with nothing to remove is fine
        signal.arm().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_signal_never_resolves() {
        let err = NoSignal.wait(&notification()).await.unwrap_err();
        assert!(matches!(err, ScoutError::CaptchaUnresolved(_)));
    }

    #[test]
    fn test_marker_sits_beside_notification() {
        let signal = FileSignal::beside(Path::new("debug/captcha-notification.json"));
        assert_eq!(
            signal.marker(),
            Path::new("debug/captcha-notification.json.resolved")
        );
    }
}
