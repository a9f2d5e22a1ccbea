//! RunnerLock - 1 つのストアディレクトリを使う `gleaner run` を 1 本に絞る
//!
//! `gleaner run` は `<store>/runner.lock` を取り、heartbeat で更新し続けます。
//! 単発コマンド（enqueue / pause / resume / stop / status）は lock が生きている間は
//! ストアに触らず、実行中のプロセスへ stdin で送るよう促します。
//! heartbeat が `stale_after` より古い lock は落ちたプロセスの残骸として引き継ぎます。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ports::Clock;

const LOCK_FILE: &str = "runner.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(
        "a runner (pid {pid}) is using this store, last heartbeat {last_heartbeat}; \
         send the command on its stdin instead"
    )]
    Held {
        pid: u32,
        last_heartbeat: DateTime<Utc>,
    },

    #[error("runner lock I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("runner lock is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct RunnerLock {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl RunnerLock {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            clock,
            stale_after,
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub async fn read(&self) -> Result<Option<LockInfo>, LockError> {
        match fs::read(self.path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_live(&self, info: &LockInfo) -> bool {
        // a heartbeat from the future (clock skew) counts as live
        (self.clock.now() - info.last_heartbeat)
            .to_std()
            .map_or(true, |age| age <= self.stale_after)
    }

    /// Fails with `Held` while a live runner owns the store.
    pub async fn ensure_free(&self) -> Result<(), LockError> {
        match self.read().await? {
            Some(info) if self.is_live(&info) => Err(LockError::Held {
                pid: info.pid,
                last_heartbeat: info.last_heartbeat,
            }),
            _ => Ok(()),
        }
    }

    /// Take the lock and keep it fresh every `heartbeat` until the guard drops.
    pub async fn acquire(&self, heartbeat: Duration) -> Result<LockGuard, LockError> {
        fs::create_dir_all(&self.dir).await?;
        let now = self.clock.now();
        let info = LockInfo {
            pid: std::process::id(),
            started_at: now,
            last_heartbeat: now,
        };

        for _ in 0..2 {
            match self.create(&info).await {
                Ok(()) => {
                    debug!(pid = info.pid, path = %self.path().display(), "runner lock acquired");
                    return Ok(LockGuard::spawn(
                        self.path(),
                        info,
                        self.clock.clone(),
                        heartbeat,
                    ));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let existing = match self.read().await {
                        Ok(existing) => existing,
                        Err(LockError::Codec(e)) => {
                            warn!(error = %e, "unreadable runner lock; taking it over");
                            None
                        }
                        Err(e) => return Err(e),
                    };
                    if let Some(existing) = existing {
                        if self.is_live(&existing) {
                            return Err(LockError::Held {
                                pid: existing.pid,
                                last_heartbeat: existing.last_heartbeat,
                            });
                        }
                        info!(old_pid = existing.pid, "removing stale runner lock");
                    }
                    match fs::remove_file(self.path()).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // someone else won the race for the stale lock
        match self.read().await? {
            Some(existing) => Err(LockError::Held {
                pid: existing.pid,
                last_heartbeat: existing.last_heartbeat,
            }),
            None => Err(std::io::Error::other("runner lock vanished during acquisition").into()),
        }
    }

    /// Write the full contents aside, then hard-link into place: the link fails
    /// if the lock exists, and readers never see a half-written file.
    async fn create(&self, info: &LockInfo) -> std::io::Result<()> {
        let tmp = self
            .dir
            .join(format!("{LOCK_FILE}.{}.tmp", std::process::id()));
        fs::write(&tmp, serde_json::to_vec(info)?).await?;
        let linked = fs::hard_link(&tmp, self.path()).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            debug!(error = %e, "failed to remove runner lock temp file");
        }
        linked
    }
}

/// Releases the lock file on drop.
pub struct LockGuard {
    path: PathBuf,
    shutdown_tx: Option<watch::Sender<bool>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn spawn(path: PathBuf, info: LockInfo, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            path.clone(),
            info,
            clock,
            interval,
            shutdown_rx,
        ));
        Self {
            path,
            shutdown_tx: Some(shutdown_tx),
            heartbeat: Some(heartbeat),
        }
    }
}

async fn heartbeat_loop(
    path: PathBuf,
    mut info: LockInfo,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info.last_heartbeat = clock.now();
                if let Err(e) = write_heartbeat(&path, &info).await {
                    warn!(error = %e, "runner lock heartbeat failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn write_heartbeat(path: &Path, info: &LockInfo) -> std::io::Result<()> {
    let tmp = path.with_extension("lock.tmp");
    fs::write(&tmp, serde_json::to_vec(info)?).await?;
    fs::rename(&tmp, path).await
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to release runner lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn lock(dir: &Path, clock: Arc<FixedClock>) -> RunnerLock {
        RunnerLock::new(dir, clock, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn one_shot_commands_are_refused_while_a_runner_holds_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let runner = lock(dir.path(), clock.clone());
        let guard = runner.acquire(Duration::from_secs(10)).await.unwrap();

        let one_shot = lock(dir.path(), clock.clone());
        let err = one_shot.ensure_free().await.unwrap_err();
        assert!(matches!(err, LockError::Held { pid, .. } if pid == std::process::id()));
        assert!(matches!(
            one_shot.acquire(Duration::from_secs(10)).await,
            Err(LockError::Held { .. })
        ));

        drop(guard);
        one_shot.ensure_free().await.unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let crashed = lock(dir.path(), clock.clone())
            .acquire(Duration::from_secs(3600))
            .await
            .unwrap();
        // the process died without cleaning up
        std::mem::forget(crashed);

        clock.advance(chrono::Duration::seconds(31));
        let runner = lock(dir.path(), clock.clone());
        runner.ensure_free().await.unwrap();
        let _guard = runner.acquire(Duration::from_secs(3600)).await.unwrap();
        let info = runner.read().await.unwrap().unwrap();
        assert_eq!(info.last_heartbeat, t0() + chrono::Duration::seconds(31));
    }

    #[tokio::test]
    async fn heartbeat_keeps_the_lock_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let runner = lock(dir.path(), clock.clone());
        let _guard = runner.acquire(Duration::from_millis(20)).await.unwrap();

        clock.advance(chrono::Duration::seconds(60));
        let refreshed = t0() + chrono::Duration::seconds(60);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let info = runner.read().await.unwrap().unwrap();
            if info.last_heartbeat == refreshed {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "heartbeat never landed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            lock(dir.path(), clock).ensure_free().await,
            Err(LockError::Held { .. })
        ));
    }
}
