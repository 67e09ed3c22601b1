//! Running/stopped view of servers, reconciled against OS liveness.

use crate::process::{Probe, ProcessManager};
use crate::server::ServerRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Running,
    Starting,
    Stopped,
    /// The check itself failed or timed out
    Error,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::Running => "running",
            ServerState::Starting => "starting",
            ServerState::Stopped => "stopped",
            ServerState::Error => "error",
        })
    }
}

/// Status of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerStatus {
    fn with_state(name: &str, state: ServerState) -> Self {
        Self {
            name: name.to_string(),
            state,
            pid: None,
            endpoint: None,
            started_at: None,
            uptime_secs: None,
            error: None,
        }
    }

    fn failed(name: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_state(name, ServerState::Error)
        }
    }

    fn from_probe(name: &str, probe: Probe) -> Self {
        match probe {
            Probe::Stopped => Self::with_state(name, ServerState::Stopped),
            Probe::Starting => Self::with_state(name, ServerState::Starting),
            Probe::Running(handle) => Self {
                pid: handle.pid(),
                endpoint: handle.endpoint().map(str::to_string),
                started_at: Some(handle.started_at),
                uptime_secs: Some(handle.uptime().as_secs()),
                ..Self::with_state(name, ServerState::Running)
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }
}

/// Derives server status from a [`ProcessManager`].
pub struct StatusMonitor {
    manager: ProcessManager,
    check_timeout: Duration,
}

impl StatusMonitor {
    pub fn new(manager: ProcessManager, check_timeout: Duration) -> Self {
        Self {
            manager,
            check_timeout,
        }
    }

    /// Status of one server. A handle whose process has died is purged and
    /// reported as stopped.
    pub fn status(&self, name: &str) -> ServerStatus {
        ServerStatus::from_probe(name, self.manager.probe(name))
    }

    /// Status of every record, checked concurrently. Results keep the order
    /// of `records`; a check that fails or times out yields an `error`
    /// status for that server alone.
    pub async fn status_all(&self, records: &[ServerRecord]) -> Vec<ServerStatus> {
        let mut checks = JoinSet::new();
        for (index, record) in records.iter().enumerate() {
            let manager = self.manager.clone();
            let name = record.name.clone();
            let timeout = self.check_timeout;

            checks.spawn(async move {
                let probe = tokio::task::spawn_blocking({
                    let name = name.clone();
                    move || manager.probe(&name)
                });
                let status = match tokio::time::timeout(timeout, probe).await {
                    Ok(Ok(probe)) => ServerStatus::from_probe(&name, probe),
                    Ok(Err(e)) => ServerStatus::failed(&name, format!("status check failed: {}", e)),
                    Err(_) => ServerStatus::failed(
                        &name,
                        format!("status check timed out after {:?}", timeout),
                    ),
                };
                (index, status)
            });
        }

        let mut statuses: Vec<Option<ServerStatus>> = vec![None; records.len()];
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((index, status)) => statuses[index] = Some(status),
                Err(e) => warn!("Status check task failed: {}", e),
            }
        }

        statuses
            .into_iter()
            .zip(records)
            .map(|(status, record)| {
                status.unwrap_or_else(|| ServerStatus::failed(&record.name, "status check aborted"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ConfigPaths;
    use crate::process::{is_alive, ManagerOptions};
    use tempfile::TempDir;

    fn monitor(dir: &TempDir) -> (ProcessManager, StatusMonitor) {
        let manager =
            ProcessManager::load(&ConfigPaths::sandboxed(dir.path()), ManagerOptions::default())
                .unwrap();
        let monitor = StatusMonitor::new(manager.clone(), Duration::from_secs(2));
        (manager, monitor)
    }

    #[tokio::test]
    async fn test_unknown_server_is_stopped() {
        let dir = TempDir::new().unwrap();
        let (_, monitor) = monitor(&dir);
        let status = monitor.status("nobody");
        assert_eq!(status.state, ServerState::Stopped);
        assert_eq!(status.pid, None);
    }

    #[tokio::test]
    async fn test_status_all_keeps_order_and_reports_each_server() {
        let dir = TempDir::new().unwrap();
        let (manager, monitor) = monitor(&dir);
        let records = vec![
            ServerRecord::command("zeta", "sh", ["-c", "exit 0"]),
            ServerRecord::command("alpha", "sh", ["-c", "sleep 30"]),
            ServerRecord::command("mid", "sh", ["-c", "sleep 30"]),
        ];
        let handle = manager.start(&records[1]).await.unwrap();

        let statuses = monitor.status_all(&records).await;
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);

        assert_eq!(statuses[0].state, ServerState::Stopped);
        assert_eq!(statuses[1].state, ServerState::Running);
        assert_eq!(statuses[1].pid, handle.pid());
        assert!(statuses[1].uptime_secs.is_some());
        assert_eq!(statuses[2].state, ServerState::Stopped);

        manager.shutdown().await;
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_running_then_stopped_after_stop() {
        let dir = TempDir::new().unwrap();
        let (manager, monitor) = monitor(&dir);
        let alpha = ServerRecord::command("alpha", "sh", ["-c", "echo hi; sleep 30"]);

        let handle = manager.start(&alpha).await.unwrap();
        let pid = handle.pid().unwrap();

        let running = monitor.status("alpha");
        assert_eq!(running.state, ServerState::Running);
        assert_eq!(running.pid, Some(pid));
        assert!(running.started_at.is_some());

        manager.stop("alpha").await.unwrap();
        manager.wait_for_terminations().await;
        assert!(eventually(|| !is_alive(pid)).await);

        let stopped = monitor.status("alpha");
        assert_eq!(stopped.state, ServerState::Stopped);
        assert_eq!(stopped.pid, None);
    }

    #[tokio::test]
    async fn test_crashed_process_is_purged_and_stopped() {
        let dir = TempDir::new().unwrap();
        let (manager, monitor) = monitor(&dir);
        let crashy = ServerRecord::command("crashy", "sh", ["-c", "sleep 30"]);

        let handle = manager.start(&crashy).await.unwrap();
        let pid = handle.pid().unwrap();
        assert!(monitor.status("crashy").is_running());

        // Kill it behind the manager's back
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        assert!(eventually(|| monitor.status("crashy").state == ServerState::Stopped).await);

        assert!(manager.running().is_empty());
        assert!(matches!(
            manager.stop("crashy").await,
            Err(crate::Error::NotRunning(_))
        ));
    }

    #[test]
    fn test_status_serializes_without_empty_fields() {
        let status = ServerStatus::with_state("alpha", ServerState::Stopped);
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({"name": "alpha", "state": "stopped"})
        );
    }
}
