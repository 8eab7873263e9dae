//! Registry of live worker processes.
//!
//! One `ProcessManager` is created by the binary and shared (`Arc`) with every
//! orchestrator run, so a double Ctrl-C can reach every child no matter which
//! run started it. Workers are spawned as process-group leaders and signals
//! go to the whole group, taking the worker's own children down with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Upper bound on waiting for a SIGKILLed child to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

struct TrackedChild {
    pid: u32,
    exited: watch::Receiver<bool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    children: HashMap<u64, TrackedChild>,
}

#[derive(Default)]
pub struct ProcessManager {
    registry: Mutex<Registry>,
    signals_sent: AtomicU64,
}

impl ProcessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a spawned child. Returns `None` (and tracks nothing) when the
    /// child has no pid, i.e. it already exited.
    ///
    /// The returned guard deregisters the child exactly once, on
    /// [`ChildGuard::mark_exited`] or on drop.
    pub fn register(self: &Arc<Self>, pid: Option<u32>) -> Option<ChildGuard> {
        let pid = pid?;
        let (tx, rx) = watch::channel(false);
        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.children.insert(id, TrackedChild { pid, exited: rx });
            id
        };
        debug!(pid, "Registered worker process");
        Some(ChildGuard {
            id,
            pid,
            manager: Arc::downgrade(self),
            exited: Some(tx),
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().children.len()
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().children.values().map(|c| c.pid).collect();
        pids.sort_unstable();
        pids
    }

    /// Number of signals delivered over this manager's lifetime.
    pub fn signals_sent(&self) -> u64 {
        self.signals_sent.load(Ordering::SeqCst)
    }

    /// Signal every tracked child, then forget them all.
    ///
    /// Children that are already gone are skipped silently. A second call with
    /// no new registrations does nothing.
    pub fn kill_all(&self, signal: Signal) -> usize {
        let drained: Vec<TrackedChild> = {
            let mut registry = self.lock();
            registry.children.drain().map(|(_, c)| c).collect()
        };
        for child in &drained {
            self.send(child.pid, signal);
        }
        drained.len()
    }

    /// Signal one worker's process group. Missing processes are ignored.
    pub fn signal(&self, pid: u32, signal: Signal) {
        self.send(pid, signal);
    }

    /// SIGTERM every child, wait up to `timeout` for them to exit, SIGKILL
    /// whatever is left, then forget them all.
    ///
    /// Children registered while this runs missed the SIGTERM and get SIGKILL.
    pub async fn kill_all_with_timeout(&self, timeout: Duration) {
        let snapshot: Vec<(u64, u32, watch::Receiver<bool>)> = {
            let registry = self.lock();
            registry
                .children
                .iter()
                .map(|(id, c)| (*id, c.pid, c.exited.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        for (_, pid, _) in &snapshot {
            self.send(*pid, Signal::Term);
        }
        let signalled: Vec<u64> = snapshot.iter().map(|(id, _, _)| *id).collect();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut stragglers = Vec::new();
        for (id, pid, mut exited) in snapshot {
            let timed_out = tokio::time::timeout_at(deadline, exited.wait_for(|done| *done))
                .await
                .is_err();
            if timed_out {
                stragglers.push((id, pid, exited));
            }
        }

        for (_, pid, _) in &stragglers {
            warn!(pid, "Worker ignored SIGTERM, sending SIGKILL");
            self.send(*pid, Signal::Kill);
        }
        for (_, pid, mut exited) in stragglers {
            let timed_out = tokio::time::timeout(KILL_REAP_TIMEOUT, exited.wait_for(|done| *done))
                .await
                .is_err();
            if timed_out {
                warn!(pid, "Killed worker was not reaped in time");
            }
        }

        let late: Vec<TrackedChild> = {
            let mut registry = self.lock();
            for id in &signalled {
                registry.children.remove(id);
            }
            registry.children.drain().map(|(_, c)| c).collect()
        };
        for child in &late {
            warn!(pid = child.pid, "Worker started during shutdown, sending SIGKILL");
            self.send(child.pid, Signal::Kill);
        }
    }

    /// Forget every tracked child without signalling. For test isolation.
    pub fn reset(&self) {
        self.lock().children.clear();
    }

    fn deregister(&self, id: u64) {
        self.lock().children.remove(&id);
    }

    fn send(&self, pid: u32, signal: Signal) {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // Process group first; fall back to the single process if it is not a group leader.
        // SAFETY: kill(2) has no memory-safety preconditions.
        let mut rc = unsafe { libc::kill(-pid, signal.as_raw()) };
        if rc != 0 && last_errno() == libc::ESRCH {
            rc = unsafe { libc::kill(pid, signal.as_raw()) };
        }
        if rc == 0 {
            self.signals_sent.fetch_add(1, Ordering::SeqCst);
            debug!(pid, ?signal, "Signalled worker");
        } else if last_errno() != libc::ESRCH {
            warn!(pid, ?signal, error = %std::io::Error::last_os_error(), "Failed to signal worker");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Registration handle for one child process.
pub struct ChildGuard {
    id: u64,
    pid: u32,
    manager: Weak<ProcessManager>,
    exited: Option<watch::Sender<bool>>,
}

impl ChildGuard {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Record that the child exited (or its handle closed).
    pub fn mark_exited(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(tx) = self.exited.take() else {
            return;
        };
        let _ = tx.send(true);
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister(self.id);
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn spawn_group(program: &str, args: &[&str]) -> tokio::process::Child {
        Command::new(program)
            .args(args)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    /// Register a child and reap it in the background, like the orchestrator does.
    fn supervise(
        manager: &Arc<ProcessManager>,
        mut child: tokio::process::Child,
    ) -> tokio::task::JoinHandle<std::process::ExitStatus> {
        let guard = manager.register(child.id()).unwrap();
        tokio::spawn(async move {
            let status = child.wait().await.unwrap();
            guard.mark_exited();
            status
        })
    }

    #[test]
    fn test_register_without_pid_is_ignored() {
        let manager = ProcessManager::new();
        assert!(manager.register(None).is_none());
        assert_eq!(manager.tracked_count(), 0);
    }

    #[test]
    fn test_guard_deregisters_once() {
        let manager = ProcessManager::new();
        let a = manager.register(Some(1_000_001)).unwrap();
        let _b = manager.register(Some(1_000_001)).unwrap();
        assert_eq!(manager.tracked_count(), 2);

        a.mark_exited();
        assert_eq!(manager.tracked_count(), 1);
    }

    #[test]
    fn test_drop_deregisters() {
        let manager = ProcessManager::new();
        {
            let _guard = manager.register(Some(1_000_002)).unwrap();
            assert_eq!(manager.tracked_count(), 1);
        }
        assert_eq!(manager.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_deregister_on_exit() {
        let manager = ProcessManager::new();
        let handle = supervise(&manager, spawn_group("true", &[]));
        assert!(handle.await.unwrap().success());
        assert_eq!(manager.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_all_is_idempotent() {
        let manager = ProcessManager::new();
        let handle = supervise(&manager, spawn_group("sleep", &["30"]));

        assert_eq!(manager.kill_all(Signal::Term), 1);
        let sent = manager.signals_sent();
        assert_eq!(manager.tracked_count(), 0);

        assert_eq!(manager.kill_all(Signal::Term), 0);
        assert_eq!(manager.signals_sent(), sent);

        let status = handle.await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_kill_all_tolerates_dead_pids() {
        let manager = ProcessManager::new();
        let mut child = spawn_group("true", &[]);
        let guard = manager.register(child.id()).unwrap();
        child.wait().await.unwrap();

        // Reaped but not yet marked exited: the pid is gone.
        assert_eq!(manager.kill_all(Signal::Kill), 1);
        assert_eq!(manager.tracked_count(), 0);
        drop(guard);
    }

    #[tokio::test]
    async fn test_kill_all_with_timeout_graceful() {
        let manager = ProcessManager::new();
        let h1 = supervise(&manager, spawn_group("sleep", &["30"]));
        let h2 = supervise(&manager, spawn_group("sleep", &["30"]));

        manager
            .kill_all_with_timeout(Duration::from_secs(5))
            .await;

        assert_eq!(manager.tracked_count(), 0);
        for handle in [h1, h2] {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(handle.await.unwrap().signal(), Some(libc::SIGTERM));
        }

        let sent = manager.signals_sent();
        manager
            .kill_all_with_timeout(Duration::from_secs(5))
            .await;
        assert_eq!(manager.signals_sent(), sent);
    }

    #[tokio::test]
    async fn test_kill_all_with_timeout_escalates() {
        use std::os::unix::process::ExitStatusExt;

        let manager = ProcessManager::new();
        let handle = supervise(
            &manager,
            spawn_group("sh", &["-c", "trap '' TERM; sleep 30"]),
        );
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        manager
            .kill_all_with_timeout(Duration::from_millis(300))
            .await;

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(manager.tracked_count(), 0);
        assert_eq!(handle.await.unwrap().signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_kill_all_with_timeout_kills_late_registrations() {
        use std::os::unix::process::ExitStatusExt;

        let manager = ProcessManager::new();
        let stubborn = supervise(
            &manager,
            spawn_group("sh", &["-c", "trap '' TERM; sleep 30"]),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let late_manager = Arc::clone(&manager);
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            supervise(&late_manager, spawn_group("sleep", &["30"]))
        });

        manager
            .kill_all_with_timeout(Duration::from_millis(500))
            .await;

        assert_eq!(manager.tracked_count(), 0);
        assert_eq!(stubborn.await.unwrap().signal(), Some(libc::SIGKILL));
        let late = late.await.unwrap();
        assert_eq!(late.await.unwrap().signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_signal_reaches_process_group() {
        let manager = ProcessManager::new();
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let child = spawn_group("sh", &["-c", &script]);
        let pid = child.id().unwrap();
        let handle = supervise(&manager, child);

        let mut grandchild = None;
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&pid_file)
                && let Ok(p) = text.trim().parse::<libc::pid_t>()
            {
                grandchild = Some(p);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.unwrap();

        manager.signal(pid, Signal::Kill);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Gone, or a zombie waiting for init to reap it.
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", grandchild)).unwrap_or_default();
        let running = stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z");
        assert!(!running);
    }

    #[tokio::test]
    async fn test_kill_all_with_timeout_no_children() {
        let manager = ProcessManager::new();
        manager
            .kill_all_with_timeout(Duration::from_millis(10))
            .await;
        assert_eq!(manager.signals_sent(), 0);
    }
}
