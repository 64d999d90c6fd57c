//! Waiting for asynchronous directory server work.
//!
//! Index builds and replica initialisation run in the background on the
//! directory server. Their progress shows up in attributes of an entry
//! that is polled with exponential backoff until it reports a result, the
//! overall time limit passes, or the wait is cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use backoff::ExponentialBackoffBuilder;
use log::{debug, warn};
use crate::commons::error::Error;
use crate::commons::SetupEmptyResult;
use crate::constants::{
    TASK_POLL_INITIAL_MILLIS, TASK_POLL_MAX_MILLIS, TASK_TIMEOUT_SECS,
};
use crate::directory::{Directory, Entry, ResultCode};


//------------ TaskPolicy ----------------------------------------------------

/// How to poll for a result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TaskPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl TaskPolicy {
    pub fn new(initial_interval: Duration, max_interval: Duration, timeout: Duration) -> Self {
        TaskPolicy { initial_interval, max_interval, timeout }
    }
}

impl Default for TaskPolicy {
    fn default() -> Self {
        TaskPolicy {
            initial_interval: Duration::from_millis(TASK_POLL_INITIAL_MILLIS),
            max_interval: Duration::from_millis(TASK_POLL_MAX_MILLIS),
            timeout: Duration::from_secs(TASK_TIMEOUT_SECS),
        }
    }
}


//------------ TaskProgress --------------------------------------------------

/// What a polled entry says about the work it tracks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskProgress {
    Running,
    Finished,
    Failed(String),
}

impl TaskProgress {
    /// Reads the state of a `cn=tasks,cn=config` entry.
    pub fn of_task(entry: &Entry) -> Self {
        match entry.first("nsTaskExitCode").map(str::trim) {
            None => TaskProgress::Running,
            Some("0") => TaskProgress::Finished,
            Some(code) => TaskProgress::Failed(format!(
                "exit code {code}: {}",
                entry.first("nsTaskStatus").unwrap_or("no status")
            )),
        }
    }

    /// Reads the state of a total update of a replication agreement.
    ///
    /// The status starts with a numeric code, zero meaning success.
    pub fn of_replica_init(entry: &Entry) -> Self {
        match entry.first("nsds5ReplicaLastInitStatus").map(str::trim) {
            None | Some("") => TaskProgress::Running,
            Some(status) => {
                let code = status.split_whitespace().next().unwrap_or_default();
                if code == "0" {
                    TaskProgress::Finished
                } else if entry.has_attr("nsds5BeginReplicaRefresh") {
                    // Status of an earlier run, a new one is pending.
                    TaskProgress::Running
                } else {
                    TaskProgress::Failed(status.to_string())
                }
            }
        }
    }
}


//------------ TaskPoller ----------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct TaskPoller {
    policy: TaskPolicy,
    cancelled: Arc<AtomicBool>,
}

impl TaskPoller {
    pub fn new(policy: TaskPolicy) -> Self {
        TaskPoller {
            policy,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst)
    }

    /// Waits until the task at `dn` has finished.
    pub fn wait_for_task(&self, dir: &dyn Directory, dn: &str) -> SetupEmptyResult {
        self.wait(dir, dn, TaskProgress::of_task)
    }

    /// Polls `dn` until `progress` says it is done.
    ///
    /// A missing entry counts as still running since some servers only
    /// show tasks a moment after they were submitted.
    pub fn wait<F>(&self, dir: &dyn Directory, dn: &str, progress: F) -> SetupEmptyResult
    where
        F: Fn(&Entry) -> TaskProgress,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.initial_interval)
            .with_max_interval(self.policy.max_interval)
            .with_max_elapsed_time(Some(self.policy.timeout))
            .build();

        let op = || {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(backoff::Error::permanent(Error::custom(format!(
                    "waiting for '{dn}' was cancelled"
                ))));
            }
            let entry = match dir.read(dn) {
                Ok(entry) => entry,
                Err(err) if err.code() == ResultCode::NoSuchObject => {
                    return Err(backoff::Error::transient(
                        Error::TaskTimeout(dn.to_string())
                    ))
                }
                Err(err) => return Err(backoff::Error::permanent(err.into())),
            };
            match progress(&entry) {
                TaskProgress::Finished => Ok(()),
                TaskProgress::Running => Err(backoff::Error::transient(
                    Error::TaskTimeout(dn.to_string())
                )),
                TaskProgress::Failed(status) => Err(backoff::Error::permanent(
                    Error::TaskFailed { dn: dn.to_string(), status }
                )),
            }
        };

        let notify = |_err: Error, next: Duration| {
            debug!("'{dn}' still running, checking again in {}ms", next.as_millis());
        };

        match backoff::retry_notify(policy, op, notify) {
            Ok(()) => {
                debug!("'{dn}' finished");
                Ok(())
            }
            Err(backoff::Error::Permanent(err)) => {
                warn!("{err}");
                Err(err)
            }
            Err(backoff::Error::Transient { err, .. }) => {
                warn!("Gave up waiting for '{dn}' after {}s", self.policy.timeout.as_secs());
                Err(err)
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn quick() -> TaskPoller {
        TaskPoller::new(TaskPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(20),
            Duration::from_millis(150),
        ))
    }

    fn task(dn: &str) -> Entry {
        Entry::new(dn)
            .with("objectClass", "top")
            .with("objectClass", "extensibleObject")
    }

    #[test]
    fn finished_task() {
        let dir = MemoryDirectory::new();
        let dn = "cn=t1,cn=index,cn=tasks,cn=config";
        dir.add(task(dn)).unwrap();
        quick().wait_for_task(&dir, dn).unwrap();
    }

    #[test]
    fn failed_task() {
        let dir = MemoryDirectory::new();
        dir.set_task_exit_code(Some(53));
        let dn = "cn=t2,cn=index,cn=tasks,cn=config";
        dir.add(task(dn)).unwrap();
        assert!(matches!(
            quick().wait_for_task(&dir, dn),
            Err(Error::TaskFailed { .. })
        ));
    }

    #[test]
    fn running_task_times_out() {
        let dir = MemoryDirectory::new();
        dir.set_task_exit_code(None);
        let dn = "cn=t3,cn=index,cn=tasks,cn=config";
        dir.add(task(dn)).unwrap();
        assert!(matches!(
            quick().wait_for_task(&dir, dn),
            Err(Error::TaskTimeout(_))
        ));
    }

    #[test]
    fn cancelled_wait_stops() {
        let dir = MemoryDirectory::new();
        dir.set_task_exit_code(None);
        let dn = "cn=t4,cn=index,cn=tasks,cn=config";
        dir.add(task(dn)).unwrap();
        let poller = TaskPoller::new(TaskPolicy::default());
        poller.cancel();
        assert!(matches!(
            poller.wait_for_task(&dir, dn),
            Err(Error::Custom(_))
        ));
    }

    #[test]
    fn replica_init_status() {
        let running = Entry::new("cn=a").with("nsds5BeginReplicaRefresh", "start");
        assert_eq!(TaskProgress::of_replica_init(&running), TaskProgress::Running);
        let done = Entry::new("cn=a").with("nsds5ReplicaLastInitStatus", "0 Total update succeeded");
        assert_eq!(TaskProgress::of_replica_init(&done), TaskProgress::Finished);
        let failed = Entry::new("cn=a").with("nsds5ReplicaLastInitStatus", "-1 Total update aborted");
        assert!(matches!(TaskProgress::of_replica_init(&failed), TaskProgress::Failed(_)));
    }
}
