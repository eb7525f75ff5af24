//! In-memory job registry: the single source of truth for job state and
//! output.
//!
//! All mutation goes through the store; all reads take point-in-time copies.
//! State for a single job lives behind one mutex, so lifecycle transitions,
//! appends, and subscription changes for that job are serialized, while
//! different jobs proceed independently. Nothing under that mutex waits on
//! a subscriber: delivery hand-off is non-blocking, and the slow-subscriber
//! grace period runs on per-subscriber delivery threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use tracing::debug;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::job::{Job, JobSpec, JobStatus, Update, is_valid_job_id};
use crate::task::Task;

/// Lock a mutex, recovering the inner value if a worker thread panicked
/// while holding it. A panicked worker fails only its own job; the registry
/// stays usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry entry for one job. The stop flags live outside the task mutex
/// so a stop request can be recorded and read without taking it.
/// `stop_requested` is the intent (it decides the terminal state and aborts
/// a launch in flight); `stop_signaled` ensures at most one stop caller
/// actually delivers signals.
pub(crate) struct JobEntry {
    pub(crate) task: Mutex<Task>,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) stop_signaled: AtomicBool,
}

/// Thread-safe registry of jobs keyed by id.
pub struct JobStore {
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
    max_buffer_bytes: u64,
    next_token: AtomicU64,
}

impl JobStore {
    pub fn new(max_buffer_bytes: u64) -> JobStore {
        JobStore {
            jobs: Mutex::new(HashMap::new()),
            max_buffer_bytes,
            next_token: AtomicU64::new(1),
        }
    }

    /// Validate the spec, allocate an id, and register the job in
    /// `Initializing` state. Returns a copy of the new record.
    pub fn create_pending(&self, spec: &JobSpec) -> Result<Job> {
        spec.validate()?;
        let mut jobs = lock(&self.jobs);
        let id = loop {
            let candidate = Ulid::new().to_string();
            if !jobs.contains_key(&candidate) {
                break candidate;
            }
        };
        debug_assert!(is_valid_job_id(&id));
        let job = Job::new(id.clone(), spec);
        jobs.insert(
            id.clone(),
            Arc::new(JobEntry {
                task: Mutex::new(Task::new(job.clone())),
                stop_requested: AtomicBool::new(false),
                stop_signaled: AtomicBool::new(false),
            }),
        );
        debug!(job_id = %id, command = %spec.command, "job registered");
        Ok(job)
    }

    pub(crate) fn entry(&self, id: &str) -> Result<Arc<JobEntry>> {
        lock(&self.jobs)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))
    }

    /// Transition `Initializing` → `Running`, recording pid and start time.
    pub fn mark_running(&self, id: &str, pid: u32, start_time: SystemTime) -> Result<()> {
        let entry = self.entry(id)?;
        let mut task = lock(&entry.task);
        if task.job.status != JobStatus::Initializing {
            return Err(Error::internal(format!(
                "illegal transition to running from {}",
                task.job.status.as_str()
            )));
        }
        task.job.status = JobStatus::Running;
        task.job.pid = pid;
        task.job.start_time = Some(start_time);
        debug!(job_id = %id, pid, "job running");
        Ok(())
    }

    /// Transition into a terminal state, broadcast the final update to every
    /// subscriber, and close the job to further subscription. Calling this
    /// on a job that is already terminal is a no-op.
    pub fn mark_terminal(
        &self,
        id: &str,
        status: JobStatus,
        exit_code: Option<i32>,
        end_time: SystemTime,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::internal(format!(
                "{} is not a terminal status",
                status.as_str()
            )));
        }
        let entry = self.entry(id)?;
        let mut task = lock(&entry.task);
        match task.job.status {
            JobStatus::Running => {}
            JobStatus::Initializing if status == JobStatus::Failed => {}
            JobStatus::Initializing => {
                return Err(Error::internal(format!(
                    "illegal transition from initializing to {}",
                    status.as_str()
                )));
            }
            _ => return Ok(()),
        }
        task.job.status = status;
        task.job.exit_code = exit_code;
        task.job.end_time = Some(end_time);
        if task.job.start_time.is_none() {
            // A job that failed during setup never ran; its lifetime is a
            // point.
            task.job.start_time = Some(end_time);
        }
        task.publish_terminal();
        debug!(job_id = %id, status = status.as_str(), ?exit_code, "job terminal");
        Ok(())
    }

    /// Record the job's cgroup directory once the resource controller has
    /// created it.
    pub(crate) fn record_cgroup(&self, id: &str, path: &std::path::Path) -> Result<()> {
        let entry = self.entry(id)?;
        lock(&entry.task).job.cgroup_path = Some(path.to_path_buf());
        Ok(())
    }

    /// Append bytes to the job's output buffer and hand them to current
    /// subscribers' delivery threads. Never waits on any subscriber.
    /// Appending to a terminal job is a no-op.
    pub fn append(&self, id: &str, chunk: &[u8]) {
        let Ok(entry) = self.entry(id) else {
            return;
        };
        let mut task = lock(&entry.task);
        if task.job.status.is_terminal() {
            return;
        }
        task.append(chunk, self.max_buffer_bytes);
    }

    /// Consistent tuple: a copy of the job record, a copy of the output
    /// buffer, and whether the job was running at the observation point.
    pub fn snapshot(&self, id: &str) -> Result<(Job, Vec<u8>, bool)> {
        let entry = self.entry(id)?;
        let task = lock(&entry.task);
        let running = task.job.status == JobStatus::Running;
        Ok((task.job.clone(), task.buffer_snapshot(), running))
    }

    /// Bytes trimmed from the front of the job's buffer by the rolling cap.
    pub fn discarded_bytes(&self, id: &str) -> Result<u64> {
        let entry = self.entry(id)?;
        Ok(lock(&entry.task).discarded_bytes())
    }

    /// Copies of every job, ordered by start time ascending. Jobs that have
    /// not started yet sort first, by id.
    pub fn list(&self) -> Vec<Job> {
        let entries: Vec<Arc<JobEntry>> = lock(&self.jobs).values().cloned().collect();
        let mut jobs: Vec<Job> = entries.iter().map(|e| lock(&e.task).job.clone()).collect();
        jobs.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    /// Register a live subscriber for a running job. The returned buffer
    /// copy and the subscription are taken in one critical section, so the
    /// subscriber sees every byte exactly once: the copy holds everything
    /// appended before registration, the mailbox everything after.
    pub fn subscribe(&self, id: &str) -> Result<(Subscription, Job, Vec<u8>)> {
        let entry = self.entry(id)?;
        let mut task = lock(&entry.task);
        if task.job.status != JobStatus::Running || task.is_closed() {
            return Err(Error::failed_precondition(format!(
                "job {id} is not running"
            )));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let rx = task.add_subscriber(token);
        let job = task.job.clone();
        let buffer = task.buffer_snapshot();
        Ok((
            Subscription {
                job_id: id.to_string(),
                token,
                rx,
                entry: Arc::downgrade(&entry),
            },
            job,
            buffer,
        ))
    }

    /// Remove a subscriber. Idempotent; unknown jobs and tokens are ignored.
    pub fn unsubscribe(&self, job_id: &str, token: u64) {
        if let Ok(entry) = self.entry(job_id) {
            lock(&entry.task).remove_subscriber(token);
        }
    }
}

/// A live output subscription. Dropping it removes the subscriber from the
/// job's task; a client going away never affects the job.
pub struct Subscription {
    job_id: String,
    token: u64,
    rx: Receiver<Update>,
    entry: Weak<JobEntry>,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Blocking receive. `Err` means the channel was closed: either the
    /// terminal update was already consumed or this subscriber was evicted.
    pub fn recv(&self) -> std::result::Result<Update, std::sync::mpsc::RecvError> {
        self.rx.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Update, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> std::result::Result<Update, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.upgrade() {
            lock(&entry.task).remove_subscriber(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobLimits;

    fn store() -> JobStore {
        JobStore::new(0)
    }

    fn echo_spec() -> JobSpec {
        JobSpec {
            command: "/bin/echo".to_string(),
            args: vec!["hi".to_string()],
            limits: JobLimits::default(),
        }
    }

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[test]
    fn create_registers_initializing_job() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        assert!(is_valid_job_id(&job.id));
        assert_eq!(job.status, JobStatus::Initializing);
        assert_eq!(job.pid, 0);
        let (copy, buf, running) = s.snapshot(&job.id).expect("snapshot");
        assert_eq!(copy.command, "/bin/echo");
        assert!(buf.is_empty());
        assert!(!running);
    }

    #[test]
    fn invalid_spec_is_not_registered() {
        let s = store();
        let spec = JobSpec {
            command: "rm; rm -rf /".to_string(),
            ..JobSpec::default()
        };
        assert!(s.create_pending(&spec).is_err());
        assert!(s.list().is_empty());
    }

    #[test]
    fn lifecycle_transitions() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        s.mark_running(&job.id, 42, now()).expect("running");
        let (copy, _, running) = s.snapshot(&job.id).expect("snapshot");
        assert_eq!(copy.status, JobStatus::Running);
        assert_eq!(copy.pid, 42);
        assert!(running);
        assert!(copy.start_time.is_some());

        s.mark_terminal(&job.id, JobStatus::Completed, Some(0), now())
            .expect("terminal");
        let (copy, _, running) = s.snapshot(&job.id).expect("snapshot");
        assert_eq!(copy.status, JobStatus::Completed);
        assert_eq!(copy.exit_code, Some(0));
        assert!(!running);
        assert!(copy.end_time.unwrap() >= copy.start_time.unwrap());
    }

    #[test]
    fn illegal_transitions_rejected() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        // Initializing may only fail, never complete or stop.
        assert!(
            s.mark_terminal(&job.id, JobStatus::Completed, Some(0), now())
                .is_err()
        );
        assert!(
            s.mark_terminal(&job.id, JobStatus::Stopped, None, now())
                .is_err()
        );
        // Running is only reachable from initializing.
        s.mark_running(&job.id, 1, now()).expect("running");
        assert!(s.mark_running(&job.id, 1, now()).is_err());
        // A second terminal transition is absorbed.
        s.mark_terminal(&job.id, JobStatus::Failed, Some(1), now())
            .expect("terminal");
        s.mark_terminal(&job.id, JobStatus::Completed, Some(0), now())
            .expect("no-op");
        let (copy, _, _) = s.snapshot(&job.id).expect("snapshot");
        assert_eq!(copy.status, JobStatus::Failed);
    }

    #[test]
    fn setup_failure_sets_start_time() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        s.mark_terminal(&job.id, JobStatus::Failed, None, now())
            .expect("terminal");
        let (copy, _, _) = s.snapshot(&job.id).expect("snapshot");
        assert!(copy.start_time.is_some());
        assert!(copy.end_time.unwrap() >= copy.start_time.unwrap());
    }

    #[test]
    fn append_after_terminal_is_noop() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        s.mark_running(&job.id, 1, now()).expect("running");
        s.append(&job.id, b"before");
        s.mark_terminal(&job.id, JobStatus::Completed, Some(0), now())
            .expect("terminal");
        s.append(&job.id, b"after");
        let (_, buf, _) = s.snapshot(&job.id).expect("snapshot");
        assert_eq!(buf, b"before");
    }

    #[test]
    fn unknown_job_is_not_found() {
        let s = store();
        assert!(matches!(s.snapshot("nope"), Err(Error::NotFound(_))));
        assert!(matches!(s.subscribe("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn list_orders_by_start_time() {
        let s = store();
        let a = s.create_pending(&echo_spec()).expect("create");
        let b = s.create_pending(&echo_spec()).expect("create");
        let c = s.create_pending(&echo_spec()).expect("create");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(200);
        s.mark_running(&b.id, 1, t0).expect("running");
        s.mark_running(&a.id, 2, t1).expect("running");
        let listed = s.list();
        assert_eq!(listed.len(), 3);
        // Unstarted first, then by start time ascending.
        assert_eq!(listed[0].id, c.id);
        assert_eq!(listed[1].id, b.id);
        assert_eq!(listed[2].id, a.id);
    }

    #[test]
    fn subscribe_requires_running() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        assert!(matches!(
            s.subscribe(&job.id),
            Err(Error::FailedPrecondition(_))
        ));
        s.mark_running(&job.id, 1, now()).expect("running");
        s.mark_terminal(&job.id, JobStatus::Completed, Some(0), now())
            .expect("terminal");
        assert!(matches!(
            s.subscribe(&job.id),
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[test]
    fn subscriber_sees_every_byte_exactly_once() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        s.mark_running(&job.id, 1, now()).expect("running");
        s.append(&job.id, b"early ");
        let (sub, _, replay) = s.subscribe(&job.id).expect("subscribe");
        assert_eq!(replay, b"early ");
        s.append(&job.id, b"late");
        let update = sub.recv().expect("live chunk");
        assert_eq!(update.chunk, b"late");
        s.mark_terminal(&job.id, JobStatus::Completed, Some(0), now())
            .expect("terminal");
        let last = sub.recv().expect("terminal update");
        assert!(last.chunk.is_empty());
        assert_eq!(last.status, JobStatus::Completed);
        assert!(sub.recv().is_err());
    }

    #[test]
    fn append_does_not_block_on_a_stalled_subscriber() {
        use crate::task::PUBLISH_DEADLINE;
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        s.mark_running(&job.id, 1, now()).expect("running");
        let (_sub, _, _) = s.subscribe(&job.id).expect("subscribe");
        // The subscriber never drains; its mailbox is full after two
        // chunks. Appends and reads must still go through immediately.
        let start = std::time::Instant::now();
        for _ in 0..5 {
            s.append(&job.id, b"x");
        }
        let (_, buf, _) = s.snapshot(&job.id).expect("snapshot");
        s.mark_terminal(&job.id, JobStatus::Completed, Some(0), now())
            .expect("terminal");
        assert!(start.elapsed() < PUBLISH_DEADLINE);
        assert_eq!(buf, b"xxxxx");
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let s = store();
        let job = s.create_pending(&echo_spec()).expect("create");
        s.mark_running(&job.id, 1, now()).expect("running");
        let (sub, _, _) = s.subscribe(&job.id).expect("subscribe");
        {
            let entry = s.entry(&job.id).expect("entry");
            assert_eq!(lock(&entry.task).subscriber_count(), 1);
        }
        drop(sub);
        let entry = s.entry(&job.id).expect("entry");
        assert_eq!(lock(&entry.task).subscriber_count(), 0);
        // Unsubscribing again is harmless.
        s.unsubscribe(&job.id, 1);
    }
}
