//! Operation facade: the seam an RPC transport plugs into.
//!
//! Five operations are exposed, each gated by the caller's role. The
//! transport layer is expected to derive the role from the verified client
//! certificate's organizational unit and pass it down; everything below the
//! role check is transport-agnostic.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cgroup::{CgroupController, CgroupProbe};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{Job, JobSpec, is_valid_job_id};
use crate::store::{JobStore, Subscription};
use crate::supervisor::Supervisor;

/// Caller role, derived from the certificate subject's OU field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    /// Map a certificate organizational unit to a role. Anything but the
    /// two known values is rejected.
    pub fn from_organizational_unit(ou: &str) -> Result<Role> {
        match ou {
            "admin" => Ok(Role::Admin),
            "viewer" => Ok(Role::Viewer),
            other => Err(Error::permission_denied(format!(
                "unknown organizational unit {other:?}"
            ))),
        }
    }

    pub fn permits(&self, op: Operation) -> bool {
        match self {
            Role::Admin => true,
            Role::Viewer => matches!(
                op,
                Operation::GetJob | Operation::ListJobs | Operation::StreamJobOutput
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateJob,
    GetJob,
    StopJob,
    ListJobs,
    StreamJobOutput,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateJob => "create_job",
            Operation::GetJob => "get_job",
            Operation::StopJob => "stop_job",
            Operation::ListJobs => "list_jobs",
            Operation::StreamJobOutput => "stream_job_output",
        }
    }
}

/// The assembled engine behind the operation surface.
pub struct JobService {
    store: Arc<JobStore>,
    cgroups: Arc<CgroupController>,
    supervisor: Supervisor,
    max_chunk_bytes: usize,
}

impl JobService {
    /// Assemble the engine. Stale cgroups from a previous process are swept
    /// immediately: jobs do not survive a restart, so leftovers are always
    /// garbage.
    pub fn new(config: Config) -> JobService {
        let cgroups = Arc::new(CgroupController::new(&config.cgroup));
        let swept = cgroups.sweep_stale();
        if swept > 0 {
            info!(swept, "removed stale cgroups from a previous run");
        }
        let store = Arc::new(JobStore::new(config.max_buffer_bytes));
        let max_chunk_bytes = config.max_chunk_bytes.max(1);
        let config = Arc::new(config);
        let supervisor = Supervisor::new(Arc::clone(&store), Arc::clone(&cgroups), config);
        JobService {
            store,
            cgroups,
            supervisor,
            max_chunk_bytes,
        }
    }

    fn authorize(&self, role: Role, op: Operation) -> Result<()> {
        if role.permits(op) {
            Ok(())
        } else {
            Err(Error::permission_denied(format!(
                "role does not permit {}",
                op.as_str()
            )))
        }
    }

    /// Launch a new job. Admin only.
    pub fn create_job(&self, role: Role, spec: JobSpec) -> Result<Job> {
        self.authorize(role, Operation::CreateJob)?;
        let job = self.supervisor.launch(spec)?;
        debug!(job_id = %job.id, "create_job accepted");
        Ok(job)
    }

    /// Current record of one job.
    pub fn get_job(&self, role: Role, id: &str) -> Result<Job> {
        self.authorize(role, Operation::GetJob)?;
        validate_id(id)?;
        let (job, _, _) = self.store.snapshot(id)?;
        Ok(job)
    }

    /// Stop a job. Admin only; idempotent.
    pub fn stop_job(&self, role: Role, id: &str) -> Result<Job> {
        self.authorize(role, Operation::StopJob)?;
        validate_id(id)?;
        self.supervisor.stop(id)
    }

    /// All jobs, ordered by start time.
    pub fn list_jobs(&self, role: Role) -> Result<Vec<Job>> {
        self.authorize(role, Operation::ListJobs)?;
        Ok(self.store.list())
    }

    /// Stream a job's output: the retained buffer first, then — if the job
    /// is still running — every chunk as it arrives, ending after the
    /// terminal update. A job that already ended yields its complete output
    /// followed by end-of-stream.
    pub fn stream_output(&self, role: Role, id: &str) -> Result<OutputStream> {
        self.authorize(role, Operation::StreamJobOutput)?;
        validate_id(id)?;
        match self.store.subscribe(id) {
            Ok((sub, job, buffer)) => {
                debug!(job_id = %job.id, "streaming live");
                Ok(OutputStream::live(buffer, sub, self.max_chunk_bytes))
            }
            Err(Error::FailedPrecondition(_)) => {
                // Not running (any more): the retained buffer is the whole
                // story.
                let (_, buffer, _) = self.store.snapshot(id)?;
                Ok(OutputStream::historical(buffer, self.max_chunk_bytes))
            }
            Err(e) => Err(e),
        }
    }

    /// Inspect the configured cgroup base (`jobward check`).
    pub fn probe_cgroups(&self) -> CgroupProbe {
        self.cgroups.probe()
    }
}

fn validate_id(id: &str) -> Result<()> {
    if is_valid_job_id(id) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!("malformed job id {id:?}")))
    }
}

/// Blocking iterator over a job's output chunks. Ends cleanly after the
/// terminal update, or immediately after the historical replay when the job
/// was already done. Dropping it mid-stream unsubscribes.
pub struct OutputStream {
    pending: VecDeque<Vec<u8>>,
    sub: Option<Subscription>,
    max_chunk_bytes: usize,
}

impl OutputStream {
    fn historical(buffer: Vec<u8>, max_chunk_bytes: usize) -> OutputStream {
        let mut stream = OutputStream {
            pending: VecDeque::new(),
            sub: None,
            max_chunk_bytes,
        };
        stream.push_split(buffer);
        stream
    }

    fn live(buffer: Vec<u8>, sub: Subscription, max_chunk_bytes: usize) -> OutputStream {
        let mut stream = OutputStream {
            pending: VecDeque::new(),
            sub: Some(sub),
            max_chunk_bytes,
        };
        stream.push_split(buffer);
        stream
    }

    fn push_split(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if bytes.len() <= self.max_chunk_bytes {
            self.pending.push_back(bytes);
            return;
        }
        for piece in bytes.chunks(self.max_chunk_bytes) {
            self.pending.push_back(piece.to_vec());
        }
    }
}

impl Iterator for OutputStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if let Some(chunk) = self.pending.pop_front() {
            return Some(chunk);
        }
        self.sub.as_ref()?;
        loop {
            let recv_result = self.sub.as_ref().unwrap().recv();
            match recv_result {
                Ok(update) => {
                    if update.chunk.is_empty() {
                        // Status-only update: the terminal transition.
                        self.sub = None;
                        return None;
                    }
                    self.push_split(update.chunk);
                    if let Some(chunk) = self.pending.pop_front() {
                        return Some(chunk);
                    }
                }
                Err(_) => {
                    // Channel closed: evicted as a slow consumer, or the
                    // terminal update was already taken.
                    self.sub = None;
                    return None;
                }
            }
        }
    }
}
