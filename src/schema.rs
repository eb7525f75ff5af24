//! JSON output types for the `jobward` binary.
//!
//! In `--json` mode all stdout output is JSON only; tracing logs go to
//! stderr.

use serde::Serialize;

use crate::error::Error;
use crate::job::{Job, JobLimits, format_rfc3339};

/// Serialize `value` to a JSON string and print it as a single line to
/// stdout.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Top-level envelope used for every successful response.
#[derive(Debug, Serialize)]
pub struct Response<T: Serialize> {
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            ok: true,
            kind,
            data,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    /// Whether the caller may retry the same request and expect a different
    /// outcome.
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn from_error(e: &Error) -> Self {
        ErrorResponse {
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: e.code().to_string(),
                message: e.to_string(),
                retryable: e.retryable(),
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Serialized view of one job record.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub limits: JobLimits,
    pub status: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<String>,
}

impl JobView {
    pub fn from_job(job: &Job) -> JobView {
        JobView {
            id: job.id.clone(),
            command: job.command.clone(),
            args: job.args.clone(),
            limits: job.limits,
            status: job.status.as_str().to_string(),
            pid: job.pid,
            exit_code: job.exit_code,
            start_time: job.start_time.map(format_rfc3339),
            end_time: job.end_time.map(format_rfc3339),
            cgroup_path: job.cgroup_path.as_ref().map(|p| p.display().to_string()),
        }
    }
}

/// Response for the `run` command in `--json` mode.
#[derive(Debug, Serialize)]
pub struct RunData {
    pub job: JobView,
    /// Total bytes of merged output the job produced.
    pub output_bytes: u64,
}

/// Response for the `check` command.
#[derive(Debug, Serialize)]
pub struct CheckData {
    pub cgroups: crate::cgroup::CgroupProbe,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, JobStatus};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn job_view_serializes_times_as_rfc3339() {
        let spec = JobSpec {
            command: "/bin/echo".to_string(),
            ..JobSpec::default()
        };
        let mut job = Job::new("abc".to_string(), &spec);
        job.status = JobStatus::Completed;
        job.exit_code = Some(0);
        job.start_time = Some(UNIX_EPOCH + Duration::from_secs(1_704_067_200));
        job.end_time = Some(UNIX_EPOCH + Duration::from_secs(1_704_067_260));
        let view = JobView::from_job(&job);
        let v = serde_json::to_value(&view).expect("serialize");
        assert_eq!(v["status"], "completed");
        assert_eq!(v["start_time"], "2024-01-01T00:00:00Z");
        assert_eq!(v["end_time"], "2024-01-01T00:01:00Z");
    }

    #[test]
    fn pending_job_omits_unset_fields() {
        let spec = JobSpec {
            command: "/bin/echo".to_string(),
            ..JobSpec::default()
        };
        let job = Job::new("abc".to_string(), &spec);
        let v = serde_json::to_value(JobView::from_job(&job)).expect("serialize");
        assert_eq!(v["status"], "initializing");
        assert!(v.get("exit_code").is_none());
        assert!(v.get("start_time").is_none());
    }

    #[test]
    fn error_envelope_carries_code() {
        let resp = ErrorResponse::from_error(&Error::not_found("xyz"));
        let v = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "not_found");
        assert_eq!(v["error"]["retryable"], false);
    }
}
