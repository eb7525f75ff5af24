//! End-to-end tests of the job execution engine.
//!
//! Each test owns an isolated engine: a temporary directory stands in for
//! the cgroup base, limit defaults are zero (nothing is written into kernel
//! interface files), and namespace isolation is off so the suite runs
//! unprivileged. Jobs are real child processes; the init image is the
//! compiled `jobward` binary.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use jobward::config::{CgroupSettings, Config, IsolationSettings, LimitDefaults};
use jobward::job::{Job, JobLimits, JobSpec, JobStatus};
use jobward::service::{JobService, Role};

/// Test harness owning the engine and its temporary cgroup base.
struct TestHarness {
    _cgroup_base: tempfile::TempDir,
    service: JobService,
}

impl TestHarness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let config = Config {
            cgroup: CgroupSettings {
                base: tmp.path().to_path_buf(),
                io_device: None,
                cleanup_timeout_ms: 2000,
            },
            defaults: LimitDefaults {
                cpu_percent: 0,
                memory_mb: 0,
                io_bytes_per_sec: 0,
            },
            isolation: IsolationSettings {
                namespaces: false,
                init_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_jobward"))),
            },
            stop_grace_ms: 100,
            launch_timeout_ms: 10_000,
            max_buffer_bytes: 0,
            max_chunk_bytes: 1 << 20,
        };
        TestHarness {
            service: JobService::new(config),
            _cgroup_base: tmp,
        }
    }

    fn create(&self, command: &str, args: &[&str]) -> Job {
        let spec = JobSpec {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            limits: JobLimits::default(),
        };
        self.service
            .create_job(Role::Admin, spec)
            .expect("create job")
    }

    /// Poll until the job satisfies `pred`, panicking after `timeout`.
    fn wait_until(&self, id: &str, timeout: Duration, pred: impl Fn(&Job) -> bool) -> Job {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.service.get_job(Role::Admin, id).expect("get job");
            if pred(&job) {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for job {id} (status {})",
                job.status.as_str()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_terminal(&self, id: &str) -> Job {
        self.wait_until(id, Duration::from_secs(15), |j| j.status.is_terminal())
    }

    fn wait_running(&self, id: &str) -> Job {
        self.wait_until(id, Duration::from_secs(15), |j| {
            j.status == JobStatus::Running || j.status.is_terminal()
        })
    }

    /// Collect the complete output of a job via the streaming facade.
    fn collect_output(&self, id: &str) -> Vec<u8> {
        self.service
            .stream_output(Role::Admin, id)
            .expect("stream")
            .flatten()
            .collect()
    }
}

// ── lifecycle ─────────────────────────────────────────────────────────────────

#[test]
fn happy_path_echo() {
    let h = TestHarness::new();
    let job = h.create("/bin/echo", &["hi"]);
    assert_eq!(job.status, JobStatus::Initializing);
    assert_eq!(job.pid, 0);
    assert!(job.exit_code.is_none());

    let done = h.wait_terminal(&job.id);
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.exit_code, Some(0));
    assert!(done.pid > 0);
    assert!(done.end_time.unwrap() >= done.start_time.unwrap());

    assert_eq!(h.collect_output(&job.id), b"hi\n");

    // The cgroup directory is removed by the background cleanup.
    let path = done.cgroup_path.expect("cgroup path recorded");
    let deadline = Instant::now() + Duration::from_secs(5);
    while path.exists() {
        assert!(Instant::now() < deadline, "cgroup dir still present");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn created_job_matches_spec() {
    let h = TestHarness::new();
    let job = h.create("/bin/sleep", &["2"]);
    assert_eq!(job.command, "/bin/sleep");
    assert_eq!(job.args, vec!["2"]);
    assert_eq!(job.limits, JobLimits::default());
    assert!(matches!(
        job.status,
        JobStatus::Initializing | JobStatus::Running
    ));
    assert!(job.exit_code.is_none());
    h.wait_terminal(&job.id);
}

#[test]
fn nonzero_exit_maps_to_failed() {
    let h = TestHarness::new();
    let job = h.create("/bin/sh", &["-c", "exit 3"]);
    let done = h.wait_terminal(&job.id);
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.exit_code, Some(3));
}

#[test]
fn job_ids_are_unique_and_listing_orders_by_start() {
    let h = TestHarness::new();
    let a = h.create("/bin/echo", &["a"]);
    h.wait_terminal(&a.id);
    let b = h.create("/bin/echo", &["b"]);
    h.wait_terminal(&b.id);
    assert_ne!(a.id, b.id);

    let listed = h.service.list_jobs(Role::Viewer).expect("list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, a.id);
    assert_eq!(listed[1].id, b.id);
}

#[test]
fn injected_environment_reaches_the_payload() {
    let h = TestHarness::new();
    let job = h.create("/bin/sh", &["-c", "echo $JOB_ID"]);
    h.wait_terminal(&job.id);
    let output = h.collect_output(&job.id);
    assert_eq!(output, format!("{}\n", job.id).into_bytes());
}

// ── validation ────────────────────────────────────────────────────────────────

#[test]
fn shell_injection_is_rejected_without_side_effects() {
    let h = TestHarness::new();
    let spec = JobSpec {
        command: "rm; rm -rf /".to_string(),
        args: vec![],
        limits: JobLimits::default(),
    };
    let err = h
        .service
        .create_job(Role::Admin, spec)
        .expect_err("must be rejected");
    assert_eq!(err.code(), "invalid_argument");
    assert!(h.service.list_jobs(Role::Admin).expect("list").is_empty());
    // No cgroup directory was created either.
    let leftovers: Vec<_> = std::fs::read_dir(h._cgroup_base.path())
        .expect("read base")
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn missing_command_is_rejected_at_create() {
    let h = TestHarness::new();
    let spec = JobSpec {
        command: "/bin/definitely-not-installed".to_string(),
        args: vec![],
        limits: JobLimits::default(),
    };
    let err = h
        .service
        .create_job(Role::Admin, spec)
        .expect_err("must be rejected");
    assert_eq!(err.code(), "invalid_argument");
}

#[test]
fn non_executable_command_fails_at_launch() {
    let h = TestHarness::new();
    let plain = tempfile::NamedTempFile::new().expect("tempfile");
    let path = plain.path().to_str().expect("utf8 path").to_string();
    let job = h.create(&path, &[]);
    let done = h.wait_terminal(&job.id);
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.exit_code, Some(127));
}

#[test]
fn argument_count_boundary() {
    let h = TestHarness::new();
    let max_args: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    let spec = JobSpec {
        command: "/bin/echo".to_string(),
        args: max_args.clone(),
        limits: JobLimits::default(),
    };
    let job = h.service.create_job(Role::Admin, spec).expect("100 args");
    let done = h.wait_terminal(&job.id);
    assert_eq!(done.status, JobStatus::Completed);
    let expected = format!("{}\n", max_args.join(" "));
    assert_eq!(h.collect_output(&job.id), expected.into_bytes());

    let mut too_many = max_args;
    too_many.push("x".to_string());
    let spec = JobSpec {
        command: "/bin/echo".to_string(),
        args: too_many,
        limits: JobLimits::default(),
    };
    let err = h
        .service
        .create_job(Role::Admin, spec)
        .expect_err("101 args");
    assert_eq!(err.code(), "invalid_argument");
}

// ── stop ──────────────────────────────────────────────────────────────────────

#[test]
fn graceful_stop() {
    let h = TestHarness::new();
    let job = h.create("/bin/sleep", &["30"]);
    h.wait_running(&job.id);
    std::thread::sleep(Duration::from_millis(200));

    let begin = Instant::now();
    let stopped = h.service.stop_job(Role::Admin, &job.id).expect("stop");
    assert_eq!(stopped.status, JobStatus::Stopped);
    // SIGTERM-killed: 128 + 15.
    assert_eq!(stopped.exit_code, Some(143));
    assert!(begin.elapsed() < Duration::from_secs(2));
}

#[test]
fn stop_is_idempotent() {
    let h = TestHarness::new();
    let job = h.create("/bin/sleep", &["30"]);
    h.wait_running(&job.id);
    let first = h.service.stop_job(Role::Admin, &job.id).expect("stop");
    let second = h.service.stop_job(Role::Admin, &job.id).expect("stop again");
    assert_eq!(first.status, JobStatus::Stopped);
    assert_eq!(second.status, JobStatus::Stopped);
    assert_eq!(first.exit_code, second.exit_code);
}

#[test]
fn stop_of_completed_job_reports_current_status() {
    let h = TestHarness::new();
    let job = h.create("/bin/echo", &["done"]);
    h.wait_terminal(&job.id);
    let result = h.service.stop_job(Role::Admin, &job.id).expect("stop");
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.exit_code, Some(0));
}

#[test]
fn concurrent_stops_agree() {
    let h = TestHarness::new();
    let job = h.create("/bin/sleep", &["30"]);
    h.wait_running(&job.id);

    let svc = &h.service;
    let (a, b) = std::thread::scope(|scope| {
        let ja = job.id.clone();
        let jb = job.id.clone();
        let ta = scope.spawn(move || svc.stop_job(Role::Admin, &ja));
        let tb = scope.spawn(move || svc.stop_job(Role::Admin, &jb));
        (ta.join().expect("thread a"), tb.join().expect("thread b"))
    });
    let a = a.expect("stop a");
    let b = b.expect("stop b");
    assert_eq!(a.status, JobStatus::Stopped);
    assert_eq!(b.status, JobStatus::Stopped);
    assert_eq!(a.exit_code, b.exit_code);
}

#[test]
fn stop_unknown_job_is_not_found() {
    let h = TestHarness::new();
    let err = h
        .service
        .stop_job(Role::Admin, "0123456789abcdef")
        .expect_err("unknown");
    assert_eq!(err.code(), "not_found");
    let err = h
        .service
        .stop_job(Role::Admin, "bad id!")
        .expect_err("malformed");
    assert_eq!(err.code(), "invalid_argument");
}

// ── streaming ─────────────────────────────────────────────────────────────────

#[test]
fn live_stream_is_a_prefix_free_copy_of_the_buffer() {
    let h = TestHarness::new();
    let job = h.create(
        "/bin/sh",
        &["-c", "echo one; sleep 0.2; echo two; sleep 0.2; echo three"],
    );
    h.wait_running(&job.id);
    let stream = h
        .service
        .stream_output(Role::Viewer, &job.id)
        .expect("stream");
    let live: Vec<u8> = stream.flatten().collect();

    h.wait_terminal(&job.id);
    let replayed = h.collect_output(&job.id);
    assert_eq!(replayed, b"one\ntwo\nthree\n");
    // The live consumer drained promptly, so it saw everything.
    assert_eq!(live, replayed);
}

#[test]
fn late_stream_replays_complete_output_then_ends() {
    let h = TestHarness::new();
    let job = h.create("/bin/sh", &["-c", "echo alpha; echo beta"]);
    h.wait_terminal(&job.id);
    let first = h.collect_output(&job.id);
    let second = h.collect_output(&job.id);
    assert_eq!(first, b"alpha\nbeta\n");
    assert_eq!(first, second);
}

#[test]
fn slow_subscriber_is_evicted_without_losing_the_record() {
    let h = TestHarness::new();
    let words = "a b c d e f g h i j k l m n o p";
    let script = format!("for w in {words}; do echo chunk-$w; sleep 0.05; done");
    let job = h.create("/bin/sh", &["-c", &script]);
    h.wait_running(&job.id);

    let fast = h
        .service
        .stream_output(Role::Admin, &job.id)
        .expect("fast stream");
    let slow = h
        .service
        .stream_output(Role::Admin, &job.id)
        .expect("slow stream");

    let fast_thread = std::thread::spawn(move || fast.flatten().collect::<Vec<u8>>());

    // The slow consumer does not read at all while the job is emitting; its
    // capacity-2 mailbox fills and it is evicted.
    let done = h.wait_terminal(&job.id);
    assert_eq!(done.status, JobStatus::Completed);
    let slow_bytes: Vec<u8> = slow.flatten().collect();

    let fast_bytes = fast_thread.join().expect("fast thread");
    let full = h.collect_output(&job.id);

    assert_eq!(fast_bytes, full, "fast subscriber saw the whole stream");
    assert!(
        slow_bytes.len() < full.len(),
        "slow subscriber should have been cut off ({} vs {})",
        slow_bytes.len(),
        full.len()
    );
    // Whatever the slow subscriber did see is a prefix of the record.
    assert_eq!(&full[..slow_bytes.len()], &slow_bytes[..]);
}

#[test]
fn dropping_a_stream_does_not_affect_the_job() {
    let h = TestHarness::new();
    let job = h.create("/bin/sh", &["-c", "sleep 0.3; echo survived"]);
    h.wait_running(&job.id);
    let stream = h
        .service
        .stream_output(Role::Admin, &job.id)
        .expect("stream");
    drop(stream);
    let done = h.wait_terminal(&job.id);
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(h.collect_output(&job.id), b"survived\n");
}

// ── roles ─────────────────────────────────────────────────────────────────────

#[test]
fn viewer_can_observe_but_not_mutate() {
    let h = TestHarness::new();
    let spec = JobSpec {
        command: "/bin/sleep".to_string(),
        args: vec!["30".to_string()],
        limits: JobLimits::default(),
    };
    let err = h
        .service
        .create_job(Role::Viewer, spec)
        .expect_err("viewer create");
    assert_eq!(err.code(), "permission_denied");

    let job = h.create("/bin/sleep", &["30"]);
    h.wait_running(&job.id);

    let seen = h.service.get_job(Role::Viewer, &job.id).expect("viewer get");
    assert_eq!(seen.id, job.id);
    assert_eq!(h.service.list_jobs(Role::Viewer).expect("list").len(), 1);
    let stream = h
        .service
        .stream_output(Role::Viewer, &job.id)
        .expect("viewer stream");
    drop(stream);

    let err = h
        .service
        .stop_job(Role::Viewer, &job.id)
        .expect_err("viewer stop");
    assert_eq!(err.code(), "permission_denied");

    h.service.stop_job(Role::Admin, &job.id).expect("admin stop");
}
