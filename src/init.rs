//! Init-mode: the second execution stage between the supervisor and the
//! payload.
//!
//! The supervisor spawns this same binary with the hidden `_init`
//! subcommand and the environment contract of the launch. This stage joins
//! the job's cgroup, unshares the kernel namespaces, and forks once more so
//! the payload becomes PID 1 of the new PID namespace; the init process
//! stays behind as a minimal reaper that forwards the payload's exit
//! status. The payload remounts `/proc`, marks the readiness pipe
//! close-on-exec, and execs the resolved command — a successful exec closes
//! the pipe, which is the supervisor's RUNNING signal; any failure writes
//! its message into the pipe instead.
//!
//! Nothing here prints to stdout or stderr: both are the job's output
//! stream.

use std::ffi::CString;
use std::os::fd::RawFd;

use crate::supervisor::{
    ENV_JOB_ARG_PREFIX, ENV_JOB_ARGS_COUNT, ENV_JOB_CGROUP_PATH, ENV_JOB_COMMAND,
    ENV_JOB_NAMESPACES, ENV_JOB_READY_FD, INIT_EXIT_EXEC, INIT_EXIT_SETUP,
};

/// What the environment contract resolves to.
struct Payload {
    command: String,
    args: Vec<String>,
    cgroup_path: Option<String>,
    namespaces: bool,
    ready_fd: Option<RawFd>,
}

/// Entry point of the `_init` subcommand. Returns only on failure; the
/// process image is replaced on success.
pub fn execute() -> ! {
    let payload = match parse_payload(|key| std::env::var(key).ok()) {
        Ok(p) => p,
        Err(msg) => {
            // Without a parsed contract there may be no pipe to report
            // through; exit with the distinguished setup code either way.
            report(
                std::env::var(ENV_JOB_READY_FD)
                    .ok()
                    .and_then(|v| v.parse().ok()),
                &msg,
            );
            std::process::exit(INIT_EXIT_SETUP);
        }
    };
    let ready_fd = payload.ready_fd;
    match run(payload) {
        Ok(never) => match never {},
        Err(msg) => {
            report(ready_fd, &msg);
            std::process::exit(INIT_EXIT_SETUP);
        }
    }
}

enum Never {}

fn run(payload: Payload) -> Result<Never, String> {
    if let Some(path) = payload.cgroup_path.as_deref() {
        join_cgroup(path);
    }

    if payload.namespaces {
        unshare_namespaces()?;
    }

    // Prepare the exec arguments up front; after the fork the payload side
    // does as little as possible.
    let c_command = CString::new(payload.command.as_str())
        .map_err(|_| "command contains NUL".to_string())?;
    let mut c_args: Vec<CString> = Vec::with_capacity(payload.args.len() + 1);
    c_args.push(c_command.clone());
    for arg in &payload.args {
        c_args.push(CString::new(arg.as_str()).map_err(|_| "argument contains NUL".to_string())?);
    }
    let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // SAFETY: this process is single-threaded, so fork(2) is safe here.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(format!("fork: {}", std::io::Error::last_os_error()));
    }

    if pid == 0 {
        // Payload side: PID 1 of the new PID namespace when isolation is on.
        if payload.namespaces
            && let Err(msg) = mount_private_proc()
        {
            report(payload.ready_fd, &msg);
            // SAFETY: plain process exit without running destructors.
            unsafe { libc::_exit(INIT_EXIT_SETUP) };
        }
        if let Some(fd) = payload.ready_fd {
            // A successful exec closes the pipe; that close is the RUNNING
            // signal.
            // SAFETY: fcntl F_SETFD on an inherited fd.
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
        // SAFETY: c_command and argv are valid NUL-terminated strings with a
        // terminating null pointer.
        unsafe { libc::execv(c_command.as_ptr(), argv.as_ptr()) };
        let err = format!(
            "exec {}: {}",
            payload.command,
            std::io::Error::last_os_error()
        );
        report(payload.ready_fd, &err);
        // SAFETY: as above.
        unsafe { libc::_exit(INIT_EXIT_EXEC) };
    }

    // Init side: drop the pipe so only the payload holds it, then reap and
    // forward the exit status.
    if let Some(fd) = payload.ready_fd {
        // SAFETY: closing an fd this process owns.
        unsafe { libc::close(fd) };
    }
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status points at a valid c_int.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(format!("waitpid: {e}"));
        }
    }
    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        INIT_EXIT_SETUP
    };
    std::process::exit(code);
}

fn parse_payload(lookup: impl Fn(&str) -> Option<String>) -> Result<Payload, String> {
    let command = lookup(ENV_JOB_COMMAND).ok_or_else(|| format!("{ENV_JOB_COMMAND} not set"))?;
    let count: usize = lookup(ENV_JOB_ARGS_COUNT)
        .ok_or_else(|| format!("{ENV_JOB_ARGS_COUNT} not set"))?
        .parse()
        .map_err(|_| format!("{ENV_JOB_ARGS_COUNT} is not a number"))?;
    let mut args = Vec::with_capacity(count);
    for i in 0..count {
        let key = format!("{ENV_JOB_ARG_PREFIX}{i}");
        args.push(lookup(&key).ok_or_else(|| format!("{key} not set"))?);
    }
    let cgroup_path = lookup(ENV_JOB_CGROUP_PATH).filter(|p| !p.is_empty());
    let namespaces = lookup(ENV_JOB_NAMESPACES).as_deref() == Some("1");
    let ready_fd = lookup(ENV_JOB_READY_FD).and_then(|v| v.parse().ok());
    Ok(Payload {
        command,
        args,
        cgroup_path,
        namespaces,
        ready_fd,
    })
}

/// Move this process into its assigned cgroup. The supervisor has already
/// written our pid into the group from its side; this write is the
/// child-side half and is best-effort.
fn join_cgroup(path: &str) {
    use std::io::Write;
    let target = std::path::Path::new(path).join("cgroup.procs");
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&target)
    {
        // SAFETY: getpid(2) has no failure mode.
        let pid = unsafe { libc::getpid() };
        let _ = writeln!(file, "{pid}");
    }
}

fn unshare_namespaces() -> Result<(), String> {
    let flags = libc::CLONE_NEWPID
        | libc::CLONE_NEWNS
        | libc::CLONE_NEWIPC
        | libc::CLONE_NEWUTS
        | libc::CLONE_NEWCGROUP;
    // SAFETY: unshare(2) with namespace flags only.
    if unsafe { libc::unshare(flags) } != 0 {
        return Err(format!("unshare: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Make the mount table private and put a fresh procfs over /proc so the
/// payload sees its own PID namespace.
fn mount_private_proc() -> Result<(), String> {
    // SAFETY: mount(2) with constant, NUL-terminated arguments.
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(format!(
            "remount / private: {}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: as above.
    let rc = unsafe {
        libc::mount(
            c"proc".as_ptr(),
            c"/proc".as_ptr(),
            c"proc".as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(format!("mount /proc: {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Write a failure message into the readiness pipe, if there is one.
fn report(fd: Option<RawFd>, msg: &str) {
    if let Some(fd) = fd {
        // SAFETY: writing a valid buffer to an inherited fd; failure is
        // ignored because there is no better channel left.
        unsafe { libc::write(fd, msg.as_ptr().cast(), msg.len()) };
    }
}
