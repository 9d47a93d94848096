use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tracing::{debug, warn};

use rexec_protocol::ExitInfo;

pub use nix::sys::signal::Signal::{SIGKILL, SIGTERM};

/// Signal a whole process group. Children are spawned as group leaders, so
/// the group id equals the leader's pid. A group that is already gone is
/// not an error.
pub fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        warn!(pid, "pid out of range, cannot signal process group");
        return Err(std::io::Error::from(Errno::EINVAL));
    }
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!(pid, ?signal, "process group already gone");
            Ok(())
        }
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

/// Name of a raw signal number as reported by the platform, e.g. `SIGTERM`.
pub fn signal_name(signo: i32) -> String {
    Signal::try_from(signo)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signo}"))
}

/// Block until `pid` terminates and return its wait status.
pub(crate) fn wait_pid(pid: u32) -> std::io::Result<ExitStatus> {
    let pid = i32::try_from(pid).map_err(|_| std::io::Error::from(Errno::EINVAL))?;
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::from_raw((code & 0xff) << 8)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitStatus::from_raw(signal as i32)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(errno) => return Err(std::io::Error::from(errno)),
        }
    }
}

/// Exit code, or `-1` plus the signal name when the process was signaled.
pub(crate) fn exit_from_status(status: ExitStatus) -> ExitInfo {
    match status.code() {
        Some(code) => ExitInfo {
            code: Some(code),
            ..ExitInfo::default()
        },
        None => ExitInfo {
            code: Some(-1),
            signal: status.signal().map(signal_name),
            error: None,
        },
    }
}
