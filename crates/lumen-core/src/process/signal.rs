//! Signal delivery to single processes and process groups.
//!
//! On Windows there are no signals; both the graceful and the forced
//! variants go through `taskkill /T`, which walks the process tree itself.

#[cfg(unix)]
mod imp {
    use std::io;

    fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
        // 0 and negative values address whole groups in kill(2).
        match libc::pid_t::try_from(pid) {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid pid {pid}"),
            )),
        }
    }

    fn check(ret: libc::c_int) -> io::Result<()> {
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn send(pid: u32, signal: libc::c_int) -> io::Result<()> {
        let pid = to_pid(pid)?;
        // SAFETY: kill(2) has no memory-safety preconditions; pid is positive.
        check(unsafe { libc::kill(pid, signal) })
    }

    fn send_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
        let pgid = to_pid(pgid)?;
        // SAFETY: killpg(2) has no memory-safety preconditions; pgid is positive.
        check(unsafe { libc::killpg(pgid, signal) })
    }

    /// Send SIGTERM to one process.
    pub fn terminate(pid: u32) -> io::Result<()> {
        send(pid, libc::SIGTERM)
    }

    /// Send SIGKILL to one process.
    pub fn kill(pid: u32) -> io::Result<()> {
        send(pid, libc::SIGKILL)
    }

    /// Send SIGTERM to every member of a process group.
    pub fn terminate_group(pgid: u32) -> io::Result<()> {
        send_group(pgid, libc::SIGTERM)
    }

    /// Send SIGKILL to every member of a process group.
    pub fn kill_group(pgid: u32) -> io::Result<()> {
        send_group(pgid, libc::SIGKILL)
    }

    /// Whether `pid` names a live process. Zombies count as dead on Linux.
    pub fn is_alive(pid: u32) -> bool {
        #[cfg(target_os = "linux")]
        if let Ok(raw) = i32::try_from(pid) {
            if let Ok(stat) = procfs::process::Process::new(raw).and_then(|p| p.stat()) {
                return stat.state != 'Z';
            }
        }

        let Ok(raw) = to_pid(pid) else {
            return false;
        };
        // SAFETY: signal 0 performs only the existence and permission check.
        let ret = unsafe { libc::kill(raw, 0) };
        ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::process::Command;

    fn taskkill(pid: u32, force: bool) -> io::Result<()> {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            cmd.arg("/F");
        }
        let output = cmd.output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ))
        }
    }

    pub fn terminate(pid: u32) -> io::Result<()> {
        taskkill(pid, false)
    }

    pub fn kill(pid: u32) -> io::Result<()> {
        taskkill(pid, true)
    }

    pub fn terminate_group(pid: u32) -> io::Result<()> {
        taskkill(pid, false)
    }

    pub fn kill_group(pid: u32) -> io::Result<()> {
        taskkill(pid, true)
    }

    pub fn is_alive(pid: u32) -> bool {
        let filter = format!("PID eq {pid}");
        Command::new("tasklist")
            .args(["/FI", &filter, "/NH", "/FO", "CSV"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
            .unwrap_or(false)
    }
}

pub use imp::{is_alive, kill, kill_group, terminate, terminate_group};
