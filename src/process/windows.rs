//! Process-table liveness probing for targets without POSIX signals

use std::io;

use sysinfo::{Pid, System};

use super::Signal;

pub fn is_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_process(pid) && sys.process(pid).is_some()
}

pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return Err(io::Error::new(io::ErrorKind::NotFound, format!("no process {}", pid)));
    }
    let process = sys
        .process(pid)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no process {}", pid)))?;

    let delivered = match signal {
        // Graceful termination is not supported everywhere; fall back to a hard kill
        Signal::Terminate => process
            .kill_with(sysinfo::Signal::Term)
            .unwrap_or_else(|| process.kill()),
        Signal::Kill => process.kill(),
    };

    if delivered {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("could not signal process {}", pid),
        ))
    }
}
