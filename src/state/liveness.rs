//! Process liveness probing.
//!
//! Answers are advisory: a pid can be recycled by an unrelated process.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe using signal 0
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists, owned by someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}
