use super::Result;

use eyre::eyre;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe, read, write, ForkResult, Pid};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Runs `f` in a forked child. The child terminates with the returned
/// exit code via `_exit`, never unwinding back into the caller's stack
/// or flushing the parent's buffered state twice.
pub fn run_in_child<F: FnOnce() -> i32>(f: F) -> Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = f();
            unsafe { libc::_exit(code) }
        }
    }
}

/// Reaps `pid` and returns its exit code. A child killed outright by a
/// signal is reported with the same `0x80 | signo` encoding the in-process
/// fault handlers use, so parent-side checks share one vocabulary.
pub fn exit_code(pid: Pid) -> Result<i32> {
    match waitpid(pid, None)? {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, signal, _) => Ok(crate::report::fault_status(signal as i32)),
        other => Err(eyre!("unexpected wait status: {:?}", other)),
    }
}

/// One-shot ordering barrier backed by a pipe.
///
/// Both sides of a fork (or two threads) hold the pair; the side that must
/// run second blocks in `wait()` until the other side calls `signal()`.
/// This replaces fixed-duration sleeps as the ordering mechanism between
/// choreographed actors.
pub struct Gate {
    rd: OwnedFd,
    wr: OwnedFd,
}

impl Gate {
    pub fn new() -> Result<Self> {
        let (rd, wr) = pipe()?;
        Ok(Gate { rd, wr })
    }

    /// Releases the peer blocked in `wait()`.
    pub fn signal(&self) -> Result<()> {
        write(&self.wr, &[1u8])?;
        Ok(())
    }

    /// Blocks until the peer calls `signal()`.
    pub fn wait(&self) -> Result<()> {
        let mut byte = [0u8; 1];
        match read(&self.rd, &mut byte)? {
            1 => Ok(()),
            _ => Err(eyre!("gate peer closed without signaling")),
        }
    }

    /// Raw writer descriptor, for actors that must not hold droppable
    /// state (pthread cancellation targets signal readiness through this).
    pub fn raw_writer(&self) -> RawFd {
        self.wr.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_exit_code_is_propagated() {
        let pid = run_in_child(|| 7).unwrap();
        assert_eq!(exit_code(pid).unwrap(), 7);
    }

    #[test]
    fn signaled_child_uses_fault_encoding() {
        let pid = run_in_child(|| unsafe {
            libc::kill(libc::getpid(), libc::SIGKILL);
            0
        })
        .unwrap();
        assert_eq!(exit_code(pid).unwrap(), 0x80 | libc::SIGKILL);
    }

    #[test]
    fn gate_orders_signal_before_wait() {
        let gate = Gate::new().unwrap();
        gate.signal().unwrap();
        gate.wait().unwrap();
    }

    #[test]
    fn gate_orders_across_fork() {
        let gate = Gate::new().unwrap();
        let pid = run_in_child(|| match gate.wait() {
            Ok(()) => 0,
            Err(_) => 1,
        })
        .unwrap();
        gate.signal().unwrap();
        assert_eq!(exit_code(pid).unwrap(), 0);
    }
}
