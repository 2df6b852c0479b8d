use nix::errno::Errno;
use tracing::trace;

/// Exit status of the first failed check anywhere in the process tree.
pub const FAILURE_STATUS: i32 = 1;

/// Base for exit statuses produced by fault handlers: `0x80 | signo`.
pub const FAULT_STATUS_BASE: i32 = 0x80;

/// Evaluates a probe condition exactly once. A failed check is fatal:
/// it reports the source location, the expression text and the decoded
/// errno, then terminates the process. There is no recovery path; a
/// failed precondition invalidates every check that would follow it.
macro_rules! check {
    ($cond:expr) => {
        $crate::report::require($cond, stringify!($cond), file!(), line!())
    };
}

pub fn require(cond: bool, expr: &str, file: &str, line: u32) {
    // errno is captured before anything else can clobber it.
    let errno = Errno::last();
    if cond {
        trace!("{}:{}: {}", file, line, expr);
        return;
    }
    eprintln!(
        "{}:{}: check failed ({}), errno = \"{}\"",
        file,
        line,
        expr,
        errno.desc()
    );
    std::process::exit(FAILURE_STATUS);
}

/// Encodes an OS-delivered fault signal as an exit status the reaping
/// parent can assert against.
pub fn fault_status(signo: i32) -> i32 {
    FAULT_STATUS_BASE | signo
}
