use super::Result;

use crate::cli::Config;
use crate::fork::{exit_code, run_in_child, Gate};
use crate::report::FAILURE_STATUS;
use eyre::WrapErr;
use nix::errno::Errno;
use nix::unistd::execv;
use once_cell::sync::OnceCell;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStringExt;
use tracing::info;

static SELF_EXE: OnceCell<CString> = OnceCell::new();

/// Path of the running binary, cached for the self-re-exec probes.
pub fn self_exe() -> Result<&'static CStr> {
    let path = SELF_EXE.get_or_try_init(|| -> Result<CString> {
        let path = std::env::current_exe().wrap_err("cannot locate own binary")?;
        CString::new(path.into_os_string().into_vec()).wrap_err("binary path contains NUL")
    })?;
    Ok(path.as_c_str())
}

/// Descriptor lifecycle and inheritance semantics across fork and exec.
pub fn run(_config: &Config) -> Result<()> {
    duplicate_and_close_on_exec()?;
    descriptor_close_independence()?;
    stream_position_independence()?;
    Ok(())
}

/// A child duplicates a descriptor with `F_DUPFD_CLOEXEC`, juggles the
/// flag through `F_SETFD`, and replaces its image with this binary in
/// `cloexec` mode; the replaced image's exit status is the verdict.
fn duplicate_and_close_on_exec() -> Result<()> {
    info!("fdio: duplicate-and-close-on-exec");
    let exe = self_exe()?.to_owned();

    let child = run_in_child(move || {
        let fd_a = unsafe { libc::open(c"/".as_ptr(), libc::O_RDONLY) };
        check!(fd_a != -1);

        let fd_b = unsafe { libc::fcntl(fd_a, libc::F_DUPFD_CLOEXEC, 0) };
        check!(fd_b != -1);
        check!((unsafe { libc::fcntl(fd_b, libc::F_GETFD) } & libc::FD_CLOEXEC) != 0);

        // Exercise F_SETFD both ways; end state: fd_a close-on-exec,
        // fd_b inherited across the exec.
        check!(unsafe { libc::fcntl(fd_a, libc::F_SETFD, libc::FD_CLOEXEC) } != -1);
        check!(unsafe { libc::fcntl(fd_b, libc::F_SETFD, libc::FD_CLOEXEC) } != -1);
        check!(unsafe { libc::fcntl(fd_b, libc::F_SETFD, 0) } != -1);

        let argv = [
            CString::from(c"posixprobe"),
            CString::from(c"cloexec"),
            CString::new(fd_a.to_string()).unwrap(),
            CString::new(fd_b.to_string()).unwrap(),
        ];
        check!(execv(&exe, &argv).is_ok());
        FAILURE_STATUS
    })?;

    check!(exit_code(child)? == 0);
    Ok(())
}

/// Entry point for the replaced image of `duplicate_and_close_on_exec`.
/// The close-on-exec descriptor must already be gone, the other must
/// still be valid.
pub fn verify_replaced_image(closed_fd: i32, kept_fd: i32) {
    let rc = unsafe { libc::close(closed_fd) };
    let errno = Errno::last();
    check!(rc == -1);
    check!(errno == Errno::EBADF);
    check!(unsafe { libc::close(kept_fd) } == 0);
}

/// Descriptor tables are per-process copies: a close in the child must
/// not invalidate the parent's descriptor.
fn descriptor_close_independence() -> Result<()> {
    info!("fdio: descriptor-close-independence");

    let shared = unsafe { libc::open(c"/".as_ptr(), libc::O_RDONLY) };
    check!(shared != -1);

    let child = run_in_child(|| {
        check!(unsafe { libc::close(shared) } == 0);
        0
    })?;

    check!(exit_code(child)? == 0);
    check!(unsafe { libc::close(shared) } == 0);
    Ok(())
}

/// Buffered stdio stream state is private after fork: a seek in the
/// parent must not move the child's copy of the stream.
fn stream_position_independence() -> Result<()> {
    info!("fdio: stream-position-independence");

    let stream = unsafe { libc::fopen(self_exe()?.as_ptr(), c"r".as_ptr()) };
    check!(!stream.is_null());

    // Activate the stream's buffer before forking so both processes
    // carry an established buffered position.
    let mut header = [0u8; 4];
    check!(unsafe { libc::fread(header.as_mut_ptr().cast(), 1, 4, stream) } == 4);

    let gate = Gate::new()?;
    let child = run_in_child(|| {
        check!(gate.wait().is_ok());
        check!(unsafe { libc::ftell(stream) } == 4);
        0
    })?;

    check!(unsafe { libc::fseek(stream, 64, libc::SEEK_SET) } == 0);
    check!(unsafe { libc::ftell(stream) } == 64);
    gate.signal()?;

    check!(exit_code(child)? == 0);
    check!(unsafe { libc::fclose(stream) } == 0);
    Ok(())
}
