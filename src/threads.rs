use super::Result;

use crate::fork::Gate;
use crate::report::FAILURE_STATUS;
use eyre::eyre;
use nix::errno::Errno;
use nix::sys::pthread::{pthread_kill, pthread_self};
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow,
};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use crate::cli::Config;

/// Cancellation targets get `extern "C-unwind"` start routines so a
/// cancellation implemented as forced unwinding may pass through them;
/// the cancel-state symbols are declared here because the libc crate
/// does not expose them uniformly across targets.
type StartRoutine = extern "C-unwind" fn(*mut c_void) -> *mut c_void;

extern "C" {
    fn pthread_create(
        thread: *mut libc::pthread_t,
        attr: *const libc::pthread_attr_t,
        start_routine: StartRoutine,
        arg: *mut c_void,
    ) -> libc::c_int;
    fn pthread_cancel(thread: libc::pthread_t) -> libc::c_int;
    fn pthread_setcancelstate(state: libc::c_int, oldstate: *mut libc::c_int) -> libc::c_int;
    fn pthread_setcanceltype(kind: libc::c_int, oldtype: *mut libc::c_int) -> libc::c_int;
}

const PTHREAD_CANCEL_ENABLE: libc::c_int = 0;
const PTHREAD_CANCEL_DISABLE: libc::c_int = 1;
const PTHREAD_CANCEL_DEFERRED: libc::c_int = 0;
const PTHREAD_CANCEL_ASYNCHRONOUS: libc::c_int = 1;
const PTHREAD_CANCELED: *mut c_void = usize::MAX as *mut c_void;

const ECHO_ARG: usize = 0x7777;
const ECHO_RET: usize = 0x6666;

static MASK_VIOLATION: AtomicBool = AtomicBool::new(false);
static TOGGLE_STAGE: AtomicU8 = AtomicU8::new(0);

fn spawn(start: StartRoutine, arg: *mut c_void) -> Result<libc::pthread_t> {
    let mut thread: libc::pthread_t = unsafe { std::mem::zeroed() };
    let rc = unsafe { pthread_create(&mut thread, std::ptr::null(), start, arg) };
    if rc != 0 {
        return Err(eyre!("pthread_create failed: {}", Errno::from_raw(rc).desc()));
    }
    Ok(thread)
}

fn join(thread: libc::pthread_t) -> Result<*mut c_void> {
    let mut retval: *mut c_void = std::ptr::null_mut();
    let rc = unsafe { libc::pthread_join(thread, &mut retval) };
    if rc != 0 {
        return Err(eyre!("pthread_join failed: {}", Errno::from_raw(rc).desc()));
    }
    Ok(retval)
}

/// Thread cancellation semantics: deferred and asynchronous cancel and
/// per-thread signal masking. These hold on any conforming pthread
/// implementation; the toggle-ordering probe lives in its own group.
pub fn run(config: &Config) -> Result<()> {
    spawn_join_round_trip()?;
    deferred_cancellation(config.join_timeout)?;
    asynchronous_cancellation(config.join_timeout)?;
    thread_scoped_masking()?;
    Ok(())
}

/// Drop-not-queue toggle ordering, separated out because it asserts the
/// target kernel's semantics for a cancel requested while cancellation
/// is disabled. glibc holds such a request pending instead, so this
/// group fails on a glibc host while the rest of the battery passes.
pub fn run_toggle(_config: &Config) -> Result<()> {
    cancel_toggle_ordering()?;
    Ok(())
}

extern "C-unwind" fn echo_worker(arg: *mut c_void) -> *mut c_void {
    if arg as usize != ECHO_ARG {
        unsafe { libc::_exit(FAILURE_STATUS) }
    }
    ECHO_RET as *mut c_void
}

/// A spawned thread carries its argument in and a single return value
/// out through join; the main thread's default cancel attributes are
/// enabled/deferred.
fn spawn_join_round_trip() -> Result<()> {
    info!("threads: spawn/join round trip");

    let mut previous = -1;
    check!(unsafe { pthread_setcancelstate(PTHREAD_CANCEL_ENABLE, &mut previous) } == 0);
    check!(previous == PTHREAD_CANCEL_ENABLE);
    check!(unsafe { pthread_setcanceltype(PTHREAD_CANCEL_DEFERRED, &mut previous) } == 0);
    check!(previous == PTHREAD_CANCEL_DEFERRED);

    let thread = spawn(echo_worker, ECHO_ARG as *mut c_void)?;
    check!(unsafe { libc::pthread_kill(thread, 0) } == 0);
    check!(join(thread)? as usize == ECHO_RET);
    Ok(())
}

extern "C-unwind" fn sleeper_worker(arg: *mut c_void) -> *mut c_void {
    let ready_fd = arg as usize as libc::c_int;
    unsafe {
        libc::write(ready_fd, [1u8].as_ptr().cast(), 1);
        libc::sleep(1000);
        // Reached only if the cancel request never landed.
        libc::_exit(FAILURE_STATUS)
    }
}

/// A deferred cancel must take effect at the sleep (a cancellation
/// point) and make the thread joinable promptly, not after the sleep.
fn deferred_cancellation(bound: Duration) -> Result<()> {
    info!("threads: deferred cancellation interrupts a blocking sleep");

    let gate = Gate::new()?;
    let thread = spawn(sleeper_worker, gate.raw_writer() as usize as *mut c_void)?;
    gate.wait()?;

    let started = Instant::now();
    check!(unsafe { pthread_cancel(thread) } == 0);
    check!(join(thread)? == PTHREAD_CANCELED);
    check!(started.elapsed() < bound);
    Ok(())
}

extern "C-unwind" fn spinner_worker(arg: *mut c_void) -> *mut c_void {
    let ready_fd = arg as usize as libc::c_int;
    let mut previous = -1;
    unsafe {
        pthread_setcanceltype(PTHREAD_CANCEL_ASYNCHRONOUS, &mut previous);
        libc::write(ready_fd, [1u8].as_ptr().cast(), 1);
    }

    // No cancellation points in here; only an asynchronous cancel can
    // interrupt the loop. Volatile traffic keeps it from being elided.
    let mut spins: u64 = 0;
    loop {
        unsafe {
            std::ptr::write_volatile(&mut spins, std::ptr::read_volatile(&spins).wrapping_add(1));
        }
    }
}

/// An asynchronous cancel interrupts a tight loop that never reaches a
/// cancellation point.
fn asynchronous_cancellation(bound: Duration) -> Result<()> {
    info!("threads: asynchronous cancellation interrupts a tight loop");

    let gate = Gate::new()?;
    let thread = spawn(spinner_worker, gate.raw_writer() as usize as *mut c_void)?;
    gate.wait()?;

    let started = Instant::now();
    check!(unsafe { pthread_cancel(thread) } == 0);
    check!(join(thread)? == PTHREAD_CANCELED);
    check!(started.elapsed() < bound);
    Ok(())
}

extern "C" fn on_masked_signal(_signo: libc::c_int) {
    MASK_VIOLATION.store(true, Ordering::SeqCst);
}

/// A thread-targeted mask is thread-specific: a thread that blocks a
/// signal and then directs it at itself must not see the handler run.
fn thread_scoped_masking() -> Result<()> {
    info!("threads: per-thread signal masking");

    MASK_VIOLATION.store(false, Ordering::SeqCst);
    let act = SigAction::new(
        SigHandler::Handler(on_masked_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR2, &act) }?;

    let worker = std::thread::spawn(|| -> nix::Result<()> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGUSR2);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        pthread_kill(pthread_self(), Signal::SIGUSR2)?;
        Ok(())
    });
    check!(matches!(worker.join(), Ok(Ok(()))));
    check!(!MASK_VIOLATION.load(Ordering::SeqCst));

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGUSR2, &default) }?;
    Ok(())
}

extern "C-unwind" fn toggle_worker(_arg: *mut c_void) -> *mut c_void {
    let mut previous = -1;
    unsafe {
        pthread_setcancelstate(PTHREAD_CANCEL_DISABLE, &mut previous);
        // Must be dropped outright while cancellation is disabled.
        pthread_cancel(libc::pthread_self());
    }
    TOGGLE_STAGE.store(1, Ordering::SeqCst);

    unsafe {
        pthread_setcancelstate(PTHREAD_CANCEL_ENABLE, &mut previous);
        // A cancellation point, but nothing may be pending here.
        let pause = libc::timespec {
            tv_sec: 0,
            tv_nsec: 100_000_000,
        };
        libc::nanosleep(&pause, std::ptr::null_mut());
    }
    TOGGLE_STAGE.store(2, Ordering::SeqCst);
    std::ptr::null_mut()
}

/// A cancel requested while cancellation is disabled is dropped, not
/// queued: re-enabling and crossing a cancellation point afterwards must
/// not fire it, and both pieces of observable work must happen.
fn cancel_toggle_ordering() -> Result<()> {
    info!("threads: cancel request while disabled is dropped");

    TOGGLE_STAGE.store(0, Ordering::SeqCst);
    let thread = spawn(toggle_worker, std::ptr::null_mut())?;
    let retval = join(thread)?;
    check!(retval.is_null());
    check!(TOGGLE_STAGE.load(Ordering::SeqCst) == 2);
    Ok(())
}
