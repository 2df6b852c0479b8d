use super::harness::ProbeHarness;
use anyhow::Result;
use std::os::fd::AsRawFd;

const FAULT_STATUS_SIGSEGV: i32 = 0x80 | libc::SIGSEGV;

#[tokio::test]
async fn pagefault_mode_encodes_the_fault_signal() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&["pagefault"]).await?;
    assert_eq!(status.code(), Some(FAULT_STATUS_SIGSEGV));
    Ok(())
}

#[tokio::test]
async fn unknown_group_is_rejected() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&["--group", "bogus"]).await?;
    let code = status.code().expect("process should exit, not be killed");
    assert_ne!(code, 0, "an unknown group must not report success");
    assert_ne!(code, FAULT_STATUS_SIGSEGV);
    Ok(())
}

#[tokio::test]
async fn fdio_group_passes() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&["--group", "fdio"]).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn pipes_group_passes() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&["--group", "pipes"]).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn signals_group_passes() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&["--group", "signals"]).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

/// The cloexec entry point judges exactly the descriptor state an exec
/// is supposed to leave behind: descriptor 17 is never opened (stands in
/// for the close-on-exec one), descriptor 19 is inherited via dup2.
#[tokio::test]
async fn cloexec_mode_judges_descriptor_state() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let kept = std::fs::File::create(harness.temp_path().join("kept"))?;
    let kept_fd = kept.as_raw_fd();

    let mut cmd = harness.command(&["cloexec", "17", "19"]);
    unsafe {
        cmd.pre_exec(move || {
            // dup2 clears close-on-exec on the duplicate, so 19 survives
            // the exec while 17 stays invalid.
            libc::close(17);
            if libc::dup2(kept_fd, 19) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let status = ProbeHarness::wait_bounded(&mut child, &["cloexec", "17", "19"]).await?;
    assert_eq!(status.code(), Some(0));
    drop(kept);
    Ok(())
}

/// Deferred cancel, asynchronous cancel and per-thread masking hold on
/// any conforming pthread implementation, so this group must pass on the
/// build host too.
#[tokio::test]
async fn threads_group_passes() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&["--group", "threads"]).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
#[ignore = "asserts drop-not-queue cancel semantics of the target kernel; glibc queues the request instead"]
async fn threads_toggle_group_passes_on_target_kernel() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&["--group", "threads-toggle"]).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
#[ignore = "includes the threads-toggle group; see threads_toggle_group_passes_on_target_kernel"]
async fn full_battery_passes_on_target_kernel() -> Result<()> {
    let harness = ProbeHarness::new()?;
    let status = harness.run(&[]).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}
