use super::Result;

use crate::cli::Config;
use crate::{fdio, pipes, signals, threads};
use tracing::{debug, info};

pub type GroupFn = fn(&Config) -> Result<()>;

/// The ordered battery. Order matters: every fork/exec probe must run
/// before the first thread is spawned.
pub const GROUPS: &[(&str, GroupFn)] = &[
    ("fdio", fdio::run),
    ("pipes", pipes::run),
    ("signals", signals::run),
    ("threads", threads::run),
    ("threads-toggle", threads::run_toggle),
];

pub fn group_names() -> Vec<&'static str> {
    GROUPS.iter().map(|(name, _)| *name).collect()
}

/// Runs the selected test groups in battery order. The first failed
/// check inside any group terminates the process; an `Err` here is an
/// orchestration failure, not a probe verdict.
pub fn run(config: &Config) -> Result<()> {
    for (name, group) in GROUPS {
        if !config.groups.is_empty() && !config.groups.iter().any(|g| g == *name) {
            debug!("skipping test group: {}", name);
            continue;
        }
        info!("running test group: {}", name);
        group(config)?;
    }

    report_environment();
    info!("all selected test groups passed");
    Ok(())
}

/// Reported, not validated.
fn report_environment() {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("<unknown>"));
    info!("hostname: {}", hostname);
    info!("PATH: {}", std::env::var("PATH").unwrap_or_default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_names_are_unique() {
        let names = group_names();
        for name in &names {
            assert_eq!(names.iter().filter(|n| n == &name).count(), 1);
        }
    }

    #[test]
    fn thread_groups_run_after_all_forking_groups() {
        // Forking from a process that already spawned threads is what the
        // battery order exists to avoid.
        let names = group_names();
        let first_threaded = names
            .iter()
            .position(|name| name.starts_with("threads"))
            .unwrap();
        assert_eq!(&names[..first_threaded], &["fdio", "pipes", "signals"]);
        assert!(names[first_threaded..]
            .iter()
            .all(|name| name.starts_with("threads")));
    }
}
