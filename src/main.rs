type Result<T> = color_eyre::eyre::Result<T>;

#[macro_use]
mod report;

mod battery;
mod cli;
mod fdio;
mod fork;
mod pipes;
mod signals;
mod threads;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config, Mode};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    match config.mode {
        // Re-exec entry points: the verdict travels back as exit status.
        Some(Mode::Cloexec { closed_fd, kept_fd }) => {
            fdio::verify_replaced_image(closed_fd, kept_fd);
            Ok(())
        }
        Some(Mode::Exit) => Ok(()),
        Some(Mode::Pagefault) => signals::trigger_fault(),
        None => {
            info!("posixprobe starting");
            battery::run(&config)?;
            info!("posixprobe exiting");
            Ok(())
        }
    }
}
