use acond_tools::commands;
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_FILTER_VARIABLE: &str = "ACOND_TOOLS_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Fields(commands::fields::Args),
    Read(commands::read::Args),
    Poll(commands::poll::Args),
    SetDhwTemperature(commands::set_dhw_temperature::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description =
        std::env::var(LOG_FILTER_VARIABLE).unwrap_or_else(|_| "warn".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_FILTER_VARIABLE} is not a valid log filter");
            eprintln!("  because: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Fields(args) => end(commands::fields::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Poll(args) => end(commands::poll::run(args)),
        Commands::SetDhwTemperature(args) => end(commands::set_dhw_temperature::run(args)),
    }
}
