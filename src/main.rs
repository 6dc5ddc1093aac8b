mod cli;
mod commands;

use adsynq::ui::{self, Level, emit};
use clap::Parser;
use std::io::IsTerminal;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    ui::set_debug_mode(cli.debug);
    ui::init(
        cli.output.into(),
        !cli.no_color && std::io::stdout().is_terminal(),
    );

    let code = match commands::dispatch(cli).await {
        Ok(exit) => exit.code(),
        Err(e) => {
            emit(Level::Error, "adsynq.error", &format!("Error: {e:#}"), None);
            1
        }
    };
    std::process::exit(code);
}
