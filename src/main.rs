use anyhow::Result;
use tracing::error;

use qcbake::cli::{self, Commands};

fn main() -> Result<()> {
    let args = cli::parse_args()?;
    qcbake::init_logging(args.command.log_level())?;

    let result = match &args.command {
        Commands::Validate(opts) => qcbake::run_validate(opts),
        Commands::Plan(opts) => qcbake::run_plan(opts),
        Commands::Completions(opts) => qcbake::run_completions(opts),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
