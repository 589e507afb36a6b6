use clap::Parser;

use bloomtree::commands::{run_build, run_query, Cli, Commands};
use bloomtree::logging::init_logger;

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let result = match cli.command {
        Commands::Query(args) => run_query(args),
        Commands::Build(args) => run_build(args),
    };

    if let Err(err) = result {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
