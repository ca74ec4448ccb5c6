//! mqpump: transfers data from various sources to a single RabbitMQ queue.

use clap::Parser;

use mqpump::commands::{self, PublishArgs};
use mqpump::config::LogLevel;
use mqpump::error::PipelineError;

#[derive(Parser, Debug)]
#[command(name = "mqpump")]
#[command(version, about = "Transfers data from various sources to a single RabbitMQ queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Generate a config file next to the binary
    #[command(visible_aliases = ["gen-cfg", "generate-cfg", "gen-config"])]
    GenerateConfig,

    /// Publish data to a single RabbitMQ queue
    Publish(PublishArgs),
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateConfig => {
            commands::init_logging(LogLevel::Info);
            commands::generate_config::run()
        }
        Command::Publish(args) => commands::publish::run(args).await,
    }
}
