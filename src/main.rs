use clap::{Parser, Subcommand};
use vanopticon_telemetry::{Metrics, config, run};

#[derive(Parser)]
#[command(name = "telemetry", about = "Vanopticon telemetry demo host")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Load the settings, check them and print the result
	CheckConfig,
	/// Run the demo host (default)
	Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Commands::Run) {
		Commands::CheckConfig => {
			let settings = config::load()?;
			println!("{:#?}", settings);
			match Metrics::initialize(
				&settings.metrics_port,
				&settings.namespace,
				&settings.service_name,
			) {
				Ok(_) => println!("Metrics settings are valid."),
				Err(e) => eprintln!("Invalid metrics settings: {}", e),
			}
			if !(settings.sample_rate > 0.0 && settings.sample_rate <= 1.0) {
				eprintln!(
					"Invalid sample rate {}: must be within (0.0, 1.0]",
					settings.sample_rate
				);
			}
		}
		Commands::Run => {
			let settings = match config::load() {
				Ok(s) => s,
				Err(e) => {
					eprintln!("failed to load config, using defaults: {}", e);
					config::Settings::default()
				}
			};
			run(settings).await?;
		}
	}
	Ok(())
}
