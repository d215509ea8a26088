use anyhow::Result;
use clap::Parser;
use isa_gateway::{Config, Gateway};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Use config from file (YAML). Defaults apply when omitted;
	/// ISA_CLOUD_* environment variables override either way.
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let config = Config::load(args.file.as_deref())?;

	let gateway = Gateway::new(config).await?;
	gateway.run().await
}
