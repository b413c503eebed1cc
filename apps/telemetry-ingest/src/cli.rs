use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "telemetry-ingest",
    version,
    about = "Sensor reading ingestion gateway and persistence workers"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
    /// Serve the API without running persistence workers in this process.
    #[arg(long, default_value_t = false)]
    pub no_workers: bool,
}
