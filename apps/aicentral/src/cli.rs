use clap::Parser;

#[derive(Parser)]
#[command(name = "aicentral")]
pub(crate) struct Cli {
    /// Path to the gateway configuration file (JSON).
    #[arg(long, default_value = "aicentral.json")]
    pub(crate) config: String,
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, default_value_t = 8585)]
    pub(crate) port: u16,
    /// Seconds to let in-flight requests drain after a shutdown signal.
    #[arg(long, default_value_t = 30)]
    pub(crate) drain_seconds: u64,
}
