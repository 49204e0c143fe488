use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chorus-server", about = "Chorus presence and notification relay")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/chorus.toml")]
    pub config: String,

    /// Listen address (overrides config and environment)
    #[arg(long)]
    pub bind: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}
