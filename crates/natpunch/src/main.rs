mod natpunch;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "natpunch",
    version,
    about = "natpunch - UDP hole-punching tunnel for exposing local services"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml/.json). If omitted, uses NATPUNCH_CONFIG; then auto-detects natpunch.toml > natpunch.yaml > natpunch.yml > natpunch.json from CWD; then falls back to the OS default path (Linux: /etc/natpunch/natpunch.toml; others: user config dir).
    #[arg(long, env = "NATPUNCH_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Overrides the `role` key of the config file.
    #[arg(long, value_enum)]
    role: Option<natpunch::config::Role>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    natpunch::run(cli.config, cli.role).await
}
