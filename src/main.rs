use clap::Parser;

use lingogate::ServeOptions;

#[derive(Parser)]
#[command(name = "lingogate", about = "Rate-limited translation gateway")]
struct Cli {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// HTTP port
    #[arg(long, default_value = "5000")]
    port: u16,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "lingogate=info,tower_http=info")]
    log_level: String,
    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lingogate::run(ServeOptions {
        host: cli.host,
        port: cli.port,
        log_level: cli.log_level,
        log_json: cli.log_json,
    })
    .await
}
