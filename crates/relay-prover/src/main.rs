use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_prover::command::{cancel, init, query, start, unsafe_reset_db, verify, version, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep dependency noise at warn, show info level for the relay crates.
    let mut filter = EnvFilter::new("warn,relay_prover=info,storage=info");
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        if let Ok(parsed) = env_filter.parse() {
            filter = filter.add_directive(parsed);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Init {} => init()?,
        Commands::Start {} => start().await?,
        Commands::Verify { from, to, server } => verify(from, to, server).await?,
        Commands::Cancel { queue, slot, server } => cancel(queue, slot, server).await?,
        Commands::Version {} => version(),
        Commands::Query(query_cmd) => query(query_cmd).await?,
        Commands::UnsafeResetDb {} => unsafe_reset_db()?,
    }

    Ok(())
}
