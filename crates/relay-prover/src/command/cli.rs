use clap::{Parser, Subcommand};

pub const VERSION: &str = "v0.1.0";

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "relay-prover", version = VERSION, about = "Light client update proof relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize configuration and home directory
    Init {},

    /// Start the relay pipeline and the admin API
    Start {},

    /// Verify the stored proof chain over a slot range
    #[command(after_help = "EXAMPLES:\n    relay-prover verify\n    relay-prover verify --from 100 --to 200\n    relay-prover verify --server http://localhost:8080")]
    Verify {
        /// Trusted checkpoint slot to start after (default: genesis)
        #[arg(long)]
        from: Option<u64>,

        /// Last slot to verify (default: chain head)
        #[arg(long)]
        to: Option<u64>,

        /// Admin API address (default: http://127.0.0.1:8080)
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Cancel a pending job
    #[command(after_help = "EXAMPLES:\n    relay-prover cancel proofs 12345\n    relay-prover cancel updates 12345 --server http://localhost:8080")]
    Cancel {
        /// Queue name (updates or proofs)
        queue: String,

        /// Slot identifying the job
        slot: u64,

        /// Admin API address (default: http://127.0.0.1:8080)
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Show the service version
    Version {},

    /// Query stored proofs and queue status from the admin API
    #[command(subcommand)]
    Query(QueryCommands),

    /// Reset all database state in the local data directory
    UnsafeResetDb {},
}

#[derive(Subcommand)]
pub enum QueryCommands {
    /// Get the latest update proof
    #[command(
        about = "Get the latest update proof",
        after_help = "EXAMPLES:\n    relay-prover query latest\n    relay-prover query latest --server http://localhost:8080"
    )]
    Latest {
        /// Admin API address (default: http://127.0.0.1:8080)
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Get an update proof by slot
    #[command(
        about = "Get an update proof by slot",
        after_help = "EXAMPLES:\n    relay-prover query proof 12345\n    relay-prover query proof 12345 --server http://localhost:8080"
    )]
    Proof {
        /// Update slot
        slot: u64,

        /// Admin API address (default: http://127.0.0.1:8080)
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Get update proofs in a slot range
    #[command(
        about = "Get update proofs in a slot range",
        after_help = "EXAMPLES:\n    relay-prover query range 100 200\n    relay-prover query range 100 200 --server http://localhost:8080"
    )]
    Range {
        /// Start slot (inclusive)
        start_slot: u64,

        /// End slot (inclusive)
        end_slot: u64,

        /// Admin API address (default: http://127.0.0.1:8080)
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Get the chain head and queue depths
    #[command(
        about = "Get the chain head and queue depths",
        after_help = "EXAMPLES:\n    relay-prover query status\n    relay-prover query status --server http://localhost:8080"
    )]
    Status {
        /// Admin API address (default: http://127.0.0.1:8080)
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}
