//! CLI command definitions.

use clap::Subcommand;
use ember_core::cache::CacheType;
use ember_core::queue::Priority;

#[derive(Subcommand)]
pub enum Commands {
    /// Warm cache entries before they are requested
    Warm {
        /// Strategy to select candidates with (repeatable)
        #[arg(short, long = "strategy")]
        strategies: Vec<String>,

        /// Explicit contract address (repeatable, overrides strategies)
        #[arg(short, long = "address")]
        addresses: Vec<String>,

        /// Network to warm
        #[arg(short, long)]
        network: Option<String>,

        /// Maximum number of explorer API calls
        #[arg(short, long, default_value_t = 100)]
        budget: u64,

        /// Cache type to warm
        #[arg(long)]
        cache_type: Option<CacheType>,
    },

    /// Show cache, queue and quota statistics
    Stats {
        /// Limit to one network
        #[arg(short, long)]
        network: Option<String>,
    },

    /// Show API quota usage
    Quota {
        /// Limit to one network
        #[arg(short, long)]
        network: Option<String>,
    },

    /// Delete stale entries and recover the queue
    Cleanup {
        /// Also delete every low-quality entry regardless of age
        #[arg(long)]
        aggressive: bool,
    },

    /// Manage the warming queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Apply database migrations
    Migrate,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Stop workers from claiming items
    Pause,

    /// Allow workers to claim items again
    Resume,

    /// Return items stuck in processing to pending
    ResetStuck,

    /// Show queue statistics
    Status,

    /// Add addresses to the queue
    Enqueue {
        /// Contract addresses
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Network of the addresses
        #[arg(short, long)]
        network: Option<String>,

        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        #[arg(long)]
        cache_type: Option<CacheType>,
    },

    /// Claim and warm a batch of queued items
    Process {
        /// Maximum items to claim
        #[arg(short, long, default_value_t = 50)]
        batch_size: usize,

        /// Network to process
        #[arg(short, long)]
        network: Option<String>,

        /// Only claim items of this priority
        #[arg(short, long)]
        priority: Option<Priority>,
    },
}
