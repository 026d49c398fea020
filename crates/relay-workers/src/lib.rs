//! Background workers that move posts from source channels to target channels.

mod album;
mod classifier;
mod config;
mod improve;
mod publisher;
mod registry;
mod runtime;
mod scraper;

pub use album::AlbumBuffer;
pub use classifier::{route_classification, ClassifierSummary, ClassifierWorker, Route};
pub use config::{ClassifierConfig, PublisherConfig, RelayConfig, RuntimeConfig, ScraperConfig};
pub use improve::improve_post;
pub use publisher::{placeholder_message_id, PublishOutcome, PublisherSummary, PublisherWorker};
pub use registry::{ChannelRegistry, SeedSummary};
pub use runtime::{run_workers, supervise, Worker};
pub use scraper::{PullSummary, ScraperWorker};

pub const CRATE_NAME: &str = "relay-workers";
