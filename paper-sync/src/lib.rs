pub mod cli;
pub mod gcp;
pub mod gcs;
pub mod load_config;
pub mod pubsub;
pub mod webnode;

pub use cli::{run, Cli, Commands};
