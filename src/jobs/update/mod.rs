//! Periodic refresh jobs for reference data

pub mod capital_leagues;

pub use capital_leagues::{FetchCapitalLeagues, FetchCapitalLeaguesProvider};

use super::RegisteredJobs;

/// Register every bundled update job kind
pub fn register_all(registry: &mut RegisteredJobs) {
    registry.register(FetchCapitalLeaguesProvider::new());
}
