pub mod stratum;
pub mod shares;
pub mod metrics;
pub mod config;
pub mod jobs;
pub mod api;

// Address helper used by the sync-wallet binary; the Stratum engine treats worker names as opaque.
pub mod wallet;
