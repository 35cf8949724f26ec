//! Adapters between cluster objects and admin API credentials

pub mod secrets;

pub use secrets::{get_secret, get_secret_string, provider_account};
