pub mod monitor_wallet;
pub mod process_claims;
pub mod refill_wallet;
