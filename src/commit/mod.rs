pub mod runner;

pub use runner::{MAX_TRANSACTION_ATTEMPTS, run_in_transaction, run_in_transaction_with_attempts};
