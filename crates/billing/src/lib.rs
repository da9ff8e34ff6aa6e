//! Token accounting: the quota ledger, the per-account plan cache, and
//! the live pricing catalog used for BYOK real-cost logging.

pub mod ledger;
pub mod pricing;

pub use ledger::{Consumption, Ledger, TokenStatus};
pub use pricing::PricingCatalog;
