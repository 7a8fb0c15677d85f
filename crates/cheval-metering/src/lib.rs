//! Cost accounting and resource limiting for the Cheval gateway.
//!
//! All money is integer micro-USD (1 USD = 1,000,000 micro-USD); no
//! floating point anywhere in the cost path. The ledger is append-only
//! JSONL guarded by advisory file locks, with an O(1) per-day spend
//! counter beside it.

pub mod budget;
pub mod ledger;
pub mod limiter;
pub mod pricing;

pub use budget::{check_budget, BudgetDecision, BudgetEnforcer};
pub use ledger::{
    append_ledger, daily_spend_path, read_daily_spend, read_ledger, record_cost,
    update_daily_spend, LedgerEntry,
};
pub use limiter::TokenBucketLimiter;
pub use pricing::{
    cost_micro, find_pricing, total_cost, CostBreakdown, RemainderAccumulator, MAX_SAFE_PRODUCT,
};
