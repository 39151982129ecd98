//! Position lifecycle strategy: entry, capital, margin balance, reopen cycle.

pub mod balancer;
pub mod capital;
pub mod cycle;
pub mod entry;

pub use balancer::{BalanceOutcome, MarginBalancer};
pub use capital::{CapitalAllocator, CapitalCheck, WalletMove};
pub use cycle::{CycleManager, CycleOutcome};
pub use entry::{EntryManager, EntryOutcome};
