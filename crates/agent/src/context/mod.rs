//! Context management: what goes into each request.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`token`] | Pluggable token estimation |
//! | [`budget`] | Reserve and history allotment per request |
//! | [`preparer`] | Oldest-first truncation that protects the current turn |

pub mod budget;
pub mod preparer;
pub mod token;

pub use budget::{BudgetError, BudgetPolicy, TokenBudget};
pub use preparer::{MessagePreparer, OverflowError, PrepareMode, Prepared};
pub use token::{CharHeuristic, TokenCounter};
