//! Token budget: how much of the context window history may use.
//!
//! The reserve for the model's response is proportional to the window with a
//! floor, so it never swallows a small window and never starves a large one.
//! Arithmetic is done in integers (the fraction is held in basis points) so
//! results are exact and reproducible.

use serde::{Deserialize, Serialize};

/// Outcome of a budget computation for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub context_window: usize,
    /// System prompt plus injected tool schemas.
    pub fixed_overhead: usize,
    /// Tokens withheld from history for the response.
    pub reserve: usize,
    pub available_for_history: usize,
    pub available_for_response: usize,
}

/// Reserve policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPolicy {
    reserve_bps: u32,
    floor_tokens: usize,
}

const BPS: u32 = 10_000;

impl BudgetPolicy {
    /// `reserve_fraction` is clamped into `(0, 1)`.
    pub fn new(reserve_fraction: f64, floor_tokens: usize) -> Self {
        let bps = (reserve_fraction * f64::from(BPS)).round();
        let reserve_bps = if bps.is_nan() {
            BPS / 10
        } else {
            (bps as u32).clamp(1, BPS - 1)
        };
        Self {
            reserve_bps,
            floor_tokens,
        }
    }

    pub fn floor_tokens(&self) -> usize {
        self.floor_tokens
    }

    /// Compute the budget for a window and the size of non-negotiable content.
    ///
    /// The reserve is `max(floor, ceil(window * fraction))`, capped so that
    /// `reserve + fixed_overhead` never exceeds the window.
    pub fn compute(
        &self,
        context_window: usize,
        fixed_overhead: usize,
    ) -> Result<TokenBudget, BudgetError> {
        let minimum = fixed_overhead.saturating_add(self.floor_tokens);
        if context_window <= minimum {
            return Err(BudgetError::WindowTooSmall {
                context_window,
                fixed_overhead,
                floor_tokens: self.floor_tokens,
            });
        }

        let proportional =
            (context_window as u128 * u128::from(self.reserve_bps)).div_ceil(u128::from(BPS));
        let proportional = usize::try_from(proportional).unwrap_or(usize::MAX);
        let reserve = proportional
            .max(self.floor_tokens)
            .min(context_window - fixed_overhead);

        Ok(TokenBudget {
            context_window,
            fixed_overhead,
            reserve,
            available_for_history: context_window - fixed_overhead - reserve,
            available_for_response: reserve,
        })
    }
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self::new(0.10, 200)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    #[error(
        "context window of {context_window} tokens cannot hold {fixed_overhead} tokens of \
         fixed content plus the {floor_tokens}-token response floor"
    )]
    WindowTooSmall {
        context_window: usize,
        fixed_overhead: usize,
        floor_tokens: usize,
    },
}
