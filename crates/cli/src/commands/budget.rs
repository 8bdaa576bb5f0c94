//! `parley budget`: Show how a context window is split.

use parley_agent::{BudgetPolicy, TokenBudget};
use parley_config::AppConfig;

pub fn run(
    config: &AppConfig,
    window: usize,
    overhead: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let policy = BudgetPolicy::new(config.budget.reserve_fraction, config.budget.floor_tokens);
    let budget = policy.compute(window, overhead)?;
    print!("{}", render(&budget));
    Ok(())
}

pub fn render(budget: &TokenBudget) -> String {
    format!(
        "  Context window:   {:>8}\n  Fixed overhead:   {:>8}\n  Reserve:          {:>8}\n  History budget:   {:>8}\n  Response budget:  {:>8}\n",
        budget.context_window,
        budget.fixed_overhead,
        budget.reserve,
        budget.available_for_history,
        budget.available_for_response,
    )
}
