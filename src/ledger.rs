//! Per-phase cost accounting with a hard ceiling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Append-only record of spend per phase, bounded by `budget_limit`.
///
/// The running total never exceeds the limit: a cost that would breach it
/// is rejected before anything is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    /// Maximum total spend in USD.
    budget_limit: f64,
    /// Cumulative spend per phase.
    #[serde(default)]
    phase_costs: BTreeMap<String, f64>,
}

impl CostLedger {
    /// Creates an empty ledger with the given limit.
    pub fn new(budget_limit: f64) -> Self {
        Self {
            budget_limit,
            phase_costs: BTreeMap::new(),
        }
    }

    pub fn budget_limit(&self) -> f64 {
        self.budget_limit
    }

    /// Raises or lowers the limit, e.g. when resuming with a larger budget.
    ///
    /// Recorded spend is never touched; a limit below current spend simply
    /// leaves no room for further costs.
    pub fn set_budget_limit(&mut self, budget_limit: f64) {
        self.budget_limit = budget_limit;
    }

    /// Total spent across all phases.
    pub fn spent_total(&self) -> f64 {
        self.phase_costs.values().sum()
    }

    /// Budget left, never negative.
    pub fn remaining(&self) -> f64 {
        (self.budget_limit - self.spent_total()).max(0.0)
    }

    /// Cumulative spend recorded for one phase.
    pub fn phase_cost(&self, phase: &str) -> f64 {
        self.phase_costs.get(phase).copied().unwrap_or(0.0)
    }

    pub fn phase_costs(&self) -> &BTreeMap<String, f64> {
        &self.phase_costs
    }

    /// Non-mutating pre-flight check before starting a phase.
    pub fn estimate_check(&self, phase: &str, estimated_cost: f64) -> Result<()> {
        let remaining = self.budget_limit - self.spent_total();
        if remaining < estimated_cost {
            tracing::warn!(
                phase = %phase,
                remaining,
                estimated = estimated_cost,
                "refusing to start phase, budget too low"
            );
            return Err(Error::InsufficientBudget {
                phase: phase.to_string(),
                remaining: remaining.max(0.0),
                estimated: estimated_cost,
            });
        }
        Ok(())
    }

    /// Records a cost against a phase.
    ///
    /// Fails with [`Error::BudgetExceeded`] and leaves the ledger unchanged if
    /// the new total would exceed the limit.
    pub fn add_cost(&mut self, phase: &str, amount: f64) -> Result<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(Error::Config(format!(
                "cost for phase '{}' must be a non-negative number, got {}",
                phase, amount
            )));
        }

        let spent = self.spent_total();
        if spent + amount > self.budget_limit {
            tracing::error!(
                phase = %phase,
                spent,
                limit = self.budget_limit,
                rejected = amount,
                "cost rejected, budget exceeded"
            );
            return Err(Error::BudgetExceeded {
                spent,
                limit: self.budget_limit,
                rejected: amount,
            });
        }

        *self.phase_costs.entry(phase.to_string()).or_insert(0.0) += amount;
        tracing::debug!(phase = %phase, amount, total = spent + amount, "cost recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_cost_accumulates_per_phase() {
        let mut ledger = CostLedger::new(10.0);
        ledger.add_cost("planning", 1.0).unwrap();
        ledger.add_cost("planning", 0.5).unwrap();
        ledger.add_cost("research", 2.0).unwrap();

        assert_eq!(ledger.phase_cost("planning"), 1.5);
        assert_eq!(ledger.spent_total(), 3.5);
        assert_eq!(ledger.remaining(), 6.5);
    }

    #[test]
    fn add_cost_rejects_breach_and_leaves_total_unchanged() {
        let mut ledger = CostLedger::new(2.0);
        ledger.add_cost("research", 1.5).unwrap();

        let err = ledger.add_cost("planning", 0.75).unwrap_err();
        match err {
            Error::BudgetExceeded {
                spent,
                limit,
                rejected,
            } => {
                assert_eq!(spent, 1.5);
                assert_eq!(limit, 2.0);
                assert_eq!(rejected, 0.75);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ledger.spent_total(), 1.5);
        assert_eq!(ledger.phase_cost("planning"), 0.0);
    }

    #[test]
    fn add_cost_allows_exactly_reaching_the_limit() {
        let mut ledger = CostLedger::new(2.0);
        ledger.add_cost("a", 1.0).unwrap();
        ledger.add_cost("b", 1.0).unwrap();
        assert_eq!(ledger.remaining(), 0.0);
        assert!(ledger.add_cost("c", 0.01).is_err());
        // Zero-cost phases still fit.
        ledger.add_cost("c", 0.0).unwrap();
    }

    #[test]
    fn total_never_exceeds_limit_for_any_sequence() {
        let amounts = [0.3, 0.9, 0.05, 1.7, 0.4, 0.0, 2.2, 0.6, 0.01, 0.33];
        for limit in [0.5, 1.0, 2.5, 5.0] {
            let mut ledger = CostLedger::new(limit);
            for (i, amount) in amounts.iter().enumerate() {
                let before = ledger.spent_total();
                match ledger.add_cost(&format!("p{}", i % 3), *amount) {
                    Ok(()) => assert!(ledger.spent_total() >= before),
                    Err(_) => assert_eq!(ledger.spent_total(), before),
                }
                assert!(ledger.spent_total() <= limit);
            }
        }
    }

    #[test]
    fn negative_costs_are_rejected() {
        let mut ledger = CostLedger::new(5.0);
        ledger.add_cost("a", 1.0).unwrap();
        assert!(matches!(ledger.add_cost("a", -0.5), Err(Error::Config(_))));
        assert!(ledger.add_cost("a", f64::NAN).is_err());
        assert_eq!(ledger.phase_cost("a"), 1.0);
    }

    #[test]
    fn estimate_check_does_not_mutate() {
        let mut ledger = CostLedger::new(1.0);
        ledger.add_cost("setup", 0.25).unwrap();

        assert!(ledger.estimate_check("planning", 0.75).is_ok());
        let err = ledger.estimate_check("implementation", 2.0).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientBudget { ref phase, .. } if phase == "implementation"
        ));
        assert_eq!(ledger.spent_total(), 0.25);
    }

    #[test]
    fn ledger_serializes_with_phase_costs() {
        let mut ledger = CostLedger::new(3.0);
        ledger.add_cost("planning", 1.25).unwrap();
        let json = serde_json::to_string(&ledger).unwrap();
        assert!(json.contains("\"budget_limit\":3.0"));
        assert!(json.contains("\"planning\":1.25"));

        let back: CostLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
    }
}
