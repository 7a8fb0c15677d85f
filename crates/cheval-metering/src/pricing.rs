//! Integer micro-USD pricing.
//!
//! The per-call primitive splits `tokens × price_per_mtok` into a
//! micro-USD cost and a sub-micro-USD remainder:
//!
//! ```text
//! cost × 1_000_000 + remainder == tokens × price_per_mtok
//! ```
//!
//! The conservation equality holds for every accepted input; products
//! above `2^53 − 1` are rejected for interop parity with
//! IEEE-754-double-safe integers.

use std::collections::HashMap;

use cheval_config::{HounfourConfig, PricingConfig, PricingMode};
use cheval_core::{ChevalError, ChevalResult, ErrorKind};

/// Largest product accepted by the cost primitive (`2^53 − 1`).
pub const MAX_SAFE_PRODUCT: u64 = (1 << 53) - 1;

const MICRO_PER_USD: u64 = 1_000_000;

/// Cost of `tokens` at `price_micro_per_million`, with remainder.
///
/// # Errors
///
/// `BUDGET_OVERFLOW` when the product exceeds [`MAX_SAFE_PRODUCT`].
pub fn cost_micro(tokens: u64, price_micro_per_million: u64) -> ChevalResult<(u64, u64)> {
    let product = tokens.checked_mul(price_micro_per_million).ok_or_else(|| {
        overflow_error(tokens, price_micro_per_million)
    })?;
    if product > MAX_SAFE_PRODUCT {
        return Err(overflow_error(tokens, price_micro_per_million));
    }
    Ok((product / MICRO_PER_USD, product % MICRO_PER_USD))
}

fn overflow_error(tokens: u64, price: u64) -> ChevalError {
    ChevalError::new(
        ErrorKind::BudgetOverflow,
        format!("tokens({tokens}) * price({price}) exceeds MAX_SAFE_PRODUCT"),
    )
}

/// Detailed cost breakdown for a single completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostBreakdown {
    /// Input-token cost in micro-USD.
    pub input_cost_micro: u64,
    /// Output-token cost in micro-USD.
    pub output_cost_micro: u64,
    /// Reasoning-token cost in micro-USD.
    pub reasoning_cost_micro: u64,
    /// Total cost in micro-USD, including any per-task amount.
    pub total_cost_micro: u64,
    /// Sub-micro-USD remainder from the input calculation.
    pub remainder_input: u64,
    /// Sub-micro-USD remainder from the output calculation.
    pub remainder_output: u64,
    /// Sub-micro-USD remainder from the reasoning calculation.
    pub remainder_reasoning: u64,
}

/// Total cost for a completion, dispatching on the pricing mode.
///
/// - `token`: sum of the three token-cost primitives.
/// - `task`: flat `per_task_micro_usd`; token counts retained upstream
///   for observability but not for cost.
/// - `hybrid`: token total plus the flat per-task amount.
///
/// # Errors
///
/// `BUDGET_OVERFLOW` from any token-cost primitive.
pub fn total_cost(
    input_tokens: u64,
    output_tokens: u64,
    reasoning_tokens: u64,
    pricing: &PricingConfig,
) -> ChevalResult<CostBreakdown> {
    if pricing.pricing_mode == PricingMode::Task {
        return Ok(CostBreakdown {
            input_cost_micro: 0,
            output_cost_micro: 0,
            reasoning_cost_micro: 0,
            total_cost_micro: pricing.per_task_micro_usd,
            remainder_input: 0,
            remainder_output: 0,
            remainder_reasoning: 0,
        });
    }

    let (input_cost, input_rem) = cost_micro(input_tokens, pricing.input_per_mtok)?;
    let (output_cost, output_rem) = cost_micro(output_tokens, pricing.output_per_mtok)?;
    let (reasoning_cost, reasoning_rem) = if pricing.reasoning_per_mtok > 0 && reasoning_tokens > 0
    {
        cost_micro(reasoning_tokens, pricing.reasoning_per_mtok)?
    } else {
        (0, 0)
    };

    let mut token_total = input_cost
        .saturating_add(output_cost)
        .saturating_add(reasoning_cost);
    if pricing.pricing_mode == PricingMode::Hybrid {
        token_total = token_total.saturating_add(pricing.per_task_micro_usd);
    }

    Ok(CostBreakdown {
        input_cost_micro: input_cost,
        output_cost_micro: output_cost,
        reasoning_cost_micro: reasoning_cost,
        total_cost_micro: token_total,
        remainder_input: input_rem,
        remainder_output: output_rem,
        remainder_reasoning: reasoning_rem,
    })
}

/// Carries sub-micro-USD remainders between invocations, keyed by an
/// arbitrary scope string, so long sequences eventually accumulate a
/// full micro-USD. Conservation holds across accumulations.
#[derive(Debug, Default)]
pub struct RemainderAccumulator {
    remainders: HashMap<String, u64>,
}

impl RemainderAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a remainder into the scope; returns the whole micro-USD to
    /// add to the cost (usually 0 or 1).
    pub fn carry(&mut self, scope: &str, remainder_micro: u64) -> u64 {
        let current = self.remainders.get(scope).copied().unwrap_or(0);
        let total = current + remainder_micro;
        self.remainders.insert(scope.to_owned(), total % MICRO_PER_USD);
        total / MICRO_PER_USD
    }

    /// Current accumulated remainder for a scope.
    #[must_use]
    pub fn get(&self, scope: &str) -> u64 {
        self.remainders.get(scope).copied().unwrap_or(0)
    }

    /// Reset all scopes.
    pub fn clear(&mut self) {
        self.remainders.clear();
    }
}

/// Look up pricing for a provider/model from config.
#[must_use]
pub fn find_pricing<'a>(
    provider: &str,
    model: &str,
    config: &'a HounfourConfig,
) -> Option<&'a PricingConfig> {
    config.model_config(provider, model)?.pricing.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_pricing(input: u64, output: u64) -> PricingConfig {
        PricingConfig {
            input_per_mtok: input,
            output_per_mtok: output,
            reasoning_per_mtok: 0,
            per_task_micro_usd: 0,
            pricing_mode: PricingMode::Token,
        }
    }

    #[test]
    fn test_conservation_invariant() {
        let cases = [
            (0u64, 0u64),
            (1, 1),
            (4200, 10_000_000),
            (1800, 30_000_000),
            (999_999, 333),
            (1, 999_999),
            (7, 142_857),
        ];
        for (tokens, price) in cases {
            let (cost, remainder) = cost_micro(tokens, price).unwrap();
            assert_eq!(
                cost * MICRO_PER_USD + remainder,
                tokens * price,
                "conservation failed for tokens={tokens} price={price}"
            );
            assert!(remainder < MICRO_PER_USD);
        }
    }

    #[test]
    fn test_overflow_boundary() {
        // Exactly 2^53 - 1 is accepted; one higher is rejected.
        let (cost, remainder) = cost_micro(MAX_SAFE_PRODUCT, 1).unwrap();
        assert_eq!(cost * MICRO_PER_USD + remainder, MAX_SAFE_PRODUCT);

        let err = cost_micro(MAX_SAFE_PRODUCT / 2 + 1, 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BudgetOverflow);
    }

    #[test]
    fn test_zero_tokens_zero_cost_all_modes() {
        let mut pricing = token_pricing(10_000_000, 30_000_000);
        let breakdown = total_cost(0, 0, 0, &pricing).unwrap();
        assert_eq!(breakdown.total_cost_micro, 0);

        pricing.pricing_mode = PricingMode::Hybrid;
        let breakdown = total_cost(0, 0, 0, &pricing).unwrap();
        assert_eq!(breakdown.total_cost_micro, 0);

        pricing.pricing_mode = PricingMode::Task;
        let breakdown = total_cost(0, 0, 0, &pricing).unwrap();
        assert_eq!(breakdown.total_cost_micro, 0);
    }

    #[test]
    fn test_happy_path_token_pricing() {
        // 4200 input at $10/Mtok + 1800 output at $30/Mtok = $0.096.
        let pricing = token_pricing(10_000_000, 30_000_000);
        let breakdown = total_cost(4200, 1800, 0, &pricing).unwrap();
        assert_eq!(breakdown.input_cost_micro, 42_000);
        assert_eq!(breakdown.output_cost_micro, 54_000);
        assert_eq!(breakdown.total_cost_micro, 96_000);
    }

    #[test]
    fn test_task_mode_ignores_tokens() {
        let pricing = PricingConfig {
            per_task_micro_usd: 2_000_000,
            pricing_mode: PricingMode::Task,
            ..token_pricing(10_000_000, 30_000_000)
        };
        let breakdown = total_cost(1_000_000, 1_000_000, 500_000, &pricing).unwrap();
        assert_eq!(breakdown.total_cost_micro, 2_000_000);
        assert_eq!(breakdown.input_cost_micro, 0);
    }

    #[test]
    fn test_hybrid_equals_token_plus_task() {
        let token = token_pricing(10_000_000, 30_000_000);
        let hybrid = PricingConfig {
            per_task_micro_usd: 500_000,
            pricing_mode: PricingMode::Hybrid,
            ..token.clone()
        };
        let token_total = total_cost(4200, 1800, 0, &token).unwrap().total_cost_micro;
        let hybrid_total = total_cost(4200, 1800, 0, &hybrid).unwrap().total_cost_micro;
        assert_eq!(hybrid_total, token_total + 500_000);
    }

    #[test]
    fn test_reasoning_tokens_priced_when_configured() {
        let pricing = PricingConfig {
            reasoning_per_mtok: 60_000_000,
            ..token_pricing(10_000_000, 30_000_000)
        };
        let breakdown = total_cost(0, 0, 1000, &pricing).unwrap();
        assert_eq!(breakdown.reasoning_cost_micro, 60_000);
    }

    #[test]
    fn test_remainder_accumulator_carries() {
        let mut acc = RemainderAccumulator::new();
        // 600_000 + 600_000 = 1_200_000 → carry 1, keep 200_000.
        assert_eq!(acc.carry("scope", 600_000), 0);
        assert_eq!(acc.carry("scope", 600_000), 1);
        assert_eq!(acc.get("scope"), 200_000);
        // Scopes are independent.
        assert_eq!(acc.get("other"), 0);
    }

    #[test]
    fn test_remainder_accumulator_conservation() {
        let mut acc = RemainderAccumulator::new();
        let remainders = [999_999u64, 1, 500_000, 499_999, 2];
        let mut carried = 0;
        for r in remainders {
            carried += acc.carry("s", r);
        }
        let total: u64 = remainders.iter().sum();
        assert_eq!(carried * MICRO_PER_USD + acc.get("s"), total);
    }
}
