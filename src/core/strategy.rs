use super::tax::{self, IncomeBreakdown, TaxParameters};

const MAX_ITERATIONS: u32 = 3;
// Deferred-cost reductions applied when projected future base income runs
// ahead of the current year by more than 30% / 15%.
const LOOKAHEAD_BONUS_LARGE: f64 = 0.05;
const LOOKAHEAD_BONUS_SMALL: f64 = 0.02;

#[derive(Copy, Clone, Debug, Default)]
pub struct AccountBalances {
    pub rrsp: f64,
    pub tfsa: f64,
    pub non_registered: f64,
}

/// Everything the allocator needs to price a withdrawal dollar.
pub struct OptimizerInputs<'a> {
    /// Net cash required, already floored at the mandatory minimum.
    pub need: f64,
    pub balances: AccountBalances,
    pub age: u32,
    pub params: &'a TaxParameters,
    /// Taxable income already booked for the year before any withdrawal.
    pub base_income: IncomeBreakdown,
    /// Unrealized-gain share of the taxable account, in [0, 1].
    pub unrealized_gain_fraction: f64,
    /// This year's base income level the look-ahead compares against.
    pub current_base_income: f64,
    /// Projected base income (scheduled income + forced minimums) for the
    /// look-ahead window.
    pub future_base_incomes: &'a [f64],
    pub strategic_bonus: f64,
    pub tfsa_penalty: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WithdrawalPlan {
    pub rrsp: f64,
    pub tfsa: f64,
    pub non_registered: f64,
    pub estimated_tax: f64,
    pub converged: bool,
    pub feasible: bool,
    pub reason: String,
}

impl WithdrawalPlan {
    pub fn total(&self) -> f64 {
        self.rrsp + self.tfsa + self.non_registered
    }
}

// Allocation order doubles as the LP tie-break: deferred, taxable, tax-free.
const RRSP: usize = 0;
const NON_REGISTERED: usize = 1;
const TFSA: usize = 2;

/// Computes a tax-minimizing withdrawal allocation for the year.
///
/// The withdrawal amount sets the tax owed and the tax owed sets the amount
/// that must be withdrawn, so the allocator runs a bounded fixed-point
/// iteration: estimate tax on the current guess, re-derive per-dollar costs,
/// re-solve the small linear program, and stop as soon as the allocation
/// repeats. Infeasibility falls back to a greedy top-up rather than an error.
pub fn plan_withdrawals(inputs: &OptimizerInputs) -> WithdrawalPlan {
    let caps = [
        inputs.balances.rrsp.max(0.0),
        inputs.balances.non_registered.max(0.0),
        inputs.balances.tfsa.max(0.0),
    ];
    let need = inputs.need.max(0.0);

    let mut alloc = [0.0_f64; 3];
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..MAX_ITERATIONS {
        iterations += 1;
        let (tax_cost, marginal) = incremental_tax(inputs, &alloc);
        let costs = account_costs(inputs, marginal);
        let next = solve_lp(&costs, &caps, need + tax_cost);
        if next == alloc {
            converged = true;
            break;
        }
        alloc = next;
    }

    let (final_tax, _) = incremental_tax(inputs, &alloc);
    let required = need + final_tax;
    let mut feasible = true;
    let mut topped_up = false;

    if alloc.iter().sum::<f64>() + 1e-6 < required {
        // Greedy shortfall correction: tax-free, then taxable, then deferred.
        for idx in [TFSA, NON_REGISTERED, RRSP] {
            let shortfall = required - alloc.iter().sum::<f64>();
            if shortfall <= 1e-6 {
                break;
            }
            let room = (caps[idx] - alloc[idx]).max(0.0);
            let add = shortfall.min(room).ceil().min(room);
            if add > 0.0 {
                alloc[idx] += add;
                topped_up = true;
            }
        }
        if alloc.iter().sum::<f64>() + 1e-6 < required {
            feasible = false;
        }
    }

    let reason = if !feasible {
        log::warn!(
            "withdrawal need {required:.0} exceeds combined account capacity {:.0}",
            caps.iter().sum::<f64>()
        );
        format!("infeasible: need {required:.0} exceeds account capacity")
    } else if topped_up {
        "greedy top-up covered solver shortfall".to_string()
    } else if converged {
        format!("converged in {iterations} iterations")
    } else {
        log::warn!("allocator hit the {MAX_ITERATIONS}-iteration cap without converging");
        format!("iteration cap of {MAX_ITERATIONS} reached; last allocation kept")
    };

    WithdrawalPlan {
        rrsp: alloc[RRSP],
        tfsa: alloc[TFSA],
        non_registered: alloc[NON_REGISTERED],
        estimated_tax: final_tax,
        converged,
        feasible,
        reason,
    }
}

/// Incremental tax caused by the candidate withdrawals on top of the year's
/// base income, plus the marginal rate at the resulting income level.
fn incremental_tax(inputs: &OptimizerInputs, alloc: &[f64; 3]) -> (f64, f64) {
    let baseline = tax::calculate_tax(&inputs.base_income, inputs.age, inputs.params);
    let with_withdrawals = IncomeBreakdown {
        rrsp_withdrawal: inputs.base_income.rrsp_withdrawal + alloc[RRSP],
        capital_gains: inputs.base_income.capital_gains
            + alloc[NON_REGISTERED]
                * inputs.unrealized_gain_fraction
                * tax::CAPITAL_GAINS_INCLUSION,
        ..inputs.base_income
    };
    let assessment = tax::calculate_tax(&with_withdrawals, inputs.age, inputs.params);
    (
        (assessment.total_tax - baseline.total_tax).max(0.0),
        assessment.marginal_rate,
    )
}

fn account_costs(inputs: &OptimizerInputs, marginal: f64) -> [f64; 3] {
    let lookahead =
        lookahead_bonus(inputs.current_base_income, inputs.future_base_incomes);
    let mut costs = [0.0; 3];
    costs[RRSP] = marginal - lookahead - inputs.strategic_bonus;
    costs[NON_REGISTERED] =
        marginal * inputs.unrealized_gain_fraction.clamp(0.0, 1.0) * tax::CAPITAL_GAINS_INCLUSION;
    costs[TFSA] = inputs.tfsa_penalty;
    costs
}

/// Larger reduction when projected future base income runs well ahead of the
/// current year, to pull deferred withdrawals forward into lower brackets.
fn lookahead_bonus(current_base_income: f64, future_base_incomes: &[f64]) -> f64 {
    if future_base_incomes.is_empty() || current_base_income <= 0.0 {
        return 0.0;
    }
    let avg = future_base_incomes.iter().sum::<f64>() / future_base_incomes.len() as f64;
    let ratio = avg / current_base_income;
    if ratio > 1.30 {
        LOOKAHEAD_BONUS_LARGE
    } else if ratio > 1.15 {
        LOOKAHEAD_BONUS_SMALL
    } else {
        0.0
    }
}

/// Three-variable linear program: minimize `Σ cost·w` subject to
/// `Σ w ≥ target` and `0 ≤ w ≤ cap`. With a single covering constraint the
/// optimum is the greedy fill in ascending cost order; ties break on the
/// fixed deferred → taxable → tax-free ordering. Results are rounded to
/// non-negative whole dollars.
fn solve_lp(costs: &[f64; 3], caps: &[f64; 3], target: f64) -> [f64; 3] {
    let mut order = [RRSP, NON_REGISTERED, TFSA];
    order.sort_by(|a, b| costs[*a].total_cmp(&costs[*b]).then(a.cmp(b)));

    let mut alloc = [0.0; 3];
    let mut remaining = target.max(0.0);
    for idx in order {
        if remaining <= 0.0 {
            break;
        }
        let mut take = remaining.min(caps[idx]).round();
        if take > caps[idx] {
            take = caps[idx].floor();
        }
        let take = take.max(0.0);
        alloc[idx] = take;
        remaining -= take;
    }
    alloc
}
