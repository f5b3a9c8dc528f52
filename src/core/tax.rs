use serde::{Deserialize, Serialize};

use super::types::Province;

/// Reference year for all canonical tables below. Thresholds, personal
/// amounts, and credit caps are indexed from this year by the scenario's
/// inflation rate; rates themselves are never indexed.
pub const BASE_YEAR: i32 = 2024;

pub const DIVIDEND_GROSS_UP: f64 = 1.38;
pub const CAPITAL_GAINS_INCLUSION: f64 = 0.5;
pub const OAS_CLAWBACK_RATE: f64 = 0.15;

const AGE_CREDIT_PHASE_OUT: f64 = 0.15;
// Legislated cut to the bottom federal rate taking effect the year after the
// reference year. Applied as an explicit rule, not folded into the table.
const FIRST_FEDERAL_RATE_AFTER_BASE: f64 = 0.14;

const FEDERAL_BRACKETS: [(f64, f64); 5] = [
    (55_867.0, 0.15),
    (111_733.0, 0.205),
    (173_205.0, 0.26),
    (246_752.0, 0.29),
    (f64::INFINITY, 0.33),
];
const FEDERAL_BPA: f64 = 15_705.0;
const FEDERAL_AGE_AMOUNT: f64 = 8_790.0;
const FEDERAL_AGE_THRESHOLD: f64 = 44_325.0;
const FEDERAL_PENSION_CAP: f64 = 2_000.0;
const FEDERAL_DIVIDEND_CREDIT: f64 = 0.150198;
const OAS_CLAWBACK_THRESHOLD: f64 = 90_997.0;
const OAS_ANNUAL_AMOUNT: f64 = 8_560.0;
const QUEBEC_ABATEMENT: f64 = 0.165;

struct ProvinceTable {
    brackets: &'static [(f64, f64)],
    bpa: f64,
    age_amount: f64,
    age_threshold: f64,
    pension_cap: f64,
    dividend_credit: f64,
    surtax: Option<SurtaxParams>,
    federal_abatement: f64,
}

static ONTARIO: ProvinceTable = ProvinceTable {
    brackets: &[
        (51_446.0, 0.0505),
        (102_894.0, 0.0915),
        (150_000.0, 0.1116),
        (220_000.0, 0.1216),
        (f64::INFINITY, 0.1316),
    ],
    bpa: 12_399.0,
    age_amount: 6_054.0,
    age_threshold: 45_068.0,
    pension_cap: 1_714.0,
    dividend_credit: 0.10,
    surtax: Some(SurtaxParams {
        first_threshold: 5_554.0,
        first_rate: 0.20,
        second_threshold: 7_108.0,
        second_rate: 0.36,
    }),
    federal_abatement: 0.0,
};

static QUEBEC: ProvinceTable = ProvinceTable {
    brackets: &[
        (51_780.0, 0.14),
        (103_545.0, 0.19),
        (126_000.0, 0.24),
        (f64::INFINITY, 0.2575),
    ],
    bpa: 18_056.0,
    age_amount: 3_798.0,
    age_threshold: 38_945.0,
    pension_cap: 3_374.0,
    dividend_credit: 0.117,
    surtax: None,
    federal_abatement: QUEBEC_ABATEMENT,
};

static BRITISH_COLUMBIA: ProvinceTable = ProvinceTable {
    brackets: &[
        (47_937.0, 0.0506),
        (95_875.0, 0.077),
        (110_076.0, 0.105),
        (133_664.0, 0.1229),
        (181_232.0, 0.147),
        (252_752.0, 0.168),
        (f64::INFINITY, 0.205),
    ],
    bpa: 12_580.0,
    age_amount: 5_373.0,
    age_threshold: 40_004.0,
    pension_cap: 1_000.0,
    dividend_credit: 0.12,
    surtax: None,
    federal_abatement: 0.0,
};

static ALBERTA: ProvinceTable = ProvinceTable {
    brackets: &[
        (148_269.0, 0.10),
        (177_922.0, 0.12),
        (237_230.0, 0.13),
        (355_845.0, 0.14),
        (f64::INFINITY, 0.15),
    ],
    bpa: 21_885.0,
    age_amount: 6_097.0,
    age_threshold: 45_350.0,
    pension_cap: 1_632.0,
    dividend_credit: 0.0812,
    surtax: None,
    federal_abatement: 0.0,
};

fn province_table(province: Province) -> &'static ProvinceTable {
    match province {
        Province::Ontario => &ONTARIO,
        Province::Quebec => &QUEBEC,
        Province::BritishColumbia => &BRITISH_COLUMBIA,
        Province::Alberta => &ALBERTA,
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TaxBracket {
    /// Upper-inclusive boundary; the last bracket carries infinity.
    pub upper: f64,
    pub rate: f64,
}

#[derive(Copy, Clone, Debug)]
pub struct SurtaxParams {
    pub first_threshold: f64,
    pub first_rate: f64,
    pub second_threshold: f64,
    pub second_rate: f64,
}

/// Year- and province-specific snapshot derived from the canonical tables.
/// Recomputed fresh each simulated year; the canonical tables are never
/// mutated.
#[derive(Clone, Debug)]
pub struct TaxParameters {
    pub year: i32,
    pub province: Province,
    pub federal_brackets: Vec<TaxBracket>,
    pub provincial_brackets: Vec<TaxBracket>,
    pub federal_bpa: f64,
    pub provincial_bpa: f64,
    pub federal_age_amount: f64,
    pub federal_age_threshold: f64,
    pub provincial_age_amount: f64,
    pub provincial_age_threshold: f64,
    pub federal_pension_cap: f64,
    pub provincial_pension_cap: f64,
    pub oas_clawback_threshold: f64,
    pub oas_annual_amount: f64,
    pub federal_dividend_credit: f64,
    pub provincial_dividend_credit: f64,
    pub surtax: Option<SurtaxParams>,
    pub federal_abatement: f64,
}

pub fn tax_parameters(year: i32, inflation_rate: f64, province: Province) -> TaxParameters {
    let factor = (1.0 + inflation_rate).powi(year - BASE_YEAR);
    let table = province_table(province);

    let federal_brackets = FEDERAL_BRACKETS
        .iter()
        .enumerate()
        .map(|(i, (upper, rate))| TaxBracket {
            upper: upper * factor,
            rate: if i == 0 && year > BASE_YEAR {
                FIRST_FEDERAL_RATE_AFTER_BASE
            } else {
                *rate
            },
        })
        .collect();
    let provincial_brackets = table
        .brackets
        .iter()
        .map(|(upper, rate)| TaxBracket {
            upper: upper * factor,
            rate: *rate,
        })
        .collect();

    TaxParameters {
        year,
        province,
        federal_brackets,
        provincial_brackets,
        federal_bpa: FEDERAL_BPA * factor,
        provincial_bpa: table.bpa * factor,
        federal_age_amount: FEDERAL_AGE_AMOUNT * factor,
        federal_age_threshold: FEDERAL_AGE_THRESHOLD * factor,
        provincial_age_amount: table.age_amount * factor,
        provincial_age_threshold: table.age_threshold * factor,
        federal_pension_cap: FEDERAL_PENSION_CAP * factor,
        provincial_pension_cap: table.pension_cap * factor,
        oas_clawback_threshold: OAS_CLAWBACK_THRESHOLD * factor,
        oas_annual_amount: OAS_ANNUAL_AMOUNT * factor,
        federal_dividend_credit: FEDERAL_DIVIDEND_CREDIT,
        provincial_dividend_credit: table.dividend_credit,
        surtax: table.surtax.map(|s| SurtaxParams {
            first_threshold: s.first_threshold * factor,
            first_rate: s.first_rate,
            second_threshold: s.second_threshold * factor,
            second_rate: s.second_rate,
        }),
        federal_abatement: table.federal_abatement,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketSlice {
    pub from: f64,
    pub to: f64,
    pub rate: f64,
    pub taxable_amount: f64,
    pub tax: f64,
}

/// Progressive tax over ascending, upper-inclusive bracket boundaries.
pub fn bracket_tax(income: f64, brackets: &[TaxBracket]) -> (f64, Vec<BracketSlice>) {
    let income = income.max(0.0);
    let mut total = 0.0;
    let mut slices = Vec::new();
    let mut lower = 0.0;

    for bracket in brackets {
        if income <= lower {
            break;
        }
        let taxable = income.min(bracket.upper) - lower;
        let tax = taxable * bracket.rate;
        total += tax;
        slices.push(BracketSlice {
            from: lower,
            to: bracket.upper,
            rate: bracket.rate,
            taxable_amount: taxable,
            tax,
        });
        lower = bracket.upper;
    }

    (total, slices)
}

fn marginal_rate_at(income: f64, brackets: &[TaxBracket]) -> f64 {
    for bracket in brackets {
        if income <= bracket.upper {
            return bracket.rate;
        }
    }
    brackets.last().map(|b| b.rate).unwrap_or(0.0)
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncomeBreakdown {
    pub other_income: f64,
    /// Deferred-account withdrawals, pension-credit eligible at 65+.
    pub rrsp_withdrawal: f64,
    /// Eligible Canadian dividends before gross-up.
    pub canadian_dividend: f64,
    /// Realized capital gains already reduced to the taxable inclusion.
    pub capital_gains: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxAssessment {
    pub taxable_income: f64,
    pub federal_tax: f64,
    pub provincial_tax: f64,
    pub total_tax: f64,
    pub oas_clawback: f64,
    /// Tax plus any OAS recovery; the figure the simulation owes.
    pub total_payable: f64,
    pub marginal_rate: f64,
    pub dividend_gross_up: f64,
    pub federal_credits: f64,
    pub provincial_credits: f64,
    pub federal_slices: Vec<BracketSlice>,
    pub provincial_slices: Vec<BracketSlice>,
}

fn age_credit(age: u32, net_income: f64, amount: f64, threshold: f64) -> f64 {
    if age < 65 {
        return 0.0;
    }
    let reduction = AGE_CREDIT_PHASE_OUT * (net_income - threshold).max(0.0);
    (amount - reduction).max(0.0)
}

fn pension_credit(age: u32, rrsp_withdrawal: f64, cap: f64) -> f64 {
    if age < 65 {
        return 0.0;
    }
    rrsp_withdrawal.max(0.0).min(cap)
}

pub fn calculate_tax(income: &IncomeBreakdown, age: u32, params: &TaxParameters) -> TaxAssessment {
    let grossed_dividend = income.canadian_dividend.max(0.0) * DIVIDEND_GROSS_UP;
    let taxable_income = income.other_income.max(0.0)
        + income.rrsp_withdrawal.max(0.0)
        + grossed_dividend
        + income.capital_gains.max(0.0);

    let (federal_gross, federal_slices) = bracket_tax(taxable_income, &params.federal_brackets);
    let federal_rate0 = params.federal_brackets[0].rate;
    let federal_credit_base = params.federal_bpa
        + age_credit(
            age,
            taxable_income,
            params.federal_age_amount,
            params.federal_age_threshold,
        )
        + pension_credit(age, income.rrsp_withdrawal, params.federal_pension_cap);
    let federal_credits =
        federal_credit_base * federal_rate0 + grossed_dividend * params.federal_dividend_credit;
    let federal_tax =
        (federal_gross - federal_credits).max(0.0) * (1.0 - params.federal_abatement);

    let (provincial_gross, provincial_slices) =
        bracket_tax(taxable_income, &params.provincial_brackets);
    let provincial_rate0 = params.provincial_brackets[0].rate;
    let provincial_credit_base = params.provincial_bpa
        + age_credit(
            age,
            taxable_income,
            params.provincial_age_amount,
            params.provincial_age_threshold,
        )
        + pension_credit(age, income.rrsp_withdrawal, params.provincial_pension_cap);
    let provincial_credits = provincial_credit_base * provincial_rate0
        + grossed_dividend * params.provincial_dividend_credit;
    let provincial_base = (provincial_gross - provincial_credits).max(0.0);
    let provincial_tax = provincial_base + surtax_on(provincial_base, params.surtax.as_ref());

    let federal_marginal =
        marginal_rate_at(taxable_income, &params.federal_brackets) * (1.0 - params.federal_abatement);
    let provincial_marginal = marginal_rate_at(taxable_income, &params.provincial_brackets)
        * surtax_factor(provincial_base, params.surtax.as_ref());
    let total_tax = federal_tax + provincial_tax;

    TaxAssessment {
        taxable_income,
        federal_tax,
        provincial_tax,
        total_tax,
        oas_clawback: 0.0,
        total_payable: total_tax,
        marginal_rate: federal_marginal + provincial_marginal,
        dividend_gross_up: grossed_dividend,
        federal_credits,
        provincial_credits,
        federal_slices,
        provincial_slices,
    }
}

fn surtax_on(provincial_base: f64, surtax: Option<&SurtaxParams>) -> f64 {
    let Some(s) = surtax else {
        return 0.0;
    };
    s.first_rate * (provincial_base - s.first_threshold).max(0.0)
        + s.second_rate * (provincial_base - s.second_threshold).max(0.0)
}

fn surtax_factor(provincial_base: f64, surtax: Option<&SurtaxParams>) -> f64 {
    let Some(s) = surtax else {
        return 1.0;
    };
    if provincial_base > s.second_threshold {
        1.0 + s.first_rate + s.second_rate
    } else if provincial_base > s.first_threshold {
        1.0 + s.first_rate
    } else {
        1.0
    }
}

/// Adds the Old-Age-Security recovery tax: 15% of taxable income above the
/// clawback threshold, capped at the OAS amount actually received. The
/// clawback is added to other income and tax is recomputed once.
pub fn calculate_tax_with_clawback(
    income: &IncomeBreakdown,
    age: u32,
    params: &TaxParameters,
    oas_income: f64,
) -> TaxAssessment {
    let base = calculate_tax(income, age, params);
    let cap = oas_income.max(0.0).min(params.oas_annual_amount);
    let clawback = (OAS_CLAWBACK_RATE * (base.taxable_income - params.oas_clawback_threshold))
        .clamp(0.0, cap);
    if clawback <= 0.0 {
        return base;
    }

    let adjusted = IncomeBreakdown {
        other_income: income.other_income + clawback,
        ..*income
    };
    let mut out = calculate_tax(&adjusted, age, params);
    out.oas_clawback = clawback;
    out.total_payable = out.total_tax + clawback;
    out
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpouseIncome {
    pub income: IncomeBreakdown,
    pub age: u32,
    #[serde(default)]
    pub oas_income: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JointTaxResult {
    pub split_ratio: f64,
    pub combined_tax: f64,
    pub baseline_tax: f64,
    pub primary: TaxAssessment,
    pub spouse: Option<TaxAssessment>,
}

fn assess_couple(
    primary: &SpouseIncome,
    spouse: &SpouseIncome,
    ratio: f64,
    params: &TaxParameters,
) -> (TaxAssessment, TaxAssessment) {
    let moved = primary.income.rrsp_withdrawal.max(0.0) * ratio;
    let primary_income = IncomeBreakdown {
        rrsp_withdrawal: primary.income.rrsp_withdrawal - moved,
        ..primary.income
    };
    let spouse_income = IncomeBreakdown {
        rrsp_withdrawal: spouse.income.rrsp_withdrawal + moved,
        ..spouse.income
    };
    (
        calculate_tax_with_clawback(&primary_income, primary.age, params, primary.oas_income),
        calculate_tax_with_clawback(&spouse_income, spouse.age, params, spouse.oas_income),
    )
}

/// Searches pension-income split ratios from 0% to 50% in 5-point steps,
/// moving deferred-account income from the primary to the spouse, and keeps
/// the ratio minimizing combined tax. Singles and primaries under 65 keep
/// the ratio at 0%.
pub fn optimize_joint_tax(
    primary: &SpouseIncome,
    spouse: Option<&SpouseIncome>,
    params: &TaxParameters,
) -> JointTaxResult {
    let Some(spouse) = spouse else {
        let assessment =
            calculate_tax_with_clawback(&primary.income, primary.age, params, primary.oas_income);
        return JointTaxResult {
            split_ratio: 0.0,
            combined_tax: assessment.total_payable,
            baseline_tax: assessment.total_payable,
            primary: assessment,
            spouse: None,
        };
    };

    let (baseline_primary, baseline_spouse) = assess_couple(primary, spouse, 0.0, params);
    let baseline_tax = baseline_primary.total_payable + baseline_spouse.total_payable;

    let mut best_ratio = 0.0;
    let mut best = (baseline_primary, baseline_spouse);
    let mut best_tax = baseline_tax;

    if primary.age >= 65 {
        for step in 1..=10 {
            let ratio = step as f64 * 0.05;
            let (p, s) = assess_couple(primary, spouse, ratio, params);
            let combined = p.total_payable + s.total_payable;
            if combined < best_tax {
                best_tax = combined;
                best_ratio = ratio;
                best = (p, s);
            }
        }
    }

    JointTaxResult {
        split_ratio: best_ratio,
        combined_tax: best_tax,
        baseline_tax,
        primary: best.0,
        spouse: Some(best.1),
    }
}
