use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tax::TaxAssessment;

/// Map of asset class to a dollar amount or a portfolio weight, depending on
/// context. BTreeMap keeps iteration order stable so repeated runs on the
/// same scenario produce byte-identical records.
pub type AssetMap = BTreeMap<AssetClass, f64>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Province {
    Ontario,
    Quebec,
    BritishColumbia,
    Alberta,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetClass {
    CanadianEquity,
    GlobalEquity,
    Bonds,
    Cash,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountKind {
    Rrsp,
    Tfsa,
    NonRegistered,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum YieldKind {
    EligibleDividend,
    Interest,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowKind {
    Income,
    Expense,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EventTaxTreatment {
    #[default]
    NonTaxable,
    OrdinaryIncome,
    CapitalGain,
}

/// Per-asset-class market assumptions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetProfile {
    pub expected_return: f64,
    pub yield_rate: f64,
    pub yield_kind: YieldKind,
    pub volatility: f64,
}

fn default_true() -> bool {
    true
}

/// A recurring income or expense stream. `annual_amount` is the value in the
/// item's own `start_year`; it compounds at `growth_rate` from that year.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecurringItem {
    pub label: String,
    pub kind: FlowKind,
    pub annual_amount: f64,
    pub start_year: i32,
    pub end_year: i32,
    #[serde(default)]
    pub growth_rate: f64,
    /// Income subject to OAS clawback recovery (the OAS benefit itself).
    #[serde(default)]
    pub oas: bool,
    #[serde(default = "default_true")]
    pub taxable: bool,
}

impl RecurringItem {
    pub fn amount_in(&self, year: i32) -> f64 {
        if year < self.start_year || year > self.end_year {
            return 0.0;
        }
        let elapsed = year - self.start_year;
        self.annual_amount.max(0.0) * (1.0 + self.growth_rate).powi(elapsed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimeEvent {
    pub label: String,
    pub year: i32,
    pub amount: f64,
    pub kind: FlowKind,
    #[serde(default)]
    pub tax_treatment: EventTaxTreatment,
    /// Cost base for `capital-gain` events; ignored otherwise.
    #[serde(default)]
    pub acb: f64,
}

/// A scripted peak-to-trough market decline spread over a window of years.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CrashWindow {
    pub start_year: i32,
    pub duration_years: u32,
    pub total_drop: f64,
}

impl CrashWindow {
    pub fn contains(&self, year: i32) -> bool {
        let span = self.duration_years.max(1) as i32;
        year >= self.start_year && year < self.start_year + span
    }

    /// Constant annual rate reproducing the total drop over the window.
    pub fn annual_rate(&self) -> f64 {
        let duration = self.duration_years.max(1) as f64;
        (1.0 - self.total_drop.clamp(0.0, 1.0)).powf(1.0 / duration) - 1.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub runs: u32,
    pub base_seed: u64,
    pub volatility_scale: f64,
    pub crashes: Vec<CrashWindow>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            runs: 500,
            base_seed: 1,
            volatility_scale: 1.0,
            crashes: Vec::new(),
        }
    }
}

/// Start/end target portfolio weights, linearly interpolated over the plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlidePath {
    pub start_weights: AssetMap,
    pub end_weights: AssetMap,
}

impl GlidePath {
    /// Target weights at `progress` in [0, 1] through the plan horizon.
    pub fn weights_at(&self, progress: f64) -> AssetMap {
        let t = progress.clamp(0.0, 1.0);
        let mut out = AssetMap::new();
        for asset in self.start_weights.keys().chain(self.end_weights.keys()) {
            let start = self.start_weights.get(asset).copied().unwrap_or(0.0);
            let end = self.end_weights.get(asset).copied().unwrap_or(0.0);
            out.insert(*asset, start + (end - start) * t);
        }
        out
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSetup {
    pub holdings: AssetMap,
    /// Adjusted cost base per asset; meaningful for the taxable account only.
    pub acb: AssetMap,
    /// Explicit end composition overriding the glide path for this account.
    pub end_weights: Option<AssetMap>,
}

impl AccountSetup {
    pub fn total(&self) -> f64 {
        self.holdings.values().sum()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpertParams {
    pub inflation_rate: f64,
    pub tfsa_room_start: f64,
    /// Annual TFSA limit in the scenario start year, indexed thereafter.
    pub tfsa_annual_limit: f64,
    pub checking_max: f64,
    /// Rebalance trigger band as a weight fraction (0.05 = 5 points).
    pub rebalance_band: f64,
    pub rrsp_strategic_bonus: f64,
    pub tfsa_withdrawal_penalty: f64,
    pub lookahead_years: u32,
}

impl Default for ExpertParams {
    fn default() -> Self {
        Self {
            inflation_rate: 0.021,
            tfsa_room_start: 0.0,
            tfsa_annual_limit: 7_000.0,
            checking_max: 20_000.0,
            rebalance_band: 0.05,
            rrsp_strategic_bonus: 0.0,
            tfsa_withdrawal_penalty: 0.30,
            lookahead_years: 7,
        }
    }
}

/// Immutable input snapshot for a projection. Validated once before any
/// simulated year executes; the engine never mutates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub start_year: i32,
    pub end_year: i32,
    pub birth_year: i32,
    pub province: Province,
    #[serde(default)]
    pub rrsp: AccountSetup,
    #[serde(default)]
    pub tfsa: AccountSetup,
    #[serde(default)]
    pub non_registered: AccountSetup,
    #[serde(default)]
    pub checking_start: f64,
    pub asset_profiles: BTreeMap<AssetClass, AssetProfile>,
    #[serde(default)]
    pub recurring: Vec<RecurringItem>,
    #[serde(default)]
    pub events: Vec<OneTimeEvent>,
    pub glide_path: GlidePath,
    #[serde(default)]
    pub expert: ExpertParams,
    #[serde(default)]
    pub monte_carlo: MonteCarloConfig,
}

impl Scenario {
    pub fn age_in(&self, year: i32) -> u32 {
        (year - self.birth_year).max(0) as u32
    }

    pub fn total_initial_assets(&self) -> f64 {
        self.rrsp.total() + self.tfsa.total() + self.non_registered.total() + self.checking_start
    }

    pub fn plan_years(&self) -> u32 {
        (self.end_year - self.start_year).max(0) as u32
    }

    /// Glide progress for `year` in [0, 1].
    pub fn glide_progress(&self, year: i32) -> f64 {
        let span = self.plan_years();
        if span == 0 {
            return 1.0;
        }
        ((year - self.start_year) as f64 / span as f64).clamp(0.0, 1.0)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.end_year < self.start_year {
            return Err(EngineError::invalid(
                "end_year",
                format!("{} precedes start_year {}", self.end_year, self.start_year),
            ));
        }
        if self.birth_year >= self.start_year {
            return Err(EngineError::invalid(
                "birth_year",
                format!(
                    "{} must precede start_year {}",
                    self.birth_year, self.start_year
                ),
            ));
        }
        if self.asset_profiles.is_empty() {
            return Err(EngineError::invalid(
                "asset_profiles",
                "no asset profiles defined",
            ));
        }
        for (name, setup) in [
            ("rrsp", &self.rrsp),
            ("tfsa", &self.tfsa),
            ("non_registered", &self.non_registered),
        ] {
            for (asset, amount) in &setup.holdings {
                if !amount.is_finite() || *amount < 0.0 {
                    return Err(EngineError::invalid(
                        "holdings",
                        format!("{name} holds {amount} of {asset:?}"),
                    ));
                }
                if !self.asset_profiles.contains_key(asset) {
                    return Err(EngineError::invalid(
                        "asset_profiles",
                        format!("{name} holds {asset:?} with no profile"),
                    ));
                }
            }
        }
        if !self.checking_start.is_finite() || self.checking_start < 0.0 {
            return Err(EngineError::invalid(
                "checking_start",
                format!("{} must be finite and non-negative", self.checking_start),
            ));
        }
        for item in &self.recurring {
            if item.end_year < item.start_year {
                return Err(EngineError::invalid(
                    "recurring",
                    format!("item '{}' ends before it starts", item.label),
                ));
            }
            if !item.annual_amount.is_finite() || item.annual_amount < 0.0 {
                return Err(EngineError::invalid(
                    "recurring",
                    format!("item '{}' has amount {}", item.label, item.annual_amount),
                ));
            }
        }
        for event in &self.events {
            if !event.amount.is_finite() || event.amount < 0.0 {
                return Err(EngineError::invalid(
                    "events",
                    format!("event '{}' has amount {}", event.label, event.amount),
                ));
            }
        }
        let start_sum: f64 = self.glide_path.start_weights.values().sum();
        if (start_sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::invalid(
                "glide_path",
                format!("start weights sum to {start_sum}, expected 1"),
            ));
        }
        let end_sum: f64 = self.glide_path.end_weights.values().sum();
        if (end_sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::invalid(
                "glide_path",
                format!("end weights sum to {end_sum}, expected 1"),
            ));
        }
        if self.monte_carlo.runs == 0 {
            return Err(EngineError::invalid("monte_carlo.runs", "must be at least 1"));
        }
        Ok(())
    }
}

/// Mutable per-run holdings and cost base for one account.
#[derive(Clone, Debug, Default)]
pub struct AccountState {
    pub holdings: AssetMap,
    pub acb: AssetMap,
}

impl AccountState {
    pub fn from_setup(setup: &AccountSetup) -> Self {
        Self {
            holdings: setup.holdings.clone(),
            acb: setup.acb.clone(),
        }
    }

    pub fn total(&self) -> f64 {
        self.holdings.values().sum()
    }

    pub fn total_acb(&self) -> f64 {
        self.acb.values().sum()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Success,
    Depleted,
    NoInitialFunds,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalSet {
    pub rrsp: f64,
    pub tfsa: f64,
    pub non_registered: f64,
}

impl WithdrawalSet {
    pub fn total(&self) -> f64 {
        self.rrsp + self.tfsa + self.non_registered
    }
}

/// One simulated year, recorded once and never revised.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearlyRecord {
    pub year: i32,
    pub age: u32,
    pub start_total: f64,
    pub end_total: f64,
    pub start_checking: f64,
    pub end_checking: f64,
    pub income_received: f64,
    pub expenses_paid: f64,
    pub rrif_minimum: f64,
    pub withdrawals: WithdrawalSet,
    pub dividend_income: f64,
    pub interest_income: f64,
    pub realized_gains: f64,
    pub tax: TaxAssessment,
    pub tax_payable_next_year: f64,
    pub decisions: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub status: SimulationStatus,
    pub yearly_records: Vec<YearlyRecord>,
    pub depletion_year: Option<i32>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub final_balances: Vec<f64>,
    pub depletion_years: Vec<Option<i32>>,
    pub success_count: u32,
    pub simulation_paths: Vec<Vec<f64>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed_runs: u32,
    pub total_runs: u32,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid scenario: {field}: {reason}")]
    InvalidScenario { field: &'static str, reason: String },

    #[error("run {run_index} failed: {message}")]
    RunFailed { run_index: u32, message: String },
}

impl EngineError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidScenario {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn base_scenario() -> Scenario {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            AssetClass::GlobalEquity,
            AssetProfile {
                expected_return: 0.06,
                yield_rate: 0.02,
                yield_kind: YieldKind::EligibleDividend,
                volatility: 0.15,
            },
        );
        profiles.insert(
            AssetClass::Bonds,
            AssetProfile {
                expected_return: 0.03,
                yield_rate: 0.03,
                yield_kind: YieldKind::Interest,
                volatility: 0.05,
            },
        );
        let mut start_weights = AssetMap::new();
        start_weights.insert(AssetClass::GlobalEquity, 0.7);
        start_weights.insert(AssetClass::Bonds, 0.3);
        let mut end_weights = AssetMap::new();
        end_weights.insert(AssetClass::GlobalEquity, 0.4);
        end_weights.insert(AssetClass::Bonds, 0.6);

        Scenario {
            start_year: 2025,
            end_year: 2055,
            birth_year: 1960,
            province: Province::Ontario,
            rrsp: AccountSetup::default(),
            tfsa: AccountSetup::default(),
            non_registered: AccountSetup::default(),
            checking_start: 10_000.0,
            asset_profiles: profiles,
            recurring: Vec::new(),
            events: Vec::new(),
            glide_path: GlidePath {
                start_weights,
                end_weights,
            },
            expert: ExpertParams::default(),
            monte_carlo: MonteCarloConfig::default(),
        }
    }

    #[test]
    fn valid_scenario_passes() {
        assert!(base_scenario().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_years() {
        let mut scenario = base_scenario();
        scenario.end_year = scenario.start_year - 1;
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn rejects_birth_year_after_start() {
        let mut scenario = base_scenario();
        scenario.birth_year = scenario.start_year;
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn rejects_negative_holdings() {
        let mut scenario = base_scenario();
        scenario
            .rrsp
            .holdings
            .insert(AssetClass::GlobalEquity, -5.0);
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn rejects_zero_monte_carlo_runs() {
        let mut scenario = base_scenario();
        scenario.monte_carlo.runs = 0;
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn recurring_item_compounds_from_its_own_start_year() {
        let item = RecurringItem {
            label: "pension".into(),
            kind: FlowKind::Income,
            annual_amount: 10_000.0,
            start_year: 2030,
            end_year: 2040,
            growth_rate: 0.02,
            oas: false,
            taxable: true,
        };
        assert_eq!(item.amount_in(2029), 0.0);
        assert_eq!(item.amount_in(2030), 10_000.0);
        let expected = 10_000.0 * 1.02_f64.powi(3);
        assert!((item.amount_in(2033) - expected).abs() < 1e-9);
        assert_eq!(item.amount_in(2041), 0.0);
    }

    #[test]
    fn glide_path_interpolates_linearly() {
        let scenario = base_scenario();
        let mid = scenario.glide_path.weights_at(0.5);
        assert!((mid[&AssetClass::GlobalEquity] - 0.55).abs() < 1e-12);
        assert!((mid[&AssetClass::Bonds] - 0.45).abs() < 1e-12);
    }

    #[test]
    fn crash_window_annual_rate_compounds_to_total_drop() {
        let crash = CrashWindow {
            start_year: 2030,
            duration_years: 3,
            total_drop: 0.30,
        };
        let rate = crash.annual_rate();
        let compounded = (1.0 + rate).powi(3);
        assert!((compounded - 0.70).abs() < 1e-12);
        assert!(crash.contains(2030));
        assert!(crash.contains(2032));
        assert!(!crash.contains(2033));
    }
}
