use std::collections::BTreeMap;

use super::types::{
    AccountKind, AccountState, AssetClass, AssetMap, AssetProfile, Scenario, YieldKind,
};

/// Per-run mutable holdings across the three accounts plus the checking
/// balance and rolling TFSA room. Deep-copied from the scenario at run start;
/// discarded at run end.
#[derive(Clone, Debug)]
pub struct Ledger {
    pub rrsp: AccountState,
    pub tfsa: AccountState,
    pub non_registered: AccountState,
    pub checking: f64,
    pub tfsa_room: f64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct WithdrawalOutcome {
    pub withdrawn: f64,
    pub realized_gain: f64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct YieldOutcome {
    pub dividend_cash: f64,
    pub interest_cash: f64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RebalanceOutcome {
    pub sold: f64,
    pub realized_gain: f64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ContributionOutcome {
    pub to_tfsa: f64,
    pub to_non_registered: f64,
}

impl Ledger {
    pub fn from_scenario(scenario: &Scenario) -> Self {
        Self {
            rrsp: AccountState::from_setup(&scenario.rrsp),
            tfsa: AccountState::from_setup(&scenario.tfsa),
            non_registered: AccountState::from_setup(&scenario.non_registered),
            checking: scenario.checking_start,
            tfsa_room: scenario.expert.tfsa_room_start,
        }
    }

    pub fn account(&self, kind: AccountKind) -> &AccountState {
        match kind {
            AccountKind::Rrsp => &self.rrsp,
            AccountKind::Tfsa => &self.tfsa,
            AccountKind::NonRegistered => &self.non_registered,
        }
    }

    fn account_mut(&mut self, kind: AccountKind) -> &mut AccountState {
        match kind {
            AccountKind::Rrsp => &mut self.rrsp,
            AccountKind::Tfsa => &mut self.tfsa,
            AccountKind::NonRegistered => &mut self.non_registered,
        }
    }

    pub fn invested_total(&self) -> f64 {
        self.rrsp.total() + self.tfsa.total() + self.non_registered.total()
    }

    pub fn total(&self) -> f64 {
        self.invested_total() + self.checking
    }

    /// Sells `amount` out of the account, reducing every holding
    /// proportionally to its share of the account total. The taxable account
    /// realizes capital gains on the unrealized-gain fraction and reduces
    /// ACB by the same proportion.
    pub fn withdraw(&mut self, kind: AccountKind, amount: f64) -> WithdrawalOutcome {
        let track_gains = kind == AccountKind::NonRegistered;
        withdraw_proportional(self.account_mut(kind), amount, track_gains)
    }

    /// Applies one year of yield and appreciation. Registered accounts
    /// reinvest yield into the paying asset; the taxable account pays yield
    /// out as cash, classified by the asset's yield kind.
    pub fn grow(
        &mut self,
        kind: AccountKind,
        profiles: &BTreeMap<AssetClass, AssetProfile>,
        returns: &AssetMap,
    ) -> YieldOutcome {
        let reinvest = kind != AccountKind::NonRegistered;
        grow_account(self.account_mut(kind), profiles, returns, reinvest)
    }

    pub fn rebalance(&mut self, kind: AccountKind, target: &AssetMap, band: f64) -> RebalanceOutcome {
        let track_gains = kind == AccountKind::NonRegistered;
        rebalance_account(self.account_mut(kind), target, band, track_gains)
    }

    /// Invests surplus cash: TFSA first, bounded by remaining room, then the
    /// taxable account (which gains ACB for the amount invested). Both legs
    /// are split by the current target composition. The caller adjusts the
    /// checking balance.
    pub fn contribute_surplus(&mut self, amount: f64, target: &AssetMap) -> ContributionOutcome {
        if amount <= 0.0 {
            return ContributionOutcome::default();
        }
        let to_tfsa = amount.min(self.tfsa_room.max(0.0));
        if to_tfsa > 0.0 {
            self.tfsa_room -= to_tfsa;
            buy_into(&mut self.tfsa, to_tfsa, target, false);
        }
        let to_non_registered = amount - to_tfsa;
        if to_non_registered > 0.0 {
            buy_into(&mut self.non_registered, to_non_registered, target, true);
        }
        ContributionOutcome {
            to_tfsa,
            to_non_registered,
        }
    }
}

/// Fraction of the account's value that is unrealized gain; zero when the
/// account is empty or ACB covers the full value.
pub fn unrealized_gain_fraction(state: &AccountState) -> f64 {
    let total = state.total();
    if total <= 0.0 {
        return 0.0;
    }
    ((total - state.total_acb()) / total).max(0.0)
}

fn withdraw_proportional(
    state: &mut AccountState,
    amount: f64,
    track_gains: bool,
) -> WithdrawalOutcome {
    let total = state.total();
    if total <= 0.0 || amount <= 0.0 {
        return WithdrawalOutcome::default();
    }

    let withdrawn = amount.min(total);
    let fraction = withdrawn / total;
    let mut realized_gain = 0.0;

    if track_gains {
        realized_gain = withdrawn * unrealized_gain_fraction(state);
        for acb in state.acb.values_mut() {
            *acb = (*acb * (1.0 - fraction)).max(0.0);
        }
    }
    for holding in state.holdings.values_mut() {
        *holding = (*holding * (1.0 - fraction)).max(0.0);
    }

    WithdrawalOutcome {
        withdrawn,
        realized_gain,
    }
}

fn grow_account(
    state: &mut AccountState,
    profiles: &BTreeMap<AssetClass, AssetProfile>,
    returns: &AssetMap,
    reinvest: bool,
) -> YieldOutcome {
    let mut out = YieldOutcome::default();

    for (asset, holding) in state.holdings.iter_mut() {
        let Some(profile) = profiles.get(asset) else {
            continue;
        };
        let rate = returns.get(asset).copied().unwrap_or(profile.expected_return);
        let income = *holding * profile.yield_rate.max(0.0);
        *holding = (*holding * (1.0 + rate)).max(0.0);
        if reinvest {
            *holding += income;
        } else {
            match profile.yield_kind {
                YieldKind::EligibleDividend => out.dividend_cash += income,
                YieldKind::Interest => out.interest_cash += income,
            }
        }
    }

    out
}

fn rebalance_account(
    state: &mut AccountState,
    target: &AssetMap,
    band: f64,
    track_gains: bool,
) -> RebalanceOutcome {
    let total = state.total();
    if total <= 0.0 {
        return RebalanceOutcome::default();
    }

    // Pass 1: sell overweight assets down to their target value.
    let mut sales: Vec<(AssetClass, f64)> = Vec::new();
    for (asset, holding) in &state.holdings {
        let weight = holding / total;
        let target_weight = target.get(asset).copied().unwrap_or(0.0);
        if weight - target_weight > band {
            let sale = holding - target_weight * total;
            if sale > 0.0 {
                sales.push((*asset, sale));
            }
        }
    }
    if sales.is_empty() {
        return RebalanceOutcome::default();
    }

    let mut proceeds = 0.0;
    let mut realized_gain = 0.0;
    for (asset, sale) in &sales {
        let holding_before = state.holdings.get(asset).copied().unwrap_or(0.0);
        if holding_before <= 0.0 {
            continue;
        }
        if track_gains {
            let acb_before = state.acb.get(asset).copied().unwrap_or(0.0);
            let gain_fraction = ((holding_before - acb_before) / holding_before).max(0.0);
            realized_gain += sale * gain_fraction;
            if let Some(acb) = state.acb.get_mut(asset) {
                *acb = (*acb * (1.0 - sale / holding_before)).max(0.0);
            }
        }
        if let Some(holding) = state.holdings.get_mut(asset) {
            *holding -= sale;
        }
        proceeds += sale;
    }

    // Pass 2: reinvest proceeds in underweight assets, pro-rata to their
    // shortfall versus target. No external cash enters the account.
    let mut shortfalls: Vec<(AssetClass, f64)> = Vec::new();
    let mut shortfall_total = 0.0;
    for (asset, target_weight) in target {
        let holding = state.holdings.get(asset).copied().unwrap_or(0.0);
        let gap = target_weight * total - holding;
        if gap > 0.0 {
            shortfalls.push((*asset, gap));
            shortfall_total += gap;
        }
    }
    if shortfall_total > 0.0 {
        for (asset, gap) in shortfalls {
            let buy = proceeds * gap / shortfall_total;
            *state.holdings.entry(asset).or_insert(0.0) += buy;
            if track_gains {
                *state.acb.entry(asset).or_insert(0.0) += buy;
            }
        }
    }

    RebalanceOutcome {
        sold: proceeds,
        realized_gain,
    }
}

fn buy_into(state: &mut AccountState, amount: f64, target: &AssetMap, track_acb: bool) {
    let weight_sum: f64 = target.values().sum();
    if amount <= 0.0 || weight_sum <= 0.0 {
        return;
    }
    for (asset, weight) in target {
        let buy = amount * weight / weight_sum;
        if buy <= 0.0 {
            continue;
        }
        *state.holdings.entry(*asset).or_insert(0.0) += buy;
        if track_acb {
            *state.acb.entry(*asset).or_insert(0.0) += buy;
        }
    }
}
