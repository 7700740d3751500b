//! Additive post-base boosts.
//!
//! Each boost is a pure function of exactly one signal family:
//! `&FamilyView → BoostTerm`. Families are separate read-only structs, so a
//! boost cannot see (let alone rewrite) another family's inputs or labels.
//! In particular the line-variance family derives its own strength label and
//! has no path to the money-flow label.

use serde::{Deserialize, Serialize};

/// Fixed set of boost terms, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostKind {
    SharpMoney,
    LineValue,
    Simulation,
    Availability,
}

impl BoostKind {
    pub fn all() -> [BoostKind; 4] {
        [
            BoostKind::SharpMoney,
            BoostKind::LineValue,
            BoostKind::Simulation,
            BoostKind::Availability,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BoostKind::SharpMoney => "sharp_money",
            BoostKind::LineValue => "line_value",
            BoostKind::Simulation => "simulation",
            BoostKind::Availability => "availability",
        }
    }

    /// Individual (min, max) for this term. Simulation is asymmetric and
    /// availability can only subtract.
    pub fn range(&self) -> (f64, f64) {
        match self {
            BoostKind::SharpMoney => (0.0, 1.0),
            BoostKind::LineValue => (0.0, 0.5),
            BoostKind::Simulation => (-0.5, 1.5),
            BoostKind::Availability => (-1.0, 0.0),
        }
    }

    pub fn cap(&self, raw: f64) -> f64 {
        if !raw.is_finite() {
            return 0.0;
        }
        let (lo, hi) = self.range();
        raw.clamp(lo, hi)
    }
}

/// Strength label shared by the flow and line families. Each family owns its
/// own instance; they are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strength {
    None,
    Moderate,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoostStatus {
    /// Family supplied, term computed from live data.
    Live,
    /// Family absent; term is zero.
    Absent,
}

/// Money split on the recommended side: share of handle vs share of tickets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoneyFlowView {
    pub money_pct: f64,
    pub ticket_pct: f64,
}

/// Line movement since open, in points, toward the recommended side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineVarianceView {
    pub line_move: f64,
}

/// Simulated probability that the recommended outcome lands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationView {
    pub win_probability: f64,
}

/// Negative news impact on the recommended side, 0 (none) .. 1 (severe).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityView {
    pub impact: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalFamilies {
    #[serde(default)]
    pub money_flow: Option<MoneyFlowView>,
    #[serde(default)]
    pub line_variance: Option<LineVarianceView>,
    #[serde(default)]
    pub simulation: Option<SimulationView>,
    #[serde(default)]
    pub availability: Option<AvailabilityView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostTerm {
    pub kind: BoostKind,
    /// Value before the individual cap.
    pub raw: f64,
    /// Value after the individual cap; this is what gets summed.
    pub value: f64,
    pub status: BoostStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Strength>,
}

impl BoostTerm {
    fn live(kind: BoostKind, raw: f64, label: Option<Strength>) -> Self {
        Self {
            kind,
            raw,
            value: kind.cap(raw),
            status: BoostStatus::Live,
            label,
        }
    }

    fn absent(kind: BoostKind) -> Self {
        Self {
            kind,
            raw: 0.0,
            value: 0.0,
            status: BoostStatus::Absent,
            label: None,
        }
    }
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() { x } else { 0.0 }
}

pub fn flow_strength(view: &MoneyFlowView) -> Strength {
    let divergence = finite_or_zero(view.money_pct) - finite_or_zero(view.ticket_pct);
    if divergence >= 20.0 {
        Strength::Strong
    } else if divergence >= 10.0 {
        Strength::Moderate
    } else {
        Strength::None
    }
}

pub fn sharp_money_boost(view: &MoneyFlowView) -> BoostTerm {
    let label = flow_strength(view);
    let raw = match label {
        Strength::Strong => 1.0,
        Strength::Moderate => 0.5,
        Strength::None => 0.0,
    };
    BoostTerm::live(BoostKind::SharpMoney, raw, Some(label))
}

pub fn line_strength(view: &LineVarianceView) -> Strength {
    let moved = finite_or_zero(view.line_move);
    if moved >= 1.5 {
        Strength::Strong
    } else if moved >= 0.5 {
        Strength::Moderate
    } else {
        Strength::None
    }
}

pub fn line_value_boost(view: &LineVarianceView) -> BoostTerm {
    let raw = finite_or_zero(view.line_move).max(0.0) * 0.25;
    BoostTerm::live(BoostKind::LineValue, raw, Some(line_strength(view)))
}

pub fn simulation_boost(view: &SimulationView) -> BoostTerm {
    let p = finite_or_zero(view.win_probability).clamp(0.0, 1.0);
    BoostTerm::live(BoostKind::Simulation, (p - 0.5) * 5.0, None)
}

pub fn availability_boost(view: &AvailabilityView) -> BoostTerm {
    let impact = finite_or_zero(view.impact).clamp(0.0, 1.0);
    BoostTerm::live(BoostKind::Availability, -impact, None)
}

/// Evaluates every boost in [`BoostKind::all`] order.
pub fn compute_boosts(signals: &SignalFamilies) -> Vec<BoostTerm> {
    vec![
        signals
            .money_flow
            .as_ref()
            .map(sharp_money_boost)
            .unwrap_or_else(|| BoostTerm::absent(BoostKind::SharpMoney)),
        signals
            .line_variance
            .as_ref()
            .map(line_value_boost)
            .unwrap_or_else(|| BoostTerm::absent(BoostKind::LineValue)),
        signals
            .simulation
            .as_ref()
            .map(simulation_boost)
            .unwrap_or_else(|| BoostTerm::absent(BoostKind::Simulation)),
        signals
            .availability
            .as_ref()
            .map(availability_boost)
            .unwrap_or_else(|| BoostTerm::absent(BoostKind::Availability)),
    ]
}

/// `min(cap_total, Σ values)`. Only the upside is capped; penalties pass.
pub fn capped_total<I: IntoIterator<Item = f64>>(values: I, cap_total: f64) -> f64 {
    let sum: f64 = values.into_iter().map(finite_or_zero).sum();
    sum.min(cap_total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cap_bounds_stacking() {
        // Raw sum 8.3, cap 1.5
        let total = capped_total([1.5, 1.0, 1.5, 4.3], 1.5);
        assert_eq!(total, 1.5);
    }

    #[test]
    fn test_total_cap_passes_penalties() {
        let total = capped_total([0.2, -1.0], 1.5);
        assert!((total + 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_individual_caps() {
        assert_eq!(BoostKind::LineValue.cap(3.0), 0.5);
        assert_eq!(BoostKind::Simulation.cap(-4.0), -0.5);
        assert_eq!(BoostKind::Simulation.cap(4.0), 1.5);
        assert_eq!(BoostKind::Availability.cap(0.7), 0.0);
        assert_eq!(BoostKind::SharpMoney.cap(f64::NAN), 0.0);
    }

    #[test]
    fn test_line_movement_cannot_escalate_flow_label() {
        // Huge line move, no money divergence
        let signals = SignalFamilies {
            money_flow: Some(MoneyFlowView { money_pct: 52.0, ticket_pct: 50.0 }),
            line_variance: Some(LineVarianceView { line_move: 4.0 }),
            ..Default::default()
        };
        let terms = compute_boosts(&signals);
        let flow = terms.iter().find(|t| t.kind == BoostKind::SharpMoney).unwrap();
        let line = terms.iter().find(|t| t.kind == BoostKind::LineValue).unwrap();
        assert_eq!(flow.label, Some(Strength::None));
        assert_eq!(flow.value, 0.0);
        assert_eq!(line.label, Some(Strength::Strong));
        assert_eq!(line.value, 0.5);
    }

    #[test]
    fn test_absent_families_are_zero() {
        let terms = compute_boosts(&SignalFamilies::default());
        assert_eq!(terms.len(), 4);
        assert!(terms.iter().all(|t| t.value == 0.0 && t.status == BoostStatus::Absent));
    }

    #[test]
    fn test_simulation_asymmetric() {
        let strong = simulation_boost(&SimulationView { win_probability: 0.95 });
        assert_eq!(strong.value, 1.5);
        let weak = simulation_boost(&SimulationView { win_probability: 0.1 });
        assert_eq!(weak.value, -0.5);
        assert!((weak.raw + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_flow_strength_thresholds() {
        assert_eq!(flow_strength(&MoneyFlowView { money_pct: 70.0, ticket_pct: 50.0 }), Strength::Strong);
        assert_eq!(flow_strength(&MoneyFlowView { money_pct: 60.0, ticket_pct: 50.0 }), Strength::Moderate);
        assert_eq!(flow_strength(&MoneyFlowView { money_pct: 59.9, ticket_pct: 50.0 }), Strength::None);
    }
}
