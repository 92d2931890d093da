use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{SeverityConfig, TopologyConfig};
use crate::telemetry::frame::Frame;

/// How a contract compares expected and actual rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractType {
    /// Rank-sorted order must equal the expected order exactly.
    StrictOrder,
    /// Same check as `NeverBelow`.
    PartialOrder,
    /// No earlier-expected entity may rank below a later one, within `margin_or_n`.
    NeverBelow,
    /// The first expected entity must rank within the top `margin_or_n`.
    TopN,
}

impl ContractType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrictOrder => "STRICT_ORDER",
            Self::PartialOrder => "PARTIAL_ORDER",
            Self::NeverBelow => "NEVER_BELOW",
            Self::TopN => "TOP_N",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Tolerance {
    /// Consecutive violating frames ignored before an episode is recorded.
    #[serde(default)]
    pub frames: u32,
    /// Rank slack for ordering contracts, or N for `TOP_N`.
    #[serde(default)]
    pub margin_or_n: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActiveWhen {
    /// The contract only applies while this entity has a positive weight.
    pub requires_entity_present: String,
}

/// A declared expectation about the relative rank of some entities.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RankContract {
    pub id: String,
    #[serde(rename = "type")]
    pub contract_type: ContractType,
    /// Most prominent first.
    pub expected_order: Vec<String>,
    #[serde(default)]
    pub tolerance: Tolerance,
    #[serde(default)]
    pub active_when: Option<ActiveWhen>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    fn from_distance(distance: u32, cfg: &SeverityConfig) -> Self {
        if distance >= cfg.critical_distance {
            Self::Critical
        } else if distance >= cfg.major_distance {
            Self::Major
        } else {
            Self::Minor
        }
    }
}

/// One misplaced entity in a violating frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementSeverity {
    pub entity: String,
    pub rank: f64,
    pub distance: u32,
    pub severity: Severity,
}

/// A run of consecutive violating frames that outlasted the tolerance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    /// Frame where the streak first exceeded tolerance.
    pub frame_index: usize,
    pub timestamp: i64,
    pub last_frame_index: usize,
    /// Length of the whole violating streak, tolerated frames included.
    pub streak_frames: u32,
    pub expected_order: Vec<String>,
    pub actual_order: Vec<String>,
    pub elements: Vec<ElementSeverity>,
    /// Worst element severity seen during the episode.
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractReport {
    pub contract_id: String,
    pub contract_type: ContractType,
    pub evaluated_frames: usize,
    pub compliant_frames: usize,
    pub stability: f64,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyReport {
    pub contracts: Vec<ContractReport>,
    /// Compliant over evaluated frames across every contract.
    pub stability: f64,
}

impl TopologyReport {
    pub fn violations(&self) -> impl Iterator<Item = (&ContractReport, &Violation)> {
        self.contracts
            .iter()
            .flat_map(|c| c.violations.iter().map(move |v| (c, v)))
    }
}

/// Rank of every entity in `frame` that sampled one, taken from `rank.close`.
pub fn extract_rank_map(frame: &Frame) -> BTreeMap<&str, f64> {
    frame
        .data
        .iter()
        .filter_map(|(id, rec)| Some((id.as_str(), rec.rank.as_ref()?.close()?)))
        .collect()
}

/// Outcome of one contract on one frame.
enum FrameCheck {
    Compliant,
    Violated {
        expected: Vec<String>,
        actual: Vec<String>,
        elements: Vec<ElementSeverity>,
    },
}

/// Replays frames through every configured contract.
#[derive(Debug, Clone)]
pub struct TopologyChecker {
    contracts: Vec<RankContract>,
    severity: SeverityConfig,
}

impl TopologyChecker {
    pub fn new(cfg: &TopologyConfig) -> Self {
        Self {
            contracts: cfg.contracts.clone(),
            severity: cfg.severity,
        }
    }

    pub fn has_contracts(&self) -> bool {
        !self.contracts.is_empty()
    }

    pub fn check(&self, frames: &[Frame]) -> TopologyReport {
        let contracts: Vec<ContractReport> = self
            .contracts
            .iter()
            .map(|c| self.check_contract(c, frames))
            .collect();
        let evaluated: usize = contracts.iter().map(|c| c.evaluated_frames).sum();
        let compliant: usize = contracts.iter().map(|c| c.compliant_frames).sum();
        TopologyReport {
            contracts,
            stability: ratio(compliant, evaluated),
        }
    }

    fn check_contract(&self, contract: &RankContract, frames: &[Frame]) -> ContractReport {
        let mut evaluated = 0;
        let mut compliant = 0;
        let mut streak: u32 = 0;
        let mut violations = Vec::new();
        let mut open: Option<Violation> = None;

        for (idx, frame) in frames.iter().enumerate() {
            if !is_active(contract, frame) {
                streak = 0;
                violations.extend(open.take());
                continue;
            }
            evaluated += 1;

            match self.check_frame(contract, frame) {
                FrameCheck::Compliant => {
                    compliant += 1;
                    streak = 0;
                    violations.extend(open.take());
                }
                FrameCheck::Violated {
                    expected,
                    actual,
                    elements,
                } => {
                    streak = streak.saturating_add(1);
                    if streak <= contract.tolerance.frames {
                        continue;
                    }
                    let worst = elements
                        .iter()
                        .map(|e| e.severity)
                        .max()
                        .unwrap_or(Severity::Minor);
                    match open.as_mut() {
                        Some(v) => {
                            v.last_frame_index = idx;
                            v.streak_frames = streak;
                            v.severity = v.severity.max(worst);
                        }
                        None => {
                            tracing::debug!(
                                contract = %contract.id,
                                frame = idx,
                                streak,
                                "topology violation",
                            );
                            open = Some(Violation {
                                frame_index: idx,
                                timestamp: frame.timestamp,
                                last_frame_index: idx,
                                streak_frames: streak,
                                expected_order: expected,
                                actual_order: actual,
                                elements,
                                severity: worst,
                            });
                        }
                    }
                }
            }
        }
        violations.extend(open);

        ContractReport {
            contract_id: contract.id.clone(),
            contract_type: contract.contract_type,
            evaluated_frames: evaluated,
            compliant_frames: compliant,
            stability: ratio(compliant, evaluated),
            violations,
        }
    }

    fn check_frame(&self, contract: &RankContract, frame: &Frame) -> FrameCheck {
        let ranks = extract_rank_map(frame);
        // Present entities in expected order.
        let present: Vec<(&str, f64)> = contract
            .expected_order
            .iter()
            .filter_map(|id| ranks.get(id.as_str()).map(|r| (id.as_str(), *r)))
            .collect();

        match contract.contract_type {
            ContractType::TopN => self.check_top_n(contract, &present),
            ContractType::StrictOrder if present.len() >= 2 => {
                let actual = rank_sorted(&present);
                if actual.iter().zip(&present).all(|(a, p)| a.0 == p.0) {
                    FrameCheck::Compliant
                } else {
                    self.order_violation(&present, &actual)
                }
            }
            ContractType::NeverBelow | ContractType::PartialOrder if present.len() >= 2 => {
                let margin = contract.tolerance.margin_or_n as f64;
                let ordered = present.iter().enumerate().all(|(i, (_, upper))| {
                    present[i + 1..]
                        .iter()
                        .all(|(_, lower)| *upper <= *lower + margin)
                });
                if ordered {
                    FrameCheck::Compliant
                } else {
                    self.order_violation(&present, &rank_sorted(&present))
                }
            }
            _ => FrameCheck::Compliant,
        }
    }

    fn check_top_n(&self, contract: &RankContract, present: &[(&str, f64)]) -> FrameCheck {
        let n = contract.tolerance.margin_or_n.max(1);
        let Some(first) = contract.expected_order.first() else {
            return FrameCheck::Compliant;
        };
        let Some(&(id, rank)) = present.iter().find(|(id, _)| *id == first.as_str()) else {
            return FrameCheck::Compliant;
        };
        if rank <= n as f64 {
            return FrameCheck::Compliant;
        }
        let distance = (rank - n as f64).ceil().min(u32::MAX as f64) as u32;
        FrameCheck::Violated {
            expected: vec![id.to_string()],
            actual: rank_sorted(present).iter().map(|(id, _)| id.to_string()).collect(),
            elements: vec![ElementSeverity {
                entity: id.to_string(),
                rank,
                distance,
                severity: Severity::from_distance(distance, &self.severity),
            }],
        }
    }

    /// Severity per element from how far it moved from its expected position.
    fn order_violation(&self, present: &[(&str, f64)], actual: &[(&str, f64)]) -> FrameCheck {
        let elements = present
            .iter()
            .enumerate()
            .filter_map(|(want, (id, rank))| {
                let got = actual.iter().position(|(a, _)| a == id)?;
                let distance = want.abs_diff(got) as u32;
                (distance > 0).then(|| ElementSeverity {
                    entity: id.to_string(),
                    rank: *rank,
                    distance,
                    severity: Severity::from_distance(distance, &self.severity),
                })
            })
            .collect();
        FrameCheck::Violated {
            expected: present.iter().map(|(id, _)| id.to_string()).collect(),
            actual: actual.iter().map(|(id, _)| id.to_string()).collect(),
            elements,
        }
    }
}

/// Stable: equal ranks keep their expected order.
fn rank_sorted<'a>(present: &[(&'a str, f64)]) -> Vec<(&'a str, f64)> {
    let mut sorted = present.to_vec();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
    sorted
}

fn is_active(contract: &RankContract, frame: &Frame) -> bool {
    let Some(cond) = &contract.active_when else {
        return true;
    };
    frame
        .entity(&cond.requires_entity_present)
        .and_then(|rec| rec.weight.as_ref())
        .and_then(|w| w.close())
        .is_some_and(|w| w > 0.0)
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        1.0
    } else {
        num as f64 / den as f64
    }
}
