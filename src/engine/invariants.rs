//! Structural and volume-conservation checks.

use super::ledger::{LegAggregate, VolumeLedger};
use super::store::PositionStore;
use super::MatrixError;
use crate::domain::{Leg, PositionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub positions: usize,
    pub violations: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Full check: tree shape, levels, links, and that every cached aggregate
/// equals the sum of own volumes in its subtree.
pub fn audit(store: &PositionStore, ledger: &VolumeLedger) -> AuditReport {
    let mut violations = Vec::new();
    let mut roots = 0usize;

    for position in store.positions() {
        match (position.parent_id, position.leg) {
            (None, None) => {
                roots += 1;
                if position.level != 0 {
                    violations.push(format!(
                        "root {} has level {}",
                        position.id, position.level
                    ));
                }
            }
            (Some(parent_id), Some(leg)) => match store.get(parent_id) {
                Ok(parent) => {
                    if parent.child(leg) != Some(position.id) {
                        violations.push(format!(
                            "position {} claims {} slot of {} held by {:?}",
                            position.id,
                            leg,
                            parent_id,
                            parent.child(leg)
                        ));
                    }
                    if position.level != parent.level + 1 {
                        violations.push(format!(
                            "position {} has level {}, parent {} has level {}",
                            position.id, position.level, parent_id, parent.level
                        ));
                    }
                }
                Err(_) => violations.push(format!(
                    "position {} references missing parent {}",
                    position.id, parent_id
                )),
            },
            _ => violations.push(format!("position {} has a partial parent link", position.id)),
        }

        for (leg, child) in position.children() {
            match store.get(child) {
                Ok(c) if c.parent_id == Some(position.id) && c.leg == Some(leg) => {}
                _ => violations.push(format!(
                    "position {} {} child {} does not point back",
                    position.id, leg, child
                )),
            }
        }
    }

    if !store.is_empty() && roots != 1 {
        violations.push(format!("expected exactly one root, found {}", roots));
    }

    let own: HashMap<PositionId, _> = store
        .positions()
        .map(|p| (p.id, ledger.own_volume(p.id)))
        .collect();
    match VolumeLedger::rebuild(store, &own) {
        Ok(expected) => {
            for position in store.positions() {
                let cached = ledger.aggregate(position.id);
                let derived = expected.aggregate(position.id);
                if cached != derived {
                    violations.push(format!(
                        "position {} aggregate {:?} differs from derived {:?}",
                        position.id, cached, derived
                    ));
                }
            }
        }
        Err(e) => violations.push(format!("cannot derive aggregates: {}", e)),
    }

    AuditReport {
        positions: store.len(),
        violations,
    }
}

/// Local conservation check along the ancestor chains of `starts`
/// (each start included): every leg subtotal must equal its child's total.
pub fn check_chains(
    store: &PositionStore,
    ledger: &VolumeLedger,
    starts: &[PositionId],
) -> Result<(), MatrixError> {
    for start in starts {
        let chain = std::iter::once(*start).chain(store.ancestors(*start).map(|(a, _)| a));
        for id in chain {
            check_node(store, ledger, id)?;
        }
    }
    Ok(())
}

fn check_node(
    store: &PositionStore,
    ledger: &VolumeLedger,
    id: PositionId,
) -> Result<(), MatrixError> {
    let position = store.get(id)?;
    let aggregate = ledger.aggregate(id);
    let mut expected = LegAggregate {
        own_volume: aggregate.own_volume,
        ..Default::default()
    };
    for (leg, child) in position.children() {
        let below = ledger.aggregate(child);
        match leg {
            Leg::Left => {
                expected.left_volume = below.total_volume();
                expected.left_count = below.total_count();
            }
            Leg::Right => {
                expected.right_volume = below.total_volume();
                expected.right_count = below.total_count();
            }
        }
    }
    if expected != aggregate {
        return Err(MatrixError::InvariantViolation(format!(
            "position {} aggregate {:?} does not match children {:?}",
            id, aggregate, expected
        )));
    }
    Ok(())
}
