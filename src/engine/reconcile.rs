use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Entity};

/// An item whose counters no longer add up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConservationBreach {
    pub item_id: Ulid,
    pub item_type: ItemKind,
    pub total: Decimal,
    pub available: Decimal,
    pub outstanding: Decimal,
}

impl Engine {
    /// What a labor still holds, one row per item. Closed items are left out;
    /// an unknown labor simply has nothing outstanding.
    pub async fn outstanding_for_labor(&self, labor_id: Ulid) -> Vec<OutstandingItem> {
        let mut by_item: BTreeMap<(ItemKind, Ulid), Vec<Ulid>> = BTreeMap::new();
        for r in self.store.movements_for_labor(&labor_id) {
            by_item
                .entry((r.kind, r.item_id))
                .or_default()
                .push(r.movement_id);
        }

        let mut out = Vec::with_capacity(by_item.len());
        for ((kind, item_id), ids) in by_item {
            let outstanding: Decimal = match kind {
                ItemKind::Tool => {
                    let Some(tool) = self.store.get_tool(&item_id) else {
                        continue;
                    };
                    let guard = tool.read().await;
                    ids.iter()
                        .filter_map(|id| guard.movements.get(id))
                        .map(|m| Decimal::from(m.outstanding()))
                        .sum()
                }
                ItemKind::Supply => {
                    let Some(supply) = self.store.get_supply(&item_id) else {
                        continue;
                    };
                    let guard = supply.read().await;
                    ids.iter()
                        .filter_map(|id| guard.movements.get(id))
                        .map(|m| m.outstanding())
                        .sum()
                }
            };
            if !outstanding.is_zero() {
                out.push(OutstandingItem {
                    item_id,
                    item_type: kind,
                    outstanding,
                });
            }
        }
        out
    }

    pub async fn get_tool(&self, id: Ulid) -> Result<ToolInfo, EngineError> {
        let tool = self
            .store
            .get_tool(&id)
            .ok_or(EngineError::NotFound(Entity::Tool, id))?;
        let guard = tool.read().await;
        Ok(guard.info())
    }

    pub async fn get_supply(&self, id: Ulid) -> Result<SupplyInfo, EngineError> {
        let supply = self
            .store
            .get_supply(&id)
            .ok_or(EngineError::NotFound(Entity::Supply, id))?;
        let guard = supply.read().await;
        Ok(guard.info())
    }

    pub async fn tool_movement(&self, id: Ulid) -> Result<MovementInfo, EngineError> {
        let not_found = EngineError::NotFound(Entity::ToolMovement, id);
        let Some(r) = self.store.resolve_movement(&id).filter(|r| r.kind == ItemKind::Tool) else {
            return Err(not_found);
        };
        let tool = self.store.get_tool(&r.item_id).ok_or_else(|| not_found.clone())?;
        let guard = tool.read().await;
        guard
            .movements
            .get(&id)
            .map(|m| MovementInfo::from_movement(ItemKind::Tool, m))
            .ok_or(not_found)
    }

    pub async fn supply_movement(&self, id: Ulid) -> Result<MovementInfo, EngineError> {
        let not_found = EngineError::NotFound(Entity::SupplyMovement, id);
        let Some(r) = self
            .store
            .resolve_movement(&id)
            .filter(|r| r.kind == ItemKind::Supply)
        else {
            return Err(not_found);
        };
        let supply = self.store.get_supply(&r.item_id).ok_or_else(|| not_found.clone())?;
        let guard = supply.read().await;
        guard
            .movements
            .get(&id)
            .map(|m| MovementInfo::from_movement(ItemKind::Supply, m))
            .ok_or(not_found)
    }

    /// Movements matching every given filter, newest first, one page at a time.
    pub async fn list_movements(&self, filter: &MovementFilter) -> Vec<MovementInfo> {
        let wants = |kind: ItemKind| filter.kind.is_none_or(|k| k == kind);

        let mut items: Vec<(ItemKind, Ulid)> = match (filter.labor_id, filter.item_id) {
            (Some(labor_id), _) => self
                .store
                .movements_for_labor(&labor_id)
                .into_iter()
                .map(|r| (r.kind, r.item_id))
                .filter(|(_, item)| filter.item_id.is_none_or(|id| id == *item))
                .collect(),
            (None, Some(item_id)) => vec![(ItemKind::Tool, item_id), (ItemKind::Supply, item_id)],
            (None, None) => {
                let mut all: Vec<(ItemKind, Ulid)> = self
                    .store
                    .tool_ids()
                    .into_iter()
                    .map(|id| (ItemKind::Tool, id))
                    .collect();
                all.extend(self.store.supply_ids().into_iter().map(|id| (ItemKind::Supply, id)));
                all
            }
        };
        items.retain(|(kind, _)| wants(*kind));
        items.sort();
        items.dedup();

        let keep = |labor_id: Ulid| filter.labor_id.is_none_or(|l| l == labor_id);
        let mut out = Vec::new();
        for (kind, item_id) in items {
            match kind {
                ItemKind::Tool => {
                    let Some(tool) = self.store.get_tool(&item_id) else {
                        continue;
                    };
                    let guard = tool.read().await;
                    out.extend(
                        guard
                            .movements
                            .iter()
                            .filter(|m| keep(m.labor_id))
                            .map(|m| MovementInfo::from_movement(kind, m)),
                    );
                }
                ItemKind::Supply => {
                    let Some(supply) = self.store.get_supply(&item_id) else {
                        continue;
                    };
                    let guard = supply.read().await;
                    out.extend(
                        guard
                            .movements
                            .iter()
                            .filter(|m| keep(m.labor_id))
                            .map(|m| MovementInfo::from_movement(kind, m)),
                    );
                }
            }
        }

        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_RESULTS);
        out.into_iter().skip(filter.offset).take(limit).collect()
    }

    /// Activity at or after `since`. Allocations count by when they were
    /// made, returns by when they came back, whatever the movement's age.
    pub async fn movement_summary(&self, since: Ms) -> MovementSummary {
        let mut summary = MovementSummary {
            since,
            ..Default::default()
        };
        for id in self.store.tool_ids() {
            let Some(tool) = self.store.get_tool(&id) else {
                continue;
            };
            let guard = tool.read().await;
            for m in guard.movements.iter() {
                tally(&mut summary.tools, m, since);
            }
        }
        for id in self.store.supply_ids() {
            let Some(supply) = self.store.get_supply(&id) else {
                continue;
            };
            let guard = supply.read().await;
            for m in guard.movements.iter() {
                tally(&mut summary.supplies, m, since);
            }
        }
        summary
    }

    /// Every item where `available + Σ outstanding != total`.
    pub async fn verify_conservation(&self) -> Vec<ConservationBreach> {
        let mut breaches = Vec::new();
        for id in self.store.tool_ids() {
            let Some(tool) = self.store.get_tool(&id) else {
                continue;
            };
            let guard = tool.read().await;
            if !guard.is_balanced() {
                breaches.push(ConservationBreach {
                    item_id: id,
                    item_type: ItemKind::Tool,
                    total: guard.total.into(),
                    available: guard.available.into(),
                    outstanding: guard
                        .movements
                        .iter()
                        .map(|m| Decimal::from(m.outstanding()))
                        .sum(),
                });
            }
        }
        for id in self.store.supply_ids() {
            let Some(supply) = self.store.get_supply(&id) else {
                continue;
            };
            let guard = supply.read().await;
            if !guard.is_balanced() {
                breaches.push(ConservationBreach {
                    item_id: id,
                    item_type: ItemKind::Supply,
                    total: guard.total,
                    available: guard.available,
                    outstanding: guard.movements.outstanding_total(),
                });
            }
        }
        breaches
    }
}

fn tally<Q: Quantity>(summary: &mut KindSummary, m: &Movement<Q>, since: Ms) {
    if m.created_at >= since {
        summary.movements += 1;
        summary.checked_out = summary.checked_out.saturating_add(m.quantity.to_decimal());
        summary.outstanding = summary.outstanding.saturating_add(m.outstanding().to_decimal());
    }
    for r in m.returns.iter().filter(|r| r.at >= since) {
        summary.returns += 1;
        summary.returned = summary.returned.saturating_add(r.quantity.to_decimal());
    }
}
