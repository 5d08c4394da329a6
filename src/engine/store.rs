use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::directory::LaborTable;
use crate::model::*;

pub type SharedTool = Arc<RwLock<ToolRecord>>;
pub type SharedSupply = Arc<RwLock<SupplyRecord>>;

/// Where a movement lives: the kind of pool and the item that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MovementRef {
    pub kind: ItemKind,
    pub item_id: Ulid,
    pub movement_id: Ulid,
}

/// Per-item records behind their own locks, plus the lookup indexes around them.
///
/// Index maps are only touched after an event is durable, never while a
/// caller is still deciding whether it may write one.
pub struct LedgerStore {
    tools: DashMap<Ulid, SharedTool>,
    supplies: DashMap<Ulid, SharedSupply>,
    movements: DashMap<Ulid, MovementRef>,
    by_labor: DashMap<Ulid, Vec<MovementRef>>,
    labors: Arc<LaborTable>,
}

impl LedgerStore {
    pub fn new(labors: Arc<LaborTable>) -> Self {
        Self {
            tools: DashMap::new(),
            supplies: DashMap::new(),
            movements: DashMap::new(),
            by_labor: DashMap::new(),
            labors,
        }
    }

    /// Fold a replayed log into a fresh store. Records are built unlocked and wrapped at the end.
    pub fn rebuild(events: &[Event], labors: Arc<LaborTable>) -> Self {
        let store = Self::new(labors);
        let mut tools: HashMap<Ulid, ToolRecord> = HashMap::new();
        let mut supplies: HashMap<Ulid, SupplyRecord> = HashMap::new();

        for event in events {
            match event {
                Event::ToolSynced { id, .. } => match tools.get_mut(id) {
                    Some(rec) => apply_to_tool(rec, event),
                    None => {
                        if let Some(rec) = tool_from_event(event) {
                            tools.insert(*id, rec);
                        }
                    }
                },
                Event::SupplySynced { id, .. } => match supplies.get_mut(id) {
                    Some(rec) => apply_to_supply(rec, event),
                    None => {
                        if let Some(rec) = supply_from_event(event) {
                            supplies.insert(*id, rec);
                        }
                    }
                },
                Event::ToolAllocated { tool_id, .. } | Event::ToolReturned { tool_id, .. } => {
                    if let Some(rec) = tools.get_mut(tool_id) {
                        apply_to_tool(rec, event);
                    }
                }
                Event::SupplyAllocated { supply_id, .. }
                | Event::SupplyReturned { supply_id, .. } => {
                    if let Some(rec) = supplies.get_mut(supply_id) {
                        apply_to_supply(rec, event);
                    }
                }
                Event::LaborSynced { .. } => {}
            }
            store.index_event(event);
        }

        for (id, rec) in tools {
            store.tools.insert(id, Arc::new(RwLock::new(rec)));
        }
        for (id, rec) in supplies {
            store.supplies.insert(id, Arc::new(RwLock::new(rec)));
        }
        store
    }

    // ── Items ────────────────────────────────────────────────

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn supply_count(&self) -> usize {
        self.supplies.len()
    }

    pub fn item_count(&self) -> usize {
        self.tools.len() + self.supplies.len()
    }

    pub fn get_tool(&self, id: &Ulid) -> Option<SharedTool> {
        self.tools.get(id).map(|e| e.value().clone())
    }

    pub fn get_supply(&self, id: &Ulid) -> Option<SharedSupply> {
        self.supplies.get(id).map(|e| e.value().clone())
    }

    pub fn insert_tool(&self, rec: ToolRecord) {
        self.tools.insert(rec.id, Arc::new(RwLock::new(rec)));
    }

    pub fn insert_supply(&self, rec: SupplyRecord) {
        self.supplies.insert(rec.id, Arc::new(RwLock::new(rec)));
    }

    pub fn tool_ids(&self) -> Vec<Ulid> {
        self.tools.iter().map(|e| *e.key()).collect()
    }

    pub fn supply_ids(&self) -> Vec<Ulid> {
        self.supplies.iter().map(|e| *e.key()).collect()
    }

    // ── Labors ───────────────────────────────────────────────

    pub fn labors(&self) -> &LaborTable {
        &self.labors
    }

    // ── Movement indexes ─────────────────────────────────────

    pub fn resolve_movement(&self, movement_id: &Ulid) -> Option<MovementRef> {
        self.movements.get(movement_id).map(|e| *e.value())
    }

    pub fn movements_for_labor(&self, labor_id: &Ulid) -> Vec<MovementRef> {
        self.by_labor
            .get(labor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Record what an applied event adds to the indexes.
    pub fn index_event(&self, event: &Event) {
        let (kind, id, labor_id, item_id) = match event {
            Event::ToolAllocated {
                id,
                labor_id,
                tool_id,
                ..
            } => (ItemKind::Tool, *id, *labor_id, *tool_id),
            Event::SupplyAllocated {
                id,
                labor_id,
                supply_id,
                ..
            } => (ItemKind::Supply, *id, *labor_id, *supply_id),
            Event::LaborSynced { facts } => {
                self.labors.upsert(facts.clone());
                return;
            }
            _ => return,
        };
        let r = MovementRef {
            kind,
            item_id,
            movement_id: id,
        };
        self.movements.insert(id, r);
        self.by_labor.entry(labor_id).or_default().push(r);
    }
}

// ── Event application ────────────────────────────────────────
//
// Callers hold the record's write lock and have already validated the event;
// replay trusts the log the same way.

pub(crate) fn apply_to_tool(rec: &mut ToolRecord, event: &Event) {
    match event {
        Event::ToolSynced {
            name,
            category,
            total,
            state,
            ..
        } => {
            let outstanding = rec.total.saturating_sub(rec.available);
            rec.name = name.clone();
            rec.category = category.clone();
            rec.state = *state;
            rec.total = *total;
            rec.available = total.saturating_sub(outstanding);
        }
        Event::ToolAllocated {
            id,
            labor_id,
            tool_id,
            quantity,
            note,
            at,
        } => {
            rec.available = rec.available.saturating_sub(*quantity);
            rec.movements
                .push(Movement::new(*id, *labor_id, *tool_id, *quantity, note.clone(), *at));
        }
        Event::ToolReturned {
            movement_id,
            quantity,
            at,
            ..
        } => {
            if let Some(m) = rec.movements.get_mut(movement_id) {
                m.record_return(*quantity, *at);
                rec.available += *quantity;
            }
        }
        _ => {}
    }
}

pub(crate) fn apply_to_supply(rec: &mut SupplyRecord, event: &Event) {
    match event {
        Event::SupplySynced {
            name,
            program_id,
            unit,
            alert_threshold,
            total,
            state,
            ..
        } => {
            let outstanding = rec.total - rec.available;
            rec.name = name.clone();
            rec.program_id = *program_id;
            rec.unit = unit.clone();
            rec.alert_threshold = *alert_threshold;
            rec.total = *total;
            rec.available = (*total - outstanding).max(Decimal::ZERO);
            rec.state = *state;
        }
        Event::SupplyAllocated {
            id,
            labor_id,
            supply_id,
            quantity,
            note,
            at,
        } => {
            rec.available -= *quantity;
            rec.movements
                .push(Movement::new(*id, *labor_id, *supply_id, *quantity, note.clone(), *at));
        }
        Event::SupplyReturned {
            movement_id,
            quantity,
            at,
            ..
        } => {
            if let Some(m) = rec.movements.get_mut(movement_id) {
                m.record_return(*quantity, *at);
                rec.available += *quantity;
            }
        }
        _ => return,
    }
    rec.reclassify();
}

pub(crate) fn supply_from_event(event: &Event) -> Option<SupplyRecord> {
    match event {
        Event::SupplySynced {
            id,
            name,
            program_id,
            unit,
            alert_threshold,
            total,
            state,
        } => Some(SupplyRecord::new(
            *id,
            name.clone(),
            *program_id,
            unit.clone(),
            *alert_threshold,
            *total,
            *state,
        )),
        _ => None,
    }
}

pub(crate) fn tool_from_event(event: &Event) -> Option<ToolRecord> {
    match event {
        Event::ToolSynced {
            id,
            name,
            category,
            total,
            state,
        } => Some(ToolRecord::new(*id, name.clone(), category.clone(), *total, *state)),
        _ => None,
    }
}
