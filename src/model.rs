use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Sub};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Arithmetic shared by tool pools (whole units) and supply pools (decimal amounts).
pub trait Quantity:
    Copy + Ord + Default + fmt::Debug + fmt::Display + Add<Output = Self> + Sub<Output = Self>
{
    fn is_positive(&self) -> bool {
        *self > Self::default()
    }

    fn to_decimal(self) -> Decimal;
}

impl Quantity for u32 {
    fn to_decimal(self) -> Decimal {
        Decimal::from(self)
    }
}

impl Quantity for Decimal {
    fn to_decimal(self) -> Decimal {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Tool,
    Supply,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Tool => "tool",
            ItemKind::Supply => "supply",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    #[default]
    Available,
    Unavailable,
    InMaintenance,
    Retired,
}

impl ToolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolState::Available => "available",
            ToolState::Unavailable => "unavailable",
            ToolState::InMaintenance => "in_maintenance",
            ToolState::Retired => "retired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplyState {
    #[default]
    Available,
    LowStock,
    Depleted,
    Expired,
    Inactive,
}

impl SupplyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupplyState::Available => "available",
            SupplyState::LowStock => "low_stock",
            SupplyState::Depleted => "depleted",
            SupplyState::Expired => "expired",
            SupplyState::Inactive => "inactive",
        }
    }

    /// States the ledger derives from the counters. The rest are set by the catalog.
    pub fn is_stock_driven(&self) -> bool {
        matches!(
            self,
            SupplyState::Available | SupplyState::LowStock | SupplyState::Depleted
        )
    }

    pub fn accepts_allocations(&self) -> bool {
        self.is_stock_driven()
    }

    pub fn classify(available: Decimal, alert_threshold: Decimal) -> SupplyState {
        if available.is_zero() {
            SupplyState::Depleted
        } else if available < alert_threshold {
            SupplyState::LowStock
        } else {
            SupplyState::Available
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaborState {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl LaborState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaborState::Pending => "pending",
            LaborState::InProgress => "in_progress",
            LaborState::Completed => "completed",
            LaborState::Cancelled => "cancelled",
        }
    }

    pub fn accepts_allocations(&self) -> bool {
        matches!(self, LaborState::Pending | LaborState::InProgress)
    }
}

/// What the ledger knows about a work order: enough to scope and gate allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaborFacts {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub program_id: Ulid,
    pub state: LaborState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementPhase {
    Open,
    PartiallyReturned,
    Closed,
}

/// A single return against a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnEntry<Q> {
    pub at: Ms,
    pub quantity: Q,
}

/// One allocation. `quantity` is fixed at creation; only `returned` moves, and only upward.
/// `returned` is always the sum of `returns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movement<Q> {
    pub id: Ulid,
    pub labor_id: Ulid,
    pub item_id: Ulid,
    pub quantity: Q,
    pub returned: Q,
    pub returns: Vec<ReturnEntry<Q>>,
    pub note: Option<String>,
    pub created_at: Ms,
}

impl<Q: Quantity> Movement<Q> {
    pub fn new(id: Ulid, labor_id: Ulid, item_id: Ulid, quantity: Q, note: Option<String>, created_at: Ms) -> Self {
        Self {
            id,
            labor_id,
            item_id,
            quantity,
            returned: Q::default(),
            returns: Vec::new(),
            note,
            created_at,
        }
    }

    pub fn record_return(&mut self, quantity: Q, at: Ms) {
        self.returned = self.returned + quantity;
        self.returns.push(ReturnEntry { at, quantity });
    }

    pub fn last_returned_at(&self) -> Option<Ms> {
        self.returns.last().map(|r| r.at)
    }

    pub fn outstanding(&self) -> Q {
        self.quantity - self.returned
    }

    pub fn phase(&self) -> MovementPhase {
        if self.returned >= self.quantity {
            MovementPhase::Closed
        } else if self.returned.is_positive() {
            MovementPhase::PartiallyReturned
        } else {
            MovementPhase::Open
        }
    }
}

/// Movements of a single item in creation order, with an id index.
#[derive(Debug, Clone)]
pub struct MovementLog<Q> {
    entries: Vec<Movement<Q>>,
    by_id: HashMap<Ulid, usize>,
}

impl<Q: Quantity> Default for MovementLog<Q> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<Q: Quantity> MovementLog<Q> {
    pub fn push(&mut self, movement: Movement<Q>) {
        self.by_id.insert(movement.id, self.entries.len());
        self.entries.push(movement);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Movement<Q>> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Movement<Q>> {
        self.by_id.get(id).map(|&i| &mut self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Movement<Q>> {
        self.entries.iter()
    }

    pub fn outstanding_total(&self) -> Q {
        self.entries
            .iter()
            .fold(Q::default(), |acc, m| acc + m.outstanding())
    }
}

#[derive(Debug, Clone)]
pub struct ToolRecord {
    pub id: Ulid,
    pub name: String,
    pub category: Option<String>,
    pub total: u32,
    pub available: u32,
    pub state: ToolState,
    pub movements: MovementLog<u32>,
}

impl ToolRecord {
    pub fn new(id: Ulid, name: String, category: Option<String>, total: u32, state: ToolState) -> Self {
        Self {
            id,
            name,
            category,
            total,
            available: total,
            state,
            movements: MovementLog::default(),
        }
    }

    /// `available + Σ outstanding == total`
    pub fn is_balanced(&self) -> bool {
        let outstanding: u64 = self
            .movements
            .iter()
            .map(|m| u64::from(m.outstanding()))
            .sum();
        u64::from(self.available) + outstanding == u64::from(self.total)
    }

    pub fn info(&self) -> ToolInfo {
        ToolInfo {
            id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            total_quantity: self.total,
            available_quantity: self.available,
            state: self.state,
            movement_count: self.movements.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupplyRecord {
    pub id: Ulid,
    pub name: String,
    pub program_id: Ulid,
    pub unit: String,
    pub alert_threshold: Decimal,
    pub total: Decimal,
    pub available: Decimal,
    pub state: SupplyState,
    pub movements: MovementLog<Decimal>,
}

impl SupplyRecord {
    pub fn new(
        id: Ulid,
        name: String,
        program_id: Ulid,
        unit: String,
        alert_threshold: Decimal,
        total: Decimal,
        state: SupplyState,
    ) -> Self {
        let mut rec = Self {
            id,
            name,
            program_id,
            unit,
            alert_threshold,
            total,
            available: total,
            state,
            movements: MovementLog::default(),
        };
        rec.reclassify();
        rec
    }

    /// Re-derive a stock-driven state from the counters; catalog-driven states stay put.
    pub fn reclassify(&mut self) {
        if self.state.is_stock_driven() {
            self.state = SupplyState::classify(self.available, self.alert_threshold);
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.available >= Decimal::ZERO
            && self.available + self.movements.outstanding_total() == self.total
    }

    pub fn info(&self) -> SupplyInfo {
        SupplyInfo {
            id: self.id,
            name: self.name.clone(),
            program_id: self.program_id,
            unit_of_measure: self.unit.clone(),
            alert_threshold: self.alert_threshold,
            total_quantity: self.total,
            available_quantity: self.available,
            state: self.state,
            movement_count: self.movements.len(),
        }
    }
}

/// Flat event types, no nesting. This is the WAL record format.
///
/// Decimal fields go through `rust_decimal::serde::str` because bincode carries
/// no type hints for the default any-based decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ToolSynced {
        id: Ulid,
        name: String,
        category: Option<String>,
        total: u32,
        state: ToolState,
    },
    SupplySynced {
        id: Ulid,
        name: String,
        program_id: Ulid,
        unit: String,
        #[serde(with = "rust_decimal::serde::str")]
        alert_threshold: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        total: Decimal,
        state: SupplyState,
    },
    LaborSynced {
        facts: LaborFacts,
    },
    ToolAllocated {
        id: Ulid,
        labor_id: Ulid,
        tool_id: Ulid,
        quantity: u32,
        note: Option<String>,
        at: Ms,
    },
    ToolReturned {
        movement_id: Ulid,
        tool_id: Ulid,
        quantity: u32,
        at: Ms,
    },
    SupplyAllocated {
        id: Ulid,
        labor_id: Ulid,
        supply_id: Ulid,
        #[serde(with = "rust_decimal::serde::str")]
        quantity: Decimal,
        note: Option<String>,
        at: Ms,
    },
    SupplyReturned {
        movement_id: Ulid,
        supply_id: Ulid,
        #[serde(with = "rust_decimal::serde::str")]
        quantity: Decimal,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub id: Ulid,
    pub name: String,
    pub category: Option<String>,
    pub total_quantity: u32,
    pub available_quantity: u32,
    pub state: ToolState,
    pub movement_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplyInfo {
    pub id: Ulid,
    pub name: String,
    pub program_id: Ulid,
    pub unit_of_measure: String,
    pub alert_threshold: Decimal,
    pub total_quantity: Decimal,
    pub available_quantity: Decimal,
    pub state: SupplyState,
    pub movement_count: usize,
}

/// A movement flattened for display; tool quantities are widened to decimals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovementInfo {
    pub id: Ulid,
    pub kind: ItemKind,
    pub labor_id: Ulid,
    pub item_id: Ulid,
    pub quantity: Decimal,
    pub returned: Decimal,
    pub outstanding: Decimal,
    pub phase: MovementPhase,
    pub note: Option<String>,
    pub created_at: Ms,
    pub last_returned_at: Option<Ms>,
}

impl MovementInfo {
    pub fn from_movement<Q: Quantity>(kind: ItemKind, m: &Movement<Q>) -> Self {
        Self {
            id: m.id,
            kind,
            labor_id: m.labor_id,
            item_id: m.item_id,
            quantity: m.quantity.to_decimal(),
            returned: m.returned.to_decimal(),
            outstanding: m.outstanding().to_decimal(),
            phase: m.phase(),
            note: m.note.clone(),
            created_at: m.created_at,
            last_returned_at: m.last_returned_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutstandingItem {
    pub item_id: Ulid,
    pub item_type: ItemKind,
    pub outstanding: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MovementFilter {
    pub labor_id: Option<Ulid>,
    pub item_id: Option<Ulid>,
    pub kind: Option<ItemKind>,
    /// Matches to skip, newest first.
    #[serde(default)]
    pub offset: usize,
    /// Page size, capped at `MAX_LIST_RESULTS`.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    /// Allocations made in the window.
    pub movements: usize,
    pub checked_out: Decimal,
    /// Return events in the window, against any movement.
    pub returns: usize,
    pub returned: Decimal,
    /// Still held from the window's allocations.
    pub outstanding: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MovementSummary {
    pub since: Ms,
    pub tools: KindSummary,
    pub supplies: KindSummary,
}
