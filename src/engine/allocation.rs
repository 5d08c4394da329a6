use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::checks::*;
use super::store::{apply_to_supply, apply_to_tool};
use super::{Engine, EngineError, Entity};

#[derive(Debug, Clone, Deserialize)]
pub struct ToolAllocation {
    pub labor_id: Ulid,
    pub tool_id: Ulid,
    pub quantity: u32,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupplyAllocation {
    pub labor_id: Ulid,
    pub supply_id: Ulid,
    pub quantity: Decimal,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReturnRequest<Q> {
    pub movement_id: Ulid,
    pub quantity: Q,
}

impl Engine {
    /// Check tools out of a pool for a labor. Fails without side effects
    /// unless the full quantity is available.
    pub async fn allocate_tool(
        &self,
        req: ToolAllocation,
        deadline: Option<Instant>,
    ) -> Result<Movement<u32>, EngineError> {
        require_positive(req.quantity)?;
        validate_note(&req.note)?;
        let tool = self
            .store
            .get_tool(&req.tool_id)
            .ok_or(EngineError::NotFound(Entity::Tool, req.tool_id))?;
        let labor = self.resolve_labor(req.labor_id, deadline).await?;
        check_labor_accepts(&labor)?;

        let guard = lock_before(tool, deadline).await?;
        if guard.state == ToolState::Retired {
            return Err(EngineError::InvalidState {
                entity: Entity::Tool,
                id: guard.id,
                state: guard.state.as_str(),
            });
        }
        check_movement_room(&guard.movements)?;
        check_stock(guard.id, req.quantity, guard.available)?;
        check_deadline(deadline)?;

        let id = Ulid::new();
        let event = Event::ToolAllocated {
            id,
            labor_id: labor.id,
            tool_id: req.tool_id,
            quantity: req.quantity,
            note: req.note,
            at: now_ms(),
        };
        let guard = self
            .commit(event, move |_, event| {
                let mut guard = guard;
                apply_to_tool(&mut guard, event);
                guard
            })
            .await?;
        debug!(
            "allocated {} of tool {} to labor {}, {} left",
            req.quantity, req.tool_id, labor.id, guard.available
        );
        guard
            .movements
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::ToolMovement, id))
    }

    /// Draw a supply for a labor. The supply and the labor's lot must belong
    /// to the same program.
    pub async fn allocate_supply(
        &self,
        req: SupplyAllocation,
        deadline: Option<Instant>,
    ) -> Result<Movement<Decimal>, EngineError> {
        require_positive(req.quantity)?;
        validate_supply_amount(req.quantity)?;
        validate_note(&req.note)?;
        let supply = self
            .store
            .get_supply(&req.supply_id)
            .ok_or(EngineError::NotFound(Entity::Supply, req.supply_id))?;
        let labor = self.resolve_labor(req.labor_id, deadline).await?;
        check_labor_accepts(&labor)?;

        let guard = lock_before(supply, deadline).await?;
        if !guard.state.accepts_allocations() {
            return Err(EngineError::InvalidState {
                entity: Entity::Supply,
                id: guard.id,
                state: guard.state.as_str(),
            });
        }
        if guard.program_id != labor.program_id {
            return Err(EngineError::ProgramMismatch {
                supply_program: guard.program_id,
                labor_program: labor.program_id,
            });
        }
        check_movement_room(&guard.movements)?;
        check_stock(guard.id, req.quantity, guard.available)?;
        check_deadline(deadline)?;

        let before = guard.state;
        let id = Ulid::new();
        let event = Event::SupplyAllocated {
            id,
            labor_id: labor.id,
            supply_id: req.supply_id,
            quantity: req.quantity,
            note: req.note,
            at: now_ms(),
        };
        let guard = self
            .commit(event, move |_, event| {
                let mut guard = guard;
                apply_to_supply(&mut guard, event);
                guard
            })
            .await?;
        if guard.state != before {
            info!(
                "supply {} went from {} to {} ({} {} left)",
                guard.id,
                before.as_str(),
                guard.state.as_str(),
                guard.available,
                guard.unit
            );
            metrics::counter!(
                crate::observability::STOCK_ALERTS_TOTAL,
                "state" => guard.state.as_str()
            )
            .increment(1);
        }
        guard
            .movements
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::SupplyMovement, id))
    }

    /// Bring tools back against a movement. Allowed whatever state the tool
    /// or the labor is in now.
    pub async fn return_tool(
        &self,
        req: ReturnRequest<u32>,
        deadline: Option<Instant>,
    ) -> Result<Movement<u32>, EngineError> {
        require_positive(req.quantity)?;
        let not_found = EngineError::NotFound(Entity::ToolMovement, req.movement_id);
        let r = self
            .store
            .resolve_movement(&req.movement_id)
            .filter(|r| r.kind == ItemKind::Tool)
            .ok_or_else(|| not_found.clone())?;
        let tool = self
            .store
            .get_tool(&r.item_id)
            .ok_or(EngineError::NotFound(Entity::Tool, r.item_id))?;

        let guard = lock_before(tool, deadline).await?;
        let outstanding = guard
            .movements
            .get(&req.movement_id)
            .map(|m| m.outstanding())
            .ok_or(not_found)?;
        check_return(req.movement_id, req.quantity, outstanding)?;
        check_deadline(deadline)?;

        let event = Event::ToolReturned {
            movement_id: req.movement_id,
            tool_id: r.item_id,
            quantity: req.quantity,
            at: now_ms(),
        };
        let guard = self
            .commit(event, move |_, event| {
                let mut guard = guard;
                apply_to_tool(&mut guard, event);
                guard
            })
            .await?;
        debug!("returned {} to tool {}", req.quantity, r.item_id);
        guard
            .movements
            .get(&req.movement_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::ToolMovement, req.movement_id))
    }

    pub async fn return_supply(
        &self,
        req: ReturnRequest<Decimal>,
        deadline: Option<Instant>,
    ) -> Result<Movement<Decimal>, EngineError> {
        require_positive(req.quantity)?;
        validate_supply_amount(req.quantity)?;
        let not_found = EngineError::NotFound(Entity::SupplyMovement, req.movement_id);
        let r = self
            .store
            .resolve_movement(&req.movement_id)
            .filter(|r| r.kind == ItemKind::Supply)
            .ok_or_else(|| not_found.clone())?;
        let supply = self
            .store
            .get_supply(&r.item_id)
            .ok_or(EngineError::NotFound(Entity::Supply, r.item_id))?;

        let guard = lock_before(supply, deadline).await?;
        let outstanding = guard
            .movements
            .get(&req.movement_id)
            .map(|m| m.outstanding())
            .ok_or(not_found)?;
        check_return(req.movement_id, req.quantity, outstanding)?;
        check_deadline(deadline)?;

        let before = guard.state;
        let event = Event::SupplyReturned {
            movement_id: req.movement_id,
            supply_id: r.item_id,
            quantity: req.quantity,
            at: now_ms(),
        };
        let guard = self
            .commit(event, move |_, event| {
                let mut guard = guard;
                apply_to_supply(&mut guard, event);
                guard
            })
            .await?;
        if guard.state != before {
            info!(
                "supply {} restocked to {} by return",
                guard.id,
                guard.state.as_str()
            );
        }
        guard
            .movements
            .get(&req.movement_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::SupplyMovement, req.movement_id))
    }
}
