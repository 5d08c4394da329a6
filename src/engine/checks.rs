use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, Entity};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Last gate before the commit point. Anything after it runs to completion.
pub(crate) fn check_deadline(deadline: Option<Instant>) -> Result<(), EngineError> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(EngineError::DeadlineExceeded),
        _ => Ok(()),
    }
}

/// Take an item's write lock, giving up at the deadline.
pub(crate) async fn lock_before<T>(
    lock: Arc<RwLock<T>>,
    deadline: Option<Instant>,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    match deadline {
        Some(d) => tokio::time::timeout_at(d, lock.write_owned())
            .await
            .map_err(|_| EngineError::DeadlineExceeded),
        None => Ok(lock.write_owned().await),
    }
}

pub(crate) fn require_positive<Q: Quantity>(quantity: Q) -> Result<(), EngineError> {
    if quantity.is_positive() {
        Ok(())
    } else {
        Err(EngineError::InvalidQuantity(format!(
            "quantity must be greater than zero, got {quantity}"
        )))
    }
}

/// Keep supply amounts inside the range where decimal arithmetic is exact.
pub(crate) fn validate_supply_amount(amount: Decimal) -> Result<(), EngineError> {
    if amount.normalize().scale() > MAX_DECIMAL_SCALE {
        return Err(EngineError::InvalidQuantity(format!(
            "{amount} has more than {MAX_DECIMAL_SCALE} decimal places"
        )));
    }
    if amount.abs() > Decimal::from(MAX_SUPPLY_QUANTITY) {
        return Err(EngineError::LimitExceeded("supply quantity too large"));
    }
    Ok(())
}

pub(crate) fn validate_note(note: &Option<String>) -> Result<(), EngineError> {
    match note {
        Some(n) if n.len() > MAX_NOTE_LEN => Err(EngineError::LimitExceeded("note too long")),
        _ => Ok(()),
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn check_labor_accepts(labor: &LaborFacts) -> Result<(), EngineError> {
    if labor.state.accepts_allocations() {
        Ok(())
    } else {
        Err(EngineError::InvalidState {
            entity: Entity::Labor,
            id: labor.id,
            state: labor.state.as_str(),
        })
    }
}

pub(crate) fn check_stock<Q: Quantity>(
    item_id: Ulid,
    requested: Q,
    available: Q,
) -> Result<(), EngineError> {
    if requested > available {
        return Err(EngineError::InsufficientStock {
            item_id,
            requested: requested.to_decimal(),
            available: available.to_decimal(),
        });
    }
    Ok(())
}

pub(crate) fn check_return<Q: Quantity>(
    movement_id: Ulid,
    requested: Q,
    outstanding: Q,
) -> Result<(), EngineError> {
    if requested > outstanding {
        return Err(EngineError::ExcessReturn {
            movement_id,
            requested: requested.to_decimal(),
            outstanding: outstanding.to_decimal(),
        });
    }
    Ok(())
}

pub(crate) fn check_movement_room<Q: Quantity>(log: &MovementLog<Q>) -> Result<(), EngineError> {
    if log.len() >= MAX_MOVEMENTS_PER_ITEM {
        return Err(EngineError::LimitExceeded("too many movements on item"));
    }
    Ok(())
}
