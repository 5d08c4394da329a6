use rust_decimal::Decimal;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Tool,
    Supply,
    Labor,
    ToolMovement,
    SupplyMovement,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Tool => "tool",
            Entity::Supply => "supply",
            Entity::Labor => "labor",
            Entity::ToolMovement => "tool movement",
            Entity::SupplyMovement => "supply movement",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Entity, Ulid),
    InvalidState {
        entity: Entity,
        id: Ulid,
        state: &'static str,
    },
    InsufficientStock {
        item_id: Ulid,
        requested: Decimal,
        available: Decimal,
    },
    ProgramMismatch {
        supply_program: Ulid,
        labor_program: Ulid,
    },
    ExcessReturn {
        movement_id: Ulid,
        requested: Decimal,
        outstanding: Decimal,
    },
    InvalidQuantity(String),
    DependencyUnavailable(String),
    DeadlineExceeded,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code, also used as the metrics status label.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::ProgramMismatch { .. } => "program_mismatch",
            EngineError::ExcessReturn { .. } => "excess_return",
            EngineError::InvalidQuantity(_) => "invalid_quantity",
            EngineError::DependencyUnavailable(_) => "dependency_unavailable",
            EngineError::DeadlineExceeded => "deadline_exceeded",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Only a failed read ahead of any mutation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::DependencyUnavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{} not found: {id}", entity.as_str()),
            EngineError::InvalidState { entity, id, state } => {
                write!(f, "{} {id} is {state}", entity.as_str())
            }
            EngineError::InsufficientStock {
                item_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient stock for {item_id}: requested {requested}, available {available}"
            ),
            EngineError::ProgramMismatch {
                supply_program,
                labor_program,
            } => write!(
                f,
                "supply belongs to program {supply_program}, labor belongs to program {labor_program}"
            ),
            EngineError::ExcessReturn {
                movement_id,
                requested,
                outstanding,
            } => write!(
                f,
                "cannot return {requested} against movement {movement_id}: outstanding is {outstanding}"
            ),
            EngineError::InvalidQuantity(msg) => write!(f, "invalid quantity: {msg}"),
            EngineError::DependencyUnavailable(msg) => write!(f, "dependency unavailable: {msg}"),
            EngineError::DeadlineExceeded => write!(f, "deadline exceeded before commit"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
