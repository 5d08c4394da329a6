use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::checks::{validate_name, validate_supply_amount};
use super::store::{apply_to_supply, apply_to_tool, supply_from_event, tool_from_event};
use super::{Engine, EngineError, Entity};

/// A tool pool as the catalog describes it.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    pub total_quantity: u32,
    #[serde(default)]
    pub state: ToolState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupplySpec {
    pub id: Ulid,
    pub name: String,
    pub program_id: Ulid,
    pub unit_of_measure: String,
    #[serde(default)]
    pub alert_threshold: Decimal,
    pub total_quantity: Decimal,
    #[serde(default)]
    pub state: SupplyState,
}

impl Engine {
    /// Create or update a tool pool. Checked-out units stay checked out, so a
    /// new total may not drop below what is outstanding.
    pub async fn sync_tool(&self, spec: ToolSpec) -> Result<ToolInfo, EngineError> {
        validate_name(&spec.name)?;
        if let Some(c) = &spec.category {
            validate_name(c)?;
        }
        let _sync = self.catalog_sync.lock().await;

        let event = Event::ToolSynced {
            id: spec.id,
            name: spec.name,
            category: spec.category,
            total: spec.total_quantity,
            state: spec.state,
        };
        match self.store.get_tool(&spec.id) {
            Some(tool) => {
                let guard = tool.write_owned().await;
                let outstanding = guard.total - guard.available;
                if spec.total_quantity < outstanding {
                    return Err(EngineError::InvalidQuantity(format!(
                        "total {} is below the {outstanding} units checked out",
                        spec.total_quantity
                    )));
                }
                self.commit(event, move |_, event| {
                    let mut guard = guard;
                    apply_to_tool(&mut guard, event);
                    guard.info()
                })
                .await
            }
            None => {
                if self.store.item_count() >= MAX_ITEMS {
                    return Err(EngineError::LimitExceeded("too many catalog items"));
                }
                let info = self
                    .commit(event, |store, event| {
                        let rec = tool_from_event(event)?;
                        let info = rec.info();
                        store.insert_tool(rec);
                        Some(info)
                    })
                    .await?
                    .ok_or(EngineError::NotFound(Entity::Tool, spec.id))?;
                info!("registered tool {} ({} units)", info.id, info.total_quantity);
                Ok(info)
            }
        }
    }

    /// Create or update a supply pool. Its program is fixed while any of it is checked out.
    pub async fn sync_supply(&self, spec: SupplySpec) -> Result<SupplyInfo, EngineError> {
        validate_name(&spec.name)?;
        if spec.unit_of_measure.len() > MAX_UNIT_LEN {
            return Err(EngineError::LimitExceeded("unit of measure too long"));
        }
        if spec.total_quantity < Decimal::ZERO || spec.alert_threshold < Decimal::ZERO {
            return Err(EngineError::InvalidQuantity(
                "totals and thresholds cannot be negative".into(),
            ));
        }
        validate_supply_amount(spec.total_quantity)?;
        validate_supply_amount(spec.alert_threshold)?;
        let _sync = self.catalog_sync.lock().await;

        let event = Event::SupplySynced {
            id: spec.id,
            name: spec.name,
            program_id: spec.program_id,
            unit: spec.unit_of_measure,
            alert_threshold: spec.alert_threshold,
            total: spec.total_quantity,
            state: spec.state,
        };
        match self.store.get_supply(&spec.id) {
            Some(supply) => {
                let guard = supply.write_owned().await;
                let outstanding = guard.total - guard.available;
                if spec.total_quantity < outstanding {
                    return Err(EngineError::InvalidQuantity(format!(
                        "total {} is below the {outstanding} checked out",
                        spec.total_quantity
                    )));
                }
                if spec.program_id != guard.program_id && !outstanding.is_zero() {
                    return Err(EngineError::InvalidState {
                        entity: Entity::Supply,
                        id: spec.id,
                        state: "holding outstanding movements",
                    });
                }
                self.commit(event, move |_, event| {
                    let mut guard = guard;
                    apply_to_supply(&mut guard, event);
                    guard.info()
                })
                .await
            }
            None => {
                if self.store.item_count() >= MAX_ITEMS {
                    return Err(EngineError::LimitExceeded("too many catalog items"));
                }
                let info = self
                    .commit(event, |store, event| {
                        let rec = supply_from_event(event)?;
                        let info = rec.info();
                        store.insert_supply(rec);
                        Some(info)
                    })
                    .await?
                    .ok_or(EngineError::NotFound(Entity::Supply, spec.id))?;
                info!(
                    "registered supply {} ({} {}, program {})",
                    info.id, info.total_quantity, info.unit_of_measure, info.program_id
                );
                Ok(info)
            }
        }
    }

    /// Record a labor's current state and program. Later allocations see the
    /// new facts; existing movements are untouched.
    pub async fn sync_labor(&self, facts: LaborFacts) -> Result<LaborFacts, EngineError> {
        let _sync = self.catalog_sync.lock().await;
        let labors = self.store.labors();
        if !labors.contains(&facts.id) && labors.len() >= MAX_LABORS {
            return Err(EngineError::LimitExceeded("too many labors"));
        }
        self.commit(Event::LaborSynced { facts: facts.clone() }, |_, _| ())
            .await?;
        Ok(facts)
    }
}
