use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    ///
    /// Holds the catalog lock and a read lock on every item until the writer
    /// has swapped files, so no event can slip between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _sync = self.catalog_sync.lock().await;

        let mut events: Vec<Event> = self
            .store
            .labors()
            .snapshot()
            .into_iter()
            .map(|facts| Event::LaborSynced { facts })
            .collect();

        let mut tool_ids = self.store.tool_ids();
        tool_ids.sort();
        let mut tool_guards = Vec::with_capacity(tool_ids.len());
        for id in tool_ids {
            if let Some(tool) = self.store.get_tool(&id) {
                tool_guards.push(tool.read_owned().await);
            }
        }
        let mut supply_ids = self.store.supply_ids();
        supply_ids.sort();
        let mut supply_guards = Vec::with_capacity(supply_ids.len());
        for id in supply_ids {
            if let Some(supply) = self.store.get_supply(&id) {
                supply_guards.push(supply.read_owned().await);
            }
        }

        for tool in &tool_guards {
            events.push(Event::ToolSynced {
                id: tool.id,
                name: tool.name.clone(),
                category: tool.category.clone(),
                total: tool.total,
                state: tool.state,
            });
            for m in tool.movements.iter() {
                events.push(Event::ToolAllocated {
                    id: m.id,
                    labor_id: m.labor_id,
                    tool_id: tool.id,
                    quantity: m.quantity,
                    note: m.note.clone(),
                    at: m.created_at,
                });
                events.extend(m.returns.iter().map(|r| Event::ToolReturned {
                    movement_id: m.id,
                    tool_id: tool.id,
                    quantity: r.quantity,
                    at: r.at,
                }));
            }
        }
        for supply in &supply_guards {
            events.push(Event::SupplySynced {
                id: supply.id,
                name: supply.name.clone(),
                program_id: supply.program_id,
                unit: supply.unit.clone(),
                alert_threshold: supply.alert_threshold,
                total: supply.total,
                state: supply.state,
            });
            for m in supply.movements.iter() {
                events.push(Event::SupplyAllocated {
                    id: m.id,
                    labor_id: m.labor_id,
                    supply_id: supply.id,
                    quantity: m.quantity,
                    note: m.note.clone(),
                    at: m.created_at,
                });
                events.extend(m.returns.iter().map(|r| Event::SupplyReturned {
                    movement_id: m.id,
                    supply_id: supply.id,
                    quantity: r.quantity,
                    at: r.at,
                }));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
