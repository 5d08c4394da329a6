use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::time::Instant;
use ulid::Ulid;

use super::*;
use crate::directory::{DirectoryError, LaborDirectory, LaborTable};
use crate::model::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("fieldledger_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn labor(program_id: Ulid, state: LaborState) -> LaborFacts {
    LaborFacts {
        id: Ulid::new(),
        lot_id: Ulid::new(),
        program_id,
        state,
    }
}

async fn tool_pool(engine: &Engine, total: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .sync_tool(ToolSpec {
            id,
            name: "Backpack sprayer".into(),
            category: Some("spraying".into()),
            total_quantity: total,
            state: ToolState::Available,
        })
        .await
        .unwrap();
    id
}

async fn supply_pool(engine: &Engine, program_id: Ulid, total: &str, threshold: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .sync_supply(SupplySpec {
            id,
            name: "NPK 15-15-15".into(),
            program_id,
            unit_of_measure: "kg".into(),
            alert_threshold: dec(threshold),
            total_quantity: dec(total),
            state: SupplyState::Available,
        })
        .await
        .unwrap();
    id
}

async fn active_labor(engine: &Engine, program_id: Ulid) -> Ulid {
    let facts = labor(program_id, LaborState::InProgress);
    engine.sync_labor(facts.clone()).await.unwrap();
    facts.id
}

fn take_tool(labor_id: Ulid, tool_id: Ulid, quantity: u32) -> ToolAllocation {
    ToolAllocation {
        labor_id,
        tool_id,
        quantity,
        note: None,
    }
}

fn take_supply(labor_id: Ulid, supply_id: Ulid, quantity: &str) -> SupplyAllocation {
    SupplyAllocation {
        labor_id,
        supply_id,
        quantity: dec(quantity),
        note: None,
    }
}

async fn tool_available(engine: &Engine, id: Ulid) -> u32 {
    engine.get_tool(id).await.unwrap().available_quantity
}

// ── Allocation and return ────────────────────────────────

#[tokio::test]
async fn tool_pool_walkthrough() {
    let engine = Arc::new(Engine::new(test_wal_path("tool_walkthrough.wal")).unwrap());
    let tool = tool_pool(&engine, 5).await;
    let labor = active_labor(&engine, Ulid::new()).await;

    let first = engine.allocate_tool(take_tool(labor, tool, 3), None).await.unwrap();
    assert_eq!(first.outstanding(), 3);
    assert_eq!(tool_available(&engine, tool).await, 2);

    let (a, b) = tokio::join!(
        engine.allocate_tool(take_tool(labor, tool, 2), None),
        engine.allocate_tool(take_tool(labor, tool, 2), None),
    );
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
    let err = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert_eq!(
        err,
        EngineError::InsufficientStock {
            item_id: tool,
            requested: dec("2"),
            available: Decimal::ZERO,
        }
    );
    assert_eq!(tool_available(&engine, tool).await, 0);

    let returned = engine
        .return_tool(
            ReturnRequest {
                movement_id: first.id,
                quantity: 3,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(returned.outstanding(), 0);
    assert_eq!(returned.phase(), MovementPhase::Closed);
    assert_eq!(tool_available(&engine, tool).await, 3);
    assert!(engine.verify_conservation().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_allocators_never_oversubscribe() {
    let engine = Arc::new(Engine::new(test_wal_path("race.wal")).unwrap());
    let tool = tool_pool(&engine, 7).await;
    let labor = active_labor(&engine, Ulid::new()).await;

    let mut handles = Vec::new();
    for _ in 0..64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.allocate_tool(take_tool(labor, tool, 1), None).await
        }));
    }
    let mut granted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => granted += 1,
            Err(EngineError::InsufficientStock { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(granted, 7);
    assert_eq!(tool_available(&engine, tool).await, 0);
    assert!(engine.verify_conservation().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_supply_draws_stay_within_pool() {
    let engine = Arc::new(Engine::new(test_wal_path("supply_race.wal")).unwrap());
    let program = Ulid::new();
    let supply = supply_pool(&engine, program, "10", "2").await;
    let labor = active_labor(&engine, program).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.allocate_supply(take_supply(labor, supply, "1.5"), None).await
        }));
    }
    let mut granted = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            granted += 1;
        }
    }
    assert_eq!(granted, 6);
    let info = engine.get_supply(supply).await.unwrap();
    assert_eq!(info.available_quantity, dec("1.0"));
    assert_eq!(info.state, SupplyState::LowStock);
    assert!(engine.verify_conservation().await.is_empty());
}

#[tokio::test]
async fn excess_return_changes_nothing() {
    let engine = Engine::new(test_wal_path("excess_return.wal")).unwrap();
    let tool = tool_pool(&engine, 4).await;
    let labor = active_labor(&engine, Ulid::new()).await;
    let m = engine.allocate_tool(take_tool(labor, tool, 2), None).await.unwrap();

    let err = engine
        .return_tool(
            ReturnRequest {
                movement_id: m.id,
                quantity: 3,
            },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::ExcessReturn {
            movement_id: m.id,
            requested: dec("3"),
            outstanding: dec("2"),
        }
    );
    assert_eq!(tool_available(&engine, tool).await, 2);
    let view = engine.tool_movement(m.id).await.unwrap();
    assert_eq!(view.returned, Decimal::ZERO);
    assert_eq!(view.phase, MovementPhase::Open);
}

#[tokio::test]
async fn outstanding_aggregates_partial_returns() {
    let engine = Engine::new(test_wal_path("aggregate.wal")).unwrap();
    let program = Ulid::new();
    let supply = supply_pool(&engine, program, "100", "5").await;
    let tool = tool_pool(&engine, 20).await;
    let labor = active_labor(&engine, program).await;

    let m = engine
        .allocate_supply(take_supply(labor, supply, "10"), None)
        .await
        .unwrap();
    for qty in ["3", "2"] {
        engine
            .return_supply(
                ReturnRequest {
                    movement_id: m.id,
                    quantity: dec(qty),
                },
                None,
            )
            .await
            .unwrap();
    }
    let t = engine.allocate_tool(take_tool(labor, tool, 4), None).await.unwrap();
    engine
        .return_tool(
            ReturnRequest {
                movement_id: t.id,
                quantity: 4,
            },
            None,
        )
        .await
        .unwrap();

    let view = engine.outstanding_for_labor(labor).await;
    assert_eq!(
        view,
        vec![OutstandingItem {
            item_id: supply,
            item_type: ItemKind::Supply,
            outstanding: dec("5"),
        }]
    );
    assert!(engine.outstanding_for_labor(Ulid::new()).await.is_empty());
}

#[tokio::test]
async fn outstanding_sums_movements_per_item() {
    let engine = Engine::new(test_wal_path("sum_per_item.wal")).unwrap();
    let tool = tool_pool(&engine, 10).await;
    let labor = active_labor(&engine, Ulid::new()).await;
    engine.allocate_tool(take_tool(labor, tool, 2), None).await.unwrap();
    engine.allocate_tool(take_tool(labor, tool, 3), None).await.unwrap();

    let view = engine.outstanding_for_labor(labor).await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].outstanding, dec("5"));
    assert_eq!(view[0].item_type, ItemKind::Tool);
}

// ── Gates ────────────────────────────────────────────────

#[tokio::test]
async fn program_mismatch_names_both_programs() {
    let engine = Engine::new(test_wal_path("program_mismatch.wal")).unwrap();
    let program_a = Ulid::new();
    let program_b = Ulid::new();
    let supply = supply_pool(&engine, program_a, "50", "5").await;
    let labor = active_labor(&engine, program_b).await;

    let err = engine
        .allocate_supply(take_supply(labor, supply, "1"), None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::ProgramMismatch {
            supply_program: program_a,
            labor_program: program_b,
        }
    );
    assert_eq!(engine.get_supply(supply).await.unwrap().available_quantity, dec("50"));
}

#[tokio::test]
async fn labor_moved_to_another_program_is_rechecked() {
    let engine = Engine::new(test_wal_path("labor_moves.wal")).unwrap();
    let program = Ulid::new();
    let supply = supply_pool(&engine, program, "50", "0").await;
    let mut facts = labor(program, LaborState::Pending);
    engine.sync_labor(facts.clone()).await.unwrap();
    engine
        .allocate_supply(take_supply(facts.id, supply, "1"), None)
        .await
        .unwrap();

    facts.program_id = Ulid::new();
    engine.sync_labor(facts.clone()).await.unwrap();
    assert!(matches!(
        engine.allocate_supply(take_supply(facts.id, supply, "1"), None).await,
        Err(EngineError::ProgramMismatch { .. })
    ));
}

#[tokio::test]
async fn retired_tool_and_closed_labor_are_rejected() {
    let engine = Engine::new(test_wal_path("invalid_state.wal")).unwrap();
    let tool = tool_pool(&engine, 3).await;
    let program = Ulid::new();
    let done = labor(program, LaborState::Completed);
    engine.sync_labor(done.clone()).await.unwrap();

    assert_eq!(
        engine.allocate_tool(take_tool(done.id, tool, 1), None).await,
        Err(EngineError::InvalidState {
            entity: Entity::Labor,
            id: done.id,
            state: "completed",
        })
    );

    let labor_id = active_labor(&engine, program).await;
    let m = engine.allocate_tool(take_tool(labor_id, tool, 1), None).await.unwrap();
    engine
        .sync_tool(ToolSpec {
            id: tool,
            name: "Backpack sprayer".into(),
            category: None,
            total_quantity: 3,
            state: ToolState::Retired,
        })
        .await
        .unwrap();
    assert!(matches!(
        engine.allocate_tool(take_tool(labor_id, tool, 1), None).await,
        Err(EngineError::InvalidState {
            entity: Entity::Tool,
            ..
        })
    ));
    // returns still go through on a retired pool
    engine
        .return_tool(
            ReturnRequest {
                movement_id: m.id,
                quantity: 1,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(tool_available(&engine, tool).await, 3);
}

#[tokio::test]
async fn expired_supply_blocks_allocation() {
    let engine = Engine::new(test_wal_path("expired_supply.wal")).unwrap();
    let program = Ulid::new();
    let supply = supply_pool(&engine, program, "10", "1").await;
    let labor_id = active_labor(&engine, program).await;
    engine
        .sync_supply(SupplySpec {
            id: supply,
            name: "NPK 15-15-15".into(),
            program_id: program,
            unit_of_measure: "kg".into(),
            alert_threshold: dec("1"),
            total_quantity: dec("10"),
            state: SupplyState::Expired,
        })
        .await
        .unwrap();
    assert!(matches!(
        engine.allocate_supply(take_supply(labor_id, supply, "1"), None).await,
        Err(EngineError::InvalidState {
            entity: Entity::Supply,
            state: "expired",
            ..
        })
    ));
}

#[tokio::test]
async fn supply_states_follow_stock() {
    let engine = Engine::new(test_wal_path("supply_states.wal")).unwrap();
    let program = Ulid::new();
    let supply = supply_pool(&engine, program, "10", "4").await;
    let labor_id = active_labor(&engine, program).await;

    let m = engine
        .allocate_supply(take_supply(labor_id, supply, "7"), None)
        .await
        .unwrap();
    assert_eq!(engine.get_supply(supply).await.unwrap().state, SupplyState::LowStock);

    engine
        .allocate_supply(take_supply(labor_id, supply, "3"), None)
        .await
        .unwrap();
    let info = engine.get_supply(supply).await.unwrap();
    assert_eq!(info.state, SupplyState::Depleted);
    assert_eq!(info.available_quantity, Decimal::ZERO);

    engine
        .return_supply(
            ReturnRequest {
                movement_id: m.id,
                quantity: dec("4"),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(engine.get_supply(supply).await.unwrap().state, SupplyState::Available);
}

#[tokio::test]
async fn bad_quantities_and_unknown_ids() {
    let engine = Engine::new(test_wal_path("not_found.wal")).unwrap();
    let tool = tool_pool(&engine, 2).await;
    let labor_id = active_labor(&engine, Ulid::new()).await;

    assert!(matches!(
        engine.allocate_tool(take_tool(labor_id, tool, 0), None).await,
        Err(EngineError::InvalidQuantity(_))
    ));
    assert!(matches!(
        engine
            .allocate_supply(take_supply(labor_id, Ulid::new(), "-1"), None)
            .await,
        Err(EngineError::InvalidQuantity(_))
    ));

    let ghost = Ulid::new();
    assert_eq!(
        engine.allocate_tool(take_tool(labor_id, ghost, 1), None).await,
        Err(EngineError::NotFound(Entity::Tool, ghost))
    );
    assert_eq!(
        engine.allocate_tool(take_tool(ghost, tool, 1), None).await,
        Err(EngineError::NotFound(Entity::Labor, ghost))
    );

    // a tool movement id is not a supply movement
    let m = engine.allocate_tool(take_tool(labor_id, tool, 1), None).await.unwrap();
    assert_eq!(
        engine
            .return_supply(
                ReturnRequest {
                    movement_id: m.id,
                    quantity: dec("1"),
                },
                None,
            )
            .await,
        Err(EngineError::NotFound(Entity::SupplyMovement, m.id))
    );
    assert_eq!(
        engine.supply_movement(m.id).await,
        Err(EngineError::NotFound(Entity::SupplyMovement, m.id))
    );
}

// ── Catalog sync ─────────────────────────────────────────

#[tokio::test]
async fn resync_shifts_available_and_guards_outstanding() {
    let engine = Engine::new(test_wal_path("resync.wal")).unwrap();
    let program = Ulid::new();
    let supply = supply_pool(&engine, program, "20", "5").await;
    let labor_id = active_labor(&engine, program).await;
    engine
        .allocate_supply(take_supply(labor_id, supply, "8"), None)
        .await
        .unwrap();

    let spec = |total: &str, program_id: Ulid| SupplySpec {
        id: supply,
        name: "NPK 15-15-15".into(),
        program_id,
        unit_of_measure: "kg".into(),
        alert_threshold: dec("5"),
        total_quantity: dec(total),
        state: SupplyState::Available,
    };

    let info = engine.sync_supply(spec("30", program)).await.unwrap();
    assert_eq!(info.available_quantity, dec("22"));

    assert!(matches!(
        engine.sync_supply(spec("7", program)).await,
        Err(EngineError::InvalidQuantity(_))
    ));
    assert!(matches!(
        engine.sync_supply(spec("30", Ulid::new())).await,
        Err(EngineError::InvalidState { .. })
    ));

    let info = engine.sync_supply(spec("10", program)).await.unwrap();
    assert_eq!(info.available_quantity, dec("2"));
    assert_eq!(info.state, SupplyState::LowStock);
    assert!(engine.verify_conservation().await.is_empty());
}

#[tokio::test]
async fn supply_amounts_outside_exact_range_are_refused() {
    let engine = Engine::new(test_wal_path("supply_range.wal")).unwrap();
    let program = Ulid::new();
    let huge = engine
        .sync_supply(SupplySpec {
            id: Ulid::new(),
            name: "Lime".into(),
            program_id: program,
            unit_of_measure: "kg".into(),
            alert_threshold: Decimal::ZERO,
            total_quantity: dec("10000000000000000000000000000"),
            state: SupplyState::Available,
        })
        .await;
    assert!(matches!(huge, Err(EngineError::LimitExceeded(_))));

    let supply = supply_pool(&engine, program, "100", "1").await;
    let labor_id = active_labor(&engine, program).await;
    assert!(matches!(
        engine
            .allocate_supply(take_supply(labor_id, supply, "0.0000001"), None)
            .await,
        Err(EngineError::InvalidQuantity(_))
    ));

    let m = engine
        .allocate_supply(take_supply(labor_id, supply, "1.5"), None)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .return_supply(
                ReturnRequest {
                    movement_id: m.id,
                    quantity: dec("0.0000001"),
                },
                None,
            )
            .await,
        Err(EngineError::InvalidQuantity(_))
    ));

    assert_eq!(
        engine.get_supply(supply).await.unwrap().available_quantity,
        dec("98.5")
    );
    assert!(engine.verify_conservation().await.is_empty());
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn movement_listing_and_summary() {
    let engine = Engine::new(test_wal_path("listing.wal")).unwrap();
    let program = Ulid::new();
    let tool = tool_pool(&engine, 10).await;
    let supply = supply_pool(&engine, program, "10", "1").await;
    let labor_a = active_labor(&engine, program).await;
    let labor_b = active_labor(&engine, program).await;

    let first = engine.allocate_tool(take_tool(labor_a, tool, 1), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3)).await;
    let second = engine
        .allocate_supply(take_supply(labor_a, supply, "2.5"), None)
        .await
        .unwrap();
    engine.allocate_tool(take_tool(labor_b, tool, 2), None).await.unwrap();

    let for_a = engine
        .list_movements(&MovementFilter {
            labor_id: Some(labor_a),
            ..Default::default()
        })
        .await;
    assert_eq!(
        for_a.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![second.id, first.id]
    );

    let tools_only = engine
        .list_movements(&MovementFilter {
            kind: Some(ItemKind::Tool),
            ..Default::default()
        })
        .await;
    assert_eq!(tools_only.len(), 2);

    let for_item = engine
        .list_movements(&MovementFilter {
            item_id: Some(supply),
            ..Default::default()
        })
        .await;
    assert_eq!(for_item.len(), 1);
    assert_eq!(for_item[0].quantity, dec("2.5"));

    let page = |offset, limit| MovementFilter {
        labor_id: Some(labor_a),
        offset,
        limit,
        ..Default::default()
    };
    let ids = |list: Vec<MovementInfo>| list.iter().map(|m| m.id).collect::<Vec<_>>();
    assert_eq!(ids(engine.list_movements(&page(0, Some(1))).await), vec![second.id]);
    assert_eq!(ids(engine.list_movements(&page(1, Some(1))).await), vec![first.id]);
    assert!(engine.list_movements(&page(2, None)).await.is_empty());

    let summary = engine.movement_summary(0).await;
    assert_eq!(summary.tools.movements, 2);
    assert_eq!(summary.tools.outstanding, dec("3"));
    assert_eq!(summary.supplies.checked_out, dec("2.5"));
    let future = engine.movement_summary(i64::MAX).await;
    assert_eq!(future.tools.movements + future.supplies.movements, 0);
}

#[tokio::test]
async fn summary_counts_returns_when_they_happen() {
    let engine = Engine::new(test_wal_path("summary_returns.wal")).unwrap();
    let tool = tool_pool(&engine, 10).await;
    let labor_id = active_labor(&engine, Ulid::new()).await;
    let m = engine.allocate_tool(take_tool(labor_id, tool, 4), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mark = super::checks::now_ms();
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine
        .return_tool(
            ReturnRequest {
                movement_id: m.id,
                quantity: 3,
            },
            None,
        )
        .await
        .unwrap();

    let recent = engine.movement_summary(mark).await;
    assert_eq!(recent.tools.movements, 0);
    assert_eq!(recent.tools.checked_out, Decimal::ZERO);
    assert_eq!(recent.tools.returns, 1);
    assert_eq!(recent.tools.returned, dec("3"));

    let all = engine.movement_summary(0).await;
    assert_eq!(all.tools.movements, 1);
    assert_eq!(all.tools.checked_out, dec("4"));
    assert_eq!(all.tools.outstanding, dec("1"));
}

// ── Directory failures and deadlines ─────────────────────

struct FlakyDirectory {
    failures_left: AtomicU32,
    calls: AtomicU32,
    table: LaborTable,
}

impl FlakyDirectory {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            table: LaborTable::new(),
        }
    }
}

#[async_trait]
impl LaborDirectory for FlakyDirectory {
    async fn labor(&self, id: Ulid) -> Result<LaborFacts, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(DirectoryError::Unavailable("labor service timed out".into()));
        }
        self.table.labor(id).await
    }
}

fn flaky_engine(name: &str, directory: Arc<FlakyDirectory>) -> Engine {
    Engine::open(
        test_wal_path(name),
        EngineOptions {
            lookup_retries: 2,
            lookup_backoff: Duration::from_millis(1),
            directory: Some(directory),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn directory_hiccups_are_retried() {
    let directory = Arc::new(FlakyDirectory::new(2));
    let engine = flaky_engine("flaky_recovers.wal", directory.clone());
    let program = Ulid::new();
    let facts = labor(program, LaborState::Pending);
    directory.table.upsert(facts.clone());
    let supply = supply_pool(&engine, program, "5", "1").await;

    engine
        .allocate_supply(take_supply(facts.id, supply, "1"), None)
        .await
        .unwrap();
    assert_eq!(directory.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn persistent_directory_outage_surfaces_without_mutation() {
    let directory = Arc::new(FlakyDirectory::new(10));
    let engine = flaky_engine("flaky_fails.wal", directory.clone());
    let program = Ulid::new();
    let facts = labor(program, LaborState::Pending);
    directory.table.upsert(facts.clone());
    let supply = supply_pool(&engine, program, "5", "1").await;

    let err = engine
        .allocate_supply(take_supply(facts.id, supply, "1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DependencyUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(directory.calls.load(Ordering::SeqCst), 3);
    let info = engine.get_supply(supply).await.unwrap();
    assert_eq!(info.available_quantity, dec("5"));
    assert_eq!(info.movement_count, 0);
}

#[tokio::test]
async fn deadline_while_waiting_for_item_leaves_no_trace() {
    let engine = Engine::new(test_wal_path("deadline.wal")).unwrap();
    let tool = tool_pool(&engine, 5).await;
    let labor_id = active_labor(&engine, Ulid::new()).await;

    let held = engine.store().get_tool(&tool).unwrap().write_owned().await;
    let deadline = Instant::now() + Duration::from_millis(30);
    assert_eq!(
        engine.allocate_tool(take_tool(labor_id, tool, 1), Some(deadline)).await,
        Err(EngineError::DeadlineExceeded)
    );
    drop(held);

    let already_passed = Instant::now() - Duration::from_millis(1);
    assert_eq!(
        engine
            .allocate_tool(take_tool(labor_id, tool, 1), Some(already_passed))
            .await,
        Err(EngineError::DeadlineExceeded)
    );
    let info = engine.get_tool(tool).await.unwrap();
    assert_eq!(info.available_quantity, 5);
    assert_eq!(info.movement_count, 0);
    assert!(engine.outstanding_for_labor(labor_id).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_item_does_not_hold_up_others() {
    let engine = Arc::new(Engine::new(test_wal_path("independent_items.wal")).unwrap());
    let busy = tool_pool(&engine, 5).await;
    let idle = tool_pool(&engine, 5).await;
    let labor_id = active_labor(&engine, Ulid::new()).await;

    let held = engine.store().get_tool(&busy).unwrap().write_owned().await;
    let waiting = {
        let e = engine.clone();
        tokio::spawn(async move { e.allocate_tool(take_tool(labor_id, busy, 1), None).await })
    };

    let deadline = Instant::now() + Duration::from_millis(500);
    let m = engine
        .allocate_tool(take_tool(labor_id, idle, 2), Some(deadline))
        .await
        .unwrap();
    assert_eq!(m.outstanding(), 2);
    assert!(!waiting.is_finished());

    drop(held);
    waiting.await.unwrap().unwrap();
    assert_eq!(tool_available(&engine, busy).await, 4);
    assert_eq!(tool_available(&engine, idle).await, 3);
}

#[tokio::test]
async fn dropped_caller_still_commits_whole_transition() {
    let engine = Arc::new(Engine::new(test_wal_path("dropped_caller.wal")).unwrap());
    let tool = tool_pool(&engine, 50).await;
    let labor_id = active_labor(&engine, Ulid::new()).await;

    for _ in 0..20 {
        let e = engine.clone();
        let task = tokio::spawn(async move {
            e.allocate_tool(take_tool(labor_id, tool, 1), None).await
        });
        tokio::task::yield_now().await;
        task.abort();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // each aborted call either did nothing or finished entirely
    assert!(engine.verify_conservation().await.is_empty());
    let info = engine.get_tool(tool).await.unwrap();
    let held: Decimal = engine
        .outstanding_for_labor(labor_id)
        .await
        .iter()
        .map(|o| o.outstanding)
        .sum();
    assert_eq!(Decimal::from(50 - info.available_quantity), held);
    assert_eq!(info.movement_count as u32, 50 - info.available_quantity);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_rebuilds_counters() {
    let path = test_wal_path("replay.wal");
    let program = Ulid::new();
    let (tool, supply, labor_id, movement) = {
        let engine = Engine::new(path.clone()).unwrap();
        let tool = tool_pool(&engine, 6).await;
        let supply = supply_pool(&engine, program, "12.5", "3").await;
        let labor_id = active_labor(&engine, program).await;
        let t = engine.allocate_tool(take_tool(labor_id, tool, 4), None).await.unwrap();
        engine
            .return_tool(
                ReturnRequest {
                    movement_id: t.id,
                    quantity: 1,
                },
                None,
            )
            .await
            .unwrap();
        engine
            .allocate_supply(take_supply(labor_id, supply, "10"), None)
            .await
            .unwrap();
        (tool, supply, labor_id, t.id)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(tool_available(&engine, tool).await, 3);
    let s = engine.get_supply(supply).await.unwrap();
    assert_eq!(s.available_quantity, dec("2.5"));
    assert_eq!(s.state, SupplyState::LowStock);
    let m = engine.tool_movement(movement).await.unwrap();
    assert_eq!(m.outstanding, dec("3"));
    assert_eq!(m.phase, MovementPhase::PartiallyReturned);
    assert_eq!(engine.outstanding_for_labor(labor_id).await.len(), 2);

    // labor facts came back too, so allocation still works
    engine.allocate_tool(take_tool(labor_id, tool, 3), None).await.unwrap();
    assert!(engine.verify_conservation().await.is_empty());
}

#[tokio::test]
async fn torn_tail_is_cut_before_new_appends() {
    let path = test_wal_path("torn_restart.wal");
    let tool = {
        let engine = Engine::new(path.clone()).unwrap();
        tool_pool(&engine, 10).await
    };
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
    }

    let (labor_id, movement) = {
        let engine = Engine::new(path.clone()).unwrap();
        assert_eq!(tool_available(&engine, tool).await, 10);
        let labor_id = active_labor(&engine, Ulid::new()).await;
        let m = engine.allocate_tool(take_tool(labor_id, tool, 4), None).await.unwrap();
        assert_eq!(tool_available(&engine, tool).await, 6);
        (labor_id, m.id)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(tool_available(&engine, tool).await, 6);
    assert_eq!(engine.tool_movement(movement).await.unwrap().outstanding, dec("4"));
    assert_eq!(engine.outstanding_for_labor(labor_id).await.len(), 1);
    assert!(engine.verify_conservation().await.is_empty());
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let program = Ulid::new();
    let (tool, supply, labor_id) = {
        let engine = Engine::new(path.clone()).unwrap();
        let tool = tool_pool(&engine, 10).await;
        let supply = supply_pool(&engine, program, "8", "2").await;
        let labor_id = active_labor(&engine, program).await;
        for _ in 0..5 {
            let m = engine.allocate_tool(take_tool(labor_id, tool, 2), None).await.unwrap();
            engine
                .return_tool(
                    ReturnRequest {
                        movement_id: m.id,
                        quantity: 1,
                    },
                    None,
                )
                .await
                .unwrap();
        }
        engine
            .allocate_supply(take_supply(labor_id, supply, "7.25"), None)
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await >= 13);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (tool, supply, labor_id)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(tool_available(&engine, tool).await, 5);
    let s = engine.get_supply(supply).await.unwrap();
    assert_eq!(s.available_quantity, dec("0.75"));
    assert_eq!(s.state, SupplyState::LowStock);
    let view = engine.outstanding_for_labor(labor_id).await;
    assert_eq!(view.len(), 2);
    assert!(engine.verify_conservation().await.is_empty());
}
