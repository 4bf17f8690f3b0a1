#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};

use tenantry::clock::FixedClock;
use tenantry::config::EngineConfig;
use tenantry::entity::{EntityDef, EntityRegistry};
use tenantry::query::SortDirection;
use tenantry::store::memory::MemoryStore;
use tenantry::workflow::{Effect, WorkflowDef};
use tenantry::Engine;

/// Clinic + logistics flavored registry exercising every engine feature.
pub fn registry() -> EntityRegistry {
    EntityRegistry::new()
        .register(
            EntityDef::new("appointments")
                .default_sort("starts_at", SortDirection::Asc)
                .sortable(&["starts_at"])
                .searchable(&["patient_name", "notes"])
                .mutable(&["patient_name", "notes", "starts_at"])
                .with_workflow(
                    WorkflowDef::new("scheduled")
                        .allow("scheduled", "confirmed")
                        .allow_with(
                            "scheduled",
                            "cancelled",
                            vec![
                                Effect::StampOnce("cancelled_at"),
                                Effect::SetFromContext { key: "reason", field: "cancellation_reason" },
                            ],
                        )
                        .allow_with(
                            "confirmed",
                            "cancelled",
                            vec![
                                Effect::StampOnce("cancelled_at"),
                                Effect::SetFromContext { key: "reason", field: "cancellation_reason" },
                            ],
                        )
                        .allow("scheduled", "no_show")
                        .allow_with("confirmed", "completed", vec![Effect::StampOnce("completed_at")]),
                ),
        )
        .register(
            EntityDef::new("deliveries")
                .default_sort("created_at", SortDirection::Asc)
                .mutable(&["recipient", "address"])
                .with_workflow(
                    WorkflowDef::new("pending")
                        .allow("pending", "confirmed")
                        .allow_with(
                            "pending",
                            "cancelled",
                            vec![
                                Effect::StampOnce("cancelled_at"),
                                Effect::ReleaseRelated {
                                    entity: "couriers",
                                    link_field: "courier_id",
                                    status: "available",
                                },
                            ],
                        )
                        .allow("confirmed", "out_for_delivery")
                        .allow_with(
                            "out_for_delivery",
                            "delivery_attempted",
                            vec![Effect::StampOnce("first_attempt_at")],
                        )
                        .allow("delivery_attempted", "out_for_delivery")
                        .allow_with(
                            "out_for_delivery",
                            "delivered",
                            vec![
                                Effect::StampOnce("delivered_at"),
                                Effect::ReleaseRelated {
                                    entity: "couriers",
                                    link_field: "courier_id",
                                    status: "available",
                                },
                            ],
                        ),
                ),
        )
        .register(
            EntityDef::new("couriers")
                .mutable(&["name"])
                .with_workflow(
                    WorkflowDef::new("available")
                        .allow("available", "assigned")
                        .allow("assigned", "available"),
                ),
        )
        .register(
            EntityDef::new("bills")
                .default_sort("due_date", SortDirection::Asc)
                .sortable(&["due_date", "amount"])
                .searchable(&["payee"])
                .mutable(&["payee", "amount", "due_date", "biller_id"]),
        )
        .register(EntityDef::new("billers").searchable(&["name"]).mutable(&["name"]))
        .register(EntityDef::new("contacts").searchable(&["name"]).mutable(&["name", "email"]))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine over the in-memory store with a fixed clock, so stamped
/// timestamps are assertable.
pub fn engine() -> (Engine, Arc<FixedClock>) {
    init_tracing();
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()));
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::with_parts(store, registry(), EngineConfig::default(), clock.clone())
        .expect("registry must validate");
    (engine, clock)
}

pub fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn appointment_fields(patient: &str, starts_at: &str) -> Map<String, Value> {
    fields(json!({ "patient_name": patient, "starts_at": starts_at }))
}
