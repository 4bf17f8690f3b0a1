mod common;

use anyhow::Result;
use serde_json::json;
use tenantry::Clock;
use tenantry::EngineError;

// Tenant scoping and CRUD surface: stamping, isolation, whitelists,
// soft delete.

#[tokio::test]
async fn create_stamps_engine_owned_columns() -> Result<()> {
    let (engine, clock) = common::engine();
    let scope = engine.scope("clinic-a");

    let record = scope
        .create("appointments", common::appointment_fields("Ana Reyes", "2025-06-02T09:00:00+00:00"))
        .await?;

    assert_eq!(record.tenant, "clinic-a");
    assert_eq!(record.status.as_deref(), Some("scheduled"));
    assert_eq!(record.created_at, clock.now());
    assert_eq!(record.field_str("patient_name"), Some("Ana Reyes"));
    Ok(())
}

#[tokio::test]
async fn tenant_cannot_read_another_tenants_rows() -> Result<()> {
    let (engine, _clock) = common::engine();
    let record = engine
        .scope("clinic-a")
        .create("appointments", common::appointment_fields("Ana Reyes", "2025-06-02T09:00:00+00:00"))
        .await?;

    let err = engine.scope("clinic-b").get("appointments", record.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "got {err:?}");

    // The owner still sees it.
    assert!(engine.scope("clinic-a").get("appointments", record.id).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn system_fields_rejected_on_create_and_update() -> Result<()> {
    let (engine, _clock) = common::engine();
    let scope = engine.scope("clinic-a");

    let err = scope
        .create("appointments", common::fields(json!({ "tenant": "clinic-b" })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }), "got {err:?}");

    let record = scope
        .create("appointments", common::appointment_fields("Ana", "2025-06-02T09:00:00+00:00"))
        .await?;
    let err = scope
        .update("appointments", record.id, common::fields(json!({ "status": "completed" })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn update_enforces_mutable_whitelist() -> Result<()> {
    let (engine, clock) = common::engine();
    let scope = engine.scope("clinic-a");
    let record = scope
        .create("appointments", common::appointment_fields("Ana", "2025-06-02T09:00:00+00:00"))
        .await?;

    let err = scope
        .update("appointments", record.id, common::fields(json!({ "secret_flag": true })))
        .await
        .unwrap_err();
    match err {
        EngineError::Validation { field_errors: Some(errors), .. } => {
            assert!(errors.contains_key("secret_flag"));
        }
        other => panic!("expected field-level validation error, got {other:?}"),
    }

    clock.advance(chrono::Duration::minutes(10));
    let updated = scope
        .update("appointments", record.id, common::fields(json!({ "notes": "bring xrays" })))
        .await?;
    assert_eq!(updated.field_str("notes"), Some("bring xrays"));
    assert_eq!(updated.updated_at, clock.now());
    assert!(updated.updated_at > record.updated_at);
    Ok(())
}

#[tokio::test]
async fn save_rejects_record_owned_by_another_tenant() -> Result<()> {
    let (engine, _clock) = common::engine();
    let record = engine
        .scope("clinic-a")
        .create("appointments", common::appointment_fields("Ana", "2025-06-02T09:00:00+00:00"))
        .await?;

    let err = engine.scope("clinic-b").save(&record).await.unwrap_err();
    assert!(matches!(err, EngineError::AccessDenied), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn trash_hides_and_restore_recovers() -> Result<()> {
    let (engine, _clock) = common::engine();
    let scope = engine.scope("clinic-a");
    let record = scope
        .create("appointments", common::appointment_fields("Ana", "2025-06-02T09:00:00+00:00"))
        .await?;

    scope.trash("appointments", record.id).await?;
    let err = scope.get("appointments", record.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let restored = scope.restore("appointments", record.id).await?;
    assert!(restored.deleted_at.is_none());
    assert!(scope.get("appointments", record.id).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn hard_delete_removes_the_row() -> Result<()> {
    let (engine, _clock) = common::engine();
    let scope = engine.scope("clinic-a");
    let record = scope
        .create("appointments", common::appointment_fields("Ana", "2025-06-02T09:00:00+00:00"))
        .await?;

    scope.delete("appointments", record.id).await?;
    let err = scope.get("appointments", record.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    // Deleting a foreign row is also NotFound, not a cross-tenant write.
    let other = engine
        .scope("clinic-b")
        .create("appointments", common::appointment_fields("Ben", "2025-06-03T09:00:00+00:00"))
        .await?;
    let err = scope.delete("appointments", other.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn unknown_entity_is_a_validation_error() -> Result<()> {
    let (engine, _clock) = common::engine();
    let err = engine
        .scope("clinic-a")
        .create("no_such_entity", common::fields(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
    Ok(())
}

#[tokio::test]
async fn empty_tenant_key_cannot_create() -> Result<()> {
    let (engine, _clock) = common::engine();
    let err = engine
        .scope("  ")
        .create("appointments", common::fields(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
    Ok(())
}
