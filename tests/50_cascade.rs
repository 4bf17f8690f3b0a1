mod common;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tenantry::{DeletionRegistry, EngineError};

// Cascading tenant deletion over a declared dependency graph:
// contacts and bills carry the tenant key; wallets hang off contacts and
// ledger entries hang off wallets.

fn registry() -> DeletionRegistry {
    DeletionRegistry::new()
        .direct("contacts")
        .direct("bills")
        .direct("appointments")
        .dependent("wallets", "contacts", "owner")
        .dependent("wallet_transactions", "wallets", "wallet_id")
}

async fn seed_tenant(engine: &tenantry::Engine, tenant: &str, contacts: usize) -> Result<()> {
    let scope = engine.scope(tenant);
    for i in 0..contacts {
        let contact =
            scope.create("contacts", common::fields(json!({ "name": format!("c{i}") }))).await?;
        let wallet = scope.wallet(&contact.id.to_string()).await?;
        scope
            .add_funds(wallet.id, Decimal::new(100, 0), "seed", None)
            .await?;
    }
    scope.create("bills", common::fields(json!({ "payee": "Meralco", "amount": 10 }))).await?;
    Ok(())
}

#[tokio::test]
async fn cascade_removes_everything_for_one_tenant_only() -> Result<()> {
    let (engine, _clock) = common::engine();
    seed_tenant(&engine, "t1", 3).await?;
    seed_tenant(&engine, "t2", 2).await?;

    let report = engine.delete_tenant("t1", &registry()).await?;

    assert_eq!(report.removed("contacts"), 3);
    assert_eq!(report.removed("bills"), 1);
    assert_eq!(report.removed("wallets"), 3);
    assert_eq!(report.removed("wallet_transactions"), 3);
    // Registered but empty types still report, with zero.
    assert_eq!(report.removed("appointments"), 0);
    assert!(report.counts().contains_key("appointments"));
    assert_eq!(report.total(), 10);

    // Nothing of t1 remains visible.
    let t1 = engine.scope("t1");
    assert_eq!(t1.list("contacts", Default::default()).await?.total, 0);
    assert_eq!(t1.list("bills", Default::default()).await?.total, 0);

    // t2 is untouched.
    let t2 = engine.scope("t2");
    assert_eq!(t2.list("contacts", Default::default()).await?.total, 2);
    assert_eq!(t2.list("bills", Default::default()).await?.total, 1);
    let t2_contact = &t2.list("contacts", Default::default()).await?.items[0];
    let t2_wallet = t2.wallet(&t2_contact.id.to_string()).await?;
    assert_eq!(t2_wallet.balance, Decimal::new(100, 0));
    Ok(())
}

#[tokio::test]
async fn soft_deleted_rows_are_purged_too() -> Result<()> {
    let (engine, _clock) = common::engine();
    let scope = engine.scope("t1");
    let kept = scope.create("bills", common::fields(json!({ "payee": "a" }))).await?;
    let trashed = scope.create("bills", common::fields(json!({ "payee": "b" }))).await?;
    scope.trash("bills", trashed.id).await?;

    let report = engine
        .delete_tenant("t1", &DeletionRegistry::new().direct("bills"))
        .await?;
    assert_eq!(report.removed("bills"), 2);

    let err = scope.restore("bills", trashed.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    let err = scope.get("bills", kept.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn misconfigured_registry_deletes_nothing() -> Result<()> {
    let (engine, _clock) = common::engine();
    seed_tenant(&engine, "t1", 1).await?;

    // wallet_transactions' parent chain never reaches a direct entity.
    let broken = DeletionRegistry::new()
        .direct("bills")
        .dependent("wallet_transactions", "wallets", "wallet_id");
    let err = engine.delete_tenant("t1", &broken).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }), "got {err:?}");

    // The direct entity was not touched either.
    assert_eq!(engine.scope("t1").list("bills", Default::default()).await?.total, 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_is_rejected() -> Result<()> {
    let (engine, _clock) = common::engine();
    let dup = DeletionRegistry::new().direct("bills").direct("bills");
    let err = engine.delete_tenant("t1", &dup).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
    Ok(())
}

#[tokio::test]
async fn deleting_an_empty_tenant_reports_all_zeros() -> Result<()> {
    let (engine, _clock) = common::engine();
    let report = engine.delete_tenant("ghost", &registry()).await?;
    assert_eq!(report.total(), 0);
    for entity in ["contacts", "bills", "appointments", "wallets", "wallet_transactions"] {
        assert!(report.counts().contains_key(entity), "missing zero entry for {entity}");
    }
    Ok(())
}
