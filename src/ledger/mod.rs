//! Wallet ledger: per-owner balances with an append-only transaction log.
//! Balance mutations re-read the wallet row inside the transaction, so two
//! concurrent deductions cannot both pass a sufficiency check computed
//! against a stale balance.

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::{WALLETS, WALLET_TRANSACTIONS};
use crate::error::EngineError;
use crate::query::{ListQuery, Predicate, QueryPlan, SortDirection};
use crate::record::Record;
use crate::scope::TenantScope;
use crate::store::StoreTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

/// Typed view over a wallet record.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: Uuid,
    pub tenant: String,
    pub owner: String,
    pub balance: Decimal,
    pub currency: String,
    pub active: bool,
}

impl Wallet {
    fn from_record(record: &Record) -> Result<Self, EngineError> {
        let balance = record
            .field_str("balance")
            .unwrap_or("0")
            .parse::<Decimal>()
            .map_err(|_| EngineError::validation("wallet row has a malformed balance"))?;
        Ok(Self {
            id: record.id,
            tenant: record.tenant.clone(),
            owner: record.field_str("owner").unwrap_or_default().to_string(),
            balance,
            currency: record.field_str("currency").unwrap_or_default().to_string(),
            active: record.field("active").and_then(Value::as_bool).unwrap_or(true),
        })
    }
}

/// One ledger entry. `amount` is always positive; `direction` carries the
/// sign.
#[derive(Debug, Clone)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub direction: Direction,
    pub amount: Decimal,
    pub description: String,
    pub reference: Option<String>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl WalletTransaction {
    fn from_record(record: &Record) -> Result<Self, EngineError> {
        let direction = match record.field_str("direction") {
            Some("credit") => Direction::Credit,
            Some("debit") => Direction::Debit,
            other => {
                return Err(EngineError::validation(format!(
                    "ledger row has a malformed direction: {other:?}"
                )))
            }
        };
        let amount = record
            .field_str("amount")
            .unwrap_or("0")
            .parse::<Decimal>()
            .map_err(|_| EngineError::validation("ledger row has a malformed amount"))?;
        let wallet_id = record
            .field_str("wallet_id")
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| EngineError::validation("ledger row has a malformed wallet id"))?;
        Ok(Self {
            id: record.id,
            wallet_id,
            direction,
            amount,
            description: record.field_str("description").unwrap_or_default().to_string(),
            reference: record.field_str("reference").map(str::to_string),
            recorded_at: record.created_at,
        })
    }
}

impl<'e> TenantScope<'e> {
    /// Get-or-create the owner's wallet. Several callers assume a wallet
    /// always "exists" on first touch, so creation is lazy: zero balance,
    /// the configured default currency, active.
    pub async fn wallet(&self, owner: &str) -> Result<Wallet, EngineError> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(EngineError::validation("wallet owner must not be empty"));
        }

        let mut txn = self.engine.store.begin().await?;
        if let Some(existing) = self.find_wallet(&mut *txn, owner).await? {
            txn.rollback().await?;
            return Wallet::from_record(&existing);
        }

        let now = self.engine.clock.now();
        let mut fields = Map::new();
        fields.insert("owner".to_string(), Value::String(owner.to_string()));
        fields.insert("balance".to_string(), Value::String(Decimal::ZERO.to_string()));
        fields.insert(
            "currency".to_string(),
            Value::String(self.engine.config.default_currency.clone()),
        );
        fields.insert("active".to_string(), Value::Bool(true));
        let record = Record {
            id: Uuid::new_v4(),
            entity: WALLETS.to_string(),
            tenant: self.tenant.clone(),
            status: None,
            fields,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        match txn.insert(&record).await {
            Ok(()) => {
                txn.commit().await?;
                tracing::debug!(tenant = %self.tenant, owner, "created wallet lazily");
                Wallet::from_record(&record)
            }
            Err(insert_err) => {
                // Lost a create race (unique tenant+owner index): take the
                // winner's row instead.
                drop(txn);
                let mut retry = self.engine.store.begin().await?;
                let existing = self.find_wallet(&mut *retry, owner).await?;
                retry.rollback().await?;
                match existing {
                    Some(record) => Wallet::from_record(&record),
                    None => Err(insert_err.into()),
                }
            }
        }
    }

    /// Credit a wallet. Amount must be positive.
    pub async fn add_funds(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        description: &str,
        reference: Option<&str>,
    ) -> Result<Wallet, EngineError> {
        require_positive(amount)?;

        let mut txn = self.engine.store.begin().await?;
        let mut record = self.locked_wallet(&mut *txn, wallet_id).await?;
        let balance = wallet_balance(&record)?;

        write_balance(&mut record, balance + amount);
        record.updated_at = self.engine.clock.now();
        txn.update(&record).await?;
        self.append_entry(&mut *txn, wallet_id, Direction::Credit, amount, description, reference)
            .await?;
        txn.commit().await?;
        Wallet::from_record(&record)
    }

    /// Debit a wallet. Fails with `InsufficientFunds` rather than let the
    /// balance go negative; the sufficiency check runs against the
    /// freshly locked row.
    pub async fn deduct_funds(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        description: &str,
        reference: Option<&str>,
    ) -> Result<Wallet, EngineError> {
        require_positive(amount)?;

        let mut txn = self.engine.store.begin().await?;
        let mut record = self.locked_wallet(&mut *txn, wallet_id).await?;
        let balance = wallet_balance(&record)?;
        if amount > balance {
            return Err(EngineError::InsufficientFunds { requested: amount, available: balance });
        }

        write_balance(&mut record, balance - amount);
        record.updated_at = self.engine.clock.now();
        txn.update(&record).await?;
        self.append_entry(&mut *txn, wallet_id, Direction::Debit, amount, description, reference)
            .await?;
        txn.commit().await?;
        Wallet::from_record(&record)
    }

    /// Move funds between two wallets of the same tenant as one atomic
    /// unit: either both legs commit or neither does.
    pub async fn transfer(
        &self,
        from: Uuid,
        to: Uuid,
        amount: Decimal,
        description: &str,
        reference: Option<&str>,
    ) -> Result<(), EngineError> {
        require_positive(amount)?;
        if from == to {
            return Err(EngineError::InvalidTransfer(
                "source and destination wallets are the same".to_string(),
            ));
        }

        let mut txn = self.engine.store.begin().await?;

        // Lock in a fixed order so two opposite transfers cannot deadlock.
        // The destination is fetched unscoped: a cross-tenant destination
        // must be distinguishable from a missing one.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let first_rec = locked_row(&mut *txn, first).await?;
        let second_rec = locked_row(&mut *txn, second).await?;
        let (mut from_rec, mut to_rec) =
            if first == from { (first_rec, second_rec) } else { (second_rec, first_rec) };

        if from_rec.tenant != self.tenant {
            return Err(EngineError::not_found(format!("wallet {from}")));
        }
        if to_rec.tenant != from_rec.tenant {
            return Err(EngineError::InvalidTransfer(
                "wallets belong to different tenants".to_string(),
            ));
        }

        let from_balance = wallet_balance(&from_rec)?;
        if amount > from_balance {
            return Err(EngineError::InsufficientFunds {
                requested: amount,
                available: from_balance,
            });
        }
        let to_balance = wallet_balance(&to_rec)?;

        let now = self.engine.clock.now();
        write_balance(&mut from_rec, from_balance - amount);
        from_rec.updated_at = now;
        txn.update(&from_rec).await?;
        write_balance(&mut to_rec, to_balance + amount);
        to_rec.updated_at = now;
        txn.update(&to_rec).await?;

        self.append_entry(&mut *txn, from, Direction::Debit, amount, description, reference)
            .await?;
        self.append_entry(&mut *txn, to, Direction::Credit, amount, description, reference)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    /// The wallet's ledger, oldest first.
    pub async fn wallet_transactions(
        &self,
        wallet_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, EngineError> {
        // Surface NotFound for foreign wallets before reading the ledger.
        let mut txn = self.engine.store.begin().await?;
        self.locked_wallet(&mut *txn, wallet_id).await?;
        txn.rollback().await?;

        let mut entries = vec![];
        let mut page_no = 1;
        loop {
            let page = self
                .list(
                    WALLET_TRANSACTIONS,
                    ListQuery::new()
                        .eq("wallet_id", wallet_id.to_string())
                        .sort("created_at", SortDirection::Asc)
                        .page(page_no)
                        .page_size(self.engine.config.max_page_size),
                )
                .await?;
            for record in &page.items {
                entries.push(WalletTransaction::from_record(record)?);
            }
            if page.last_page {
                break;
            }
            page_no += 1;
        }
        Ok(entries)
    }

    async fn find_wallet(
        &self,
        txn: &mut dyn StoreTransaction,
        owner: &str,
    ) -> Result<Option<Record>, EngineError> {
        let mut plan = QueryPlan::new();
        plan.push(Predicate::Eq {
            field: "tenant".into(),
            value: Value::String(self.tenant.clone()),
        });
        plan.push(Predicate::Eq { field: "owner".into(), value: Value::String(owner.to_string()) });
        plan.limit = Some(1);
        let mut rows = txn.query(WALLETS, &plan).await?;
        Ok(rows.pop())
    }

    /// Wallet row under a write lock; foreign and missing wallets are both
    /// `NotFound`.
    async fn locked_wallet(
        &self,
        txn: &mut dyn StoreTransaction,
        wallet_id: Uuid,
    ) -> Result<Record, EngineError> {
        txn.get_for_update(WALLETS, wallet_id)
            .await?
            .filter(|r| r.tenant == self.tenant && !r.is_deleted())
            .ok_or_else(|| EngineError::not_found(format!("wallet {wallet_id}")))
    }

    async fn append_entry(
        &self,
        txn: &mut dyn StoreTransaction,
        wallet_id: Uuid,
        direction: Direction,
        amount: Decimal,
        description: &str,
        reference: Option<&str>,
    ) -> Result<(), EngineError> {
        let now = self.engine.clock.now();
        let mut fields = Map::new();
        fields.insert("wallet_id".to_string(), Value::String(wallet_id.to_string()));
        fields.insert("direction".to_string(), Value::String(direction.as_str().to_string()));
        fields.insert("amount".to_string(), Value::String(amount.to_string()));
        fields.insert("description".to_string(), Value::String(description.to_string()));
        if let Some(reference) = reference {
            fields.insert("reference".to_string(), Value::String(reference.to_string()));
        }
        let record = Record {
            id: Uuid::new_v4(),
            entity: WALLET_TRANSACTIONS.to_string(),
            tenant: self.tenant.clone(),
            status: None,
            fields,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        txn.insert(&record).await?;
        Ok(())
    }
}

async fn locked_row(
    txn: &mut dyn StoreTransaction,
    wallet_id: Uuid,
) -> Result<Record, EngineError> {
    txn.get_for_update(WALLETS, wallet_id)
        .await?
        .filter(|r| !r.is_deleted())
        .ok_or_else(|| EngineError::not_found(format!("wallet {wallet_id}")))
}

fn require_positive(amount: Decimal) -> Result<(), EngineError> {
    if amount <= Decimal::ZERO {
        return Err(EngineError::field_validation(
            "amount must be positive",
            "amount",
            format!("got {amount}"),
        ));
    }
    Ok(())
}

fn wallet_balance(record: &Record) -> Result<Decimal, EngineError> {
    record
        .field_str("balance")
        .unwrap_or("0")
        .parse::<Decimal>()
        .map_err(|_| EngineError::validation("wallet row has a malformed balance"))
}

fn write_balance(record: &mut Record, balance: Decimal) {
    record.set_field("balance", balance.to_string());
}
