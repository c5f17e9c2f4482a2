//! Append-only credit ledger. A client's balance is always derived as
//! Σ(deposits) − Σ(purchases); it is never stored, and rows are never
//! edited (a trigger in the schema rejects rewrites). Corrections are new
//! opposite-signed entries.

use sqlx::{PgExecutor, Postgres, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::realtime::tables;
use crate::store::Store;
use crate::types::{CreditTransaction, TransactionType};

pub(crate) async fn insert_transaction<'e>(
    exec: impl PgExecutor<'e>,
    client_id: Uuid,
    amount: i64,
    transaction_type: TransactionType,
    reference_id: Option<Uuid>,
) -> Result<CreditTransaction, StoreError> {
    if amount <= 0 {
        return Err(StoreError::Validation(
            "transaction amount must be positive".into(),
        ));
    }

    let row = sqlx::query_as::<_, CreditTransaction>(
        r#"INSERT INTO credit_transactions (id, client_id, amount, transaction_type, reference_id)
           VALUES ($1, $2, $3, $4, $5)
           RETURNING id, client_id, amount, transaction_type, reference_id, created_at"#,
    )
    .bind(Uuid::new_v4())
    .bind(client_id)
    .bind(amount)
    .bind(transaction_type)
    .bind(reference_id)
    .fetch_one(exec)
    .await?;

    Ok(row)
}

pub(crate) async fn balance_of<'e>(
    exec: impl PgExecutor<'e>,
    client_id: Uuid,
) -> Result<i64, StoreError> {
    let balance = sqlx::query_scalar::<_, i64>(
        r#"SELECT COALESCE(SUM(CASE WHEN transaction_type = 'deposit' THEN amount ELSE -amount END), 0)::BIGINT
           FROM credit_transactions
           WHERE client_id = $1"#,
    )
    .bind(client_id)
    .fetch_one(exec)
    .await?;

    Ok(balance)
}

/// Locks the payer's profile row, serializing balance validation against
/// every other debit for the same client.
pub(crate) async fn lock_payer(
    tx: &mut Transaction<'_, Postgres>,
    client_id: Uuid,
) -> Result<(), StoreError> {
    let found = sqlx::query_scalar::<_, Uuid>("SELECT id FROM profiles WHERE id = $1 FOR UPDATE")
        .bind(client_id)
        .fetch_optional(tx.as_mut())
        .await?;

    if found.is_none() {
        return Err(StoreError::NotFound("profile"));
    }
    Ok(())
}

/// Validated debit inside the caller's transaction: takes the payer lock,
/// recomputes the balance under it and appends the `purchase` entry. The
/// lock guarantees the checked balance cannot go stale before the append.
pub(crate) async fn debit(
    tx: &mut Transaction<'_, Postgres>,
    client_id: Uuid,
    amount: i64,
    reference_id: Option<Uuid>,
) -> Result<CreditTransaction, StoreError> {
    lock_payer(tx, client_id).await?;

    let balance = balance_of(tx.as_mut(), client_id).await?;
    if balance < amount {
        return Err(StoreError::InsufficientBalance {
            balance,
            required: amount,
        });
    }

    insert_transaction(
        tx.as_mut(),
        client_id,
        amount,
        TransactionType::Purchase,
        reference_id,
    )
    .await
}

impl Store {
    /// Appends one ledger entry outside any larger operation (admin
    /// adjustments, refunds as opposite-signed follow-ups).
    pub async fn record_transaction(
        &self,
        client_id: Uuid,
        amount: i64,
        transaction_type: TransactionType,
        reference_id: Option<Uuid>,
    ) -> Result<CreditTransaction, StoreError> {
        let row =
            insert_transaction(&self.pool, client_id, amount, transaction_type, reference_id)
                .await?;
        self.feed.inserted(tables::CREDIT_TRANSACTIONS, &row);
        Ok(row)
    }

    pub async fn balance(&self, client_id: Uuid) -> Result<i64, StoreError> {
        balance_of(&self.pool, client_id).await
    }

    pub async fn list_transactions(
        &self,
        client_id: Uuid,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<CreditTransaction>, u64), StoreError> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM credit_transactions WHERE client_id = $1",
        )
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;

        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);
        let rows = sqlx::query_as::<_, CreditTransaction>(
            r#"SELECT id, client_id, amount, transaction_type, reference_id, created_at
               FROM credit_transactions
               WHERE client_id = $1
               ORDER BY created_at DESC, id
               LIMIT $2 OFFSET $3"#,
        )
        .bind(client_id)
        .bind(i64::from(per_page))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows, total.max(0) as u64))
    }
}
