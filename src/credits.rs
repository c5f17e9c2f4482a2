//! Credit top-up requests. Approval appends exactly one deposit to the
//! ledger in the same transaction as the status flip.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger;
use crate::realtime::tables;
use crate::store::Store;
use crate::types::{CreditRequest, RequestStatus, TransactionType};

fn ensure_pending(status: RequestStatus, attempted: &'static str) -> Result<(), StoreError> {
    if status != RequestStatus::Pending {
        return Err(StoreError::InvalidStateTransition {
            from: status.as_str(),
            attempted,
        });
    }
    Ok(())
}

async fn fetch_request_locked(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
) -> Result<CreditRequest, StoreError> {
    sqlx::query_as::<_, CreditRequest>(
        r#"SELECT id, client_id, amount, status, created_at, decided_at
           FROM credit_requests WHERE id = $1
           FOR UPDATE"#,
    )
    .bind(request_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or(StoreError::NotFound("credit request"))
}

async fn mark_decided(
    tx: &mut Transaction<'_, Postgres>,
    request_id: Uuid,
    status: RequestStatus,
) -> Result<CreditRequest, StoreError> {
    let row = sqlx::query_as::<_, CreditRequest>(
        r#"UPDATE credit_requests SET status = $2, decided_at = now()
           WHERE id = $1
           RETURNING id, client_id, amount, status, created_at, decided_at"#,
    )
    .bind(request_id)
    .bind(status)
    .fetch_one(tx.as_mut())
    .await?;

    Ok(row)
}

impl Store {
    pub async fn create_credit_request(
        &self,
        client_id: Uuid,
        amount: i64,
    ) -> Result<CreditRequest, StoreError> {
        if amount <= 0 {
            return Err(StoreError::Validation(
                "top-up amount must be positive".into(),
            ));
        }

        let request = sqlx::query_as::<_, CreditRequest>(
            r#"INSERT INTO credit_requests (id, client_id, amount)
               VALUES ($1, $2, $3)
               RETURNING id, client_id, amount, status, created_at, decided_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;

        self.feed.inserted(tables::CREDIT_REQUESTS, &request);
        Ok(request)
    }

    /// Approval and the deposit commit together; a crash between them cannot
    /// leave an approved request without its ledger entry.
    pub async fn approve_credit_request(
        &self,
        request_id: Uuid,
    ) -> Result<CreditRequest, StoreError> {
        let mut tx = self.begin().await?;
        let request = fetch_request_locked(&mut tx, request_id).await?;
        ensure_pending(request.status, "approve")?;

        let deposit = ledger::insert_transaction(
            tx.as_mut(),
            request.client_id,
            request.amount,
            TransactionType::Deposit,
            Some(request.id),
        )
        .await?;
        let approved = mark_decided(&mut tx, request_id, RequestStatus::Approved).await?;
        tx.commit().await?;

        self.feed.inserted(tables::CREDIT_TRANSACTIONS, &deposit);
        self.feed
            .updated(tables::CREDIT_REQUESTS, Some(&request), &approved);
        Ok(approved)
    }

    pub async fn reject_credit_request(
        &self,
        request_id: Uuid,
    ) -> Result<CreditRequest, StoreError> {
        let mut tx = self.begin().await?;
        let request = fetch_request_locked(&mut tx, request_id).await?;
        ensure_pending(request.status, "reject")?;

        let rejected = mark_decided(&mut tx, request_id, RequestStatus::Rejected).await?;
        tx.commit().await?;

        self.feed
            .updated(tables::CREDIT_REQUESTS, Some(&request), &rejected);
        Ok(rejected)
    }

    pub async fn list_credit_requests(
        &self,
        client_id: Option<Uuid>,
    ) -> Result<Vec<CreditRequest>, StoreError> {
        let rows = sqlx::query_as::<_, CreditRequest>(
            r#"SELECT id, client_id, amount, status, created_at, decided_at
               FROM credit_requests
               WHERE ($1::uuid IS NULL OR client_id = $1)
               ORDER BY created_at DESC, id"#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decided_requests_are_final() {
        for status in [RequestStatus::Approved, RequestStatus::Rejected] {
            assert!(matches!(
                ensure_pending(status, "approve"),
                Err(StoreError::InvalidStateTransition { .. })
            ));
        }
        assert!(ensure_pending(RequestStatus::Pending, "approve").is_ok());
    }
}
