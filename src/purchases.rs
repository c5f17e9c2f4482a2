//! Purchase state machine: `pending -> {approved, rejected, cancelled}`,
//! all three terminal. Nothing is reserved at creation; approval runs the
//! side effect (voucher assignment or credit debit) and the status flip as
//! one transaction, so a failed side effect leaves the purchase pending.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger;
use crate::plans::fetch_plan;
use crate::realtime::tables;
use crate::store::Store;
use crate::types::{PaymentMethod, Purchase, PurchaseStatus};
use crate::vouchers;

pub(crate) fn ensure_pending(
    status: PurchaseStatus,
    attempted: &'static str,
) -> Result<(), StoreError> {
    if status.is_terminal() {
        return Err(StoreError::InvalidStateTransition {
            from: status.as_str(),
            attempted,
        });
    }
    Ok(())
}

pub(crate) fn total_amount_for(price: i64, quantity: i32) -> Result<i64, StoreError> {
    price
        .checked_mul(i64::from(quantity))
        .ok_or_else(|| StoreError::Validation("total amount overflows".into()))
}

async fn fetch_purchase_locked(
    tx: &mut Transaction<'_, Postgres>,
    purchase_id: Uuid,
) -> Result<Purchase, StoreError> {
    sqlx::query_as::<_, Purchase>(
        r#"SELECT id, client_id, plan_id, quantity, total_amount, payment_method,
                  status, created_at, decided_at
           FROM purchases WHERE id = $1
           FOR UPDATE"#,
    )
    .bind(purchase_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or(StoreError::NotFound("purchase"))
}

async fn mark_decided(
    tx: &mut Transaction<'_, Postgres>,
    purchase_id: Uuid,
    status: PurchaseStatus,
) -> Result<Purchase, StoreError> {
    let row = sqlx::query_as::<_, Purchase>(
        r#"UPDATE purchases SET status = $2, decided_at = now()
           WHERE id = $1
           RETURNING id, client_id, plan_id, quantity, total_amount, payment_method,
                     status, created_at, decided_at"#,
    )
    .bind(purchase_id)
    .bind(status)
    .fetch_one(tx.as_mut())
    .await?;

    Ok(row)
}

impl Store {
    /// Creates a pending purchase. The availability check for non-credit
    /// methods is advisory: it refuses requests already doomed, but the real
    /// reservation only happens at approval.
    pub async fn create_purchase(
        &self,
        client_id: Uuid,
        plan_id: Uuid,
        quantity: i32,
        payment_method: PaymentMethod,
    ) -> Result<Purchase, StoreError> {
        if quantity < 1 {
            return Err(StoreError::Validation("quantity must be at least 1".into()));
        }

        let plan = fetch_plan(&self.pool, plan_id).await?;

        if !payment_method.is_credit() {
            let available = vouchers::available_count_of(&self.pool, plan_id).await?;
            if available < i64::from(quantity) {
                return Err(StoreError::InsufficientInventory {
                    available,
                    requested: i64::from(quantity),
                });
            }
        }

        let total_amount = total_amount_for(plan.price, quantity)?;

        let purchase = sqlx::query_as::<_, Purchase>(
            r#"INSERT INTO purchases (id, client_id, plan_id, quantity, total_amount, payment_method)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id, client_id, plan_id, quantity, total_amount, payment_method,
                         status, created_at, decided_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .bind(plan_id)
        .bind(quantity)
        .bind(total_amount)
        .bind(payment_method)
        .fetch_one(&self.pool)
        .await?;

        self.feed.inserted(tables::PURCHASES, &purchase);
        Ok(purchase)
    }

    /// Approves a pending purchase. Credit purchases debit the ledger under
    /// the payer lock; every other method claims vouchers from the pool. The
    /// side effect and the status flip commit together or not at all.
    pub async fn approve_purchase(&self, purchase_id: Uuid) -> Result<Purchase, StoreError> {
        let mut tx = self.begin().await?;
        let purchase = fetch_purchase_locked(&mut tx, purchase_id).await?;
        ensure_pending(purchase.status, "approve")?;

        let mut assigned = Vec::new();
        let mut debit = None;
        if purchase.payment_method.is_credit() {
            debit = Some(
                ledger::debit(
                    &mut tx,
                    purchase.client_id,
                    purchase.total_amount,
                    Some(purchase.id),
                )
                .await?,
            );
        } else {
            assigned = vouchers::reserve_and_assign(
                &mut tx,
                purchase.plan_id,
                purchase.client_id,
                i64::from(purchase.quantity),
            )
            .await?;
        }

        let approved = mark_decided(&mut tx, purchase_id, PurchaseStatus::Approved).await?;
        tx.commit().await?;

        self.feed
            .updated(tables::PURCHASES, Some(&purchase), &approved);
        if let Some(entry) = debit {
            self.feed.inserted(tables::CREDIT_TRANSACTIONS, &entry);
        }
        self.publish_assignment(&assigned);
        Ok(approved)
    }

    /// Rejection reverses nothing: a pending purchase never reserved
    /// anything.
    pub async fn reject_purchase(&self, purchase_id: Uuid) -> Result<Purchase, StoreError> {
        let mut tx = self.begin().await?;
        let purchase = fetch_purchase_locked(&mut tx, purchase_id).await?;
        ensure_pending(purchase.status, "reject")?;

        let rejected = mark_decided(&mut tx, purchase_id, PurchaseStatus::Rejected).await?;
        tx.commit().await?;

        self.feed
            .updated(tables::PURCHASES, Some(&purchase), &rejected);
        Ok(rejected)
    }

    /// Client-side withdrawal, allowed only to the owner while still pending.
    pub async fn cancel_purchase(
        &self,
        purchase_id: Uuid,
        client_id: Uuid,
    ) -> Result<Purchase, StoreError> {
        let mut tx = self.begin().await?;
        let purchase = fetch_purchase_locked(&mut tx, purchase_id).await?;
        if purchase.client_id != client_id {
            return Err(StoreError::Forbidden);
        }
        ensure_pending(purchase.status, "cancel")?;

        let cancelled = mark_decided(&mut tx, purchase_id, PurchaseStatus::Cancelled).await?;
        tx.commit().await?;

        self.feed
            .updated(tables::PURCHASES, Some(&purchase), &cancelled);
        Ok(cancelled)
    }

    /// History cleanup. Only terminal purchases may go, and rows a prior
    /// approval created (vouchers, wallet entries, ledger) are untouched.
    pub async fn delete_purchase(&self, purchase_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let purchase = fetch_purchase_locked(&mut tx, purchase_id).await?;
        if !purchase.status.is_terminal() {
            return Err(StoreError::InvalidStateTransition {
                from: purchase.status.as_str(),
                attempted: "delete",
            });
        }

        sqlx::query("DELETE FROM purchases WHERE id = $1")
            .bind(purchase_id)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;

        self.feed.deleted(tables::PURCHASES, &purchase);
        Ok(())
    }

    pub async fn list_purchases(
        &self,
        client_id: Option<Uuid>,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<Purchase>, u64), StoreError> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM purchases WHERE ($1::uuid IS NULL OR client_id = $1)",
        )
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;

        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);
        let rows = sqlx::query_as::<_, Purchase>(
            r#"SELECT id, client_id, plan_id, quantity, total_amount, payment_method,
                      status, created_at, decided_at
               FROM purchases
               WHERE ($1::uuid IS NULL OR client_id = $1)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_every_decision() {
        for status in [
            PurchaseStatus::Approved,
            PurchaseStatus::Rejected,
            PurchaseStatus::Cancelled,
        ] {
            for attempted in ["approve", "reject", "cancel"] {
                let err = ensure_pending(status, attempted).unwrap_err();
                assert!(matches!(
                    err,
                    StoreError::InvalidStateTransition { from, attempted: a }
                        if from == status.as_str() && a == attempted
                ));
            }
        }
    }

    #[test]
    fn pending_allows_decisions() {
        assert!(ensure_pending(PurchaseStatus::Pending, "approve").is_ok());
    }

    #[test]
    fn total_is_price_times_quantity() {
        assert_eq!(total_amount_for(5, 3).unwrap(), 15);
        assert_eq!(total_amount_for(0, 10).unwrap(), 0);
    }

    #[test]
    fn total_overflow_is_a_validation_error() {
        assert!(matches!(
            total_amount_for(i64::MAX, 2),
            Err(StoreError::Validation(_))
        ));
    }
}
