//! Voucher pool: bulk import, availability and reservation.
//!
//! Reservation runs inside the caller's transaction and claims rows with
//! `FOR UPDATE SKIP LOCKED` plus a conditional flip of `is_used`, so two
//! concurrent assigners can never receive overlapping voucher sets.

use std::collections::HashSet;

use sqlx::{PgExecutor, Postgres, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::plans::fetch_plan;
use crate::realtime::tables;
use crate::store::Store;
use crate::types::{Voucher, WalletEntry, WalletVoucher};

/// Trims codes, drops empties and de-duplicates within the batch, keeping
/// first-seen order. Duplicates against existing rows are handled by the
/// unique index at insert time.
pub(crate) fn normalize_codes<I, S>(codes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for code in codes {
        let code = code.as_ref().trim();
        if code.is_empty() {
            continue;
        }
        if seen.insert(code.to_string()) {
            out.push(code.to_string());
        }
    }
    out
}

pub(crate) async fn available_count_of<'e>(
    exec: impl PgExecutor<'e>,
    plan_id: Uuid,
) -> Result<i64, StoreError> {
    // is_used is authoritative; the wallet check guards against a stray
    // approved entry pointing at an unused voucher
    let count = sqlx::query_scalar::<_, i64>(
        r#"SELECT COUNT(*)
           FROM vouchers v
           WHERE v.plan_id = $1
             AND NOT v.is_used
             AND NOT EXISTS (
                 SELECT 1 FROM wallet_entries w
                 WHERE w.voucher_id = v.id AND w.status = 'approved'
             )"#,
    )
    .bind(plan_id)
    .fetch_one(exec)
    .await?;

    Ok(count)
}

/// Claims `quantity` unused vouchers for `client_id` inside the caller's
/// transaction: oldest first, each row locked and conditionally flipped to
/// used, one approved wallet entry per voucher. Fails without partial effect
/// when the pool cannot cover the quantity; the caller's rollback undoes the
/// locks and flips. Returned entries follow the selection order.
pub(crate) async fn reserve_and_assign(
    tx: &mut Transaction<'_, Postgres>,
    plan_id: Uuid,
    client_id: Uuid,
    quantity: i64,
) -> Result<Vec<WalletEntry>, StoreError> {
    if quantity < 1 {
        return Err(StoreError::Validation("quantity must be at least 1".into()));
    }

    let picked = sqlx::query_scalar::<_, Uuid>(
        r#"SELECT id FROM vouchers
           WHERE plan_id = $1 AND NOT is_used
           ORDER BY seq
           LIMIT $2
           FOR UPDATE SKIP LOCKED"#,
    )
    .bind(plan_id)
    .bind(quantity)
    .fetch_all(tx.as_mut())
    .await?;

    if (picked.len() as i64) < quantity {
        return Err(StoreError::InsufficientInventory {
            available: picked.len() as i64,
            requested: quantity,
        });
    }

    let flipped = sqlx::query(
        "UPDATE vouchers SET is_used = TRUE WHERE id = ANY($1) AND NOT is_used",
    )
    .bind(picked.clone())
    .execute(tx.as_mut())
    .await?;

    if flipped.rows_affected() != picked.len() as u64 {
        // rows were locked by us, so this only fires on a broken pool state
        return Err(StoreError::InsufficientInventory {
            available: flipped.rows_affected() as i64,
            requested: quantity,
        });
    }

    let entry_ids: Vec<Uuid> = picked.iter().map(|_| Uuid::new_v4()).collect();
    let entries = sqlx::query_as::<_, WalletEntry>(
        r#"INSERT INTO wallet_entries (id, client_id, voucher_id, status)
           SELECT entry_id, $1, voucher_id, 'approved'
           FROM UNNEST($2::uuid[], $3::uuid[]) AS t (entry_id, voucher_id)
           RETURNING id, client_id, voucher_id, status, created_at"#,
    )
    .bind(client_id)
    .bind(entry_ids)
    .bind(picked.clone())
    .fetch_all(tx.as_mut())
    .await?;

    // hand entries back in selection order
    let mut by_voucher: std::collections::HashMap<Uuid, WalletEntry> =
        entries.into_iter().map(|e| (e.voucher_id, e)).collect();
    let ordered = picked
        .iter()
        .filter_map(|id| by_voucher.remove(id))
        .collect::<Vec<_>>();
    Ok(ordered)
}

impl Store {
    /// Inserts a batch of codes for a plan. Codes already present anywhere in
    /// the system are silently skipped; the caller learns how many rows
    /// actually landed.
    pub async fn bulk_import_vouchers(
        &self,
        plan_id: Uuid,
        codes: &[String],
    ) -> Result<u64, StoreError> {
        fetch_plan(&self.pool, plan_id).await?;

        let codes = normalize_codes(codes);
        if codes.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = codes.iter().map(|_| Uuid::new_v4()).collect();
        let inserted = sqlx::query_as::<_, Voucher>(
            r#"INSERT INTO vouchers (id, code, plan_id)
               SELECT id, code, $1
               FROM UNNEST($2::uuid[], $3::text[]) AS t (id, code)
               ON CONFLICT (code) DO NOTHING
               RETURNING id, seq, code, plan_id, is_used, is_copy, original_voucher_id, created_at"#,
        )
        .bind(plan_id)
        .bind(ids)
        .bind(codes)
        .fetch_all(&self.pool)
        .await?;

        for voucher in &inserted {
            self.feed.inserted(tables::VOUCHERS, voucher);
        }
        Ok(inserted.len() as u64)
    }

    /// Vouchers still claimable for a plan.
    pub async fn available_count(&self, plan_id: Uuid) -> Result<i64, StoreError> {
        available_count_of(&self.pool, plan_id).await
    }

    /// Direct admin assignment: hands `quantity` vouchers of a plan to a
    /// client without a purchase, as one atomic unit.
    pub async fn assign_vouchers(
        &self,
        plan_id: Uuid,
        client_id: Uuid,
        quantity: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.begin().await?;
        fetch_plan(tx.as_mut(), plan_id).await?;
        let entries = reserve_and_assign(&mut tx, plan_id, client_id, quantity).await?;
        tx.commit().await?;

        self.publish_assignment(&entries);
        Ok(entries.into_iter().map(|e| e.voucher_id).collect())
    }

    pub(crate) fn publish_assignment(&self, entries: &[WalletEntry]) {
        for entry in entries {
            self.feed.inserted(tables::WALLET_ENTRIES, entry);
            self.feed.updated(
                tables::VOUCHERS,
                None::<&serde_json::Value>,
                &serde_json::json!({ "id": entry.voucher_id, "is_used": true }),
            );
        }
    }

    /// The caller's approved wallet, voucher codes included.
    pub async fn wallet(&self, client_id: Uuid) -> Result<Vec<WalletVoucher>, StoreError> {
        let rows = sqlx::query_as::<_, WalletVoucher>(
            r#"SELECT w.id, w.voucher_id, v.code, v.plan_id, p.duration_label, w.created_at
               FROM wallet_entries w
               JOIN vouchers v ON v.id = w.voucher_id
               JOIN plans p ON p.id = v.plan_id
               WHERE w.client_id = $1 AND w.status = 'approved'
               ORDER BY w.created_at, w.id"#,
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
    fn normalize_trims_and_drops_empties() {
        let codes = normalize_codes(["  abc ", "", "def", "   "]);
        assert_eq!(codes, vec!["abc", "def"]);
    }

    #[test]
    fn normalize_dedupes_keeping_first_seen_order() {
        let codes = normalize_codes(["b", "a", "b", "a ", "c"]);
        assert_eq!(codes, vec!["b", "a", "c"]);
    }

    #[test]
    fn normalize_of_nothing_is_empty() {
        assert!(normalize_codes(Vec::<String>::new()).is_empty());
    }
}
