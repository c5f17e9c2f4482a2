use sqlx::PgExecutor;
use uuid::Uuid;

use crate::error::{StoreError, sqlstate};
use crate::realtime::tables;
use crate::store::Store;
use crate::types::{Plan, PlanWithAvailability};

// foreign_key_violation
const SQLSTATE_FK: &str = "23503";

pub(crate) fn validate_plan_input(duration_label: &str, price: i64) -> Result<(), StoreError> {
    if duration_label.trim().is_empty() {
        return Err(StoreError::Validation(
            "duration label must not be empty".into(),
        ));
    }
    if price < 0 {
        return Err(StoreError::Validation("price must not be negative".into()));
    }
    Ok(())
}

pub(crate) async fn fetch_plan<'e>(
    exec: impl PgExecutor<'e>,
    plan_id: Uuid,
) -> Result<Plan, StoreError> {
    sqlx::query_as::<_, Plan>(
        "SELECT id, duration_label, price, created_at FROM plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(exec)
    .await?
    .ok_or(StoreError::NotFound("plan"))
}

impl Store {
    pub async fn create_plan(
        &self,
        duration_label: &str,
        price: i64,
    ) -> Result<Plan, StoreError> {
        validate_plan_input(duration_label, price)?;

        let plan = sqlx::query_as::<_, Plan>(
            r#"INSERT INTO plans (id, duration_label, price)
               VALUES ($1, $2, $3)
               RETURNING id, duration_label, price, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(duration_label.trim())
        .bind(price)
        .fetch_one(&self.pool)
        .await?;

        self.feed.inserted(tables::PLANS, &plan);
        Ok(plan)
    }

    /// Price and duration edits are the only mutations a plan supports.
    pub async fn update_plan(
        &self,
        plan_id: Uuid,
        duration_label: Option<&str>,
        price: Option<i64>,
    ) -> Result<Plan, StoreError> {
        let before = fetch_plan(&self.pool, plan_id).await?;
        let label = duration_label.unwrap_or(&before.duration_label);
        let price = price.unwrap_or(before.price);
        validate_plan_input(label, price)?;

        let plan = sqlx::query_as::<_, Plan>(
            r#"UPDATE plans SET duration_label = $2, price = $3
               WHERE id = $1
               RETURNING id, duration_label, price, created_at"#,
        )
        .bind(plan_id)
        .bind(label.trim())
        .bind(price)
        .fetch_one(&self.pool)
        .await?;

        self.feed.updated(tables::PLANS, Some(&before), &plan);
        Ok(plan)
    }

    /// Plans stay deletable only while nothing references them; the FK
    /// restriction surfaces as a conflict once vouchers or purchases exist.
    pub async fn delete_plan(&self, plan_id: Uuid) -> Result<(), StoreError> {
        let plan = fetch_plan(&self.pool, plan_id).await?;

        sqlx::query("DELETE FROM plans WHERE id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if sqlstate(&e).as_deref() == Some(SQLSTATE_FK) {
                    StoreError::Conflict(
                        "plan is referenced by vouchers or purchases and cannot be deleted".into(),
                    )
                } else {
                    StoreError::Db(e)
                }
            })?;

        self.feed.deleted(tables::PLANS, &plan);
        Ok(())
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, StoreError> {
        fetch_plan(&self.pool, plan_id).await
    }

    /// All plans with their claimable voucher counts, oldest first.
    pub async fn list_plans(&self) -> Result<Vec<PlanWithAvailability>, StoreError> {
        let rows = sqlx::query_as::<_, PlanWithAvailability>(
            r#"SELECT p.id, p.duration_label, p.price, p.created_at,
                      COUNT(v.id) FILTER (WHERE NOT v.is_used AND w.voucher_id IS NULL) AS available
               FROM plans p
               LEFT JOIN vouchers v ON v.plan_id = p.id
               LEFT JOIN wallet_entries w
                      ON w.voucher_id = v.id AND w.status = 'approved'
               GROUP BY p.id
               ORDER BY p.created_at, p.id"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_label() {
        assert!(matches!(
            validate_plan_input("   ", 5),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn rejects_negative_price() {
        assert!(matches!(
            validate_plan_input("2 hrs", -1),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn zero_price_is_allowed() {
        assert!(validate_plan_input("promo", 0).is_ok());
    }
}
