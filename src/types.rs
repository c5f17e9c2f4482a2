use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A profile's role. Assigned `client` on first authentication; promotion to
/// `admin` is an operational action, never self-service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Client,
}

/// How a purchase is paid for. Closed set; unknown methods are rejected at
/// the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    GCash,
    PayMaya,
    Credit,
}

impl PaymentMethod {
    /// Credit purchases debit the ledger on approval; every other method
    /// consumes vouchers from the plan's pool.
    pub fn is_credit(self) -> bool {
        matches!(self, Self::Credit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl PurchaseStatus {
    /// Approved, rejected and cancelled are all terminal; no transition
    /// leaves them.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum WalletStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Purchase,
}

impl TransactionType {
    /// The sign this entry contributes to a derived balance.
    pub fn sign(self) -> i64 {
        match self {
            Self::Deposit => 1,
            Self::Purchase => -1,
        }
    }
}

/// Status of a credit top-up request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// A purchasable WiFi-access tier.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub duration_label: String,
    /// Price in the store's smallest currency unit. Never negative.
    pub price: i64,
    pub created_at: DateTime<Utc>,
}

/// A plan together with its currently claimable voucher count.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlanWithAvailability {
    pub id: Uuid,
    pub duration_label: String,
    pub price: i64,
    pub created_at: DateTime<Utc>,
    pub available: i64,
}

/// A single-use access code tied to a plan.
///
/// `is_copy` and `original_voucher_id` are reserved columns carried from the
/// source schema; nothing writes them yet.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Voucher {
    pub id: Uuid,
    #[serde(skip)]
    pub seq: i64,
    pub code: String,
    pub plan_id: Uuid,
    pub is_used: bool,
    pub is_copy: bool,
    pub original_voucher_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A client's ownership claim over a voucher.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WalletEntry {
    pub id: Uuid,
    pub client_id: Uuid,
    pub voucher_id: Uuid,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
}

/// A wallet entry joined with the voucher it claims, for client-facing
/// wallet listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WalletVoucher {
    pub id: Uuid,
    pub voucher_id: Uuid,
    pub code: String,
    pub plan_id: Uuid,
    pub duration_label: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Purchase {
    pub id: Uuid,
    pub client_id: Uuid,
    pub plan_id: Uuid,
    pub quantity: i32,
    /// Snapshot of plan.price × quantity at creation time; never recomputed.
    pub total_amount: i64,
    pub payment_method: PaymentMethod,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// One immutable row of the credit ledger. Amounts are always positive; the
/// transaction type carries the sign.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub client_id: Uuid,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub reference_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A pending top-up; approval appends one deposit to the ledger.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditRequest {
    pub id: Uuid,
    pub client_id: Uuid,
    pub amount: i64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub role: Role,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_method_is_closed() {
        assert_eq!(
            serde_json::from_str::<PaymentMethod>("\"gcash\"").unwrap(),
            PaymentMethod::GCash
        );
        assert_eq!(
            serde_json::from_str::<PaymentMethod>("\"paymaya\"").unwrap(),
            PaymentMethod::PayMaya
        );
        assert!(serde_json::from_str::<PaymentMethod>("\"bitcoin\"").is_err());
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!PurchaseStatus::Pending.is_terminal());
        assert!(PurchaseStatus::Approved.is_terminal());
        assert!(PurchaseStatus::Rejected.is_terminal());
        assert!(PurchaseStatus::Cancelled.is_terminal());
    }

    #[test]
    fn transaction_sign() {
        assert_eq!(TransactionType::Deposit.sign(), 1);
        assert_eq!(TransactionType::Purchase.sign(), -1);
    }
}
