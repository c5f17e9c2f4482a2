//! WiFi voucher storefront service.
//!
//! Clients browse time-limited access plans, purchase vouchers (cash,
//! e-wallets or internal credit) and transfer vouchers or credit to each
//! other; admins manage plan inventory, voucher pools and approvals. All
//! state lives in PostgreSQL; the interesting parts are the voucher
//! lifecycle, the append-only credit ledger, the purchase state machine and
//! the transfer protocol.

mod api;
mod auth;
mod config;
mod credits;
mod error;
mod ledger;
mod plans;
mod purchases;
mod realtime;
mod responses;
mod store;
mod transfers;
mod types;
mod vouchers;

use anyhow::Context;
use anyhow::Result;
use sqlx::{PgPool, postgres::PgPoolOptions};

pub use api::{AppState, init_router};
pub use auth::{AuthedUser, USER_ID_HEADER};
pub use config::Config;
pub use error::StoreError;
pub use realtime::{ChangeEvent, ChangeFeed, ChangeKind, Subscription, tables};
pub use store::Store;
pub use transfers::{TransferOutcome, TransferToken};
pub use types::{
    CreditRequest, CreditTransaction, PaymentMethod, Plan, PlanWithAvailability, Profile,
    Purchase, PurchaseStatus, RequestStatus, Role, TransactionType, Voucher, WalletEntry,
    WalletStatus, WalletVoucher,
};

/// Initializes the database pool.
pub async fn init_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// Applies the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    Ok(())
}
