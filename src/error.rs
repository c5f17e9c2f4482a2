use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::responses::RequestMeta;

pub const E_VALIDATION: &str = "VALIDATION";
pub const E_INSUFFICIENT_INVENTORY: &str = "INSUFFICIENT_INVENTORY";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const E_INVALID_STATE_TRANSITION: &str = "INVALID_STATE_TRANSITION";
pub const E_NOT_OWNER: &str = "NOT_OWNER";
pub const E_INVALID_TOKEN: &str = "INVALID_TOKEN";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_FORBIDDEN: &str = "FORBIDDEN";
pub const E_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const E_CONFLICT: &str = "CONFLICT";
pub const E_DB_FAILURE: &str = "DB_FAILURE";

/// Everything the store can refuse to do, and why.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),
    #[error("only {available} of {requested} requested vouchers are available")]
    InsufficientInventory { available: i64, requested: i64 },
    #[error("balance {balance} is less than the required {required}")]
    InsufficientBalance { balance: i64, required: i64 },
    #[error("cannot {attempted} a {from} record")]
    InvalidStateTransition {
        from: &'static str,
        attempted: &'static str,
    },
    #[error("sender no longer owns the offered vouchers")]
    NotOwner,
    #[error("invalid transfer token: {0}")]
    InvalidToken(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("not allowed")]
    Forbidden,
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => E_VALIDATION,
            Self::InsufficientInventory { .. } => E_INSUFFICIENT_INVENTORY,
            Self::InsufficientBalance { .. } => E_INSUFFICIENT_BALANCE,
            Self::InvalidStateTransition { .. } => E_INVALID_STATE_TRANSITION,
            Self::NotOwner => E_NOT_OWNER,
            Self::InvalidToken(_) => E_INVALID_TOKEN,
            Self::NotFound(_) => E_NOT_FOUND,
            Self::Conflict(_) => E_CONFLICT,
            Self::Forbidden => E_FORBIDDEN,
            Self::Unauthorized(_) => E_UNAUTHORIZED,
            Self::Db(_) => E_DB_FAILURE,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidToken(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientInventory { .. }
            | Self::InsufficientBalance { .. }
            | Self::InvalidStateTransition { .. }
            | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotOwner | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta { error: self, meta }
    }
}

/// A store error bound to the request metadata it will be reported with.
#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: StoreError,
    meta: RequestMeta,
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let code = self.error.code();
        let message = match &self.error {
            StoreError::Db(e) => {
                error!("database error: {:?}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "request_id": self.meta.request_id,
            "error": message,
            "code": code,
        });

        (status, Json(body)).into_response()
    }
}

/// The SQLSTATE of a database-level error, when the backend reported one.
pub(crate) fn sqlstate(e: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_err) = e {
        db_err.code().map(|c| c.into_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let e = StoreError::InsufficientInventory {
            available: 2,
            requested: 5,
        };
        assert_eq!(e.code(), E_INSUFFICIENT_INVENTORY);
        assert_eq!(e.status(), StatusCode::CONFLICT);

        let e = StoreError::InvalidStateTransition {
            from: "approved",
            attempted: "approve",
        };
        assert_eq!(e.code(), E_INVALID_STATE_TRANSITION);
        assert_eq!(e.status(), StatusCode::CONFLICT);

        assert_eq!(StoreError::NotOwner.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            StoreError::InvalidToken("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn messages_carry_amounts() {
        let e = StoreError::InsufficientBalance {
            balance: 20,
            required: 30,
        };
        assert_eq!(e.to_string(), "balance 20 is less than the required 30");
    }
}
