//! Peer-to-peer transfer of credit and vouchers.
//!
//! The sender shows a token (carried as a QR payload by the clients); the
//! receiver's session redeems it. Tokens are JSON wrapped in base64 and
//! carry a nonce: redemption claims the nonce in `transfer_redemptions`
//! inside the transfer transaction, so a replayed token loses atomically.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, sqlstate};
use crate::ledger;
use crate::realtime::tables;
use crate::store::Store;
use crate::types::{TransactionType, WalletEntry};

const SQLSTATE_FK: &str = "23503";

/// The QR payload. A credit token names no amount; the receiver enters it
/// at redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TransferToken {
    #[serde(rename = "credit-transfer")]
    Credit { sender_id: Uuid, nonce: Uuid },
    #[serde(rename = "voucher-transfer")]
    Vouchers {
        sender_id: Uuid,
        nonce: Uuid,
        vouchers: Vec<Uuid>,
    },
}

impl TransferToken {
    pub fn sender_id(&self) -> Uuid {
        match self {
            Self::Credit { sender_id, .. } | Self::Vouchers { sender_id, .. } => *sender_id,
        }
    }

    pub fn nonce(&self) -> Uuid {
        match self {
            Self::Credit { nonce, .. } | Self::Vouchers { nonce, .. } => *nonce,
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|_| StoreError::InvalidToken("not base64".into()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| StoreError::InvalidToken("unrecognized payload".into()))
    }
}

/// What a successful redemption moved.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum TransferOutcome {
    #[serde(rename = "credit-transfer")]
    Credit { amount: i64, reference_id: Uuid },
    #[serde(rename = "voucher-transfer")]
    Vouchers { voucher_ids: Vec<Uuid> },
}

pub(crate) fn ensure_distinct_parties(sender: Uuid, receiver: Uuid) -> Result<(), StoreError> {
    if sender == receiver {
        return Err(StoreError::Validation(
            "cannot transfer to yourself".into(),
        ));
    }
    Ok(())
}

fn dedup_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

impl Store {
    /// A credit token carries no amount; it only authorizes the receiver to
    /// ask the sender's balance for one.
    pub fn issue_credit_token(&self, sender_id: Uuid) -> TransferToken {
        TransferToken::Credit {
            sender_id,
            nonce: Uuid::new_v4(),
        }
    }

    /// A voucher token offers a concrete set the sender must currently own
    /// through approved wallet entries.
    pub async fn issue_voucher_token(
        &self,
        sender_id: Uuid,
        voucher_ids: &[Uuid],
    ) -> Result<TransferToken, StoreError> {
        let vouchers = dedup_ids(voucher_ids);
        if vouchers.is_empty() {
            return Err(StoreError::Validation(
                "a voucher transfer needs at least one voucher".into(),
            ));
        }

        let owned = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM wallet_entries
               WHERE voucher_id = ANY($1) AND client_id = $2 AND status = 'approved'"#,
        )
        .bind(vouchers.clone())
        .bind(sender_id)
        .fetch_one(&self.pool)
        .await?;

        if owned != vouchers.len() as i64 {
            return Err(StoreError::NotOwner);
        }

        Ok(TransferToken::Vouchers {
            sender_id,
            nonce: Uuid::new_v4(),
            vouchers,
        })
    }

    /// Redeems a token for the receiver, all-or-nothing. Credit tokens need
    /// an `amount`; voucher tokens move exactly the offered set, ownership
    /// changing while `is_used` stays as it was.
    pub async fn redeem_transfer(
        &self,
        receiver_id: Uuid,
        raw_token: &str,
        amount: Option<i64>,
    ) -> Result<TransferOutcome, StoreError> {
        let token = TransferToken::decode(raw_token)?;
        let sender_id = token.sender_id();
        ensure_distinct_parties(sender_id, receiver_id)?;

        let mut tx = self.begin().await?;

        // single-use: first redemption claims the nonce, replays conflict
        let claimed = sqlx::query(
            r#"INSERT INTO transfer_redemptions (nonce, sender_id)
               VALUES ($1, $2)
               ON CONFLICT (nonce) DO NOTHING"#,
        )
        .bind(token.nonce())
        .bind(sender_id)
        .execute(tx.as_mut())
        .await
        .map_err(|e| {
            if sqlstate(&e).as_deref() == Some(SQLSTATE_FK) {
                StoreError::InvalidToken("unknown sender".into())
            } else {
                StoreError::Db(e)
            }
        })?;

        if claimed.rows_affected() == 0 {
            return Err(StoreError::InvalidToken("token already redeemed".into()));
        }

        let outcome = match &token {
            TransferToken::Credit { .. } => {
                let amount = match amount {
                    Some(a) if a > 0 => a,
                    _ => {
                        return Err(StoreError::Validation(
                            "a positive amount is required for a credit transfer".into(),
                        ));
                    }
                };

                let reference_id = token.nonce();
                let debit = ledger::debit(&mut tx, sender_id, amount, Some(reference_id)).await?;
                let deposit = ledger::insert_transaction(
                    tx.as_mut(),
                    receiver_id,
                    amount,
                    TransactionType::Deposit,
                    Some(reference_id),
                )
                .await?;
                tx.commit().await?;

                self.feed.inserted(tables::CREDIT_TRANSACTIONS, &debit);
                self.feed.inserted(tables::CREDIT_TRANSACTIONS, &deposit);
                TransferOutcome::Credit {
                    amount,
                    reference_id,
                }
            }
            TransferToken::Vouchers { vouchers, .. } => {
                let voucher_ids = dedup_ids(vouchers);
                if voucher_ids.is_empty() {
                    return Err(StoreError::InvalidToken("empty voucher set".into()));
                }

                // conditional per-row reassignment: only rows still owned by
                // the claimed sender move, and all of them must
                let moved = sqlx::query_as::<_, WalletEntry>(
                    r#"UPDATE wallet_entries SET client_id = $1
                       WHERE voucher_id = ANY($2) AND client_id = $3 AND status = 'approved'
                       RETURNING id, client_id, voucher_id, status, created_at"#,
                )
                .bind(receiver_id)
                .bind(voucher_ids.clone())
                .bind(sender_id)
                .fetch_all(tx.as_mut())
                .await?;

                if moved.len() != voucher_ids.len() {
                    return Err(StoreError::NotOwner);
                }
                tx.commit().await?;

                for entry in &moved {
                    self.feed.updated(
                        tables::WALLET_ENTRIES,
                        Some(&serde_json::json!({
                            "voucher_id": entry.voucher_id,
                            "client_id": sender_id,
                        })),
                        entry,
                    );
                }
                TransferOutcome::Vouchers { voucher_ids }
            }
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_token_round_trips() {
        let token = TransferToken::Credit {
            sender_id: Uuid::new_v4(),
            nonce: Uuid::new_v4(),
        };
        let decoded = TransferToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn voucher_token_round_trips() {
        let token = TransferToken::Vouchers {
            sender_id: Uuid::new_v4(),
            nonce: Uuid::new_v4(),
            vouchers: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        let decoded = TransferToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn token_json_shape_matches_the_qr_contract() {
        let sender_id = Uuid::new_v4();
        let token = TransferToken::Credit {
            sender_id,
            nonce: Uuid::new_v4(),
        };
        let json: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(token.encode()).unwrap(),
        )
        .unwrap();
        assert_eq!(json["type"], "credit-transfer");
        assert_eq!(json["senderId"], sender_id.to_string());
    }

    #[test]
    fn garbage_is_an_invalid_token() {
        assert!(matches!(
            TransferToken::decode("@@not-base64@@"),
            Err(StoreError::InvalidToken(_))
        ));
        let not_a_token = URL_SAFE_NO_PAD.encode(b"{\"type\":\"mystery\"}");
        assert!(matches!(
            TransferToken::decode(&not_a_token),
            Err(StoreError::InvalidToken(_))
        ));
    }

    #[test]
    fn self_transfer_is_rejected() {
        let id = Uuid::new_v4();
        assert!(matches!(
            ensure_distinct_parties(id, id),
            Err(StoreError::Validation(_))
        ));
        assert!(ensure_distinct_parties(id, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn dedup_preserves_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(dedup_ids(&[a, b, a]), vec![a, b]);
    }
}
