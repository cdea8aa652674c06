//! Request/response DTOs for the request-handling layer
//!
//! Requests are tagged by `op`. Amounts arrive as a JSON number or string and
//! are decoded strictly into minor units: fractions, exponents, signs and
//! non-numeric input are `INVALID_AMOUNT`, never rounded.
//!
//! ```json
//! {"op":"DEPOSIT","walletId":"...","amount":"5000","idempotencyKey":"psp-123"}
//! {"code":"OK","msg":"ok","data":{"walletId":"...","balance":5000,...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core_types::{MinorUnits, UserId, WalletId};
use crate::engine::{LedgerCommand, LedgerEngine};
use crate::error::LedgerError;
use crate::money::{MoneyError, parse_json_number, parse_minor_units};
use crate::wallet::OperationKind;

/// Balance-moving request body
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsRequest {
    pub wallet_id: WalletId,
    pub amount: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "op",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum LedgerRequest {
    Deposit(FundsRequest),
    Withdraw(FundsRequest),
    Lock(FundsRequest),
    Unlock(FundsRequest),
    CaptureLocked(FundsRequest),
    GetBalance { wallet_id: WalletId },
    GetDailyLimitStatus { wallet_id: WalletId },
    GetWallet { wallet_id: WalletId },
    CreateWallet { user_id: UserId },
    WalletForUser { user_id: UserId },
    SetActive { wallet_id: WalletId, active: bool },
    Verify { wallet_id: WalletId, verified_by: String },
    SetDailyLimits {
        wallet_id: WalletId,
        max_deposit: Value,
        max_withdrawal: Value,
    },
}

/// Decode a client amount into minor units
pub fn decode_amount(value: &Value) -> Result<MinorUnits, MoneyError> {
    match value {
        Value::Number(n) => parse_json_number(n),
        Value::String(s) => parse_minor_units(s),
        other => Err(MoneyError::InvalidFormat(format!(
            "expected number or string, got {}",
            other
        ))),
    }
}

impl FundsRequest {
    fn into_command(self, kind: OperationKind) -> Result<LedgerCommand, LedgerError> {
        let amount = decode_amount(&self.amount)?;
        let amount = i64::try_from(amount).map_err(|_| LedgerError::InvalidAmount)?;
        Ok(LedgerCommand {
            kind,
            wallet_id: self.wallet_id,
            amount,
            idempotency_key: self.idempotency_key,
        })
    }
}

/// Response envelope: `code` is `OK` or a stable error code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerResponse {
    pub code: String,
    pub msg: String,
    /// HTTP status suggestion for gateways
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LedgerResponse {
    pub fn success<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                code: "OK".to_string(),
                msg: "ok".to_string(),
                status: 200,
                data: Some(data),
            },
            Err(e) => Self::from_error(&LedgerError::Internal(e.to_string())),
        }
    }

    pub fn from_error(err: &LedgerError) -> Self {
        Self {
            code: err.code().to_string(),
            msg: err.to_string(),
            status: err.http_status(),
            data: None,
        }
    }

    /// Request line that could not be parsed
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            code: "INVALID_REQUEST".to_string(),
            msg: msg.into(),
            status: 400,
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == "OK"
    }
}

/// Route one request to the engine
pub async fn dispatch(engine: &LedgerEngine, request: LedgerRequest) -> LedgerResponse {
    debug!(request = ?request, "Dispatching ledger request");
    let result = route(engine, request).await;
    match result {
        Ok(resp) => resp,
        Err(e) => LedgerResponse::from_error(&e),
    }
}

async fn route(engine: &LedgerEngine, request: LedgerRequest) -> Result<LedgerResponse, LedgerError> {
    let resp = match request {
        LedgerRequest::Deposit(body) => submit(engine, body, OperationKind::Deposit).await?,
        LedgerRequest::Withdraw(body) => submit(engine, body, OperationKind::Withdraw).await?,
        LedgerRequest::Lock(body) => submit(engine, body, OperationKind::Lock).await?,
        LedgerRequest::Unlock(body) => submit(engine, body, OperationKind::Unlock).await?,
        LedgerRequest::CaptureLocked(body) => {
            submit(engine, body, OperationKind::CaptureLocked).await?
        }
        LedgerRequest::GetBalance { wallet_id } => {
            LedgerResponse::success(&engine.get_balance(wallet_id).await?)
        }
        LedgerRequest::GetDailyLimitStatus { wallet_id } => {
            LedgerResponse::success(&engine.get_daily_limit_status(wallet_id).await?)
        }
        LedgerRequest::GetWallet { wallet_id } => {
            LedgerResponse::success(&engine.get_wallet(wallet_id).await?)
        }
        LedgerRequest::CreateWallet { user_id } => {
            LedgerResponse::success(&engine.create_wallet(user_id).await?)
        }
        LedgerRequest::WalletForUser { user_id } => {
            LedgerResponse::success(&engine.wallet_for_user(user_id).await?)
        }
        LedgerRequest::SetActive { wallet_id, active } => {
            LedgerResponse::success(&engine.set_active(wallet_id, active).await?)
        }
        LedgerRequest::Verify {
            wallet_id,
            verified_by,
        } => LedgerResponse::success(&engine.verify(wallet_id, &verified_by).await?),
        LedgerRequest::SetDailyLimits {
            wallet_id,
            max_deposit,
            max_withdrawal,
        } => {
            let max_deposit = decode_amount(&max_deposit)?;
            let max_withdrawal = decode_amount(&max_withdrawal)?;
            LedgerResponse::success(
                &engine
                    .set_daily_limits(wallet_id, max_deposit, max_withdrawal)
                    .await?,
            )
        }
    };
    Ok(resp)
}

async fn submit(
    engine: &LedgerEngine,
    body: FundsRequest,
    kind: OperationKind,
) -> Result<LedgerResponse, LedgerError> {
    let cmd = body.into_command(kind)?;
    Ok(LedgerResponse::success(&engine.submit(cmd).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::LedgerConfig;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_decode_amount() {
        assert_eq!(decode_amount(&json!(1500)), Ok(1500));
        assert_eq!(decode_amount(&json!("1500")), Ok(1500));
        assert_eq!(decode_amount(&json!(15.5)), Err(MoneyError::Fractional));
        assert_eq!(decode_amount(&json!("15.00")), Err(MoneyError::Fractional));
        assert_eq!(decode_amount(&json!(-3)), Err(MoneyError::NotPositive));
        assert_eq!(decode_amount(&json!(0)), Err(MoneyError::NotPositive));
        assert!(decode_amount(&json!(1e3)).is_err());
        assert!(decode_amount(&json!("1e3")).is_err());
        assert!(decode_amount(&json!(null)).is_err());
        assert!(decode_amount(&json!(true)).is_err());
    }

    #[test]
    fn test_parse_requests() {
        let id = WalletId::new_v4();
        let req: LedgerRequest = serde_json::from_value(json!({
            "op": "CAPTURE_LOCKED",
            "walletId": id,
            "amount": "250",
            "idempotencyKey": "cap-1"
        }))
        .unwrap();
        match req {
            LedgerRequest::CaptureLocked(body) => {
                assert_eq!(body.wallet_id, id);
                assert_eq!(body.idempotency_key.as_deref(), Some("cap-1"));
            }
            other => panic!("unexpected request {:?}", other),
        }

        let req: LedgerRequest =
            serde_json::from_value(json!({"op": "CREATE_WALLET", "userId": 9})).unwrap();
        assert_eq!(req, LedgerRequest::CreateWallet { user_id: 9 });

        assert!(serde_json::from_value::<LedgerRequest>(json!({"op": "TRANSFER"})).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_envelopes() {
        let engine = LedgerEngine::in_memory(LedgerConfig::default(), Arc::new(SystemClock));
        let created = dispatch(&engine, LedgerRequest::CreateWallet { user_id: 1 }).await;
        assert!(created.is_ok());
        let wallet_id: WalletId =
            serde_json::from_value(created.data.unwrap()["id"].clone()).unwrap();

        let deposit = |amount: Value| {
            LedgerRequest::Deposit(FundsRequest {
                wallet_id,
                amount,
                idempotency_key: None,
            })
        };

        let resp = dispatch(&engine, deposit(json!("5000"))).await;
        assert!(resp.is_ok());
        assert_eq!(resp.data.unwrap()["availableBalance"], 5000);

        let resp = dispatch(&engine, deposit(json!(12.5))).await;
        assert_eq!(resp.code, "INVALID_AMOUNT");
        assert_eq!(resp.status, 400);
        assert!(resp.data.is_none());

        let resp = dispatch(
            &engine,
            LedgerRequest::Withdraw(FundsRequest {
                wallet_id,
                amount: json!(5001),
                idempotency_key: None,
            }),
        )
        .await;
        assert_eq!(resp.code, "INSUFFICIENT_AVAILABLE_BALANCE");
        assert_eq!(resp.status, 422);

        let resp = dispatch(
            &engine,
            LedgerRequest::GetBalance {
                wallet_id: WalletId::new_v4(),
            },
        )
        .await;
        assert_eq!(resp.code, "WALLET_NOT_FOUND");
        assert_eq!(resp.status, 404);
    }
}
