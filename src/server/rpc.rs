//! JSON-RPC Surface
//!
//! Frames every SBP operation as JSON-RPC 2.0. Requests arrive as
//! `{jsonrpc, id, method, params}`; the dispatcher deserializes the params
//! for the named method, invokes the blackboard, and wraps the outcome in a
//! result or error envelope. Validation failures never mutate state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{self, SbpError};
use crate::core::ops::{EmitParams, EvaporateParams, InspectParams, RegisterScentParams, ScentIdParams, SniffParams};
use crate::core::Blackboard;
use crate::server::session::Session;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

/// Handle one request against the engine and the caller's session
pub async fn dispatch(
    board: &Arc<Blackboard>,
    session: &Arc<Session>,
    request: RpcRequest,
) -> RpcResponse {
    if request.jsonrpc != JSONRPC_VERSION {
        return RpcResponse::failure(
            request.id,
            error::INVALID_REQUEST,
            format!("unsupported jsonrpc version '{}'", request.jsonrpc),
        );
    }

    debug!("RPC {} (session {})", request.method, session.id);

    let id = request.id;
    match route(board, session, &request.method, request.params).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(e) => RpcResponse::failure(id, e.code(), e.to_string()),
    }
}

async fn route(
    board: &Arc<Blackboard>,
    session: &Arc<Session>,
    method: &str,
    params: Value,
) -> Result<Value, SbpError> {
    match method {
        "sbp/emit" => {
            let params: EmitParams = parse(params)?;
            to_value(board.emit(params).await?)
        }
        "sbp/sniff" => {
            let params: SniffParams = parse(params)?;
            to_value(board.sniff(params).await)
        }
        "sbp/register_scent" => {
            let params: RegisterScentParams = parse(params)?;
            to_value(board.register_scent(params).await?)
        }
        "sbp/deregister_scent" => {
            let params: ScentIdParams = parse(params)?;
            let result = board.deregister_scent(&params.scent_id).await;
            // Deregistration also drops the session's interest
            session.unsubscribe(&params.scent_id).await;
            to_value(result)
        }
        "sbp/evaporate" => {
            let params: EvaporateParams = parse(params)?;
            to_value(board.evaporate(params).await)
        }
        "sbp/inspect" => {
            let params: InspectParams = parse(params)?;
            to_value(board.inspect(params).await)
        }
        "sbp/subscribe" => {
            let params: ScentIdParams = parse(params)?;
            session.subscribe(&params.scent_id).await;
            Ok(json!({ "subscribed": params.scent_id }))
        }
        "sbp/unsubscribe" => {
            let params: ScentIdParams = parse(params)?;
            let known = session.unsubscribe(&params.scent_id).await;
            Ok(json!({
                "unsubscribed": params.scent_id,
                "status": if known { "unsubscribed" } else { "not_found" },
            }))
        }
        other => Err(SbpError::MethodNotFound(other.to_string())),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, SbpError> {
    serde_json::from_value(params).map_err(|e| SbpError::InvalidParams(e.to_string()))
}

fn to_value<T: Serialize>(result: T) -> Result<Value, SbpError> {
    serde_json::to_value(result).map_err(|e| SbpError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::server::session::SessionRegistry;

    async fn fixture() -> (Arc<Blackboard>, Arc<Session>) {
        let board = Arc::new(Blackboard::new(Arc::new(Config::default())));
        let registry = SessionRegistry::new(8);
        let session = registry.get_or_create(None).await;
        (board, session)
    }

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: json!(1),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn emit_and_sniff_round_trip() {
        let (board, session) = fixture().await;

        let response = dispatch(
            &board,
            &session,
            request(
                "sbp/emit",
                json!({"trail": "m", "type": "v", "intensity": 0.8}),
            ),
        )
        .await;
        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["action"], json!("created"));
        assert!(result["pheromone_id"].is_string());

        let response = dispatch(
            &board,
            &session,
            request("sbp/sniff", json!({"trails": ["m"]})),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["pheromones"].as_array().unwrap().len(), 1);
        assert!(result["aggregates"]["m/v"]["count"] == json!(1));
    }

    #[tokio::test]
    async fn invalid_params_yield_error_without_mutation() {
        let (board, session) = fixture().await;

        let response = dispatch(
            &board,
            &session,
            request("sbp/emit", json!({"type": "v", "intensity": 0.8})),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error::INVALID_PARAMS);

        let sniffed = dispatch(&board, &session, request("sbp/sniff", json!({}))).await;
        assert!(sniffed.result.unwrap()["pheromones"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_method_and_bad_version() {
        let (board, session) = fixture().await;

        let response = dispatch(&board, &session, request("sbp/teleport", json!({}))).await;
        assert_eq!(response.error.unwrap().code, error::METHOD_NOT_FOUND);

        let mut bad = request("sbp/sniff", json!({}));
        bad.jsonrpc = "1.0".to_string();
        let response = dispatch(&board, &session, bad).await;
        assert_eq!(response.error.unwrap().code, error::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn scent_registration_flow() {
        let (board, session) = fixture().await;

        let condition = json!({
            "type": "threshold",
            "trail": "a",
            "signal_type": "x",
            "aggregation": "max",
            "operator": ">=",
            "value": 0.7
        });

        let response = dispatch(
            &board,
            &session,
            request(
                "sbp/register_scent",
                json!({"scent_id": "s1", "condition": condition}),
            ),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["status"], json!("registered"));
        assert_eq!(result["current_condition_state"]["met"], json!(false));

        let response = dispatch(
            &board,
            &session,
            request("sbp/deregister_scent", json!({"scent_id": "s1"})),
        )
        .await;
        assert_eq!(response.result.unwrap()["status"], json!("deregistered"));

        let response = dispatch(
            &board,
            &session,
            request("sbp/deregister_scent", json!({"scent_id": "s1"})),
        )
        .await;
        assert_eq!(response.result.unwrap()["status"], json!("not_found"));
    }

    #[tokio::test]
    async fn malformed_condition_is_invalid_params() {
        let (board, session) = fixture().await;

        let response = dispatch(
            &board,
            &session,
            request(
                "sbp/register_scent",
                json!({
                    "scent_id": "bad",
                    "condition": {"type": "composite", "operator": "and", "conditions": []}
                }),
            ),
        )
        .await;
        assert_eq!(response.error.unwrap().code, error::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe() {
        let (board, session) = fixture().await;

        let response = dispatch(
            &board,
            &session,
            request("sbp/subscribe", json!({"scent_id": "s1"})),
        )
        .await;
        assert_eq!(response.result.unwrap()["subscribed"], json!("s1"));
        assert!(session.is_subscribed("s1").await);

        let response = dispatch(
            &board,
            &session,
            request("sbp/unsubscribe", json!({"scent_id": "s1"})),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["status"], json!("unsubscribed"));

        let response = dispatch(
            &board,
            &session,
            request("sbp/unsubscribe", json!({"scent_id": "s1"})),
        )
        .await;
        assert_eq!(response.result.unwrap()["status"], json!("not_found"));
    }

    #[tokio::test]
    async fn evaporate_and_inspect() {
        let (board, session) = fixture().await;

        dispatch(
            &board,
            &session,
            request(
                "sbp/emit",
                json!({"trail": "m", "type": "v", "intensity": 0.9,
                       "decay": {"type": "immortal"}}),
            ),
        )
        .await;

        let response = dispatch(
            &board,
            &session,
            request("sbp/evaporate", json!({"trail": "m"})),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["evaporated_count"], json!(1));
        assert_eq!(result["trails_affected"], json!(["m"]));

        let response = dispatch(
            &board,
            &session,
            request("sbp/inspect", json!({"include": ["stats"]})),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["stats"]["live_pheromones"], json!(0));
        assert_eq!(result["stats"]["emissions_total"], json!(1));
    }
}
