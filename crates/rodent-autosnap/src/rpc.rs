//! RPC surface
//!
//! Registers the `Policies.Autosnap.*` command handlers on the JSON-RPC
//! server. Successful results carry a `{success, message, payload}`
//! envelope; failures map the engine error kind to an RPC error code with
//! the structured metadata as data.

use crate::manager::PolicyManager;
use crate::policy::EditPolicyParams;
use futures::FutureExt;
use rodent_core::Error;
use rodent_jsonrpc::{error_codes, JsonRpcRequest, JsonRpcResponse, JsonRpcServer};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub const METHOD_LIST: &str = "Policies.Autosnap.List";
pub const METHOD_GET: &str = "Policies.Autosnap.Get";
pub const METHOD_CREATE: &str = "Policies.Autosnap.Create";
pub const METHOD_UPDATE: &str = "Policies.Autosnap.Update";
pub const METHOD_DELETE: &str = "Policies.Autosnap.Delete";
pub const METHOD_RUN: &str = "Policies.Autosnap.Run";
pub const METHOD_MONITORS: &str = "Policies.Autosnap.Monitors";

#[derive(Debug, Deserialize)]
struct IdParams {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    id: Uuid,
    #[serde(default)]
    remove_snapshots: bool,
}

#[derive(Debug, Deserialize)]
struct RunParams {
    id: Uuid,
    #[serde(default)]
    schedule_index: usize,
    #[serde(default)]
    dry_run: bool,
}

fn envelope(message: impl Into<String>, payload: Value) -> Value {
    json!({
        "success": true,
        "message": message.into(),
        "payload": payload,
    })
}

fn rpc_error(id: Value, err: &Error) -> JsonRpcResponse {
    let code = match err {
        Error::Validation { .. } => error_codes::VALIDATION_ERROR,
        Error::NotFound(_) => error_codes::NOT_FOUND,
        Error::Cancelled(_) => error_codes::CANCELLED,
        _ => error_codes::ENGINE_ERROR,
    };
    JsonRpcResponse::error_with_data(id, code, err.to_string(), json!(err.metadata()))
}

fn parse_params<T: serde::de::DeserializeOwned>(
    req: &JsonRpcRequest,
) -> Result<T, JsonRpcResponse> {
    serde_json::from_value(req.params.clone()).map_err(|e| {
        JsonRpcResponse::error(
            req.id.clone(),
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {}", e),
        )
    })
}

/// Register every autosnap command on the server.
pub async fn register_handlers(server: &JsonRpcServer, manager: PolicyManager) {
    let m = manager.clone();
    server
        .register_handler(
            METHOD_LIST,
            Box::new(move |req| {
                let manager = m.clone();
                async move {
                    let policies = manager.list_policies().await;
                    JsonRpcResponse::success(
                        req.id,
                        envelope(
                            "policies listed",
                            json!({"policies": policies, "count": policies.len()}),
                        ),
                    )
                }
                .boxed()
            }),
        )
        .await;

    let m = manager.clone();
    server
        .register_handler(
            METHOD_GET,
            Box::new(move |req| {
                let manager = m.clone();
                async move {
                    let params: IdParams = match parse_params(&req) {
                        Ok(p) => p,
                        Err(resp) => return resp,
                    };
                    match manager.get_policy(params.id).await {
                        Ok(policy) => JsonRpcResponse::success(
                            req.id,
                            envelope("policy fetched", json!(policy)),
                        ),
                        Err(e) => rpc_error(req.id, &e),
                    }
                }
                .boxed()
            }),
        )
        .await;

    let m = manager.clone();
    server
        .register_handler(
            METHOD_CREATE,
            Box::new(move |req| {
                let manager = m.clone();
                async move {
                    let params: EditPolicyParams = match parse_params(&req) {
                        Ok(p) => p,
                        Err(resp) => return resp,
                    };
                    match manager.add_policy(params).await {
                        Ok(policy) => JsonRpcResponse::success(
                            req.id,
                            envelope("policy created", json!(policy)),
                        ),
                        Err(e) => rpc_error(req.id, &e),
                    }
                }
                .boxed()
            }),
        )
        .await;

    let m = manager.clone();
    server
        .register_handler(
            METHOD_UPDATE,
            Box::new(move |req| {
                let manager = m.clone();
                async move {
                    let params: EditPolicyParams = match parse_params(&req) {
                        Ok(p) => p,
                        Err(resp) => return resp,
                    };
                    let Some(id) = params.id else {
                        return JsonRpcResponse::error(
                            req.id,
                            error_codes::INVALID_PARAMS,
                            "Update requires a policy id",
                        );
                    };
                    match manager.update_policy(id, params).await {
                        Ok(policy) => JsonRpcResponse::success(
                            req.id,
                            envelope("policy updated", json!(policy)),
                        ),
                        Err(e) => rpc_error(req.id, &e),
                    }
                }
                .boxed()
            }),
        )
        .await;

    let m = manager.clone();
    server
        .register_handler(
            METHOD_DELETE,
            Box::new(move |req| {
                let manager = m.clone();
                async move {
                    let params: DeleteParams = match parse_params(&req) {
                        Ok(p) => p,
                        Err(resp) => return resp,
                    };
                    match manager.remove_policy(params.id, params.remove_snapshots).await {
                        Ok(outcome) => JsonRpcResponse::success(
                            req.id,
                            envelope("policy removed", json!(outcome)),
                        ),
                        Err(e) => rpc_error(req.id, &e),
                    }
                }
                .boxed()
            }),
        )
        .await;

    let m = manager.clone();
    server
        .register_handler(
            METHOD_RUN,
            Box::new(move |req| {
                let manager = m.clone();
                async move {
                    let params: RunParams = match parse_params(&req) {
                        Ok(p) => p,
                        Err(resp) => return resp,
                    };
                    match manager
                        .run_policy(params.id, params.schedule_index, params.dry_run)
                        .await
                    {
                        Ok(result) => JsonRpcResponse::success(
                            req.id,
                            envelope("policy run", json!(result)),
                        ),
                        Err(e) => rpc_error(req.id, &e),
                    }
                }
                .boxed()
            }),
        )
        .await;

    let m = manager;
    server
        .register_handler(
            METHOD_MONITORS,
            Box::new(move |req| {
                let manager = m.clone();
                async move {
                    let monitors = manager.list_monitors().await;
                    JsonRpcResponse::success(
                        req.id,
                        envelope(
                            "monitors listed",
                            json!({"monitors": monitors, "count": monitors.len()}),
                        ),
                    )
                }
                .boxed()
            }),
        )
        .await;
}
