//! JSON-RPC 2.0 dispatch.
//!
//! Takes a raw request body and produces the response body, if any: single
//! requests, batches, and notifications per the JSON-RPC 2.0 spec. Core
//! failures are translated into protocol errors with a machine-readable
//! `error.data.kind` so clients can discriminate without parsing messages.

use std::time::Duration;

use file_ops::{FileOps, FsError};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const JSONRPC_VERSION: &str = "2.0";

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A protocol-level error, ready to be marshalled into a response object.
#[derive(Debug)]
pub struct RpcError {
    code: i32,
    message: &'static str,
    kind: Option<&'static str>,
    detail: Option<String>,
}

impl RpcError {
    fn invalid_request(detail: impl Into<String>) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: "Invalid Request",
            kind: None,
            detail: Some(detail.into()),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: "Method not found",
            kind: None,
            detail: Some(format!("unknown method {method:?}")),
        }
    }

    fn invalid_params(detail: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: "Invalid params",
            kind: Some("InvalidArgument"),
            detail: Some(detail.into()),
        }
    }

    fn timeout() -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: "Internal error",
            kind: Some("Timeout"),
            detail: Some("request deadline exceeded".to_owned()),
        }
    }

    fn to_response(&self, id: Value) -> Value {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if self.kind.is_some() || self.detail.is_some() {
            error["data"] = json!({
                "kind": self.kind,
                "detail": self.detail,
            });
        }
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "error": error,
            "id": id,
        })
    }
}

impl From<FsError> for RpcError {
    fn from(e: FsError) -> Self {
        let (code, message) = if e.is_bad_request() {
            (INVALID_PARAMS, "Invalid params")
        } else {
            (INTERNAL_ERROR, "Internal error")
        };
        Self {
            code,
            message,
            kind: Some(e.kind()),
            detail: Some(e.to_string()),
        }
    }
}

/// Routes parsed requests to the file operations.
#[derive(Clone)]
pub struct RpcHandler {
    ops: FileOps,
    request_timeout: Duration,
}

impl RpcHandler {
    pub fn new(ops: FileOps) -> Self {
        Self::with_timeout(ops, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(ops: FileOps, request_timeout: Duration) -> Self {
        Self {
            ops,
            request_timeout,
        }
    }

    /// Processes one request body. Returns `None` when no output is owed:
    /// a lone notification, or a batch consisting entirely of notifications.
    pub async fn handle(&self, body: &[u8], cancel: &CancellationToken) -> Option<String> {
        let parsed: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                let error = RpcError {
                    code: PARSE_ERROR,
                    message: "Parse error",
                    kind: None,
                    detail: Some(e.to_string()),
                };
                return Some(error.to_response(Value::Null).to_string());
            }
        };

        match parsed {
            Value::Object(_) => self
                .handle_one(parsed, cancel)
                .await
                .map(|response| response.to_string()),
            Value::Array(requests) if !requests.is_empty() => {
                // Sub-requests run sequentially; responses keep request order,
                // notifications contribute nothing.
                let mut responses = Vec::new();
                for request in requests {
                    if let Some(response) = self.handle_one(request, cancel).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    Some(Value::Array(responses).to_string())
                }
            }
            _ => Some(
                RpcError::invalid_request("request must be an object or a non-empty array")
                    .to_response(Value::Null)
                    .to_string(),
            ),
        }
    }

    async fn handle_one(&self, request: Value, cancel: &CancellationToken) -> Option<Value> {
        let Value::Object(envelope) = request else {
            return Some(
                RpcError::invalid_request("request must be an object").to_response(Value::Null),
            );
        };

        // An absent id marks a notification; a present-but-null id is a
        // regular request whose response echoes null.
        let is_notification = !envelope.contains_key("id");
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);

        if envelope.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Some(RpcError::invalid_request("jsonrpc must be \"2.0\"").to_response(id));
        }
        let Some(method) = envelope.get("method").and_then(Value::as_str) else {
            return Some(RpcError::invalid_request("method must be a string").to_response(id));
        };
        let params = match envelope.get("params") {
            None => None,
            Some(value @ (Value::Array(_) | Value::Object(_))) => Some(value.clone()),
            Some(_) => {
                return Some(
                    RpcError::invalid_request("params must be an array or an object")
                        .to_response(id),
                );
            }
        };

        debug!(method, "dispatching request");
        let outcome = match tokio::time::timeout(
            self.request_timeout,
            self.dispatch(method, params, cancel),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::timeout()),
        };

        if is_notification {
            if let Err(e) = outcome {
                debug!(method, error = ?e, "notification failed, nothing to report");
            }
            return None;
        }
        Some(match outcome {
            Ok(result) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "result": result,
                "id": id,
            }),
            Err(e) => {
                info!(method, code = e.code, error = ?e.detail, "forwarding error to client");
                e.to_response(id)
            }
        })
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        match method {
            "getFileInfo" => {
                let p: PathParams = bind(params, &["path"])?;
                let info = self.ops.stat(&p.path).await?;
                Ok(to_json(&info))
            }
            "listDirectory" => {
                let p: PathParams = bind(params, &["path"])?;
                let entries = self.ops.list(&p.path).await?;
                Ok(to_json(&entries))
            }
            "create" => {
                let p: CreateParams = bind(params, &["path", "type"])?;
                match p.entry_type {
                    EntryType::File => self.ops.create_file(&p.path).await?,
                    EntryType::Directory => self.ops.create_dir(&p.path).await?,
                }
                Ok(Value::Bool(true))
            }
            "delete" => {
                let p: DeleteParams = bind(params, &["path", "recursive"])?;
                let removed = self.ops.delete(&p.path, p.recursive).await?;
                Ok(Value::Bool(removed))
            }
            "move" => {
                let p: TransferParams = bind(params, &["sourcePath", "targetPath"])?;
                self.ops.move_entry(&p.source_path, &p.target_path).await?;
                Ok(Value::Bool(true))
            }
            "copy" => {
                let p: TransferParams = bind(params, &["sourcePath", "targetPath"])?;
                self.ops.copy(&p.source_path, &p.target_path).await?;
                Ok(Value::Bool(true))
            }
            "append" => {
                let p: AppendParams = bind(params, &["path", "data"])?;
                self.ops.append(&p.path, &p.data, cancel).await?;
                Ok(Value::Bool(true))
            }
            "read" => {
                let p: ReadParams = bind(params, &["path", "offset", "length"])?;
                let offset = non_negative(p.offset, "offset")?;
                let length = non_negative(p.length, "length")?;
                let contents = self.ops.read(&p.path, offset, length).await?;
                Ok(Value::String(contents))
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
enum EntryType {
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "DIRECTORY")]
    Directory,
}

#[derive(Deserialize)]
struct CreateParams {
    path: String,
    #[serde(rename = "type")]
    entry_type: EntryType,
}

#[derive(Deserialize)]
struct DeleteParams {
    path: String,
    recursive: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferParams {
    source_path: String,
    target_path: String,
}

#[derive(Deserialize)]
struct AppendParams {
    path: String,
    data: String,
}

#[derive(Deserialize)]
struct ReadParams {
    path: String,
    offset: i64,
    length: i64,
}

/// Binds positional or named parameters into `T`. Positional arrays are
/// matched against `names` in declaration order, then both forms go through
/// the same typed deserialization.
fn bind<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
    names: &[&str],
) -> Result<T, RpcError> {
    let named = match params {
        None => Value::Object(Map::new()),
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::Array(items)) => {
            if items.len() != names.len() {
                return Err(RpcError::invalid_params(format!(
                    "expected {} parameters, got {}",
                    names.len(),
                    items.len()
                )));
            }
            Value::Object(
                names
                    .iter()
                    .map(|name| (*name).to_owned())
                    .zip(items)
                    .collect(),
            )
        }
        // The envelope check only lets arrays and objects through.
        Some(other) => {
            return Err(RpcError::invalid_params(format!(
                "unsupported params shape: {other}"
            )));
        }
    };
    serde_json::from_value(named).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn non_negative(value: i64, name: &str) -> Result<u64, RpcError> {
    u64::try_from(value)
        .map_err(|_| RpcError::from(FsError::InvalidArgument(format!("{name} must be nonnegative"))))
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("descriptor serialization should not fail")
}
