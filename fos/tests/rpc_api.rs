//! End-to-end scenarios through the dispatcher: the same request bodies a
//! client would POST, an in-memory lease store standing in for the
//! coordinator, and a scratch directory standing in for the deployed root.

use std::sync::Arc;

use camino_tempfile::Utf8TempDir;
use dist_lock::{LockClient, MemoryLeaseStore};
use file_ops::{FileOps, RootDir};
use fos::rpc::RpcHandler;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

struct Service {
    rpc: RpcHandler,
    cancel: CancellationToken,
    _root: Utf8TempDir,
}

fn service() -> anyhow::Result<Service> {
    let dir = Utf8TempDir::new()?;
    let root = RootDir::new(dir.path())?;
    let locks = LockClient::new(Arc::new(MemoryLeaseStore::new()));
    Ok(Service {
        rpc: RpcHandler::new(FileOps::new(root, locks)),
        cancel: CancellationToken::new(),
        _root: dir,
    })
}

impl Service {
    async fn call(&self, body: Value) -> Option<Value> {
        self.rpc
            .handle(body.to_string().as_bytes(), &self.cancel)
            .await
            .map(|out| serde_json::from_str(&out).expect("response must be valid JSON"))
    }

    async fn call_ok(&self, id: i64, method: &str, params: Value) -> Value {
        let response = self
            .call(json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id}))
            .await
            .expect("request with an id always gets a response");
        assert_eq!(response["id"], id, "response id mismatch: {response}");
        assert!(
            response.get("error").is_none(),
            "unexpected error: {response}"
        );
        response["result"].clone()
    }

    async fn call_err(&self, id: i64, method: &str, params: Value) -> Value {
        let response = self
            .call(json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id}))
            .await
            .expect("request with an id always gets a response");
        assert!(
            response.get("result").is_none(),
            "expected an error: {response}"
        );
        response["error"].clone()
    }
}

#[tokio::test]
async fn create_stat_delete() -> anyhow::Result<()> {
    let svc = service()?;

    assert_eq!(svc.call_ok(1, "create", json!(["test.txt", "FILE"])).await, true);
    assert_eq!(
        svc.call_ok(2, "getFileInfo", json!(["test.txt"])).await,
        json!({"name": "test.txt", "path": "test.txt", "size": 0})
    );
    assert_eq!(svc.call_ok(3, "delete", json!(["test.txt", true])).await, true);
    Ok(())
}

#[tokio::test]
async fn append_then_ranged_read() -> anyhow::Result<()> {
    let svc = service()?;

    svc.call_ok(1, "create", json!(["t", "DIRECTORY"])).await;
    svc.call_ok(2, "create", json!(["t/x.txt", "FILE"])).await;
    assert_eq!(svc.call_ok(3, "append", json!(["t/x.txt", "Hello"])).await, true);
    assert_eq!(
        svc.call_ok(4, "append", json!(["t/x.txt", " world!"])).await,
        true
    );
    assert_eq!(
        svc.call_ok(5, "read", json!(["t/x.txt", 0, 10_000])).await,
        "Hello world!"
    );
    assert_eq!(svc.call_ok(6, "read", json!(["t/x.txt", 6, 5])).await, "world");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_never_interleave() -> anyhow::Result<()> {
    // Ten writers hammering one path: a dense retry policy keeps the lock
    // contention from dominating test wall-clock time.
    let dir = Utf8TempDir::new()?;
    let root = RootDir::new(dir.path())?;
    let locks = LockClient::with_policy(
        Arc::new(MemoryLeaseStore::new()),
        dist_lock::DEFAULT_TTL,
        dist_lock::RetryPolicy {
            max_attempts: 1000,
            retry_base: std::time::Duration::from_millis(1),
        },
    );
    let svc = Service {
        rpc: RpcHandler::new(FileOps::new(root, locks)),
        cancel: CancellationToken::new(),
        _root: dir,
    };
    svc.call_ok(1, "create", json!(["w.log", "FILE"])).await;

    const WORKERS: usize = 10;
    const APPENDS: usize = 20;
    let word: String = "w".repeat(100);

    let svc = Arc::new(svc);
    let mut tasks = Vec::new();
    for worker in 0..WORKERS {
        let svc = Arc::clone(&svc);
        let word = word.clone();
        tasks.push(tokio::spawn(async move {
            for call in 0..APPENDS {
                let id = (worker * APPENDS + call) as i64;
                svc.call_ok(id, "append", json!(["w.log", word])).await;
            }
        }));
    }
    for task in tasks {
        task.await?;
    }

    let contents = svc
        .call_ok(-1, "read", json!(["w.log", 0, 1_048_576]))
        .await;
    let contents = contents.as_str().expect("read returns a string");
    assert_eq!(contents.len(), WORKERS * APPENDS * word.len());
    for chunk in contents.as_bytes().chunks(word.len()) {
        assert_eq!(chunk, word.as_bytes(), "interleaved append detected");
    }
    Ok(())
}

#[tokio::test]
async fn escape_attempt_is_rejected_without_side_effects() -> anyhow::Result<()> {
    let svc = service()?;

    let error = svc
        .call_err(1, "getFileInfo", json!(["../../etc/passwd"]))
        .await;
    assert_eq!(error["code"], -32602);
    assert_eq!(error["data"]["kind"], "PathEscape");

    let error = svc
        .call_err(2, "create", json!(["../outside.txt", "FILE"]))
        .await;
    assert_eq!(error["data"]["kind"], "PathEscape");
    Ok(())
}

#[tokio::test]
async fn directory_delete_semantics() -> anyhow::Result<()> {
    let svc = service()?;

    svc.call_ok(1, "create", json!(["t", "DIRECTORY"])).await;
    svc.call_ok(2, "create", json!(["t/a.txt", "FILE"])).await;
    svc.call_ok(3, "create", json!(["t/sub", "DIRECTORY"])).await;
    svc.call_ok(4, "create", json!(["t/sub/b.txt", "FILE"])).await;

    let error = svc.call_err(5, "delete", json!(["t", false])).await;
    assert_eq!(error["code"], -32603);
    assert_eq!(error["data"]["kind"], "DirectoryNotEmpty");

    assert_eq!(svc.call_ok(6, "delete", json!(["t", true])).await, true);
    let error = svc.call_err(7, "getFileInfo", json!(["t"])).await;
    assert_eq!(error["data"]["kind"], "NotFound");

    // Idempotence: deleting again reports false, never an error.
    assert_eq!(svc.call_ok(8, "delete", json!(["t", true])).await, false);
    Ok(())
}

#[tokio::test]
async fn batch_with_notification_responds_only_to_ids() -> anyhow::Result<()> {
    let svc = service()?;

    let response = svc
        .call(json!([
            {"jsonrpc": "2.0", "method": "create", "params": ["a", "FILE"], "id": 1},
            {"jsonrpc": "2.0", "method": "delete", "params": ["a", true]},
        ]))
        .await
        .expect("one sub-request carries an id");
    let Value::Array(responses) = response else {
        panic!("batch response must be an array, got {response}");
    };
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["result"], true);

    // The notification's delete still executed.
    let error = svc.call_err(2, "getFileInfo", json!(["a"])).await;
    assert_eq!(error["data"]["kind"], "NotFound");
    Ok(())
}

#[tokio::test]
async fn list_after_mixed_creates_is_complete() -> anyhow::Result<()> {
    let svc = service()?;

    svc.call_ok(1, "create", json!(["p", "DIRECTORY"])).await;
    svc.call_ok(2, "create", json!(["p/a", "FILE"])).await;
    svc.call_ok(3, "create", json!(["p/b", "FILE"])).await;
    svc.call_ok(4, "create", json!(["p/c", "DIRECTORY"])).await;

    let result = svc.call_ok(5, "listDirectory", json!(["p"])).await;
    let Value::Array(entries) = result else {
        panic!("listDirectory must return an array");
    };
    let mut names: Vec<_> = entries
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["a", "b", "c"]);
    Ok(())
}

#[tokio::test]
async fn write_read_round_trip_preserves_content() -> anyhow::Result<()> {
    let svc = service()?;

    let payload = "line one\nline two\ttabbed\nunicode: \u{1F980} crab";
    svc.call_ok(1, "create", json!(["round.txt", "FILE"])).await;
    svc.call_ok(2, "append", json!(["round.txt", payload])).await;
    assert_eq!(
        svc.call_ok(3, "read", json!(["round.txt", 0, 1_048_576])).await,
        payload
    );
    Ok(())
}

#[tokio::test]
async fn copy_and_move_through_the_wire() -> anyhow::Result<()> {
    let svc = service()?;

    svc.call_ok(1, "create", json!(["src.txt", "FILE"])).await;
    svc.call_ok(2, "append", json!(["src.txt", "data"])).await;
    assert_eq!(
        svc.call_ok(
            3,
            "copy",
            json!({"sourcePath": "src.txt", "targetPath": "copy.txt"})
        )
        .await,
        true
    );
    assert_eq!(
        svc.call_ok(
            4,
            "move",
            json!({"sourcePath": "copy.txt", "targetPath": "moved.txt"})
        )
        .await,
        true
    );
    assert_eq!(svc.call_ok(5, "read", json!(["moved.txt", 0, 100])).await, "data");
    let error = svc.call_err(6, "getFileInfo", json!(["copy.txt"])).await;
    assert_eq!(error["data"]["kind"], "NotFound");
    Ok(())
}
