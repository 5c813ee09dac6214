//! A scripted apiserver for driving reconcilers in tests
use http::{Method, Request, Response};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};

pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// A client whose requests are answered through the returned handle
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// A request the test has answered
pub struct Served {
    pub query: String,
    pub body: Value,
}

/// Wait for the next request, check its method and path, and answer with `status` and `response`
pub async fn serve(
    handle: &mut ApiServerHandle,
    method: Method,
    path: &str,
    status: u16,
    response: Value,
) -> Served {
    let (request, send) = handle.next_request().await.expect("service not called");
    assert_eq!(*request.method(), method, "unexpected method for {}", request.uri());
    assert_eq!(request.uri().path(), path);
    let query = request.uri().query().unwrap_or_default().to_string();
    let bytes = request.into_body().collect_bytes().await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    send.send_response(
        Response::builder()
            .status(status)
            .body(Body::from(serde_json::to_vec(&response).unwrap()))
            .unwrap(),
    );
    Served { query, body }
}

/// A failed `Status` as the apiserver sends it
pub fn status(code: u16, reason: &str, message: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "status": "Failure",
        "reason": reason,
        "message": message,
        "code": code,
    })
}

pub fn list(api_version: &str, kind: &str, items: Vec<Value>) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": format!("{kind}List"),
        "metadata": { "resourceVersion": "1" },
        "items": items,
    })
}
