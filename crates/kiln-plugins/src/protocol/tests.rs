//! Unit tests for RPC frames.

use rstest::rstest;

use super::*;
use crate::value::Value;

#[test]
fn request_line_is_single_json_object() {
    let mut args = ValueMap::new();
    args.insert("name".into(), Value::from("kiln"));
    let line = RpcRequest::new(3, "greet", args).to_line().expect("encode");

    assert!(line.ends_with('\n'), "line must be newline terminated");
    assert_eq!(line.matches('\n').count(), 1, "exactly one line expected");
    let decoded: RpcRequest = serde_json::from_str(line.trim_end()).expect("decode");
    assert_eq!(decoded.method(), "greet");
    assert_eq!(decoded.args().get("name").and_then(Value::as_str), Some("kiln"));
}

#[test]
fn request_without_args_defaults_to_empty_map() {
    let decoded: RpcRequest =
        serde_json::from_str(r#"{"id": 1, "method": "info"}"#).expect("decode");
    assert!(decoded.args().is_empty());
}

#[rstest]
#[case::success(r#"{"id":1,"result":{"k":"v"}}"#, Ok(1))]
#[case::empty(r#"{"id":2}"#, Ok(0))]
#[case::failure(r#"{"id":3,"error":{"message":"unknown method: nope"}}"#, Err("unknown method: nope"))]
fn responses_convert_to_outcomes(#[case] raw: &str, #[case] expected: Result<usize, &str>) {
    let response: RpcResponse = serde_json::from_str(raw).expect("decode response");
    let outcome = response.into_outcome();
    match (outcome, expected) {
        (Ok(map), Ok(len)) => assert_eq!(map.len(), len),
        (Err(failure), Err(message)) => assert_eq!(failure.message(), message),
        (other, wanted) => panic!("expected {wanted:?}, got {other:?}"),
    }
}

#[test]
fn failure_response_omits_result() {
    let line = RpcResponse::failure(9, "boom").to_line().expect("encode");
    assert_eq!(line, "{\"id\":9,\"error\":{\"message\":\"boom\"}}\n");
}
