//! Unit tests for the plugin-side SDK.

use std::io::Cursor;
use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::context::CallContext;
use crate::dispatch::{Endpoint, RpcClient};
use crate::error::PluginErrorKind;
use crate::value::Value;

struct Greeter;

impl PluginService for Greeter {
    fn execute(&self, method: &str, args: ValueMap) -> Result<ValueMap, MethodError> {
        match method {
            "echo" => Ok(args),
            "greet" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or("world");
                let mut result = ValueMap::new();
                result.insert("message".into(), Value::from(format!("Hello, {name}!")));
                Ok(result)
            }
            other => Err(MethodError::unknown_method(other)),
        }
    }
}

struct Unwell;

impl PluginService for Unwell {
    fn execute(&self, method: &str, _args: ValueMap) -> Result<ValueMap, MethodError> {
        Err(MethodError::unknown_method(method))
    }

    fn health_check(&self) -> Result<(), MethodError> {
        Err(MethodError::new("database unreachable"))
    }
}

fn converse<S: PluginService>(service: &S, input: &str) -> Vec<RpcResponse> {
    let mut output = Vec::new();
    handle_connection(Cursor::new(input.to_owned()), &mut output, service)
        .expect("connection handled");
    String::from_utf8(output)
        .expect("utf-8 output")
        .lines()
        .map(|line| serde_json::from_str(line).expect("response parses"))
        .collect()
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

#[test]
fn answers_each_request_in_order() {
    let input = concat!(
        r#"{"id":1,"method":"greet","args":{"name":"kiln"}}"#,
        "\n",
        r#"{"id":2,"method":"echo","args":{"n":3}}"#,
        "\n",
    );
    let responses = converse(&Greeter, input);
    assert_eq!(responses.len(), 2);

    let mut outcomes = responses.into_iter().map(RpcResponse::into_outcome);
    let greeting = outcomes.next().expect("first").expect("greet succeeds");
    assert_eq!(
        greeting.get("message").and_then(Value::as_str),
        Some("Hello, kiln!")
    );
    let echoed = outcomes.next().expect("second").expect("echo succeeds");
    assert_eq!(echoed.get("n").and_then(Value::as_i64), Some(3));
}

#[test]
fn unknown_method_is_reported_not_fatal() {
    let input = concat!(
        r#"{"id":7,"method":"dance","args":{}}"#,
        "\n",
        r#"{"id":8,"method":"echo","args":{}}"#,
        "\n",
    );
    let responses = converse(&Greeter, input);
    let ids: Vec<_> = responses.iter().map(RpcResponse::id).collect();
    assert_eq!(ids, [7, 8]);
    let failure = responses
        .into_iter()
        .next()
        .expect("first response")
        .into_outcome()
        .expect_err("unknown method");
    assert_eq!(failure.message(), "unknown method: dance");
}

#[test]
fn malformed_line_gets_error_under_id_zero() {
    let responses = converse(&Greeter, "{not json}\n\n");
    assert_eq!(responses.len(), 1, "blank lines are ignored");
    let response = responses.into_iter().next().expect("one response");
    assert_eq!(response.id(), 0);
    let failure = response.into_outcome().expect_err("malformed");
    assert!(failure.message().starts_with("malformed request"), "{}", failure.message());
}

#[rstest]
#[case::healthy(&Greeter as &dyn Probe, true)]
#[case::unwell(&Unwell as &dyn Probe, false)]
fn health_method_uses_health_check(#[case] service: &dyn Probe, #[case] healthy: bool) {
    let line = format!("{{\"id\":1,\"method\":\"{HEALTH_METHOD}\",\"args\":{{}}}}\n");
    let responses = service.probe(&line);
    let outcome = responses.into_iter().next().expect("one response").into_outcome();
    assert_eq!(outcome.is_ok(), healthy, "{outcome:?}");
}

/// Object-safe wrapper so services of different types share a case table.
trait Probe {
    fn probe(&self, input: &str) -> Vec<RpcResponse>;
}

impl<S: PluginService> Probe for S {
    fn probe(&self, input: &str) -> Vec<RpcResponse> {
        converse(self, input)
    }
}

// ---------------------------------------------------------------------------
// Negotiation and binding
// ---------------------------------------------------------------------------

#[rstest]
#[case::shared_highest(&[1, 2, 3], &[2, 3, 4], Some(3))]
#[case::single(&[1], &[1], Some(1))]
#[case::host_silent(&[], &[1, 2], Some(2))]
#[case::disjoint(&[3], &[1, 2], None)]
fn negotiates_highest_common_version(
    #[case] offered: &[u32],
    #[case] supported: &[u32],
    #[case] expected: Option<u32>,
) {
    assert_eq!(negotiate_version(offered, supported), expected);
}

#[test]
fn tcp_bind_respects_port_range() {
    let probe = TcpListener::bind("127.0.0.1:0").expect("find a port");
    let taken = probe.local_addr().expect("addr").port();
    let Some(next) = taken.checked_add(1) else {
        return;
    };
    let options = ServeOptions::default().with_port_range(taken, next);
    match PluginServer::bind(&options, 1) {
        Ok(server) => {
            let line = server.handshake_line();
            assert_eq!(line.network(), Network::Tcp);
            assert!(line.address().ends_with(&format!(":{next}")), "{}", line.address());
        }
        Err(ServeError::NoPortAvailable { .. }) => {}
        Err(other) => panic!("unexpected bind failure: {other}"),
    }
}

#[test]
fn fully_taken_range_reports_no_port() {
    let probe = TcpListener::bind("127.0.0.1:0").expect("find a port");
    let taken = probe.local_addr().expect("addr").port();
    let options = ServeOptions::default().with_port_range(taken, taken);
    let error = PluginServer::bind(&options, 1).expect_err("port busy");
    assert!(matches!(error, ServeError::NoPortAvailable { .. }), "{error}");
}

#[test]
fn missing_cookie_refuses_to_serve() {
    let config = HandshakeConfig::new("KILN_TEST_COOKIE_THAT_IS_NEVER_SET", "secret");
    let error = serve(&config, Greeter).expect_err("no cookie");
    assert!(matches!(error, ServeError::NotLaunchedByHost { .. }));
    assert!(error.to_string().contains("must be launched by the kiln host"));
}

// ---------------------------------------------------------------------------
// Host client against a served plugin
// ---------------------------------------------------------------------------

fn spawn_server(options: &ServeOptions) -> HandshakeLine {
    let server = PluginServer::bind(options, 1).expect("bind");
    let line = server.handshake_line();
    thread::spawn(move || server.run(Arc::new(Greeter)));
    line
}

#[test]
fn host_client_talks_to_served_plugin_over_tcp() {
    let line = spawn_server(&ServeOptions::default());
    let client = RpcClient::new("greeter", Endpoint::from_handshake(&line));
    let ctx = CallContext::with_timeout(Duration::from_secs(5));

    let mut args = ValueMap::new();
    args.insert("name".into(), Value::from("host"));
    let result = client.call("greet", &args, &ctx).expect("greet succeeds");
    assert_eq!(result.get("message").and_then(Value::as_str), Some("Hello, host!"));

    client.health_check(&ctx).expect("healthy");
    let error = client
        .call("dance", &ValueMap::new(), &ctx)
        .expect_err("unknown method");
    assert_eq!(error.kind(), PluginErrorKind::Execution);
}

#[cfg(unix)]
#[test]
fn host_client_talks_to_served_plugin_over_unix_socket() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let line = spawn_server(&ServeOptions::default().with_unix_socket(dir.path()));
    assert_eq!(line.network(), Network::Unix);
    let client = RpcClient::new("greeter", Endpoint::from_handshake(&line));
    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let result = client
        .call("echo", &ValueMap::new(), &ctx)
        .expect("echo succeeds");
    assert!(result.is_empty());
}
