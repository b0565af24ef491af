//! Unit tests for handshake parsing and negotiation.

use rstest::rstest;

use super::*;
use crate::serve::negotiate_version;

#[rstest]
#[case::tcp("1|1|tcp|127.0.0.1:41000|jsonl", Network::Tcp, "127.0.0.1:41000")]
#[case::unix("1|3|unix|/tmp/kiln-1.sock|jsonl\n", Network::Unix, "/tmp/kiln-1.sock")]
fn well_formed_lines_parse(#[case] raw: &str, #[case] network: Network, #[case] address: &str) {
    let line: HandshakeLine = raw.parse().expect("line parses");
    assert_eq!(line.network(), network);
    assert_eq!(line.address(), address);
    assert_eq!(line.protocol(), RpcProtocol::Jsonl);
}

#[rstest]
#[case::too_few("1|1|tcp|127.0.0.1:1", HandshakeError::FieldCount(4))]
#[case::too_many("1|1|tcp|a|jsonl|extra", HandshakeError::FieldCount(6))]
#[case::garbage("hello world", HandshakeError::FieldCount(1))]
#[case::bad_core(
    "x|1|tcp|a|jsonl",
    HandshakeError::InvalidVersion { field: "core", value: "x".into() }
)]
#[case::bad_app(
    "1|-2|tcp|a|jsonl",
    HandshakeError::InvalidVersion { field: "app", value: "-2".into() }
)]
#[case::network("1|1|udp|a|jsonl", HandshakeError::UnknownNetwork("udp".into()))]
#[case::protocol("1|1|tcp|a|grpc", HandshakeError::UnknownProtocol("grpc".into()))]
#[case::empty_address("1|1|tcp||jsonl", HandshakeError::EmptyAddress)]
fn malformed_lines_are_rejected(#[case] raw: &str, #[case] expected: HandshakeError) {
    let error = raw.parse::<HandshakeLine>().expect_err("line should be rejected");
    assert_eq!(error, expected);
}

#[rstest]
#[case::accepted("1|1|tcp|a:1|jsonl", None)]
#[case::core(
    "2|1|tcp|a:1|jsonl",
    Some(HandshakeError::CoreVersion { found: 2 })
)]
#[case::app(
    "1|9|tcp|a:1|jsonl",
    Some(HandshakeError::AppVersion { found: 9, accepted: vec![1] })
)]
fn validation_checks_versions(#[case] raw: &str, #[case] expected: Option<HandshakeError>) {
    let line: HandshakeLine = raw.parse().expect("line parses");
    assert_eq!(line.validate(&HandshakeConfig::default()).err(), expected);
}

#[rstest]
#[case::lowest(1)]
#[case::high(9)]
fn host_without_version_preference_accepts_any(#[case] plugin_version: u32) {
    let config = HandshakeConfig::default().with_protocol_versions(Vec::new());
    let negotiated = negotiate_version(config.protocol_versions(), &[plugin_version]);
    assert_eq!(negotiated, Some(plugin_version), "plugin picks its own version");

    let line = HandshakeLine::new(plugin_version, Network::Tcp, "127.0.0.1:1");
    assert_eq!(line.validate(&config), Ok(()));
    assert!(config.accepts(plugin_version));
    assert_eq!(config.preferred_version(), None);
}

#[test]
fn display_matches_wire_format() {
    let line = HandshakeLine::new(2, Network::Unix, "/run/p.sock");
    assert_eq!(line.to_string(), "1|2|unix|/run/p.sock|jsonl");
}

#[rstest]
#[case::single("1", vec![1])]
#[case::several("1, 2,3", vec![1, 2, 3])]
#[case::junk_skipped("1,x,,4", vec![1, 4])]
#[case::empty("", vec![])]
fn version_lists_decode_leniently(#[case] raw: &str, #[case] expected: Vec<u32>) {
    assert_eq!(decode_versions(raw), expected);
}

#[test]
fn version_list_encoding_is_comma_separated() {
    let config = HandshakeConfig::new("COOKIE", "v").with_protocol_versions(vec![1, 2, 5]);
    assert_eq!(config.encode_versions(), "1,2,5");
    assert_eq!(config.magic_cookie_key(), "COOKIE");
    assert_eq!(config.preferred_version(), Some(5));
}
