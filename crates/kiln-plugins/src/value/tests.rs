//! Unit tests for the dynamic value bag.

use rstest::rstest;
use serde_json::json;

use super::*;

#[test]
fn nested_shapes_survive_json() {
    let original = json!({
        "name": "kiln",
        "count": 42,
        "ratio": 0.5,
        "big": 18_446_744_073_709_551_615_u64,
        "negative": -7,
        "enabled": true,
        "missing": null,
        "tags": ["a", "b", 3],
        "nested": {"inner": {"deep": [1, {"x": false}]}}
    });

    let value = Value::from(original.clone());
    let encoded = serde_json::to_string(&value).expect("serialise value");
    let decoded: Value = serde_json::from_str(&encoded).expect("deserialise value");

    assert_eq!(decoded, value);
    assert_eq!(serde_json::Value::from(decoded), original);
}

#[test]
fn large_unsigned_integers_are_not_rounded() {
    let value = Value::from(u64::MAX);
    let encoded = serde_json::to_string(&value).expect("serialise");
    assert_eq!(encoded, "18446744073709551615");
}

#[rstest]
#[case::string(Value::from("hi"), "hi")]
#[case::number(Value::from(7_i64), "7")]
#[case::boolean(Value::from(true), "true")]
#[case::null(Value::Null, "null")]
#[case::list(Value::from(vec![Value::from(1_i64), Value::from("a")]), "[1,\"a\"]")]
fn display_renders_strings_bare(#[case] value: Value, #[case] expected: &str) {
    assert_eq!(value.to_string(), expected);
}

#[test]
fn non_finite_float_becomes_null() {
    assert!(Value::from(f64::NAN).is_null());
    assert!(Value::from(f64::INFINITY).is_null());
}

#[test]
fn accessors_match_variant() {
    let map: Value = [(String::from("k"), Value::from("v"))].into_iter().collect();
    assert_eq!(
        map.as_map().and_then(|inner| inner.get("k")).and_then(Value::as_str),
        Some("v")
    );
    assert_eq!(Value::from(3_i64).as_i64(), Some(3));
    assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
    assert_eq!(Value::from(false).as_bool(), Some(false));
    assert!(Value::from("x").as_map().is_none());
    assert_eq!(Value::from(vec![Value::Null]).as_list().map(<[Value]>::len), Some(1));
}

#[test]
fn map_keys_serialise_in_sorted_order() {
    let mut bag = ValueMap::new();
    bag.insert("zeta".into(), Value::from(1_i64));
    bag.insert("alpha".into(), Value::from(2_i64));
    let encoded = serde_json::to_string(&bag).expect("serialise map");
    assert_eq!(encoded, r#"{"alpha":2,"zeta":1}"#);
}
