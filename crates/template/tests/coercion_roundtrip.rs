//! Property tests: rendering a primitive to text and coercing it back with
//! its declared type must reproduce the original value.

use proptest::prelude::*;
use serde_json::{json, Value};
use template::eval::value_to_string;
use template::{coerce, VarType};

fn roundtrip(value: &Value, ty: VarType) -> Value {
    let rendered = value_to_string(value);
    coerce(&Value::String(rendered), ty).expect("coercion should succeed")
}

proptest! {
    #[test]
    fn int_roundtrip(x in any::<i64>()) {
        let v = json!(x);
        prop_assert_eq!(roundtrip(&v, VarType::Int), v);
    }

    #[test]
    fn float_roundtrip(x in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
        let v = Value::from(x);
        let back = roundtrip(&v, VarType::Float);
        prop_assert_eq!(back.as_f64(), Some(x));
    }

    #[test]
    fn bool_roundtrip(b in any::<bool>()) {
        let v = json!(b);
        prop_assert_eq!(roundtrip(&v, VarType::Bool), v);
    }

    #[test]
    fn list_roundtrip(xs in proptest::collection::vec(any::<i64>(), 0..8)) {
        let v = json!(xs);
        prop_assert_eq!(roundtrip(&v, VarType::List), v);
    }

    #[test]
    fn dict_roundtrip(entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8)) {
        let v = json!(entries);
        prop_assert_eq!(roundtrip(&v, VarType::Dict), v);
    }

    #[test]
    fn string_lists_roundtrip(xs in proptest::collection::vec("[a-zA-Z0-9 ]{0,12}", 0..6)) {
        let v = json!(xs);
        prop_assert_eq!(roundtrip(&v, VarType::List), v);
    }
}
