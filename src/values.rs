//! Conversions between script values and native representations.
//!
//! Two directions live here: JSON documents into script values (backing
//! `Response.json()`), and the nested form encoder that turns arbitrary
//! script values into `application/x-www-form-urlencoded` bodies with
//! bracket-path composite keys (`card[number]=4242...`).

use anyhow::{anyhow, bail};
use starlark::values::dict::{AllocDict, DictRef};
use starlark::values::float::StarlarkFloat;
use starlark::values::list::{AllocList, ListRef};
use starlark::values::tuple::TupleRef;
use starlark::values::{Heap, Value, ValueLike};
use url::form_urlencoded;

/// Convert a parsed JSON document into script values. Objects become dicts,
/// arrays become lists, integral numbers become ints.
pub fn json_to_value<'v>(heap: &'v Heap, doc: &serde_json::Value) -> anyhow::Result<Value<'v>> {
    Ok(match doc {
        serde_json::Value::Null => Value::new_none(),
        serde_json::Value::Bool(b) => Value::new_bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                heap.alloc(i)
            } else if let Some(u) = n.as_u64() {
                heap.alloc(u)
            } else {
                heap.alloc(n.as_f64().ok_or_else(|| anyhow!("unrepresentable number {n}"))?)
            }
        }
        serde_json::Value::String(s) => heap.alloc(s.as_str()),
        serde_json::Value::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(json_to_value(heap, item)?);
            }
            heap.alloc(AllocList(values))
        }
        serde_json::Value::Object(fields) => {
            let mut pairs = Vec::with_capacity(fields.len());
            for (key, value) in fields {
                pairs.push((heap.alloc(key.as_str()), json_to_value(heap, value)?));
            }
            heap.alloc(AllocDict(pairs))
        }
    })
}

/// Encode a script value as a form-URL-encoded body.
///
/// The value tree is walked depth-first; each leaf emits one
/// `compositeKey=value` pair where the key is the bracket-path of mapping
/// keys, sequence indices, and attribute names leading to the leaf.
pub fn form_encode<'v>(value: Value<'v>, heap: &'v Heap) -> anyhow::Result<String> {
    let mut pairs = Vec::new();
    let mut path = Vec::new();
    emit(value, heap, &mut path, &mut pairs)?;
    Ok(pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&"))
}

fn escape(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Bracket-path formatting: the first component is bare, the rest are
/// bracketed. Components are percent-escaped individually so the brackets
/// themselves stay literal.
fn format_key(path: &[String]) -> String {
    let mut parts = path.iter();
    let mut key = match parts.next() {
        Some(first) => escape(first),
        None => String::new(),
    };
    for part in parts {
        key.push('[');
        key.push_str(&escape(part));
        key.push(']');
    }
    key
}

fn emit<'v>(
    value: Value<'v>,
    heap: &'v Heap,
    path: &mut Vec<String>,
    out: &mut Vec<(String, String)>,
) -> anyhow::Result<()> {
    if value.is_none() {
        out.push((format_key(path), "null".to_string()));
        return Ok(());
    }
    if let Some(b) = value.unpack_bool() {
        let text = if b { "true" } else { "false" };
        out.push((format_key(path), text.to_string()));
        return Ok(());
    }
    if value.get_type() == "int" {
        // Display of a script int is its decimal form at any width.
        out.push((format_key(path), value.to_string()));
        return Ok(());
    }
    if let Some(f) = value.downcast_ref::<StarlarkFloat>() {
        let f = f.0;
        if !f.is_finite() {
            bail!("cannot encode non-finite float {f}");
        }
        out.push((format_key(path), format!("{f}")));
        return Ok(());
    }
    if let Some(s) = value.unpack_str() {
        out.push((format_key(path), escape(s)));
        return Ok(());
    }
    if let Some(dict) = DictRef::from_value(value) {
        for (key, item) in dict.iter() {
            let key = key.unpack_str().ok_or_else(|| {
                anyhow!("{} has {} key, want string", value.get_type(), key.get_type())
            })?;
            path.push(key.to_string());
            emit(item, heap, path, out)?;
            path.pop();
        }
        return Ok(());
    }
    if let Some(list) = ListRef::from_value(value) {
        for (i, item) in list.iter().enumerate() {
            path.push(i.to_string());
            emit(item, heap, path, out)?;
            path.pop();
        }
        return Ok(());
    }
    if let Some(tuple) = TupleRef::from_value(value) {
        for (i, item) in tuple.iter().enumerate() {
            path.push(i.to_string());
            emit(item, heap, path, out)?;
            path.pop();
        }
        return Ok(());
    }
    let mut names = value.dir_attr();
    if !names.is_empty() {
        names.sort();
        for name in names {
            let item = value
                .get_attr(&name, heap)
                .map_err(|e| anyhow!("{e}"))?
                .unwrap_or_else(|| {
                    // dir() listed the attribute; a failed lookup is a bug in
                    // the value implementation, not in the script.
                    panic!(
                        "internal error: dir({}) includes {:?} but the value has no such field",
                        value.get_type(),
                        name
                    )
                });
            path.push(name);
            emit(item, heap, path, out)?;
            path.pop();
        }
        return Ok(());
    }
    bail!("cannot encode {} as JSON", value.get_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use starlark::environment::{Globals, GlobalsBuilder, LibraryExtension, Module};
    use starlark::eval::Evaluator;
    use starlark::syntax::{AstModule, Dialect};

    /// Evaluate a source expression and form-encode the resulting value.
    fn encode_src_with(globals: &Globals, src: &str) -> anyhow::Result<String> {
        let ast = AstModule::parse("test.star", src.to_string(), &Dialect::Extended)
            .map_err(|e| anyhow!("{e}"))?;
        let module = Module::new();
        let mut eval = Evaluator::new(&module);
        let value = eval.eval_module(ast, globals).map_err(|e| anyhow!("{e}"))?;
        form_encode(value, module.heap())
    }

    fn encode_src(src: &str) -> anyhow::Result<String> {
        encode_src_with(&Globals::standard(), src)
    }

    fn pair_set(encoded: &str) -> std::collections::BTreeSet<String> {
        encoded.split('&').map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flat_mapping() {
        assert_eq!(encode_src(r#"{"a": "b"}"#).unwrap(), "a=b");
    }

    #[test]
    fn test_nested_mapping_uses_bracket_keys() {
        assert_eq!(
            encode_src(r#"{"card": {"number": "4242424242424242"}}"#).unwrap(),
            "card[number]=4242424242424242"
        );
    }

    #[test]
    fn test_sequence_indices() {
        assert_eq!(encode_src(r#"{"xs": [10, 20]}"#).unwrap(), "xs[0]=10&xs[1]=20");
    }

    #[test]
    fn test_tuple_indices() {
        assert_eq!(encode_src(r#"{"xs": (1, 2)}"#).unwrap(), "xs[0]=1&xs[1]=2");
    }

    #[test]
    fn test_float() {
        assert_eq!(encode_src(r#"{"f": 1.5}"#).unwrap(), "f=1.5");
    }

    #[test]
    fn test_bool_and_none() {
        let encoded = encode_src(r#"{"t": True, "n": None}"#).unwrap();
        assert_eq!(pair_set(&encoded), pair_set("n=null&t=true"));
    }

    #[test]
    fn test_large_int_keeps_decimal_form() {
        assert_eq!(
            encode_src(r#"{"n": 123456789012345678901234567890}"#).unwrap(),
            "n=123456789012345678901234567890"
        );
    }

    #[test]
    fn test_non_finite_float_fails() {
        let module = Module::new();
        let inf = module.heap().alloc(f64::INFINITY);
        let err = form_encode(inf, module.heap()).unwrap_err();
        assert!(
            err.to_string().contains("cannot encode non-finite float"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_non_string_mapping_key_fails() {
        let err = encode_src(r#"{1: "a"}"#).unwrap_err();
        assert!(err.to_string().contains("want string"), "unexpected error: {err}");
    }

    #[test]
    fn test_function_value_fails() {
        let err = encode_src("{\"f\": len}").unwrap_err();
        assert!(
            err.to_string().contains("cannot encode"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_struct_attrs_sorted() {
        let globals = GlobalsBuilder::extended_by(&[LibraryExtension::StructType]).build();
        assert_eq!(
            encode_src_with(&globals, r#"{"s": struct(b = "2", a = "1")}"#).unwrap(),
            "s[a]=1&s[b]=2"
        );
    }

    #[test]
    fn test_values_are_percent_escaped() {
        assert_eq!(
            encode_src(r#"{"q": "a b&c"}"#).unwrap(),
            "q=a+b%26c"
        );
    }

    #[test]
    fn test_json_to_value_round_trip() {
        let module = Module::new();
        let doc = serde_json::json!({"card": {"number": "4242424242424242"}});
        let value = json_to_value(module.heap(), &doc).unwrap();
        assert_eq!(
            form_encode(value, module.heap()).unwrap(),
            "card[number]=4242424242424242"
        );
    }

    #[test]
    fn test_json_to_value_numbers() {
        let module = Module::new();
        let value = json_to_value(module.heap(), &serde_json::json!({"i": 3, "f": 2.5})).unwrap();
        let encoded = form_encode(value, module.heap()).unwrap();
        assert_eq!(pair_set(&encoded), pair_set("i=3&f=2.5"));
    }
}
