use serde::Serialize;
use serde_json::Value;

/// Recursion stops at this depth; deeper nodes get a coarse signature only.
pub const DEPTH_LIMIT: usize = 2;

/// Characters sampled from each end of a string node.
pub const STRING_SAMPLE_HEAD: usize = 40;
pub const STRING_SAMPLE_TAIL: usize = 40;

/// Keys sampled for objects beyond the depth limit.
pub const COARSE_KEY_SAMPLE: usize = 8;

/// Returned when a domain value cannot be converted to JSON at all. It never
/// matches a cached fingerprint, so the worst case is one extra row write.
pub const UNAVAILABLE_SENTINEL: &str = "!fp-unavailable";

/// Bounded-cost structural signature of `value`.
///
/// Deterministic, side-effect free, and invariant to object key insertion
/// order. Two values with equal fingerprints are treated as unchanged; this
/// is a heuristic equality oracle, not a hash with collision guarantees.
/// A collision only skips a rewrite of data that is still durably stored.
pub fn fingerprint(value: &Value) -> String {
    fingerprint_at(value, 0)
}

/// Fingerprint of any serializable domain value, falling back to the
/// sentinel when JSON conversion fails.
pub fn fingerprint_serializable<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(json) => fingerprint(&json),
        Err(_) => UNAVAILABLE_SENTINEL.to_string(),
    }
}

fn fingerprint_at(value: &Value, depth: usize) -> String {
    match value {
        Value::Null => "n".to_string(),
        Value::Bool(flag) => format!("b:{flag}"),
        Value::Number(number) => format!("#:{number}"),
        Value::String(text) => sample_string(text),
        Value::Array(items) => {
            if depth >= DEPTH_LIMIT {
                return format!("a:{}", items.len());
            }
            let children = items
                .iter()
                .map(|item| fingerprint_at(item, depth + 1))
                .collect::<Vec<_>>()
                .join(",");
            format!("a:{}:[{children}]", items.len())
        }
        Value::Object(fields) => {
            let mut keys = fields.keys().collect::<Vec<_>>();
            keys.sort_unstable();

            if depth >= DEPTH_LIMIT {
                let sampled = keys
                    .iter()
                    .take(COARSE_KEY_SAMPLE)
                    .map(|key| key.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                return format!("o:{}:{{{sampled}}}", fields.len());
            }

            let children = keys
                .into_iter()
                .map(|key| {
                    let child = fingerprint_at(&fields[key], depth + 1);
                    format!("{key}={child}")
                })
                .collect::<Vec<_>>()
                .join(";");
            format!("o:{}:{{{children}}}", fields.len())
        }
    }
}

// Length plus head/tail slices: detects edits anywhere in short text and
// boundary edits in long text without an O(n) scan per save.
fn sample_string(text: &str) -> String {
    let char_count = text.chars().count();
    if char_count <= STRING_SAMPLE_HEAD + STRING_SAMPLE_TAIL {
        return format!("s:{char_count}:{text}");
    }

    let head: String = text.chars().take(STRING_SAMPLE_HEAD).collect();
    let tail: String = {
        let mut reversed: Vec<char> = text.chars().rev().take(STRING_SAMPLE_TAIL).collect();
        reversed.reverse();
        reversed.into_iter().collect()
    };
    format!("s:{char_count}:{head}\u{1}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_are_tagged_by_type() {
        assert_eq!(fingerprint(&Value::Null), "n");
        assert_eq!(fingerprint(&json!(true)), "b:true");
        assert_eq!(fingerprint(&json!(42)), "#:42");
        assert_ne!(fingerprint(&json!("42")), fingerprint(&json!(42)));
    }

    #[test]
    fn key_insertion_order_does_not_change_signature() {
        let left = json!({"alpha": 1, "beta": [2, 3], "gamma": "x"});
        let right = json!({"gamma": "x", "beta": [2, 3], "alpha": 1});
        assert_eq!(fingerprint(&left), fingerprint(&right));
    }

    #[test]
    fn depth_limit_coarsens_nested_structure() {
        let shallow_a = json!({"outer": {"inner": {"a": 1, "b": 2}}});
        let shallow_b = json!({"outer": {"inner": {"a": 9, "b": 7}}});
        // Both third-level objects collapse to cardinality + key sample.
        assert_eq!(fingerprint(&shallow_a), fingerprint(&shallow_b));

        let different_shape = json!({"outer": {"inner": {"a": 1, "b": 2, "c": 3}}});
        assert_ne!(fingerprint(&shallow_a), fingerprint(&different_shape));
    }

    #[test]
    fn long_string_edits_at_boundaries_are_detected() {
        let body = "x".repeat(50_000);
        let base = fingerprint(&json!(body));

        let mut head_edit = body.clone();
        head_edit.replace_range(0..1, "y");
        assert_ne!(base, fingerprint(&json!(head_edit)));

        let tail_edit = format!("{}y", &body[..body.len() - 1]);
        assert_ne!(base, fingerprint(&json!(tail_edit)));

        // Appending changes the length even when both samples look alike.
        let appended = format!("{body}x");
        assert_ne!(base, fingerprint(&json!(appended)));
    }

    #[test]
    fn interior_edit_of_long_string_may_collide() {
        // Documented trade-off: the sample window cannot see mid-string
        // edits that keep the length. The data written is always the real
        // value, so a collision only skips one rewrite.
        let body = "x".repeat(10_000);
        let mut interior_edit = body.clone();
        interior_edit.replace_range(5_000..5_001, "y");
        assert_eq!(fingerprint(&json!(body)), fingerprint(&json!(interior_edit)));
    }

    #[test]
    fn multibyte_strings_sample_on_char_boundaries() {
        let body = "ß".repeat(300);
        let edited = format!("{}a", &body[..body.len() - 2]);
        assert_ne!(fingerprint(&json!(body)), fingerprint(&json!(edited)));
    }

    #[test]
    fn serializable_helper_matches_value_path() {
        #[derive(serde::Serialize)]
        struct Sample {
            id: &'static str,
            count: u32,
        }

        let direct = fingerprint(&json!({"id": "abc", "count": 3}));
        let via_helper = fingerprint_serializable(&Sample { id: "abc", count: 3 });
        assert_eq!(direct, via_helper);
    }
}
