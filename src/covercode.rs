//! Predefined cover codes
//!
//! A cover code wraps how the sandbox calls the user's function with the
//! fixture input. Missions refer to these by name or supply their own code.

pub const PY_UNWRAP_ARGS: &str = r#"
def cover(func, data):
    return func(*data)
"#;

pub const PY_2_STR: &str = r#"
def cover(func, data):
    return func(str(data))
"#;

pub const PY_TUPLE: &str = r#"
def cover(func, data):
    return func(tuple(data))
"#;

/// Look up a preset by name
pub fn preset(name: &str) -> Option<&'static str> {
    match name {
        "py_unwrap_args" => Some(PY_UNWRAP_ARGS),
        "py_2_str" => Some(PY_2_STR),
        "py_tuple" => Some(PY_TUPLE),
        _ => None,
    }
}

/// A preset name resolves to its code; anything else is literal code
pub fn resolve(value: &str) -> String {
    preset(value)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_preset_and_literal() {
        assert_eq!(resolve("py_tuple"), PY_TUPLE);
        assert_eq!(resolve("def cover(f, d): return f(d)"), "def cover(f, d): return f(d)");
        assert!(preset("js_unwrap_args").is_none());
    }
}
