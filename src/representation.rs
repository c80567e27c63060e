//! Called-code representations
//!
//! Renders how a fixture's function call looks, for display in the editor.
//! Purely cosmetic; never affects pass/fail.

use serde::Deserialize;
use serde_json::Value;

use crate::fixture::TestFixture;

/// Formatting strategy for the "called as" string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// `checkio([1, 2])`
    #[default]
    Base,
    /// `checkio(1, 2)`
    UnwrapArgs,
    /// `checkio((1, 2))`
    PyTuple,
    /// `[1, 2]`
    Input,
}

impl Representation {
    pub fn represent(&self, test: &TestFixture, function_name: &str) -> String {
        match self {
            Representation::Base => format!("{}({})", function_name, ext_str(&test.input)),
            Representation::UnwrapArgs => {
                let args: Vec<String> = test.args().iter().map(ext_str).collect();
                format!("{}({})", function_name, args.join(", "))
            }
            Representation::PyTuple => {
                format!("{}({})", function_name, py_tuple(&test.args()))
            }
            Representation::Input => ext_str(&test.input),
        }
    }
}

/// Top-level strings are double-quoted; everything else is a Python-like literal
fn ext_str(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        other => py_literal(other),
    }
}

fn py_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(py_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("'{}': {}", k, py_literal(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
    }
}

fn py_tuple(items: &[Value]) -> String {
    match items {
        [single] => format!("({},)", py_literal(single)),
        _ => {
            let items: Vec<String> = items.iter().map(py_literal).collect();
            format!("({})", items.join(", "))
        }
    }
}
