//! Validator module - result checking for test fixtures
//!
//! A validator compares the value a sandbox returned for one fixture with the
//! fixture's expected answer. Validators are pure: no I/O, no sandbox access.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Number, Value};

use crate::fixture::TestFixture;

/// Default number of decimal places for float comparison
pub const DEFAULT_FLOAT_PRECISION: i32 = 3;

/// Outcome of validating one fixture
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorResult {
    pub passed: bool,
    /// Diagnostic sent to the broker as the post-test payload
    pub additional_data: Option<Value>,
}

impl ValidatorResult {
    pub fn new(passed: bool, additional_data: Option<Value>) -> Self {
        Self {
            passed,
            additional_data,
        }
    }

    pub fn pass() -> Self {
        Self::new(true, None)
    }

    pub fn fail() -> Self {
        Self::new(false, None)
    }
}

/// Validator trait for checking a fixture result
pub trait Validator: Send + Sync {
    fn validate(&self, test: &TestFixture, actual: &Value) -> ValidatorResult;
}

/// Passes iff the result deep-equals the expected answer
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualValidator;

impl Validator for EqualValidator {
    fn validate(&self, test: &TestFixture, actual: &Value) -> ValidatorResult {
        ValidatorResult::new(values_equal(&test.answer, actual), None)
    }
}

/// Passes iff `|expected - actual| <= 10^-precision` and the result is numeric
#[derive(Debug, Clone, Copy)]
pub struct FloatEqualValidator {
    pub precision: i32,
}

impl Default for FloatEqualValidator {
    fn default() -> Self {
        Self {
            precision: DEFAULT_FLOAT_PRECISION,
        }
    }
}

impl FloatEqualValidator {
    pub fn new(precision: i32) -> Self {
        Self { precision }
    }
}

impl Validator for FloatEqualValidator {
    fn validate(&self, test: &TestFixture, actual: &Value) -> ValidatorResult {
        let Some(actual) = actual.as_f64() else {
            return ValidatorResult::new(
                false,
                Some(json!("The result should be a float or integer.")),
            );
        };
        let expected = test.answer.as_f64().unwrap_or(0.0);
        let diff = (expected - actual).abs();
        ValidatorResult::new(
            diff <= 10f64.powi(-self.precision),
            Some(json!(diff)),
        )
    }
}

/// Validator backed by a closure
pub struct FnValidator<F>(pub F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(&TestFixture, &Value) -> ValidatorResult + Send + Sync,
{
    fn validate(&self, test: &TestFixture, actual: &Value) -> ValidatorResult {
        (self.0)(test, actual)
    }
}

/// Validator selected for a mission
#[derive(Clone)]
pub enum ValidatorKind {
    Equal,
    FloatEqual { precision: i32 },
    Custom(Arc<dyn Validator>),
}

impl Default for ValidatorKind {
    fn default() -> Self {
        ValidatorKind::Equal
    }
}

impl fmt::Debug for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorKind::Equal => write!(f, "Equal"),
            ValidatorKind::FloatEqual { precision } => {
                write!(f, "FloatEqual {{ precision: {} }}", precision)
            }
            ValidatorKind::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ValidatorKind {
    pub fn custom(validator: impl Validator + 'static) -> Self {
        ValidatorKind::Custom(Arc::new(validator))
    }

    pub fn validate(&self, test: &TestFixture, actual: &Value) -> ValidatorResult {
        match self {
            ValidatorKind::Equal => EqualValidator.validate(test, actual),
            ValidatorKind::FloatEqual { precision } => {
                FloatEqualValidator::new(*precision).validate(test, actual)
            }
            ValidatorKind::Custom(validator) => validator.validate(test, actual),
        }
    }
}

/// Deep equality where integers, floats and booleans compare by numeric value
/// (`true == 1`, `1 == 1.0`)
pub fn values_equal(expected: &Value, actual: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(expected), as_number(actual)) {
        return if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            x == y
        } else if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
            x == y
        } else {
            a.as_f64() == b.as_f64()
        };
    }
    match (expected, actual) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => expected == actual,
    }
}

fn as_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::Bool(b) => Some(Number::from(u8::from(*b))),
        _ => None,
    }
}
