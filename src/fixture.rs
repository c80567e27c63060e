//! Test fixtures and the categorized test plan

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One test case: input arguments and the expected answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFixture {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub answer: Value,
    /// Overrides the function the check calls for this fixture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Mission-specific fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestFixture {
    pub fn new(input: Value, answer: Value) -> Self {
        Self {
            input,
            answer,
            function_name: None,
            extra: Map::new(),
        }
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    /// Arguments as a list; a non-list input is a single argument
    pub fn args(&self) -> Vec<Value> {
        match &self.input {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

/// Ordered categories of fixtures. Iteration is sorted by category name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestPlan {
    categories: BTreeMap<String, Vec<TestFixture>>,
}

impl TestPlan {
    pub fn new(categories: BTreeMap<String, Vec<TestFixture>>) -> Self {
        Self { categories }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid tests JSON")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tests file {:?}", path))?;
        Self::from_json_str(&content)
    }

    pub fn insert(&mut self, category: impl Into<String>, tests: Vec<TestFixture>) {
        self.categories.insert(category.into(), tests);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TestFixture])> {
        self.categories
            .iter()
            .map(|(name, tests)| (name.as_str(), tests.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_iterates_sorted() {
        let plan = TestPlan::from_json_str(
            r#"{"Extra": [{"input": [1], "answer": 1}],
                "Basics": [{"input": [2, 3], "answer": 5, "explanation": "sum"}]}"#,
        )
        .unwrap();

        let names: Vec<&str> = plan.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Basics", "Extra"]);

        let (_, basics) = plan.iter().next().unwrap();
        assert_eq!(basics[0].answer, json!(5));
        assert_eq!(basics[0].extra.get("explanation"), Some(&json!("sum")));
    }

    #[test]
    fn test_fixture_args() {
        assert_eq!(TestFixture::new(json!([1, 2]), json!(3)).args(), vec![json!(1), json!(2)]);
        assert_eq!(TestFixture::new(json!("abc"), json!(3)).args(), vec![json!("abc")]);
        assert!(TestFixture::new(Value::Null, json!(3)).args().is_empty());
    }

    #[test]
    fn test_function_name_override_deserializes() {
        let fixture: TestFixture =
            serde_json::from_value(json!({"input": [], "answer": 0, "function_name": "golf"}))
                .unwrap();
        assert_eq!(fixture.function_name.as_deref(), Some("golf"));
        assert!(fixture.extra.is_empty());
    }
}
