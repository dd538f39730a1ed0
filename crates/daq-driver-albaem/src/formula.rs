//! Per-channel calibration formulas.
//!
//! A formula is an [`evalexpr`] expression over the single variable `value`
//! (the raw sample), e.g. `value*2` or `math::sqrt(value) * 1e6`. Formulas are
//! compiled once when set; text that does not compile, references another
//! variable, calls a function outside the numeric whitelist, or does not
//! evaluate to a number is rejected before it can reach the acquisition path.
//!
//! Integer literals are compiled as floats, so `value*(1/2)` halves the
//! sample instead of truncating `1/2` to zero.

use daq_core::error::{AppResult, DaqError};
use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, HashMapContext, Node, Operator, Value,
};

/// The only variable a formula may reference.
pub const SAMPLE_VARIABLE: &str = "value";

/// Non-`math::` builtins a formula may call.
const ALLOWED_FUNCTIONS: &[&str] = &["min", "max", "floor", "ceil", "round"];

/// A compiled calibration formula.
#[derive(Debug, Clone)]
pub struct CalibrationFormula {
    text: String,
    tree: Option<Node>,
}

impl Default for CalibrationFormula {
    fn default() -> Self {
        Self::identity()
    }
}

impl CalibrationFormula {
    /// The formula that returns samples unchanged.
    pub fn identity() -> Self {
        Self {
            text: SAMPLE_VARIABLE.to_string(),
            tree: None,
        }
    }

    /// Compile a formula. Text is lowercased and trimmed first.
    ///
    /// # Errors
    /// [`DaqError::Formula`] on syntax errors, unknown variables,
    /// disallowed functions, or a result that is not a number.
    pub fn compile(text: &str) -> AppResult<Self> {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(DaqError::formula(text, "formula is empty"));
        }
        if normalized == SAMPLE_VARIABLE {
            return Ok(Self::identity());
        }

        let mut tree = build_operator_tree(&normalized)
            .map_err(|e| DaqError::formula(text, e.to_string()))?;
        promote_integers(&mut tree);

        if let Some(unknown) = tree
            .iter_variable_identifiers()
            .find(|name| *name != SAMPLE_VARIABLE)
        {
            return Err(DaqError::formula(
                text,
                format!("unknown variable '{unknown}', only '{SAMPLE_VARIABLE}' is available"),
            ));
        }

        if let Some(function) = tree
            .iter_function_identifiers()
            .find(|name| !is_allowed_function(name))
        {
            return Err(DaqError::formula(
                text,
                format!("function '{function}' is not allowed"),
            ));
        }

        // Dangling operators and non-numeric results only show up on evaluation
        let context = sample_context(1.0).map_err(|e| DaqError::formula(text, e.to_string()))?;
        tree.eval_number_with_context(&context)
            .map_err(|e| DaqError::formula(text, e.to_string()))?;

        Ok(Self {
            text: normalized,
            tree: Some(tree),
        })
    }

    /// Normalized formula text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True for the pass-through formula `value`.
    pub fn is_identity(&self) -> bool {
        self.tree.is_none()
    }

    /// Evaluate the formula for one raw sample.
    ///
    /// # Errors
    /// [`DaqError::Formula`] if evaluation fails or turns a finite sample into
    /// a non-finite value.
    pub fn apply(&self, sample: f64) -> AppResult<f64> {
        let Some(tree) = &self.tree else {
            return Ok(sample);
        };

        let context =
            sample_context(sample).map_err(|e| DaqError::formula(&self.text, e.to_string()))?;

        let result = tree
            .eval_number_with_context(&context)
            .map_err(|e| DaqError::formula(&self.text, format!("value={sample}: {e}")))?;

        if sample.is_finite() && !result.is_finite() {
            return Err(DaqError::formula(
                &self.text,
                format!("value={sample} evaluates to {result}"),
            ));
        }
        Ok(result)
    }

    /// Evaluate the formula for every sample, into a new vector.
    pub fn apply_all(&self, samples: &[f64]) -> AppResult<Vec<f64>> {
        samples.iter().map(|&sample| self.apply(sample)).collect()
    }
}

fn sample_context(sample: f64) -> evalexpr::EvalexprResult<HashMapContext> {
    let mut context = HashMapContext::new();
    context.set_value(SAMPLE_VARIABLE.to_string(), Value::Float(sample))?;
    Ok(context)
}

/// Rewrite integer constants as floats so division is never truncating.
fn promote_integers(node: &mut Node) {
    if let Operator::Const { value } = node.operator_mut() {
        if let Value::Int(int) = *value {
            *value = Value::Float(int as f64);
        }
    }
    for child in node.children_mut() {
        promote_integers(child);
    }
}

fn is_allowed_function(name: &str) -> bool {
    name.starts_with("math::") || ALLOWED_FUNCTIONS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let formula = CalibrationFormula::compile("  VALUE ").unwrap();
        assert!(formula.is_identity());
        assert_eq!(formula.text(), "value");
        assert!(formula.apply(f64::NAN).unwrap().is_nan());
        assert_eq!(CalibrationFormula::default().text(), "value");
    }

    #[test]
    fn test_scaling_formula() {
        let formula = CalibrationFormula::compile("Value*2").unwrap();
        assert_eq!(formula.text(), "value*2");
        assert_eq!(formula.apply_all(&[1.0, -2.5]).unwrap(), vec![2.0, -5.0]);
    }

    #[test]
    fn test_math_functions() {
        let formula = CalibrationFormula::compile("max(value, 0.0) + math::sqrt(value * value)").unwrap();
        assert_eq!(formula.apply(-3.0).unwrap(), 3.0);
        assert_eq!(formula.apply(2.0).unwrap(), 4.0);
    }

    #[test]
    fn test_rejects_bad_formulas() {
        for text in [
            "",
            "value *",
            "value*",
            "value +",
            "(value",
            "current * 2",
            "typeof(value)",
            "math::is_nan(value)",
        ] {
            let err = CalibrationFormula::compile(text).unwrap_err();
            assert!(
                matches!(err, DaqError::Formula { .. }),
                "{text:?} should be rejected, got {err}"
            );
        }
    }

    #[test]
    fn test_integer_literals_divide_as_floats() {
        let formula = CalibrationFormula::compile("value*(1/2)").unwrap();
        assert_eq!(formula.apply(4.0).unwrap(), 2.0);

        let formula = CalibrationFormula::compile("value + 7 / 2").unwrap();
        assert_eq!(formula.apply(0.0).unwrap(), 3.5);
    }

    #[test]
    fn test_singular_formula_still_compiles() {
        // Blows up at value=1 only; that is a per-sample failure, not a syntax one
        let formula = CalibrationFormula::compile("1 / (value - 1)").unwrap();
        assert_eq!(formula.apply(3.0).unwrap(), 0.5);
        assert!(formula.apply(1.0).is_err());
    }

    #[test]
    fn test_non_finite_result_is_an_error() {
        let formula = CalibrationFormula::compile("1.0 / value").unwrap();
        assert!(matches!(
            formula.apply(0.0),
            Err(DaqError::Formula { .. })
        ));
        assert_eq!(formula.apply(4.0).unwrap(), 0.25);
    }
}
