//! Arithmetic operations, the stock provider used by demos and tests.

use async_trait::async_trait;
use exert_core::Context;
use serde_json::{json, Value};

use crate::operation::{Operation, OperationError};
use crate::provider::ServiceProvider;

/// Role served by [`arithmetic_provider`].
pub const ARITHMETIC_ROLE: &str = "Arithmetic";

/// Folds every bound input of the context, in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arithmetic {
    /// Sum
    Add,
    /// First minus the rest
    Subtract,
    /// Product
    Multiply,
    /// First divided by the rest
    Divide,
}

impl Arithmetic {
    /// Selector this operation is registered under.
    pub fn selector(self) -> &'static str {
        match self {
            Arithmetic::Add => "add",
            Arithmetic::Subtract => "subtract",
            Arithmetic::Multiply => "multiply",
            Arithmetic::Divide => "divide",
        }
    }

    fn operands(ctx: &Context) -> Result<Vec<f64>, OperationError> {
        let mut operands = Vec::new();
        for path in ctx.input_paths() {
            operands.push(ctx.get_as::<f64>(&path)?);
        }
        if operands.is_empty() {
            return Err(OperationError::business("no operands"));
        }
        Ok(operands)
    }

    fn apply(self, operands: &[f64]) -> Result<f64, OperationError> {
        let (first, rest) = match operands.split_first() {
            Some(split) => split,
            None => return Err(OperationError::business("no operands")),
        };
        let mut acc = *first;
        for &x in rest {
            acc = match self {
                Arithmetic::Add => acc + x,
                Arithmetic::Subtract => acc - x,
                Arithmetic::Multiply => acc * x,
                Arithmetic::Divide if x == 0.0 => {
                    return Err(OperationError::business("division by zero"))
                }
                Arithmetic::Divide => acc / x,
            };
        }
        Ok(acc)
    }
}

#[async_trait]
impl Operation for Arithmetic {
    async fn invoke(&self, ctx: &Context) -> Result<Value, OperationError> {
        let operands = Self::operands(ctx)?;
        let result = self.apply(&operands)?;
        // keep integral results integral on the wire
        if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
            Ok(json!(result as i64))
        } else {
            Ok(json!(result))
        }
    }
}

/// Provider serving `Arithmetic#add|subtract|multiply|divide`.
pub fn arithmetic_provider(name: impl Into<String>) -> ServiceProvider {
    [
        Arithmetic::Add,
        Arithmetic::Subtract,
        Arithmetic::Multiply,
        Arithmetic::Divide,
    ]
    .into_iter()
    .fold(
        ServiceProvider::new(name).with_role(ARITHMETIC_ROLE),
        |provider, op| provider.with_operation(op.selector(), op),
    )
}
