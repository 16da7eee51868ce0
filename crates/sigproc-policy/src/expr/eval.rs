//! Tree-walking evaluator with a step budget and cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

use super::{BinaryOp, Expr, ExprError, Function, UnaryOp};

/// Steps an evaluation may take before it is aborted
pub const DEFAULT_STEP_BUDGET: u64 = 100_000;

/// Names visible to an expression
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    facts: &'a Value,
    bindings: &'a IndexMap<String, Value>,
}

impl<'a> Scope<'a> {
    /// Scope over `facts` with the given already-evaluated `let` bindings
    pub fn new(facts: &'a Value, bindings: &'a IndexMap<String, Value>) -> Self {
        Self { facts, bindings }
    }

    fn lookup(&self, name: &str) -> Value {
        if let Some(v) = self.bindings.get(name) {
            return v.clone();
        }
        self.facts.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// Evaluates expressions, counting every visited node against a budget
pub struct Evaluator<'c> {
    budget: u64,
    steps: u64,
    cancel: Option<&'c AtomicBool>,
}

impl<'c> Evaluator<'c> {
    /// Evaluator allowing `budget` steps
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            steps: 0,
            cancel: None,
        }
    }

    /// Abort with [`ExprError::Cancelled`] once `flag` is set
    pub fn with_cancel(mut self, flag: &'c AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Steps consumed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Evaluate a condition; `null` counts as false, non-booleans are errors
    pub fn eval_condition(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<bool, ExprError> {
        let value = self.eval(expr, scope)?;
        truthy(&value)
    }

    /// Evaluate an expression to a value
    pub fn eval(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExprError> {
        self.tick()?;
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => Ok(scope.lookup(name)),
            Expr::Field(inner, name) => {
                let base = self.eval(inner, scope)?;
                Ok(base.get(name.as_str()).cloned().unwrap_or(Value::Null))
            }
            Expr::Index(inner, index) => {
                let base = self.eval(inner, scope)?;
                let key = self.eval(index, scope)?;
                Ok(index_value(&base, &key))
            }
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value, scope)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!self.eval_condition(inner, scope)?)),
            Expr::Unary(UnaryOp::Neg, inner) => {
                let v = self.eval(inner, scope)?;
                match v.as_i64() {
                    Some(i) => i.checked_neg().map(Value::from).map_or_else(
                        || float(-(i as f64)),
                        Ok,
                    ),
                    None => match v.as_f64() {
                        Some(f) => float(-f),
                        None => Err(ExprError::eval(format!("cannot negate {}", type_name(&v)))),
                    },
                }
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => Ok(Value::Bool(
                self.eval_condition(lhs, scope)? || self.eval_condition(rhs, scope)?,
            )),
            Expr::Binary(BinaryOp::And, lhs, rhs) => Ok(Value::Bool(
                self.eval_condition(lhs, scope)? && self.eval_condition(rhs, scope)?,
            )),
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs, scope)?;
                let b = self.eval(rhs, scope)?;
                binary(*op, &a, &b)
            }
            Expr::Call(function, args) => self.call(*function, args, scope),
        }
    }

    fn tick(&mut self) -> Result<(), ExprError> {
        self.steps += 1;
        if self.steps > self.budget {
            return Err(ExprError::BudgetExceeded(self.budget));
        }
        if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(ExprError::Cancelled);
        }
        Ok(())
    }

    fn call(
        &mut self,
        function: Function,
        args: &[Expr],
        scope: &Scope<'_>,
    ) -> Result<Value, ExprError> {
        if function == Function::Coalesce {
            for arg in args {
                let v = self.eval(arg, scope)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            return Ok(Value::Null);
        }

        let values = args
            .iter()
            .map(|a| self.eval(a, scope))
            .collect::<Result<Vec<_>, _>>()?;
        let name = function.name();

        match (function, values.as_slice()) {
            (Function::Has, [v]) => Ok(Value::Bool(match v {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                _ => true,
            })),
            (Function::StartsWith | Function::EndsWith, [Value::Null, _]) => Ok(Value::Bool(false)),
            (Function::StartsWith, [Value::String(s), Value::String(p)]) => {
                Ok(Value::Bool(s.starts_with(p.as_str())))
            }
            (Function::EndsWith, [Value::String(s), Value::String(p)]) => {
                Ok(Value::Bool(s.ends_with(p.as_str())))
            }
            (Function::Contains, [haystack, needle]) => contains(haystack, needle).map(Value::Bool),
            (Function::Lower | Function::Upper | Function::TrimPrefix, [Value::Null, ..]) => {
                Ok(Value::Null)
            }
            (Function::Lower, [Value::String(s)]) => Ok(Value::String(s.to_lowercase())),
            (Function::Upper, [Value::String(s)]) => Ok(Value::String(s.to_uppercase())),
            (Function::TrimPrefix, [Value::String(s), Value::String(p)]) => Ok(Value::String(
                s.strip_prefix(p.as_str()).unwrap_or(s).to_string(),
            )),
            (Function::Len, [v]) => Ok(Value::from(match v {
                Value::Null => 0,
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExprError::eval(format!(
                        "len() is not defined for {}",
                        type_name(other)
                    )))
                }
            })),
            (Function::Split, [Value::Null, _]) => Ok(Value::Array(Vec::new())),
            (Function::Split, [Value::String(_), Value::String(sep)]) if sep.is_empty() => {
                Err(ExprError::eval("split() separator must not be empty"))
            }
            (Function::Split, [Value::String(s), Value::String(sep)]) => Ok(Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            (Function::Str, [v]) => Ok(match v {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s.clone()),
                Value::Bool(b) => Value::String(b.to_string()),
                Value::Number(n) => Value::String(n.to_string()),
                other => Value::String(other.to_string()),
            }),
            (_, args) => Err(ExprError::eval(format!(
                "{name}() is not defined for ({})",
                args.iter().map(type_name).collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

fn truthy(value: &Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(ExprError::eval(format!(
            "condition must be a boolean, got {}",
            type_name(other)
        ))),
    }
}

fn index_value(base: &Value, key: &Value) -> Value {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        _ => a == b,
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExprError> {
    match (haystack, needle) {
        (Value::Null, _) => Ok(false),
        (Value::Array(items), n) => Ok(items.iter().any(|item| values_equal(item, n))),
        (Value::Object(map), Value::String(k)) => Ok(map.contains_key(k)),
        (Value::String(s), Value::String(n)) => Ok(s.contains(n.as_str())),
        (Value::String(_), Value::Null) | (Value::Object(_), Value::Null) => Ok(false),
        (h, n) => Err(ExprError::eval(format!(
            "cannot test whether {} contains {}",
            type_name(h),
            type_name(n)
        ))),
    }
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(a, b))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(a, b))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, a, b),
        BinaryOp::In => contains(b, a).map(Value::Bool),
        BinaryOp::Add => match (a, b) {
            (Value::String(x), Value::String(y)) => Ok(Value::String(format!("{x}{y}"))),
            (Value::Array(x), Value::Array(y)) => {
                Ok(Value::Array(x.iter().chain(y.iter()).cloned().collect()))
            }
            _ => arithmetic(op, a, b),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, a, b),
        BinaryOp::Or => Ok(Value::Bool(truthy(a)? || truthy(b)?)),
        BinaryOp::And => Ok(Value::Bool(truthy(a)? && truthy(b)?)),
    }
}

fn compare(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, ExprError> {
    let ordering = match (a, b) {
        (Value::Null, _) | (_, Value::Null) => return Ok(Value::Bool(false)),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => {
            return Err(ExprError::eval(format!(
                "cannot compare {} with {}",
                type_name(a),
                type_name(b)
            )))
        }
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    }))
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, ExprError> {
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(ExprError::eval(format!(
            "arithmetic is not defined for {} and {}",
            type_name(a),
            type_name(b)
        )));
    };

    if op != BinaryOp::Div {
        if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
            let result = match op {
                BinaryOp::Add => x.checked_add(y),
                BinaryOp::Sub => x.checked_sub(y),
                _ => x.checked_mul(y),
            };
            if let Some(r) = result {
                return Ok(Value::from(r));
            }
        }
    }

    let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
    match op {
        BinaryOp::Add => float(x + y),
        BinaryOp::Sub => float(x - y),
        BinaryOp::Mul => float(x * y),
        _ if y == 0.0 => Err(ExprError::eval("division by zero")),
        _ => float(x / y),
    }
}

fn float(f: f64) -> Result<Value, ExprError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExprError::eval("arithmetic produced a non-finite number"))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
