use common::{Error, Result};

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::functions;

/// A scalar produced by expression evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
}

impl Value {
    /// Boolean coercion: nonzero and non-NaN numbers are truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
        }
    }

    pub fn as_num(&self) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
        }
    }
}

/// What an expression can see at evaluation time: the feature snapshot,
/// bar builtins, plan-scoped variables, and per-feature history.
pub trait EvalContext {
    /// Current value of an identifier, or `None` when it is unknown.
    fn value(&self, name: &str) -> Option<f64>;

    /// Value of `name` recorded `bars_ago` bars back. `None` when fewer
    /// than `bars_ago + 1` samples exist.
    fn history(&self, name: &str, bars_ago: usize) -> Option<f64>;
}

/// Evaluate an AST against a context.
///
/// Fixed left-to-right depth-first order, no side effects. Division by zero
/// produces a quiet NaN; any comparison involving NaN is false; `&&`/`||`
/// short-circuit. Unknown identifiers and arity mismatches fail the whole
/// expression (the caller treats that as a false predicate and logs it).
pub fn evaluate(expr: &Expr, ctx: &dyn EvalContext) -> Result<Value> {
    match expr {
        Expr::Number(n) => Ok(Value::Num(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),

        Expr::Ident(name) => ctx
            .value(name)
            .map(Value::Num)
            .ok_or_else(|| Error::Predicate(format!("unknown identifier '{name}'"))),

        // Short history yields NaN rather than an error.
        Expr::Index { name, bars_ago } => Ok(Value::Num(
            ctx.history(name, *bars_ago).unwrap_or(f64::NAN),
        )),

        Expr::Unary { op, operand } => {
            let v = evaluate(operand, ctx)?;
            Ok(match op {
                UnaryOp::Neg => Value::Num(-v.as_num()),
                UnaryOp::Not => Value::Bool(!v.truthy()),
            })
        }

        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => {
                let l = evaluate(lhs, ctx)?;
                if !l.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(evaluate(rhs, ctx)?.truthy()))
            }
            BinaryOp::Or => {
                let l = evaluate(lhs, ctx)?;
                if l.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(evaluate(rhs, ctx)?.truthy()))
            }
            _ => {
                let l = evaluate(lhs, ctx)?.as_num();
                let r = evaluate(rhs, ctx)?.as_num();
                Ok(apply_binary(*op, l, r))
            }
        },

        Expr::Call { name, args } => {
            let func = functions::lookup(name)
                .ok_or_else(|| Error::Predicate(format!("unknown function '{name}'")))?;
            if args.len() != func.arity {
                return Err(Error::Predicate(format!(
                    "function '{name}' expects {} argument(s), got {}",
                    func.arity,
                    args.len()
                )));
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, ctx)?.as_num());
            }
            let out = (func.apply)(&values);
            Ok(if func.yields_bool {
                Value::Bool(out != 0.0)
            } else {
                Value::Num(out)
            })
        }
    }
}

fn apply_binary(op: BinaryOp, l: f64, r: f64) -> Value {
    match op {
        BinaryOp::Add => Value::Num(l + r),
        BinaryOp::Sub => Value::Num(l - r),
        BinaryOp::Mul => Value::Num(l * r),
        BinaryOp::Div => {
            if r == 0.0 {
                Value::Num(f64::NAN)
            } else {
                Value::Num(l / r)
            }
        }
        BinaryOp::Rem => {
            if r == 0.0 {
                Value::Num(f64::NAN)
            } else {
                Value::Num(l % r)
            }
        }
        // Every comparison involving NaN is false, including != .
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq
        | BinaryOp::Ne => {
            if l.is_nan() || r.is_nan() {
                return Value::Bool(false);
            }
            Value::Bool(match op {
                BinaryOp::Lt => l < r,
                BinaryOp::Le => l <= r,
                BinaryOp::Gt => l > r,
                BinaryOp::Ge => l >= r,
                BinaryOp::Eq => l == r,
                BinaryOp::Ne => l != r,
                _ => unreachable!(),
            })
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuited above"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::expr::parser::parse;

    struct MapCtx {
        values: HashMap<String, f64>,
        history: HashMap<String, Vec<f64>>, // newest first
    }

    impl EvalContext for MapCtx {
        fn value(&self, name: &str) -> Option<f64> {
            self.values.get(name).copied()
        }

        fn history(&self, name: &str, bars_ago: usize) -> Option<f64> {
            self.history.get(name).and_then(|v| v.get(bars_ago)).copied()
        }
    }

    fn ctx() -> MapCtx {
        MapCtx {
            values: HashMap::from([
                ("close".to_string(), 101.0),
                ("ema20".to_string(), 99.5),
                ("rsi".to_string(), 28.0),
            ]),
            history: HashMap::from([("close".to_string(), vec![101.0, 98.0])]),
        }
    }

    fn eval(src: &str) -> Value {
        evaluate(&parse(src, "test").unwrap(), &ctx()).unwrap()
    }

    #[test]
    fn predicate_evaluates_true() {
        assert_eq!(eval("close > ema20 && rsi < 30"), Value::Bool(true));
    }

    #[test]
    fn division_by_zero_is_nan_and_comparisons_false() {
        match eval("1 / 0") {
            Value::Num(n) => assert!(n.is_nan()),
            other => panic!("expected NaN, got {other:?}"),
        }
        assert_eq!(eval("1 / 0 > 0"), Value::Bool(false));
        assert_eq!(eval("1 / 0 != 5"), Value::Bool(false));
    }

    #[test]
    fn history_index_reads_bars_ago() {
        assert_eq!(eval("close[1]"), Value::Num(98.0));
        match eval("close[5]") {
            Value::Num(n) => assert!(n.is_nan(), "short history must be NaN"),
            other => panic!("expected NaN, got {other:?}"),
        }
    }

    #[test]
    fn short_circuit_skips_rhs_errors() {
        // rhs references an unknown identifier but lhs decides the result
        assert_eq!(eval("false && missing_name > 0"), Value::Bool(false));
        assert_eq!(eval("true || missing_name > 0"), Value::Bool(true));
    }

    #[test]
    fn arity_mismatch_errors() {
        let expr = parse("abs(1, 2)", "test").unwrap();
        assert!(evaluate(&expr, &ctx()).is_err());
    }

    #[test]
    fn unknown_identifier_errors() {
        let expr = parse("nope + 1", "test").unwrap();
        assert!(evaluate(&expr, &ctx()).is_err());
    }

    #[test]
    fn nan_is_falsy() {
        assert_eq!(eval("!(0 / 0)"), Value::Bool(true));
    }
}
