use std::collections::BTreeSet;

use common::{Error, Result};

use super::ast::{Expr, UnaryOp};
use super::functions;

/// Inferred type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Num,
    Bool,
}

/// Identifiers an expression may reference: declared features plus a fixed
/// set of scope extras (bar builtins, plan variables, timer flags).
pub struct Scope<'a> {
    pub features: &'a BTreeSet<String>,
    pub extras: &'a [&'a str],
}

impl Scope<'_> {
    fn contains(&self, name: &str) -> bool {
        self.features.contains(name) || self.extras.contains(&name)
    }
}

/// Resolve every identifier and function reference in `expr` against the
/// scope and infer the result type. Numbers and booleans coerce freely at
/// operator boundaries, so the only failures are unknown names, unknown
/// functions, and arity mismatches.
pub fn resolve(expr: &Expr, scope: &Scope, location: &str) -> Result<Ty> {
    match expr {
        Expr::Number(_) => Ok(Ty::Num),
        Expr::Bool(_) => Ok(Ty::Bool),

        Expr::Ident(name) | Expr::Index { name, .. } => {
            if scope.contains(name) {
                Ok(Ty::Num)
            } else {
                Err(Error::Name {
                    symbol: name.clone(),
                    location: location.to_string(),
                })
            }
        }

        Expr::Unary { op, operand } => {
            resolve(operand, scope, location)?;
            Ok(match op {
                UnaryOp::Neg => Ty::Num,
                UnaryOp::Not => Ty::Bool,
            })
        }

        Expr::Binary { op, lhs, rhs } => {
            resolve(lhs, scope, location)?;
            resolve(rhs, scope, location)?;
            Ok(if op.yields_bool() { Ty::Bool } else { Ty::Num })
        }

        Expr::Call { name, args } => {
            let func = functions::lookup(name).ok_or_else(|| Error::Name {
                symbol: name.clone(),
                location: location.to_string(),
            })?;
            if args.len() != func.arity {
                return Err(Error::Parse {
                    location: location.to_string(),
                    message: format!(
                        "function '{name}' expects {} argument(s), got {}",
                        func.arity,
                        args.len()
                    ),
                });
            }
            for arg in args {
                resolve(arg, scope, location)?;
            }
            Ok(if func.yields_bool { Ty::Bool } else { Ty::Num })
        }
    }
}
