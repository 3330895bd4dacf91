//! Expression evaluation: operators with the permissive division rules,
//! short-circuit logic, and inline calls resolving through functions,
//! builtin methods, and commands in that order.

use era_ast::{Expr, VarRef};
use era_common::{EraError, Result};

use crate::value::Value;
use crate::vm::{ExecResult, Vm};

impl Vm {
    pub(crate) fn eval_expr(&mut self, e: &Expr) -> Result<Value> {
        match e {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var(var) => self.get_var_ref(var),
            Expr::Unary { op, expr } => {
                let v = self.eval_expr(expr)?;
                match op.as_str() {
                    "+" => Ok(Value::Int(v.as_int())),
                    "-" => Ok(Value::Int(-v.as_int())),
                    "!" => Ok(Value::Int(if v.truthy() { 0 } else { 1 })),
                    "~" => Ok(Value::Int(!v.as_int())),
                    _ => Err(EraError(format!("unsupported unary operator {:?}", op))),
                }
            }
            Expr::Binary { op, left, right } => match op.as_str() {
                // Short-circuit forms never evaluate their RHS when decided.
                "&&" => {
                    if !self.eval_expr(left)?.truthy() {
                        return Ok(Value::Int(0));
                    }
                    Ok(Value::Int(self.eval_expr(right)?.truthy() as i64))
                }
                "||" => {
                    if self.eval_expr(left)?.truthy() {
                        return Ok(Value::Int(1));
                    }
                    Ok(Value::Int(self.eval_expr(right)?.truthy() as i64))
                }
                "!&" => {
                    if !self.eval_expr(left)?.truthy() {
                        return Ok(Value::Int(1));
                    }
                    Ok(Value::Int(!self.eval_expr(right)?.truthy() as i64))
                }
                "!|" => {
                    if self.eval_expr(left)?.truthy() {
                        return Ok(Value::Int(0));
                    }
                    Ok(Value::Int(!self.eval_expr(right)?.truthy() as i64))
                }
                _ => {
                    let l = self.eval_expr(left)?;
                    let r = self.eval_expr(right)?;
                    eval_binary(op, &l, &r)
                }
            },
            Expr::Ternary { cond, on_true, on_false } => {
                if self.eval_expr(cond)?.truthy() {
                    self.eval_expr(on_true)
                } else {
                    self.eval_expr(on_false)
                }
            }
            Expr::Call { name, args } => self.eval_call_expr(name, args),
            Expr::Empty => Ok(Value::Int(0)),
            Expr::IncDec { target, op, post } => {
                let cur = self.get_var_ref(target)?;
                let delta = if op == "--" { -1 } else { 1 };
                let next = Value::Int(cur.as_int() + delta);
                self.set_var_ref(target, next.clone())?;
                Ok(if *post { cur } else { next })
            }
        }
    }

    fn eval_call_expr(&mut self, name: &str, args: &[Expr]) -> Result<Value> {
        let name = name.trim().to_uppercase();
        let raw_expr_arg = call_expr_expr_arg(args);
        let (values, missing) = self.eval_call_expr_args(args)?;
        let raw_arg = call_expr_raw_arg(&values, &missing);

        if prefers_method_like(&name) {
            if let Some(res) = self.exec_method_like(&name, &raw_expr_arg) {
                return res;
            }
        }
        if self.program.functions.contains_key(&name) {
            let opt_args: Vec<Option<Value>> = values
                .iter()
                .zip(missing.iter())
                .map(|(v, m)| if *m { None } else { Some(v.clone()) })
                .collect();
            match self.call_function(&name, opt_args) {
                Ok(_) => return Ok(self.get_var("RESULT")),
                Err(e) => {
                    if let Some(res) = self.exec_method_like(&name, &raw_expr_arg) {
                        if let Ok(v) = res {
                            return Ok(v);
                        }
                    }
                    return Err(e);
                }
            }
        }
        if let Some(res) = self.exec_method_like(&name, &raw_expr_arg) {
            return res;
        }
        if era_parser::is_known_command(&name) {
            if let ExecResult::None = self.run_command(&name, &raw_arg)? {
                return Ok(self.get_var("RESULT"));
            }
        }
        Err(EraError(format!("unknown expression call {}", name)))
    }

    fn eval_call_expr_args(&mut self, exprs: &[Expr]) -> Result<(Vec<Value>, Vec<bool>)> {
        let mut args = Vec::with_capacity(exprs.len());
        let mut missing = Vec::with_capacity(exprs.len());
        for e in exprs {
            if matches!(e, Expr::Empty) {
                args.push(Value::Int(0));
                missing.push(true);
                continue;
            }
            args.push(self.eval_expr(e)?);
            missing.push(false);
        }
        Ok((args, missing))
    }
}

fn prefers_method_like(name: &str) -> bool {
    matches!(
        name,
        "HTMLP" | "HTMLFONT" | "HTMLSTYLE" | "HTMLNOBR" | "HTMLCOLOR" | "HTMLBUTTON"
            | "HTMLAUTOBUTTON" | "HTMLNONBUTTON" | "REGEXPMATCH" | "HTML_STRINGLEN"
            | "HTML_SUBSTRING" | "HTML_STRINGLINES" | "ISDEFINED" | "EXISTVAR" | "GETVAR"
            | "GETVARS" | "SETVAR" | "EXISTFUNCTION" | "ENUMFUNCBEGINSWITH" | "ENUMFUNCENDSWITH"
            | "ENUMFUNCWITH" | "ENUMVARBEGINSWITH" | "ENUMVARENDSWITH" | "ENUMVARWITH"
            | "ENUMMACROBEGINSWITH" | "ENUMMACROENDSWITH" | "ENUMMACROWITH"
    )
}

fn call_expr_raw_arg(args: &[Value], missing: &[bool]) -> String {
    let mut raw = Vec::with_capacity(args.len());
    for (i, v) in args.iter().enumerate() {
        if missing.get(i).copied().unwrap_or(false) {
            raw.push(String::new());
            continue;
        }
        match v {
            Value::Str(s) => raw.push(format!("{:?}", s)),
            Value::Int(n) => raw.push(n.to_string()),
        }
    }
    raw.join(",")
}

fn call_expr_expr_arg(args: &[Expr]) -> String {
    let mut raw = Vec::with_capacity(args.len());
    for a in args {
        if matches!(a, Expr::Empty) {
            raw.push(String::new());
            continue;
        }
        raw.push(expr_to_source(a));
    }
    raw.join(",")
}

pub(crate) fn expr_to_source(e: &Expr) -> String {
    match e {
        Expr::Int(v) => v.to_string(),
        Expr::Str(s) => format!("{:?}", s),
        Expr::Var(VarRef { name, index }) => {
            let mut out = name.to_uppercase();
            for idx in index {
                out.push(':');
                out.push_str(&expr_to_source(idx));
            }
            out
        }
        Expr::Unary { op, expr } => format!("{}({})", op, expr_to_source(expr)),
        Expr::Binary { op, left, right } => {
            format!("({} {} {})", expr_to_source(left), op, expr_to_source(right))
        }
        Expr::Ternary { cond, on_true, on_false } => format!(
            "({} ? {} # {})",
            expr_to_source(cond),
            expr_to_source(on_true),
            expr_to_source(on_false)
        ),
        Expr::Call { name, args } => {
            let inner: Vec<String> = args
                .iter()
                .map(|a| if matches!(a, Expr::Empty) { String::new() } else { expr_to_source(a) })
                .collect();
            format!("{}({})", name.to_uppercase(), inner.join(","))
        }
        Expr::IncDec { target, op, post } => {
            let name = expr_to_source(&Expr::Var(target.clone()));
            if *post {
                format!("{}{}", name, op)
            } else {
                format!("{}{}", op, name)
            }
        }
        Expr::Empty => String::new(),
    }
}

pub(crate) fn eval_binary(op: &str, left: &Value, right: &Value) -> Result<Value> {
    let either_str = left.is_str() || right.is_str();
    let bool_int = |b: bool| Value::Int(b as i64);
    match op {
        "+" => {
            if either_str {
                Ok(Value::Str(format!("{}{}", left.as_str(), right.as_str())))
            } else {
                Ok(Value::Int(left.as_int().wrapping_add(right.as_int())))
            }
        }
        "-" => Ok(Value::Int(left.as_int().wrapping_sub(right.as_int()))),
        "*" => {
            // String * count repeats; non-positive counts give "".
            if left.is_str() && !right.is_str() {
                let n = right.as_int();
                return Ok(Value::Str(repeat_str(&left.as_str(), n)));
            }
            if right.is_str() && !left.is_str() {
                let n = left.as_int();
                return Ok(Value::Str(repeat_str(&right.as_str(), n)));
            }
            Ok(Value::Int(left.as_int().wrapping_mul(right.as_int())))
        }
        "/" => {
            // Gameplay scripts must not abort on x/0; treat it as x/1.
            if right.as_int() == 0 {
                return Ok(Value::Int(left.as_int()));
            }
            Ok(Value::Int(left.as_int().wrapping_div(right.as_int())))
        }
        "%" => {
            if right.as_int() == 0 {
                return Ok(Value::Int(0));
            }
            Ok(Value::Int(left.as_int().wrapping_rem(right.as_int())))
        }
        "<<" => Ok(Value::Int(left.as_int().wrapping_shl(right.as_int() as u32))),
        ">>" => Ok(Value::Int(left.as_int().wrapping_shr(right.as_int() as u32))),
        "&" => Ok(Value::Int(left.as_int() & right.as_int())),
        "|" => Ok(Value::Int(left.as_int() | right.as_int())),
        "^" => Ok(Value::Int(left.as_int() ^ right.as_int())),
        "^^" => Ok(bool_int(left.truthy() != right.truthy())),
        "==" => {
            if either_str {
                Ok(bool_int(left.as_str() == right.as_str()))
            } else {
                Ok(bool_int(left.as_int() == right.as_int()))
            }
        }
        "!=" => {
            if either_str {
                Ok(bool_int(left.as_str() != right.as_str()))
            } else {
                Ok(bool_int(left.as_int() != right.as_int()))
            }
        }
        // Mixed-type ordering compares lexicographically as strings.
        "<" => {
            if either_str {
                Ok(bool_int(left.as_str() < right.as_str()))
            } else {
                Ok(bool_int(left.as_int() < right.as_int()))
            }
        }
        "<=" => {
            if either_str {
                Ok(bool_int(left.as_str() <= right.as_str()))
            } else {
                Ok(bool_int(left.as_int() <= right.as_int()))
            }
        }
        ">" => {
            if either_str {
                Ok(bool_int(left.as_str() > right.as_str()))
            } else {
                Ok(bool_int(left.as_int() > right.as_int()))
            }
        }
        ">=" => {
            if either_str {
                Ok(bool_int(left.as_str() >= right.as_str()))
            } else {
                Ok(bool_int(left.as_int() >= right.as_int()))
            }
        }
        "&&" => Ok(bool_int(left.truthy() && right.truthy())),
        "!&" => Ok(bool_int(!(left.truthy() && right.truthy()))),
        "||" => Ok(bool_int(left.truthy() || right.truthy())),
        "!|" => Ok(bool_int(!(left.truthy() || right.truthy()))),
        _ => Err(EraError(format!("unsupported binary operator {:?}", op))),
    }
}

fn repeat_str(s: &str, n: i64) -> String {
    if n <= 0 {
        return String::new();
    }
    s.repeat(n as usize)
}

pub(crate) fn eval_assign_binary(op: &str, left: &Value, right: &Value) -> Result<Value> {
    let base = op
        .strip_suffix('=')
        .ok_or_else(|| EraError(format!("unsupported assignment operator {:?}", op)))?;
    match base {
        "+" | "-" | "*" | "/" | "%" | "&" | "|" | "^" | "<<" | ">>" => {
            eval_binary(base, left, right)
        }
        _ => Err(EraError(format!("unsupported assignment operator {:?}", op))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_division() {
        assert_eq!(eval_binary("/", &Value::Int(7), &Value::Int(0)).unwrap(), Value::Int(7));
        assert_eq!(eval_binary("%", &Value::Int(7), &Value::Int(0)).unwrap(), Value::Int(0));
        assert_eq!(eval_binary("/", &Value::Int(7), &Value::Int(2)).unwrap(), Value::Int(3));
    }

    #[test]
    fn string_concat_and_repeat() {
        assert_eq!(
            eval_binary("+", &Value::Str("a".into()), &Value::Int(1)).unwrap(),
            Value::Str("a1".into())
        );
        assert_eq!(
            eval_binary("*", &Value::Str("ab".into()), &Value::Int(3)).unwrap(),
            Value::Str("ababab".into())
        );
        assert_eq!(
            eval_binary("*", &Value::Str("ab".into()), &Value::Int(-1)).unwrap(),
            Value::Str("".into())
        );
    }

    #[test]
    fn mixed_comparison_is_lexicographic() {
        assert_eq!(
            eval_binary("<", &Value::Str("10".into()), &Value::Int(9)).unwrap(),
            Value::Int(1)
        );
        assert_eq!(eval_binary("<", &Value::Int(10), &Value::Int(9)).unwrap(), Value::Int(0));
    }

    #[test]
    fn logic_negation_operators() {
        assert_eq!(eval_binary("!&", &Value::Int(1), &Value::Int(1)).unwrap(), Value::Int(0));
        assert_eq!(eval_binary("!|", &Value::Int(0), &Value::Int(0)).unwrap(), Value::Int(1));
        assert_eq!(eval_binary("^^", &Value::Int(1), &Value::Int(0)).unwrap(), Value::Int(1));
    }
}
