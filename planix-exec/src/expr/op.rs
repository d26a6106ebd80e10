//! Operator evaluation over [`Value`]s.
//!
//! Everything here is a pure function; the graph in the parent
//! module decides when to call it. Unknown propagates through every
//! operator except IsKnown. Integer results are range checked
//! against the plan integer range and Real results against
//! finiteness; violations, like division by zero, are fatal
//! expression errors surfaced as `Err`.
use crate::{
    node::NodeState,
    value::{Value, ValueType, INT_MINUS_INFINITY, INT_PLUS_INFINITY},
};
use anyhow::{bail, Result};
use compact_str::format_compact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Abs,
    Sqrt,
}

impl ArithOp {
    /// Number of operands the operator takes; None for n-ary.
    pub fn arity(&self) -> Option<usize> {
        match self {
            ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div | ArithOp::Mod => {
                Some(2)
            }
            ArithOp::Min | ArithOp::Max => None,
            ArithOp::Abs | ArithOp::Sqrt => Some(1),
        }
    }

    /// Result type given whether every operand is an Integer.
    /// Division, modulo and square root are always Real.
    pub fn result_type(&self, all_int: bool) -> ValueType {
        match self {
            ArithOp::Div | ArithOp::Mod | ArithOp::Sqrt => ValueType::Real,
            _ if all_int => ValueType::Int,
            _ => ValueType::Real,
        }
    }
}

fn int_in_range(i: i64) -> Result<Value> {
    if (INT_MINUS_INFINITY..=INT_PLUS_INFINITY).contains(&i) {
        Ok(Value::Int(i as i32))
    } else {
        bail!("integer overflow: {i}")
    }
}

fn real_finite(r: f64) -> Result<Value> {
    if r.is_finite() {
        Ok(Value::Real(r))
    } else {
        bail!("real result is not finite: {r}")
    }
}

pub fn eval_not(v: &Value) -> Value {
    match v {
        Value::Bool(b) => Value::Bool(!b),
        _ => Value::Unknown,
    }
}

/// Any False wins; otherwise any Unknown; otherwise True.
pub fn eval_and(vs: impl Iterator<Item = Value>) -> Value {
    let mut unknown = false;
    for v in vs {
        match v {
            Value::Bool(false) => return Value::Bool(false),
            Value::Bool(true) => (),
            _ => unknown = true,
        }
    }
    if unknown { Value::Unknown } else { Value::Bool(true) }
}

/// Any True wins; otherwise any Unknown; otherwise False.
pub fn eval_or(vs: impl Iterator<Item = Value>) -> Value {
    let mut unknown = false;
    for v in vs {
        match v {
            Value::Bool(true) => return Value::Bool(true),
            Value::Bool(false) => (),
            _ => unknown = true,
        }
    }
    if unknown { Value::Unknown } else { Value::Bool(false) }
}

/// Any Unknown poisons; otherwise parity of Trues.
pub fn eval_xor(vs: impl Iterator<Item = Value>) -> Value {
    let mut parity = false;
    for v in vs {
        match v {
            Value::Bool(b) => parity ^= b,
            _ => return Value::Unknown,
        }
    }
    Value::Bool(parity)
}

pub fn eval_cmp(op: CmpOp, a: &Value, b: &Value) -> Value {
    match op {
        CmpOp::Eq => a.eq_value(b),
        CmpOp::Ne => eval_not(&a.eq_value(b)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            if !a.is_known() || !b.is_known() {
                return Value::Unknown;
            }
            match (a.as_real(), b.as_real()) {
                (Some(x), Some(y)) => Value::Bool(match op {
                    CmpOp::Lt => x < y,
                    CmpOp::Le => x <= y,
                    CmpOp::Gt => x > y,
                    CmpOp::Ge => x >= y,
                    CmpOp::Eq | CmpOp::Ne => unreachable!(),
                }),
                // ordering is only defined over numbers
                (_, _) => Value::Unknown,
            }
        }
    }
}

pub fn eval_arith(op: ArithOp, args: &[Value]) -> Result<Value> {
    if let Some(n) = op.arity() {
        if args.len() != n {
            bail!("{op:?} takes {n} operands, got {}", args.len())
        }
    } else if args.is_empty() {
        bail!("{op:?} takes at least one operand")
    }
    if args.iter().any(|v| !v.is_known()) {
        return Ok(Value::Unknown);
    }
    let all_int = args.iter().all(|v| matches!(v, Value::Int(_)));
    let reals: Vec<f64> = match args.iter().map(|v| v.as_real()).collect() {
        Some(rs) => rs,
        None => bail!("non numeric operand to {op:?}"),
    };
    match op {
        ArithOp::Add | ArithOp::Sub | ArithOp::Mul => {
            if all_int {
                let (a, b) = (int_of(&args[0]), int_of(&args[1]));
                let r = match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    _ => unreachable!(),
                };
                int_in_range(r)
            } else {
                let r = match op {
                    ArithOp::Add => reals[0] + reals[1],
                    ArithOp::Sub => reals[0] - reals[1],
                    ArithOp::Mul => reals[0] * reals[1],
                    _ => unreachable!(),
                };
                real_finite(r)
            }
        }
        ArithOp::Div => {
            if reals[1] == 0.0 {
                bail!("division by zero")
            }
            real_finite(reals[0] / reals[1])
        }
        ArithOp::Mod => {
            if reals[1] == 0.0 {
                bail!("modulo by zero")
            }
            real_finite(reals[0] % reals[1])
        }
        ArithOp::Min | ArithOp::Max => {
            if all_int {
                let it = args.iter().map(int_of);
                let r = match op {
                    ArithOp::Min => it.min(),
                    ArithOp::Max => it.max(),
                    _ => unreachable!(),
                };
                int_in_range(r.unwrap())
            } else {
                let mut r = reals[0];
                for x in &reals[1..] {
                    r = match op {
                        ArithOp::Min => r.min(*x),
                        ArithOp::Max => r.max(*x),
                        _ => unreachable!(),
                    };
                }
                real_finite(r)
            }
        }
        ArithOp::Abs => {
            if all_int {
                int_in_range(int_of(&args[0]).abs())
            } else {
                real_finite(reals[0].abs())
            }
        }
        ArithOp::Sqrt => {
            if reals[0] < 0.0 {
                bail!("square root of a negative number: {}", reals[0])
            }
            real_finite(reals[0].sqrt())
        }
    }
}

fn int_of(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i as i64,
        _ => unreachable!("checked all_int"),
    }
}

/// Any Unknown operand poisons the result; everything else is
/// rendered and joined.
pub fn eval_concat(vs: impl Iterator<Item = Value>) -> Value {
    let mut out = String::new();
    for v in vs {
        match v {
            Value::Unknown => return Value::Unknown,
            Value::Str(s) => out.push_str(&s),
            v => out.push_str(&format_compact!("{v}")),
        }
    }
    Value::Str(out.into())
}

pub fn eval_index(array: &Value, index: &Value) -> Result<Value> {
    let a = match array {
        Value::Unknown => return Ok(Value::Unknown),
        Value::Array(a) => a,
        v => bail!("subscript of a non array value {v}"),
    };
    let i = match index {
        Value::Unknown => return Ok(Value::Unknown),
        Value::Int(i) => *i,
        v => bail!("array subscript is not an Integer: {v}"),
    };
    match usize::try_from(i).ok().and_then(|i| a.get(i)) {
        Some(v) => Ok(v.clone()),
        None => bail!("array subscript {i} out of range (length {})", a.len()),
    }
}

/// Aggregate over node state variables: True when every one is in
/// one of `states`, False when any is known to be elsewhere, Unknown
/// otherwise.
pub fn eval_all_in_states(
    vs: impl Iterator<Item = Value>,
    states: &[NodeState],
) -> Value {
    let mut unknown = false;
    for v in vs {
        match v {
            Value::Int(i) => {
                if !states.iter().any(|s| *s as i32 == i) {
                    return Value::Bool(false);
                }
            }
            _ => unknown = true,
        }
    }
    if unknown { Value::Unknown } else { Value::Bool(true) }
}

#[cfg(test)]
mod test {
    use super::*;

    fn b(v: bool) -> Value {
        Value::Bool(v)
    }

    #[test]
    fn and_or_truth_tables() {
        let u = Value::Unknown;
        assert_eq!(eval_and([b(true), u.clone()].into_iter()), u);
        assert_eq!(eval_and([b(false), u.clone()].into_iter()), b(false));
        assert_eq!(eval_and([b(true), b(true)].into_iter()), b(true));
        assert_eq!(eval_or([b(false), u.clone()].into_iter()), u);
        assert_eq!(eval_or([b(true), u.clone()].into_iter()), b(true));
        assert_eq!(eval_or([b(false), b(false)].into_iter()), b(false));
        assert_eq!(eval_xor([b(true), b(true), b(true)].into_iter()), b(true));
        assert_eq!(eval_xor([b(true), u].into_iter()), Value::Unknown);
    }

    #[test]
    fn cmp_coerces_int_to_real() {
        assert_eq!(
            eval_cmp(CmpOp::Lt, &Value::Int(1), &Value::Real(1.5)),
            b(true)
        );
        assert_eq!(
            eval_cmp(CmpOp::Ge, &Value::Real(2.0), &Value::Int(2)),
            b(true)
        );
        assert_eq!(
            eval_cmp(CmpOp::Lt, &Value::Unknown, &Value::Int(1)),
            Value::Unknown
        );
        // ordering strings is not defined
        assert_eq!(
            eval_cmp(CmpOp::Lt, &Value::from("a"), &Value::from("b")),
            Value::Unknown
        );
    }

    #[test]
    fn int_arith_is_checked() {
        let max = Value::Int(i32::MAX);
        assert!(eval_arith(ArithOp::Add, &[max.clone(), Value::Int(1)]).is_err());
        assert_eq!(
            eval_arith(ArithOp::Add, &[Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Int(5)
        );
        // mixed operands promote to Real
        assert_eq!(
            eval_arith(ArithOp::Mul, &[Value::Int(2), Value::Real(1.5)]).unwrap(),
            Value::Real(3.0)
        );
    }

    #[test]
    fn div_is_real_and_zero_is_fatal() {
        assert_eq!(
            eval_arith(ArithOp::Div, &[Value::Int(3), Value::Int(2)]).unwrap(),
            Value::Real(1.5)
        );
        assert!(eval_arith(ArithOp::Div, &[Value::Int(1), Value::Int(0)]).is_err());
        assert!(eval_arith(ArithOp::Mod, &[Value::Real(1.0), Value::Real(0.0)]).is_err());
        assert!(eval_arith(ArithOp::Sqrt, &[Value::Real(-1.0)]).is_err());
    }

    #[test]
    fn unknown_poisons_arith() {
        assert_eq!(
            eval_arith(ArithOp::Add, &[Value::Unknown, Value::Int(1)]).unwrap(),
            Value::Unknown
        );
        assert_eq!(
            eval_arith(ArithOp::Sqrt, &[Value::Unknown]).unwrap(),
            Value::Unknown
        );
    }

    #[test]
    fn concat_and_index() {
        use crate::value::{ArrayValue, ElemType};
        assert_eq!(
            eval_concat([Value::from("x="), Value::Int(3)].into_iter()),
            Value::from("x=3")
        );
        assert_eq!(
            eval_concat([Value::from("x"), Value::Unknown].into_iter()),
            Value::Unknown
        );
        let a = Value::Array(
            ArrayValue::new(ElemType::Int, 2, vec![Value::Int(7), Value::Unknown])
                .unwrap(),
        );
        assert_eq!(eval_index(&a, &Value::Int(0)).unwrap(), Value::Int(7));
        // element Unknown propagates, out of range is fatal
        assert_eq!(eval_index(&a, &Value::Int(1)).unwrap(), Value::Unknown);
        assert!(eval_index(&a, &Value::Int(2)).is_err());
        assert!(eval_index(&a, &Value::Int(-1)).is_err());
    }

    #[test]
    fn min_max_are_n_ary() {
        assert_eq!(
            eval_arith(
                ArithOp::Min,
                &[Value::Int(4), Value::Int(2), Value::Int(9)]
            )
            .unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            eval_arith(ArithOp::Max, &[Value::Real(1.5), Value::Int(2)]).unwrap(),
            Value::Real(2.0)
        );
    }
}
