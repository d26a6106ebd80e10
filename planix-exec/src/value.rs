use anyhow::{bail, Result};
use arcstr::ArcStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};
use triomphe::Arc;

/// The most positive integer a plan value may hold.
pub const INT_PLUS_INFINITY: i64 = i32::MAX as i64;

/// The most negative integer a plan value may hold. Note that this is
/// the negation of [`INT_PLUS_INFINITY`], not `i32::MIN`.
pub const INT_MINUS_INFINITY: i64 = -(i32::MAX as i64);

/// Acknowledgement states a command passes through on its way from
/// the executive to the controlled system and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandHandle {
    SentToSystem,
    Accepted,
    ReceivedBySystem,
    Failed,
    Denied,
    Success,
}

impl CommandHandle {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SentToSystem => "COMMAND_SENT_TO_SYSTEM",
            Self::Accepted => "COMMAND_ACCEPTED",
            Self::ReceivedBySystem => "COMMAND_RCVD_BY_SYSTEM",
            Self::Failed => "COMMAND_FAILED",
            Self::Denied => "COMMAND_DENIED",
            Self::Success => "COMMAND_SUCCESS",
        }
    }

    /// A terminal handle will never be superseded by another ack.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Denied | Self::Success)
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CommandHandle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "COMMAND_SENT_TO_SYSTEM" => Ok(Self::SentToSystem),
            "COMMAND_ACCEPTED" => Ok(Self::Accepted),
            "COMMAND_RCVD_BY_SYSTEM" => Ok(Self::ReceivedBySystem),
            "COMMAND_FAILED" => Ok(Self::Failed),
            "COMMAND_DENIED" => Ok(Self::Denied),
            "COMMAND_SUCCESS" => Ok(Self::Success),
            s => bail!("not a command handle value: {s}"),
        }
    }
}

/// The type tag of a [`Value`]. `Unknown` is a type of its own; an
/// expression whose type cannot be determined statically carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Unknown,
    Bool,
    Int,
    Real,
    Str,
    Handle,
    Array(ElemType),
}

/// Array element types. Arrays of arrays are not expressible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    Bool,
    Int,
    Real,
    Str,
}

impl From<ElemType> for ValueType {
    fn from(e: ElemType) -> Self {
        match e {
            ElemType::Bool => ValueType::Bool,
            ElemType::Int => ValueType::Int,
            ElemType::Real => ValueType::Real,
            ElemType::Str => ValueType::Str,
        }
    }
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Bool => "Boolean",
            Self::Int => "Integer",
            Self::Real => "Real",
            Self::Str => "String",
            Self::Handle => "CommandHandle",
            Self::Array(ElemType::Bool) => "BooleanArray",
            Self::Array(ElemType::Int) => "IntegerArray",
            Self::Array(ElemType::Real) => "RealArray",
            Self::Array(ElemType::Str) => "StringArray",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Real)
    }

    /// Whether a value of type `other` may be stored in a slot
    /// declared with this type. Int promotes to Real; Unknown is
    /// accepted anywhere.
    pub fn accepts(&self, other: ValueType) -> bool {
        *self == other
            || other == ValueType::Unknown
            || *self == ValueType::Unknown
            || (*self == ValueType::Real && other == ValueType::Int)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A fixed-capacity typed array. Elements may individually be
/// Unknown. Cloning is cheap; element writes copy on write so a
/// variable's initial array survives assignment (see
/// [`crate::expr::var`]).
#[derive(Debug, Clone)]
pub struct ArrayValue {
    pub elem: ElemType,
    pub max: usize,
    elems: Arc<Vec<Value>>,
}

impl ArrayValue {
    pub fn new(elem: ElemType, max: usize, elems: Vec<Value>) -> Result<Self> {
        if elems.len() > max {
            bail!("array literal of {} elements exceeds max {max}", elems.len())
        }
        let want: ValueType = elem.into();
        for v in &elems {
            if !want.accepts(v.value_type()) {
                bail!("array element {v} is not a {want}")
            }
        }
        Ok(Self { elem, max, elems: Arc::new(elems) })
    }

    pub fn unknown(elem: ElemType, max: usize) -> Self {
        Self { elem, max, elems: Arc::new(vec![Value::Unknown; max]) }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Value> {
        self.elems.get(i)
    }

    pub fn elems(&self) -> &[Value] {
        &self.elems
    }

    /// Replace element `i`, copying the backing store if it is
    /// shared. Bounds and element type are the caller's problem;
    /// [`crate::expr::var`] checks both.
    pub(crate) fn set(&mut self, i: usize, v: Value) {
        Arc::make_mut(&mut self.elems)[i] = v;
    }
}

impl PartialEq for ArrayValue {
    fn eq(&self, other: &Self) -> bool {
        self.elem == other.elem && self.elems == other.elems
    }
}

impl Eq for ArrayValue {}

impl Hash for ArrayValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.elem.hash(state);
        self.elems.hash(state);
    }
}

impl fmt::Display for ArrayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#(")?;
        for (i, v) in self.elems.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?
            }
            write!(f, "{v}")?
        }
        write!(f, ")")
    }
}

impl Serialize for ArrayValue {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        (self.elem, self.max, &*self.elems).serialize(s)
    }
}

impl<'de> Deserialize<'de> for ArrayValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let (elem, max, elems): (ElemType, usize, Vec<Value>) =
            Deserialize::deserialize(d)?;
        ArrayValue::new(elem, max, elems).map_err(serde::de::Error::custom)
    }
}

/// A plan value. Every expression in the graph evaluates to one of
/// these. Unknown is a first-class value, not an error: arithmetic
/// and comparison over Unknown yield Unknown, and an inactive
/// expression is observationally Unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Unknown,
    Bool(bool),
    Int(i32),
    Real(f64),
    Str(ArcStr),
    Handle(CommandHandle),
    Array(ArrayValue),
}

impl Value {
    pub fn is_known(&self) -> bool {
        !matches!(self, Value::Unknown)
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Value::Bool(false))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Unknown => ValueType::Unknown,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Real(_) => ValueType::Real,
            Value::Str(_) => ValueType::Str,
            Value::Handle(_) => ValueType::Handle,
            Value::Array(a) => ValueType::Array(a.elem),
        }
    }

    /// Numeric view, coercing Int to Real. None for everything else.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Three valued equality: Unknown if either side is Unknown,
    /// False across kinds, numeric comparison coerces Int to Real.
    pub fn eq_value(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Unknown, _) | (_, Value::Unknown) => Value::Unknown,
            (a, b) => match (a.as_real(), b.as_real()) {
                (Some(x), Some(y)) => Value::Bool(x == y),
                _ => Value::Bool(a == b),
            },
        }
    }

    /// Structural equality used by the cache and the notification
    /// graph to decide whether a value changed. Unlike `eq_value`,
    /// Unknown equals Unknown here.
    pub fn same(&self, other: &Value) -> bool {
        self == other
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unknown, Value::Unknown) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (_, _) => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Unknown => (),
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Real(r) => {
                // 0.0 == -0.0 and all NaNs are equal, so normalize
                let bits = if *r == 0.0 {
                    0u64
                } else if r.is_nan() {
                    u64::MAX
                } else {
                    r.to_bits()
                };
                bits.hash(state)
            }
            Value::Str(s) => s.hash(state),
            Value::Handle(h) => h.hash(state),
            Value::Array(a) => a.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unknown => write!(f, "UNKNOWN"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Handle(h) => write!(f, "{h}"),
            Value::Array(a) => write!(f, "{a}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(ArcStr::from(s))
    }
}

impl From<CommandHandle> for Value {
    fn from(h: CommandHandle) -> Self {
        Value::Handle(h)
    }
}

impl From<Option<bool>> for Value {
    fn from(b: Option<bool>) -> Self {
        match b {
            None => Value::Unknown,
            Some(b) => Value::Bool(b),
        }
    }
}

/// Parse a value of a known declared type from its printed form.
/// `UNKNOWN` parses as Unknown for every type.
pub fn parse_typed(typ: ValueType, s: &str) -> Result<Value> {
    let s = s.trim();
    if s == "UNKNOWN" {
        return Ok(Value::Unknown);
    }
    match typ {
        ValueType::Unknown => bail!("cannot parse a value of unknown type: {s}"),
        ValueType::Bool => match s {
            "true" | "TRUE" | "1" => Ok(Value::Bool(true)),
            "false" | "FALSE" | "0" => Ok(Value::Bool(false)),
            s => bail!("not a Boolean: {s}"),
        },
        ValueType::Int => {
            let i: i64 = s.parse()?;
            if !(INT_MINUS_INFINITY..=INT_PLUS_INFINITY).contains(&i) {
                bail!("integer literal out of range: {s}")
            }
            Ok(Value::Int(i as i32))
        }
        ValueType::Real => {
            let r: f64 = s.parse()?;
            if !r.is_finite() {
                bail!("real literal is not finite: {s}")
            }
            Ok(Value::Real(r))
        }
        ValueType::Str => Ok(Value::Str(ArcStr::from(s))),
        ValueType::Handle => Ok(Value::Handle(s.parse()?)),
        ValueType::Array(_) => bail!("array literals have no printed form: {s}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_is_distinct() {
        assert_ne!(Value::Unknown, Value::Bool(false));
        assert_ne!(Value::Unknown, Value::Int(0));
        assert_eq!(Value::Unknown, Value::Unknown);
        assert_eq!(Value::Unknown.eq_value(&Value::Unknown), Value::Unknown);
        assert_eq!(Value::Int(1).eq_value(&Value::Unknown), Value::Unknown);
    }

    #[test]
    fn numeric_eq_coerces() {
        assert_eq!(Value::Int(2).eq_value(&Value::Real(2.0)), Value::Bool(true));
        assert_eq!(Value::Int(2).eq_value(&Value::Real(2.5)), Value::Bool(false));
        // cross kind equality is plain False
        assert_eq!(
            Value::Int(1).eq_value(&Value::Str("1".into())),
            Value::Bool(false)
        );
    }

    #[test]
    fn array_cow() {
        let a = ArrayValue::new(
            ElemType::Int,
            3,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap();
        let mut b = a.clone();
        b.set(1, Value::Int(9));
        assert_eq!(a.get(1), Some(&Value::Int(2)));
        assert_eq!(b.get(1), Some(&Value::Int(9)));
    }

    #[test]
    fn parse_round_trip() {
        assert_eq!(parse_typed(ValueType::Bool, "true").unwrap(), Value::Bool(true));
        assert_eq!(parse_typed(ValueType::Int, "-42").unwrap(), Value::Int(-42));
        assert_eq!(parse_typed(ValueType::Real, "1.5").unwrap(), Value::Real(1.5));
        assert_eq!(parse_typed(ValueType::Int, "UNKNOWN").unwrap(), Value::Unknown);
        assert!(parse_typed(ValueType::Int, "3000000000").is_err());
        let h = parse_typed(ValueType::Handle, "COMMAND_SUCCESS").unwrap();
        assert_eq!(h, Value::Handle(CommandHandle::Success));
    }
}
