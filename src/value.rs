//! Runtime values and the operator semantics shared between render-time
//! evaluation and compile-time constant folding.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::ast::{BinOpKind, CmpOp};
use crate::error::Error;

/// The sentinel produced when a name or attribute lookup finds nothing.
///
/// It is not a null: every operation except `==`/`!=` against another
/// undefined fails with a descriptive error once the value is actually
/// used. Creation is free of side effects so merely mentioning a missing
/// name never raises.
#[derive(Debug, Clone, Default)]
pub struct Undefined {
    pub hint: Option<String>,
    pub obj: Option<Box<Value>>,
    pub name: Option<String>,
}

impl Undefined {
    /// The error raised when anything meaningful is attempted on this
    /// sentinel. Always produces a non-empty message.
    pub fn error(&self) -> Error {
        if let Some(hint) = &self.hint {
            return Error::Undefined(hint.clone());
        }
        match (&self.obj, &self.name) {
            (Some(obj), Some(name)) => Error::Undefined(format!(
                "value of type {} has no attribute or item '{}'",
                obj.type_name(),
                name
            )),
            (None, Some(name)) => Error::Undefined(format!("'{}' is undefined", name)),
            _ => Error::Undefined("value is undefined".into()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs. Keys are full values so dict
    /// literals with non-string keys behave like the template syntax
    /// promises.
    Map(Vec<(Value, Value)>),
    Undefined(Undefined),
}

impl Value {
    pub fn undefined_named(name: &str) -> Value {
        Value::Undefined(Undefined {
            name: Some(name.to_owned()),
            ..Undefined::default()
        })
    }

    pub fn undefined_access(obj: &Value, name: String) -> Value {
        Value::Undefined(Undefined {
            hint: None,
            obj: Some(Box::new(obj.clone())),
            name: Some(name),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Undefined(_) => "undefined",
        }
    }

    /// Fails only when the value is undefined; every other value has a
    /// well-defined boolean interpretation. Undefined counts as false so
    /// `{% if maybe_missing %}` takes the else path instead of raising.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(pairs) => !pairs.is_empty(),
            Value::Undefined(_) => false,
        }
    }

    /// Text form used when a value is written to the output stream.
    /// Coercing an undefined value to text is the canonical way it
    /// finally raises.
    pub fn to_output_string(&self) -> Result<String, Error> {
        match self {
            Value::Undefined(u) => Err(u.error()),
            Value::None => Ok(String::new()),
            Value::Str(s) => Ok(s.clone()),
            other => match other.find_undefined() {
                Some(u) => Err(u.error()),
                None => Ok(other.to_string()),
            },
        }
    }

    /// First undefined value buried anywhere in a container, so writing
    /// `[ghost]` to the output raises just like writing `ghost` would.
    fn find_undefined(&self) -> Option<&Undefined> {
        match self {
            Value::Undefined(u) => Some(u),
            Value::List(items) => items.iter().find_map(Value::find_undefined),
            Value::Map(pairs) => pairs
                .iter()
                .find_map(|(k, v)| k.find_undefined().or_else(|| v.find_undefined())),
            _ => None,
        }
    }

    fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (idx, (k, v)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k.repr(), v.repr())?;
                }
                write!(f, "}}")
            }
            Value::Undefined(_) => Ok(()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            // all undefined sentinels of the same kind compare equal,
            // whatever hint or name they carry
            (Value::Undefined(_), Value::Undefined(_)) => true,
            (Value::Undefined(_), _) | (_, Value::Undefined(_)) => false,
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Value {
        Value::List(items)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Value {
        let mut pairs: Vec<(String, Value)> = map.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Value::Map(pairs.into_iter().map(|(k, v)| (Value::Str(k), v)).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Value {
        Value::Map(map.into_iter().map(|(k, v)| (Value::Str(k), v)).collect())
    }
}

fn check_defined(value: &Value) -> Result<(), Error> {
    if let Value::Undefined(u) = value {
        return Err(u.error());
    }
    Ok(())
}

fn type_error(op: &str, left: &Value, right: &Value) -> Error {
    Error::Runtime(format!(
        "unsupported operand types for {}: {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn int_overflow(op: &str) -> Error {
    Error::Runtime(format!("integer overflow in {}", op))
}

/// Apply a binary arithmetic/logic operator. `And`/`Or` are handled here
/// for the constant folder; render-time evaluation short-circuits them
/// before reaching this point.
pub fn binop(op: BinOpKind, left: &Value, right: &Value) -> Result<Value, Error> {
    if matches!(op, BinOpKind::And) {
        return Ok(if !left.is_truthy() { left.clone() } else { right.clone() });
    }
    if matches!(op, BinOpKind::Or) {
        return Ok(if left.is_truthy() { left.clone() } else { right.clone() });
    }
    check_defined(left)?;
    check_defined(right)?;
    match op {
        BinOpKind::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| int_overflow("+")),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut items = a.clone();
                items.extend(b.iter().cloned());
                Ok(Value::List(items))
            }
            _ => float_arith(op, left, right),
        },
        BinOpKind::Sub | BinOpKind::Mul => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                let rv = if matches!(op, BinOpKind::Sub) {
                    a.checked_sub(*b)
                } else {
                    a.checked_mul(*b)
                };
                rv.map(Value::Int).ok_or_else(|| int_overflow(op.symbol()))
            }
            _ => float_arith(op, left, right),
        },
        BinOpKind::Div => {
            let (a, b) = both_numeric(op, left, right)?;
            if b == 0.0 {
                return Err(Error::Runtime("division by zero".into()));
            }
            Ok(Value::Float(a / b))
        }
        BinOpKind::FloorDiv => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(Error::Runtime("division by zero".into()));
                }
                // floor toward negative infinity, like the template
                // language promises (not truncation)
                let (q, r) = (a / b, a % b);
                Ok(Value::Int(if r != 0 && (r < 0) != (*b < 0) { q - 1 } else { q }))
            }
            _ => {
                let (a, b) = both_numeric(op, left, right)?;
                if b == 0.0 {
                    return Err(Error::Runtime("division by zero".into()));
                }
                Ok(Value::Float((a / b).floor()))
            }
        },
        BinOpKind::Mod => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(Error::Runtime("division by zero".into()));
                }
                let r = a % b;
                Ok(Value::Int(if r != 0 && (r < 0) != (*b < 0) { r + b } else { r }))
            }
            _ => {
                let (a, b) = both_numeric(op, left, right)?;
                if b == 0.0 {
                    return Err(Error::Runtime("division by zero".into()));
                }
                let r = a % b;
                Ok(Value::Float(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }))
            }
        },
        BinOpKind::Pow => match (left, right) {
            (Value::Int(a), Value::Int(b)) if *b >= 0 => {
                let exp = u32::try_from(*b).map_err(|_| int_overflow("**"))?;
                a.checked_pow(exp)
                    .map(Value::Int)
                    .ok_or_else(|| int_overflow("**"))
            }
            _ => {
                let (a, b) = both_numeric(op, left, right)?;
                Ok(Value::Float(a.powf(b)))
            }
        },
        BinOpKind::And | BinOpKind::Or => unreachable!("handled above"),
    }
}

fn both_numeric(op: BinOpKind, left: &Value, right: &Value) -> Result<(f64, f64), Error> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(type_error(op.symbol(), left, right)),
    }
}

fn float_arith(op: BinOpKind, left: &Value, right: &Value) -> Result<Value, Error> {
    let (a, b) = both_numeric(op, left, right)?;
    let rv = match op {
        BinOpKind::Add => a + b,
        BinOpKind::Sub => a - b,
        BinOpKind::Mul => a * b,
        _ => return Err(type_error(op.symbol(), left, right)),
    };
    Ok(Value::Float(rv))
}

pub fn neg(value: &Value) -> Result<Value, Error> {
    check_defined(value)?;
    match value {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| int_overflow("-")),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(Error::Runtime(format!(
            "cannot negate a value of type {}",
            value.type_name()
        ))),
    }
}

pub fn pos(value: &Value) -> Result<Value, Error> {
    check_defined(value)?;
    match value {
        Value::Int(_) | Value::Float(_) => Ok(value.clone()),
        _ => Err(Error::Runtime(format!(
            "cannot apply unary + to a value of type {}",
            value.type_name()
        ))),
    }
}

/// One link of a (possibly chained) comparison. Equality never raises,
/// even on undefined operands; everything else does.
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Error> {
    match op {
        CmpOp::Eq => return Ok(left == right),
        CmpOp::Ne => return Ok(left != right),
        _ => {}
    }
    check_defined(left)?;
    check_defined(right)?;
    match op {
        CmpOp::In => return contains(right, left),
        CmpOp::NotIn => return contains(right, left).map(|rv| !rv),
        _ => {}
    }
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                return Err(Error::Runtime(format!(
                    "cannot compare {} with {}",
                    left.type_name(),
                    right.type_name()
                )))
            }
        },
    };
    let ordering = match ordering {
        Some(o) => o,
        None => return Ok(false),
    };
    Ok(match op {
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::GtEq => ordering.is_ge(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::LtEq => ordering.is_le(),
        CmpOp::Eq | CmpOp::Ne | CmpOp::In | CmpOp::NotIn => unreachable!(),
    })
}

fn contains(container: &Value, item: &Value) -> Result<bool, Error> {
    match container {
        Value::List(items) => Ok(items.iter().any(|v| v == item)),
        Value::Map(pairs) => Ok(pairs.iter().any(|(k, _)| k == item)),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_str())),
            _ => Err(Error::Runtime(format!(
                "cannot search for {} in a string",
                item.type_name()
            ))),
        },
        _ => Err(Error::Runtime(format!(
            "value of type {} does not support membership tests",
            container.type_name()
        ))),
    }
}

/// Plain container lookup: list index (negative counts from the end),
/// map key, or string character. `None` when the container type or the
/// key does not fit; the caller decides whether that becomes an
/// undefined value or a fold failure.
pub fn getitem(base: &Value, index: &Value) -> Option<Value> {
    match (base, index) {
        (Value::List(items), Value::Int(i)) => normalize_index(*i, items.len())
            .and_then(|i| items.get(i))
            .cloned(),
        (Value::Map(pairs), key) => pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            normalize_index(*i, chars.len())
                .and_then(|i| chars.get(i))
                .map(|c| Value::Str(c.to_string()))
        }
        _ => None,
    }
}

/// Negative indices count from the end; an index so large that the
/// adjustment overflows is just out of range.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let idx = if index < 0 {
        index.checked_add(len as i64)?
    } else {
        index
    };
    usize::try_from(idx).ok()
}

/// Direct slicing, used for explicit `[a:b:c]` subscripts. Out-of-range
/// bounds clamp instead of failing.
pub fn slice(
    value: &Value,
    start: Option<&Value>,
    stop: Option<&Value>,
    step: Option<&Value>,
) -> Result<Value, Error> {
    check_defined(value)?;
    let step = match step {
        None | Some(Value::None) => 1,
        Some(v) => slice_index(v)?,
    };
    if step == 0 {
        return Err(Error::Runtime("slice step cannot be zero".into()));
    }
    let start = slice_bound(start)?;
    let stop = slice_bound(stop)?;
    match value {
        Value::List(items) => {
            let picked = slice_indices(items.len() as i64, start, stop, step)
                .map(|i| items[i as usize].clone())
                .collect();
            Ok(Value::List(picked))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked: String = slice_indices(chars.len() as i64, start, stop, step)
                .map(|i| chars[i as usize])
                .collect();
            Ok(Value::Str(picked))
        }
        _ => Err(Error::Runtime(format!(
            "value of type {} cannot be sliced",
            value.type_name()
        ))),
    }
}

fn slice_bound(value: Option<&Value>) -> Result<Option<i64>, Error> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(v) => slice_index(v).map(Some),
    }
}

fn slice_index(value: &Value) -> Result<i64, Error> {
    match value {
        Value::Int(i) => Ok(*i),
        _ => Err(Error::Runtime(format!(
            "slice indices must be integers, not {}",
            value.type_name()
        ))),
    }
}

fn slice_indices(
    len: i64,
    start: Option<i64>,
    stop: Option<i64>,
    step: i64,
) -> impl Iterator<Item = i64> {
    let clamp = |idx: i64, lo: i64, hi: i64| {
        let idx = if idx < 0 { idx.saturating_add(len) } else { idx };
        idx.max(lo).min(hi)
    };
    let (start, stop) = if step > 0 {
        (
            clamp(start.unwrap_or(0), 0, len),
            clamp(stop.unwrap_or(len), 0, len),
        )
    } else {
        (
            clamp(start.unwrap_or(len - 1), -1, len - 1),
            clamp(stop.unwrap_or(-len - 1), -1, len - 1),
        )
    };
    let mut idx = start;
    std::iter::from_fn(move || {
        if (step > 0 && idx < stop) || (step < 0 && idx > stop) {
            let rv = idx;
            idx += step;
            Some(rv)
        } else {
            None
        }
    })
}

/// HTML-escape dynamic output when autoescaping is enabled. Static
/// template text is never escaped.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_follows_template_semantics() {
        let three = binop(BinOpKind::Add, &Value::Int(1), &Value::Int(2)).unwrap();
        assert_eq!(three, Value::Int(3));

        // true division always yields a float
        let half = binop(BinOpKind::Div, &Value::Int(1), &Value::Int(2)).unwrap();
        assert_eq!(half, Value::Float(0.5));

        // floor division floors toward negative infinity
        let q = binop(BinOpKind::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert_eq!(q, Value::Int(-4));

        let m = binop(BinOpKind::Mod, &Value::Int(-7), &Value::Int(3)).unwrap();
        assert_eq!(m, Value::Int(2));
    }

    #[test]
    fn string_concat_and_type_errors() {
        let ab = binop(BinOpKind::Add, &Value::from("a"), &Value::from("b")).unwrap();
        assert_eq!(ab, Value::from("ab"));
        assert!(binop(BinOpKind::Sub, &Value::from("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn undefined_is_inert_except_for_equality() {
        let u1 = Value::undefined_named("x");
        let u2 = Value::undefined_named("completely_different");
        assert_eq!(u1, u2);
        assert_ne!(u1, Value::Int(1));
        assert!(binop(BinOpKind::Add, &u1, &Value::Int(1)).is_err());
        assert!(compare(CmpOp::Lt, &u1, &Value::Int(1)).is_err());
        assert!(u1.to_output_string().is_err());
        // equality never raises
        assert!(compare(CmpOp::Eq, &u1, &Value::Int(1)).unwrap() == false);
    }

    #[test]
    fn membership() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert!(compare(CmpOp::In, &Value::Int(2), &list).unwrap());
        assert!(compare(CmpOp::NotIn, &Value::Int(3), &list).unwrap());
        assert!(compare(CmpOp::In, &Value::from("el"), &Value::from("hello")).unwrap());
    }

    #[test]
    fn slicing_clamps_and_reverses() {
        let list = Value::List((0..5).map(Value::Int).collect());
        let head = slice(&list, None, Some(&Value::Int(2)), None).unwrap();
        assert_eq!(head, Value::List(vec![Value::Int(0), Value::Int(1)]));
        let rev = slice(&list, None, None, Some(&Value::Int(-1))).unwrap();
        assert_eq!(rev, Value::List((0..5).rev().map(Value::Int).collect()));
        let over = slice(&list, Some(&Value::Int(3)), Some(&Value::Int(100)), None).unwrap();
        assert_eq!(over, Value::List(vec![Value::Int(3), Value::Int(4)]));
    }

    #[test]
    fn output_formatting() {
        assert_eq!(Value::Float(3.0).to_output_string().unwrap(), "3.0");
        assert_eq!(Value::Float(1.5).to_output_string().unwrap(), "1.5");
        assert_eq!(Value::None.to_output_string().unwrap(), "");
        let list = Value::List(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(list.to_output_string().unwrap(), "[1, 'a']");
    }
}
