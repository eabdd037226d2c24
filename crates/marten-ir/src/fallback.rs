// Fallback — compile-time evaluation of host builtins
//
// Graphs traced from a scripting front end may call host builtins such as
// `len`, `max` or `divmod` on values known at compile time. The graph cannot
// execute those, so FallbackPass evaluates every Builtin node whose
// arguments are known and replaces it with a Constant.
//
// Results that have no tensor form (strings, None, ragged lists) stay as
// Builtin nodes; their values still feed other builtins during the same
// pass, so `len(str(x))` folds even though `str(x)` cannot. Whatever is
// left afterwards is `Untranslatable` unless runtime fallback is enabled,
// in which case the interpreter evaluates it on the host.
//
// Semantics follow the scripting conventions users expect: floor division
// in `divmod`, round-half-to-even in `round`, `0b`/`0o`/`0x` prefixes with a
// leading minus for negative numbers. Integers are 64-bit; overflow is an
// error rather than a silent wrap.
//
// Subscription `x[i]` and `x[slice]` lower to the `getitem` builtin.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use marten_core::{DType, Error, Result};

use crate::graph::{BuiltinArg, Graph, HostTensor, NodeId, NodeKind};
use crate::passes::Pass;

/// A host value flowing through builtin evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Complex(f64, f64),
    List(Vec<HostValue>),
    Tuple(Vec<HostValue>),
    /// Insertion-ordered; keys are unique.
    Dict(Vec<(HostValue, HostValue)>),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    Tensor(HostTensor),
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::None => "NoneType",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::Complex(..) => "complex",
            HostValue::Str(_) => "str",
            HostValue::List(_) => "list",
            HostValue::Tuple(_) => "tuple",
            HostValue::Dict(_) => "dict",
            HostValue::Slice { .. } => "slice",
            HostValue::Tensor(_) => "Tensor",
        }
    }

    /// Scalars become Int/Float, higher ranks nested lists.
    pub fn from_host_tensor(t: &HostTensor) -> Self {
        fn build(data: &[f64], dims: &[usize], float: bool) -> HostValue {
            match dims.split_first() {
                None => scalar(data[0], float),
                Some((&n, rest)) => {
                    let inner: usize = rest.iter().product();
                    HostValue::List(
                        (0..n)
                            .map(|i| build(&data[i * inner..(i + 1) * inner], rest, float))
                            .collect(),
                    )
                }
            }
        }
        fn scalar(v: f64, float: bool) -> HostValue {
            if float {
                HostValue::Float(v)
            } else {
                HostValue::Int(v as i64)
            }
        }
        build(&t.data, t.shape.dims(), t.dtype.is_float())
    }

    /// Numeric values as a tensor; `None` when there is no tensor form.
    pub fn to_host_tensor(&self) -> Option<HostTensor> {
        match self {
            HostValue::Bool(b) => Some(HostTensor::scalar(f64::from(u8::from(*b)), DType::U8)),
            HostValue::Int(v) => Some(HostTensor::scalar(*v as f64, DType::I64)),
            HostValue::Float(v) => Some(HostTensor::scalar(*v, DType::F64)),
            HostValue::Tensor(t) => Some(t.clone()),
            HostValue::List(items) | HostValue::Tuple(items) => {
                let mut data = Vec::new();
                let mut float = false;
                let dims = flatten_numeric(items, &mut data, &mut float)?;
                let dtype = if float { DType::F64 } else { DType::I64 };
                HostTensor::new(data, dims, dtype).ok()
            }
            HostValue::None
            | HostValue::Str(_)
            | HostValue::Complex(..)
            | HostValue::Dict(_)
            | HostValue::Slice { .. } => None,
        }
    }

    pub fn truthy(&self) -> Result<bool> {
        Ok(match self {
            HostValue::None => false,
            HostValue::Bool(b) => *b,
            HostValue::Int(v) => *v != 0,
            HostValue::Float(v) => *v != 0.0,
            HostValue::Complex(re, im) => *re != 0.0 || *im != 0.0,
            HostValue::Str(s) => !s.is_empty(),
            HostValue::List(v) | HostValue::Tuple(v) => !v.is_empty(),
            HostValue::Dict(v) => !v.is_empty(),
            HostValue::Slice { .. } => true,
            HostValue::Tensor(t) => {
                if !t.is_scalar() {
                    return Err(Error::msg(
                        "the truth value of a tensor with more than one element is ambiguous",
                    ));
                }
                t.data[0] != 0.0
            }
        })
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Bool(b) => Some(f64::from(u8::from(*b))),
            HostValue::Int(v) => Some(*v as f64),
            HostValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Bool(b) => Some(i64::from(*b)),
            HostValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The display form used by `repr`.
    pub fn repr(&self) -> String {
        match self {
            HostValue::Str(s) => format!("'{s}'"),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::None => write!(f, "None"),
            HostValue::Bool(true) => write!(f, "True"),
            HostValue::Bool(false) => write!(f, "False"),
            HostValue::Int(v) => write!(f, "{v}"),
            HostValue::Float(v) => write!(f, "{}", format_float(*v)),
            HostValue::Complex(re, im) => {
                let imag = format_float(*im);
                let imag = imag.strip_suffix(".0").unwrap_or(&imag);
                if *re == 0.0 && re.is_sign_positive() {
                    return write!(f, "{imag}j");
                }
                let real = format_float(*re);
                let real = real.strip_suffix(".0").unwrap_or(&real);
                let sign = if imag.starts_with('-') { "" } else { "+" };
                write!(f, "({real}{sign}{imag}j)")
            }
            HostValue::Str(s) => write!(f, "{s}"),
            HostValue::List(items) => {
                let parts: Vec<String> = items.iter().map(HostValue::repr).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            HostValue::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(HostValue::repr).collect();
                if parts.len() == 1 {
                    write!(f, "({},)", parts[0])
                } else {
                    write!(f, "({})", parts.join(", "))
                }
            }
            HostValue::Dict(entries) => {
                let parts: Vec<String> =
                    entries.iter().map(|(k, v)| format!("{}: {}", k.repr(), v.repr())).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            HostValue::Slice { start, stop, step } => {
                let part = |v: &Option<i64>| v.map_or_else(|| "None".to_string(), |v| v.to_string());
                write!(f, "slice({}, {}, {})", part(start), part(stop), part(step))
            }
            HostValue::Tensor(t) => write!(f, "Tensor({t})"),
        }
    }
}

/// Rectangular nesting only; returns the element dims of `items`.
fn flatten_numeric(items: &[HostValue], data: &mut Vec<f64>, float: &mut bool) -> Option<Vec<usize>> {
    let mut inner: Option<Vec<usize>> = None;
    for item in items {
        let dims = match item {
            HostValue::List(nested) | HostValue::Tuple(nested) => {
                flatten_numeric(nested, data, float)?
            }
            scalar => {
                *float |= matches!(scalar, HostValue::Float(_));
                data.push(scalar.as_f64()?);
                Vec::new()
            }
        };
        match &inner {
            Some(seen) if *seen != dims => return None,
            Some(_) => {}
            None => inner = Some(dims),
        }
    }
    let mut dims = vec![items.len()];
    dims.extend(inner.unwrap_or_default());
    Some(dims)
}

/// Floor division with the remainder taking the divisor's sign; `None` on
/// overflow.
fn floor_divmod(a: i64, b: i64) -> Option<(i64, i64)> {
    let q = a.checked_div_euclid(b)? - i64::from(b < 0 && a.checked_rem_euclid(b)? != 0);
    Some((q, a.checked_sub(b.checked_mul(q)?)?))
}

fn overflow(func: &str) -> Error {
    Error::msg(format!("{func}(): integer result does not fit in 64 bits"))
}

/// Shortest round-trip digits; integral floats keep a trailing `.0`, and
/// exponents below -4 or from 16 up switch to `1e+16` style.
fn format_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let sci = format!("{v:e}");
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if v != 0.0 && !(-4..16).contains(&exp) {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else if v == v.trunc() {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        r
    }
}

fn type_error(func: &str, v: &HostValue) -> Error {
    Error::msg(format!("{func}() does not accept an argument of type '{}'", v.type_name()))
}

fn items(func: &str, v: &HostValue) -> Result<Vec<HostValue>> {
    match v {
        HostValue::List(items) | HostValue::Tuple(items) => Ok(items.clone()),
        HostValue::Dict(entries) => Ok(entries.iter().map(|(k, _)| k.clone()).collect()),
        HostValue::Str(s) => Ok(s.chars().map(|c| HostValue::Str(c.to_string())).collect()),
        HostValue::Tensor(t) if t.shape.rank() > 0 => match HostValue::from_host_tensor(t) {
            HostValue::List(items) => Ok(items),
            other => Ok(vec![other]),
        },
        other => Err(Error::msg(format!(
            "{func}(): '{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn compare(a: &HostValue, b: &HostValue) -> Result<Ordering> {
    match (a, b) {
        (HostValue::Str(x), HostValue::Str(y)) => Ok(x.cmp(y)),
        (HostValue::List(x), HostValue::List(y)) | (HostValue::Tuple(x), HostValue::Tuple(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare(l, r)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => Ok(x.cmp(&y)),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x
                    .partial_cmp(&y)
                    .ok_or_else(|| Error::msg("cannot order nan values")),
                _ => Err(Error::msg(format!(
                    "'<' not supported between '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        },
    }
}

fn radix(v: i64, prefix: &str, base: u32) -> String {
    let digits = match base {
        2 => format!("{:b}", v.unsigned_abs()),
        8 => format!("{:o}", v.unsigned_abs()),
        _ => format!("{:x}", v.unsigned_abs()),
    };
    let sign = if v < 0 { "-" } else { "" };
    format!("{sign}{prefix}{digits}")
}

fn extremum(func: &str, args: &[HostValue], want: Ordering) -> Result<HostValue> {
    let candidates = match args {
        [single] => items(func, single)?,
        many => many.to_vec(),
    };
    let mut best: Option<HostValue> = None;
    for c in candidates {
        best = match best {
            Some(b) if compare(&c, &b)? != want => Some(b),
            _ => Some(c),
        };
    }
    best.ok_or_else(|| Error::msg(format!("{func}() arg is an empty sequence")))
}

fn arity(func: &str, args: &[HostValue], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::msg(format!(
            "{func}() takes {min} to {max} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Positions selected by a slice over a sequence of length `len`.
fn slice_indices(
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    len: usize,
) -> Result<Vec<usize>> {
    let n = len as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Error::msg("slice step cannot be zero"));
    }
    // Negative steps may stop just before the first element, hence -1.
    let (lo, hi) = if step > 0 { (0, n) } else { (-1, n - 1) };
    let clamp = |v: i64| {
        let v = if v < 0 { v + n } else { v };
        v.clamp(lo, hi)
    };
    let start = start.map_or(if step > 0 { 0 } else { n - 1 }, clamp);
    let stop = stop.map_or(if step > 0 { n } else { -1 }, clamp);
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i = match i.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(out)
}

/// `container[index]`, where `index` is an int, a slice, or a dict key.
fn get_item(container: &HostValue, index: &HostValue) -> Result<HostValue> {
    if let HostValue::Dict(entries) = container {
        return entries
            .iter()
            .find(|(k, _)| k == index)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::msg(format!("KeyError: {}", index.repr())));
    }
    if let HostValue::Tensor(t) = container {
        let Some((&rows, rest)) = t.shape.dims().split_first() else {
            return Err(Error::msg("a 0-d tensor cannot be indexed"));
        };
        let inner: usize = rest.iter().product();
        let row = |i: usize| &t.data[i * inner..(i + 1) * inner];
        return match index {
            HostValue::Slice { start, stop, step } => {
                let picked = slice_indices(*start, *stop, *step, rows)?;
                let mut dims = vec![picked.len()];
                dims.extend_from_slice(rest);
                let data = picked.iter().flat_map(|&i| row(i).iter().copied()).collect();
                Ok(HostValue::Tensor(HostTensor::new(data, dims, t.dtype)?))
            }
            other => {
                let i = sequence_index(other, rows)?;
                Ok(HostValue::Tensor(HostTensor::new(row(i).to_vec(), rest.to_vec(), t.dtype)?))
            }
        };
    }
    let elems = match container {
        HostValue::List(_) | HostValue::Tuple(_) | HostValue::Str(_) => items("getitem", container)?,
        other => {
            return Err(Error::msg(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            )))
        }
    };
    match index {
        HostValue::Slice { start, stop, step } => {
            let picked: Vec<HostValue> = slice_indices(*start, *stop, *step, elems.len())?
                .into_iter()
                .map(|i| elems[i].clone())
                .collect();
            Ok(match container {
                HostValue::Tuple(_) => HostValue::Tuple(picked),
                HostValue::Str(_) => HostValue::Str(picked.iter().map(|c| c.to_string()).collect()),
                _ => HostValue::List(picked),
            })
        }
        other => Ok(elems[sequence_index(other, elems.len())?].clone()),
    }
}

/// An int index with negative values counting from the end.
fn sequence_index(index: &HostValue, len: usize) -> Result<usize> {
    let i = index.as_int().ok_or_else(|| {
        Error::msg(format!("indices must be integers or slices, not {}", index.type_name()))
    })?;
    let n = len as i64;
    let at = if i < 0 { i + n } else { i };
    if !(0..n).contains(&at) {
        return Err(Error::msg(format!("index {i} out of range for length {len}")));
    }
    Ok(at as usize)
}

/// Evaluate one builtin call.
pub fn call_builtin(func: &str, args: &[HostValue]) -> Result<HostValue> {
    let first = args.first().cloned().unwrap_or(HostValue::None);
    match func {
        "abs" => {
            arity(func, args, 1, 1)?;
            match first {
                HostValue::Bool(b) => Ok(HostValue::Int(i64::from(b))),
                HostValue::Int(v) => v.checked_abs().map(HostValue::Int).ok_or_else(|| overflow(func)),
                HostValue::Float(v) => Ok(HostValue::Float(v.abs())),
                HostValue::Complex(re, im) => Ok(HostValue::Float(re.hypot(im))),
                other => Err(type_error(func, &other)),
            }
        }
        "all" | "any" => {
            arity(func, args, 1, 1)?;
            let mut flags = Vec::new();
            for v in items(func, &first)? {
                flags.push(v.truthy()?);
            }
            let result = if func == "all" {
                flags.iter().all(|&b| b)
            } else {
                flags.iter().any(|&b| b)
            };
            Ok(HostValue::Bool(result))
        }
        "bin" | "oct" | "hex" => {
            arity(func, args, 1, 1)?;
            let v = first.as_int().ok_or_else(|| type_error(func, &first))?;
            let s = match func {
                "bin" => radix(v, "0b", 2),
                "oct" => radix(v, "0o", 8),
                _ => radix(v, "0x", 16),
            };
            Ok(HostValue::Str(s))
        }
        "bool" => {
            arity(func, args, 0, 1)?;
            Ok(HostValue::Bool(first.truthy()?))
        }
        "chr" => {
            arity(func, args, 1, 1)?;
            let v = first.as_int().ok_or_else(|| type_error(func, &first))?;
            u32::try_from(v)
                .ok()
                .and_then(char::from_u32)
                .map(|c| HostValue::Str(c.to_string()))
                .ok_or_else(|| Error::msg(format!("chr() arg {v} not in range")))
        }
        "complex" => {
            arity(func, args, 0, 2)?;
            let part = |v: Option<&HostValue>| match v {
                None => Ok(0.0),
                Some(v) => v.as_f64().ok_or_else(|| type_error(func, v)),
            };
            match args {
                [HostValue::Complex(re, im)] => Ok(HostValue::Complex(*re, *im)),
                _ => Ok(HostValue::Complex(part(args.first())?, part(args.get(1))?)),
            }
        }
        "dict" => {
            arity(func, args, 0, 1)?;
            if let Some(HostValue::Dict(entries)) = args.first() {
                return Ok(HostValue::Dict(entries.clone()));
            }
            let mut entries: Vec<(HostValue, HostValue)> = Vec::new();
            let pairs = match args {
                [] => Vec::new(),
                _ => items(func, &first)?,
            };
            for pair in pairs {
                let (k, v) = match pair {
                    HostValue::List(kv) | HostValue::Tuple(kv) if kv.len() == 2 => (kv[0].clone(), kv[1].clone()),
                    other => {
                        return Err(Error::msg(format!(
                            "dict(): sequence element {other} is not a key/value pair"
                        )))
                    }
                };
                match entries.iter_mut().find(|(key, _)| *key == k) {
                    Some(entry) => entry.1 = v,
                    None => entries.push((k, v)),
                }
            }
            Ok(HostValue::Dict(entries))
        }
        "divmod" => {
            arity(func, args, 2, 2)?;
            match (first.as_int(), args[1].as_int()) {
                (Some(a), Some(b)) => {
                    if b == 0 {
                        return Err(Error::msg("integer division or modulo by zero"));
                    }
                    let (q, r) = floor_divmod(a, b).ok_or_else(|| overflow(func))?;
                    Ok(HostValue::Tuple(vec![HostValue::Int(q), HostValue::Int(r)]))
                }
                _ => {
                    let a = first.as_f64().ok_or_else(|| type_error(func, &first))?;
                    let b = args[1].as_f64().ok_or_else(|| type_error(func, &args[1]))?;
                    if b == 0.0 {
                        return Err(Error::msg("float divmod() by zero"));
                    }
                    let q = (a / b).floor();
                    Ok(HostValue::Tuple(vec![HostValue::Float(q), HostValue::Float(a - b * q)]))
                }
            }
        }
        "float" => {
            arity(func, args, 0, 1)?;
            match first {
                HostValue::None => Ok(HostValue::Float(0.0)),
                HostValue::Str(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(HostValue::Float)
                    .map_err(|_| Error::msg(format!("could not convert string to float: '{s}'"))),
                other => other
                    .as_f64()
                    .map(HostValue::Float)
                    .ok_or_else(|| type_error(func, &other)),
            }
        }
        "getitem" => {
            arity(func, args, 2, 2)?;
            get_item(&first, &args[1])
        }
        "hash" => {
            arity(func, args, 1, 1)?;
            let v = match first {
                HostValue::Float(f) if f == f.trunc() => f as i64,
                other => other.as_int().ok_or_else(|| type_error(func, &other))?,
            };
            // -1 is reserved as an error marker by the scripting runtime.
            Ok(HostValue::Int(if v == -1 { -2 } else { v }))
        }
        "int" => {
            arity(func, args, 0, 1)?;
            match first {
                HostValue::None => Ok(HostValue::Int(0)),
                HostValue::Float(v) => {
                    if !v.is_finite() {
                        return Err(Error::msg(format!("cannot convert float {} to integer", format_float(v))));
                    }
                    Ok(HostValue::Int(v.trunc() as i64))
                }
                HostValue::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(HostValue::Int)
                    .map_err(|_| Error::msg(format!("invalid literal for int() with base 10: '{s}'"))),
                other => other
                    .as_int()
                    .map(HostValue::Int)
                    .ok_or_else(|| type_error(func, &other)),
            }
        }
        "len" => {
            arity(func, args, 1, 1)?;
            let n = match &first {
                HostValue::Str(s) => s.chars().count(),
                HostValue::List(v) | HostValue::Tuple(v) => v.len(),
                HostValue::Dict(v) => v.len(),
                HostValue::Tensor(t) if t.shape.rank() > 0 => t.shape.dims()[0],
                other => {
                    return Err(Error::msg(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(HostValue::Int(n as i64))
        }
        "list" => {
            arity(func, args, 0, 1)?;
            match args {
                [] => Ok(HostValue::List(Vec::new())),
                _ => Ok(HostValue::List(items(func, &first)?)),
            }
        }
        "tuple" => {
            arity(func, args, 0, 1)?;
            match args {
                [] => Ok(HostValue::Tuple(Vec::new())),
                _ => Ok(HostValue::Tuple(items(func, &first)?)),
            }
        }
        "max" => extremum(func, args, Ordering::Greater),
        "min" => extremum(func, args, Ordering::Less),
        "ord" => {
            arity(func, args, 1, 1)?;
            match &first {
                HostValue::Str(s) if s.chars().count() == 1 => {
                    Ok(HostValue::Int(s.chars().next().map_or(0, |c| c as i64)))
                }
                HostValue::Str(s) => Err(Error::msg(format!(
                    "ord() expected a character, but string of length {} found",
                    s.chars().count()
                ))),
                other => Err(type_error(func, other)),
            }
        }
        "range" => {
            arity(func, args, 1, 3)?;
            let mut bounds = Vec::with_capacity(args.len());
            for a in args {
                bounds.push(a.as_int().ok_or_else(|| type_error(func, a))?);
            }
            let (start, stop, step) = match bounds[..] {
                [stop] => (0, stop, 1),
                [start, stop] => (start, stop, 1),
                [start, stop, step] => (start, stop, step),
                _ => return Err(Error::msg("range() expects 1 to 3 arguments")),
            };
            if step == 0 {
                return Err(Error::msg("range() arg 3 must not be zero"));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                out.push(HostValue::Int(i));
                i = match i.checked_add(step) {
                    Some(next) => next,
                    None => break,
                };
            }
            Ok(HostValue::List(out))
        }
        "reversed" => {
            arity(func, args, 1, 1)?;
            let mut v = items(func, &first)?;
            v.reverse();
            Ok(HostValue::List(v))
        }
        "round" => {
            arity(func, args, 1, 2)?;
            let ndigits = match args.get(1) {
                None | Some(HostValue::None) => None,
                Some(n) => Some(n.as_int().ok_or_else(|| type_error(func, n))?),
            };
            match (&first, ndigits) {
                (HostValue::Int(v), _) => Ok(HostValue::Int(*v)),
                (HostValue::Bool(b), _) => Ok(HostValue::Int(i64::from(*b))),
                (HostValue::Float(v), None) => Ok(HostValue::Int(round_half_even(*v) as i64)),
                (HostValue::Float(v), Some(n)) => {
                    let scale = 10f64.powi(n as i32);
                    Ok(HostValue::Float(round_half_even(v * scale) / scale))
                }
                (other, _) => Err(type_error(func, other)),
            }
        }
        "set" => {
            arity(func, args, 0, 1)?;
            let mut seen: Vec<HostValue> = Vec::new();
            if !args.is_empty() {
                for v in items(func, &first)? {
                    if !seen.contains(&v) {
                        seen.push(v);
                    }
                }
            }
            Ok(HostValue::List(seen))
        }
        "slice" => {
            arity(func, args, 1, 3)?;
            let bound = |v: &HostValue| match v {
                HostValue::None => Ok(None),
                v => v.as_int().map(Some).ok_or_else(|| type_error(func, v)),
            };
            let mut bounds = Vec::with_capacity(args.len());
            for a in args {
                bounds.push(bound(a)?);
            }
            let (start, stop, step) = match bounds[..] {
                [stop] => (None, stop, None),
                [start, stop] => (start, stop, None),
                [start, stop, step] => (start, stop, step),
                _ => return Err(Error::msg("slice() expects 1 to 3 arguments")),
            };
            Ok(HostValue::Slice { start, stop, step })
        }
        "sorted" => {
            arity(func, args, 1, 2)?;
            let reverse = match args.get(1) {
                Some(v) => v.truthy()?,
                None => false,
            };
            let mut v = items(func, &first)?;
            let mut failure = None;
            v.sort_by(|a, b| {
                compare(a, b).unwrap_or_else(|e| {
                    failure.get_or_insert(e);
                    Ordering::Equal
                })
            });
            if let Some(e) = failure {
                return Err(e);
            }
            if reverse {
                v.reverse();
            }
            Ok(HostValue::List(v))
        }
        "str" => {
            arity(func, args, 0, 1)?;
            match args {
                [] => Ok(HostValue::Str(String::new())),
                _ => Ok(HostValue::Str(first.to_string())),
            }
        }
        "sum" => {
            arity(func, args, 1, 2)?;
            let mut acc = args.get(1).cloned().unwrap_or(HostValue::Int(0));
            for v in items(func, &first)? {
                acc = match (acc.as_int(), v.as_int()) {
                    (Some(a), Some(b)) => HostValue::Int(a.checked_add(b).ok_or_else(|| overflow(func))?),
                    _ => {
                        let a = acc.as_f64().ok_or_else(|| type_error(func, &acc))?;
                        let b = v.as_f64().ok_or_else(|| type_error(func, &v))?;
                        HostValue::Float(a + b)
                    }
                };
            }
            Ok(acc)
        }
        other => Err(Error::Untranslatable {
            construct: format!("builtin '{other}'"),
        }),
    }
}

/// Look up the compile-time value of a builtin argument.
fn arg_value(
    graph: &Graph,
    arg: &BuiltinArg,
    host: &HashMap<NodeId, HostValue>,
) -> Option<HostValue> {
    match arg {
        BuiltinArg::Value(v) => Some(v.clone()),
        BuiltinArg::Node(id) => {
            if let Some(v) = host.get(id) {
                return Some(v.clone());
            }
            graph
                .get(*id)
                .and_then(|n| n.kind.as_constant())
                .map(HostValue::from_host_tensor)
        }
    }
}

/// Fold Builtin nodes with known arguments into Constants.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackPass;

impl Pass for FallbackPass {
    fn name(&self) -> &str {
        "fallback"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut host: HashMap<NodeId, HostValue> = HashMap::new();
        let mut changed = false;
        for id in graph.topo_order()? {
            let (func, args) = match &graph.node(id)?.kind {
                NodeKind::Builtin { func, args } => (func.clone(), args.clone()),
                _ => continue,
            };
            let values: Option<Vec<HostValue>> =
                args.iter().map(|a| arg_value(graph, a, &host)).collect();
            let Some(values) = values else {
                continue;
            };
            let value = call_builtin(&func, &values)?;
            if let Some(t) = value.to_host_tensor() {
                tracing::debug!(node = %id, func = %func, "builtin folded");
                let node = graph.node_mut(id)?;
                node.abstract_value = Some(t.abstract_value());
                node.kind = NodeKind::Constant(t);
                changed = true;
            }
            // The constant loses bool and tuple types; later builtins read this.
            host.insert(id, value);
        }
        Ok(changed)
    }
}

/// Fold builtins, then reject any the outputs still depend on unless
/// runtime fallback is on.
pub fn resolve_builtins(graph: &mut Graph, runtime_fallback: bool) -> Result<()> {
    FallbackPass.run(graph)?;
    if runtime_fallback {
        return Ok(());
    }
    let mut live = HashSet::new();
    let mut stack = graph.outputs().to_vec();
    while let Some(id) = stack.pop() {
        if live.insert(id) {
            stack.extend(graph.node(id)?.kind.inputs());
        }
    }
    for node in graph.nodes().filter(|n| live.contains(&n.id)) {
        if let NodeKind::Builtin { func, args } = &node.kind {
            let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            return Err(Error::Untranslatable {
                construct: format!("{func}({})", parts.join(", ")),
            });
        }
    }
    Ok(())
}
