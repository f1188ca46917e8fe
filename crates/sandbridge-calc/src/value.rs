use std::{fmt::Write as _, rc::Rc};

use sandbridge::{Condition, ValueKind};

use crate::{builtins::Builtin, parser::FunctionDef};

/// Values are vectors: a scalar is a vector of length one.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Logical(Vec<bool>),
    Double(Vec<f64>),
    Character(Vec<String>),
    List(Vec<(Option<String>, Value)>),
    Function(Function),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    Builtin(Builtin),
    Closure(Rc<FunctionDef>),
}

impl Value {
    pub fn number(n: f64) -> Self {
        Self::Double(vec![n])
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::Character(vec![s.into()])
    }

    pub fn logical(b: bool) -> Self {
        Self::Logical(vec![b])
    }

    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Logical(_) => ValueKind::Logical,
            Self::Double(_) => ValueKind::Double,
            Self::Character(_) => ValueKind::Character,
            Self::List(_) => ValueKind::List,
            Self::Function(_) => ValueKind::Function,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Logical(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Character(v) => v.len(),
            Self::List(v) => v.len(),
            Self::Function(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coerce to doubles, as arithmetic does.
    pub fn to_doubles(&self) -> Result<Vec<f64>, Condition> {
        match self {
            Self::Null => Ok(Vec::new()),
            Self::Logical(v) => Ok(v.iter().map(|&b| f64::from(u8::from(b))).collect()),
            Self::Double(v) => Ok(v.clone()),
            Self::Character(_) | Self::List(_) | Self::Function(_) => Err(Condition::error(
                format!("non-numeric argument: {}", self.kind()),
            )),
        }
    }

    /// Coerce to strings, as `paste` and `cat` do.
    pub fn to_strings(&self) -> Result<Vec<String>, Condition> {
        match self {
            Self::Null => Ok(Vec::new()),
            Self::Logical(v) => Ok(v.iter().map(|&b| format_logical(b).to_string()).collect()),
            Self::Double(v) => Ok(v.iter().map(|&n| format_double(n)).collect()),
            Self::Character(v) => Ok(v.clone()),
            Self::List(_) | Self::Function(_) => Err(Condition::error(format!(
                "argument of type '{}' cannot be handled",
                self.kind()
            ))),
        }
    }

    /// First element as a truth value, for conditions.
    pub fn truthy(&self) -> Result<bool, Condition> {
        let first = match self {
            Self::Logical(v) => v.first().copied(),
            Self::Double(v) => v.first().map(|&n| n != 0.0),
            _ => None,
        };
        first.ok_or_else(|| Condition::error("argument is not interpretable as logical"))
    }

    pub fn to_wire(&self) -> Result<serde_json::Value, Condition> {
        use serde_json::Value as Json;

        fn vector<T>(items: &[T], each: impl Fn(&T) -> Json) -> Json {
            if let [single] = items {
                each(single)
            } else {
                Json::Array(items.iter().map(each).collect())
            }
        }

        Ok(match self {
            Self::Null => Json::Null,
            Self::Logical(v) => vector(v, |&b| Json::Bool(b)),
            Self::Double(v) => vector(v, |&n| {
                serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
            }),
            Self::Character(v) => vector(v, |s| Json::String(s.clone())),
            Self::List(entries) if !entries.is_empty() && entries.iter().all(|(n, _)| n.is_some()) => {
                let mut map = serde_json::Map::new();
                for (name, value) in entries {
                    map.insert(name.clone().unwrap_or_default(), value.to_wire()?);
                }
                Json::Object(map)
            }
            Self::List(entries) => Json::Array(
                entries
                    .iter()
                    .map(|(_, value)| value.to_wire())
                    .collect::<Result<_, _>>()?,
            ),
            Self::Function(_) => {
                return Err(Condition::error("a function has no wire representation"));
            }
        })
    }

    pub fn from_wire(json: &serde_json::Value) -> Result<Self, Condition> {
        use serde_json::Value as Json;

        Ok(match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::logical(*b),
            Json::Number(n) => Self::number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Self::string(s.clone()),
            Json::Array(items) => {
                if let Some(v) = items.iter().map(Json::as_bool).collect::<Option<Vec<_>>>() {
                    if !v.is_empty() {
                        return Ok(Self::Logical(v));
                    }
                }
                if let Some(v) = items.iter().map(Json::as_f64).collect::<Option<Vec<_>>>() {
                    return Ok(Self::Double(v));
                }
                if let Some(v) = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                {
                    return Ok(Self::Character(v));
                }
                Self::List(
                    items
                        .iter()
                        .map(|item| Ok((None, Self::from_wire(item)?)))
                        .collect::<Result<_, Condition>>()?,
                )
            }
            Json::Object(map) => Self::List(
                map.iter()
                    .map(|(name, item)| Ok((Some(name.clone()), Self::from_wire(item)?)))
                    .collect::<Result<_, Condition>>()?,
            ),
        })
    }
}

const LINE_WIDTH: usize = 80;

pub const fn format_logical(b: bool) -> &'static str {
    if b { "TRUE" } else { "FALSE" }
}

/// Seven significant digits, trailing zeros dropped.
pub fn format_double(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Inf" } else { "-Inf" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let exponent = n.abs().log10().floor();
    if !(-5.0..15.0).contains(&exponent) {
        let formatted = format!("{n:.6e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{exp}", trim_zeros(mantissa)),
            None => format!("{n:e}"),
        };
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let decimals = (6.0 - exponent).max(0.0) as usize;
    trim_zeros(&format!("{n:.decimals$}")).to_string()
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Console rendering: `[1] 1 2 3`, wrapped with the index of each line's
/// first element. Numbers align right, strings left.
fn format_vector(items: &[String], right: bool) -> String {
    let label_width = format!("[{}]", items.len()).len();
    let item_width = items.iter().map(String::len).max().unwrap_or(0);
    let per_line = ((LINE_WIDTH - label_width) / (item_width + 1)).max(1);

    let mut out = String::new();
    for (line, chunk) in items.chunks(per_line).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        let label = format!("[{}]", line * per_line + 1);
        let _ = write!(out, "{label:>label_width$}");
        for item in chunk {
            if right {
                let _ = write!(out, " {item:>item_width$}");
            } else {
                let _ = write!(out, " {item:<item_width$}");
            }
        }
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
    }
    out
}

pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Logical(v) if v.is_empty() => "logical(0)".to_string(),
        Value::Double(v) if v.is_empty() => "numeric(0)".to_string(),
        Value::Character(v) if v.is_empty() => "character(0)".to_string(),
        Value::Logical(v) => format_vector(
            &v.iter()
                .map(|&b| format_logical(b).to_string())
                .collect::<Vec<_>>(),
            true,
        ),
        Value::Double(v) => {
            format_vector(&v.iter().map(|&n| format_double(n)).collect::<Vec<_>>(), true)
        }
        Value::Character(v) => {
            format_vector(&v.iter().map(|s| quote(s)).collect::<Vec<_>>(), false)
        }
        Value::List(entries) if entries.is_empty() => "list()".to_string(),
        Value::List(entries) => {
            let mut out = String::new();
            for (i, (name, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str("\n\n");
                }
                match name {
                    Some(name) => {
                        let _ = writeln!(out, "${name}");
                    }
                    None => {
                        let _ = writeln!(out, "[[{}]]", i + 1);
                    }
                }
                out.push_str(&format_value(item));
            }
            out
        }
        Value::Function(Function::Builtin(builtin)) => {
            format!("function (...) .Primitive(\"{}\")", builtin.name())
        }
        Value::Function(Function::Closure(def)) => {
            let params: Vec<_> = def.params.iter().map(|p| p.name.as_str()).collect();
            format!("function({})", params.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn doubles_print_with_seven_significant_digits() {
        assert_eq!(format_double(2.0), "2");
        assert_eq!(format_double(1235.0), "1235");
        assert_eq!(format_double(1.0_f64.sin()), "0.841471");
        assert_eq!(format_double(2.0_f64.sin()), "0.9092974");
        assert_eq!(format_double(-0.5), "-0.5");
        assert_eq!(format_double(1e20), "1e20");
        assert_eq!(format_double(f64::NEG_INFINITY), "-Inf");
    }

    #[test]
    fn vectors_print_like_a_console() {
        assert_eq!(format_value(&Value::number(2.0)), "[1] 2");
        assert_eq!(
            format_value(&Value::Character(vec!["a".into(), "b\"".into()])),
            "[1] \"a\"   \"b\\\"\""
        );
        assert_eq!(format_value(&Value::Null), "NULL");

        let long = Value::Double((1..=30).map(f64::from).collect());
        let text = format_value(&long);
        let lines: Vec<_> = text.lines().collect();
        assert!(lines.len() > 1);
        assert!(lines[0].starts_with(" [1]"));
        assert!(lines.iter().all(|line| line.len() <= LINE_WIDTH));
    }

    #[test]
    fn lists_print_each_entry() {
        let list = Value::List(vec![
            (Some("a".into()), Value::number(1.0)),
            (None, Value::string("x")),
        ]);
        assert_eq!(format_value(&list), "$a\n[1] 1\n\n[[2]]\n[1] \"x\"");
    }

    #[test]
    fn wire_form_unboxes_scalars() {
        assert_eq!(Value::number(3.0).to_wire().unwrap(), json!(3.0));
        assert_eq!(
            Value::Double(vec![1.0, 2.0]).to_wire().unwrap(),
            json!([1.0, 2.0])
        );
        assert_eq!(
            Value::List(vec![(Some("k".into()), Value::logical(true))])
                .to_wire()
                .unwrap(),
            json!({"k": true})
        );
        assert!(
            Value::Function(Function::Builtin(Builtin::Sin))
                .to_wire()
                .is_err()
        );
    }

    #[test]
    fn wire_arrays_become_vectors() {
        assert_eq!(
            Value::from_wire(&json!([1, 2, 3])).unwrap(),
            Value::Double(vec![1.0, 2.0, 3.0])
        );
        assert_eq!(
            Value::from_wire(&json!(["a", "b"])).unwrap(),
            Value::Character(vec!["a".into(), "b".into()])
        );
        assert!(matches!(
            Value::from_wire(&json!([1, "a"])).unwrap(),
            Value::List(entries) if entries.len() == 2
        ));
        assert!(matches!(
            Value::from_wire(&json!({"x": 1})).unwrap(),
            Value::List(entries) if entries[0].0.as_deref() == Some("x")
        ));
    }
}
