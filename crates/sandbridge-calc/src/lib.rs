//! A small vector calculator language hosted behind the bridge.
//!
//! Arithmetic over numeric vectors with recycling, strings, `<-`/`=`
//! assignment, `function` closures, `if`/`else` and a handful of builtins
//! (`c`, `sin`, `print`, `cat`, `readline`, `plot`, `hostcall`, ...). Values
//! print the way an R console prints them.

pub mod builtins;
pub mod lexer;
pub mod parser;
pub mod value;

use std::collections::HashMap;

use sandbridge::{Argument, Condition, Interpreter, Io, PackageStatus, ValueKind};
use smallvec::SmallVec;

use crate::{
    builtins::{Args, Builtin},
    parser::{BinaryOp, Expr, FunctionDef, UnaryOp},
    value::{Function, format_value},
};
pub use crate::value::Value;

/// Deepest closure call chain before evaluation is abandoned.
const MAX_CALL_DEPTH: usize = 256;
/// Longest vector `a:b` may produce.
const MAX_RANGE_LEN: f64 = 10_000_000.0;

pub struct Calc {
    globals: HashMap<String, Value>,
    /// Local scopes: closure calls and per-evaluation environments.
    frames: Vec<HashMap<String, Value>>,
    /// Whether the last top-level result should be printed by the console.
    visible: bool,
    installed: Vec<String>,
}

impl Default for Calc {
    fn default() -> Self {
        Self::new()
    }
}

impl Calc {
    #[must_use]
    pub fn new() -> Self {
        let globals = Builtin::ALL
            .iter()
            .map(|&b| (b.name().to_string(), Value::Function(Function::Builtin(b))))
            .collect();
        Self {
            globals,
            frames: Vec::new(),
            visible: true,
            installed: Vec::new(),
        }
    }

    /// Packages installed so far, in installation order.
    #[must_use]
    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    fn run(&mut self, code: &str, io: &mut Io<'_>, print: bool) -> Result<Value, Condition> {
        let program =
            parser::parse(code).map_err(|e| Condition::error(format!("parse error: {e}")))?;
        let mut last = Value::Null;
        for expr in &program {
            self.visible = true;
            last = self.eval_expr(expr, io, 0)?;
            if print && self.visible {
                io.stdout(&format_value(&last))?;
            }
        }
        Ok(last)
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames
            .last()
            .and_then(|frame| frame.get(name))
            .or_else(|| self.globals.get(name))
    }

    /// Like [`lookup`](Self::lookup), skipping bindings that are not
    /// functions, so `c <- 1; c(1, 2)` still finds the builtin.
    fn lookup_function(&self, name: &str) -> Option<&Value> {
        let is_function = |v: &&Value| matches!(v, Value::Function(_));
        self.frames
            .last()
            .and_then(|frame| frame.get(name))
            .filter(is_function)
            .or_else(|| self.globals.get(name).filter(is_function))
    }

    fn assign(&mut self, name: &str, value: Value) {
        let scope = self.frames.last_mut().unwrap_or(&mut self.globals);
        scope.insert(name.to_string(), value);
    }

    fn wire(&self, value: &Value) -> Result<sandbridge::Value, Condition> {
        sandbridge::Value::from_json_value(&value.to_wire()?)
            .map_err(|e| Condition::error(e.to_string()))
    }

    fn unwire(&self, value: &sandbridge::Value) -> Result<Value, Condition> {
        let json = value
            .to_json_value()
            .map_err(|e| Condition::error(e.to_string()))?;
        Value::from_wire(&json)
    }

    fn eval_expr(&mut self, expr: &Expr, io: &mut Io<'_>, depth: usize) -> Result<Value, Condition> {
        match expr {
            Expr::Number(n) => Ok(Value::number(*n)),
            Expr::Str(s) => Ok(Value::string(s.clone())),
            Expr::Bool(b) => Ok(Value::logical(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Ident(name) => self
                .lookup(name)
                .cloned()
                .ok_or_else(|| Condition::error(format!("object '{name}' not found"))),
            Expr::Unary(op, operand) => {
                let value = self.eval_expr(operand, io, depth)?.to_doubles()?;
                Ok(Value::Double(match op {
                    UnaryOp::Neg => value.into_iter().map(|n| -n).collect(),
                    UnaryOp::Plus => value,
                }))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval_expr(lhs, io, depth)?;
                let rhs = self.eval_expr(rhs, io, depth)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Assign(name, value) => {
                let value = self.eval_expr(value, io, depth)?;
                self.assign(name, value.clone());
                self.visible = false;
                Ok(value)
            }
            Expr::Call(callee, args) => {
                io.check_interrupt()?;
                let function = match &**callee {
                    Expr::Ident(name) => self
                        .lookup_function(name)
                        .cloned()
                        .ok_or_else(|| Condition::error(format!("could not find function \"{name}\"")))?,
                    callee => self.eval_expr(callee, io, depth)?,
                };
                let mut values = Args::new();
                for arg in args {
                    values.push((arg.name.clone(), self.eval_expr(&arg.value, io, depth)?));
                }
                self.visible = true;
                self.apply(&function, values, io, depth)
            }
            Expr::Block(body) => {
                let mut last = Value::Null;
                for expr in body {
                    self.visible = true;
                    last = self.eval_expr(expr, io, depth)?;
                }
                Ok(last)
            }
            Expr::If(condition, then, otherwise) => {
                if self.eval_expr(condition, io, depth)?.truthy()? {
                    self.eval_expr(then, io, depth)
                } else if let Some(otherwise) = otherwise {
                    self.eval_expr(otherwise, io, depth)
                } else {
                    self.visible = false;
                    Ok(Value::Null)
                }
            }
            Expr::Function(def) => Ok(Value::Function(Function::Closure(def.clone()))),
        }
    }

    fn apply(
        &mut self,
        function: &Value,
        args: Args,
        io: &mut Io<'_>,
        depth: usize,
    ) -> Result<Value, Condition> {
        match function {
            Value::Function(Function::Builtin(builtin)) => builtin.call(self, args, io),
            Value::Function(Function::Closure(def)) => {
                if depth >= MAX_CALL_DEPTH {
                    return Err(Condition::error("evaluation nested too deeply"));
                }
                let frame = self.bind_params(def, args, io, depth)?;
                self.frames.push(frame);
                let result = self.eval_expr(&def.body, io, depth + 1);
                self.frames.pop();
                result
            }
            other => Err(Condition::error(format!(
                "attempt to apply non-function ({})",
                other.kind()
            ))),
        }
    }

    /// Match arguments to parameters: by name first, then by position.
    fn bind_params(
        &mut self,
        def: &FunctionDef,
        args: Args,
        io: &mut Io<'_>,
        depth: usize,
    ) -> Result<HashMap<String, Value>, Condition> {
        let mut slots: SmallVec<[Option<Value>; 4]> = smallvec::smallvec![None; def.params.len()];
        let mut positional = Vec::new();
        for (name, value) in args {
            match name {
                Some(name) => {
                    let index = def
                        .params
                        .iter()
                        .position(|p| p.name == name)
                        .ok_or_else(|| Condition::error(format!("unused argument ({name})")))?;
                    slots[index] = Some(value);
                }
                None => positional.push(value),
            }
        }
        let mut positional = positional.into_iter();
        for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
            *slot = positional.next();
        }
        if positional.next().is_some() {
            return Err(Condition::error("unused argument"));
        }

        let mut frame = HashMap::with_capacity(def.params.len());
        for (param, slot) in def.params.iter().zip(slots) {
            let value = match (slot, &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => self.eval_expr(default, io, depth)?,
                (None, None) => {
                    return Err(Condition::error(format!(
                        "argument \"{}\" is missing, with no default",
                        param.name
                    )));
                }
            };
            frame.insert(param.name.clone(), value);
        }
        Ok(frame)
    }
}

fn recycle<T: Copy, U>(a: &[T], b: &[T], f: impl Fn(T, T) -> U) -> Vec<U> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let n = a.len().max(b.len());
    (0..n).map(|i| f(a[i % a.len()], b[i % b.len()])).collect()
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, Condition> {
    if op.is_comparison()
        && (matches!(lhs, Value::Character(_)) || matches!(rhs, Value::Character(_)))
    {
        let (a, b) = (lhs.to_strings()?, rhs.to_strings()?);
        let a: Vec<&str> = a.iter().map(String::as_str).collect();
        let b: Vec<&str> = b.iter().map(String::as_str).collect();
        return Ok(Value::Logical(recycle(&a, &b, |x, y| match op {
            BinaryOp::Eq => x == y,
            BinaryOp::Ne => x != y,
            BinaryOp::Lt => x < y,
            BinaryOp::Le => x <= y,
            BinaryOp::Gt => x > y,
            _ => x >= y,
        })));
    }

    let (a, b) = (lhs.to_doubles()?, rhs.to_doubles()?);
    Ok(match op {
        BinaryOp::Add => Value::Double(recycle(&a, &b, |x, y| x + y)),
        BinaryOp::Sub => Value::Double(recycle(&a, &b, |x, y| x - y)),
        BinaryOp::Mul => Value::Double(recycle(&a, &b, |x, y| x * y)),
        BinaryOp::Div => Value::Double(recycle(&a, &b, |x, y| x / y)),
        BinaryOp::Pow => Value::Double(recycle(&a, &b, f64::powf)),
        BinaryOp::Range => {
            let (Some(&from), Some(&to)) = (a.first(), b.first()) else {
                return Err(Condition::error("argument of length 0"));
            };
            if !from.is_finite() || !to.is_finite() {
                return Err(Condition::error("NA/NaN argument"));
            }
            let len = (to - from).abs().floor() + 1.0;
            if len > MAX_RANGE_LEN {
                return Err(Condition::error(format!("range {from}:{to} is too long")));
            }
            let step: f64 = if to >= from { 1.0 } else { -1.0 };
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_precision_loss,
                clippy::cast_sign_loss
            )]
            let out = (0..len as usize).map(|i| step.mul_add(i as f64, from)).collect();
            Value::Double(out)
        }
        BinaryOp::Eq => Value::Logical(recycle(&a, &b, |x, y| x == y)),
        BinaryOp::Ne => Value::Logical(recycle(&a, &b, |x, y| x != y)),
        BinaryOp::Lt => Value::Logical(recycle(&a, &b, |x, y| x < y)),
        BinaryOp::Le => Value::Logical(recycle(&a, &b, |x, y| x <= y)),
        BinaryOp::Gt => Value::Logical(recycle(&a, &b, |x, y| x > y)),
        BinaryOp::Ge => Value::Logical(recycle(&a, &b, |x, y| x >= y)),
    })
}

impl Interpreter for Calc {
    type Value = Value;

    fn eval(
        &mut self,
        code: &str,
        env: &[(String, Value)],
        io: &mut Io<'_>,
    ) -> Result<Value, Condition> {
        if env.is_empty() {
            return self.run(code, io, false);
        }
        self.frames.push(env.iter().cloned().collect());
        let result = self.run(code, io, false);
        self.frames.pop();
        result
    }

    fn call(
        &mut self,
        function: &Value,
        args: &[Argument<Value>],
        io: &mut Io<'_>,
    ) -> Result<Value, Condition> {
        let args = args
            .iter()
            .map(|arg| (arg.name.clone(), arg.value.clone()))
            .collect();
        self.apply(function, args, io, 0)
    }

    fn kind(&self, value: &Value) -> ValueKind {
        value.kind()
    }

    fn to_wire(&self, value: &Value) -> Result<sandbridge::Value, Condition> {
        self.wire(value)
    }

    fn from_wire(&mut self, value: &sandbridge::Value) -> Result<Value, Condition> {
        self.unwire(value)
    }

    fn to_text(&self, value: &Value) -> String {
        format_value(value)
    }

    fn bind(&mut self, name: &str, value: Value) -> Result<(), Condition> {
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    fn eval_console(&mut self, line: &str, io: &mut Io<'_>) -> Result<(), Condition> {
        self.run(line, io, true).map(drop)
    }

    /// Installation is simulated: names are validated and recorded.
    fn install_packages(&mut self, names: &[String], io: &mut Io<'_>) -> Result<(), Condition> {
        for name in names {
            io.progress(name, PackageStatus::Downloading)?;
            let valid = !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.');
            if !valid {
                io.progress(name, PackageStatus::Failed)?;
                return Err(Condition::error(format!("package '{name}' is not available")));
            }
            io.progress(name, PackageStatus::Installing)?;
            if !self.installed.contains(name) {
                self.installed.push(name.clone());
            }
            tracing::debug!(package = %name, "package installed");
            io.progress(name, PackageStatus::Installed)?;
        }
        Ok(())
    }
}
