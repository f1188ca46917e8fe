use std::{
    thread,
    time::{Duration, Instant},
};

use sandbridge::{Condition, Image, ImageFormat, Io};
use smallvec::SmallVec;

use crate::{
    Calc,
    value::{Value, format_value},
};

pub type Args = SmallVec<[(Option<String>, Value); 4]>;

const SLEEP_STEP: Duration = Duration::from_millis(10);
const PLOT_WIDTH: u32 = 120;
const PLOT_HEIGHT: u32 = 90;

macro_rules! builtins {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Builtin {
            $($variant),*
        }

        impl Builtin {
            pub const ALL: &[Self] = &[$(Self::$variant),*];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),*
                }
            }
        }
    };
}

builtins! {
    C => "c",
    List => "list",
    Length => "length",
    Sum => "sum",
    Mean => "mean",
    Abs => "abs",
    Sqrt => "sqrt",
    Exp => "exp",
    Log => "log",
    Sin => "sin",
    Cos => "cos",
    Tan => "tan",
    Print => "print",
    Cat => "cat",
    Message => "message",
    Paste => "paste",
    Readline => "readline",
    Stop => "stop",
    Invisible => "invisible",
    Plot => "plot",
    Hostcall => "hostcall",
    SysSleep => "Sys.sleep",
}

impl Builtin {
    pub fn call(self, calc: &mut Calc, mut args: Args, io: &mut Io<'_>) -> Result<Value, Condition> {
        match self {
            Self::C => combine(args),
            Self::List => Ok(Value::List(args.into_vec())),
            Self::Length => {
                #[allow(clippy::cast_precision_loss)]
                let len = single(self, args)?.len() as f64;
                Ok(Value::number(len))
            }
            Self::Sum => {
                let mut total = 0.0;
                for (_, value) in &args {
                    total += value.to_doubles()?.iter().sum::<f64>();
                }
                Ok(Value::number(total))
            }
            Self::Mean => {
                let x = single(self, args)?.to_doubles()?;
                #[allow(clippy::cast_precision_loss)]
                let mean = x.iter().sum::<f64>() / x.len() as f64;
                Ok(Value::number(mean))
            }
            Self::Abs => map_doubles(self, args, f64::abs),
            Self::Sqrt => map_doubles(self, args, f64::sqrt),
            Self::Exp => map_doubles(self, args, f64::exp),
            Self::Log => map_doubles(self, args, f64::ln),
            Self::Sin => map_doubles(self, args, f64::sin),
            Self::Cos => map_doubles(self, args, f64::cos),
            Self::Tan => map_doubles(self, args, f64::tan),
            Self::Print => {
                let x = single(self, args)?;
                io.stdout(&format_value(&x))?;
                calc.visible = false;
                Ok(x)
            }
            Self::Cat => {
                let sep = take_string(&mut args, "sep")?.unwrap_or_else(|| " ".to_string());
                let text = strings(args)?.join(&sep);
                io.stdout(&text)?;
                calc.visible = false;
                Ok(Value::Null)
            }
            Self::Message => {
                let text = strings(args)?.concat();
                io.stderr(&text)?;
                calc.visible = false;
                Ok(Value::Null)
            }
            Self::Paste => paste(args),
            Self::Readline => {
                let prompt = match take_string(&mut args, "prompt")? {
                    Some(prompt) => prompt,
                    None => strings(args)?.concat(),
                };
                Ok(Value::string(io.read_line(&prompt)?))
            }
            Self::Stop => Err(Condition::error(strings(args)?.concat())),
            Self::Invisible => {
                let x = single(self, args)?;
                calc.visible = false;
                Ok(x)
            }
            Self::Plot => {
                let y = single(self, args)?.to_doubles()?;
                io.canvas(plot(&y))?;
                calc.visible = false;
                Ok(Value::Null)
            }
            Self::Hostcall => {
                let mut args = args.into_iter();
                let (Some((_, call_type)), payload) = (args.next(), args.next()) else {
                    return Err(Condition::error("hostcall(type, payload) needs a call type"));
                };
                let Value::Character(call_type) = call_type else {
                    return Err(Condition::error("call type must be a string"));
                };
                let payload = payload.map_or(Value::Null, |(_, value)| value);
                let call_type = call_type.first().map_or("", String::as_str);
                let reply = io.host_call(call_type, calc.wire(&payload)?)?;
                calc.unwire(&reply)
            }
            Self::SysSleep => {
                let seconds = single(self, args)?.to_doubles()?.first().copied().unwrap_or(0.0);
                let deadline = Duration::try_from_secs_f64(seconds.max(0.0))
                    .ok()
                    .and_then(|duration| Instant::now().checked_add(duration))
                    .ok_or_else(|| Condition::error("invalid sleep duration"))?;
                loop {
                    io.check_interrupt()?;
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    thread::sleep(SLEEP_STEP.min(deadline - now));
                }
                calc.visible = false;
                Ok(Value::Null)
            }
        }
    }
}

fn single(builtin: Builtin, args: Args) -> Result<Value, Condition> {
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some((_, value)), None) => Ok(value),
        _ => Err(Condition::error(format!(
            "{}() takes exactly one argument",
            builtin.name()
        ))),
    }
}

fn map_doubles(builtin: Builtin, args: Args, f: fn(f64) -> f64) -> Result<Value, Condition> {
    let x = single(builtin, args)?.to_doubles()?;
    Ok(Value::Double(x.into_iter().map(f).collect()))
}

fn take_string(args: &mut Args, name: &str) -> Result<Option<String>, Condition> {
    let Some(index) = args.iter().position(|(n, _)| n.as_deref() == Some(name)) else {
        return Ok(None);
    };
    let (_, value) = args.remove(index);
    Ok(Some(value.to_strings()?.concat()))
}

fn strings(args: Args) -> Result<Vec<String>, Condition> {
    let mut out = Vec::new();
    for (_, value) in args {
        out.extend(value.to_strings()?);
    }
    Ok(out)
}

/// `c(...)`: the result has the most general type of its arguments.
fn combine(args: Args) -> Result<Value, Condition> {
    if args.iter().any(|(_, v)| matches!(v, Value::List(_) | Value::Function(_))) {
        let mut entries = Vec::new();
        for (name, value) in args {
            match value {
                Value::List(inner) => entries.extend(inner),
                value => entries.push((name, value)),
            }
        }
        return Ok(Value::List(entries));
    }
    if args.iter().any(|(_, v)| matches!(v, Value::Character(_))) {
        return Ok(Value::Character(strings(args)?));
    }
    if args.iter().any(|(_, v)| matches!(v, Value::Double(_))) {
        let mut out = Vec::new();
        for (_, value) in args {
            out.extend(value.to_doubles()?);
        }
        return Ok(Value::Double(out));
    }
    if args.iter().any(|(_, v)| matches!(v, Value::Logical(_))) {
        let mut out = Vec::new();
        for (_, value) in args {
            if let Value::Logical(v) = value {
                out.extend(v);
            }
        }
        return Ok(Value::Logical(out));
    }
    Ok(Value::Null)
}

/// `paste(..., sep = " ", collapse = NULL)`, recycling shorter arguments.
fn paste(mut args: Args) -> Result<Value, Condition> {
    let sep = take_string(&mut args, "sep")?.unwrap_or_else(|| " ".to_string());
    let collapse = take_string(&mut args, "collapse")?;
    let columns = args
        .into_iter()
        .map(|(_, value)| value.to_strings())
        .collect::<Result<Vec<_>, _>>()?;
    let columns: Vec<_> = columns.into_iter().filter(|c| !c.is_empty()).collect();
    let rows = columns.iter().map(Vec::len).max().unwrap_or(0);
    let pasted: Vec<String> = (0..rows)
        .map(|row| {
            columns
                .iter()
                .map(|column| column[row % column.len()].as_str())
                .collect::<Vec<_>>()
                .join(&sep)
        })
        .collect();
    Ok(match collapse {
        Some(collapse) => Value::string(pasted.join(&collapse)),
        None => Value::Character(pasted),
    })
}

/// Scatter plot of `y` against its index, as a binary PPM.
fn plot(y: &[f64]) -> Image {
    let (width, height) = (PLOT_WIDTH as usize, PLOT_HEIGHT as usize);
    let mut pixels = vec![255_u8; width * height * 3];
    let finite: Vec<_> = y.iter().copied().filter(|v| v.is_finite()).collect();
    let lo = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = if hi > lo { hi - lo } else { 1.0 };

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    for (i, &v) in y.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        let x = if y.len() > 1 {
            i * (width - 1) / (y.len() - 1)
        } else {
            width / 2
        };
        let row = ((hi - v) / span * (height - 1) as f64).round() as usize;
        let offset = (row.min(height - 1) * width + x) * 3;
        pixels[offset..offset + 3].fill(0);
    }

    let mut bytes = format!("P6\n{width} {height}\n255\n").into_bytes();
    bytes.extend_from_slice(&pixels);
    Image {
        width: PLOT_WIDTH,
        height: PLOT_HEIGHT,
        format: ImageFormat::Ppm,
        bytes: bytes.into(),
    }
}
