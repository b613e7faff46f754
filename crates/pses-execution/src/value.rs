use std::fmt;

/// A value produced by (or passed to) the scripting engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PsValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PsValue>),
}

impl PsValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PsValue::Null => "null",
            PsValue::Bool(_) => "bool",
            PsValue::Int(_) => "int",
            PsValue::Float(_) => "float",
            PsValue::Str(_) => "string",
            PsValue::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PsValue::Null)
    }
}

impl fmt::Display for PsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsValue::Null => Ok(()),
            PsValue::Bool(true) => write!(f, "True"),
            PsValue::Bool(false) => write!(f, "False"),
            PsValue::Int(v) => write!(f, "{v}"),
            PsValue::Float(v) => write!(f, "{v}"),
            PsValue::Str(v) => write!(f, "{v}"),
            PsValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for PsValue {
    fn from(value: &str) -> Self {
        PsValue::Str(value.to_string())
    }
}

impl From<String> for PsValue {
    fn from(value: String) -> Self {
        PsValue::Str(value)
    }
}

impl From<i64> for PsValue {
    fn from(value: i64) -> Self {
        PsValue::Int(value)
    }
}

impl From<bool> for PsValue {
    fn from(value: bool) -> Self {
        PsValue::Bool(value)
    }
}

impl From<f64> for PsValue {
    fn from(value: f64) -> Self {
        PsValue::Float(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {found} value to {expected}")]
pub struct ConversionError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl ConversionError {
    fn new(expected: &'static str, found: &PsValue) -> Self {
        Self {
            expected,
            found: found.type_name(),
        }
    }
}

/// Typed view over engine output, used by `ExecutionService::execute_command::<T>`.
pub trait FromPsValue: Sized {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError>;
}

impl FromPsValue for PsValue {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        Ok(value)
    }
}

impl FromPsValue for String {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        match value {
            PsValue::Str(s) => Ok(s),
            PsValue::List(_) => Err(ConversionError::new("string", &value)),
            other => Ok(other.to_string()),
        }
    }
}

impl FromPsValue for i64 {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        match value {
            PsValue::Int(v) => Ok(v),
            PsValue::Bool(b) => Ok(i64::from(b)),
            PsValue::Float(v) if v.fract() == 0.0 => Ok(v as i64),
            PsValue::Str(ref s) => s
                .trim()
                .parse()
                .map_err(|_| ConversionError::new("int", &value)),
            other => Err(ConversionError::new("int", &other)),
        }
    }
}

impl FromPsValue for f64 {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        match value {
            PsValue::Float(v) => Ok(v),
            PsValue::Int(v) => Ok(v as f64),
            PsValue::Str(ref s) => s
                .trim()
                .parse()
                .map_err(|_| ConversionError::new("float", &value)),
            other => Err(ConversionError::new("float", &other)),
        }
    }
}

impl FromPsValue for bool {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        match value {
            PsValue::Bool(b) => Ok(b),
            PsValue::Int(v) => Ok(v != 0),
            PsValue::Null => Ok(false),
            PsValue::Str(ref s) if s.eq_ignore_ascii_case("true") => Ok(true),
            PsValue::Str(ref s) if s.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(ConversionError::new("bool", &other)),
        }
    }
}

impl<T: FromPsValue> FromPsValue for Option<T> {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        match value {
            PsValue::Null => Ok(None),
            other => T::from_ps_value(other).map(Some),
        }
    }
}

impl<T: FromPsValue> FromPsValue for Vec<T> {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        match value {
            PsValue::List(items) => items.into_iter().map(T::from_ps_value).collect(),
            PsValue::Null => Ok(Vec::new()),
            scalar => Ok(vec![T::from_ps_value(scalar)?]),
        }
    }
}
