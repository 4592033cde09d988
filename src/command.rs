//! Argument values and pre-encode validation.
//!
//! An [`Invocation`] is one concrete request to execute a telecommand. Its
//! arguments are validated against the definition's parameter specs before
//! a single byte is encoded; validation failures are caller errors and
//! never reach the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{ParamType, TcmdId, TelecommandDefinition};

/// Runtime argument value for one telecommand parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl ArgValue {
    /// The wire type this value encodes as.
    pub fn param_type(&self) -> ParamType {
        match self {
            ArgValue::U8(_) => ParamType::U8,
            ArgValue::U16(_) => ParamType::U16,
            ArgValue::U32(_) => ParamType::U32,
            ArgValue::U64(_) => ParamType::U64,
            ArgValue::I32(_) => ParamType::I32,
            ArgValue::I64(_) => ParamType::I64,
            ArgValue::F64(_) => ParamType::F64,
            ArgValue::Str(_) => ParamType::Str,
            ArgValue::Bytes(_) => ParamType::Bytes,
        }
    }

    /// Integer magnitude for bounds checking, when the value is an integer.
    pub fn as_integer(&self) -> Option<i128> {
        match self {
            ArgValue::U8(v) => Some(i128::from(*v)),
            ArgValue::U16(v) => Some(i128::from(*v)),
            ArgValue::U32(v) => Some(i128::from(*v)),
            ArgValue::U64(v) => Some(i128::from(*v)),
            ArgValue::I32(v) => Some(i128::from(*v)),
            ArgValue::I64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::U8(v) => write!(f, "{v}"),
            ArgValue::U16(v) => write!(f, "{v}"),
            ArgValue::U32(v) => write!(f, "{v}"),
            ArgValue::U64(v) => write!(f, "{v}"),
            ArgValue::I32(v) => write!(f, "{v}"),
            ArgValue::I64(v) => write!(f, "{v}"),
            ArgValue::F64(v) => write!(f, "{v}"),
            ArgValue::Str(s) => write!(f, "{s:?}"),
            ArgValue::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// One concrete request instance: which telecommand, with which arguments.
/// Short-lived; the transport session assigns the sequence number at send
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub id: TcmdId,
    pub args: Vec<ArgValue>,
}

impl Invocation {
    pub fn new(id: TcmdId, args: Vec<ArgValue>) -> Self {
        Self { id, args }
    }
}

/// Argument validation or encoding failure. No bytes are sent when any of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },
    #[error("argument `{param}` expects {expected}, got {got}")]
    TypeMismatch {
        param: String,
        expected: ParamType,
        got: ParamType,
    },
    #[error("argument `{param}` value {value} outside {min}..={max}")]
    OutOfBounds {
        param: String,
        value: i128,
        min: i128,
        max: i128,
    },
    #[error("argument `{param}` is {len} bytes, limit is {limit}")]
    VariableTooLong {
        param: String,
        len: usize,
        limit: usize,
    },
    #[error("encoded payload would be {len} bytes, limit is {limit}")]
    PayloadTooLarge { len: usize, limit: usize },
}

/// Validate arguments against a definition's parameter specs: arity, type,
/// and declared bounds (falling back to the type's intrinsic range, which
/// the Rust value types already guarantee).
pub fn validate_args(
    def: &TelecommandDefinition,
    args: &[ArgValue],
) -> Result<(), EncodeError> {
    if args.len() != def.params.len() {
        return Err(EncodeError::ArityMismatch {
            expected: def.params.len(),
            got: args.len(),
        });
    }

    for (spec, arg) in def.params.iter().zip(args) {
        if arg.param_type() != spec.ty {
            return Err(EncodeError::TypeMismatch {
                param: spec.name.clone(),
                expected: spec.ty,
                got: arg.param_type(),
            });
        }
        if let (Some(bounds), Some(value)) = (spec.bounds, arg.as_integer()) {
            if value < bounds.min || value > bounds.max {
                return Err(EncodeError::OutOfBounds {
                    param: spec.name.clone(),
                    value,
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }
        let var_len = match arg {
            ArgValue::Str(s) => Some(s.len()),
            ArgValue::Bytes(b) => Some(b.len()),
            _ => None,
        };
        if let Some(len) = var_len {
            if len > usize::from(u16::MAX) {
                return Err(EncodeError::VariableTooLong {
                    param: spec.name.clone(),
                    len,
                    limit: usize::from(u16::MAX),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Bounds, ParamSpec, ReadinessLevel};

    fn power_def() -> TelecommandDefinition {
        TelecommandDefinition {
            id: TcmdId(0x10),
            name: "SET_POWER".to_string(),
            params: vec![ParamSpec {
                name: "level".to_string(),
                ty: ParamType::U8,
                bounds: Some(Bounds { min: 0, max: 100 }),
            }],
            doc: String::new(),
            response_hint: None,
            readiness: ReadinessLevel::ForTestingOnly,
        }
    }

    #[test]
    fn test_validate_accepts_in_bounds_value() {
        assert!(validate_args(&power_def(), &[ArgValue::U8(55)]).is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_bounds_value() {
        let err = validate_args(&power_def(), &[ArgValue::U8(101)]).unwrap_err();
        assert!(matches!(err, EncodeError::OutOfBounds { value: 101, .. }));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let err = validate_args(&power_def(), &[ArgValue::U16(5)]).unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_wrong_arity() {
        let err = validate_args(&power_def(), &[]).unwrap_err();
        assert!(matches!(
            err,
            EncodeError::ArityMismatch {
                expected: 1,
                got: 0
            }
        ));
    }
}
