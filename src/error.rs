use std::fmt;

use thiserror::Error;
use tonic::Status;

use crate::native::NativeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Session,
    File,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Session => write!(f, "client"),
            HandleKind::File => write!(f, "filehandle"),
        }
    }
}

/// Uniform error type for every registry and dispatcher operation. The RPC
/// boundary decides which variants become a status fault and which are folded
/// into a sentinel reply value.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to find {kind} reference {id}")]
    NotFound { kind: HandleKind, id: i64 },

    #[error("{op}: {detail}, return code={code}")]
    Native {
        op: &'static str,
        detail: String,
        code: i32,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no active client session")]
    NoSession,
}

impl GatewayError {
    pub fn native(op: &'static str, detail: String, err: NativeError) -> Self {
        GatewayError::Native {
            op,
            detail,
            code: err.code,
        }
    }

    /// The embedded native status code, for operations that report failure
    /// through a negative handle id instead of a fault.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            GatewayError::Native { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        match &err {
            GatewayError::NotFound { .. } => Status::not_found(err.to_string()),
            GatewayError::Native { .. } => Status::internal(err.to_string()),
            GatewayError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            GatewayError::NoSession => Status::failed_precondition(err.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
