// src/error.rs - Error taxonomy and response codes
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// Main gateway error type.
///
/// Every business-level failure is rendered as HTTP 200 with an embedded
/// negative `code` and a `msg`; HTTP status codes are reserved for
/// transport-level concerns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    // Runtime per-branch errors
    #[error("no backend available")]
    NoBackendAvailable,

    #[error("backend service unavailable")]
    BackendServiceError,

    #[error("param {0} is required")]
    ParamRequired(String),

    #[error("param {0} failed validation")]
    ParamInvalid(String),

    #[error("cluster not found")]
    ClusterNotFound,

    // Dispatch-level errors
    #[error("api not found")]
    ApiNotFound,

    // Registration errors
    #[error("backend already exists")]
    BackendAlreadyExists,

    #[error("backend not found")]
    BackendNotFound,

    #[error("cluster already exists")]
    ClusterAlreadyExists,

    #[error("api already exists")]
    RouteAlreadyExists,

    #[error("plugin already exists")]
    PluginAlreadyExists,

    #[error("param parse failed")]
    ParamParseFailed,

    #[error("cluster name must not be empty")]
    ClusterNameEmpty,

    #[error("unknown schema {0}")]
    UnknownSchema(String),

    #[error("backend addr must not be empty")]
    EmptyAddr,

    #[error("heartbeat path must not be empty")]
    HeartPathEmpty,

    #[error("maxQPS must be at least 1")]
    MaxQpsZero,

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("method and url must not be empty")]
    UrlNotValid,

    #[error("a route holds at most 5 nodes")]
    TooManyNodes,

    #[error("invalid validation pattern: {0}")]
    InvalidValidation(String),

    // Generic/unknown errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Stable negative response code carried in the reply envelope.
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::NoBackendAvailable => -9001,
            GatewayError::BackendAlreadyExists => -9002,
            GatewayError::BackendServiceError => -9003,
            GatewayError::ParamRequired(_) | GatewayError::ParamInvalid(_) => -9004,
            GatewayError::ApiNotFound => -9005,
            GatewayError::ClusterAlreadyExists => -9006,
            GatewayError::ClusterNotFound => -9007,
            GatewayError::RouteAlreadyExists => -9008,
            GatewayError::BackendNotFound => -9009,
            GatewayError::PluginAlreadyExists => -9010,
            GatewayError::ParamParseFailed => -9011,
            GatewayError::ClusterNameEmpty => -9012,
            GatewayError::UnknownSchema(_) => -9013,
            GatewayError::EmptyAddr => -9014,
            GatewayError::HeartPathEmpty => -9015,
            GatewayError::MaxQpsZero => -9016,
            GatewayError::UnknownMethod(_) => -9017,
            GatewayError::UrlNotValid => -9018,
            GatewayError::TooManyNodes => -9019,
            GatewayError::InvalidValidation(_) => -9027,
            GatewayError::Internal(_) => -9099,
        }
    }
}

// Errors serialize directly into the `{code, msg}` envelope object so a
// tagged branch result or a top-level failure renders without conversion.
impl Serialize for GatewayError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut envelope = serializer.serialize_struct("GatewayError", 2)?;
        envelope.serialize_field("code", &self.code())?;
        envelope.serialize_field("msg", &self.to_string())?;
        envelope.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::NoBackendAvailable.code(), -9001);
        assert_eq!(GatewayError::ApiNotFound.code(), -9005);
        assert_eq!(GatewayError::ParamRequired("token".into()).code(), -9004);
        assert_eq!(GatewayError::ParamInvalid("token".into()).code(), -9004);
        assert_eq!(GatewayError::UnknownMethod("BREW".into()).code(), -9017);
    }

    #[test]
    fn serializes_to_envelope_object() {
        let value = serde_json::to_value(GatewayError::ClusterNotFound).unwrap();
        assert_eq!(value["code"], -9007);
        assert_eq!(value["msg"], "cluster not found");
    }
}
