use std::borrow::Cow;

use thiserror::Error;

/// Modeled IPC error codes surfaced to components as
/// `application-error` frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IpcErrorCode {
    ServiceError,
    ResourceNotFound,
    InvalidArguments,
    ComponentNotFound,
    Unauthorized,
    Conflict,
    FailedUpdateConditionCheck,
    InvalidToken,
    InvalidRecipeDirectoryPath,
    InvalidArtifactsDirectoryPath,
}

impl IpcErrorCode {
    /// The `_errorCode` string in the error payload.
    pub const fn error_code(self) -> &'static str {
        match self {
            Self::ServiceError => "ServiceError",
            Self::ResourceNotFound => "ResourceNotFoundError",
            Self::InvalidArguments => "InvalidArgumentsError",
            Self::ComponentNotFound => "ComponentNotFoundError",
            Self::Unauthorized => "UnauthorizedError",
            Self::Conflict => "ConflictError",
            Self::FailedUpdateConditionCheck => "FailedUpdateConditionCheckError",
            Self::InvalidToken => "InvalidTokenError",
            Self::InvalidRecipeDirectoryPath => "InvalidRecipeDirectoryPathError",
            Self::InvalidArtifactsDirectoryPath => "InvalidArtifactsDirectoryPathError",
        }
    }

    /// The `service-model-type` header on the error frame.
    pub const fn service_model_type(self) -> &'static str {
        match self {
            Self::ServiceError => "aws.greengrass#ServiceError",
            Self::ResourceNotFound => "aws.greengrass#ResourceNotFoundError",
            Self::InvalidArguments => "aws.greengrass#InvalidArgumentsError",
            Self::ComponentNotFound => "aws.greengrass#ComponentNotFoundError",
            Self::Unauthorized => "aws.greengrass#UnauthorizedError",
            Self::Conflict => "aws.greengrass#ConflictError",
            Self::FailedUpdateConditionCheck => "aws.greengrass#FailedUpdateConditionCheckError",
            Self::InvalidToken => "aws.greengrass#InvalidTokenError",
            Self::InvalidRecipeDirectoryPath => "aws.greengrass#InvalidRecipeDirectoryPathError",
            Self::InvalidArtifactsDirectoryPath => {
                "aws.greengrass#InvalidArtifactsDirectoryPathError"
            }
        }
    }
}

/// A modeled operation failure: code plus human-readable message,
/// rendered as a terminating `application-error` frame on the
/// originating stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {message}", code.error_code())]
pub struct IpcError {
    pub code: IpcErrorCode,
    pub message: Cow<'static, str>,
}

impl IpcError {
    pub fn new(code: IpcErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn service(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(IpcErrorCode::ServiceError, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(IpcErrorCode::Unauthorized, "IPC Operation not authorized.")
    }

    pub fn invalid_params() -> Self {
        Self::service("Received invalid parameters.")
    }
}

impl Default for IpcError {
    fn default() -> Self {
        Self::service("")
    }
}
