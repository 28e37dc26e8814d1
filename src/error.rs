use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Domain failures raised by the billing and connect services.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    StateConflict(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("gateway error: {0}")]
    Gateway(#[from] reqwest::Error),
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        BillingError::NotFound(entity.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        BillingError::StateConflict(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        BillingError::Upstream(message.into())
    }

    /// Short machine-readable kind used in logs and stored event errors.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation",
            BillingError::NotFound(_) => "not_found",
            BillingError::StateConflict(_) => "state_conflict",
            BillingError::Upstream(_) => "upstream",
            BillingError::Database(_) => "database",
            BillingError::Gateway(_) => "gateway",
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("gateway error: {0}")]
    Gateway(#[from] reqwest::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("{0}")]
    Message(String),
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(message) => AppError::BadRequest(message),
            BillingError::NotFound(entity) => AppError::NotFound(entity),
            BillingError::StateConflict(message) => AppError::Conflict(message),
            BillingError::Upstream(message) => AppError::BadGateway(message),
            BillingError::Database(err) => AppError::Db(err),
            BillingError::Gateway(err) => AppError::Gateway(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Db(_) | AppError::Gateway(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_http_taxonomy() {
        let cases = [
            (BillingError::validation("quantity"), StatusCode::BAD_REQUEST),
            (BillingError::not_found("subscription"), StatusCode::NOT_FOUND),
            (
                BillingError::conflict("account cannot accept payments"),
                StatusCode::CONFLICT,
            ),
            (BillingError::upstream("processor"), StatusCode::BAD_GATEWAY),
        ];
        for (err, expected) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn not_found_message_names_entity() {
        assert_eq!(
            BillingError::not_found("subscription").to_string(),
            "subscription not found"
        );
    }
}
