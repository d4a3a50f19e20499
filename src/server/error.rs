use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use thiserror::Error;

use crate::claims::ClaimError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    fn code_and_status(&self) -> (&'static str, StatusCode) {
        match self {
            Self::Claim(claim) => match claim {
                ClaimError::UnknownSession => ("INVALID_SESSION", StatusCode::NOT_FOUND),
                ClaimError::NotClaimable => ("NOT_CLAIMABLE", StatusCode::BAD_REQUEST),
                ClaimError::AmountTooLow => ("AMOUNT_TOO_LOW", StatusCode::BAD_REQUEST),
                ClaimError::AmountTooHigh => ("AMOUNT_TOO_HIGH", StatusCode::BAD_REQUEST),
                ClaimError::InvalidAddress => ("INVALID_ADDRESS", StatusCode::BAD_REQUEST),
                ClaimError::RaceClaiming => ("RACE_CLAIMING", StatusCode::CONFLICT),
                ClaimError::Rejected(_) => ("CLAIM_REJECTED", StatusCode::FORBIDDEN),
                ClaimError::Database(_) | ClaimError::Internal(_) => {
                    ("INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
            Self::Other(_) => ("INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, status) = self.code_and_status();

        // Internal details stay in the logs, not in the response body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(serde_json::json!({ "code": code, "error": message })),
        )
            .into_response()
    }
}
