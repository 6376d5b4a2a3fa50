use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

/// Failures visible to metadata clients.
///
/// Bodies are short fixed strings; details are only logged.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Node not found")]
    NodeNotFound,
    #[error("User data not found")]
    UserDataNotFound,
    #[error("Internal Server Error")]
    Internal,
}

impl ResponseError for HandlerError {
    fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::NodeNotFound | HandlerError::UserDataNotFound => StatusCode::NOT_FOUND,
            HandlerError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("text/plain")
            .body(self.to_string())
    }
}
