use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error("File must be an image")]
    NotAnImage,
    #[error("Field required: file")]
    MissingFile,
    /// The multipart body could not be parsed before the upload was found.
    #[error("{0}")]
    Multipart(MultipartError),
    #[error("{0}")]
    Upload(MultipartError),
    #[error("{0}")]
    Decode(#[from] image::ImageError),
    #[error("{0}")]
    Inference(anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl CaptionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotAnImage => StatusCode::BAD_REQUEST,
            Self::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Multipart(err) => err.status(),
            Self::Upload(_) | Self::Decode(_) | Self::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for CaptionError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Error processing request: {self}");
        } else {
            tracing::warn!("Rejected request: {self}");
        }
        let body = Json(ErrorBody {
            detail: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(CaptionError::NotAnImage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            CaptionError::MissingFile.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            CaptionError::Inference(anyhow::anyhow!("out of memory")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_detail_is_error_text() {
        assert_eq!(CaptionError::NotAnImage.to_string(), "File must be an image");
        let err = CaptionError::Inference(anyhow::anyhow!("device lost"));
        assert_eq!(err.to_string(), "device lost");
    }
}
