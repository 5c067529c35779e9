//! Error types for the image server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::fmt;

use crate::types::ErrorResponse;

#[derive(Debug)]
pub enum ImageServerError {
    Config(String),
    Io(Box<std::io::Error>),
    NotFound(String),
    BadRequest(String),
    /// Frame size limits exceeded
    Limit(String),
    Upstream(String),
    Http(Box<reqwest::Error>),
    Image(Box<image::ImageError>),
    Cache(hybrid_cache::CacheError),
}

impl ImageServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ImageServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ImageServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ImageServerError::Limit(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ImageServerError::Upstream(_) | ImageServerError::Http(_) => StatusCode::BAD_GATEWAY,
            ImageServerError::Image(err) => match err.as_ref() {
                image::ImageError::Unsupported(_) | image::ImageError::Decoding(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                image::ImageError::Limits(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ImageServerError::Config(_) | ImageServerError::Io(_) | ImageServerError::Cache(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ImageServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ImageServerError::Io(err) => write!(f, "IO error: {}", err),
            ImageServerError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ImageServerError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ImageServerError::Limit(msg) => write!(f, "Size limit exceeded: {}", msg),
            ImageServerError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            ImageServerError::Http(err) => write!(f, "HTTP error: {}", err),
            ImageServerError::Image(err) => write!(f, "Image error: {}", err),
            ImageServerError::Cache(err) => write!(f, "Cache error: {}", err),
        }
    }
}

impl std::error::Error for ImageServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageServerError::Io(err) => Some(err.as_ref()),
            ImageServerError::Http(err) => Some(err.as_ref()),
            ImageServerError::Image(err) => Some(err.as_ref()),
            ImageServerError::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ImageServerError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ImageServerError::NotFound(err.to_string())
        } else {
            ImageServerError::Io(Box::new(err))
        }
    }
}

impl From<reqwest::Error> for ImageServerError {
    fn from(err: reqwest::Error) -> Self {
        ImageServerError::Http(Box::new(err))
    }
}

impl From<image::ImageError> for ImageServerError {
    fn from(err: image::ImageError) -> Self {
        ImageServerError::Image(Box::new(err))
    }
}

impl From<hybrid_cache::CacheError> for ImageServerError {
    fn from(err: hybrid_cache::CacheError) -> Self {
        ImageServerError::Cache(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for ImageServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ImageServerError::Config(err.to_string())
    }
}

impl IntoResponse for ImageServerError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ImageServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ImageServerError::Config("missing CACHE_DIR".to_string());
        assert_eq!(format!("{}", err), "Configuration error: missing CACHE_DIR");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ImageServerError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ImageServerError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ImageServerError::Limit("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ImageServerError::Upstream("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_missing_file_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = ImageServerError::from(io);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_is_debug() {
        let err = ImageServerError::Upstream("test".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Upstream"));
    }
}
