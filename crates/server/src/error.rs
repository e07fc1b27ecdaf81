use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ephemera_core::EngineError;

use crate::Msg;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => engine_status(e),
        }
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Render(_) | EngineError::Decode { .. } | EngineError::Resolution { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::TemplateFetch { .. } | EngineError::Discovery(_) => StatusCode::BAD_GATEWAY,
        EngineError::Apply { .. } | EngineError::Delete { .. } | EngineError::Query { .. } => e
            .cluster_code()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .filter(StatusCode::is_client_error)
            .unwrap_or(StatusCode::BAD_GATEWAY),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(Msg::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(code: Option<u16>) -> ApiError {
        ApiError::Engine(EngineError::Apply { document: 0, target: "v1/Pod ctf/p".into(), code, message: "x".into() })
    }

    #[test]
    fn cluster_client_errors_pass_through() {
        assert_eq!(apply(Some(409)).status(), StatusCode::CONFLICT);
        assert_eq!(apply(Some(403)).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn cluster_server_errors_and_transport_failures_are_bad_gateway() {
        assert_eq!(apply(Some(500)).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(apply(None).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::Engine(EngineError::Discovery("timeout".into())).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn template_problems_map_to_client_statuses() {
        assert_eq!(ApiError::Engine(EngineError::TemplateNotFound("scan".into())).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Engine(EngineError::Render("x".into())).status(), StatusCode::UNPROCESSABLE_ENTITY);
        let unresolved = EngineError::Resolution { document: 2, gvk: "example.com/v1/Widget".into() };
        assert_eq!(ApiError::Engine(unresolved).status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::InvalidRequest("no task".into()).status(), StatusCode::BAD_REQUEST);
    }
}
