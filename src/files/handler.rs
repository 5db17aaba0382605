use crate::files::resolver::{DocumentRoot, ResolveError, resolve};
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};

const CACHE_CONTROL: &str = "max-age=3600";

/// Builds the response for a parsed request: the file on success, an HTML
/// error page otherwise.
///
/// Connection-level headers (`Server`, `Connection`, `Keep-Alive`) are added
/// later by the connection.
pub async fn serve(request: &Request, root: &DocumentRoot) -> Response {
    match resolve(&request.path, root).await {
        Ok(file) => {
            tracing::debug!(
                method = ?request.method,
                path = %request.path,
                file = %file.path.display(),
                content_type = file.content_type,
                len = file.len,
                "Serving static file"
            );

            ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", file.content_type)
                .header("Cache-Control", CACHE_CONTROL)
                .file(file.file, file.len)
                .build()
        }

        Err(ResolveError::NotFound) => {
            tracing::debug!(path = %request.path, "File not found");
            Response::not_found()
        }

        Err(ResolveError::Forbidden) => {
            tracing::warn!(path = %request.path, "Forbidden path requested");
            Response::error_page(
                StatusCode::Forbidden,
                "Access to the requested path is not allowed.",
            )
        }

        Err(ResolveError::Unreadable) => Response::internal_error(),
    }
}
