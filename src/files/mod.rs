//! Static file serving.
//!
//! - **`resolver`**: maps a request target to a file below the document root
//! - **`handler`**: turns a resolution result into a response

pub mod handler;
pub mod resolver;

pub use handler::serve;
pub use resolver::{DocumentRoot, ResolveError, StaticFile, resolve};
