//! HTTP engine: request parsing, path resolution, response building.

pub mod parser;
pub mod path;
pub mod response;

pub use parser::{Header, ParseError, Request, MAX_HEADERS};
pub use path::{resolve, ResolveError};
pub use response::{HttpState, Response, ResponseFile, ResponseKind};
