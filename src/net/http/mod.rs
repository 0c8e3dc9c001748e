pub mod parser;
pub mod server;
pub mod types;

pub use parser::{ChunkedDecoder, RequestParser, ResponseParser};
pub use server::ControlServer;
pub use types::{Headers, HttpRequest, HttpResponse, Method};
