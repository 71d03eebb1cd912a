mod transport;

pub use reqwest::{Method, StatusCode};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
