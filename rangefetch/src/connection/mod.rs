//! Transport abstraction.
//!
//! The engine never talks to the network directly; it builds requests
//! through [`Connection`] handles minted by a [`ConnectionFactory`].
//! Tests substitute scripted transports, and embedders can route through
//! their own HTTP stack. The engine handles redirects itself, so
//! implementations must not follow them.

pub mod http;

use std::io::Read;

use crate::error::DownloadError;

/// One request under construction.
pub trait Connection: Send {
    /// Adds a request header; repeated names accumulate.
    fn add_header(&mut self, name: &str, value: &str);

    /// Performs the request and returns the response. Blocking.
    fn execute(&mut self) -> Result<Box<dyn Connected>, DownloadError>;
}

/// A received response: status line, headers, and the body stream.
pub trait Connected: Send {
    fn response_code(&self) -> u16;

    /// First value of the named response header, case-insensitive.
    fn header(&self, name: &str) -> Option<String>;

    /// Body byte stream; reads return 0 at end of stream.
    fn body(&mut self) -> &mut dyn Read;
}

/// Mints [`Connection`] handles, one per request. Implementations must
/// not follow redirects; the redirect stage owns hop accounting.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Box<dyn Connection>, DownloadError>;
}

pub use http::HttpConnectionFactory;
