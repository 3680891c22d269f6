//! Default HTTP(S) transport on top of a blocking reqwest client.

use std::io::{self, Read};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::redirect::Policy;

use crate::connection::{Connected, Connection, ConnectionFactory};
use crate::error::DownloadError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ConnectionFactory`] backed by one shared blocking client.
///
/// Redirect following is disabled on the client: the engine's redirect
/// stage performs (and bounds) the hops so that the final effective URL
/// is observable and range semantics survive each hop.
pub struct HttpConnectionFactory {
    client: Client,
}

impl HttpConnectionFactory {
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_READ_TIMEOUT)
            .build()
            .map_err(request_error)?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn create(&self, url: &str) -> Result<Box<dyn Connection>, DownloadError> {
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            url: url.to_string(),
            headers: Vec::new(),
        }))
    }
}

struct HttpConnection {
    client: Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl Connection for HttpConnection {
    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn execute(&mut self) -> Result<Box<dyn Connected>, DownloadError> {
        let mut request = self.client.get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request.send().map_err(request_error)?;
        Ok(Box::new(HttpConnected { response }))
    }
}

struct HttpConnected {
    response: Response,
}

impl Connected for HttpConnected {
    fn response_code(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.response
    }
}

fn request_error(err: reqwest::Error) -> DownloadError {
    DownloadError::Io(io::Error::new(io::ErrorKind::Other, err))
}
