use crate::error::SubmitError;

use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of redirects followed per request.
pub const MAX_REDIRECTS: u32 = 5;

/// A transfer slower than [`LOW_SPEED_LIMIT`] for this long is aborted.
pub const LOW_SPEED_TIME: Duration = Duration::from_secs(60);

/// Bytes per second under which a transfer counts as stalled.
pub const LOW_SPEED_LIMIT: u32 = 30;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// Per-request transfer options forwarded to the transport engine.
///
/// ```rust,ignore
/// let options = RequestOptions::default()
///     .timeout(Duration::from_secs(10))
///     .basic_auth("user", "secret");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub verify_tls: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub proxy: Option<String>,
    pub credentials: Option<(String, String)>,
    pub verbose: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            verify_tls: true,
            client_cert: None,
            client_key: None,
            ca_file: None,
            proxy: None,
            credentials: None,
            verbose: false,
        }
    }
}

impl RequestOptions {
    /// Aborts the whole transfer after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables or disables TLS peer and host verification.
    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Authenticates with a client certificate and its private key.
    pub fn client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    /// Verifies peers against the CA bundle at `path`.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Asks the engine to log the transfer's protocol exchange.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// An HTTP request as handed to the transport engine.
///
/// Header and token pairs are forwarded verbatim, tokens after headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub tokens: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub options: RequestOptions,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Vec::new(),
            tokens: Vec::new(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Method::Post,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn token(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tokens.push((name.into(), value.into()));
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Header lines sent with the request: headers first, then tokens.
    pub fn header_lines(&self) -> impl Iterator<Item = String> + '_ {
        self.headers
            .iter()
            .chain(self.tokens.iter())
            .map(|(name, value)| format!("{name}: {value}"))
    }

    /// Checks the URL before it reaches the engine.
    pub fn validate(&self) -> Result<(), SubmitError> {
        let reason = if self.url.is_empty() {
            "empty url"
        } else if self.url.contains('\0') {
            "url contains a NUL byte"
        } else if self.url.chars().any(char::is_whitespace) {
            "url contains whitespace"
        } else {
            return Ok(());
        };

        Err(SubmitError::InvalidUrl {
            url: self.url.clone(),
            reason,
        })
    }
}
