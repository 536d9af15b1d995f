use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use url::Url;

use crate::error::{OnboardError, Result, ValidationError};
use crate::types::ValidatorConfig;

/// The parts of an HTTP response validation looks at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Raw `Location` header, if any.
    pub location: Option<String>,
    /// Body decoded with the response charset. Only read for 200 responses.
    pub body: String,
}

/// Transport-level failure: DNS, connect, TLS or timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError(pub String);

/// Issues a single GET without following redirects.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url) -> std::result::Result<HttpResponse, TransportError>;
}

/// [`HttpTransport`] backed by `reqwest`.
///
/// Redirects are disabled on the client, [`ConnectionValidator`] follows
/// them itself.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ValidatorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| OnboardError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> std::result::Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        // `text()` decodes with the Content-Type charset, falling back to UTF-8.
        let body = if status == 200 {
            response
                .text()
                .await
                .map_err(|e| TransportError(e.to_string()))?
        } else {
            String::new()
        };

        Ok(HttpResponse {
            status,
            location,
            body,
        })
    }
}

/// A server address that answered as a Jellyfin server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedServer {
    /// Address after following every redirect. This is the address to save.
    pub address: Url,
    /// Number of redirect hops followed.
    pub redirects: u32,
}

/// Checks that an address points at a reachable Jellyfin server.
pub struct ConnectionValidator<T: HttpTransport = ReqwestTransport> {
    transport: T,
    config: ValidatorConfig,
}

impl ConnectionValidator<ReqwestTransport> {
    /// Creates a validator that talks HTTP through `reqwest`.
    pub fn with_config(config: ValidatorConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Self::new(transport, config)
    }
}

impl<T: HttpTransport> ConnectionValidator<T> {
    /// # Errors
    /// Returns `OnboardError::ConfigError` for an empty marker or a zero
    /// request timeout.
    pub fn new(transport: T, config: ValidatorConfig) -> Result<Self> {
        if config.marker.is_empty() {
            return Err(OnboardError::ConfigError(
                "Server marker cannot be empty".into(),
            ));
        }

        if config.request_timeout.is_zero() {
            return Err(OnboardError::ConfigError(
                "Request timeout cannot be zero".into(),
            ));
        }

        Ok(ConnectionValidator { transport, config })
    }

    /// Validates `input` and returns the final, redirect-resolved address.
    ///
    /// Malformed input fails before any request is made. Redirects
    /// (300..=308) are followed up to `max_redirects` hops.
    pub async fn validate(
        &self,
        input: &str,
    ) -> std::result::Result<ValidatedServer, ValidationError> {
        let mut current = normalize(input)?;
        let mut redirects = 0;

        loop {
            debug!("Checking server address {}", current);

            let response = self.transport.get(&current).await.map_err(|e| {
                warn!("Server address {} unreachable: {}", current, e.0);
                ValidationError::Unreachable(e.0)
            })?;

            match response.status {
                300..=308 => {
                    let next = redirect_target(&current, response.location.as_deref())?;
                    if redirects >= self.config.max_redirects {
                        warn!(
                            "Giving up on {} after {} redirects",
                            input, self.config.max_redirects
                        );
                        return Err(ValidationError::TooManyRedirects(self.config.max_redirects));
                    }
                    redirects += 1;
                    debug!("{} redirected ({}) to {}", current, response.status, next);
                    current = next;
                }
                200 => {
                    if !response.body.contains(&self.config.marker) {
                        warn!("{} does not identify as a Jellyfin server", current);
                        return Err(ValidationError::NotAServer);
                    }
                    info!("Validated server address {}", current);
                    return Ok(ValidatedServer {
                        address: current,
                        redirects,
                    });
                }
                status => {
                    warn!("{} answered with HTTP {}", current, status);
                    return Err(ValidationError::HttpStatus(status));
                }
            }
        }
    }
}

/// Turns user input into an absolute http(s) URL.
///
/// Input that does not start with a scheme gets `http://`, so
/// `myserver:8096` means host `myserver` on port 8096 rather than scheme
/// `myserver`, and a `://` inside the path or query is not taken as one.
pub fn normalize(input: &str) -> std::result::Result<Url, ValidationError> {
    let trimmed = input.trim();
    let malformed = || ValidationError::MalformedUri(input.to_string());

    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(malformed());
    }

    let candidate = if has_scheme(trimmed) {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let url = Url::parse(&candidate).map_err(|_| malformed())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none_or(str::is_empty) {
        return Err(malformed());
    }

    Ok(url)
}

/// Whether `input` opens with `scheme://` (RFC 3986 scheme characters).
fn has_scheme(input: &str) -> bool {
    let Some((scheme, _)) = input.split_once("://") else {
        return false;
    };

    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Resolves a `Location` header against the URL that returned it.
fn redirect_target(
    current: &Url,
    location: Option<&str>,
) -> std::result::Result<Url, ValidationError> {
    let location = location
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or(ValidationError::InvalidRedirect)?;

    let next = current
        .join(location)
        .map_err(|_| ValidationError::InvalidRedirect)?;

    if !matches!(next.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidRedirect);
    }

    Ok(next)
}
