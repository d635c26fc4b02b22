//! Refresh gateway: exchanges the ambient renewal credential for a new
//! access token.
//!
//! The renewal credential is an HTTP-only cookie set by the server at login.
//! The gateway sends the request through a client whose cookie jar holds it.
//! A process that did not perform the login itself (the CLI) keeps the jar
//! in a cookie file so the credential survives between runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{header, Client, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use super::RefreshError;
use crate::auth::file_store::write_private;

/// HTTP request timeout in seconds.
/// The session manager applies its own, usually tighter, bound on top.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// The one network operation the session manager depends on.
pub trait RefreshGateway: Send + Sync {
    /// Request a fresh access token
    fn refresh(&self) -> BoxFuture<'_, Result<String, RefreshError>>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Cookie jar for the refresh endpoint, optionally mirrored to a file
/// after every response
#[derive(Clone)]
struct Cookies {
    jar: Arc<Jar>,
    path: Option<PathBuf>,
    url: Url,
}

impl Cookies {
    /// Load `path` (`name=value` pairs separated by `;`) into a fresh jar,
    /// then add `seed` on top. The seeded pairs are written back immediately.
    fn open(path: Option<PathBuf>, url: &str, seed: Option<&str>) -> Result<Self, RefreshError> {
        let url = Url::parse(url)
            .map_err(|e| RefreshError::Transport(format!("Invalid refresh URL {}: {}", url, e)))?;
        let jar = Arc::new(Jar::default());

        if let Some(path) = &path {
            match std::fs::read_to_string(path) {
                Ok(saved) => add_pairs(&jar, &saved, &url),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to read cookie file"),
            }
        }

        let cookies = Self { jar, path, url };
        if let Some(seed) = seed {
            add_pairs(&cookies.jar, seed, &cookies.url);
            cookies.save();
        }
        Ok(cookies)
    }

    /// Cookies the jar would send to the refresh endpoint
    fn header(&self) -> Option<String> {
        self.jar
            .cookies(&self.url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let result = match self.header() {
            Some(header) => path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| write_private(path, header.as_bytes())),
            None => forget_cookies(path),
        };
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "Failed to persist refresh cookies");
        }
    }
}

fn add_pairs(jar: &Jar, pairs: &str, url: &Url) {
    for pair in pairs.split(';').map(str::trim).filter(|p| p.contains('=')) {
        jar.add_cookie_str(pair, url);
    }
}

/// Delete a cookie file written by `HttpRefreshGateway::with_cookies`.
/// Missing is fine.
pub fn forget_cookies(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Gateway that POSTs to the server's refresh endpoint.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRefreshGateway {
    client: Client,
    url: String,
    cookies: Option<Cookies>,
}

impl HttpRefreshGateway {
    /// Create a gateway with its own cookie jar
    pub fn new(base_url: &str, refresh_path: &str) -> Result<Self, RefreshError> {
        Self::with_cookie_jar(base_url, refresh_path, Arc::new(Jar::default()))
    }

    /// Create a gateway sharing `jar` with the client that performed login,
    /// so the renewal cookie set at login is sent on refresh.
    pub fn with_cookie_jar(
        base_url: &str,
        refresh_path: &str,
        jar: Arc<Jar>,
    ) -> Result<Self, RefreshError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .cookie_provider(jar)
            .build()?;
        Ok(Self::with_client(client, base_url, refresh_path))
    }

    /// Create a gateway whose cookie jar is loaded from and saved to `file`,
    /// when given.
    ///
    /// `seed` is a `name=value; name2=value2` cookie string (as copied from a
    /// browser session) added to the jar and persisted for later runs.
    pub fn with_cookies(
        base_url: &str,
        refresh_path: &str,
        file: Option<PathBuf>,
        seed: Option<&str>,
    ) -> Result<Self, RefreshError> {
        let url = join_url(base_url, refresh_path);
        let cookies = Cookies::open(file, &url, seed)?;
        let mut gateway = Self::with_cookie_jar(base_url, refresh_path, Arc::clone(&cookies.jar))?;
        gateway.cookies = Some(cookies);
        Ok(gateway)
    }

    /// Cookie header the next refresh will carry, if the jar is tracked
    pub fn cookie_header(&self) -> Option<String> {
        self.cookies.as_ref().and_then(Cookies::header)
    }

    /// Use an existing client, sharing its connection pool and cookies
    pub fn with_client(client: Client, base_url: &str, refresh_path: &str) -> Self {
        Self {
            client,
            url: join_url(base_url, refresh_path),
            cookies: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self) -> Result<String, RefreshError> {
        debug!(url = %self.url, "Requesting token refresh");

        let response = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        // Set-Cookie headers are already applied to the jar at this point
        if let Some(cookies) = &self.cookies {
            cookies.save();
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::from_status(status, &body));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        if body.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse("empty accessToken".to_string()));
        }
        Ok(body.access_token)
    }
}

impl RefreshGateway for HttpRefreshGateway {
    fn refresh(&self) -> BoxFuture<'_, Result<String, RefreshError>> {
        Box::pin(self.send())
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
