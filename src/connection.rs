use reqwest::cookie::{CookieStore as _, Jar};
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Method, Response, StatusCode, Url};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Where the device redirects to when the session is not (or no longer) logged in.
pub const LOGIN_PATH: &str = "SYSWWW/LOGIN.XML";

pub type Form = Vec<(String, String)>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{1}` is not a usable device address")]
    Address(#[source] url::ParseError, String),
    #[error("`{1}` is not a valid path on the device")]
    Path(#[source] url::ParseError, String),
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("device rejected the login (status {0})")]
    LoginRejected(StatusCode),
    #[error("device still redirects `{0}` to the login page after logging in")]
    LoginRetryExhausted(String),
    #[error("device denied access to `{1}` (status {0})")]
    AccessDenied(StatusCode, String),
    #[error("request for `{1}` timed out")]
    Timeout(#[source] reqwest::Error, String),
    #[error("could not communicate with the device while requesting `{1}`")]
    Transport(#[source] reqwest::Error, String),
    #[error("device responded to `{1}` with status {0}")]
    Status(StatusCode, String),
    #[error("something unexpected happened while requesting `{1}`")]
    Unexpected(#[source] reqwest::Error, String),
}

/// The broad category of an [`Error`].
///
/// Authentication failures need the user to fix credentials, communication failures are
/// expected to go away on their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorClass {
    Authentication,
    Communication,
    General,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::LoginRejected(_) | Error::LoginRetryExhausted(_) | Error::AccessDenied(..) => {
                ErrorClass::Authentication
            }
            Error::Timeout(..) | Error::Transport(..) | Error::Status(..) => {
                ErrorClass::Communication
            }
            Error::Address(..)
            | Error::Path(..)
            | Error::CreateReqwest(_)
            | Error::Unexpected(..) => ErrorClass::General,
        }
    }

    fn from_reqwest(error: reqwest::Error, path: &str) -> Self {
        if error.is_timeout() {
            Error::Timeout(error, path.to_string())
        } else if error.is_connect() || error.is_request() || error.is_body() || error.is_decode() {
            Error::Transport(error, path.to_string())
        } else {
            Error::Unexpected(error, path.to_string())
        }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// The IPv4 address of the heat pump's web interface, optionally with a port.
    #[arg(long, short = 'a', env = "ACOND_ADDRESS")]
    address: String,

    /// The user to log in as.
    #[arg(long, short = 'u', env = "ACOND_USERNAME")]
    username: String,

    #[arg(long, short = 'p', env = "ACOND_PASSWORD", hide_env_values = true)]
    password: String,

    /// Consider a request to the device failed if it does not complete in this amount of time.
    #[arg(long, default_value = "10s")]
    timeout: humantime::Duration,
}

impl Args {
    pub fn to_session(&self) -> Result<Session, Error> {
        let base = Url::parse(&format!("http://{}/", self.address))
            .map_err(|e| Error::Address(e, self.address.clone()))?;
        let credentials = Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        };
        Session::new(base, credentials, *self.timeout)
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A cookie-bearing session with the device's web server.
///
/// Requests are never redirected automatically: the device signals an expired session by
/// redirecting to [`LOGIN_PATH`], which [`Session::fetch`] needs to observe.
pub struct Session {
    base: Url,
    login_url: Url,
    credentials: Credentials,
    /// Only ever written to by [`Session::login`].
    cookies: Jar,
    http: reqwest::Client,
}

impl Session {
    pub fn new(base: Url, credentials: Credentials, timeout: Duration) -> Result<Self, Error> {
        let login_url = base.join(LOGIN_PATH).map_err(|e| Error::Path(e, LOGIN_PATH.into()))?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .timeout(timeout)
            .build()
            .map_err(Error::CreateReqwest)?;
        Ok(Self {
            base,
            login_url,
            credentials,
            cookies: Jar::default(),
            http,
        })
    }

    /// Log in, storing the session cookies handed out by the device.
    ///
    /// The device answers a successful login with a redirect; anything else means the
    /// credentials were not accepted.
    pub async fn login(&self) -> Result<(), Error> {
        info!(message = "logging in", base = %self.base, username = %self.credentials.username);
        let form = vec![
            ("USER".to_string(), self.credentials.username.clone()),
            ("PASS".to_string(), self.credentials.password.clone()),
        ];
        let response = self.send(Method::POST, LOGIN_PATH, Some(&form)).await?;
        let status = response.status();
        if status != StatusCode::FOUND {
            warn!(message = "login rejected", %status);
            return Err(Error::LoginRejected(status));
        }
        let set_cookies = response.headers().get_all(SET_COOKIE);
        self.cookies.set_cookies(&mut set_cookies.iter(), &self.login_url);
        debug!(message = "logged in", cookies = set_cookies.iter().count());
        Ok(())
    }

    /// Issue a request for `path`, logging in and retrying once if the device redirects to the
    /// login page.
    ///
    /// The final response is verified: `401` and `403` are authentication failures, other
    /// client and server error statuses are communication failures.
    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        form: Option<&Form>,
    ) -> Result<Response, Error> {
        let mut logged_in = false;
        loop {
            let response = self.send(method.clone(), path, form).await?;
            if !self.redirects_to_login(&response) {
                return verify_response(response, path);
            }
            if logged_in {
                warn!(message = "still redirected to login after logging in", path);
                return Err(Error::LoginRetryExhausted(path.to_string()));
            }
            debug!(message = "session expired, logging in again", path);
            self.login().await?;
            logged_in = true;
        }
    }

    /// Issue exactly one request for `path` without any of the session handling.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        form: Option<&Form>,
    ) -> Result<Response, Error> {
        let url = self.base.join(path).map_err(|e| Error::Path(e, path.to_string()))?;
        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(cookie) = self.cookies.cookies(&url) {
            request = request.header(COOKIE, cookie);
        }
        if let Some(form) = form {
            request = request.form(form);
        }
        trace!(message = "sending request", %method, %url);
        let response = request.send().await.map_err(|e| Error::from_reqwest(e, path))?;
        debug!(message = "received response", %method, path, status = %response.status());
        Ok(response)
    }

    fn redirects_to_login(&self, response: &Response) -> bool {
        if response.status() != StatusCode::FOUND {
            return false;
        }
        let Some(location) = response.headers().get(LOCATION) else {
            return false;
        };
        let Ok(location) = location.to_str() else {
            return false;
        };
        response
            .url()
            .join(location)
            .is_ok_and(|target| target.path() == self.login_url.path())
    }
}

fn verify_response(response: Response, path: &str) -> Result<Response, Error> {
    let status = response.status();
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(Error::AccessDenied(status, path.to_string()));
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(Error::Status(status, path.to_string()));
    }
    Ok(response)
}

/// Read the body of a response as text, decoding it according to its declared charset.
pub async fn read_text(response: Response) -> Result<String, Error> {
    let path = response.url().path().trim_start_matches('/').to_string();
    response.text().await.map_err(|e| Error::from_reqwest(e, &path))
}
