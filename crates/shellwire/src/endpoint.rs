//! Socket endpoint derivation.

use url::Url;

use crate::error::{SchedulerError, SchedulerResult};

/// Path of the backend's protocol endpoint.
pub const ENDPOINT_PATH: &str = "/ws1.ws";

/// Port used by the backend when it runs from a development checkout.
pub const DEVELOPMENT_PORT: u16 = 8000;

/// Derives the WebSocket URL from the backend's HTTP(S) base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`. The path is replaced by the
/// protocol endpoint. Query and fragment are dropped.
pub fn socket_url(base: &Url, development_mode: bool, development_port: u16) -> SchedulerResult<Url> {
    let invalid = |message: &str| SchedulerError::InvalidEndpoint {
        url: base.to_string(),
        message: message.to_string(),
    };

    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(&format!("unsupported scheme {other}"))),
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a socket scheme"))?;
    url.set_path(ENDPOINT_PATH);
    url.set_query(None);
    url.set_fragment(None);

    if development_mode {
        url.set_port(Some(development_port))
            .map_err(|_| invalid("cannot set development port"))?;
    }

    Ok(url)
}
