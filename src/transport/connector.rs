//! WebSocket connector: the dialing side of the multiplexer.

// ============================================================================
// Imports
// ============================================================================

use tokio_tungstenite::connect_async;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::mux::Connection;

// ============================================================================
// Connector
// ============================================================================

/// Dials a WebSocket URL and wraps the result in a [`Connection`].
///
/// [`connect`](Self::connect) is a race between exactly two outcomes with
/// no default timeout: it resolves when the transport signals open, or
/// fails with the transport's error, whichever occurs first.
///
/// # Example
///
/// ```ignore
/// let connector = Connector::new("ws://127.0.0.1:9000")?;
/// let conn = connector.connect().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Connector {
    url: Url,
}

impl Connector {
    /// Creates a connector for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the URL does not parse or its
    /// scheme is not `ws` / `wss`.
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())
            .map_err(|e| Error::connection(format!("invalid URL: {e}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(Error::connection(format!(
                "unsupported URL scheme: {other}"
            ))),
        }
    }

    /// Returns the target URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Dials the target and resolves once the transport is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if connecting or upgrading fails.
    pub async fn connect(&self) -> Result<Connection> {
        let (ws_stream, response) = connect_async(self.url.as_str()).await?;
        debug!(url = %self.url, status = %response.status(), "Transport open");
        Ok(Connection::new(ws_stream))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ws_url() {
        let connector = Connector::new("ws://127.0.0.1:9000").expect("valid");
        assert_eq!(connector.url(), "ws://127.0.0.1:9000/");
    }

    #[test]
    fn test_valid_wss_url() {
        assert!(Connector::new("wss://example.com/mux").is_ok());
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let err = Connector::new("http://example.com").expect_err("scheme");
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_garbage_url_rejected() {
        assert!(Connector::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is essentially never listening.
        let connector = Connector::new("ws://127.0.0.1:1").expect("valid");
        let err = connector.connect().await.expect_err("refused");
        assert!(err.is_connection_error());
    }
}
