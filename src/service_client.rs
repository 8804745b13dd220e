//! Authenticated HTTP client for downstream services.
//!
//! A single shared `reqwest` client with a finite timeout so the fallback
//! sweeper can never stall on a dead peer. The bearer token is opaque: the
//! broker's own token by default, or a client's pass-through token when the
//! message originated from a socket.

use std::time::Duration;

use tracing::debug;

use crate::domain_types::AuthToken;
use crate::error::HttpDeliveryError;
use crate::message::Message;

/// Shared downstream HTTP client.
#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    default_token: Option<AuthToken>,
}

impl ServiceClient {
    /// Builds the client with the given request timeout.
    pub fn new(
        timeout: Duration,
        default_token: Option<AuthToken>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            default_token,
        })
    }

    /// POSTs a message to `<base_url>/message`. Returns the raw response so
    /// callers can propagate downstream statuses verbatim.
    pub async fn post_message(
        &self,
        base_url: &str,
        message: &Message,
        token: Option<&AuthToken>,
    ) -> Result<reqwest::Response, HttpDeliveryError> {
        let url = format!("{}/message", base_url.trim_end_matches('/'));
        let mut request = self.http.post(&url).json(message);
        if let Some(token) = token.or(self.default_token.as_ref()) {
            request = request.bearer_auth(token.as_str());
        }
        debug!(%url, kind = %message.kind, "posting message downstream");
        request
            .send()
            .await
            .map_err(|source| HttpDeliveryError::Transport {
                url: url.clone(),
                source,
            })
    }

    /// Like [`Self::post_message`] but collapses non-2xx statuses into an
    /// error, for callers that only need success/failure.
    pub async fn post_message_checked(
        &self,
        base_url: &str,
        message: &Message,
        token: Option<&AuthToken>,
    ) -> Result<(), HttpDeliveryError> {
        let response = self.post_message(base_url, message, token).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HttpDeliveryError::Status {
                url: format!("{}/message", base_url.trim_end_matches('/')),
                status: status.as_u16(),
            })
        }
    }

    /// The underlying reqwest client, for collaborators that issue their own
    /// requests (discovery).
    #[must_use]
    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }
}
