//! HTTP executor: runs `request` envelopes against the Atlas Command HTTP
//! API (§4.7, out-of-scope "HTTP client" collaborator per §1 — the gateway
//! binary still owns this thin integration layer). Grounded on
//! `summit-ctl`'s `reqwest` usage, the pack's one concrete example of a
//! sibling-service HTTP client.

use atlas_common::envelope::Envelope;
use reqwest::Client;

pub struct HttpExecutor {
    client: Client,
    base_url: String,
    /// Read from `ATLAS_API_TOKEN` by the embedding CLI, never by this
    /// crate itself (§6 Environment).
    api_token: Option<String>,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        HttpExecutor {
            client: Client::new(),
            base_url: base_url.into(),
            api_token,
        }
    }

    /// Execute one `request` envelope, producing the `response` or `error`
    /// envelope to route back to the sender.
    pub async fn execute(&self, request: &Envelope) -> Envelope {
        let Some(command) = request.command.as_deref() else {
            return Envelope::error(request.id.clone(), "request missing a command");
        };

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), command);
        let mut builder = self.client.post(&url).json(&request.data);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        match builder.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
                Ok(body) => Envelope::response(request.id.clone(), body),
                Err(e) => Envelope::error(request.id.clone(), format!("invalid response body: {e}")),
            },
            Ok(resp) => Envelope::error(
                request.id.clone(),
                format!("HTTP API returned status {}", resp.status()),
            ),
            Err(e) => Envelope::error(request.id.clone(), format!("HTTP call failed: {e}")),
        }
    }
}
