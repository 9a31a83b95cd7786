//! Outbound HTTP for claimed work items.
//!
//! Issues a GET to the item's URL and classifies the response. A 2xx
//! completes the item; a status in the retryable set delays it without
//! counting an error; anything else, including transport errors, fails it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode, Url};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::WorkItem;

/// Default statuses routed to Delay instead of Fail.
pub const DEFAULT_RETRY_STATUS_CODES: &[u16] = &[429];

/// How a dispatch attempt should be settled in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Complete { status: u16 },
    Delay { status: u16 },
    Fail { status: Option<u16>, error: String },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Complete { .. } => "complete",
            DispatchOutcome::Delay { .. } => "delay",
            DispatchOutcome::Fail { .. } => "fail",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchOutcome::Complete { status } | DispatchOutcome::Delay { status } => {
                Some(*status)
            }
            DispatchOutcome::Fail { status, .. } => *status,
        }
    }
}

/// Hook for adjusting outgoing requests, e.g. adding auth headers.
pub trait RequestMutator: Send + Sync {
    fn mutate(&self, request: RequestBuilder, item: &WorkItem) -> RequestBuilder;
}

impl<F> RequestMutator for F
where
    F: Fn(RequestBuilder, &WorkItem) -> RequestBuilder + Send + Sync,
{
    fn mutate(&self, request: RequestBuilder, item: &WorkItem) -> RequestBuilder {
        self(request, item)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Base for relative work item URLs.
    pub base_url: Option<Url>,
    pub retry_status_codes: BTreeSet<u16>,
    /// Per-request timeout. `None` leaves the client default in place.
    pub timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            retry_status_codes: DEFAULT_RETRY_STATUS_CODES.iter().copied().collect(),
            timeout: None,
        }
    }
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    config: DispatchConfig,
    mutator: Option<Arc<dyn RequestMutator>>,
}

impl HttpDispatcher {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("cannot build http client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: DispatchConfig) -> Self {
        Self {
            client,
            config,
            mutator: None,
        }
    }

    pub fn with_mutator(mut self, mutator: impl RequestMutator + 'static) -> Self {
        self.mutator = Some(Arc::new(mutator));
        self
    }

    /// Resolve an item URL, joining relative ones onto the base URL.
    pub fn resolve_url(&self, url: &str) -> Result<Url> {
        let resolved = match &self.config.base_url {
            // Joining an absolute URL yields it unchanged.
            Some(base) => base.join(url),
            None => Url::parse(url),
        };
        resolved.map_err(|e| Error::Other(format!("invalid url {url}: {e}")))
    }

    /// Map a response status to a settlement.
    pub fn classify(&self, status: StatusCode) -> DispatchOutcome {
        let code = status.as_u16();
        if status.is_success() {
            DispatchOutcome::Complete { status: code }
        } else if self.config.retry_status_codes.contains(&code) {
            DispatchOutcome::Delay { status: code }
        } else {
            DispatchOutcome::Fail {
                status: Some(code),
                error: format!("http status {status}"),
            }
        }
    }

    /// GET the item's URL. Never returns an error: failures become
    /// [`DispatchOutcome::Fail`].
    pub async fn dispatch(&self, item: &WorkItem) -> DispatchOutcome {
        let url = match self.resolve_url(&item.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(work_item_id = %item.id, url = %item.url, error = %e, "unresolvable work item url");
                return DispatchOutcome::Fail {
                    status: None,
                    error: e.to_string(),
                };
            }
        };

        let mut request = self.client.get(url.clone());
        if let Some(mutator) = &self.mutator {
            request = mutator.mutate(request, item);
        }

        match request.send().await {
            Ok(response) => {
                let outcome = self.classify(response.status());
                debug!(work_item_id = %item.id, %url, status = response.status().as_u16(), outcome = outcome.label(), "dispatched");
                outcome
            }
            Err(e) => {
                warn!(work_item_id = %item.id, %url, error = %e, "dispatch transport error");
                DispatchOutcome::Fail {
                    status: e.status().map(|s| s.as_u16()),
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(base: Option<&str>) -> HttpDispatcher {
        HttpDispatcher::new(DispatchConfig {
            base_url: base.map(|b| Url::parse(b).unwrap()),
            ..DispatchConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn relative_urls_join_the_base() {
        let d = dispatcher(Some("http://localhost:8080/api/"));
        let url = d.resolve_url("SetMessage/abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/SetMessage/abc");
    }

    #[test]
    fn relative_url_without_base_is_an_error() {
        assert!(dispatcher(None).resolve_url("SetMessage/abc").is_err());
    }

    #[test]
    fn statuses_are_classified() {
        let d = dispatcher(None);
        assert_eq!(
            d.classify(StatusCode::OK),
            DispatchOutcome::Complete { status: 200 }
        );
        assert_eq!(
            d.classify(StatusCode::TOO_MANY_REQUESTS),
            DispatchOutcome::Delay { status: 429 }
        );
        assert_eq!(d.classify(StatusCode::INTERNAL_SERVER_ERROR).label(), "fail");
        assert_eq!(d.classify(StatusCode::NOT_FOUND).status(), Some(404));
    }
}
