use std::sync::Arc;

use agentick_core::{HistoryResponse, HistorySource, PageRequest, SyncEvent};
use snafu::{ResultExt, Snafu, ensure};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::settings::SettingsStore;

pub type HistoryFetchResult<T> = Result<T, HistoryFetchError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HistoryFetchError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("history request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("history endpoint returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode history page on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

/// `GET {api_base}/conversations/{id}/messages?skip=..&limit=..` with a bearer credential.
pub struct HttpHistorySource {
    client: reqwest::Client,
    settings: Arc<SettingsStore>,
    runtime: Handle,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl HttpHistorySource {
    pub fn new(
        settings: Arc<SettingsStore>,
        runtime: Handle,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> HistoryFetchResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "build-history-client",
            })?;

        Ok(Self {
            client,
            settings,
            runtime,
            events,
        })
    }

    pub async fn fetch_page(
        client: &reqwest::Client,
        api_base: &str,
        token: &str,
        request: PageRequest,
    ) -> HistoryFetchResult<HistoryResponse> {
        let url = format!(
            "{}/conversations/{}/messages",
            api_base.trim_end_matches('/'),
            request.conversation
        );

        let response = client
            .get(url)
            .bearer_auth(token)
            .query(&[("skip", request.offset), ("limit", request.limit)])
            .send()
            .await
            .context(RequestSnafu {
                stage: "send-history-request",
            })?;

        let status = response.status();
        let body = response.text().await.context(RequestSnafu {
            stage: "read-history-response",
        })?;

        ensure!(
            status.is_success(),
            StatusSnafu {
                stage: "check-history-status",
                status: status.as_u16(),
                body,
            }
        );

        serde_json::from_str(&body).context(DecodeSnafu {
            stage: "decode-history-page",
        })
    }
}

impl HistorySource for HttpHistorySource {
    fn fetch(&self, request: PageRequest) {
        let client = self.client.clone();
        let settings = self.settings.settings();
        let events = self.events.clone();

        self.runtime.spawn(async move {
            let result =
                Self::fetch_page(&client, &settings.api_base, &settings.token, request).await;

            let result = match result {
                Ok(page) => {
                    tracing::debug!(
                        conversation = %request.conversation,
                        offset = request.offset,
                        received = page.messages.len(),
                        has_more = page.has_more,
                        "history page fetched"
                    );
                    Ok(page)
                }
                Err(error) => {
                    tracing::warn!(
                        conversation = %request.conversation,
                        offset = request.offset,
                        error = %error,
                        "history fetch failed"
                    );
                    Err(error.to_string())
                }
            };

            let _ = events.send(SyncEvent::HistoryLoaded {
                ticket: request.ticket,
                result,
            });
        });
    }
}
