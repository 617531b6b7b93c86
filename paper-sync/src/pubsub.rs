//! Pub/Sub pull subscription as a core [`MessageSource`].
//!
//! Uses the REST API: `:pull`, `:acknowledge`, and `:modifyAckDeadline` with a
//! zero deadline for nacks, which makes the message eligible for redelivery
//! under the subscription's retry policy.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use paper_sync_core::contract::{BoxError, MessageSource, ReceivedMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gcp::{ApiClient, GcpError, PUBSUB_SCOPE};

const API_ROOT: &str = "https://pubsub.googleapis.com/v1";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceived>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceived {
    ack_id: String,
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest<'a> {
    ack_ids: [&'a str; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: [&'a str; 1],
    ack_deadline_seconds: u32,
}

pub struct PubSubSource {
    api: ApiClient,
    /// `projects/{project}/subscriptions/{subscription}`.
    subscription: String,
}

impl PubSubSource {
    pub fn new(api: ApiClient, subscription: impl Into<String>) -> Self {
        Self {
            api,
            subscription: subscription.into(),
        }
    }

    fn url(&self, verb: &str) -> String {
        format!("{API_ROOT}/{}:{verb}", self.subscription)
    }
}

/// Turns wire messages into core messages; undecodable base64 yields an empty
/// payload so the consumer nacks it as malformed.
fn into_received(wire: PullResponse) -> Vec<ReceivedMessage> {
    wire.received_messages
        .into_iter()
        .map(|r| {
            let data = STANDARD.decode(r.message.data.as_bytes()).unwrap_or_else(|e| {
                warn!(message_id = %r.message.message_id, error = %e, "Message data is not base64");
                Vec::new()
            });
            ReceivedMessage {
                message_id: r.message.message_id,
                ack_id: r.ack_id,
                data,
            }
        })
        .collect()
}

#[async_trait]
impl MessageSource for PubSubSource {
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, BoxError> {
        let url = self.url("pull");
        let body = PullRequest { max_messages };
        let response = self
            .api
            .send(PUBSUB_SCOPE, &[], |http| http.post(&url).json(&body))
            .await?;
        let wire: PullResponse = response.json().await.map_err(GcpError::from)?;
        let messages = into_received(wire);
        if !messages.is_empty() {
            debug!(subscription = %self.subscription, count = messages.len(), "Pulled messages");
        }
        Ok(messages)
    }

    async fn ack(&self, ack_id: &str) -> Result<(), BoxError> {
        let url = self.url("acknowledge");
        let body = AckRequest { ack_ids: [ack_id] };
        self.api
            .send(PUBSUB_SCOPE, &[], |http| http.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<(), BoxError> {
        let url = self.url("modifyAckDeadline");
        let body = ModifyAckDeadlineRequest {
            ack_ids: [ack_id],
            ack_deadline_seconds: 0,
        };
        self.api
            .send(PUBSUB_SCOPE, &[], |http| http.post(&url).json(&body))
            .await?;
        Ok(())
    }
}
