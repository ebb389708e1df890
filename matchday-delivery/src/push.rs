use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use matchday_core::config::PushConfig;
use matchday_core::error::{Error, Result};
use matchday_core::gateway::{DeliveryStatus, PushGateway, PushMessage, PushOutcome};

const TOKEN_PREFIXES: [&str; 2] = ["ExponentPushToken[", "ExpoPushToken["];

/// Client for an Expo-compatible push gateway: messages are submitted as
/// JSON batches and the gateway answers with one ticket per message, in
/// order. A `DeviceNotRegistered` ticket means the endpoint is permanently
/// gone and its token should be pruned.
pub struct HttpPushGateway {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
    batch_size: usize,
}

#[derive(Serialize)]
struct GatewayMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a Value,
    sound: &'static str,
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    data: Vec<Ticket>,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<TicketDetails>,
}

#[derive(Debug, Deserialize)]
struct TicketDetails {
    #[serde(default)]
    error: Option<String>,
}

impl HttpPushGateway {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Delivery(format!("failed to build push HTTP client: {}", e)))?;

        tracing::info!("Push gateway client ready ({})", config.endpoint);

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            access_token: config.access_token.clone(),
            batch_size: config.batch_size.max(1),
        })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    fn is_valid_token(&self, token: &str) -> bool {
        token.ends_with(']')
            && TOKEN_PREFIXES
                .iter()
                .any(|p| token.starts_with(p) && token.len() > p.len() + 1)
    }

    fn max_batch(&self) -> usize {
        self.batch_size
    }

    async fn send(&self, messages: Vec<PushMessage>) -> Result<Vec<PushOutcome>> {
        let body: Vec<GatewayMessage<'_>> = messages
            .iter()
            .map(|m| GatewayMessage {
                to: &m.token,
                title: &m.title,
                body: &m.body,
                data: &m.data,
                sound: "default",
            })
            .collect();

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("push gateway request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Delivery(format!(
                "push gateway returned {}: {}",
                status, detail
            )));
        }

        let tickets: TicketResponse = response
            .json()
            .await
            .map_err(|e| Error::Delivery(format!("malformed push gateway response: {}", e)))?;

        let tokens: Vec<String> = messages.into_iter().map(|m| m.token).collect();
        outcomes_from_tickets(tokens, tickets.data)
    }
}

/// Tickets come back in submission order, one per message.
fn outcomes_from_tickets(tokens: Vec<String>, tickets: Vec<Ticket>) -> Result<Vec<PushOutcome>> {
    if tokens.len() != tickets.len() {
        return Err(Error::Delivery(format!(
            "push gateway answered {} tickets for {} messages",
            tickets.len(),
            tokens.len()
        )));
    }

    Ok(tokens
        .into_iter()
        .zip(tickets)
        .map(|(token, ticket)| {
            let status = if ticket.status == "ok" {
                DeliveryStatus::Delivered
            } else {
                let reason = ticket.details.and_then(|d| d.error);
                match reason.as_deref() {
                    Some("DeviceNotRegistered") => DeliveryStatus::EndpointGone,
                    Some(other) => DeliveryStatus::Failed(other.to_string()),
                    None => DeliveryStatus::Failed(
                        ticket.message.unwrap_or_else(|| "unknown error".to_string()),
                    ),
                }
            };
            PushOutcome { token, status }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> HttpPushGateway {
        HttpPushGateway::new(&PushConfig {
            endpoint: "https://exp.host/--/api/v2/push/send".to_string(),
            access_token: None,
            batch_size: 100,
        })
        .unwrap()
    }

    #[test]
    fn token_syntax_validation() {
        let gw = gateway();
        assert!(gw.is_valid_token("ExponentPushToken[abc123]"));
        assert!(gw.is_valid_token("ExpoPushToken[abc123]"));
        assert!(!gw.is_valid_token("ExponentPushToken[]"));
        assert!(!gw.is_valid_token("ExponentPushToken[abc"));
        assert!(!gw.is_valid_token("apns:1234567890"));
        assert!(!gw.is_valid_token(""));
    }

    #[test]
    fn tickets_map_to_outcomes_in_order() {
        let tokens = vec![
            "ExponentPushToken[a]".to_string(),
            "ExponentPushToken[b]".to_string(),
            "ExponentPushToken[c]".to_string(),
        ];
        let tickets: TicketResponse = serde_json::from_value(serde_json::json!({
            "data": [
                { "status": "ok", "id": "ticket-1" },
                { "status": "error", "message": "not registered",
                  "details": { "error": "DeviceNotRegistered" } },
                { "status": "error", "message": "rate limited" },
            ]
        }))
        .unwrap();

        let outcomes = outcomes_from_tickets(tokens, tickets.data).unwrap();
        assert_eq!(outcomes[0].status, DeliveryStatus::Delivered);
        assert_eq!(outcomes[1].status, DeliveryStatus::EndpointGone);
        assert_eq!(outcomes[1].token, "ExponentPushToken[b]");
        assert_eq!(
            outcomes[2].status,
            DeliveryStatus::Failed("rate limited".to_string())
        );
    }

    #[test]
    fn ticket_count_mismatch_is_a_delivery_error() {
        let tokens = vec!["ExponentPushToken[a]".to_string()];
        let err = outcomes_from_tickets(tokens, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
    }
}
