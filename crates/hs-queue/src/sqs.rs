use async_trait::async_trait;
use aws_sdk_sqs::types::{
    Message as SqsMessage, MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName,
};
use aws_sdk_sqs::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::{QueueConsumer, QueueError, QueueMetrics, QueuePublisher, Result};
use hs_common::{Message, QueuedMessage};

const DEAD_LETTER_REASON_ATTRIBUTE: &str = "DeadLetterReason";
const DEAD_LETTER_DESCRIPTION_ATTRIBUTE: &str = "DeadLetterErrorDescription";

fn string_attribute(value: &str) -> Result<MessageAttributeValue> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| QueueError::Sqs(e.to_string()))
}

fn to_message_attributes(
    properties: &HashMap<String, String>,
) -> Result<HashMap<String, MessageAttributeValue>> {
    properties
        .iter()
        .map(|(key, value)| Ok((key.clone(), string_attribute(value)?)))
        .collect()
}

fn queue_name_from_url(queue_url: &str) -> String {
    queue_url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// AWS SQS inbound consumer.
///
/// Application properties travel as String message attributes and the body is
/// passed through untouched. Dead-lettering copies the message to the
/// configured DLQ with the reason attached, then deletes the original.
pub struct SqsQueueConsumer {
    client: Client,
    queue_url: String,
    queue_name: String,
    dead_letter_queue_url: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
    running: AtomicBool,
}

impl SqsQueueConsumer {
    /// AWS SQS max is 20 seconds; 5 keeps shutdown responsive.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 5;

    pub fn new(
        client: Client,
        queue_url: String,
        dead_letter_queue_url: String,
        visibility_timeout_seconds: i32,
    ) -> Self {
        Self {
            client,
            queue_name: queue_name_from_url(&queue_url),
            queue_url,
            dead_letter_queue_url,
            visibility_timeout_seconds,
            wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
            running: AtomicBool::new(true),
        }
    }

    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    fn parse_sqs_message(&self, sqs_msg: &SqsMessage) -> Result<QueuedMessage> {
        let receipt_handle = sqs_msg
            .receipt_handle()
            .ok_or_else(|| QueueError::Sqs("Missing receipt handle".to_string()))?
            .to_string();

        let broker_message_id = sqs_msg.message_id().map(str::to_string);

        let application_properties = sqs_msg
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(key, value)| {
                        value.string_value().map(|v| (key.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let delivery_count = sqs_msg
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|count| count.parse().ok())
            .unwrap_or(1);

        Ok(QueuedMessage {
            message: Message {
                id: broker_message_id.clone().unwrap_or_default(),
                application_properties,
                body: sqs_msg.body().unwrap_or_default().to_string(),
            },
            receipt_handle,
            broker_message_id,
            queue_identifier: self.queue_name.clone(),
            delivery_count,
        })
    }
}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, 10) as i32) // SQS max is 10
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for sqs_msg in &sqs_messages {
            match self.parse_sqs_message(sqs_msg) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(queue = %self.queue_name, error = %e, "Skipping unreadable SQS message"),
            }
        }

        if !messages.is_empty() {
            debug!(queue = %self.queue_name, count = messages.len(), "Polled messages from SQS");
        }

        Ok(messages)
    }

    async fn complete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(queue = %self.queue_name, "Message deleted from SQS");
        Ok(())
    }

    async fn abandon(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let visibility_timeout = delay_seconds.unwrap_or(0) as i32;

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(queue = %self.queue_name, visibility_timeout, "Message released in SQS");
        Ok(())
    }

    async fn dead_letter(&self, message: &QueuedMessage, reason: &str, description: &str) -> Result<()> {
        let mut attributes = to_message_attributes(&message.message.application_properties)?;
        attributes.insert(DEAD_LETTER_REASON_ATTRIBUTE.to_string(), string_attribute(reason)?);
        attributes.insert(
            DEAD_LETTER_DESCRIPTION_ATTRIBUTE.to_string(),
            string_attribute(description)?,
        );

        self.client
            .send_message()
            .queue_url(&self.dead_letter_queue_url)
            .message_body(&message.message.body)
            .set_message_attributes(Some(attributes))
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        self.complete(&message.receipt_handle).await?;

        warn!(
            queue = %self.queue_name,
            message_id = %message.message.id,
            reason = %reason,
            "Message dead-lettered to SQS DLQ"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let attrs = result.attributes.unwrap_or_default();
        let read = |name: &QueueAttributeName| {
            attrs
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        Ok(Some(QueueMetrics {
            pending_messages: read(&QueueAttributeName::ApproximateNumberOfMessages),
            in_flight_messages: read(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
            dead_lettered_messages: 0,
            queue_identifier: self.queue_name.clone(),
        }))
    }
}

/// AWS SQS egress publisher
pub struct SqsPublisher {
    client: Client,
    queue_url: String,
    queue_name: String,
}

impl SqsPublisher {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self {
            client,
            queue_name: queue_name_from_url(&queue_url),
            queue_url,
        }
    }
}

#[async_trait]
impl QueuePublisher for SqsPublisher {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, message: Message) -> Result<String> {
        let attributes = to_message_attributes(&message.application_properties)?;

        let result = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&message.body)
            .set_message_attributes(Some(attributes))
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let message_id = result.message_id.unwrap_or(message.id);
        debug!(queue = %self.queue_name, message_id = %message_id, "Message published to SQS");
        Ok(message_id)
    }
}

/// Resolve a queue name to its URL
pub async fn resolve_queue_url(client: &Client, queue_name: &str) -> Result<String> {
    if queue_name.starts_with("https://") || queue_name.starts_with("http://") {
        return Ok(queue_name.to_string());
    }

    client
        .get_queue_url()
        .queue_name(queue_name)
        .send()
        .await
        .map_err(|e| QueueError::Sqs(e.to_string()))?
        .queue_url
        .ok_or_else(|| QueueError::Sqs(format!("No URL returned for queue {queue_name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_from_url() {
        assert_eq!(
            queue_name_from_url("https://sqs.eu-west-2.amazonaws.com/123456789012/hearings-inbound"),
            "hearings-inbound"
        );
        assert_eq!(queue_name_from_url("https://sqs.local/"), "unknown");
    }

    #[test]
    fn test_properties_become_string_attributes() {
        let mut props = HashMap::new();
        props.insert("hearing_id".to_string(), "2000000001".to_string());

        let attrs = to_message_attributes(&props).unwrap();
        let value = attrs.get("hearing_id").unwrap();
        assert_eq!(value.data_type(), "String");
        assert_eq!(value.string_value(), Some("2000000001"));
    }
}
