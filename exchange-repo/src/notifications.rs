//! Outbox worker delivering order notifications to a webhook.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use exchange_types::{ExchangeRepository, Notification, NotificationStatus};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::security::{SIGNATURE_HEADER, sign_payload};

/// Deliveries that fail this many times are parked as `FAILED`.
pub const MAX_ATTEMPTS: i32 = 5;

const BATCH_SIZE: i64 = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a claimed row stays with this worker. Must outlast a full batch
/// of deliveries, or rows are claimed twice.
const LEASE_SECS: i64 = 120;

const RETRY_BASE_SECS: i64 = 5;
const RETRY_MAX_SECS: i64 = 300;

/// Wait before the next attempt once `attempts` deliveries have failed.
///
/// Doubles from 5 seconds and stops growing at 5 minutes.
pub fn retry_delay(attempts: i32) -> chrono::Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let secs = RETRY_BASE_SECS.saturating_mul(1 << exponent).min(RETRY_MAX_SECS);
    chrono::Duration::seconds(secs)
}

pub struct NotificationWorker<R> {
    repo: Arc<R>,
    client: reqwest::Client,
    target_url: String,
    secret: String,
}

impl<R: ExchangeRepository> NotificationWorker<R> {
    pub fn new(repo: Arc<R>, target_url: String, secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            repo,
            client,
            target_url,
            secret,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(self) {
        info!("Starting notification worker sending to {}", self.target_url);
        loop {
            self.tick().await;
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Claims and delivers one batch. Returns how many were claimed.
    pub async fn tick(&self) -> usize {
        let lease_until = Utc::now() + chrono::Duration::seconds(LEASE_SECS);
        match self
            .repo
            .claim_pending_notifications(BATCH_SIZE, lease_until)
            .await
        {
            Ok(notifications) => {
                let claimed = notifications.len();
                if claimed > 0 {
                    info!("Processing {} pending notifications", claimed);
                    for notification in notifications {
                        self.process(notification).await;
                    }
                }
                claimed
            }
            Err(e) => {
                error!("Failed to fetch notifications: {}", e);
                0
            }
        }
    }

    #[instrument(skip(self, notification), fields(notification_id = %notification.id, event = %notification.event_type))]
    async fn process(&self, notification: Notification) {
        let attempts = notification.attempts + 1;
        let now = Utc::now();
        let (status, last_error, retry_at) = match self.deliver(&notification).await {
            Ok(()) => (NotificationStatus::Completed, None, now),
            Err(e) if attempts >= MAX_ATTEMPTS => {
                error!("Giving up on notification after {} attempts: {}", attempts, e);
                (NotificationStatus::Failed, Some(e), now)
            }
            Err(e) => {
                let delay = retry_delay(attempts);
                warn!(
                    "Notification delivery failed, retrying in {}s: {}",
                    delay.num_seconds(),
                    e
                );
                (NotificationStatus::Pending, Some(e), now + delay)
            }
        };

        if let Err(e) = self
            .repo
            .mark_notification(notification.id, status, last_error, retry_at)
            .await
        {
            error!("Failed to update notification status: {}", e);
        }
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        let body = serde_json::json!({
            "id": notification.id,
            "event": notification.event_type,
            "created_at": notification.created_at,
            "data": notification.payload,
        });
        let bytes = serde_json::to_vec(&body).map_err(|e| e.to_string())?;
        let signature = sign_payload(&bytes, &self.secret).map_err(|e| e.to_string())?;

        let resp = self
            .client
            .post(&self.target_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(bytes)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", resp.status()))
        }
    }
}
