//! The delivery worker: consumes the submission queue and delivers each
//! message locally or through the recipient domain's mail exchanger.

use crate::config::Config;
use crate::error::Error;
use crate::mx::MxResolver;
use crate::queue::{QueuedMessage, SubmissionQueue};
use crate::retry::{RetryScheduler, BUCKET_DELIVER, BUCKET_PERSIST, BUCKET_RESOLVE};
use crate::smtp_client;
use crate::store::Store;
use crate::utils::mail_domain;
use std::time::Duration;

pub struct DeliveryWorker {
    config: Config,
    store: Store,
    queue: SubmissionQueue,
    retries: RetryScheduler,
    resolver: MxResolver,
}

impl DeliveryWorker {
    pub fn new(
        config: Config,
        store: Store,
        queue: SubmissionQueue,
        retries: RetryScheduler,
    ) -> Result<Self, Error> {
        let resolver = MxResolver::from_system_conf()?;
        Ok(Self {
            config,
            store,
            queue,
            retries,
            resolver,
        })
    }

    /// Consumes the queue forever.
    pub async fn run(self) {
        loop {
            let payload = match self.queue.pop().await {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("error fetching from queue: {e}");
                    // don't spin while the store is down
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            self.deliver(&payload).await;
        }
    }

    async fn deliver(&self, payload: &str) {
        let msg: QueuedMessage = match serde_json::from_str(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("discarding malformed queue payload: {e}");
                return;
            }
        };

        let domain = mail_domain(&msg.to).to_string();
        if self.config.is_local_domain(&domain) {
            if let Err(e) = self.store.save_mailbox(&msg).await {
                self.retries
                    .add_retry(msg, &e.to_string(), BUCKET_DELIVER)
                    .await;
                return;
            }
            log::info!("message {} stored locally", msg.id);
        } else {
            let host = match self.resolver.resolve(&domain).await {
                Ok(host) => host,
                Err(e) => {
                    self.retries
                        .add_retry(msg, &e.to_string(), BUCKET_RESOLVE)
                        .await;
                    return;
                }
            };
            if let Err(e) = smtp_client::send(
                &host,
                self.config.relay_port,
                &msg.from,
                &msg.to,
                &msg.data,
            )
            .await
            {
                log::warn!("relay to {host} failed: {e}");
                self.retries
                    .add_retry(msg, &e.to_string(), BUCKET_DELIVER)
                    .await;
                return;
            }
            log::info!("message {} relayed to {host}", msg.id);
        }

        if let Err(e) = self.store.save_delivered(&msg).await {
            self.retries
                .add_retry(msg, &e.to_string(), BUCKET_PERSIST)
                .await;
        }
    }
}
