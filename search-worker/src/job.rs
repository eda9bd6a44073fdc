//! Periodic background search of all subscriptions

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use metrics::counter;
use subscription_storage::models::{PhraseMatches, SubscriptionEntry};
use subscription_storage::{SearchResultRepository, SearchUpdate, SubscriptionRepository};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::search::ChannelSearch;
use crate::transport::ChatTransport;

/// Timing and parallelism of the search job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchJobConfig {
    /// Pause between two cycles
    pub interval: Duration,
    /// Pause after a failed cycle
    pub backoff: Duration,
    /// Subscriptions searched at the same time
    pub concurrency: usize,
}

impl Default for SearchJobConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            backoff: Duration::from_secs(10),
            concurrency: 4,
        }
    }
}

/// Counts of one search cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Subscriptions searched
    pub searched: usize,
    /// Subscriptions whose user was notified
    pub notified: usize,
    /// Subscriptions that failed and will be retried next cycle
    pub failed: usize,
}

/// Searches every subscription with phrases, notifies users about new matches and stores them
pub struct SearchJob {
    subscriptions: Arc<SubscriptionRepository>,
    search_results: Arc<SearchResultRepository>,
    channel_search: Arc<dyn ChannelSearch>,
    transport: Arc<dyn ChatTransport>,
    config: SearchJobConfig,
    shutdown: CancellationToken,
}

impl SearchJob {
    /// Creates a new `SearchJob`
    #[must_use]
    pub fn new(
        subscriptions: Arc<SubscriptionRepository>,
        search_results: Arc<SearchResultRepository>,
        channel_search: Arc<dyn ChannelSearch>,
        transport: Arc<dyn ChatTransport>,
        config: SearchJobConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            subscriptions,
            search_results,
            channel_search,
            transport,
            config: SearchJobConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
            shutdown,
        }
    }

    /// Runs cycles until shutdown. A failed cycle is logged and retried after the backoff;
    /// shutdown drops the cycle in flight.
    pub async fn start(self) {
        info!(interval = ?self.config.interval, "Starting search job");

        while !self.shutdown.is_cancelled() {
            let pause = tokio::select! {
                result = self.run_cycle() => match result {
                    Ok(report) => {
                        info!(
                            searched = report.searched,
                            notified = report.notified,
                            failed = report.failed,
                            "Search cycle finished"
                        );
                        self.config.interval
                    }
                    Err(e) => {
                        error!(error = ?e, "Search cycle failed");
                        counter!("search_cycle_failed").increment(1);
                        self.config.backoff
                    }
                },
                () = self.shutdown.cancelled() => break,
            };

            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = self.shutdown.cancelled() => break,
            }
        }

        info!("Search job shutdown complete");
    }

    /// Searches all subscriptions with phrases once
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriptions cannot be listed. Failures of single
    /// subscriptions are counted in the report instead.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        counter!("search_cycles").increment(1);

        let entries = self
            .subscriptions
            .list_all_subscriptions(true)
            .await
            .context("Failed to list subscriptions")?;
        debug!(count = entries.len(), "Searching subscriptions");

        let outcomes: Vec<(&SubscriptionEntry, anyhow::Result<bool>)> = stream::iter(&entries)
            .map(|entry| async move { (entry, self.search_subscription(entry).await) })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let mut report = CycleReport::default();
        for (entry, outcome) in outcomes {
            report.searched += 1;
            match outcome {
                Ok(true) => report.notified += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    counter!("search_subscription_failed").increment(1);
                    warn!(
                        channel_id = entry.channel.id,
                        user_id = entry.user_id,
                        error = ?e,
                        "Failed to search subscription"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Searches one subscription. Returns whether the user was notified.
    ///
    /// The user is notified before the results are stored, so a failed write repeats the
    /// notification next cycle rather than losing it.
    #[instrument(skip(self, entry), fields(channel_id = entry.channel.id, user_id = entry.user_id))]
    async fn search_subscription(&self, entry: &SubscriptionEntry) -> anyhow::Result<bool> {
        let found = self
            .channel_search
            .search_messages(entry.channel.id, &entry.phrases, entry.last_message)
            .await
            .context("Channel search failed")?;

        let nothing_found = found.results.iter().all(|g| g.messages.is_empty());
        if nothing_found && entry.last_message == Some(found.last_message_id) {
            debug!("No new messages");
            return Ok(false);
        }

        let stored = self
            .search_results
            .get_search_results(entry.channel.id, entry.user_id)
            .await
            .context("Failed to read stored results")?
            .map(|document| document.search_results)
            .unwrap_or_default();

        let fresh = unseen_matches(&stored, &found.results);
        let notified = !fresh.is_empty();
        if notified {
            let matches: usize = fresh.iter().map(|g| g.messages.len()).sum();
            self.transport
                .send_message(entry.user_id, &format_notification(&entry.channel.name, &fresh))
                .await
                .context("Failed to notify user")?;

            counter!("search_matches_found").increment(matches as u64);
            counter!("search_notifications_sent").increment(1);
            info!(matches, "User notified");
        }

        self.search_results
            .merge_search_results(SearchUpdate {
                channel_id: entry.channel.id,
                user_id: entry.user_id,
                last_message_id: found.last_message_id,
                results: found.results,
            })
            .await
            .context("Failed to store search results")?;

        Ok(notified)
    }
}

/// Messages of `found` whose id is not stored under the same phrase yet
fn unseen_matches(stored: &[PhraseMatches], found: &[PhraseMatches]) -> Vec<PhraseMatches> {
    let mut known: HashMap<&str, HashSet<i64>> = HashMap::new();
    for group in stored {
        known
            .entry(group.phrase.as_str())
            .or_default()
            .extend(group.messages.iter().map(|m| m.id));
    }

    let mut fresh: Vec<PhraseMatches> = Vec::new();
    for group in found {
        let seen = known.entry(group.phrase.as_str()).or_default();
        let messages: Vec<_> = group
            .messages
            .iter()
            .filter(|m| seen.insert(m.id))
            .cloned()
            .collect();
        if messages.is_empty() {
            continue;
        }

        match fresh.iter_mut().find(|g| g.phrase == group.phrase) {
            Some(existing) => existing.messages.extend(messages),
            None => fresh.push(PhraseMatches {
                phrase: group.phrase.clone(),
                messages,
            }),
        }
    }
    fresh
}

/// Text of the message telling a user about new matches
fn format_notification(channel_name: &str, fresh: &[PhraseMatches]) -> String {
    let mut lines = vec![format!("New messages in {channel_name}:")];
    for group in fresh {
        lines.push(String::new());
        lines.push(format!("\"{}\":", group.phrase));
        lines.extend(group.messages.iter().map(|m| m.link.clone()));
    }
    lines.join("\n")
}
