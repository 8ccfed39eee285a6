//! One-time pre-key exhaustion monitoring.
//!
//! An external scheduler calls [`ExhaustionMonitor::check_replenishment`]
//! periodically. The check is read-only and keeps no state between calls, so
//! a user whose pool stays low is notified on every run; debouncing is up to
//! the notification collaborator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::store::{Deadline, KeyStore};

/// Sent to the owner's devices asking them to upload more one-time pre-keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplenishmentEvent {
    pub user_id: Uuid,
    pub remaining_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplenishmentStatus {
    pub remaining: u64,
    pub threshold: u64,
    pub notified: bool,
}

/// Delivery side of replenishment events (push, queue, …).
pub trait ReplenishmentNotifier: Send + Sync {
    fn notify(&self, event: ReplenishmentEvent) -> Result<(), DirectoryError>;
}

/// Hands events to an in-process delivery task over a bounded channel.
pub struct ChannelNotifier {
    tx: mpsc::Sender<ReplenishmentEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<ReplenishmentEvent>) -> Self {
        Self { tx }
    }
}

impl ReplenishmentNotifier for ChannelNotifier {
    fn notify(&self, event: ReplenishmentEvent) -> Result<(), DirectoryError> {
        self.tx
            .try_send(event)
            .map_err(|e| DirectoryError::Notify(e.to_string()))
    }
}

/// Only logs the event. Useful when no delivery channel is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ReplenishmentNotifier for LogNotifier {
    fn notify(&self, event: ReplenishmentEvent) -> Result<(), DirectoryError> {
        tracing::info!(
            user = %event.user_id,
            remaining = event.remaining_count,
            "one-time pre-keys running low"
        );
        Ok(())
    }
}

pub struct ExhaustionMonitor {
    store: Arc<dyn KeyStore>,
    notifier: Arc<dyn ReplenishmentNotifier>,
    threshold: u64,
}

impl ExhaustionMonitor {
    pub fn new(
        store: Arc<dyn KeyStore>,
        notifier: Arc<dyn ReplenishmentNotifier>,
        config: &DirectoryConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            threshold: config.replenish_threshold,
        }
    }

    /// Unused one-time pre-keys left for `user_id`.
    pub fn remaining(&self, deadline: &Deadline, user_id: Uuid) -> Result<u64, DirectoryError> {
        let remaining = self
            .store
            .count_unused_one_time_prekeys(deadline, user_id)?;
        Ok(remaining)
    }

    /// Count the user's unused one-time pre-keys and notify when the count is
    /// under the threshold.
    pub fn check_replenishment(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<ReplenishmentStatus, DirectoryError> {
        let remaining = self.remaining(deadline, user_id)?;
        let notified = remaining < self.threshold;

        if notified {
            self.notifier.notify(ReplenishmentEvent {
                user_id,
                remaining_count: remaining,
            })?;
            tracing::debug!(
                user = %user_id,
                remaining,
                threshold = self.threshold,
                "replenishment requested"
            );
        }

        Ok(ReplenishmentStatus {
            remaining,
            threshold: self.threshold,
            notified,
        })
    }
}
