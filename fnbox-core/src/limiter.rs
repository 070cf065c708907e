// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Bounded concurrency gate for sandbox provisioning.
//!
//! Fails fast when the host is at capacity instead of queueing.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::InvocationError;

/// Caps the number of simultaneous `prepare()` calls.
#[derive(Debug, Clone)]
pub struct ProvisioningLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one `prepare()`. Dropping it frees the slot.
#[derive(Debug)]
pub struct ProvisioningPermit {
    _permit: OwnedSemaphorePermit,
}

impl ProvisioningLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot or fail immediately with `ResourceExhausted`.
    pub fn try_acquire(&self) -> Result<ProvisioningPermit, InvocationError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(ProvisioningPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                tracing::warn!(capacity = self.capacity, "Provisioning limiter saturated");
                Err(InvocationError::ResourceExhausted {
                    capacity: self.capacity,
                })
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
