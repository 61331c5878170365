//! Bucket data model and the refill arithmetic.
//!
//! A [`Bucket`] is the quota state of one `(owner, resource)` pair. Parameters
//! (`capacity`, `period_seconds`, `refill_amount`, `persistent`) are fixed when the
//! bucket is provisioned; only `token` and `last_fill_at` move afterwards.
//!
//! Refill is lazy: nothing ticks in the background. Whenever a bucket is used, the
//! whole refill cycles elapsed since `last_fill_at` are converted into tokens:
//!
//! ```text
//! rate  = floor((now - last_fill_at) / period_seconds * refill_amount)
//! grant = min(capacity, rate) - token        (applied only when > 0)
//! ```
//!
//! A positive grant moves `last_fill_at` to `now` even when the grant was capped by
//! `capacity`, so elapsed time beyond what was needed to fill the bucket is discarded.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::LimitSpec;

/// Errors produced when validating bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    /// Capacity must be > 0.
    InvalidCapacity {
        /// Value provided by caller.
        provided: u32,
    },
    /// Refill period must be > 0 seconds.
    InvalidPeriod {
        /// Value provided by caller.
        provided: u32,
    },
    /// Refill amount must be > 0.
    InvalidRefill {
        /// Value provided by caller.
        provided: u32,
    },
}

impl fmt::Display for BucketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketError::InvalidCapacity { provided } => {
                write!(f, "capacity must be > 0 (got {})", provided)
            }
            BucketError::InvalidPeriod { provided } => {
                write!(f, "period_seconds must be > 0 (got {})", provided)
            }
            BucketError::InvalidRefill { provided } => {
                write!(f, "refill_amount must be > 0 (got {})", provided)
            }
        }
    }
}

impl std::error::Error for BucketError {}

/// Quota state for one `(owner, resource)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBucket")]
pub struct Bucket {
    owner: String,
    resource: String,
    capacity: u32,
    period_seconds: u32,
    refill_amount: u32,
    last_fill_at: i64,
    token: i64,
    persistent: bool,
}

/// Result of a combined refill-and-debit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeOutcome {
    /// Whether the caller may proceed.
    pub admitted: bool,
    /// Tokens added by refill before the admission check (0 if none).
    pub granted: i64,
    /// Token count after the step.
    pub token: i64,
    /// `last_fill_at` after the step.
    pub last_fill_at: i64,
}

impl Bucket {
    /// Build a bucket from validated limits.
    pub fn new(
        owner: impl Into<String>,
        resource: impl Into<String>,
        spec: LimitSpec,
        last_fill_at: i64,
        token: i64,
    ) -> Self {
        Self {
            owner: owner.into(),
            resource: resource.into(),
            capacity: spec.capacity(),
            period_seconds: spec.period_seconds(),
            refill_amount: spec.refill_amount(),
            last_fill_at,
            token,
            persistent: spec.persistent(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn period_seconds(&self) -> u32 {
        self.period_seconds
    }

    pub fn refill_amount(&self) -> u32 {
        self.refill_amount
    }

    /// Unix seconds of the last refill that added tokens (or of provisioning).
    pub fn last_fill_at(&self) -> i64 {
        self.last_fill_at
    }

    /// Tokens currently available. May be negative after a large debit.
    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// The limits this bucket was provisioned with.
    pub fn spec(&self) -> LimitSpec {
        LimitSpec::from_validated(
            self.capacity,
            self.period_seconds,
            self.refill_amount,
            self.persistent,
        )
    }

    /// Whole refill units earned between `last_fill_at` and `now`.
    ///
    /// Zero or negative elapsed time (clock skew between instances) earns nothing.
    pub fn refill_rate(&self, now: i64) -> i64 {
        let elapsed = now.saturating_sub(self.last_fill_at);
        if elapsed <= 0 {
            return 0;
        }
        let earned = i128::from(elapsed) * i128::from(self.refill_amount)
            / i128::from(self.period_seconds);
        i64::try_from(earned).unwrap_or(i64::MAX)
    }

    /// Tokens a refill at `now` would add. Never negative: refill does not remove tokens.
    pub fn refill_grant(&self, now: i64) -> i64 {
        let rate = self.refill_rate(now);
        if rate <= 0 {
            return 0;
        }
        let ceiling = rate.min(i64::from(self.capacity));
        ceiling.saturating_sub(self.token).max(0)
    }

    /// Record a refill of `grant` tokens at `now`.
    pub(crate) fn apply_grant(&mut self, grant: i64, now: i64) {
        self.token = self.token.saturating_add(grant);
        self.last_fill_at = now;
    }

    pub(crate) fn set_token(&mut self, token: i64) {
        self.token = token;
    }

    pub(crate) fn set_last_fill_at(&mut self, last_fill_at: i64) {
        self.last_fill_at = last_fill_at;
    }

    /// Refill, then debit `count` if any token is available.
    ///
    /// Admission only requires `token > 0`, not `token >= count`; a large debit may
    /// drive the bucket negative. The next refill that earns anything lifts it straight
    /// to `min(capacity, rate)`.
    pub fn take_in_place(&mut self, now: i64, count: u32) -> TakeOutcome {
        let granted = self.refill_grant(now);
        if granted > 0 {
            self.apply_grant(granted, now);
        }
        let admitted = self.token > 0;
        if admitted {
            self.token = self.token.saturating_sub(i64::from(count));
        }
        TakeOutcome { admitted, granted, token: self.token, last_fill_at: self.last_fill_at }
    }
}

#[derive(Deserialize)]
struct RawBucket {
    owner: String,
    resource: String,
    capacity: u32,
    period_seconds: u32,
    refill_amount: u32,
    last_fill_at: i64,
    token: i64,
    #[serde(default)]
    persistent: bool,
}

impl TryFrom<RawBucket> for Bucket {
    type Error = BucketError;

    fn try_from(raw: RawBucket) -> Result<Self, Self::Error> {
        let spec =
            LimitSpec::new(raw.capacity, raw.period_seconds, raw.refill_amount, raw.persistent)?;
        Ok(Bucket::new(raw.owner, raw.resource, spec, raw.last_fill_at, raw.token))
    }
}
