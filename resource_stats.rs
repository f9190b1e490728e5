//! # Resource Set Stats - Per-Tenant Usage Accounting for the Messaging Engine
//!
//! Attributes the resources consumed by a multi-tenant message broker (messages,
//! bytes, subscriptions, connections, client states, memory) to *resource sets*,
//! usually a tenant or organisation extracted from a client id or a topic, and
//! emits aggregated reports on a weekly / daily / hourly schedule or on demand.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        RESOURCE SET STATISTICS ENGINE                       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ENGINE OPS → IDENTIFIER RESOLVER → THREAD CACHE ─flush─→ RESOURCE SET      │
//! │                                          (no global lock)   (bucket lock)   │
//! │                                                                 │           │
//! │  REPORT SINK ←── REPORTING SCHEDULER ←── get_monitor ←── RESOURCE SET TABLE │
//! │                    (resSetReporter)                        (rw lock)        │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Cheap Updates**: per-thread 3-slot cache, bucket lock taken only on flush
//! - **Exact Aggregation**: cumulative and high-water-mark merges never lose a flushed delta
//! - **Resettable**: resets fold into since-last-reset shadows, so since-restart totals survive
//! - **Scheduled Reports**: weekly > daily > hourly, jittered per server instance
//! - **On-Demand Reports**: including fake schedule triggers for testing
//!
//! ## Author
//!
//! Messaging Engine Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::hash::{BuildHasherDefault, Hasher};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::channel::{bounded, Receiver as CrossbeamReceiver, RecvTimeoutError, Sender as CrossbeamSender};
use parking_lot::{Condvar, Mutex, RwLock};
use once_cell::sync::Lazy;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use hashbrown::HashMap as FastHashMap;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{Datelike, Local, TimeZone, Timelike};

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{providers::{Env, Format, Toml}, Figment};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Limits and defaults that define how resource sets are tracked and reported.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "resource-set-stats";
pub const ENGINE_FULL_NAME: &str = "Resource Set Statistics Engine";

// ----------------------------------------------------------------------------
// Resource Set Identity
// ----------------------------------------------------------------------------

/// Longest resource set identifier kept, in bytes. Longer ids are truncated.
pub const MAX_RESOURCE_SET_ID_LENGTH: usize = 128;

/// Identifier of the bucket that collects activity matching no pattern
pub const DEFAULT_RESOURCE_SET_ID: &str = "__Unmatched";

/// Identifier printed on the aggregated "everything not listed" report record
pub const OTHER_RESOURCE_SETS_ID: &str = "__OtherResourceSets";

/// Seed of the xor-djb2 identifier hash
pub const RESOURCE_SET_HASH_SEED: u32 = 5381;

// ----------------------------------------------------------------------------
// Table & Cache Sizing
// ----------------------------------------------------------------------------

/// Initial capacity of the resource set table
pub const INITIAL_TABLE_CAPACITY: usize = 1000;

/// Number of resource sets a thread keeps private deltas for
pub const THREAD_CACHE_SLOTS: usize = 3;

/// Slots below this index are never evicted once bound
pub const THREAD_CACHE_STICKY_SLOTS: usize = 2;

/// Slot flushed and rebound when every slot is in use
pub const THREAD_CACHE_EVICTION_SLOT: usize = THREAD_CACHE_SLOTS - 1;

// ----------------------------------------------------------------------------
// Reporting
// ----------------------------------------------------------------------------

/// Name of the background reporting thread
pub const REPORTER_THREAD_NAME: &str = "resSetReporter";

/// Default bound on how long shutdown waits for the reporting thread (seconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 60;

/// Earliest derived minutes-past-the-hour for scheduled reports
pub const MINUTES_PAST_BASE: u32 = 15;

/// Width of the jitter window added to [`MINUTES_PAST_BASE`]
pub const MINUTES_PAST_SPREAD: u32 = 31;

/// Default result count of the weekly report
pub const DEFAULT_WEEKLY_MAX_RESULTS: u32 = 100;

/// Default result count of the daily report
pub const DEFAULT_DAILY_MAX_RESULTS: u32 = 50;

/// Default result count of the hourly report
pub const DEFAULT_HOURLY_MAX_RESULTS: u32 = 5;

/// Synthesized weekday used by fake schedule requests; matches no real day
pub const FAKE_WEEKDAY: u32 = 7;

/// Synthesized hour used by fake schedule requests; matches no real hour
pub const FAKE_HOUR: u32 = 24;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types of resource set accounting:
// - Nanosecond timestamps with local ISO-8601 rendering
// - The fixed internal counter layout shared by buckets and thread caches
// - The derived external statistics view used by queries and reports
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Local ISO-8601 with 7 fractional digits, e.g. `2024-03-01T10:15:00.1234567+01:00`.
    /// Falls back to the raw nanosecond count when the instant cannot be
    /// represented in the local time zone.
    pub fn to_local_iso8601(&self) -> String {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        match Local.timestamp_opt(secs, nanos).single() {
            Some(dt) => format!(
                "{}.{:07}{}",
                dt.format("%Y-%m-%dT%H:%M:%S"),
                nanos / 100,
                dt.format("%:z")
            ),
            None => self.0.to_string(),
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_local_iso8601())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Stat Layout - Fixed Counter Array of a Resource Set
// ----------------------------------------------------------------------------

/// Number of counters tracked per resource set
pub const NUM_STATS: usize = 36;

/// First index of the maximum (high-water mark) range; everything below is cumulative
pub const FIRST_MAXIMUM_STAT: usize = 34;

/// The counter array held by every bucket and every thread-cache slot
pub type StatArray = [i64; NUM_STATS];

/// All-zero counter array
pub const EMPTY_STATS: StatArray = [0; NUM_STATS];

/// One counter of a resource set.
///
/// The discriminant is the index into [`StatArray`]. Cumulative stats come
/// first and are merged by addition; gauges take negative deltas. The trailing
/// maximum stats are merged by taking the larger value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum ResourceSetStat {
    // ---- Gauges ----
    TotalMemory = 0,
    PersistentNonSharedSubscriptions = 1,
    NonpersistentNonSharedSubscriptions = 2,
    PersistentSharedSubscriptions = 3,
    NonpersistentSharedSubscriptions = 4,
    BufferedMsgs = 5,
    PersistentBufferedMsgBytes = 6,
    NonpersistentBufferedMsgBytes = 7,
    RetainedMsgs = 8,
    RetainedMsgBytes = 9,
    WillMsgs = 10,
    PersistentWillMsgBytes = 11,
    NonpersistentWillMsgBytes = 12,
    ActivePersistentClients = 13,
    ActiveNonpersistentClients = 14,
    PersistentClientStates = 15,

    // ---- Resettable counts ----
    Qos0MsgsPublished = 16,
    Qos1MsgsPublished = 17,
    Qos2MsgsPublished = 18,
    Qos0MsgBytesPublished = 19,
    Qos1MsgBytesPublished = 20,
    Qos2MsgBytesPublished = 21,
    DiscardedMsgs = 22,
    RejectedMsgs = 23,
    Connections = 24,

    // ---- Since-last-reset shadows ----
    Qos0MsgsPublishedToLastReset = 25,
    Qos1MsgsPublishedToLastReset = 26,
    Qos2MsgsPublishedToLastReset = 27,
    Qos0MsgBytesPublishedToLastReset = 28,
    Qos1MsgBytesPublishedToLastReset = 29,
    Qos2MsgBytesPublishedToLastReset = 30,
    DiscardedMsgsToLastReset = 31,
    RejectedMsgsToLastReset = 32,
    ConnectionsToLastReset = 33,

    // ---- Maximums ----
    MaxPublishRecipients = 34,
    MaxPublishRecipientsToLastReset = 35,
}

/// Resettable cumulative stats paired with their since-last-reset shadow
pub const RESETTABLE_CUMULATIVE: [(ResourceSetStat, ResourceSetStat); 9] = [
    (ResourceSetStat::Qos0MsgsPublished, ResourceSetStat::Qos0MsgsPublishedToLastReset),
    (ResourceSetStat::Qos1MsgsPublished, ResourceSetStat::Qos1MsgsPublishedToLastReset),
    (ResourceSetStat::Qos2MsgsPublished, ResourceSetStat::Qos2MsgsPublishedToLastReset),
    (ResourceSetStat::Qos0MsgBytesPublished, ResourceSetStat::Qos0MsgBytesPublishedToLastReset),
    (ResourceSetStat::Qos1MsgBytesPublished, ResourceSetStat::Qos1MsgBytesPublishedToLastReset),
    (ResourceSetStat::Qos2MsgBytesPublished, ResourceSetStat::Qos2MsgBytesPublishedToLastReset),
    (ResourceSetStat::DiscardedMsgs, ResourceSetStat::DiscardedMsgsToLastReset),
    (ResourceSetStat::RejectedMsgs, ResourceSetStat::RejectedMsgsToLastReset),
    (ResourceSetStat::Connections, ResourceSetStat::ConnectionsToLastReset),
];

/// Resettable maximum stats paired with their since-last-reset shadow
pub const RESETTABLE_MAXIMUM: [(ResourceSetStat, ResourceSetStat); 1] = [(
    ResourceSetStat::MaxPublishRecipients,
    ResourceSetStat::MaxPublishRecipientsToLastReset,
)];

const STAT_NAMES: [&str; NUM_STATS] = [
    "TotalMemory",
    "PersistentNonSharedSubscriptions",
    "NonpersistentNonSharedSubscriptions",
    "PersistentSharedSubscriptions",
    "NonpersistentSharedSubscriptions",
    "BufferedMsgs",
    "PersistentBufferedMsgBytes",
    "NonpersistentBufferedMsgBytes",
    "RetainedMsgs",
    "RetainedMsgBytes",
    "WillMsgs",
    "PersistentWillMsgBytes",
    "NonpersistentWillMsgBytes",
    "ActivePersistentClients",
    "ActiveNonpersistentClients",
    "PersistentClientStates",
    "Qos0MsgsPublished",
    "Qos1MsgsPublished",
    "Qos2MsgsPublished",
    "Qos0MsgBytesPublished",
    "Qos1MsgBytesPublished",
    "Qos2MsgBytesPublished",
    "DiscardedMsgs",
    "RejectedMsgs",
    "Connections",
    "Qos0MsgsPublishedToLastReset",
    "Qos1MsgsPublishedToLastReset",
    "Qos2MsgsPublishedToLastReset",
    "Qos0MsgBytesPublishedToLastReset",
    "Qos1MsgBytesPublishedToLastReset",
    "Qos2MsgBytesPublishedToLastReset",
    "DiscardedMsgsToLastReset",
    "RejectedMsgsToLastReset",
    "ConnectionsToLastReset",
    "MaxPublishRecipients",
    "MaxPublishRecipientsToLastReset",
];

impl ResourceSetStat {
    /// Every stat, in array order
    pub const ALL: [ResourceSetStat; NUM_STATS] = [
        Self::TotalMemory,
        Self::PersistentNonSharedSubscriptions,
        Self::NonpersistentNonSharedSubscriptions,
        Self::PersistentSharedSubscriptions,
        Self::NonpersistentSharedSubscriptions,
        Self::BufferedMsgs,
        Self::PersistentBufferedMsgBytes,
        Self::NonpersistentBufferedMsgBytes,
        Self::RetainedMsgs,
        Self::RetainedMsgBytes,
        Self::WillMsgs,
        Self::PersistentWillMsgBytes,
        Self::NonpersistentWillMsgBytes,
        Self::ActivePersistentClients,
        Self::ActiveNonpersistentClients,
        Self::PersistentClientStates,
        Self::Qos0MsgsPublished,
        Self::Qos1MsgsPublished,
        Self::Qos2MsgsPublished,
        Self::Qos0MsgBytesPublished,
        Self::Qos1MsgBytesPublished,
        Self::Qos2MsgBytesPublished,
        Self::DiscardedMsgs,
        Self::RejectedMsgs,
        Self::Connections,
        Self::Qos0MsgsPublishedToLastReset,
        Self::Qos1MsgsPublishedToLastReset,
        Self::Qos2MsgsPublishedToLastReset,
        Self::Qos0MsgBytesPublishedToLastReset,
        Self::Qos1MsgBytesPublishedToLastReset,
        Self::Qos2MsgBytesPublishedToLastReset,
        Self::DiscardedMsgsToLastReset,
        Self::RejectedMsgsToLastReset,
        Self::ConnectionsToLastReset,
        Self::MaxPublishRecipients,
        Self::MaxPublishRecipientsToLastReset,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn is_cumulative(self) -> bool {
        (self as usize) < FIRST_MAXIMUM_STAT
    }

    #[inline]
    pub const fn is_maximum(self) -> bool {
        !self.is_cumulative()
    }

    pub fn name(self) -> &'static str {
        STAT_NAMES[self.index()]
    }
}

impl Display for ResourceSetStat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceSetStat {
    type Err = ResourceStatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stat| stat.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ResourceStatsError::invalid_parameter(format!("unknown resource set stat '{}'", s)))
    }
}

// ----------------------------------------------------------------------------
// 3.3 Resource Set Statistics - The External View
// ----------------------------------------------------------------------------

/// Statistics of one resource set (or of the "other sets" aggregate) as seen
/// by queries and reports. Derived from a [`StatArray`] snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSetStatistics {
    pub total_memory_bytes: u64,
    pub subscriptions: u64,
    pub persistent_non_shared_subscriptions: u64,
    pub nonpersistent_non_shared_subscriptions: u64,
    pub persistent_shared_subscriptions: u64,
    pub nonpersistent_shared_subscriptions: u64,
    pub buffered_msgs: u64,
    pub discarded_msgs_since_restart: u64,
    pub discarded_msgs: u64,
    pub rejected_msgs_since_restart: u64,
    pub rejected_msgs: u64,
    pub retained_msgs: u64,
    pub will_msgs: u64,
    pub buffered_msg_bytes: u64,
    pub persistent_buffered_msg_bytes: u64,
    pub nonpersistent_buffered_msg_bytes: u64,
    pub retained_msg_bytes: u64,
    pub will_msg_bytes: u64,
    pub persistent_will_msg_bytes: u64,
    pub nonpersistent_will_msg_bytes: u64,
    pub published_msgs_since_restart: u64,
    pub published_msgs: u64,
    pub qos0_published_msgs: u64,
    pub qos1_published_msgs: u64,
    pub qos2_published_msgs: u64,
    pub published_msg_bytes_since_restart: u64,
    pub published_msg_bytes: u64,
    pub qos0_published_msg_bytes: u64,
    pub qos1_published_msg_bytes: u64,
    pub qos2_published_msg_bytes: u64,
    pub max_publish_recipients_since_restart: u64,
    pub max_publish_recipients: u64,
    pub connections_since_restart: u64,
    pub connections: u64,
    pub active_clients: u64,
    pub active_persistent_clients: u64,
    pub active_nonpersistent_clients: u64,
    pub persistent_client_states: u64,
}

/// Adds the named fields of `$other` into `$target`
macro_rules! sum_fields {
    ($target:expr, $other:expr; $($field:ident),+ $(,)?) => {
        $( $target.$field = $target.$field.saturating_add($other.$field); )+
    };
}

impl ResourceSetStatistics {
    /// Derive the external view. Gauges can be transiently negative while
    /// deltas from different threads are in flight; those read as zero.
    pub fn from_stats(stats: &StatArray) -> Self {
        use ResourceSetStat as S;
        let value = |stat: S| stats[stat.index()].max(0) as u64;

        let persistent_non_shared = value(S::PersistentNonSharedSubscriptions);
        let nonpersistent_non_shared = value(S::NonpersistentNonSharedSubscriptions);
        let persistent_shared = value(S::PersistentSharedSubscriptions);
        let nonpersistent_shared = value(S::NonpersistentSharedSubscriptions);

        let persistent_buffered_bytes = value(S::PersistentBufferedMsgBytes);
        let nonpersistent_buffered_bytes = value(S::NonpersistentBufferedMsgBytes);
        let persistent_will_bytes = value(S::PersistentWillMsgBytes);
        let nonpersistent_will_bytes = value(S::NonpersistentWillMsgBytes);

        let qos0_msgs = value(S::Qos0MsgsPublished);
        let qos1_msgs = value(S::Qos1MsgsPublished);
        let qos2_msgs = value(S::Qos2MsgsPublished);
        let published_msgs = qos0_msgs.saturating_add(qos1_msgs).saturating_add(qos2_msgs);
        let published_msgs_to_last_reset = value(S::Qos0MsgsPublishedToLastReset)
            .saturating_add(value(S::Qos1MsgsPublishedToLastReset))
            .saturating_add(value(S::Qos2MsgsPublishedToLastReset));

        let qos0_bytes = value(S::Qos0MsgBytesPublished);
        let qos1_bytes = value(S::Qos1MsgBytesPublished);
        let qos2_bytes = value(S::Qos2MsgBytesPublished);
        let published_bytes = qos0_bytes.saturating_add(qos1_bytes).saturating_add(qos2_bytes);
        let published_bytes_to_last_reset = value(S::Qos0MsgBytesPublishedToLastReset)
            .saturating_add(value(S::Qos1MsgBytesPublishedToLastReset))
            .saturating_add(value(S::Qos2MsgBytesPublishedToLastReset));

        let active_persistent = value(S::ActivePersistentClients);
        let active_nonpersistent = value(S::ActiveNonpersistentClients);
        let max_recipients = value(S::MaxPublishRecipients);

        Self {
            total_memory_bytes: value(S::TotalMemory),
            subscriptions: persistent_non_shared
                .saturating_add(nonpersistent_non_shared)
                .saturating_add(persistent_shared)
                .saturating_add(nonpersistent_shared),
            persistent_non_shared_subscriptions: persistent_non_shared,
            nonpersistent_non_shared_subscriptions: nonpersistent_non_shared,
            persistent_shared_subscriptions: persistent_shared,
            nonpersistent_shared_subscriptions: nonpersistent_shared,
            buffered_msgs: value(S::BufferedMsgs),
            discarded_msgs_since_restart: value(S::DiscardedMsgs)
                .saturating_add(value(S::DiscardedMsgsToLastReset)),
            discarded_msgs: value(S::DiscardedMsgs),
            rejected_msgs_since_restart: value(S::RejectedMsgs)
                .saturating_add(value(S::RejectedMsgsToLastReset)),
            rejected_msgs: value(S::RejectedMsgs),
            retained_msgs: value(S::RetainedMsgs),
            will_msgs: value(S::WillMsgs),
            buffered_msg_bytes: persistent_buffered_bytes.saturating_add(nonpersistent_buffered_bytes),
            persistent_buffered_msg_bytes: persistent_buffered_bytes,
            nonpersistent_buffered_msg_bytes: nonpersistent_buffered_bytes,
            retained_msg_bytes: value(S::RetainedMsgBytes),
            will_msg_bytes: persistent_will_bytes.saturating_add(nonpersistent_will_bytes),
            persistent_will_msg_bytes: persistent_will_bytes,
            nonpersistent_will_msg_bytes: nonpersistent_will_bytes,
            published_msgs_since_restart: published_msgs.saturating_add(published_msgs_to_last_reset),
            published_msgs,
            qos0_published_msgs: qos0_msgs,
            qos1_published_msgs: qos1_msgs,
            qos2_published_msgs: qos2_msgs,
            published_msg_bytes_since_restart: published_bytes.saturating_add(published_bytes_to_last_reset),
            published_msg_bytes: published_bytes,
            qos0_published_msg_bytes: qos0_bytes,
            qos1_published_msg_bytes: qos1_bytes,
            qos2_published_msg_bytes: qos2_bytes,
            max_publish_recipients_since_restart: max_recipients
                .max(value(S::MaxPublishRecipientsToLastReset)),
            max_publish_recipients: max_recipients,
            connections_since_restart: value(S::Connections)
                .saturating_add(value(S::ConnectionsToLastReset)),
            connections: value(S::Connections),
            active_clients: active_persistent.saturating_add(active_nonpersistent),
            active_persistent_clients: active_persistent,
            active_nonpersistent_clients: active_nonpersistent,
            persistent_client_states: value(S::PersistentClientStates),
        }
    }

    /// Fold another set into this aggregate: counts and gauges add,
    /// publish fan-out keeps the widest value seen. Since-restart totals are
    /// left untouched, so an aggregate only covers the current interval.
    pub fn accumulate(&mut self, other: &ResourceSetStatistics) {
        sum_fields!(self, other;
            total_memory_bytes,
            subscriptions,
            persistent_non_shared_subscriptions,
            nonpersistent_non_shared_subscriptions,
            persistent_shared_subscriptions,
            nonpersistent_shared_subscriptions,
            buffered_msgs,
            discarded_msgs,
            rejected_msgs,
            retained_msgs,
            will_msgs,
            buffered_msg_bytes,
            persistent_buffered_msg_bytes,
            nonpersistent_buffered_msg_bytes,
            retained_msg_bytes,
            will_msg_bytes,
            persistent_will_msg_bytes,
            nonpersistent_will_msg_bytes,
            published_msgs,
            qos0_published_msgs,
            qos1_published_msgs,
            qos2_published_msgs,
            published_msg_bytes,
            qos0_published_msg_bytes,
            qos1_published_msg_bytes,
            qos2_published_msg_bytes,
            connections,
            active_clients,
            active_persistent_clients,
            active_nonpersistent_clients,
            persistent_client_states,
        );
        self.max_publish_recipients = self.max_publish_recipients.max(other.max_publish_recipients);
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every operation of the engine:
// - Configuration and pattern errors are fatal at init
// - Query and request errors are reported to the caller
// - Recovery hints for the caller via is_recoverable()
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for resource set accounting.
#[derive(Error, Debug)]
pub enum ResourceStatsError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Table Errors ----
    #[error("Allocation failed while creating resource set '{resource_set_id}'")]
    Allocation { resource_set_id: String },

    // ---- Query & Request Errors ----
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("A resource set report request is already in progress")]
    AlreadyInProgress,

    #[error("Resource set reporting is not running")]
    ReportingDisabled,

    // ---- Thread Lifecycle Errors ----
    #[error("Failed to start thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Reporting thread did not end within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResourceStatsError {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        ResourceStatsError::InvalidParameter {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ResourceStatsError::Config(_) => false,
            ResourceStatsError::Allocation { .. } => true,
            ResourceStatsError::InvalidParameter { .. } => true,
            ResourceStatsError::AlreadyInProgress => true,
            ResourceStatsError::ReportingDisabled => false,
            ResourceStatsError::ThreadSpawn { .. } => false,
            ResourceStatsError::ShutdownTimeout { .. } => false,
            ResourceStatsError::Io(_) => true,
            ResourceStatsError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ResourceStatsError::Config(_) => "config",
            ResourceStatsError::Allocation { .. } => "allocation",
            ResourceStatsError::InvalidParameter { .. } => "invalid_parameter",
            ResourceStatsError::AlreadyInProgress => "already_in_progress",
            ResourceStatsError::ReportingDisabled => "reporting_disabled",
            ResourceStatsError::ThreadSpawn { .. } => "thread",
            ResourceStatsError::ShutdownTimeout { .. } => "shutdown",
            ResourceStatsError::Io(_) => "io",
            ResourceStatsError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String, source: Option<Box<dyn StdError + Send + Sync>> },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid pattern for '{field}' ({pattern}): {message}")]
    InvalidPattern { field: String, pattern: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_pattern(field: impl Into<String>, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidPattern {
            field: field.into(),
            pattern: pattern.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for engine operations
pub type ResourceStatsResult<T> = Result<T, ResourceStatsError>;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// The one-time configuration read at engine start:
// - TOML file parsing with environment variable overrides
// - Environment-specific schedule defaults (standard vs IoT)
// - Validation of extraction patterns before anything is tracked
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the resource set statistics engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatsConfig {
    /// Which activity is attributed to which resource set
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Scheduled and on-demand reporting
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ResourceStatsConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RESOURCE_STATS_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: None,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: Some(Box::new(e)),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.tracking.initial_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "tracking.initial_capacity",
                "Initial table capacity must be at least 1",
            ));
        }

        // Patterns are compiled here so a bad pattern fails at load, not at start
        IdentifierResolver::new(&self.tracking.client_id_pattern, &self.tracking.topic_pattern)?;
        if let Some(pattern) = &self.tracking.mem_trace_set_id {
            WildcardPattern::new(pattern).map_err(|e| {
                ConfigError::invalid_pattern("tracking.mem_trace_set_id", pattern.as_str(), e.to_string())
            })?;
        }

        if self.reporting.shutdown_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "reporting.shutdown_timeout",
                "Shutdown timeout must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Tracking Configuration
// ----------------------------------------------------------------------------

/// How resource set identifiers are extracted from client ids and topics.
/// Tracking is disabled when both patterns are empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Regex applied to client ids; capture group 1 is the resource set id
    #[serde(default)]
    pub client_id_pattern: String,

    /// Regex applied to topics when the client id pattern does not match
    #[serde(default)]
    pub topic_pattern: String,

    /// Attribute unmatched activity to the default resource set
    #[serde(default = "default_true")]
    pub track_unmatched: bool,

    /// Wildcard (`*`) selecting resource sets whose memory changes are traced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_trace_set_id: Option<String>,

    /// Initial capacity of the resource set table
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            client_id_pattern: String::new(),
            topic_pattern: String::new(),
            track_unmatched: true,
            mem_trace_set_id: None,
            initial_capacity: default_initial_capacity(),
        }
    }
}

impl TrackingConfig {
    /// Whether any extraction pattern is configured
    pub fn is_enabled(&self) -> bool {
        !self.client_id_pattern.is_empty() || !self.topic_pattern.is_empty()
    }
}

fn default_true() -> bool {
    true
}

fn default_initial_capacity() -> usize {
    INITIAL_TABLE_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.3 Reporting Configuration
// ----------------------------------------------------------------------------

/// Deployment flavour; decides which reports are scheduled by default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportingEnvironment {
    #[default]
    Standard,
    Iot,
}

impl ReportingEnvironment {
    /// Default (weekly, daily, hourly) stat types
    pub fn default_stat_types(self) -> (&'static str, &'static str, &'static str) {
        match self {
            ReportingEnvironment::Standard => ("None", "None", "None"),
            ReportingEnvironment::Iot => ("AllUnsorted", "TotalMemoryBytesHighest", "TotalMemoryBytesHighest"),
        }
    }
}

impl Display for ReportingEnvironment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReportingEnvironment::Standard => write!(f, "standard"),
            ReportingEnvironment::Iot => write!(f, "iot"),
        }
    }
}

/// Reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Start the reporting thread when tracking is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub environment: ReportingEnvironment,

    /// Identity of this server; seeds the minutes-past-the-hour jitter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_uid: Option<String>,

    /// Minutes past the hour at which scheduled reports run.
    /// Absent or negative means derive it from the server uid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_past_hour: Option<i64>,

    /// How long shutdown waits for the reporting thread
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub weekly: WeeklyReportConfig,

    #[serde(default)]
    pub daily: DailyReportConfig,

    #[serde(default)]
    pub hourly: HourlyReportConfig,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: ReportingEnvironment::default(),
            server_uid: None,
            minutes_past_hour: None,
            shutdown_timeout: default_shutdown_timeout(),
            weekly: WeeklyReportConfig::default(),
            daily: DailyReportConfig::default(),
            hourly: HourlyReportConfig::default(),
        }
    }
}

impl ReportingConfig {
    /// Resolve the configured values into the schedule the reporting thread runs
    pub fn schedule(&self) -> ReportSchedule {
        let (weekly_type, daily_type, hourly_type) = self.environment.default_stat_types();

        let weekly = ScheduledReport {
            monitor_type: configured_monitor_type("reporting.weekly.stat_type", self.weekly.stat_type.as_deref(), weekly_type),
            max_results: self.weekly.max_results,
            reset_stats: self.weekly.reset_stats,
        };
        let daily = ScheduledReport {
            monitor_type: configured_monitor_type("reporting.daily.stat_type", self.daily.stat_type.as_deref(), daily_type),
            max_results: self.daily.max_results,
            reset_stats: self.daily.reset_stats,
        };
        let hourly = ScheduledReport {
            monitor_type: configured_monitor_type("reporting.hourly.stat_type", self.hourly.stat_type.as_deref(), hourly_type),
            max_results: self.hourly.max_results,
            reset_stats: self.hourly.reset_stats,
        };

        let any_scheduled = weekly.is_enabled() || daily.is_enabled() || hourly.is_enabled();

        ReportSchedule {
            weekly,
            weekly_day: self.weekly.day_of_week % 7,
            weekly_hour: self.weekly.hour_of_day % 24,
            daily,
            daily_hour: self.daily.hour_of_day % 24,
            hourly,
            minutes_past: resolve_minutes_past(self.minutes_past_hour, any_scheduled, self.server_uid.as_deref()),
        }
    }
}

fn configured_monitor_type(field: &str, configured: Option<&str>, fallback: &str) -> MonitorType {
    let text = configured.unwrap_or(fallback);
    let monitor_type = MonitorType::from_stat_type(text, false);
    if monitor_type == MonitorType::None && !text.eq_ignore_ascii_case(MonitorType::None.stat_type()) {
        warn!(target: "resource_stats::init", field, stat_type = text, "Unrecognized StatType, report disabled");
    }
    monitor_type
}

/// Minutes past the hour for scheduled reports.
///
/// A configured non-negative value wins (taken modulo 60). Otherwise, when
/// anything is scheduled, instances spread over `15..=45` by hashing their
/// server uid so a fleet does not report in lockstep.
pub fn resolve_minutes_past(configured: Option<i64>, any_scheduled: bool, server_uid: Option<&str>) -> Option<u32> {
    match configured {
        Some(minutes) if minutes >= 0 => Some((minutes % 60) as u32),
        _ if any_scheduled => Some(match server_uid {
            Some(uid) => MINUTES_PAST_BASE + resource_set_hash(uid) % MINUTES_PAST_SPREAD,
            None => MINUTES_PAST_BASE,
        }),
        _ => None,
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
}

/// Weekly report settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyReportConfig {
    /// StatType name; absent means the environment default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_type: Option<String>,

    /// 0 = Sunday
    #[serde(default)]
    pub day_of_week: u32,

    #[serde(default)]
    pub hour_of_day: u32,

    #[serde(default = "default_weekly_max_results")]
    pub max_results: u32,

    #[serde(default)]
    pub reset_stats: bool,
}

impl Default for WeeklyReportConfig {
    fn default() -> Self {
        Self {
            stat_type: None,
            day_of_week: 0,
            hour_of_day: 0,
            max_results: default_weekly_max_results(),
            reset_stats: false,
        }
    }
}

/// Daily report settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_type: Option<String>,

    #[serde(default)]
    pub hour_of_day: u32,

    #[serde(default = "default_daily_max_results")]
    pub max_results: u32,

    #[serde(default)]
    pub reset_stats: bool,
}

impl Default for DailyReportConfig {
    fn default() -> Self {
        Self {
            stat_type: None,
            hour_of_day: 0,
            max_results: default_daily_max_results(),
            reset_stats: false,
        }
    }
}

/// Hourly report settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyReportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_type: Option<String>,

    #[serde(default = "default_hourly_max_results")]
    pub max_results: u32,

    #[serde(default)]
    pub reset_stats: bool,
}

impl Default for HourlyReportConfig {
    fn default() -> Self {
        Self {
            stat_type: None,
            max_results: default_hourly_max_results(),
            reset_stats: false,
        }
    }
}

fn default_weekly_max_results() -> u32 {
    DEFAULT_WEEKLY_MAX_RESULTS
}

fn default_daily_max_results() -> u32 {
    DEFAULT_DAILY_MAX_RESULTS
}

fn default_hourly_max_results() -> u32 {
    DEFAULT_HOURLY_MAX_RESULTS
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through tracing. Every event carries a target under
// `resource_stats::` so report records can be routed apart from diagnostics.
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> ResourceStatsResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ResourceStatsError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ResourceStatsError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ResourceStatsError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "resource_stats::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: RESOURCE SET TABLE & IDENTIFIER RESOLUTION
// ============================================================================
// The shared state of resource set accounting:
// - xor-djb2 identifier hashing for the table and the report jitter
// - Buckets of counters, each behind its own short lock
// - A capacity-seeded table behind a reader/writer lock
// - Regex extraction of resource set ids from client ids and topics
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Resource Set Hasher - xor-djb2
// ----------------------------------------------------------------------------

/// xor-djb2: `h = h * 33 ^ byte` from a seed of 5381, with bytes read as
/// signed chars so ids outside ASCII hash the same as on the broker.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSetHasher(u32);

impl Default for ResourceSetHasher {
    fn default() -> Self {
        Self(RESOURCE_SET_HASH_SEED)
    }
}

impl Hasher for ResourceSetHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 = self.0.wrapping_mul(33) ^ (byte as i8 as i32 as u32);
        }
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

/// Build hasher for the resource set table
pub type ResourceSetBuildHasher = BuildHasherDefault<ResourceSetHasher>;

/// Hash of an identifier's bytes
#[inline]
pub fn resource_set_hash(id: &str) -> u32 {
    let mut hasher = ResourceSetHasher::default();
    hasher.write(id.as_bytes());
    hasher.0
}

// ----------------------------------------------------------------------------
// 7.2 Wildcard Patterns - `*` Matching for Filters and Memory Tracing
// ----------------------------------------------------------------------------

/// A simple wildcard where `*` matches any run of characters
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    pattern: String,
    regex: Regex,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let translated = regex::escape(pattern).replace(r"\*", ".*");
        let regex = Regex::new(&format!("^{}$", translated))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    #[inline]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

// ----------------------------------------------------------------------------
// 7.3 Resource Set - A Named Bucket of Counters
// ----------------------------------------------------------------------------

/// Shared handle to a resource set. Buckets are never removed individually,
/// so handles stay valid for the life of the table.
pub type ResourceSetHandle = Arc<ResourceSet>;

/// A resource set: an immutable identifier plus counters guarded by a lock
/// that is only held for the length of one merge, reset or snapshot.
#[derive(Debug)]
pub struct ResourceSet {
    id: CompactString,
    trace_memory: bool,
    stats: Mutex<StatArray>,
}

impl ResourceSet {
    pub fn new(id: &str, trace_memory: bool) -> Self {
        Self {
            id: CompactString::from(id),
            trace_memory,
            stats: Mutex::new(EMPTY_STATS),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether memory changes of this set are emitted as trace events
    #[inline]
    pub fn is_memory_traced(&self) -> bool {
        self.trace_memory
    }

    /// Copy of the counters
    pub fn snapshot(&self) -> StatArray {
        *self.stats.lock()
    }

    /// Current value of one counter
    pub fn value(&self, stat: ResourceSetStat) -> i64 {
        self.stats.lock()[stat.index()]
    }

    pub fn statistics(&self) -> ResourceSetStatistics {
        ResourceSetStatistics::from_stats(&self.snapshot())
    }

    /// Fold a thread's private deltas into the shared counters:
    /// cumulative stats add, maximum stats keep the larger value.
    pub fn merge(&self, local: &StatArray) {
        let memory_total = {
            let mut stats = self.stats.lock();
            for index in 0..FIRST_MAXIMUM_STAT {
                stats[index] = stats[index].wrapping_add(local[index]);
            }
            for index in FIRST_MAXIMUM_STAT..NUM_STATS {
                stats[index] = stats[index].max(local[index]);
            }
            stats[ResourceSetStat::TotalMemory.index()]
        };

        let memory_delta = local[ResourceSetStat::TotalMemory.index()];
        if self.trace_memory && memory_delta != 0 {
            trace!(
                target: "resource_stats::memtrace",
                resource_set = %self.id,
                delta = memory_delta,
                total = memory_total,
                "Resource set memory changed"
            );
        }
    }

    /// Fold resettable stats into their since-last-reset shadows and zero them.
    /// Gauges are untouched.
    pub fn reset(&self) {
        let mut stats = self.stats.lock();
        for (current, shadow) in RESETTABLE_CUMULATIVE {
            stats[shadow.index()] = stats[shadow.index()].wrapping_add(stats[current.index()]);
            stats[current.index()] = 0;
        }
        for (current, shadow) in RESETTABLE_MAXIMUM {
            stats[shadow.index()] = stats[shadow.index()].max(stats[current.index()]);
            stats[current.index()] = 0;
        }
    }
}

// ----------------------------------------------------------------------------
// 7.4 Resource Set Table - Get-or-Create Under a Reader/Writer Lock
// ----------------------------------------------------------------------------

struct TableInner {
    sets: FastHashMap<CompactString, ResourceSetHandle, ResourceSetBuildHasher>,
    reset_time: Timestamp,
}

/// Concurrent table of resource sets.
///
/// Lookups and enumerations share the read lock; inserts, resets and teardown
/// take the write lock. Bucket locks are always taken inside the table lock,
/// never the other way round.
pub struct ResourceSetTable {
    inner: RwLock<TableInner>,
    default_set: Option<ResourceSetHandle>,
    mem_trace: Option<WildcardPattern>,
    discarded_creations: AtomicU64,
}

impl Debug for ResourceSetTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSetTable")
            .field("len", &self.len())
            .field("default_set", &self.default_set.as_ref().map(|set| set.id()))
            .field("mem_trace", &self.mem_trace.as_ref().map(WildcardPattern::as_str))
            .finish()
    }
}

impl ResourceSetTable {
    pub fn new(capacity: usize, track_unmatched: bool, mem_trace: Option<WildcardPattern>) -> Self {
        let default_set = track_unmatched.then(|| {
            let traced = mem_trace.as_ref().map_or(false, |p| p.is_match(DEFAULT_RESOURCE_SET_ID));
            Arc::new(ResourceSet::new(DEFAULT_RESOURCE_SET_ID, traced))
        });

        Self {
            inner: RwLock::new(TableInner {
                sets: FastHashMap::with_capacity_and_hasher(capacity, ResourceSetBuildHasher::default()),
                reset_time: Timestamp::now(),
            }),
            default_set,
            mem_trace,
            discarded_creations: AtomicU64::new(0),
        }
    }

    /// The bucket for unmatched activity, if one is tracked
    pub fn default_set(&self) -> Option<&ResourceSetHandle> {
        self.default_set.as_ref()
    }

    pub fn lookup(&self, id: &str) -> Option<ResourceSetHandle> {
        self.inner.read().sets.get(id).cloned()
    }

    /// Return the set for `id`, creating it on first use.
    ///
    /// The new bucket is built before the write lock is taken. If another
    /// thread inserted the same id in the meantime, the freshly built bucket
    /// is dropped and the winner's handle returned.
    pub fn get_or_create(&self, id: &str) -> ResourceStatsResult<ResourceSetHandle> {
        if let Some(existing) = self.lookup(id) {
            return Ok(existing);
        }

        let traced = self.mem_trace.as_ref().map_or(false, |p| p.is_match(id));
        let created = Arc::new(ResourceSet::new(id, traced));

        let mut inner = self.inner.write();
        if let Some(existing) = inner.sets.get(id) {
            let existing = Arc::clone(existing);
            drop(inner);
            self.discarded_creations.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(target: "resource_stats::table", resource_set = id, "Lost creation race, using existing resource set");
            return Ok(existing);
        }

        inner.sets.try_reserve(1).map_err(|_| {
            error!(target: "resource_stats::table", resource_set = id, "Unable to grow resource set table");
            ResourceStatsError::Allocation {
                resource_set_id: id.to_string(),
            }
        })?;
        inner.sets.insert(CompactString::from(id), Arc::clone(&created));
        let total = inner.sets.len();
        drop(inner);

        if traced {
            info!(target: "resource_stats::memtrace", resource_set = id, "Tracing memory of resource set");
        }
        debug!(target: "resource_stats::table", resource_set = id, total, "Created resource set");
        Ok(created)
    }

    /// Visit the default set (if any) then every set, under the read lock.
    pub fn enumerate<F>(&self, mut visit: F)
    where
        F: FnMut(&ResourceSetHandle, Timestamp),
    {
        let inner = self.inner.read();
        if let Some(default_set) = &self.default_set {
            visit(default_set, inner.reset_time);
        }
        for set in inner.sets.values() {
            visit(set, inner.reset_time);
        }
    }

    /// Visit the one set named `id`, which may be the default set.
    pub fn enumerate_single<F>(&self, id: &str, mut visit: F)
    where
        F: FnMut(&ResourceSetHandle, Timestamp),
    {
        let inner = self.inner.read();
        let found = inner.sets.get(id).or_else(|| {
            self.default_set
                .as_ref()
                .filter(|default_set| default_set.id() == id)
        });
        if let Some(set) = found {
            visit(set, inner.reset_time);
        }
    }

    /// Reset every set as one event: no flush or query can observe some sets
    /// reset and others not. Records the new reset time.
    pub fn reset_all(&self) -> Timestamp {
        let mut inner = self.inner.write();
        if let Some(default_set) = &self.default_set {
            default_set.reset();
        }
        for set in inner.sets.values() {
            set.reset();
        }
        inner.reset_time = Timestamp::now();
        let reset_time = inner.reset_time;
        let count = inner.sets.len();
        drop(inner);

        info!(target: "resource_stats::reset", resource_sets = count, reset_time = %reset_time, "Resource set statistics reset");
        reset_time
    }

    /// Drop every set. Only for teardown: outstanding handles stay valid but
    /// are no longer reachable from the table.
    pub fn destroy_all(&self) {
        let mut inner = self.inner.write();
        let count = inner.sets.len();
        inner.sets.clear();
        inner.sets.shrink_to_fit();
        drop(inner);
        debug!(target: "resource_stats::table", resource_sets = count, "Destroyed resource set table");
    }

    /// Number of sets in the table, excluding the default set
    pub fn len(&self) -> usize {
        self.inner.read().sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset_time(&self) -> Timestamp {
        self.inner.read().reset_time
    }

    /// Buckets built and then dropped because another thread won the insert
    pub fn discarded_creations(&self) -> u64 {
        self.discarded_creations.load(AtomicOrdering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// 7.5 Identifier Resolver - Client Id / Topic Extraction
// ----------------------------------------------------------------------------

/// Whether resolving an id may create a missing resource set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    LookupOnly,
    LookupOrCreate,
}

/// Extracts resource set ids with the first capture group of the configured
/// client id pattern, falling back to the topic pattern.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    client_id: Option<Regex>,
    topic: Option<Regex>,
}

impl IdentifierResolver {
    /// Compile the extraction patterns. `Ok(None)` when both are empty.
    pub fn new(client_id_pattern: &str, topic_pattern: &str) -> ConfigResult<Option<Self>> {
        let client_id = compile_extraction_pattern("tracking.client_id_pattern", client_id_pattern)?;
        let topic = compile_extraction_pattern("tracking.topic_pattern", topic_pattern)?;

        if client_id.is_none() && topic.is_none() {
            return Ok(None);
        }
        Ok(Some(Self { client_id, topic }))
    }

    /// Resource set id for this activity, or `None` when neither pattern matches.
    pub fn extract<'a>(&self, client_id: Option<&'a str>, topic: Option<&'a str>) -> Option<&'a str> {
        let from_client = match (&self.client_id, client_id) {
            (Some(pattern), Some(text)) => first_capture(pattern, text),
            _ => None,
        };
        from_client
            .or_else(|| match (&self.topic, topic) {
                (Some(pattern), Some(text)) => first_capture(pattern, text),
                _ => None,
            })
            .map(truncate_identifier)
    }
}

fn compile_extraction_pattern(field: &str, pattern: &str) -> ConfigResult<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    let regex = Regex::new(pattern).map_err(|e| ConfigError::invalid_pattern(field, pattern, e.to_string()))?;
    // captures_len counts the implicit whole-match group
    if regex.captures_len() < 2 {
        return Err(ConfigError::invalid_pattern(field, pattern, "pattern needs at least one capture group"));
    }
    Ok(Some(regex))
}

fn first_capture<'a>(pattern: &Regex, text: &'a str) -> Option<&'a str> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str())
}

/// Cut an identifier to [`MAX_RESOURCE_SET_ID_LENGTH`] bytes, backing off to
/// the previous character boundary.
pub fn truncate_identifier(id: &str) -> &str {
    if id.len() <= MAX_RESOURCE_SET_ID_LENGTH {
        return id;
    }
    let mut end = MAX_RESOURCE_SET_ID_LENGTH;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

// ----------------------------------------------------------------------------
// 7.6 Resource Set Stats - The Control Object
// ----------------------------------------------------------------------------

/// Owns everything resource set accounting needs. Exists only while tracking
/// is enabled, and is shared by `Arc` with the reporting thread and callers.
#[derive(Debug)]
pub struct ResourceSetStats {
    table: ResourceSetTable,
    resolver: IdentifierResolver,
    restart_time: Timestamp,
}

impl ResourceSetStats {
    /// Start tracking. `Ok(None)` when no extraction pattern is configured,
    /// in which case nothing is tracked at all.
    pub fn init(config: &TrackingConfig) -> ResourceStatsResult<Option<Arc<Self>>> {
        let resolver = match IdentifierResolver::new(&config.client_id_pattern, &config.topic_pattern)? {
            Some(resolver) => resolver,
            None => {
                info!(target: "resource_stats::init", "No resource set patterns configured, tracking disabled");
                return Ok(None);
            }
        };

        let mem_trace = match config.mem_trace_set_id.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(WildcardPattern::new(pattern).map_err(|e| {
                ConfigError::invalid_pattern("tracking.mem_trace_set_id", pattern, e.to_string())
            })?),
            _ => None,
        };

        let table = ResourceSetTable::new(config.initial_capacity.max(1), config.track_unmatched, mem_trace);

        info!(
            target: "resource_stats::init",
            client_id_pattern = %config.client_id_pattern,
            topic_pattern = %config.topic_pattern,
            track_unmatched = config.track_unmatched,
            capacity = config.initial_capacity,
            "Resource set tracking enabled"
        );

        Ok(Some(Arc::new(Self {
            table,
            resolver,
            restart_time: Timestamp::now(),
        })))
    }

    /// The resource set this activity is attributed to.
    ///
    /// Unmatched activity goes to the default set when one is tracked.
    /// `LookupOnly` never creates a set and yields `None` for unknown ids.
    pub fn resolve(
        &self,
        client_id: Option<&str>,
        topic: Option<&str>,
        mode: ResolveMode,
    ) -> ResourceStatsResult<Option<ResourceSetHandle>> {
        match self.resolver.extract(client_id, topic) {
            Some(id) => match mode {
                ResolveMode::LookupOnly => Ok(self.table.lookup(id)),
                ResolveMode::LookupOrCreate => self.table.get_or_create(id).map(Some),
            },
            None => Ok(self.table.default_set().cloned()),
        }
    }

    pub fn table(&self) -> &ResourceSetTable {
        &self.table
    }

    pub fn default_set(&self) -> Option<&ResourceSetHandle> {
        self.table.default_set()
    }

    pub fn restart_time(&self) -> Timestamp {
        self.restart_time
    }

    pub fn reset_time(&self) -> Timestamp {
        self.table.reset_time()
    }

    pub fn reset_all(&self) -> Timestamp {
        self.table.reset_all()
    }

    /// Tear the table down. Handles held elsewhere remain usable.
    pub fn destroy(&self) {
        self.table.destroy_all();
    }
}

// ============================================================================
// SECTION 8: THREAD-LOCAL CACHE
// ============================================================================
// Each worker thread keeps private deltas for up to three resource sets so
// that hot-path updates take no shared lock at all. The first two slots are
// sticky; the third is flushed and rebound whenever a new set is needed.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Cache Slot
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct CacheSlot {
    set: Option<ResourceSetHandle>,
    local: StatArray,
}

impl CacheSlot {
    const fn empty() -> Self {
        Self {
            set: None,
            local: EMPTY_STATS,
        }
    }

    /// Cumulative stats add, high-water marks keep the larger value
    fn apply(&mut self, stat: ResourceSetStat, value: i64) {
        let local = &mut self.local[stat.index()];
        if stat.is_cumulative() {
            *local = local.wrapping_add(value);
        } else {
            *local = (*local).max(value);
        }
    }

    fn flush(&mut self) {
        if let Some(set) = self.set.take() {
            set.merge(&self.local);
            self.local = EMPTY_STATS;
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Thread Cache
// ----------------------------------------------------------------------------

/// Per-thread deltas for up to [`THREAD_CACHE_SLOTS`] resource sets.
///
/// Dropping the cache flushes it, so a thread that owns one never loses
/// deltas on a graceful exit.
#[derive(Debug)]
pub struct ThreadCache {
    slots: [CacheSlot; THREAD_CACHE_SLOTS],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| CacheSlot::empty()),
        }
    }

    /// Slot holding `set`, binding it first if needed. When every slot is in
    /// use, the last (non-sticky) slot is flushed and rebound.
    pub fn resolve_slot(&mut self, set: &ResourceSetHandle) -> usize {
        if let Some(index) = self.slot_of(set) {
            return index;
        }

        let index = match self.slots.iter().position(|slot| slot.set.is_none()) {
            Some(free) => free,
            None => {
                trace!(
                    target: "resource_stats::cache",
                    evicted = self.slots[THREAD_CACHE_EVICTION_SLOT].set.as_ref().map(|s| s.id()),
                    incoming = set.id(),
                    "Evicting thread cache slot"
                );
                self.slots[THREAD_CACHE_EVICTION_SLOT].flush();
                THREAD_CACHE_EVICTION_SLOT
            }
        };
        self.slots[index].set = Some(Arc::clone(set));
        index
    }

    /// Record `value` against `stat` in a slot returned by [`resolve_slot`].
    ///
    /// [`resolve_slot`]: ThreadCache::resolve_slot
    pub fn accumulate_in(&mut self, slot: usize, stat: ResourceSetStat, value: i64) -> ResourceStatsResult<()> {
        let cache_slot = self.slots.get_mut(slot).filter(|s| s.set.is_some()).ok_or_else(|| {
            error!(target: "resource_stats::cache", slot, stat = %stat, value, "Update against an unbound thread cache slot");
            ResourceStatsError::Internal(format!("thread cache slot {} is not bound to a resource set", slot))
        })?;

        cache_slot.apply(stat, value);
        Ok(())
    }

    /// Resolve the slot for `set` and record the update in it
    pub fn accumulate(&mut self, set: &ResourceSetHandle, stat: ResourceSetStat, value: i64) {
        let slot = self.resolve_slot(set);
        self.slots[slot].apply(stat, value);
    }

    pub fn flush_slot(&mut self, slot: usize) {
        if let Some(cache_slot) = self.slots.get_mut(slot) {
            cache_slot.flush();
        }
    }

    /// Push every pending delta into its resource set and free all slots
    pub fn flush_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.flush();
        }
    }

    /// Index of the slot bound to `set`
    pub fn slot_of(&self, set: &ResourceSetHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.set.as_ref().map_or(false, |bound| Arc::ptr_eq(bound, set)))
    }

    /// Resource set bound to `slot`
    pub fn bound_set(&self, slot: usize) -> Option<&ResourceSetHandle> {
        self.slots.get(slot).and_then(|s| s.set.as_ref())
    }

    /// Unflushed delta for `stat` in `slot`
    pub fn pending(&self, slot: usize, stat: ResourceSetStat) -> i64 {
        self.slots.get(slot).map_or(0, |s| s.local[stat.index()])
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.set.is_none())
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.flush_all();
    }
}

// ----------------------------------------------------------------------------
// 8.3 Per-Thread Convenience
// ----------------------------------------------------------------------------

thread_local! {
    static THREAD_CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new());
}

/// Run `f` against the calling thread's cache. The cache is flushed when the
/// thread exits. Not reentrant: `f` must not call back into this function.
pub fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    THREAD_CACHE.with(|cache| f(&mut cache.borrow_mut()))
}

/// Flush the calling thread's cache
pub fn flush_thread_cache() {
    with_thread_cache(ThreadCache::flush_all);
}

/// Record an update for `set` through the calling thread's cache
pub fn record_stat(set: &ResourceSetHandle, stat: ResourceSetStat, value: i64) {
    with_thread_cache(|cache| cache.accumulate(set, stat, value));
}

// ============================================================================
// SECTION 9: MONITOR TYPES & STATTYPE MAPPING
// ============================================================================
// Monitor types share the broker-wide numbering, so numeric StatTypes pass
// straight through. Only the subset with a resource set sort has a name here;
// every other code maps to "None" and is rejected by resource set queries.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Monitor Type
// ----------------------------------------------------------------------------

/// How monitoring results are selected and ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MonitorType {
    HighestBufferedMsgs = 0,
    LowestBufferedMsgs = 1,
    HighestBufferedMsgBytes = 2,
    HighestPersistentBufferedMsgBytes = 3,
    HighestNonpersistentBufferedMsgBytes = 4,
    HighestBufferedPercent = 5,
    LowestBufferedPercent = 6,
    HighestRejectedMsgs = 7,
    LowestRejectedMsgs = 8,
    OldestLastConnectedTime = 9,
    HighestPublishedMsgs = 10,
    LowestPublishedMsgs = 11,
    HighestPublishedQos0Msgs = 12,
    HighestPublishedQos1Msgs = 13,
    HighestPublishedQos2Msgs = 14,
    HighestPublishedMsgBytes = 15,
    HighestPublishedQos0MsgBytes = 16,
    HighestPublishedQos1MsgBytes = 17,
    HighestPublishedQos2MsgBytes = 18,
    HighestMaxPublishRecipients = 19,
    HighestSubscriptions = 20,
    LowestSubscriptions = 21,
    HighestPersistentNonSharedSubscriptions = 22,
    HighestNonpersistentNonSharedSubscriptions = 23,
    HighestPersistentSharedSubscriptions = 24,
    HighestNonpersistentSharedSubscriptions = 25,
    HighestFailedPublishes = 26,
    LowestFailedPublishes = 27,
    HighestProducers = 28,
    LowestProducers = 29,
    HighestConsumers = 30,
    LowestConsumers = 31,
    HighestConsumedMsgs = 32,
    LowestConsumedMsgs = 33,
    HighestProducedMsgs = 34,
    LowestProducedMsgs = 35,
    AllUnsorted = 36,
    HighestBufferedHwmPercent = 37,
    LowestBufferedHwmPercent = 38,
    OldestStateChange = 39,
    HighestExpiredMsgs = 40,
    LowestExpiredMsgs = 41,
    HighestDiscardedMsgs = 42,
    LowestDiscardedMsgs = 43,
    HighestTotalMemoryBytes = 44,
    HighestRetainedMsgs = 45,
    HighestRetainedMsgBytes = 46,
    HighestWillMsgs = 47,
    HighestWillMsgBytes = 48,
    HighestPersistentWillMsgBytes = 49,
    HighestNonpersistentWillMsgBytes = 50,
    HighestConnections = 51,
    HighestActiveClients = 52,
    HighestActivePersistentClients = 53,
    HighestActiveNonpersistentClients = 54,
    HighestPersistentClientStates = 55,
    None = 56,
    FakeHourly = 57,
    FakeDaily = 58,
    FakeWeekly = 59,
}

/// Highest externally visible monitor type code
pub const MONITOR_TYPE_MAX: u32 = MonitorType::HighestPersistentClientStates as u32;

/// Name of every resource set monitor type, plus the special names
const MONITOR_TYPE_CATALOG: [(MonitorType, &str); 37] = [
    (MonitorType::HighestBufferedMsgs, "BufferedMsgsHighest"),
    (MonitorType::HighestBufferedMsgBytes, "BufferedMsgBytesHighest"),
    (MonitorType::HighestPersistentBufferedMsgBytes, "PersistentBufferedMsgBytesHighest"),
    (MonitorType::HighestNonpersistentBufferedMsgBytes, "NonpersistentBufferedMsgBytesHighest"),
    (MonitorType::HighestPublishedMsgs, "PublishedMsgsHighest"),
    (MonitorType::HighestPublishedQos0Msgs, "QoS0PublishedMsgsHighest"),
    (MonitorType::HighestPublishedQos1Msgs, "QoS1PublishedMsgsHighest"),
    (MonitorType::HighestPublishedQos2Msgs, "QoS2PublishedMsgsHighest"),
    (MonitorType::HighestPublishedMsgBytes, "PublishedMsgBytesHighest"),
    (MonitorType::HighestPublishedQos0MsgBytes, "QoS0PublishedMsgBytesHighest"),
    (MonitorType::HighestPublishedQos1MsgBytes, "QoS1PublishedMsgBytesHighest"),
    (MonitorType::HighestPublishedQos2MsgBytes, "QoS2PublishedMsgBytesHighest"),
    (MonitorType::HighestMaxPublishRecipients, "MaxPublishRecipientsHighest"),
    (MonitorType::HighestSubscriptions, "SubscriptionsHighest"),
    (MonitorType::HighestPersistentNonSharedSubscriptions, "PersistentNonSharedSubscriptionsHighest"),
    (MonitorType::HighestNonpersistentNonSharedSubscriptions, "NonpersistentNonSharedSubscriptionsHighest"),
    (MonitorType::HighestPersistentSharedSubscriptions, "PersistentSharedSubscriptionsHighest"),
    (MonitorType::HighestNonpersistentSharedSubscriptions, "NonpersistentSharedSubscriptionsHighest"),
    (MonitorType::AllUnsorted, "AllUnsorted"),
    (MonitorType::HighestDiscardedMsgs, "DiscardedMsgsHighest"),
    (MonitorType::HighestRejectedMsgs, "RejectedMsgsHighest"),
    (MonitorType::HighestTotalMemoryBytes, "TotalMemoryBytesHighest"),
    (MonitorType::HighestRetainedMsgs, "RetainedMsgsHighest"),
    (MonitorType::HighestRetainedMsgBytes, "RetainedMsgBytesHighest"),
    (MonitorType::HighestWillMsgs, "WillMsgsHighest"),
    (MonitorType::HighestWillMsgBytes, "WillMsgBytesHighest"),
    (MonitorType::HighestPersistentWillMsgBytes, "PersistentWillMsgBytesHighest"),
    (MonitorType::HighestNonpersistentWillMsgBytes, "NonpersistentWillMsgBytesHighest"),
    (MonitorType::HighestConnections, "ConnectionsHighest"),
    (MonitorType::HighestActiveClients, "ActiveClientsHighest"),
    (MonitorType::HighestActivePersistentClients, "ActivePersistentClientsHighest"),
    (MonitorType::HighestActiveNonpersistentClients, "ActiveNonpersistentClientsHighest"),
    (MonitorType::HighestPersistentClientStates, "PersistentClientStatesHighest"),
    (MonitorType::None, "None"),
    (MonitorType::FakeHourly, "FakeHourly"),
    (MonitorType::FakeDaily, "FakeDaily"),
    (MonitorType::FakeWeekly, "FakeWeekly"),
];

/// Case-folded StatType name to monitor type
static STAT_TYPE_LOOKUP: Lazy<AHashMap<String, MonitorType>> = Lazy::new(|| {
    MONITOR_TYPE_CATALOG
        .iter()
        .map(|(monitor_type, name)| (name.to_ascii_lowercase(), *monitor_type))
        .collect()
});

impl MonitorType {
    /// Every monitor type, indexed by code
    pub const ALL: [MonitorType; 60] = [
        Self::HighestBufferedMsgs,
        Self::LowestBufferedMsgs,
        Self::HighestBufferedMsgBytes,
        Self::HighestPersistentBufferedMsgBytes,
        Self::HighestNonpersistentBufferedMsgBytes,
        Self::HighestBufferedPercent,
        Self::LowestBufferedPercent,
        Self::HighestRejectedMsgs,
        Self::LowestRejectedMsgs,
        Self::OldestLastConnectedTime,
        Self::HighestPublishedMsgs,
        Self::LowestPublishedMsgs,
        Self::HighestPublishedQos0Msgs,
        Self::HighestPublishedQos1Msgs,
        Self::HighestPublishedQos2Msgs,
        Self::HighestPublishedMsgBytes,
        Self::HighestPublishedQos0MsgBytes,
        Self::HighestPublishedQos1MsgBytes,
        Self::HighestPublishedQos2MsgBytes,
        Self::HighestMaxPublishRecipients,
        Self::HighestSubscriptions,
        Self::LowestSubscriptions,
        Self::HighestPersistentNonSharedSubscriptions,
        Self::HighestNonpersistentNonSharedSubscriptions,
        Self::HighestPersistentSharedSubscriptions,
        Self::HighestNonpersistentSharedSubscriptions,
        Self::HighestFailedPublishes,
        Self::LowestFailedPublishes,
        Self::HighestProducers,
        Self::LowestProducers,
        Self::HighestConsumers,
        Self::LowestConsumers,
        Self::HighestConsumedMsgs,
        Self::LowestConsumedMsgs,
        Self::HighestProducedMsgs,
        Self::LowestProducedMsgs,
        Self::AllUnsorted,
        Self::HighestBufferedHwmPercent,
        Self::LowestBufferedHwmPercent,
        Self::OldestStateChange,
        Self::HighestExpiredMsgs,
        Self::LowestExpiredMsgs,
        Self::HighestDiscardedMsgs,
        Self::LowestDiscardedMsgs,
        Self::HighestTotalMemoryBytes,
        Self::HighestRetainedMsgs,
        Self::HighestRetainedMsgBytes,
        Self::HighestWillMsgs,
        Self::HighestWillMsgBytes,
        Self::HighestPersistentWillMsgBytes,
        Self::HighestNonpersistentWillMsgBytes,
        Self::HighestConnections,
        Self::HighestActiveClients,
        Self::HighestActivePersistentClients,
        Self::HighestActiveNonpersistentClients,
        Self::HighestPersistentClientStates,
        Self::None,
        Self::FakeHourly,
        Self::FakeDaily,
        Self::FakeWeekly,
    ];

    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    #[inline]
    pub fn is_fake(self) -> bool {
        matches!(self, MonitorType::FakeHourly | MonitorType::FakeDaily | MonitorType::FakeWeekly)
    }

    /// Map a StatType to a monitor type.
    ///
    /// Names match case-insensitively. Text starting with `-` or a digit is
    /// read as a numeric code: negative or out-of-range codes give `None`.
    /// The fake schedule types are only recognised with `allow_fake`.
    pub fn from_stat_type(text: &str, allow_fake: bool) -> MonitorType {
        let highest = if allow_fake { MonitorType::FakeWeekly.code() } else { MONITOR_TYPE_MAX };

        let starts_numeric = text
            .chars()
            .next()
            .map_or(false, |c| c == '-' || c.is_ascii_digit());

        let monitor_type = if starts_numeric {
            parse_leading_code(text)
                .filter(|code| (0..=highest as i64).contains(code))
                .and_then(|code| MonitorType::from_code(code as u32))
                .unwrap_or(MonitorType::None)
        } else {
            match STAT_TYPE_LOOKUP.get(&text.to_ascii_lowercase()) {
                Some(found) if found.is_fake() && !allow_fake => MonitorType::None,
                Some(found) => *found,
                None => MonitorType::None,
            }
        };

        if monitor_type == MonitorType::None && !text.eq_ignore_ascii_case("None") {
            debug!(target: "resource_stats::init", stat_type = text, "StatType does not name a resource set monitor type");
        }
        monitor_type
    }

    /// StatType name of this monitor type; "None" for codes that have no
    /// resource set sort.
    pub fn stat_type(self) -> &'static str {
        MONITOR_TYPE_CATALOG
            .iter()
            .find(|(monitor_type, _)| *monitor_type == self)
            .map_or("None", |(_, name)| name)
    }

    /// Whether resource set queries can sort by this monitor type
    pub fn is_resource_set_sort(self) -> bool {
        self.sort_value(&ResourceSetStatistics::default()).is_some()
    }

    /// Value this monitor type sorts a resource set by
    pub fn sort_value(self, stats: &ResourceSetStatistics) -> Option<u64> {
        let value = match self {
            MonitorType::HighestBufferedMsgs => stats.buffered_msgs,
            MonitorType::HighestBufferedMsgBytes => stats.buffered_msg_bytes,
            MonitorType::HighestPersistentBufferedMsgBytes => stats.persistent_buffered_msg_bytes,
            MonitorType::HighestNonpersistentBufferedMsgBytes => stats.nonpersistent_buffered_msg_bytes,
            MonitorType::HighestRejectedMsgs => stats.rejected_msgs,
            MonitorType::HighestPublishedMsgs => stats.published_msgs,
            MonitorType::HighestPublishedQos0Msgs => stats.qos0_published_msgs,
            MonitorType::HighestPublishedQos1Msgs => stats.qos1_published_msgs,
            MonitorType::HighestPublishedQos2Msgs => stats.qos2_published_msgs,
            MonitorType::HighestPublishedMsgBytes => stats.published_msg_bytes,
            MonitorType::HighestPublishedQos0MsgBytes => stats.qos0_published_msg_bytes,
            MonitorType::HighestPublishedQos1MsgBytes => stats.qos1_published_msg_bytes,
            MonitorType::HighestPublishedQos2MsgBytes => stats.qos2_published_msg_bytes,
            MonitorType::HighestMaxPublishRecipients => stats.max_publish_recipients,
            MonitorType::HighestSubscriptions => stats.subscriptions,
            MonitorType::HighestPersistentNonSharedSubscriptions => stats.persistent_non_shared_subscriptions,
            MonitorType::HighestNonpersistentNonSharedSubscriptions => stats.nonpersistent_non_shared_subscriptions,
            MonitorType::HighestPersistentSharedSubscriptions => stats.persistent_shared_subscriptions,
            MonitorType::HighestNonpersistentSharedSubscriptions => stats.nonpersistent_shared_subscriptions,
            MonitorType::HighestDiscardedMsgs => stats.discarded_msgs,
            MonitorType::HighestTotalMemoryBytes => stats.total_memory_bytes,
            MonitorType::HighestRetainedMsgs => stats.retained_msgs,
            MonitorType::HighestRetainedMsgBytes => stats.retained_msg_bytes,
            MonitorType::HighestWillMsgs => stats.will_msgs,
            MonitorType::HighestWillMsgBytes => stats.will_msg_bytes,
            MonitorType::HighestPersistentWillMsgBytes => stats.persistent_will_msg_bytes,
            MonitorType::HighestNonpersistentWillMsgBytes => stats.nonpersistent_will_msg_bytes,
            MonitorType::HighestConnections => stats.connections,
            MonitorType::HighestActiveClients => stats.active_clients,
            MonitorType::HighestActivePersistentClients => stats.active_persistent_clients,
            MonitorType::HighestActiveNonpersistentClients => stats.active_nonpersistent_clients,
            MonitorType::HighestPersistentClientStates => stats.persistent_client_states,
            _ => return None,
        };
        Some(value)
    }
}

impl Display for MonitorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.stat_type())
    }
}

/// Leading optional `-` and decimal digits, ignoring whatever follows
fn parse_leading_code(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(digits.len(), |(index, _)| index);
    if end == 0 {
        return None;
    }
    // Anything too long for i64 is out of range either way
    let magnitude = digits[..end].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

// ============================================================================
// SECTION 10: RESOURCE SET MONITORING QUERY
// ============================================================================
// Snapshot of resource set statistics for reports and admin queries:
// - Unsorted listing of every set
// - Top-N by any resource set sort, with the rest folded into one aggregate
// - Optional id filter, exact or `*` wildcard
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Query Results
// ----------------------------------------------------------------------------

/// One resource set (or the "other sets" aggregate) in a query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSetMonitor {
    /// `None` marks the aggregate of sets not listed individually
    pub resource_set_id: Option<CompactString>,
    pub reset_time: Timestamp,
    pub report_time: Timestamp,
    pub stats: ResourceSetStatistics,
}

impl ResourceSetMonitor {
    /// Identifier as printed in reports
    pub fn display_id(&self) -> &str {
        self.resource_set_id.as_deref().unwrap_or(OTHER_RESOURCE_SETS_ID)
    }
}

/// Result of [`ResourceSetStats::get_monitor`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorResults {
    pub results: Vec<ResourceSetMonitor>,
    pub other_sets: Option<ResourceSetMonitor>,
}

impl MonitorResults {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 10.2 Query Execution
// ----------------------------------------------------------------------------

enum IdFilter {
    All,
    Exact(String),
    Wildcard(WildcardPattern),
}

impl IdFilter {
    fn parse(filter: Option<&str>) -> ResourceStatsResult<Self> {
        match filter {
            None | Some("*") => Ok(IdFilter::All),
            Some(text) if text.contains('*') => WildcardPattern::new(text)
                .map(IdFilter::Wildcard)
                .map_err(|e| ResourceStatsError::invalid_parameter(format!("bad resource set filter '{}': {}", text, e))),
            Some(text) => Ok(IdFilter::Exact(text.to_string())),
        }
    }
}

impl ResourceSetStats {
    /// Snapshot resource set statistics.
    ///
    /// `AllUnsorted` returns every matching set in enumeration order and
    /// ignores `max_results`. Any other type must be a resource set sort with
    /// `max_results > 0`: the top `max_results` sets are returned in
    /// non-increasing order and the rest are folded into `other_sets`.
    pub fn get_monitor(
        &self,
        monitor_type: MonitorType,
        max_results: u32,
        id_filter: Option<&str>,
    ) -> ResourceStatsResult<MonitorResults> {
        let unsorted = monitor_type == MonitorType::AllUnsorted;
        if !unsorted {
            if !monitor_type.is_resource_set_sort() {
                return Err(ResourceStatsError::invalid_parameter(format!(
                    "monitor type {} ({}) cannot sort resource sets",
                    monitor_type.code(),
                    monitor_type.stat_type()
                )));
            }
            if max_results == 0 {
                return Err(ResourceStatsError::invalid_parameter("max_results must be greater than zero"));
            }
        }

        let filter = IdFilter::parse(id_filter)?;
        let mut report_time: Option<Timestamp> = None;
        let mut collected: Vec<ResourceSetMonitor> = Vec::new();

        let mut visit = |set: &ResourceSetHandle, reset_time: Timestamp| {
            if let IdFilter::Wildcard(pattern) = &filter {
                if !pattern.is_match(set.id()) {
                    return;
                }
            }
            let report_time = *report_time.get_or_insert_with(Timestamp::now);
            collected.push(ResourceSetMonitor {
                resource_set_id: Some(CompactString::from(set.id())),
                reset_time,
                report_time,
                stats: set.statistics(),
            });
        };

        match &filter {
            IdFilter::Exact(id) => self.table.enumerate_single(id, &mut visit),
            _ => self.table.enumerate(&mut visit),
        }

        if unsorted {
            return Ok(MonitorResults {
                results: collected,
                other_sets: None,
            });
        }

        // sort_value is Some for every type that passed validation above
        collected.sort_by(|a, b| {
            let a_value = monitor_type.sort_value(&a.stats).unwrap_or(0);
            let b_value = monitor_type.sort_value(&b.stats).unwrap_or(0);
            b_value.cmp(&a_value)
        });

        let keep = (max_results as usize).min(collected.len());
        let remainder = collected.split_off(keep);

        let other_sets = collected.first().map(|first| {
            let mut stats = ResourceSetStatistics::default();
            for monitor in &remainder {
                stats.accumulate(&monitor.stats);
            }
            ResourceSetMonitor {
                resource_set_id: None,
                reset_time: first.reset_time,
                report_time: first.report_time,
                stats,
            }
        });

        Ok(MonitorResults {
            results: collected,
            other_sets,
        })
    }
}

// ============================================================================
// SECTION 11: REPORT RECORDS & SINKS
// ============================================================================
// One record per reported resource set. The statistics document keeps a
// fixed key order so downstream log parsers can rely on it; since-restart
// totals are appended only for weekly and on-demand reports.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Report Document - The JSON Payload
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ReportDocument<'a> {
    #[serde(rename = "ResourceSetID")]
    resource_set_id: &'a str,
    #[serde(rename = "ResetTime")]
    reset_time: &'a str,
    #[serde(rename = "ReportTime")]
    report_time: &'a str,
    #[serde(rename = "Stats")]
    stats: ReportStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReportStats {
    total_memory_bytes: u64,
    subscriptions: u64,
    persistent_non_shared_subscriptions: u64,
    nonpersistent_non_shared_subscriptions: u64,
    persistent_shared_subscriptions: u64,
    nonpersistent_shared_subscriptions: u64,
    buffered_msgs: u64,
    discarded_msgs: u64,
    rejected_msgs: u64,
    retained_msgs: u64,
    will_msgs: u64,
    buffered_msg_bytes: u64,
    persistent_buffered_msg_bytes: u64,
    nonpersistent_buffered_msg_bytes: u64,
    retained_msg_bytes: u64,
    will_msg_bytes: u64,
    persistent_will_msg_bytes: u64,
    nonpersistent_will_msg_bytes: u64,
    published_msgs: u64,
    #[serde(rename = "QoS0PublishedMsgs")]
    qos0_published_msgs: u64,
    #[serde(rename = "QoS1PublishedMsgs")]
    qos1_published_msgs: u64,
    #[serde(rename = "QoS2PublishedMsgs")]
    qos2_published_msgs: u64,
    published_msg_bytes: u64,
    #[serde(rename = "QoS0PublishedMsgBytes")]
    qos0_published_msg_bytes: u64,
    #[serde(rename = "QoS1PublishedMsgBytes")]
    qos1_published_msg_bytes: u64,
    #[serde(rename = "QoS2PublishedMsgBytes")]
    qos2_published_msg_bytes: u64,
    max_publish_recipients: u64,
    connections: u64,
    active_clients: u64,
    active_persistent_clients: u64,
    active_nonpersistent_clients: u64,
    persistent_client_states: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    discarded_msgs_since_restart: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    published_msgs_since_restart: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    published_msg_bytes_since_restart: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_publish_recipients_since_restart: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connections_since_restart: Option<u64>,
}

impl ReportStats {
    fn new(stats: &ResourceSetStatistics, include_since_restart: bool) -> Self {
        let since_restart = |value: u64| include_since_restart.then_some(value);
        Self {
            total_memory_bytes: stats.total_memory_bytes,
            subscriptions: stats.subscriptions,
            persistent_non_shared_subscriptions: stats.persistent_non_shared_subscriptions,
            nonpersistent_non_shared_subscriptions: stats.nonpersistent_non_shared_subscriptions,
            persistent_shared_subscriptions: stats.persistent_shared_subscriptions,
            nonpersistent_shared_subscriptions: stats.nonpersistent_shared_subscriptions,
            buffered_msgs: stats.buffered_msgs,
            discarded_msgs: stats.discarded_msgs,
            rejected_msgs: stats.rejected_msgs,
            retained_msgs: stats.retained_msgs,
            will_msgs: stats.will_msgs,
            buffered_msg_bytes: stats.buffered_msg_bytes,
            persistent_buffered_msg_bytes: stats.persistent_buffered_msg_bytes,
            nonpersistent_buffered_msg_bytes: stats.nonpersistent_buffered_msg_bytes,
            retained_msg_bytes: stats.retained_msg_bytes,
            will_msg_bytes: stats.will_msg_bytes,
            persistent_will_msg_bytes: stats.persistent_will_msg_bytes,
            nonpersistent_will_msg_bytes: stats.nonpersistent_will_msg_bytes,
            published_msgs: stats.published_msgs,
            qos0_published_msgs: stats.qos0_published_msgs,
            qos1_published_msgs: stats.qos1_published_msgs,
            qos2_published_msgs: stats.qos2_published_msgs,
            published_msg_bytes: stats.published_msg_bytes,
            qos0_published_msg_bytes: stats.qos0_published_msg_bytes,
            qos1_published_msg_bytes: stats.qos1_published_msg_bytes,
            qos2_published_msg_bytes: stats.qos2_published_msg_bytes,
            max_publish_recipients: stats.max_publish_recipients,
            connections: stats.connections,
            active_clients: stats.active_clients,
            active_persistent_clients: stats.active_persistent_clients,
            active_nonpersistent_clients: stats.active_nonpersistent_clients,
            persistent_client_states: stats.persistent_client_states,
            discarded_msgs_since_restart: since_restart(stats.discarded_msgs_since_restart),
            published_msgs_since_restart: since_restart(stats.published_msgs_since_restart),
            published_msg_bytes_since_restart: since_restart(stats.published_msg_bytes_since_restart),
            max_publish_recipients_since_restart: since_restart(stats.max_publish_recipients_since_restart),
            connections_since_restart: since_restart(stats.connections_since_restart),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Report Record
// ----------------------------------------------------------------------------

/// A single line of a resource set report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRecord {
    pub monitor_type: MonitorType,
    /// 1-based; the "other sets" aggregate sits at `result_count + 1`
    pub position: usize,
    pub result_count: usize,
    pub resource_set_id: String,
    pub total_memory_bytes: u64,
    /// Whether the record carries a position in a sorted listing
    pub sorted: bool,
    pub statistics_json: String,
}

impl ReportRecord {
    /// Build the record for one query result. Times are pre-formatted since
    /// every record of a report shares them.
    pub fn build(
        monitor_type: MonitorType,
        position: usize,
        result_count: usize,
        monitor: &ResourceSetMonitor,
        reset_time: &str,
        report_time: &str,
        include_since_restart: bool,
    ) -> ResourceStatsResult<Self> {
        let resource_set_id = monitor.display_id();
        let document = ReportDocument {
            resource_set_id,
            reset_time,
            report_time,
            stats: ReportStats::new(&monitor.stats, include_since_restart),
        };
        let statistics_json = serde_json::to_string(&document)
            .map_err(|e| ResourceStatsError::Internal(format!("Failed to serialize report for '{}': {}", resource_set_id, e)))?;

        Ok(Self {
            monitor_type,
            position,
            result_count,
            resource_set_id: resource_set_id.to_string(),
            total_memory_bytes: monitor.stats.total_memory_bytes,
            sorted: monitor_type != MonitorType::AllUnsorted && monitor.resource_set_id.is_some(),
            statistics_json,
        })
    }

    /// Human readable line carrying the full statistics document
    pub fn message(&self) -> String {
        if self.sorted {
            format!(
                "ResourceSetID {} is set {} of {} sorted by StatType {}. Full statistics: {}",
                self.resource_set_id,
                self.position,
                self.result_count,
                self.monitor_type.stat_type(),
                self.statistics_json
            )
        } else {
            format!(
                "ResourceSetID {} has TotalMemoryBytes {}. Full statistics: {}",
                self.resource_set_id, self.total_memory_bytes, self.statistics_json
            )
        }
    }
}

// ----------------------------------------------------------------------------
// 11.3 Report Sinks - Where Records Go
// ----------------------------------------------------------------------------

/// Destination of report records
pub trait ReportSink: Send + Sync + Debug {
    fn emit(&self, record: &ReportRecord);
}

/// Emits each record as an INFO event on `resource_stats::report`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn emit(&self, record: &ReportRecord) {
        info!(
            target: "resource_stats::report",
            resource_set = %record.resource_set_id,
            position = record.position,
            result_count = record.result_count,
            stat_type = record.monitor_type.stat_type(),
            "{}",
            record.message()
        );
    }
}

/// Prints each record's message on stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutReportSink;

impl ReportSink for StdoutReportSink {
    fn emit(&self, record: &ReportRecord) {
        println!("{}", record.message());
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    records: Mutex<Vec<ReportRecord>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ReportRecord> {
        self.records.lock().clone()
    }

    pub fn take(&self) -> Vec<ReportRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for MemoryReportSink {
    fn emit(&self, record: &ReportRecord) {
        self.records.lock().push(record.clone());
    }
}

// ============================================================================
// SECTION 12: REPORTING SCHEDULER
// ============================================================================
// A dedicated thread sleeps until the configured minutes past the hour, then
// runs the highest priority report due: weekly, then daily, then hourly.
// On-demand requests and shutdown wake it early.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Schedule
// ----------------------------------------------------------------------------

/// Which report, how many sets, and whether to reset afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledReport {
    pub monitor_type: MonitorType,
    pub max_results: u32,
    pub reset_stats: bool,
}

impl ScheduledReport {
    pub const DISABLED: ScheduledReport = ScheduledReport {
        monitor_type: MonitorType::None,
        max_results: 0,
        reset_stats: false,
    };

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.monitor_type != MonitorType::None
    }
}

/// Origin of a report run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Weekly,
    Daily,
    Hourly,
    OnDemand,
}

impl Display for ReportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Weekly => write!(f, "weekly"),
            ReportKind::Daily => write!(f, "daily"),
            ReportKind::Hourly => write!(f, "hourly"),
            ReportKind::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// A report the scheduler decided to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportPlan {
    pub kind: ReportKind,
    pub report: ScheduledReport,
    pub include_since_restart: bool,
}

/// Resolved reporting schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSchedule {
    pub weekly: ScheduledReport,
    /// 0 = Sunday
    pub weekly_day: u32,
    pub weekly_hour: u32,
    pub daily: ScheduledReport,
    pub daily_hour: u32,
    pub hourly: ScheduledReport,
    /// `None` when nothing is scheduled: only requests wake the thread
    pub minutes_past: Option<u32>,
}

impl Default for ReportSchedule {
    fn default() -> Self {
        Self {
            weekly: ScheduledReport::DISABLED,
            weekly_day: 0,
            weekly_hour: 0,
            daily: ScheduledReport::DISABLED,
            daily_hour: 0,
            hourly: ScheduledReport::DISABLED,
            minutes_past: None,
        }
    }
}

impl ReportSchedule {
    pub fn any_enabled(&self) -> bool {
        self.weekly.is_enabled() || self.daily.is_enabled() || self.hourly.is_enabled()
    }

    /// The report due when the timer pops at local `weekday` (0 = Sunday) and `hour`
    pub fn due_at(&self, weekday: u32, hour: u32) -> Option<ReportPlan> {
        if self.weekly.is_enabled() && weekday == self.weekly_day && hour == self.weekly_hour {
            Some(ReportPlan {
                kind: ReportKind::Weekly,
                report: self.weekly,
                include_since_restart: true,
            })
        } else if self.daily.is_enabled() && hour == self.daily_hour {
            Some(ReportPlan {
                kind: ReportKind::Daily,
                report: self.daily,
                include_since_restart: false,
            })
        } else if self.hourly.is_enabled() {
            Some(ReportPlan {
                kind: ReportKind::Hourly,
                report: self.hourly,
                include_since_restart: false,
            })
        } else {
            None
        }
    }

    /// How long to sleep from local `minute` until the next minutes-past mark.
    /// Whole minutes only, so a wake can never land just short of the mark and
    /// fire twice in one hour.
    pub fn wait_duration(&self, minute: u32) -> Option<Duration> {
        self.minutes_past.map(|target| {
            let minutes = if target > minute {
                target - minute
            } else {
                60 - (minute - target)
            };
            Duration::from_secs(u64::from(minutes) * 60)
        })
    }
}

// ----------------------------------------------------------------------------
// 12.2 Report Requests
// ----------------------------------------------------------------------------

/// An on-demand report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRequest {
    pub monitor_type: MonitorType,
    pub max_results: u32,
    pub reset_stats: bool,
}

fn validate_report_request(monitor_type: MonitorType) -> ResourceStatsResult<()> {
    if monitor_type == MonitorType::None || monitor_type.code() > MonitorType::FakeWeekly.code() {
        return Err(ResourceStatsError::invalid_parameter(format!(
            "monitor type {} cannot be requested as a report",
            monitor_type.code()
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 12.3 Report Execution
// ----------------------------------------------------------------------------

/// Query, optionally reset, and emit one report. Returns the number of sets
/// reported individually.
pub fn emit_report(stats: &ResourceSetStats, sink: &dyn ReportSink, plan: &ReportPlan) -> ResourceStatsResult<usize> {
    let report = plan.report;
    let results = stats.get_monitor(report.monitor_type, report.max_results, None)?;

    let first = match results.results.first() {
        Some(first) => first,
        None => {
            debug!(target: "resource_stats::reporter", kind = %plan.kind, "No resource sets to report");
            return Ok(0);
        }
    };

    // The snapshot is already taken, so the reset only affects later reports
    if report.reset_stats {
        stats.reset_all();
    }

    // Stamped after any reset, so the report time never precedes the new interval
    let reset_time = first.reset_time.to_local_iso8601();
    let report_time = Timestamp::now().to_local_iso8601();
    let count = results.len();

    for (index, monitor) in results.results.iter().enumerate() {
        let record = ReportRecord::build(
            report.monitor_type,
            index + 1,
            count,
            monitor,
            &reset_time,
            &report_time,
            plan.include_since_restart,
        )?;
        sink.emit(&record);
    }

    if let Some(other_sets) = &results.other_sets {
        let record = ReportRecord::build(
            report.monitor_type,
            count + 1,
            count,
            other_sets,
            &reset_time,
            &report_time,
            plan.include_since_restart,
        )?;
        sink.emit(&record);
    }

    info!(
        target: "resource_stats::reporter",
        kind = %plan.kind,
        stat_type = report.monitor_type.stat_type(),
        reported = count,
        reset = report.reset_stats,
        "Resource set report emitted"
    );
    Ok(count)
}

// ----------------------------------------------------------------------------
// 12.4 Reporting Control - State Shared With the Thread
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReporterState {
    requested: Option<ReportRequest>,
    end_requested: bool,
}

#[derive(Debug)]
struct ReportingControl {
    schedule: ReportSchedule,
    state: Mutex<ReporterState>,
    wakeup: Condvar,
    cycles_completed: AtomicU64,
}

impl ReportingControl {
    /// Block until the next report is due, a request arrives or shutdown is
    /// requested. `None` means end the thread; `Some(None)` means woke with
    /// nothing to do.
    fn next_plan(&self) -> Option<Option<ReportPlan>> {
        let mut state = self.state.lock();
        let mut timed_out = false;

        if !state.end_requested && state.requested.is_none() {
            match self.schedule.wait_duration(Local::now().minute()) {
                Some(wait) => {
                    let deadline = Instant::now() + wait;
                    timed_out = self.wakeup.wait_until(&mut state, deadline).timed_out();
                }
                None => self.wakeup.wait(&mut state),
            }
        }

        if state.end_requested {
            return None;
        }

        let now = Local::now();
        let mut weekday = now.weekday().num_days_from_sunday();
        let mut hour = now.hour();
        let mut run_schedule = timed_out;

        // Fake requests behave like a timer pop at a synthesized time
        if let Some(request) = state.requested.filter(|r| r.monitor_type.is_fake()) {
            weekday = FAKE_WEEKDAY;
            hour = FAKE_HOUR;
            match request.monitor_type {
                MonitorType::FakeWeekly => {
                    weekday = self.schedule.weekly_day;
                    hour = self.schedule.weekly_hour;
                }
                MonitorType::FakeDaily => hour = self.schedule.daily_hour,
                _ => {}
            }
            state.requested = None;
            run_schedule = true;
        }

        if run_schedule {
            return Some(self.schedule.due_at(weekday, hour));
        }

        Some(state.requested.take().map(|request| ReportPlan {
            kind: ReportKind::OnDemand,
            report: ScheduledReport {
                monitor_type: request.monitor_type,
                max_results: request.max_results,
                reset_stats: request.reset_stats,
            },
            include_since_restart: true,
        }))
    }
}

fn run_reporter(
    stats: Arc<ResourceSetStats>,
    control: Arc<ReportingControl>,
    sink: Arc<dyn ReportSink>,
    done: CrossbeamSender<()>,
) {
    info!(
        target: "resource_stats::reporter",
        minutes_past = ?control.schedule.minutes_past,
        weekly = control.schedule.weekly.monitor_type.stat_type(),
        daily = control.schedule.daily.monitor_type.stat_type(),
        hourly = control.schedule.hourly.monitor_type.stat_type(),
        "Resource set reporting thread started"
    );

    while let Some(plan) = control.next_plan() {
        if let Some(plan) = plan {
            if let Err(e) = emit_report(&stats, sink.as_ref(), &plan) {
                warn!(
                    target: "resource_stats::reporter",
                    kind = %plan.kind,
                    stat_type = plan.report.monitor_type.stat_type(),
                    max_results = plan.report.max_results,
                    error = %e,
                    "Resource set report skipped"
                );
            }
        }
        control.cycles_completed.fetch_add(1, AtomicOrdering::AcqRel);
    }

    info!(target: "resource_stats::reporter", "Resource set reporting thread ending");
    let _ = done.send(());
}

// ----------------------------------------------------------------------------
// 12.5 Resource Set Reporter - Thread Lifecycle
// ----------------------------------------------------------------------------

/// Owner of the reporting thread
#[derive(Debug)]
pub struct ResourceSetReporter {
    control: Arc<ReportingControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: CrossbeamReceiver<()>,
    shutdown_timeout: Duration,
}

impl ResourceSetReporter {
    /// Start the reporting thread
    pub fn start(
        stats: Arc<ResourceSetStats>,
        schedule: ReportSchedule,
        sink: Arc<dyn ReportSink>,
        shutdown_timeout: Duration,
    ) -> ResourceStatsResult<Self> {
        let control = Arc::new(ReportingControl {
            schedule,
            state: Mutex::new(ReporterState::default()),
            wakeup: Condvar::new(),
            cycles_completed: AtomicU64::new(0),
        });
        let (done_tx, done_rx) = bounded(1);

        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name(REPORTER_THREAD_NAME.to_string())
            .spawn(move || run_reporter(stats, thread_control, sink, done_tx))
            .map_err(|source| ResourceStatsError::ThreadSpawn {
                name: REPORTER_THREAD_NAME.to_string(),
                source,
            })?;

        Ok(Self {
            control,
            handle: Mutex::new(Some(handle)),
            done: done_rx,
            shutdown_timeout,
        })
    }

    pub fn schedule(&self) -> &ReportSchedule {
        &self.control.schedule
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Ask the thread for a report now.
    ///
    /// At most one request is outstanding; a second one is refused with
    /// [`ResourceStatsError::AlreadyInProgress`] until the thread picks the
    /// first one up.
    pub fn request_report(&self, monitor_type: MonitorType, max_results: u32, reset_stats: bool) -> ResourceStatsResult<()> {
        validate_report_request(monitor_type)?;
        if !self.is_running() {
            return Err(ResourceStatsError::ReportingDisabled);
        }

        let mut state = self.control.state.lock();
        if state.end_requested {
            return Err(ResourceStatsError::ReportingDisabled);
        }
        if state.requested.is_some() {
            return Err(ResourceStatsError::AlreadyInProgress);
        }
        state.requested = Some(ReportRequest {
            monitor_type,
            max_results,
            reset_stats,
        });
        self.control.wakeup.notify_all();
        drop(state);

        debug!(
            target: "resource_stats::reporter",
            stat_type = monitor_type.stat_type(),
            max_results,
            reset_stats,
            "Resource set report requested"
        );
        Ok(())
    }

    /// Wakes of the thread that were not a shutdown
    pub fn cycles_completed(&self) -> u64 {
        self.control.cycles_completed.load(AtomicOrdering::Acquire)
    }

    /// Poll until at least `target` cycles completed. False on timeout.
    pub fn wait_for_cycles(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.cycles_completed() < target {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// End the thread, waiting at most the configured shutdown timeout.
    pub fn stop(&self) -> ResourceStatsResult<()> {
        let handle = match self.handle.lock().take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        {
            let mut state = self.control.state.lock();
            state.end_requested = true;
            self.control.wakeup.notify_all();
        }

        match self.done.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!(target: "resource_stats::reporter", "Resource set reporting thread panicked");
                    return Err(ResourceStatsError::Internal("reporting thread panicked".into()));
                }
                debug!(target: "resource_stats::reporter", "Resource set reporting thread joined");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    target: "resource_stats::reporter",
                    timeout = ?self.shutdown_timeout,
                    "Resource set reporting thread did not end in time"
                );
                Err(ResourceStatsError::ShutdownTimeout {
                    timeout: self.shutdown_timeout,
                })
            }
        }
    }
}

impl Drop for ResourceSetReporter {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(target: "resource_stats::reporter", error = %e, "Reporter dropped without a clean stop");
        }
    }
}

// ============================================================================
// SECTION 13: ENGINE
// ============================================================================
// Ties tracking and reporting together for one broker instance.
// ============================================================================

/// Resource set accounting for one server: the statistics table and, when
/// enabled, the reporting thread.
#[derive(Debug)]
pub struct ResourceStatsEngine {
    instance_id: Uuid,
    stats: Option<Arc<ResourceSetStats>>,
    reporter: Option<ResourceSetReporter>,
}

impl ResourceStatsEngine {
    /// Start tracking and reporting as configured. Tracking stays off when
    /// no extraction pattern is configured; reporting needs tracking.
    pub fn start(config: &ResourceStatsConfig, sink: Arc<dyn ReportSink>) -> ResourceStatsResult<Self> {
        let instance_id = Uuid::new_v4();
        let stats = ResourceSetStats::init(&config.tracking)?;

        let reporter = match (&stats, config.reporting.enabled) {
            (Some(stats), true) => Some(ResourceSetReporter::start(
                Arc::clone(stats),
                config.reporting.schedule(),
                sink,
                config.reporting.shutdown_timeout,
            )?),
            _ => None,
        };

        info!(
            target: "resource_stats::engine",
            instance = %instance_id,
            version = ENGINE_VERSION,
            tracking = stats.is_some(),
            reporting = reporter.is_some(),
            "Resource set statistics engine started"
        );

        Ok(Self {
            instance_id,
            stats,
            reporter,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The tracking state, absent when tracking is disabled
    pub fn stats(&self) -> Option<&Arc<ResourceSetStats>> {
        self.stats.as_ref()
    }

    pub fn is_tracking(&self) -> bool {
        self.stats.is_some()
    }

    pub fn reporter(&self) -> Option<&ResourceSetReporter> {
        self.reporter.as_ref()
    }

    /// Trigger an on-demand report
    pub fn request_report(&self, monitor_type: MonitorType, max_results: u32, reset_stats: bool) -> ResourceStatsResult<()> {
        validate_report_request(monitor_type)?;
        match &self.reporter {
            Some(reporter) => reporter.request_report(monitor_type, max_results, reset_stats),
            None => Err(ResourceStatsError::ReportingDisabled),
        }
    }

    /// Stop reporting, flush the calling thread's cache and tear the table down.
    /// Other worker threads must have flushed before this is called.
    pub fn shutdown(&mut self) -> ResourceStatsResult<()> {
        let stopped = match self.reporter.take() {
            Some(reporter) => reporter.stop(),
            None => Ok(()),
        };

        flush_thread_cache();
        if let Some(stats) = self.stats.take() {
            stats.destroy();
        }

        info!(target: "resource_stats::engine", instance = %self.instance_id, "Resource set statistics engine stopped");
        stopped
    }
}

impl Drop for ResourceStatsEngine {
    fn drop(&mut self) {
        if self.stats.is_some() || self.reporter.is_some() {
            if let Err(e) = self.shutdown() {
                warn!(target: "resource_stats::engine", error = %e, "Engine dropped without a clean shutdown");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 13.1 Traffic Events - Replaying Broker Activity
// ----------------------------------------------------------------------------

/// One stat update as a JSON line:
/// `{"client_id":"acme-dev1","topic":"t/1","stat":"Connections","value":1}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficEvent {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    pub stat: ResourceSetStat,
    #[serde(default = "default_event_value")]
    pub value: i64,
}

fn default_event_value() -> i64 {
    1
}

/// Parse JSON-lines traffic events; blank lines and `#` comments are skipped
pub fn parse_traffic_events<R: BufRead>(reader: R) -> ResourceStatsResult<Vec<TrafficEvent>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|e| {
            ResourceStatsError::invalid_parameter(format!("traffic event on line {}: {}", index + 1, e))
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Read traffic events from a file, or stdin for `-`
pub fn read_traffic_events(path: &Path) -> ResourceStatsResult<Vec<TrafficEvent>> {
    if path == Path::new("-") {
        parse_traffic_events(io::stdin().lock())
    } else {
        parse_traffic_events(BufReader::new(fs::File::open(path)?))
    }
}

/// Apply events through the calling thread's cache, then flush it.
/// Returns how many events were attributed to a resource set.
pub fn apply_traffic_events(stats: &ResourceSetStats, events: &[TrafficEvent]) -> ResourceStatsResult<usize> {
    let mut applied = 0;
    for event in events {
        let set = stats.resolve(event.client_id.as_deref(), event.topic.as_deref(), ResolveMode::LookupOrCreate)?;
        if let Some(set) = set {
            record_stat(&set, event.stat, event.value);
            applied += 1;
        }
    }
    flush_thread_cache();
    Ok(applied)
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Operator tooling: validate and generate configuration, list StatTypes,
// and replay recorded broker traffic through the engine.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Resource Set Stats CLI
#[derive(Parser, Debug)]
#[command(
    name = "resource-stats",
    author = "Messaging Engine Team",
    version,
    about = "Per-tenant resource set statistics for a multi-tenant message broker",
    long_about = "Attributes broker resource usage to resource sets extracted from client ids \
                  and topics, and reports the heaviest sets on a weekly, daily and hourly \
                  schedule or on demand."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "resource-stats.toml", env = "RESOURCE_STATS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "RESOURCE_STATS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "RESOURCE_STATS_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay traffic through the engine and its reporting thread
    Replay {
        /// JSON-lines traffic events ("-" for stdin)
        #[arg(short, long)]
        events: PathBuf,

        /// Request an on-demand report of this StatType after replaying
        #[arg(short, long)]
        report: Option<String>,

        /// Sets to report individually
        #[arg(short, long, default_value_t = 10)]
        max_results: u32,

        /// Reset statistics after the report
        #[arg(long)]
        reset: bool,

        /// How long to wait for the report (seconds)
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// Replay traffic and print a monitoring query as JSON
    Query {
        /// JSON-lines traffic events ("-" for stdin)
        #[arg(short, long)]
        events: PathBuf,

        /// StatType to sort by
        #[arg(short, long, default_value = "AllUnsorted")]
        stat_type: String,

        /// Sets to return individually
        #[arg(short, long, default_value_t = 10)]
        max_results: u32,

        /// Resource set id, or a `*` wildcard
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the StatTypes resource set reports accept
    StatTypes,

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> ResourceStatsResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ResourceStatsConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            let schedule = config.reporting.schedule();
            println!("\n📊 Configuration Summary:");
            println!("  • Tracking: {}", if config.tracking.is_enabled() { "enabled" } else { "disabled" });
            if !config.tracking.client_id_pattern.is_empty() {
                println!("    - Client id pattern: {}", config.tracking.client_id_pattern);
            }
            if !config.tracking.topic_pattern.is_empty() {
                println!("    - Topic pattern: {}", config.tracking.topic_pattern);
            }
            println!("    - Unmatched activity: {}", if config.tracking.track_unmatched { DEFAULT_RESOURCE_SET_ID } else { "ignored" });
            println!("  • Environment: {}", config.reporting.environment);
            println!(
                "  • Weekly: {} (day {}, hour {}, top {})",
                schedule.weekly.monitor_type, schedule.weekly_day, schedule.weekly_hour, schedule.weekly.max_results
            );
            println!("  • Daily: {} (hour {}, top {})", schedule.daily.monitor_type, schedule.daily_hour, schedule.daily.max_results);
            println!("  • Hourly: {} (top {})", schedule.hourly.monitor_type, schedule.hourly.max_results);
            match schedule.minutes_past {
                Some(minutes) => println!("  • Reports run at {} minutes past the hour", minutes),
                None => println!("  • No scheduled reports"),
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ResourceStatsError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> ResourceStatsResult<()> {
    let config_str = ResourceStatsConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the stat-types subcommand
fn handle_stat_types() {
    println!("📋 Resource set StatTypes:");
    for monitor_type in MonitorType::ALL {
        if monitor_type == MonitorType::AllUnsorted || monitor_type.is_resource_set_sort() {
            println!("  • {:<45} (code {})", monitor_type.stat_type(), monitor_type.code());
        }
    }
}

/// Version banner followed by the limits and schedule this build would run with
fn version_summary(config: &ResourceStatsConfig) -> String {
    let schedule = config.reporting.schedule();
    let describe = |report: &ScheduledReport| {
        if report.is_enabled() {
            format!(
                "{} (top {}{})",
                report.monitor_type,
                report.max_results,
                if report.reset_stats { ", resets" } else { "" }
            )
        } else {
            "off".to_string()
        }
    };

    let mut lines = vec![
        format!("📈 {} v{} ({}/{})", ENGINE_FULL_NAME, ENGINE_VERSION, std::env::consts::OS, std::env::consts::ARCH),
        String::new(),
        "Resource set limits:".to_string(),
        format!("  • Id length: {} bytes", MAX_RESOURCE_SET_ID_LENGTH),
        format!("  • Initial table capacity: {}", config.tracking.initial_capacity),
        format!(
            "  • Thread cache: {} slots ({} sticky)",
            THREAD_CACHE_SLOTS, THREAD_CACHE_STICKY_SLOTS
        ),
        format!("  • Statistics per set: {}", NUM_STATS),
        format!("  • Unmatched activity: {}", DEFAULT_RESOURCE_SET_ID),
        String::new(),
        format!(
            "Reporting ({}, {} environment):",
            if config.reporting.enabled { "enabled" } else { "disabled" },
            config.reporting.environment
        ),
        format!(
            "  • Weekly: {} on day {} at hour {}",
            describe(&schedule.weekly),
            schedule.weekly_day,
            schedule.weekly_hour
        ),
        format!("  • Daily: {} at hour {}", describe(&schedule.daily), schedule.daily_hour),
        format!("  • Hourly: {}", describe(&schedule.hourly)),
    ];
    lines.push(match schedule.minutes_past {
        Some(minutes) => format!("  • Runs at {} minutes past the hour", minutes),
        None => "  • Nothing scheduled".to_string(),
    });
    lines.push(format!("  • Shutdown timeout: {:?}", config.reporting.shutdown_timeout));
    lines.join("\n")
}

/// Handle the version subcommand
fn handle_version(config: &ResourceStatsConfig) {
    println!("{}", version_summary(config));
}

/// Handle the replay subcommand
fn handle_replay(
    config: &ResourceStatsConfig,
    events_path: &Path,
    report: Option<&str>,
    max_results: u32,
    reset: bool,
    wait: Duration,
) -> AnyhowResult<()> {
    let events = read_traffic_events(events_path)
        .with_context(|| format!("Failed to read traffic events from {}", events_path.display()))?;

    let mut engine = ResourceStatsEngine::start(config, Arc::new(StdoutReportSink))?;
    let stats = match engine.stats() {
        Some(stats) => Arc::clone(stats),
        None => anyhow::bail!("Resource set tracking is disabled: configure tracking.client_id_pattern or tracking.topic_pattern"),
    };

    let applied = apply_traffic_events(&stats, &events)?;
    println!("✅ Replayed {} events ({} attributed to a resource set)", events.len(), applied);
    println!("  • Resource sets: {}", stats.table().len());

    if let Some(stat_type) = report {
        let monitor_type = MonitorType::from_stat_type(stat_type, true);
        let reporter = engine
            .reporter()
            .context("Reporting is disabled in the configuration")?;
        let before = reporter.cycles_completed();
        engine.request_report(monitor_type, max_results, reset)?;
        if !reporter.wait_for_cycles(before + 1, wait) {
            println!("⚠️  Report did not complete within {:?}", wait);
        }
    }

    engine.shutdown()?;
    Ok(())
}

/// Handle the query subcommand
fn handle_query(
    config: &ResourceStatsConfig,
    events_path: &Path,
    stat_type: &str,
    max_results: u32,
    filter: Option<&str>,
) -> AnyhowResult<()> {
    let events = read_traffic_events(events_path)
        .with_context(|| format!("Failed to read traffic events from {}", events_path.display()))?;

    let stats = ResourceSetStats::init(&config.tracking)?
        .context("Resource set tracking is disabled: configure tracking.client_id_pattern or tracking.topic_pattern")?;
    apply_traffic_events(&stats, &events)?;

    let monitor_type = MonitorType::from_stat_type(stat_type, false);
    let results = stats.get_monitor(monitor_type, max_results, filter)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the resource set statistics tool
fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            // Fall back to defaults so the version is printable without a config file
            let config = ResourceStatsConfig::load(&cli.config).unwrap_or_default();
            handle_version(&config);
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::StatTypes) => {
            handle_stat_types();
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        ResourceStatsConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        ResourceStatsConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    match cli.command {
        Some(Commands::Replay { events, report, max_results, reset, wait_secs }) => {
            handle_replay(&config, &events, report.as_deref(), max_results, reset, Duration::from_secs(wait_secs))?;
        }
        Some(Commands::Query { events, stat_type, max_results, filter }) => {
            handle_query(&config, &events, &stat_type, max_results, filter.as_deref())?;
        }
        None => {
            println!("Nothing to do. Run with --help to list the available commands.");
        }
        Some(Commands::Version)
        | Some(Commands::GenerateConfig { .. })
        | Some(Commands::Validate { .. })
        | Some(Commands::StatTypes) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::Barrier;
    use test_case::test_case;

    fn tracking_config(track_unmatched: bool) -> TrackingConfig {
        TrackingConfig {
            client_id_pattern: r"^([^-]+)-".into(),
            topic_pattern: r"^tenants/([^/]+)/".into(),
            track_unmatched,
            ..TrackingConfig::default()
        }
    }

    fn tracked_stats(track_unmatched: bool) -> Arc<ResourceSetStats> {
        ResourceSetStats::init(&tracking_config(track_unmatched))
            .expect("init")
            .expect("tracking enabled")
    }

    fn set_stat(stats: &ResourceSetStats, id: &str, stat: ResourceSetStat, value: i64) -> ResourceSetHandle {
        let set = stats.table().get_or_create(id).expect("create");
        let mut local = EMPTY_STATS;
        local[stat.index()] = value;
        set.merge(&local);
        set
    }

    fn monitor_with(id: Option<&str>, stats: ResourceSetStatistics) -> ResourceSetMonitor {
        ResourceSetMonitor {
            resource_set_id: id.map(CompactString::from),
            reset_time: Timestamp::from_secs(1_700_000_000),
            report_time: Timestamp::from_secs(1_700_003_600),
            stats,
        }
    }

    /// Sink that blocks each emit until its gate sender is dropped
    #[derive(Debug)]
    struct GateSink {
        entered: CrossbeamSender<()>,
        gate: CrossbeamReceiver<()>,
        records: MemoryReportSink,
    }

    impl ReportSink for GateSink {
        fn emit(&self, record: &ReportRecord) {
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            self.records.emit(record);
        }
    }

    fn gate_sink() -> (Arc<GateSink>, CrossbeamReceiver<()>, CrossbeamSender<()>) {
        let (entered_tx, entered_rx) = unbounded();
        let (gate_tx, gate_rx) = bounded(0);
        let sink = Arc::new(GateSink {
            entered: entered_tx,
            gate: gate_rx,
            records: MemoryReportSink::new(),
        });
        (sink, entered_rx, gate_tx)
    }

    // ---- Core types ----

    #[test]
    fn test_timestamp_local_iso8601() {
        let ts = Timestamp::from_nanos(1_700_000_000_123_456_789);
        let text = ts.to_local_iso8601();
        let shape = Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.1234567[+-]\d{2}:\d{2}$").unwrap();
        assert!(shape.is_match(&text), "unexpected format: {}", text);
        pretty_assert_eq!(ts.to_string(), text);
    }

    #[test]
    fn test_timestamp_ordering() {
        let ts1 = Timestamp::now();
        std::thread::sleep(Duration::from_millis(2));
        let ts2 = Timestamp::now();
        assert!(ts2 > ts1);
        pretty_assert_eq!(Timestamp::from_secs(2).as_nanos(), 2_000_000_000);
    }

    #[test]
    fn test_stat_layout() {
        for (index, stat) in ResourceSetStat::ALL.iter().enumerate() {
            pretty_assert_eq!(stat.index(), index);
        }
        assert!(ResourceSetStat::Connections.is_cumulative());
        assert!(ResourceSetStat::TotalMemory.is_cumulative());
        assert!(ResourceSetStat::MaxPublishRecipients.is_maximum());
        assert!(ResourceSetStat::MaxPublishRecipientsToLastReset.is_maximum());
    }

    #[test]
    fn test_stat_from_str() {
        pretty_assert_eq!("connections".parse::<ResourceSetStat>().unwrap(), ResourceSetStat::Connections);
        pretty_assert_eq!(" TotalMemory ".parse::<ResourceSetStat>().unwrap(), ResourceSetStat::TotalMemory);
        assert!(matches!(
            "Bananas".parse::<ResourceSetStat>(),
            Err(ResourceStatsError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_statistics_derived_fields() {
        let mut stats = EMPTY_STATS;
        stats[ResourceSetStat::PersistentNonSharedSubscriptions.index()] = 2;
        stats[ResourceSetStat::NonpersistentSharedSubscriptions.index()] = 3;
        stats[ResourceSetStat::Qos0MsgsPublished.index()] = 10;
        stats[ResourceSetStat::Qos2MsgsPublished.index()] = 5;
        stats[ResourceSetStat::Qos0MsgsPublishedToLastReset.index()] = 100;
        stats[ResourceSetStat::ActivePersistentClients.index()] = 4;
        stats[ResourceSetStat::ActiveNonpersistentClients.index()] = 6;
        stats[ResourceSetStat::BufferedMsgs.index()] = -3;

        let view = ResourceSetStatistics::from_stats(&stats);
        pretty_assert_eq!(view.subscriptions, 5);
        pretty_assert_eq!(view.published_msgs, 15);
        pretty_assert_eq!(view.published_msgs_since_restart, 115);
        pretty_assert_eq!(view.active_clients, 10);
        pretty_assert_eq!(view.buffered_msgs, 0);
    }

    #[test]
    fn test_statistics_accumulate() {
        let mut total = ResourceSetStatistics {
            connections: 3,
            max_publish_recipients: 9,
            ..Default::default()
        };
        total.accumulate(&ResourceSetStatistics {
            connections: 4,
            max_publish_recipients: 2,
            ..Default::default()
        });
        pretty_assert_eq!(total.connections, 7);
        pretty_assert_eq!(total.max_publish_recipients, 9);
    }

    #[test]
    fn test_statistics_accumulate_skips_since_restart_totals() {
        let mut total = ResourceSetStatistics::default();
        total.accumulate(&ResourceSetStatistics {
            published_msgs: 5,
            published_msgs_since_restart: 50,
            connections: 2,
            connections_since_restart: 20,
            max_publish_recipients: 3,
            max_publish_recipients_since_restart: 30,
            ..Default::default()
        });
        pretty_assert_eq!(total.published_msgs, 5);
        pretty_assert_eq!(total.connections, 2);
        pretty_assert_eq!(total.max_publish_recipients, 3);
        pretty_assert_eq!(total.published_msgs_since_restart, 0);
        pretty_assert_eq!(total.connections_since_restart, 0);
        pretty_assert_eq!(total.max_publish_recipients_since_restart, 0);
    }

    // ---- Errors ----

    #[test]
    fn test_error_categories() {
        assert!(ResourceStatsError::AlreadyInProgress.is_recoverable());
        assert!(!ResourceStatsError::ReportingDisabled.is_recoverable());
        pretty_assert_eq!(ResourceStatsError::invalid_parameter("x").category(), "invalid_parameter");
        pretty_assert_eq!(
            ResourceStatsError::ShutdownTimeout { timeout: Duration::from_secs(1) }.category(),
            "shutdown"
        );
        let config: ResourceStatsError = ConfigError::invalid_value("a", "b").into();
        assert!(!config.is_recoverable());
    }

    // ---- Hashing & resolution ----

    #[test]
    fn test_resource_set_hash_known_values() {
        pretty_assert_eq!(resource_set_hash(""), 5381);
        pretty_assert_eq!(resource_set_hash("a"), 177_604);
        pretty_assert_eq!(resource_set_hash("org1"), resource_set_hash("org1"));
        assert_ne!(resource_set_hash("org1"), resource_set_hash("org2"));
    }

    #[test]
    fn test_resource_set_hash_signed_bytes() {
        let mut hasher = ResourceSetHasher::default();
        hasher.write(&[0xFF]);
        pretty_assert_eq!(hasher.finish(), 0xFFFD_4A5A);
    }

    #[test]
    fn test_truncate_identifier() {
        let long = "a".repeat(200);
        pretty_assert_eq!(truncate_identifier(&long).len(), MAX_RESOURCE_SET_ID_LENGTH);
        pretty_assert_eq!(truncate_identifier("short"), "short");

        // 'a' then two-byte characters: byte 128 falls inside one
        let multibyte = format!("a{}", "é".repeat(100));
        let cut = truncate_identifier(&multibyte);
        pretty_assert_eq!(cut.len(), 127);
        assert!(cut.ends_with('é'));
    }

    #[test]
    fn test_resolver_client_id_then_topic() {
        let resolver = IdentifierResolver::new(r"^([^-]+)-", r"^tenants/([^/]+)/")
            .unwrap()
            .unwrap();
        pretty_assert_eq!(resolver.extract(Some("acme-device1"), Some("tenants/other/x")), Some("acme"));
        pretty_assert_eq!(resolver.extract(Some("nodash"), Some("tenants/globex/x")), Some("globex"));
        pretty_assert_eq!(resolver.extract(None, Some("tenants/globex/x")), Some("globex"));
        pretty_assert_eq!(resolver.extract(Some("nodash"), Some("elsewhere")), None);
    }

    #[test]
    fn test_resolver_non_participating_group_falls_through() {
        let resolver = IdentifierResolver::new(r"^(?:x|([a-z]+)-)", r"^t/([a-z]+)").unwrap().unwrap();
        pretty_assert_eq!(resolver.extract(Some("x"), Some("t/fallback")), Some("fallback"));
    }

    #[test]
    fn test_resolver_rejects_bad_patterns() {
        assert!(matches!(
            IdentifierResolver::new("([a-", ""),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(matches!(
            IdentifierResolver::new("", "^no-groups$"),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(IdentifierResolver::new("", "").unwrap().is_none());
    }

    #[test]
    fn test_wildcard_pattern() {
        let pattern = WildcardPattern::new("org.*1").unwrap();
        assert!(!pattern.is_match("orgX1"));
        let pattern = WildcardPattern::new("org*").unwrap();
        assert!(pattern.is_match("org"));
        assert!(pattern.is_match("org123"));
        assert!(!pattern.is_match("xorg"));
    }

    #[test]
    fn test_resolve_modes() {
        let stats = tracked_stats(true);
        assert!(stats
            .resolve(Some("acme-1"), None, ResolveMode::LookupOnly)
            .unwrap()
            .is_none());

        let created = stats
            .resolve(Some("acme-1"), None, ResolveMode::LookupOrCreate)
            .unwrap()
            .unwrap();
        pretty_assert_eq!(created.id(), "acme");

        let found = stats
            .resolve(Some("acme-2"), None, ResolveMode::LookupOnly)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&created, &found));

        let unmatched = stats
            .resolve(Some("nodash"), Some("nowhere"), ResolveMode::LookupOrCreate)
            .unwrap()
            .unwrap();
        pretty_assert_eq!(unmatched.id(), DEFAULT_RESOURCE_SET_ID);
        pretty_assert_eq!(stats.table().len(), 1);
    }

    #[test]
    fn test_unmatched_ignored_without_default_set() {
        let stats = tracked_stats(false);
        assert!(stats.default_set().is_none());
        assert!(stats
            .resolve(Some("nodash"), None, ResolveMode::LookupOrCreate)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_tracking_disabled_without_patterns() {
        assert!(ResourceSetStats::init(&TrackingConfig::default()).unwrap().is_none());
    }

    // ---- Table ----

    #[test]
    fn test_concurrent_get_or_create_is_unique() {
        const THREADS: usize = 8;
        let table = Arc::new(ResourceSetTable::new(16, true, None));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    table.get_or_create("org042").unwrap()
                })
            })
            .collect();

        let sets: Vec<ResourceSetHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for set in &sets[1..] {
            assert!(Arc::ptr_eq(&sets[0], set));
        }
        pretty_assert_eq!(table.len(), 1);
        assert!(table.discarded_creations() < THREADS as u64);
    }

    #[test]
    fn test_enumerate_visits_default_set_first() {
        let table = ResourceSetTable::new(4, true, None);
        table.get_or_create("b").unwrap();
        table.get_or_create("a").unwrap();

        let mut seen = Vec::new();
        table.enumerate(|set, _| seen.push(set.id().to_string()));
        pretty_assert_eq!(seen.len(), 3);
        pretty_assert_eq!(seen[0], DEFAULT_RESOURCE_SET_ID);

        let mut single = Vec::new();
        table.enumerate_single(DEFAULT_RESOURCE_SET_ID, |set, _| single.push(set.id().to_string()));
        pretty_assert_eq!(single, vec![DEFAULT_RESOURCE_SET_ID.to_string()]);
    }

    #[test]
    fn test_mem_trace_selection() {
        let table = ResourceSetTable::new(4, true, Some(WildcardPattern::new("acme*").unwrap()));
        assert!(table.get_or_create("acme1").unwrap().is_memory_traced());
        assert!(!table.get_or_create("globex").unwrap().is_memory_traced());
    }

    #[test]
    fn test_destroy_all_keeps_handles_usable() {
        let stats = tracked_stats(true);
        let set = set_stat(&stats, "acme", ResourceSetStat::Connections, 3);
        stats.destroy();
        assert!(stats.table().is_empty());
        pretty_assert_eq!(set.value(ResourceSetStat::Connections), 3);
    }

    // ---- Merge & reset ----

    #[test]
    fn test_merge_cumulative_and_maximum() {
        let set = ResourceSet::new("acme", false);
        let mut local = EMPTY_STATS;
        local[ResourceSetStat::Connections.index()] = 4;
        local[ResourceSetStat::MaxPublishRecipients.index()] = 7;
        set.merge(&local);

        local[ResourceSetStat::MaxPublishRecipients.index()] = 3;
        set.merge(&local);

        pretty_assert_eq!(set.value(ResourceSetStat::Connections), 8);
        pretty_assert_eq!(set.value(ResourceSetStat::MaxPublishRecipients), 7);
    }

    #[test]
    fn test_reset_preserves_since_restart_and_gauges() {
        let stats = tracked_stats(true);
        let set = set_stat(&stats, "acme", ResourceSetStat::Qos0MsgsPublished, 10);
        set_stat(&stats, "acme", ResourceSetStat::Connections, 4);
        set_stat(&stats, "acme", ResourceSetStat::MaxPublishRecipients, 7);
        set_stat(&stats, "acme", ResourceSetStat::TotalMemory, 100);

        let before = stats.reset_time();
        let after = stats.reset_all();
        assert!(after >= before);
        pretty_assert_eq!(stats.reset_time(), after);

        let view = set.statistics();
        pretty_assert_eq!(view.published_msgs, 0);
        pretty_assert_eq!(view.published_msgs_since_restart, 10);
        pretty_assert_eq!(view.connections, 0);
        pretty_assert_eq!(view.connections_since_restart, 4);
        pretty_assert_eq!(view.max_publish_recipients, 0);
        pretty_assert_eq!(view.max_publish_recipients_since_restart, 7);
        pretty_assert_eq!(view.total_memory_bytes, 100);

        // A second reset with no new traffic changes nothing
        stats.reset_all();
        pretty_assert_eq!(set.statistics(), view);
    }

    // ---- Thread cache ----

    #[test]
    fn test_thread_cache_eviction_uses_last_slot() {
        let table = ResourceSetTable::new(4, false, None);
        let sets: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| table.get_or_create(id).unwrap())
            .collect();

        let mut cache = ThreadCache::new();
        for set in &sets[..3] {
            cache.accumulate(set, ResourceSetStat::Connections, 1);
        }
        pretty_assert_eq!(sets[2].value(ResourceSetStat::Connections), 0);

        cache.accumulate(&sets[3], ResourceSetStat::Connections, 1);
        pretty_assert_eq!(cache.slot_of(&sets[3]), Some(THREAD_CACHE_EVICTION_SLOT));
        pretty_assert_eq!(cache.slot_of(&sets[2]), None);
        pretty_assert_eq!(sets[2].value(ResourceSetStat::Connections), 1);
        pretty_assert_eq!(cache.slot_of(&sets[0]), Some(0));
        pretty_assert_eq!(cache.slot_of(&sets[1]), Some(1));

        cache.flush_all();
        assert!(cache.is_empty());
        for set in &sets {
            pretty_assert_eq!(set.value(ResourceSetStat::Connections), 1);
        }
    }

    #[test]
    fn test_thread_cache_unbound_slot_is_internal_error() {
        let mut cache = ThreadCache::new();
        assert!(matches!(
            cache.accumulate_in(1, ResourceSetStat::Connections, 1),
            Err(ResourceStatsError::Internal(_))
        ));

        let set = Arc::new(ResourceSet::new("acme", false));
        let slot = cache.resolve_slot(&set);
        cache.accumulate_in(slot, ResourceSetStat::Connections, 5).unwrap();
        pretty_assert_eq!(cache.pending(slot, ResourceSetStat::Connections), 5);
        assert!(Arc::ptr_eq(cache.bound_set(slot).unwrap(), &set));
    }

    #[test]
    fn test_thread_cache_slot_and_handle_paths_agree() {
        let by_handle = Arc::new(ResourceSet::new("acme", false));
        let by_slot = Arc::new(ResourceSet::new("acme", false));
        let mut cache = ThreadCache::new();
        let updates = [
            (ResourceSetStat::Qos0MsgsPublished, 4),
            (ResourceSetStat::MaxPublishRecipients, 7),
            (ResourceSetStat::Qos0MsgsPublished, 3),
            (ResourceSetStat::MaxPublishRecipients, 2),
        ];
        for (stat, value) in updates {
            cache.accumulate(&by_handle, stat, value);
            let slot = cache.resolve_slot(&by_slot);
            cache.accumulate_in(slot, stat, value).unwrap();
        }

        let handle_slot = cache.slot_of(&by_handle).unwrap();
        let slot = cache.slot_of(&by_slot).unwrap();
        for stat in [ResourceSetStat::Qos0MsgsPublished, ResourceSetStat::MaxPublishRecipients] {
            pretty_assert_eq!(cache.pending(handle_slot, stat), cache.pending(slot, stat));
        }
        pretty_assert_eq!(cache.pending(slot, ResourceSetStat::Qos0MsgsPublished), 7);
        pretty_assert_eq!(cache.pending(slot, ResourceSetStat::MaxPublishRecipients), 7);
    }

    #[test]
    fn test_thread_cache_flushes_on_drop() {
        let set = Arc::new(ResourceSet::new("acme", false));
        {
            let mut cache = ThreadCache::new();
            cache.accumulate(&set, ResourceSetStat::RejectedMsgs, 2);
        }
        pretty_assert_eq!(set.value(ResourceSetStat::RejectedMsgs), 2);
    }

    #[test]
    fn test_thread_local_cache_flushes_on_thread_exit() {
        let set = Arc::new(ResourceSet::new("acme", false));
        let worker_set = Arc::clone(&set);
        thread::spawn(move || record_stat(&worker_set, ResourceSetStat::Connections, 3))
            .join()
            .unwrap();
        pretty_assert_eq!(set.value(ResourceSetStat::Connections), 3);
    }

    #[test]
    fn test_scenario_two_threads_with_forced_eviction() {
        let stats = tracked_stats(true);
        let target = stats.table().get_or_create("org007").unwrap();

        let workers: Vec<_> = (0..2)
            .map(|worker| {
                let stats = Arc::clone(&stats);
                let target = Arc::clone(&target);
                thread::spawn(move || {
                    let table = stats.table();
                    let mut cache = ThreadCache::new();
                    // Pin the sticky slots so org007 lands in the rotating one
                    cache.accumulate(&table.get_or_create(&format!("pin{}a", worker)).unwrap(), ResourceSetStat::TotalMemory, 0);
                    cache.accumulate(&table.get_or_create(&format!("pin{}b", worker)).unwrap(), ResourceSetStat::TotalMemory, 0);

                    for i in 0..100 {
                        cache.accumulate(&target, ResourceSetStat::Connections, 1);
                        if (i + 1) % 10 == 0 {
                            let rotate = table.get_or_create(&format!("rotate{}-{}", worker, i)).unwrap();
                            cache.accumulate(&rotate, ResourceSetStat::Connections, 0);
                            pretty_assert_eq!(cache.slot_of(&target), None);
                        }
                    }
                    cache.flush_all();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let results = stats.get_monitor(MonitorType::HighestConnections, 1, Some("org007")).unwrap();
        pretty_assert_eq!(results.len(), 1);
        pretty_assert_eq!(results.results[0].stats.connections, 200);
    }

    #[test]
    fn test_scenario_maximum_survives_flushes() {
        let set = Arc::new(ResourceSet::new("org1", false));
        let mut cache = ThreadCache::new();
        for (i, value) in [5, 9, 3, 9, 1].into_iter().enumerate() {
            cache.accumulate(&set, ResourceSetStat::MaxPublishRecipients, value);
            if i == 1 || i == 3 {
                cache.flush_all();
            }
        }
        cache.flush_all();
        pretty_assert_eq!(set.value(ResourceSetStat::MaxPublishRecipients), 9);
    }

    proptest! {
        #[test]
        fn prop_cumulative_merge_is_additive(
            updates in prop::collection::vec((0usize..3, 0usize..5, -1000i64..1000, any::<bool>()), 0..200)
        ) {
            let table = ResourceSetTable::new(8, false, None);
            let sets: Vec<_> = (0..5).map(|i| table.get_or_create(&format!("set{}", i)).unwrap()).collect();
            let mut caches: Vec<ThreadCache> = (0..3).map(|_| ThreadCache::new()).collect();
            let mut expected = [0i64; 5];

            for (cache, set, value, flush) in updates {
                caches[cache].accumulate(&sets[set], ResourceSetStat::Connections, value);
                expected[set] += value;
                if flush {
                    caches[cache].flush_all();
                }
            }
            for cache in caches.iter_mut() {
                cache.flush_all();
            }

            for (set, expected) in sets.iter().zip(expected) {
                prop_assert_eq!(set.value(ResourceSetStat::Connections), expected);
            }
        }

        #[test]
        fn prop_maximum_merge_is_true_maximum(
            updates in prop::collection::vec((0usize..3, 0i64..10_000, any::<bool>()), 1..100)
        ) {
            let set = Arc::new(ResourceSet::new("max", false));
            let mut caches: Vec<ThreadCache> = (0..3).map(|_| ThreadCache::new()).collect();
            let expected = updates.iter().map(|(_, value, _)| *value).max().unwrap_or(0);

            for (cache, value, flush) in updates {
                caches[cache].accumulate(&set, ResourceSetStat::MaxPublishRecipients, value);
                if flush {
                    caches[cache].flush_all();
                }
            }
            for cache in caches.iter_mut() {
                cache.flush_all();
            }
            prop_assert_eq!(set.value(ResourceSetStat::MaxPublishRecipients), expected);
        }
    }

    // ---- Monitor type mapping ----

    #[test_case("44", false => MonitorType::HighestTotalMemoryBytes ; "numeric code")]
    #[test_case("-2", false => MonitorType::None ; "negative code")]
    #[test_case("9999", false => MonitorType::None ; "code out of range")]
    #[test_case("57", false => MonitorType::None ; "fake code without allow")]
    #[test_case("57", true => MonitorType::FakeHourly ; "fake code with allow")]
    #[test_case("FakeWeekly", false => MonitorType::None ; "fake name without allow")]
    #[test_case("fakeweekly", true => MonitorType::FakeWeekly ; "fake name with allow")]
    #[test_case("totalmemorybyteshighest", false => MonitorType::HighestTotalMemoryBytes ; "case insensitive")]
    #[test_case("AllUnsorted", false => MonitorType::AllUnsorted ; "unsorted")]
    #[test_case("None", false => MonitorType::None ; "explicit none")]
    #[test_case("Bogus", false => MonitorType::None ; "unknown name")]
    #[test_case("", false => MonitorType::None ; "empty")]
    fn test_from_stat_type(text: &str, allow_fake: bool) -> MonitorType {
        MonitorType::from_stat_type(text, allow_fake)
    }

    #[rstest]
    #[case(MonitorType::HighestConnections, "ConnectionsHighest")]
    #[case(MonitorType::HighestPublishedQos1Msgs, "QoS1PublishedMsgsHighest")]
    #[case(MonitorType::AllUnsorted, "AllUnsorted")]
    #[case(MonitorType::LowestBufferedMsgs, "None")]
    #[case(MonitorType::FakeDaily, "FakeDaily")]
    fn test_stat_type_names(#[case] monitor_type: MonitorType, #[case] expected: &str) {
        pretty_assert_eq!(monitor_type.stat_type(), expected);
        pretty_assert_eq!(monitor_type.to_string(), expected);
    }

    #[test]
    fn test_monitor_type_codes_are_dense() {
        for (code, monitor_type) in MonitorType::ALL.iter().enumerate() {
            pretty_assert_eq!(monitor_type.code() as usize, code);
            pretty_assert_eq!(MonitorType::from_code(code as u32), Some(*monitor_type));
        }
        pretty_assert_eq!(MonitorType::from_code(60), None);
    }

    #[test]
    fn test_catalog_names_round_trip() {
        for (monitor_type, name) in MONITOR_TYPE_CATALOG {
            pretty_assert_eq!(MonitorType::from_stat_type(name, true), monitor_type);
            if monitor_type != MonitorType::AllUnsorted && !monitor_type.is_fake() && monitor_type != MonitorType::None {
                assert!(monitor_type.is_resource_set_sort(), "{} should sort", name);
            }
        }
    }

    // ---- Monitoring query ----

    #[test]
    fn test_get_monitor_sorts_and_folds_remainder() {
        let stats = tracked_stats(true);
        for i in 1..=5 {
            set_stat(&stats, &format!("s{}", i), ResourceSetStat::Connections, i);
        }

        let results = stats.get_monitor(MonitorType::HighestConnections, 3, None).unwrap();
        let ids: Vec<_> = results.results.iter().map(|m| m.display_id().to_string()).collect();
        pretty_assert_eq!(ids, vec!["s5", "s4", "s3"]);

        let other = results.other_sets.expect("other sets");
        pretty_assert_eq!(other.resource_set_id, None);
        pretty_assert_eq!(other.display_id(), OTHER_RESOURCE_SETS_ID);
        pretty_assert_eq!(other.stats.connections, 3);
        pretty_assert_eq!(other.report_time, results.results[0].report_time);
    }

    #[test]
    fn test_get_monitor_ties_keep_enumeration_order() {
        let stats = tracked_stats(false);
        set_stat(&stats, "a", ResourceSetStat::Connections, 2);
        set_stat(&stats, "b", ResourceSetStat::Connections, 2);

        let sorted = stats.get_monitor(MonitorType::HighestConnections, 10, None).unwrap();
        let mut enumerated = Vec::new();
        stats.table().enumerate(|set, _| enumerated.push(set.id().to_string()));
        let ids: Vec<_> = sorted.results.iter().map(|m| m.display_id().to_string()).collect();
        pretty_assert_eq!(ids, enumerated);
    }

    #[test]
    fn test_get_monitor_all_unsorted() {
        let stats = tracked_stats(true);
        set_stat(&stats, "a", ResourceSetStat::TotalMemory, 10);
        set_stat(&stats, "b", ResourceSetStat::TotalMemory, 20);

        let results = stats.get_monitor(MonitorType::AllUnsorted, 0, None).unwrap();
        pretty_assert_eq!(results.len(), 3);
        pretty_assert_eq!(results.results[0].display_id(), DEFAULT_RESOURCE_SET_ID);
        assert!(results.other_sets.is_none());
    }

    #[test]
    fn test_get_monitor_rejects_bad_parameters() {
        let stats = tracked_stats(true);
        assert!(matches!(
            stats.get_monitor(MonitorType::LowestBufferedMsgs, 5, None),
            Err(ResourceStatsError::InvalidParameter { .. })
        ));
        assert!(matches!(
            stats.get_monitor(MonitorType::None, 5, None),
            Err(ResourceStatsError::InvalidParameter { .. })
        ));
        assert!(matches!(
            stats.get_monitor(MonitorType::HighestConnections, 0, None),
            Err(ResourceStatsError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_get_monitor_unknown_id_is_empty() {
        let stats = tracked_stats(true);
        set_stat(&stats, "org1", ResourceSetStat::Connections, 1);

        let results = stats.get_monitor(MonitorType::HighestConnections, 5, Some("org999")).unwrap();
        assert!(results.is_empty());
        assert!(results.other_sets.is_none());
    }

    #[test]
    fn test_get_monitor_filters() {
        let stats = tracked_stats(true);
        set_stat(&stats, "org1", ResourceSetStat::Connections, 1);
        set_stat(&stats, "org2", ResourceSetStat::Connections, 2);
        set_stat(&stats, "corp", ResourceSetStat::Connections, 3);

        let default_only = stats
            .get_monitor(MonitorType::AllUnsorted, 0, Some(DEFAULT_RESOURCE_SET_ID))
            .unwrap();
        pretty_assert_eq!(default_only.len(), 1);

        let wildcard = stats.get_monitor(MonitorType::HighestConnections, 10, Some("org*")).unwrap();
        let ids: Vec<_> = wildcard.results.iter().map(|m| m.display_id().to_string()).collect();
        pretty_assert_eq!(ids, vec!["org2", "org1"]);

        let everything = stats.get_monitor(MonitorType::AllUnsorted, 0, Some("*")).unwrap();
        pretty_assert_eq!(everything.len(), 4);
    }

    // ---- Configuration ----

    #[test]
    fn test_config_defaults() {
        let config = ResourceStatsConfig::default();
        assert!(!config.tracking.is_enabled());
        assert!(config.tracking.track_unmatched);
        assert!(config.reporting.enabled);
        pretty_assert_eq!(config.reporting.shutdown_timeout, Duration::from_secs(60));

        let schedule = config.reporting.schedule();
        assert!(!schedule.any_enabled());
        pretty_assert_eq!(schedule.minutes_past, None);
    }

    #[test]
    fn test_config_iot_defaults() {
        let config = ResourceStatsConfig::from_str(
            r#"
            [tracking]
            client_id_pattern = "^([^-]+)-"

            [reporting]
            environment = "iot"
            server_uid = "server-a"
            shutdown_timeout = "5s"
            "#,
        )
        .unwrap();

        pretty_assert_eq!(config.reporting.shutdown_timeout, Duration::from_secs(5));
        let schedule = config.reporting.schedule();
        pretty_assert_eq!(schedule.weekly.monitor_type, MonitorType::AllUnsorted);
        pretty_assert_eq!(schedule.weekly.max_results, DEFAULT_WEEKLY_MAX_RESULTS);
        pretty_assert_eq!(schedule.daily.monitor_type, MonitorType::HighestTotalMemoryBytes);
        pretty_assert_eq!(schedule.daily.max_results, DEFAULT_DAILY_MAX_RESULTS);
        pretty_assert_eq!(schedule.hourly.monitor_type, MonitorType::HighestTotalMemoryBytes);
        pretty_assert_eq!(schedule.hourly.max_results, DEFAULT_HOURLY_MAX_RESULTS);

        let minutes = schedule.minutes_past.unwrap();
        assert!((15..=45).contains(&minutes));
        pretty_assert_eq!(schedule.minutes_past, resolve_minutes_past(None, true, Some("server-a")));
    }

    #[test]
    fn test_config_explicit_schedule() {
        let config = ResourceStatsConfig::from_str(
            r#"
            [reporting]
            minutes_past_hour = 75

            [reporting.weekly]
            stat_type = "ConnectionsHighest"
            day_of_week = 9
            hour_of_day = 26
            reset_stats = true

            [reporting.hourly]
            stat_type = "Bogus"
            "#,
        )
        .unwrap();

        let schedule = config.reporting.schedule();
        pretty_assert_eq!(schedule.weekly.monitor_type, MonitorType::HighestConnections);
        assert!(schedule.weekly.reset_stats);
        pretty_assert_eq!(schedule.weekly_day, 2);
        pretty_assert_eq!(schedule.weekly_hour, 2);
        assert!(!schedule.hourly.is_enabled());
        pretty_assert_eq!(schedule.minutes_past, Some(15));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(
            ResourceStatsConfig::from_str("[tracking]\nclient_id_pattern = \"([a-\"\n"),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(matches!(
            ResourceStatsConfig::from_str("[tracking]\ninitial_capacity = 0\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ResourceStatsConfig::from_str("[reporting]\nshutdown_timeout = \"0s\"\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ResourceStatsConfig::from_str("not toml ="),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource-stats.toml");
        fs::write(&path, "[tracking]\ntopic_pattern = \"^t/([^/]+)\"\n[logging]\nformat = \"json\"\n").unwrap();

        let config = ResourceStatsConfig::load(&path).unwrap();
        assert!(config.tracking.is_enabled());
        pretty_assert_eq!(config.logging.format, "json");

        assert!(matches!(
            ResourceStatsConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_version_summary_reports_limits_and_schedule() {
        let summary = version_summary(&ResourceStatsConfig::default());
        assert!(summary.contains(ENGINE_VERSION));
        assert!(summary.contains("Id length: 128 bytes"));
        assert!(summary.contains("Thread cache: 3 slots (2 sticky)"));
        assert!(summary.contains(&format!("Initial table capacity: {}", INITIAL_TABLE_CAPACITY)));
        assert!(summary.contains("Weekly: off"));
        assert!(summary.contains("Nothing scheduled"));
        assert!(summary.contains("Shutdown timeout: 60s"));

        let config = ResourceStatsConfig::from_str(
            r#"
            [reporting]
            environment = "iot"
            server_uid = "server-a"
            "#,
        )
        .unwrap();
        let minutes = config.reporting.schedule().minutes_past.unwrap();
        let summary = version_summary(&config);
        assert!(summary.contains(&format!(
            "Daily: {} (top {})",
            MonitorType::HighestTotalMemoryBytes,
            DEFAULT_DAILY_MAX_RESULTS
        )));
        assert!(summary.contains(&format!("Runs at {} minutes past the hour", minutes)));
    }

    #[test]
    fn test_generated_config_parses() {
        let generated = ResourceStatsConfig::generate_default_config();
        let config = ResourceStatsConfig::from_str(&generated).unwrap();
        pretty_assert_eq!(config.tracking.initial_capacity, INITIAL_TABLE_CAPACITY);
    }

    #[test]
    fn test_resolve_minutes_past() {
        pretty_assert_eq!(resolve_minutes_past(Some(75), false, None), Some(15));
        pretty_assert_eq!(resolve_minutes_past(Some(0), true, Some("x")), Some(0));
        pretty_assert_eq!(resolve_minutes_past(Some(-1), false, None), None);
        pretty_assert_eq!(resolve_minutes_past(None, true, None), Some(MINUTES_PAST_BASE));
        for uid in ["a", "server-a", "broker-17", "zzz"] {
            let minutes = resolve_minutes_past(None, true, Some(uid)).unwrap();
            assert!((15..=45).contains(&minutes), "{} -> {}", uid, minutes);
        }
    }

    // ---- Schedule ----

    fn test_schedule() -> ReportSchedule {
        ReportSchedule {
            weekly: ScheduledReport {
                monitor_type: MonitorType::HighestConnections,
                max_results: 10,
                reset_stats: true,
            },
            weekly_day: 3,
            weekly_hour: 2,
            daily: ScheduledReport {
                monitor_type: MonitorType::AllUnsorted,
                max_results: 5,
                reset_stats: false,
            },
            daily_hour: 2,
            hourly: ScheduledReport {
                monitor_type: MonitorType::HighestTotalMemoryBytes,
                max_results: 1,
                reset_stats: false,
            },
            minutes_past: Some(20),
        }
    }

    #[test]
    fn test_schedule_priority() {
        let schedule = test_schedule();

        let weekly = schedule.due_at(3, 2).unwrap();
        pretty_assert_eq!(weekly.kind, ReportKind::Weekly);
        assert!(weekly.include_since_restart);

        let daily = schedule.due_at(4, 2).unwrap();
        pretty_assert_eq!(daily.kind, ReportKind::Daily);
        assert!(!daily.include_since_restart);

        pretty_assert_eq!(schedule.due_at(3, 5).unwrap().kind, ReportKind::Hourly);
        pretty_assert_eq!(schedule.due_at(FAKE_WEEKDAY, FAKE_HOUR).unwrap().kind, ReportKind::Hourly);

        let no_hourly = ReportSchedule {
            hourly: ScheduledReport::DISABLED,
            ..schedule
        };
        pretty_assert_eq!(no_hourly.due_at(3, 5), None);
    }

    #[test]
    fn test_wait_duration_ignores_seconds() {
        let schedule = test_schedule();
        pretty_assert_eq!(schedule.wait_duration(5), Some(Duration::from_secs(15 * 60)));
        pretty_assert_eq!(schedule.wait_duration(20), Some(Duration::from_secs(60 * 60)));
        pretty_assert_eq!(schedule.wait_duration(50), Some(Duration::from_secs(30 * 60)));
        pretty_assert_eq!(ReportSchedule::default().wait_duration(5), None);
    }

    // ---- Report records ----

    #[test]
    fn test_report_json_key_order() {
        let stats = ResourceSetStatistics {
            total_memory_bytes: 1024,
            connections: 3,
            connections_since_restart: 8,
            ..Default::default()
        };
        let monitor = monitor_with(Some("org1"), stats);
        let record = ReportRecord::build(MonitorType::HighestConnections, 1, 2, &monitor, "R", "T", true).unwrap();
        let json = &record.statistics_json;

        assert!(json.starts_with(r#"{"ResourceSetID":"org1","ResetTime":"R","ReportTime":"T","Stats":{"TotalMemoryBytes":1024,"#));
        assert!(json.ends_with(r#""ConnectionsSinceRestart":8}}"#));

        let keys = [
            "TotalMemoryBytes",
            "Subscriptions",
            "PersistentNonSharedSubscriptions",
            "NonpersistentNonSharedSubscriptions",
            "PersistentSharedSubscriptions",
            "NonpersistentSharedSubscriptions",
            "BufferedMsgs",
            "DiscardedMsgs",
            "RejectedMsgs",
            "RetainedMsgs",
            "WillMsgs",
            "BufferedMsgBytes",
            "PersistentBufferedMsgBytes",
            "NonpersistentBufferedMsgBytes",
            "RetainedMsgBytes",
            "WillMsgBytes",
            "PersistentWillMsgBytes",
            "NonpersistentWillMsgBytes",
            "PublishedMsgs",
            "QoS0PublishedMsgs",
            "QoS1PublishedMsgs",
            "QoS2PublishedMsgs",
            "PublishedMsgBytes",
            "QoS0PublishedMsgBytes",
            "QoS1PublishedMsgBytes",
            "QoS2PublishedMsgBytes",
            "MaxPublishRecipients",
            "Connections",
            "ActiveClients",
            "ActivePersistentClients",
            "ActiveNonpersistentClients",
            "PersistentClientStates",
            "DiscardedMsgsSinceRestart",
            "PublishedMsgsSinceRestart",
            "PublishedMsgBytesSinceRestart",
            "MaxPublishRecipientsSinceRestart",
            "ConnectionsSinceRestart",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|key| json.find(&format!("\"{}\":", key)).unwrap_or_else(|| panic!("missing {}", key)))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_report_json_omits_since_restart() {
        let monitor = monitor_with(Some("org1"), ResourceSetStatistics::default());
        let record = ReportRecord::build(MonitorType::HighestConnections, 1, 1, &monitor, "R", "T", false).unwrap();
        assert!(!record.statistics_json.contains("SinceRestart"));
        assert!(record.statistics_json.ends_with(r#""PersistentClientStates":0}}"#));
    }

    #[test]
    fn test_report_messages() {
        let stats = ResourceSetStatistics {
            total_memory_bytes: 2048,
            ..Default::default()
        };

        let sorted = ReportRecord::build(MonitorType::HighestConnections, 1, 2, &monitor_with(Some("org1"), stats), "R", "T", false).unwrap();
        pretty_assert_eq!(
            sorted.message(),
            format!(
                "ResourceSetID org1 is set 1 of 2 sorted by StatType ConnectionsHighest. Full statistics: {}",
                sorted.statistics_json
            )
        );

        let unsorted = ReportRecord::build(MonitorType::AllUnsorted, 1, 2, &monitor_with(Some("org1"), stats), "R", "T", false).unwrap();
        pretty_assert_eq!(
            unsorted.message(),
            format!("ResourceSetID org1 has TotalMemoryBytes 2048. Full statistics: {}", unsorted.statistics_json)
        );

        let other = ReportRecord::build(MonitorType::HighestConnections, 3, 2, &monitor_with(None, stats), "R", "T", false).unwrap();
        assert!(!other.sorted);
        assert!(other
            .message()
            .starts_with("ResourceSetID __OtherResourceSets has TotalMemoryBytes 2048."));
    }

    #[test]
    fn test_emit_report_resets_after_snapshot() {
        let stats = tracked_stats(false);
        for (id, connections) in [("a", 5), ("b", 3), ("c", 1)] {
            set_stat(&stats, id, ResourceSetStat::Connections, connections);
        }
        let sink = MemoryReportSink::new();
        let plan = ReportPlan {
            kind: ReportKind::OnDemand,
            report: ScheduledReport {
                monitor_type: MonitorType::HighestConnections,
                max_results: 2,
                reset_stats: true,
            },
            include_since_restart: true,
        };

        let reported = emit_report(&stats, &sink, &plan).unwrap();
        pretty_assert_eq!(reported, 2);

        let records = sink.records();
        let positions: Vec<_> = records.iter().map(|r| r.position).collect();
        pretty_assert_eq!(positions, vec![1, 2, 3]);
        pretty_assert_eq!(records[0].resource_set_id, "a");
        assert!(records[0].statistics_json.contains(r#""Connections":5"#));
        pretty_assert_eq!(records[2].resource_set_id, OTHER_RESOURCE_SETS_ID);
        assert!(records[2].statistics_json.contains(r#""Connections":1"#));

        let a = stats.table().lookup("a").unwrap().statistics();
        pretty_assert_eq!(a.connections, 0);
        pretty_assert_eq!(a.connections_since_restart, 5);
    }

    fn json_string_field(json: &str, key: &str) -> String {
        let document: serde_json::Value = serde_json::from_str(json).unwrap();
        document[key].as_str().unwrap().to_string()
    }

    #[test]
    fn test_emit_report_stamps_report_time_after_reset() {
        let stats = tracked_stats(false);
        set_stat(&stats, "a", ResourceSetStat::Connections, 2);
        let old_reset = stats.reset_time().to_local_iso8601();
        let sink = MemoryReportSink::new();
        let plan = ReportPlan {
            kind: ReportKind::OnDemand,
            report: ScheduledReport {
                monitor_type: MonitorType::HighestConnections,
                max_results: 1,
                reset_stats: true,
            },
            include_since_restart: false,
        };

        emit_report(&stats, &sink, &plan).unwrap();
        let new_reset = stats.reset_time().to_local_iso8601();

        let record = &sink.records()[0];
        let report_time = json_string_field(&record.statistics_json, "ReportTime");
        pretty_assert_eq!(json_string_field(&record.statistics_json, "ResetTime"), old_reset);
        assert!(report_time >= new_reset, "{} should not precede {}", report_time, new_reset);
    }

    #[test]
    fn test_emit_report_empty_table() {
        let stats = tracked_stats(false);
        let sink = MemoryReportSink::new();
        let plan = ReportPlan {
            kind: ReportKind::Hourly,
            report: ScheduledReport {
                monitor_type: MonitorType::AllUnsorted,
                max_results: 5,
                reset_stats: false,
            },
            include_since_restart: false,
        };
        pretty_assert_eq!(emit_report(&stats, &sink, &plan).unwrap(), 0);
        assert!(sink.is_empty());
    }

    // ---- Reporter ----

    #[test]
    fn test_reporter_on_demand_report() {
        let stats = tracked_stats(true);
        set_stat(&stats, "org1", ResourceSetStat::Connections, 4);
        let sink = Arc::new(MemoryReportSink::new());
        let reporter = ResourceSetReporter::start(
            Arc::clone(&stats),
            ReportSchedule::default(),
            sink.clone(),
            Duration::from_secs(5),
        )
        .unwrap();

        reporter.request_report(MonitorType::HighestConnections, 1, false).unwrap();
        assert!(reporter.wait_for_cycles(1, Duration::from_secs(5)));

        let records = sink.take();
        pretty_assert_eq!(records.len(), 2);
        pretty_assert_eq!(records[0].resource_set_id, "org1");
        assert!(records[0].sorted);
        assert!(records[0].statistics_json.contains("ConnectionsSinceRestart"));
        pretty_assert_eq!(records[1].position, 2);

        reporter.stop().unwrap();
        assert!(!reporter.is_running());
        assert!(matches!(
            reporter.request_report(MonitorType::AllUnsorted, 1, false),
            Err(ResourceStatsError::ReportingDisabled)
        ));
    }

    #[test]
    fn test_reporter_fake_daily_runs_daily_schedule() {
        let stats = tracked_stats(true);
        set_stat(&stats, "org1", ResourceSetStat::TotalMemory, 64);
        let sink = Arc::new(MemoryReportSink::new());
        let schedule = ReportSchedule {
            daily: ScheduledReport {
                monitor_type: MonitorType::AllUnsorted,
                max_results: 5,
                reset_stats: false,
            },
            daily_hour: 3,
            ..ReportSchedule::default()
        };
        let reporter = ResourceSetReporter::start(stats, schedule, sink.clone(), Duration::from_secs(5)).unwrap();

        reporter.request_report(MonitorType::FakeDaily, 0, false).unwrap();
        assert!(reporter.wait_for_cycles(1, Duration::from_secs(5)));
        let records = sink.take();
        pretty_assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.sorted));
        assert!(records.iter().all(|r| !r.statistics_json.contains("SinceRestart")));

        // No hourly report configured: the fake hourly wake reports nothing
        reporter.request_report(MonitorType::FakeHourly, 0, false).unwrap();
        assert!(reporter.wait_for_cycles(2, Duration::from_secs(5)));
        assert!(sink.is_empty());

        reporter.stop().unwrap();
    }

    #[test]
    fn test_reporter_rejects_invalid_requests() {
        let stats = tracked_stats(true);
        let reporter = ResourceSetReporter::start(
            stats,
            ReportSchedule::default(),
            Arc::new(MemoryReportSink::new()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(
            reporter.request_report(MonitorType::None, 5, false),
            Err(ResourceStatsError::InvalidParameter { .. })
        ));
        reporter.stop().unwrap();
    }

    #[test]
    fn test_reporter_request_checks_type_before_running_state() {
        let stats = tracked_stats(true);
        let reporter = ResourceSetReporter::start(
            stats,
            ReportSchedule::default(),
            Arc::new(MemoryReportSink::new()),
            Duration::from_secs(5),
        )
        .unwrap();
        reporter.stop().unwrap();

        assert!(matches!(
            reporter.request_report(MonitorType::None, 5, false),
            Err(ResourceStatsError::InvalidParameter { .. })
        ));
        assert!(matches!(
            reporter.request_report(MonitorType::HighestConnections, 5, false),
            Err(ResourceStatsError::ReportingDisabled)
        ));
    }

    #[test]
    fn test_scenario_duplicate_request_in_progress() {
        let stats = tracked_stats(true);
        set_stat(&stats, "org1", ResourceSetStat::Connections, 1);
        let (sink, entered, gate) = gate_sink();
        let reporter = ResourceSetReporter::start(stats, ReportSchedule::default(), sink.clone(), Duration::from_secs(5)).unwrap();

        reporter.request_report(MonitorType::HighestConnections, 5, false).unwrap();
        entered.recv_timeout(Duration::from_secs(5)).expect("report started");

        // The thread is busy with the first report; this one stays outstanding
        reporter.request_report(MonitorType::HighestConnections, 5, false).unwrap();
        assert!(matches!(
            reporter.request_report(MonitorType::AllUnsorted, 5, false),
            Err(ResourceStatsError::AlreadyInProgress)
        ));

        drop(gate);
        assert!(reporter.wait_for_cycles(2, Duration::from_secs(5)));

        reporter.request_report(MonitorType::AllUnsorted, 5, false).unwrap();
        assert!(reporter.wait_for_cycles(3, Duration::from_secs(5)));
        reporter.stop().unwrap();
        assert!(!sink.records.is_empty());
    }

    #[test]
    fn test_reporter_stop_times_out_on_stuck_thread() {
        let stats = tracked_stats(true);
        let (sink, entered, gate) = gate_sink();
        let reporter =
            ResourceSetReporter::start(stats, ReportSchedule::default(), sink, Duration::from_millis(50)).unwrap();

        reporter.request_report(MonitorType::AllUnsorted, 5, false).unwrap();
        entered.recv_timeout(Duration::from_secs(5)).expect("report started");

        assert!(matches!(reporter.stop(), Err(ResourceStatsError::ShutdownTimeout { .. })));
        drop(gate);
    }

    // ---- Engine ----

    #[test]
    fn test_engine_without_tracking() {
        let mut engine = ResourceStatsEngine::start(&ResourceStatsConfig::default(), Arc::new(TracingReportSink)).unwrap();
        assert!(!engine.is_tracking());
        assert!(engine.reporter().is_none());
        assert!(matches!(
            engine.request_report(MonitorType::AllUnsorted, 5, false),
            Err(ResourceStatsError::ReportingDisabled)
        ));
        assert!(matches!(
            engine.request_report(MonitorType::None, 5, false),
            Err(ResourceStatsError::InvalidParameter { .. })
        ));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_engine_reporting_disabled() {
        let config = ResourceStatsConfig {
            tracking: tracking_config(true),
            reporting: ReportingConfig {
                enabled: false,
                ..ReportingConfig::default()
            },
            ..ResourceStatsConfig::default()
        };
        let mut engine = ResourceStatsEngine::start(&config, Arc::new(TracingReportSink)).unwrap();
        assert!(engine.is_tracking());
        assert!(matches!(
            engine.request_report(MonitorType::AllUnsorted, 5, false),
            Err(ResourceStatsError::ReportingDisabled)
        ));
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_engine_replay_and_report() {
        let config = ResourceStatsConfig {
            tracking: tracking_config(true),
            ..ResourceStatsConfig::default()
        };
        let sink = Arc::new(MemoryReportSink::new());
        let mut engine = ResourceStatsEngine::start(&config, sink.clone()).unwrap();
        let stats = Arc::clone(engine.stats().unwrap());

        let events = parse_traffic_events(
            concat!(
                "# recorded traffic\n",
                "{\"client_id\":\"acme-1\",\"stat\":\"Connections\"}\n",
                "\n",
                "{\"client_id\":\"acme-2\",\"stat\":\"Connections\",\"value\":2}\n",
                "{\"topic\":\"tenants/globex/a\",\"stat\":\"Qos1MsgsPublished\",\"value\":7}\n",
                "{\"client_id\":\"stray\",\"stat\":\"RejectedMsgs\"}\n",
            )
            .as_bytes(),
        )
        .unwrap();
        pretty_assert_eq!(events.len(), 4);
        pretty_assert_eq!(apply_traffic_events(&stats, &events).unwrap(), 4);

        let acme = stats.table().lookup("acme").unwrap().statistics();
        pretty_assert_eq!(acme.connections, 3);
        pretty_assert_eq!(stats.table().lookup("globex").unwrap().statistics().published_msgs, 7);
        pretty_assert_eq!(stats.default_set().unwrap().statistics().rejected_msgs, 1);

        let reporter = engine.reporter().unwrap();
        let before = reporter.cycles_completed();
        engine.request_report(MonitorType::HighestConnections, 1, true).unwrap();
        assert!(engine.reporter().unwrap().wait_for_cycles(before + 1, Duration::from_secs(5)));
        pretty_assert_eq!(sink.records()[0].resource_set_id, "acme");
        pretty_assert_eq!(stats.table().lookup("acme").unwrap().statistics().connections, 0);

        engine.shutdown().unwrap();
        assert!(stats.table().is_empty());
    }

    #[test]
    fn test_parse_traffic_events_reports_line() {
        let input = "{\"stat\":\"Connections\"}\n\n{\"stat\":\"NoSuchStat\"}\n";
        match parse_traffic_events(input.as_bytes()) {
            Err(ResourceStatsError::InvalidParameter { message }) => assert!(message.contains("line 3"), "{}", message),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
