//! Centralized constants for telebatch.
//!
//! This module contains all configurable constants that control
//! album coalescing and API quota scheduling defaults.

use std::time::Duration;

// ============================================================================
// Album Coalescing Settings
// ============================================================================

/// How long a pending album waits for further members before delivery.
///
/// Telegram delivers the members of a media group as separate updates spaced
/// by tens of milliseconds, possibly out of order; each new member pushes the
/// deadline forward by this amount.
pub const ALBUM_DELAY: Duration = Duration::from_millis(250);

// ============================================================================
// API Quota Settings
// ============================================================================

/// Global API request quota per [`API_QUOTA_WINDOW`].
pub const API_QUOTA: u32 = 30;

/// Sliding window for the global quota.
pub const API_QUOTA_WINDOW: Duration = Duration::from_secs(1);

/// Per-group-chat request quota per [`API_QUOTA_PER_CHAT_WINDOW`].
pub const API_QUOTA_PER_CHAT: u32 = 20;

/// Sliding window for the per-chat quota.
pub const API_QUOTA_PER_CHAT_WINDOW: Duration = Duration::from_secs(60);

/// Tick of the scheduler's admission polling loop.
pub const DEFAULT_POLLING_RATE: Duration = Duration::from_millis(10);
