/// Application name
pub const APP_NAME: &str = "Courier";

/// Plain members may only withdraw messages younger than this (seconds).
pub const DEFAULT_WITHDRAW_WINDOW_SECS: u64 = 120;

/// Unanswered or unfinished call negotiations expire after this (seconds).
pub const DEFAULT_CALL_RING_TIMEOUT_SECS: u64 = 60;

/// Profile lookups are cached for one hour.
pub const DEFAULT_PROFILE_CACHE_TTL_SECS: u64 = 3600;

/// Outbound frames buffered per connection before frames are dropped.
pub const DEFAULT_CONNECTION_BUFFER: usize = 256;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Maximum size of a single inbound frame in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Characters of text content kept in a preview.
pub const PREVIEW_TEXT_LIMIT: usize = 30;

/// Marker prefixed to the preview of a withdrawn message.
pub const WITHDRAWN_PREVIEW_PREFIX: &str = "-[withdrawn]- ";

/// Content of a withdrawal before the user's recall note.
pub const WITHDRAW_CONTENT: &str = "withdrew a message";

/// History rows further apart than this get a date marker (seconds).
pub const HISTORY_DATE_GAP_SECS: i64 = 3600;

/// Default and maximum history page sizes.
pub const DEFAULT_HISTORY_LIMIT: u32 = 20;
pub const MAX_HISTORY_LIMIT: u32 = 100;
