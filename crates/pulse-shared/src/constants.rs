/// Application name
pub const APP_NAME: &str = "pulse";

/// Seconds a call may ring before it is marked missed
pub const CALL_RING_TIMEOUT_SECS: u64 = 30;

/// Bounds of the randomized local membership cache TTL, in seconds
pub const MEMBERSHIP_TTL_MIN_SECS: u64 = 60;
pub const MEMBERSHIP_TTL_MAX_SECS: u64 = 300;

/// Frames buffered per connection before the oldest is dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Seconds without an inbound frame before a connection is considered stale
pub const STALE_AFTER_SECS: u64 = 90;

/// Maximum accepted inbound frame size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// WebSocket close codes sent by the server
pub const CLOSE_SUPERSEDED: u16 = 4000;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_STALE: u16 = 4002;
