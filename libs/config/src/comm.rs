//! Communication layer constants
//!
//! Defaults shared by every channel, plus the fixed wire values that both
//! ends of a channel must agree on.

/// Reserved payload carried by end-of-stream frames
pub const EOF_SENTINEL: &[u8] = b"__COMM_EOF__\x00\xff";

/// Token joining child addresses into one compound address
pub const ADDRESS_SEPARATOR: &str = ":COMM_ADDRESS_SEPARATOR:";

/// Suffix of the environment variable holding a receiving channel's address
pub const RECV_ENV_SUFFIX: &str = "_IN";

/// Suffix of the environment variable holding a sending channel's address
pub const SEND_ENV_SUFFIX: &str = "_OUT";

/// Maximum payload bytes carried by one frame (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest message a channel reassembles from work channel chunks (256MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Frames an in-process queue holds before reporting "try again"
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Upper bound on `close(drain = true)` (milliseconds)
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Default bound on a blocking receive (milliseconds)
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 1_000;

/// Backlog loop sleep between retries and polls (milliseconds)
pub const DEFAULT_BACKLOG_SLEEP_MS: u64 = 1;

/// Bound on streaming the remainder of an oversized message (milliseconds)
pub const DEFAULT_WORK_TIMEOUT_MS: u64 = 10_000;

/// Directory holding Unix domain sockets
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/comm";
