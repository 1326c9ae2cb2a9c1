/// Capacity of every bounded channel in the hub (inbound queue, per-connection
/// outbound and overflow queues).
pub const CHANNEL_SIZE: usize = 100;

/// Interval between liveness pings written to each connection.
pub const PING_INTERVAL_SECS: u64 = 10;

/// Read deadline; refreshed by any frame received from the client.
pub const READ_DEADLINE_SECS: u64 = 30;

/// Minimum ratio between the read deadline and the ping interval.
pub const MIN_DEADLINE_TO_PING_RATIO: u64 = 3;

/// Deadline applied to every call to an external collaborator.
pub const RPC_TIMEOUT_SECS: u64 = 3;

/// Time-to-live of a cached recent-message list.
pub const CACHE_TTL_SECS: u64 = 60;

/// Maximum number of envelopes kept in one cached list.
pub const CACHE_LIST_LIMIT: usize = 100;

/// Default HTTP / WebSocket port of the chat service.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Receiver ids starting with this character address a single user.
pub const USER_PREFIX: char = 'U';

/// Receiver ids starting with this character address a group.
pub const GROUP_PREFIX: char = 'G';

/// Prefix of every generated message id.
pub const MESSAGE_ID_PREFIX: char = 'M';

/// Number of random characters following [`MESSAGE_ID_PREFIX`].
pub const MESSAGE_ID_RANDOM_LEN: usize = 11;

/// Timestamp format used in outbound envelopes.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Signal id marking call events relayed through the server for history.
pub const PROXY_SIGNAL_ID: &str = "PROXY";

/// Signal types recorded in message history.
pub const RECORDED_SIGNAL_TYPES: [&str; 3] = ["start_call", "receive_call", "reject_call"];

// Canned frames

pub const WELCOME_TEXT: &str = "Welcome to the gogo chat server";
pub const FAREWELL_TEXT: &str = "Logged out";
pub const SERVER_BUSY_TEXT: &str =
    "Too many messages are being sent right now; your message was not delivered, please retry later";
pub const NOTICE_SERVER_ERROR: &str = "System message: delivery failed (server error)";
pub const NOTICE_NOT_IN_GROUP: &str =
    "System message: delivery failed, you are not a member of this group";
pub const NOTICE_NOT_FRIENDS: &str =
    "System message: delivery failed, please check your contact relationship";
