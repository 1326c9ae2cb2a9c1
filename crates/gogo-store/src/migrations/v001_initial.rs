//! v001 -- Initial schema creation.
//!
//! Creates the `messages` and `group_info` tables.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,   -- M + 11 alphanumerics
    session_id  TEXT NOT NULL,
    type        INTEGER NOT NULL,            -- 0 text, 2 file, 3 audio/video
    content     TEXT NOT NULL,
    url         TEXT NOT NULL,
    send_id     TEXT NOT NULL,
    send_name   TEXT NOT NULL,
    send_avatar TEXT NOT NULL,
    receive_id  TEXT NOT NULL,               -- U... or G...
    file_size   TEXT NOT NULL,
    file_type   TEXT NOT NULL,
    file_name   TEXT NOT NULL,
    status      INTEGER NOT NULL DEFAULT 0,  -- 0 unsent, 1 sent
    created_at  TEXT NOT NULL,               -- RFC-3339, microsecond precision
    av_data     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(send_id, receive_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_receiver
    ON messages(receive_id, created_at);

-- ----------------------------------------------------------------
-- Group membership snapshots
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_info (
    id         TEXT PRIMARY KEY NOT NULL,    -- G...
    name       TEXT NOT NULL,
    owner_id   TEXT NOT NULL,
    members    TEXT NOT NULL,                -- JSON array, ordered
    member_cnt INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
