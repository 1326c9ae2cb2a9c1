use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;

use gogo_shared::types::{MessageStatus, MessageType};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "id, session_id, type, content, url, send_id, send_name, \
     send_avatar, receive_id, file_size, file_type, file_name, status, created_at, av_data";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                message.id,
                message.session_id,
                u8::from(message.message_type),
                message.content,
                message.url,
                message.send_id,
                message.send_name,
                message.send_avatar,
                message.receive_id,
                message.file_size,
                message.file_type,
                message.file_name,
                message.status.as_i64(),
                message.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                message.av_data,
            ],
        )?;
        Ok(())
    }

    /// Flip an unsent message to sent.
    ///
    /// Returns `false` when the message is unknown or already sent, so
    /// repeated deliveries of the same envelope update the row only once.
    pub fn mark_message_sent(&self, id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![
                MessageStatus::Sent.as_i64(),
                id,
                MessageStatus::Unsent.as_i64()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_message_by_id(&self, id: &str) -> Result<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let row = self
            .conn()
            .query_row(&sql, params![id], row_to_raw)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;
        row.into_message()
    }

    /// Most recent messages exchanged between two users, oldest first.
    pub fn list_conversation(&self, user_a: &str, user_b: &str, limit: u32) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (send_id = ?1 AND receive_id = ?2) OR (send_id = ?2 AND receive_id = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user_a, user_b, limit], row_to_raw)?;
        collect_oldest_first(rows)
    }

    /// Most recent messages addressed to a group, oldest first.
    pub fn list_group_messages(&self, group_id: &str, limit: u32) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE receive_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![group_id, limit], row_to_raw)?;
        collect_oldest_first(rows)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Column values as read from SQLite, before enum/timestamp conversion.
struct RawMessage {
    id: String,
    session_id: String,
    message_type: u8,
    content: String,
    url: String,
    send_id: String,
    send_name: String,
    send_avatar: String,
    receive_id: String,
    file_size: String,
    file_type: String,
    file_name: String,
    status: i64,
    created_at: String,
    av_data: String,
}

impl RawMessage {
    fn into_message(self) -> Result<Message> {
        let created_at: DateTime<Utc> =
            DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc);
        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            message_type: MessageType::try_from(self.message_type)?,
            content: self.content,
            url: self.url,
            send_id: self.send_id,
            send_name: self.send_name,
            send_avatar: self.send_avatar,
            receive_id: self.receive_id,
            file_size: self.file_size,
            file_type: self.file_type,
            file_name: self.file_name,
            status: MessageStatus::from_i64(self.status)?,
            created_at,
            av_data: self.av_data,
        })
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        message_type: row.get(2)?,
        content: row.get(3)?,
        url: row.get(4)?,
        send_id: row.get(5)?,
        send_name: row.get(6)?,
        send_avatar: row.get(7)?,
        receive_id: row.get(8)?,
        file_size: row.get(9)?,
        file_type: row.get(10)?,
        file_name: row.get(11)?,
        status: row.get(12)?,
        created_at: row.get(13)?,
        av_data: row.get(14)?,
    })
}

fn collect_oldest_first(
    rows: impl Iterator<Item = rusqlite::Result<RawMessage>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?.into_message()?);
    }
    messages.reverse();
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use gogo_shared::protocol::ChatRequest;

    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("chat.db")).unwrap();
        (dir, db)
    }

    fn text(from: &str, to: &str, content: &str) -> Message {
        Message::from_request(&ChatRequest {
            session_id: "S1".into(),
            message_type: MessageType::Text,
            content: content.into(),
            url: String::new(),
            send_id: from.into(),
            send_name: from.into(),
            send_avatar: String::new(),
            receive_id: to.into(),
            file_size: String::new(),
            file_type: String::new(),
            file_name: String::new(),
            av_data: String::new(),
        })
    }

    #[test]
    fn insert_and_fetch() {
        let (_dir, db) = open();
        let msg = text("U1", "U2", "hello");
        db.insert_message(&msg).unwrap();

        let fetched = db.get_message_by_id(&msg.id).unwrap();
        assert_eq!(fetched.content, "hello");
        assert_eq!(fetched.status, MessageStatus::Unsent);
        assert_eq!(fetched.created_at, msg.created_at);
    }

    #[test]
    fn missing_message_is_not_found() {
        let (_dir, db) = open();
        assert!(matches!(
            db.get_message_by_id("Mnope"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn mark_sent_happens_once() {
        let (_dir, db) = open();
        let msg = text("U1", "U2", "hello");
        db.insert_message(&msg).unwrap();

        assert!(db.mark_message_sent(&msg.id).unwrap());
        assert!(!db.mark_message_sent(&msg.id).unwrap());
        assert_eq!(
            db.get_message_by_id(&msg.id).unwrap().status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn conversation_covers_both_directions() {
        let (_dir, db) = open();
        db.insert_message(&text("U1", "U2", "one")).unwrap();
        db.insert_message(&text("U2", "U1", "two")).unwrap();
        db.insert_message(&text("U1", "U3", "other")).unwrap();
        db.insert_message(&text("U1", "U2", "three")).unwrap();

        let contents: Vec<_> = db
            .list_conversation("U2", "U1", 10)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        let latest: Vec<_> = db
            .list_conversation("U1", "U2", 2)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(latest, vec!["two", "three"]);
    }

    #[test]
    fn group_messages_by_receiver() {
        let (_dir, db) = open();
        db.insert_message(&text("U1", "G1", "hi all")).unwrap();
        db.insert_message(&text("U2", "G1", "hey")).unwrap();
        db.insert_message(&text("U2", "G2", "elsewhere")).unwrap();

        let msgs = db.list_group_messages("G1", 10).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].send_id, "U2");
    }
}
