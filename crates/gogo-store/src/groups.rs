use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::GroupInfo;

impl Database {
    // ------------------------------------------------------------------
    // Create / Update
    // ------------------------------------------------------------------

    /// Insert a group snapshot, replacing any previous one with the same id.
    pub fn upsert_group(&self, group: &GroupInfo) -> Result<()> {
        let members = serde_json::to_string(&group.members)?;
        self.conn().execute(
            "INSERT INTO group_info (id, name, owner_id, members, member_cnt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner_id = excluded.owner_id,
                members = excluded.members,
                member_cnt = excluded.member_cnt",
            params![
                group.id,
                group.name,
                group.owner_id,
                members,
                group.member_count() as i64,
                group.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_group(&self, id: &str) -> Result<GroupInfo> {
        let (id, name, owner_id, members, created_at) = self
            .conn()
            .query_row(
                "SELECT id, name, owner_id, members, created_at FROM group_info WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        let created_at: DateTime<Utc> =
            DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc);

        Ok(GroupInfo {
            id,
            name,
            owner_id,
            members: serde_json::from_str(&members)?,
            created_at,
        })
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a group snapshot. Returns `true` if a row was deleted.
    pub fn delete_group(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM group_info WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(members: &[&str]) -> GroupInfo {
        GroupInfo {
            id: "G1".into(),
            name: "rustaceans".into(),
            owner_id: members[0].to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_preserves_member_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("chat.db")).unwrap();

        db.upsert_group(&group(&["U3", "U1", "U2"])).unwrap();
        let g = db.get_group("G1").unwrap();
        assert_eq!(g.members, vec!["U3", "U1", "U2"]);
        assert_eq!(g.owner_id, "U3");

        db.upsert_group(&group(&["U3", "U1"])).unwrap();
        assert_eq!(db.get_group("G1").unwrap().member_count(), 2);
    }

    #[test]
    fn delete_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("chat.db")).unwrap();

        db.upsert_group(&group(&["U1"])).unwrap();
        assert!(db.delete_group("G1").unwrap());
        assert!(!db.delete_group("G1").unwrap());
        assert!(matches!(db.get_group("G1"), Err(StoreError::NotFound)));
    }
}
