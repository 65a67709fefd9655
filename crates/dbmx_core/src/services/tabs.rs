//! Workspace tab state machine.
//!
//! Maintains the ordered set of tabs in the metadata store and enforces:
//! at most one tab is active, and exactly one whenever any tab exists.
//! Every "demote all, promote one" pair runs inside a single SQLite
//! transaction, so observers never see zero or two active tabs.

use crate::error::{DbmxError, Result};
use crate::models::{ConnectionRef, DeleteOutcome, Output, Tab, DEFAULT_TAB_NAME};
use crate::services::storage::LocalStorage;

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::sync::Arc;

const TAB_COLUMNS: &str =
    "id, name, editor, output, is_active, active_db_id, active_db, active_db_colour";

/// Service owning tab lifecycle and result caching.
pub struct TabService {
    storage: Arc<LocalStorage>,
}

impl TabService {
    /// Create a tab service over the given metadata store.
    pub fn new(storage: Arc<LocalStorage>) -> Self {
        Self { storage }
    }

    /// Insert a new active tab and demote every other tab.
    pub fn create_tab(&self, reference: ConnectionRef) -> Result<Tab> {
        let reference = reference.normalized();
        let mut conn = self.storage.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| DbmxError::storage(format!("Failed to begin transaction: {e}"), None))?;

        tx.execute(
            "INSERT INTO tabs (name, editor, output, is_active, active_db_id, active_db, active_db_colour)
             VALUES (?1, '', '', 1, ?2, ?3, ?4)",
            params![DEFAULT_TAB_NAME, reference.id, reference.name, reference.colour],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to insert tab: {e}"), None))?;
        let id = tx.last_insert_rowid();

        tx.execute("UPDATE tabs SET is_active = 0 WHERE id != ?", [id])
            .map_err(|e| DbmxError::storage(format!("Failed to demote tabs: {e}"), None))?;

        tx.commit()
            .map_err(|e| DbmxError::storage(format!("Failed to commit new tab: {e}"), None))?;

        tracing::debug!(tab_id = id, connection_id = ?reference.id, "Tab created");
        Ok(Tab {
            id,
            name: DEFAULT_TAB_NAME.to_string(),
            editor: String::new(),
            output: String::new(),
            is_active: true,
            connection: reference,
            result: None,
        })
    }

    /// Make `id` the only active tab and return it hydrated.
    ///
    /// Unknown ids fail with NotFound and leave the current active tab alone.
    pub fn set_active_tab(&self, id: i64) -> Result<Tab> {
        let mut conn = self.storage.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| DbmxError::storage(format!("Failed to begin transaction: {e}"), None))?;

        tx.execute("UPDATE tabs SET is_active = 0 WHERE id != ?", [id])
            .map_err(|e| DbmxError::storage(format!("Failed to demote tabs: {e}"), None))?;

        let tab = tx
            .query_row(
                &format!("UPDATE tabs SET is_active = 1 WHERE id = ? RETURNING {TAB_COLUMNS}"),
                [id],
                tab_from_row,
            )
            .optional()
            .map_err(|e| DbmxError::storage(format!("Failed to activate tab: {e}"), None))?
            .ok_or_else(|| DbmxError::tab_not_found(id))?;

        // Hydrate before commit so a corrupt cache leaves activity unchanged
        let tab = tab.hydrated()?;

        tx.commit()
            .map_err(|e| DbmxError::storage(format!("Failed to commit activation: {e}"), None))?;

        tracing::debug!(tab_id = id, has_result = tab.has_result(), "Tab activated");
        Ok(tab)
    }

    /// List all tabs in creation order, hydrating the active one.
    ///
    /// A corrupt cache on the active tab fails the whole listing.
    pub fn list_tabs(&self) -> Result<Vec<Tab>> {
        let conn = self.storage.lock();

        let mut stmt = conn
            .prepare(&format!("SELECT {TAB_COLUMNS} FROM tabs ORDER BY id"))
            .map_err(|e| DbmxError::storage(format!("Failed to prepare query: {e}"), None))?;

        let rows = stmt
            .query_map([], tab_from_row)
            .map_err(|e| DbmxError::storage(format!("Failed to query tabs: {e}"), None))?;

        let mut tabs = Vec::new();
        for row_result in rows {
            let mut tab = row_result
                .map_err(|e| DbmxError::storage(format!("Failed to read tab: {e}"), None))?;
            if tab.is_active {
                tab.hydrate()?;
            }
            tabs.push(tab);
        }

        Ok(tabs)
    }

    /// Fetch one tab, always hydrated.
    pub fn get_tab(&self, id: i64) -> Result<Tab> {
        let conn = self.storage.lock();

        conn.query_row(&format!("SELECT {TAB_COLUMNS} FROM tabs WHERE id = ?"), [id], tab_from_row)
            .optional()
            .map_err(|e| DbmxError::storage(format!("Failed to load tab: {e}"), None))?
            .ok_or_else(|| DbmxError::tab_not_found(id))?
            .hydrated()
    }

    /// Read a tab's connection reference without touching its cache.
    pub fn connection_reference(&self, id: i64) -> Result<ConnectionRef> {
        let conn = self.storage.lock();

        conn.query_row(
            "SELECT active_db_id, active_db, active_db_colour FROM tabs WHERE id = ?",
            [id],
            |row| Ok(ConnectionRef { id: row.get(0)?, name: row.get(1)?, colour: row.get(2)? }),
        )
        .optional()
        .map_err(|e| DbmxError::storage(format!("Failed to load connection reference: {e}"), None))?
        .ok_or_else(|| DbmxError::tab_not_found(id))
    }

    /// Get the active tab, if any tab exists.
    pub fn active_tab(&self) -> Result<Option<Tab>> {
        let conn = self.storage.lock();

        conn.query_row(
            &format!("SELECT {TAB_COLUMNS} FROM tabs WHERE is_active = 1 ORDER BY id LIMIT 1"),
            [],
            tab_from_row,
        )
        .optional()
        .map_err(|e| DbmxError::storage(format!("Failed to load active tab: {e}"), None))?
        .map(Tab::hydrated)
        .transpose()
    }

    /// Count all tabs.
    pub fn count_tabs(&self) -> Result<i64> {
        let conn = self.storage.lock();

        conn.query_row("SELECT COUNT(*) FROM tabs", [], |row| row.get(0))
            .map_err(|e| DbmxError::storage(format!("Failed to count tabs: {e}"), None))
    }

    /// Delete a tab, promoting the lowest-id remaining tab if it was active.
    pub fn delete_tab(&self, id: i64) -> Result<DeleteOutcome> {
        let mut conn = self.storage.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| DbmxError::storage(format!("Failed to begin transaction: {e}"), None))?;

        let is_active: bool = tx
            .query_row("SELECT is_active FROM tabs WHERE id = ?", [id], |row| row.get(0))
            .optional()
            .map_err(|e| DbmxError::storage(format!("Failed to read tab: {e}"), None))?
            .ok_or_else(|| DbmxError::tab_not_found(id))?;

        let outcome = if is_active {
            let count: i64 = tx
                .query_row("SELECT COUNT(*) FROM tabs", [], |row| row.get(0))
                .map_err(|e| DbmxError::storage(format!("Failed to count tabs: {e}"), None))?;

            if count > 1 {
                let promoted = tx
                    .query_row(
                        &format!(
                            "UPDATE tabs SET is_active = 1
                             WHERE id = (SELECT id FROM tabs WHERE id != ?1 ORDER BY id LIMIT 1)
                             RETURNING {TAB_COLUMNS}"
                        ),
                        [id],
                        tab_from_row,
                    )
                    .map_err(|e| DbmxError::storage(format!("Failed to promote tab: {e}"), None))?;
                DeleteOutcome::Promoted(promoted.hydrated()?)
            } else {
                DeleteOutcome::Emptied
            }
        } else {
            DeleteOutcome::ActiveUnchanged
        };

        tx.execute("DELETE FROM tabs WHERE id = ?", [id])
            .map_err(|e| DbmxError::storage(format!("Failed to delete tab: {e}"), None))?;

        tx.commit()
            .map_err(|e| DbmxError::storage(format!("Failed to commit deletion: {e}"), None))?;

        tracing::debug!(
            tab_id = id,
            promoted = ?outcome.promoted().map(|tab| tab.id),
            "Tab deleted"
        );
        Ok(outcome)
    }

    /// Overwrite the editor buffer. Activity is untouched.
    pub fn update_editor_content(&self, id: i64, editor: &str) -> Result<()> {
        let conn = self.storage.lock();

        let updated = conn
            .execute("UPDATE tabs SET editor = ? WHERE id = ?", params![editor, id])
            .map_err(|e| DbmxError::storage(format!("Failed to update editor: {e}"), None))?;
        if updated == 0 {
            return Err(DbmxError::tab_not_found(id));
        }

        tracing::trace!(tab_id = id, len = editor.len(), "Editor content saved");
        Ok(())
    }

    /// Overwrite the tab's connection reference.
    ///
    /// The referenced connection is not checked; a dangling reference is
    /// reported as NotFound when a query is run.
    pub fn save_connection_reference(&self, id: i64, reference: &ConnectionRef) -> Result<()> {
        let reference = reference.normalized();
        let conn = self.storage.lock();

        let updated = conn
            .execute(
                "UPDATE tabs SET active_db_id = ?, active_db = ?, active_db_colour = ? WHERE id = ?",
                params![reference.id, reference.name, reference.colour, id],
            )
            .map_err(|e| {
                DbmxError::storage(format!("Failed to save connection reference: {e}"), None)
            })?;
        if updated == 0 {
            return Err(DbmxError::tab_not_found(id));
        }

        tracing::debug!(tab_id = id, connection_id = ?reference.id, "Connection reference saved");
        Ok(())
    }

    /// Rename a tab.
    pub fn rename_tab(&self, id: i64, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbmxError::config("Tab name cannot be empty"));
        }

        let conn = self.storage.lock();
        let updated = conn
            .execute("UPDATE tabs SET name = ? WHERE id = ?", params![name, id])
            .map_err(|e| DbmxError::storage(format!("Failed to rename tab: {e}"), None))?;
        if updated == 0 {
            return Err(DbmxError::tab_not_found(id));
        }

        Ok(())
    }

    /// Replace the cached result of a tab.
    pub fn save_tab_output(&self, id: i64, output: &Output) -> Result<()> {
        let json = output.to_json()?;

        let conn = self.storage.lock();
        let updated = conn
            .execute("UPDATE tabs SET output = ? WHERE id = ?", params![json, id])
            .map_err(|e| DbmxError::storage(format!("Failed to save output: {e}"), None))?;
        if updated == 0 {
            return Err(DbmxError::tab_not_found(id));
        }

        tracing::debug!(tab_id = id, rows = output.row_count(), "Tab output cached");
        Ok(())
    }
}

fn tab_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tab> {
    Ok(Tab {
        id: row.get(0)?,
        name: row.get(1)?,
        editor: row.get(2)?,
        output: row.get(3)?,
        is_active: row.get(4)?,
        connection: ConnectionRef { id: row.get(5)?, name: row.get(6)?, colour: row.get(7)? },
        result: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> TabService {
        TabService::new(Arc::new(LocalStorage::open_in_memory().unwrap()))
    }

    fn active_ids(service: &TabService) -> Vec<i64> {
        service.list_tabs().unwrap().into_iter().filter(|t| t.is_active).map(|t| t.id).collect()
    }

    fn assert_single_active(service: &TabService) {
        let tabs = service.list_tabs().unwrap();
        let active = tabs.iter().filter(|t| t.is_active).count();
        if tabs.is_empty() {
            assert_eq!(active, 0);
        } else {
            assert_eq!(active, 1, "expected exactly one active tab in {tabs:?}");
        }
    }

    fn corrupt_output(service: &TabService, id: i64) {
        service
            .storage
            .lock()
            .execute("UPDATE tabs SET output = '{broken' WHERE id = ?", [id])
            .unwrap();
    }

    #[test]
    fn test_create_tab_is_active_and_demotes_others() {
        let service = service();
        let first = service.create_tab(ConnectionRef::none()).unwrap();
        let second = service.create_tab(ConnectionRef::none()).unwrap();

        assert!(second.is_active);
        assert_eq!(second.name, DEFAULT_TAB_NAME);
        assert_ne!(first.id, second.id);
        assert_eq!(active_ids(&service), vec![second.id]);
    }

    #[test]
    fn test_create_tab_normalizes_empty_reference() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::new("", "", "")).unwrap();
        assert_eq!(tab.connection, ConnectionRef { id: None, name: None, colour: None });

        let stored = service.get_tab(tab.id).unwrap();
        assert_eq!(stored.connection.id, None);
        assert_eq!(stored.connection.name, None);
        assert_eq!(stored.connection.colour, None);
    }

    #[test]
    fn test_empty_reference_fields_are_stored_as_absent() {
        let service = service();
        let blank = ConnectionRef {
            id: Some(String::new()),
            name: Some(String::new()),
            colour: Some(String::new()),
        };

        let tab = service.create_tab(blank.clone()).unwrap();
        assert!(tab.connection.is_empty());
        assert!(service.get_tab(tab.id).unwrap().connection.is_empty());

        service.save_connection_reference(tab.id, &ConnectionRef::new("c-1", "local", "")).unwrap();
        service.save_connection_reference(tab.id, &blank).unwrap();
        assert_eq!(service.get_tab(tab.id).unwrap().connection, ConnectionRef::none());
    }

    #[test]
    fn test_create_tab_keeps_reference() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::new("c-1", "local", "#00ff00")).unwrap();

        let stored = service.get_tab(tab.id).unwrap();
        assert_eq!(stored.connection.id.as_deref(), Some("c-1"));
        assert_eq!(stored.connection.name.as_deref(), Some("local"));
        assert_eq!(stored.connection.colour.as_deref(), Some("#00ff00"));
    }

    #[test]
    fn test_set_active_tab_switches_and_hydrates() {
        let service = service();
        let first = service.create_tab(ConnectionRef::none()).unwrap();
        let _second = service.create_tab(ConnectionRef::none()).unwrap();
        service
            .save_tab_output(first.id, &Output::new(vec!["n".into()], vec![vec![json!(1)]]))
            .unwrap();

        let active = service.set_active_tab(first.id).unwrap();
        assert!(active.is_active);
        assert_eq!(active.result.unwrap().rows, vec![vec![json!(1)]]);
        assert_eq!(active_ids(&service), vec![first.id]);
    }

    #[test]
    fn test_set_active_tab_is_idempotent() {
        let service = service();
        let first = service.create_tab(ConnectionRef::none()).unwrap();
        let _second = service.create_tab(ConnectionRef::none()).unwrap();

        let once = service.set_active_tab(first.id).unwrap();
        let before = service.list_tabs().unwrap();
        let twice = service.set_active_tab(first.id).unwrap();
        let after = service.list_tabs().unwrap();

        assert_eq!(once, twice);
        assert_eq!(before, after);
    }

    #[test]
    fn test_set_active_tab_unknown_id_keeps_current() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::none()).unwrap();

        let err = service.set_active_tab(999).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(active_ids(&service), vec![tab.id]);
    }

    #[test]
    fn test_set_active_tab_corrupt_output_rolls_back() {
        let service = service();
        let first = service.create_tab(ConnectionRef::none()).unwrap();
        let second = service.create_tab(ConnectionRef::none()).unwrap();
        corrupt_output(&service, first.id);

        let err = service.set_active_tab(first.id).unwrap_err();
        assert!(matches!(err, DbmxError::Deserialize { .. }));
        assert_eq!(active_ids(&service), vec![second.id]);
    }

    #[test]
    fn test_list_tabs_hydrates_only_active() {
        let service = service();
        let first = service.create_tab(ConnectionRef::none()).unwrap();
        let second = service.create_tab(ConnectionRef::none()).unwrap();
        let output = Output::new(vec!["a".into()], vec![vec![json!("x")]]);
        service.save_tab_output(first.id, &output).unwrap();
        service.save_tab_output(second.id, &output).unwrap();

        let tabs = service.list_tabs().unwrap();
        assert_eq!(tabs.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert!(tabs[0].result.is_none());
        assert!(!tabs[0].output.is_empty());
        assert_eq!(tabs[1].result.as_ref(), Some(&output));
    }

    #[test]
    fn test_list_tabs_fails_on_corrupt_active_cache() {
        let service = service();
        let first = service.create_tab(ConnectionRef::none()).unwrap();
        let second = service.create_tab(ConnectionRef::none()).unwrap();

        // An inactive tab's cache is not parsed
        corrupt_output(&service, first.id);
        assert_eq!(service.list_tabs().unwrap().len(), 2);

        corrupt_output(&service, second.id);
        let err = service.list_tabs().unwrap_err();
        assert!(matches!(err, DbmxError::Deserialize { .. }));
    }

    #[test]
    fn test_delete_active_with_others_promotes() {
        let service = service();
        let t1 = service.create_tab(ConnectionRef::none()).unwrap();
        let t2 = service.create_tab(ConnectionRef::none()).unwrap();
        let t3 = service.create_tab(ConnectionRef::none()).unwrap();
        service.set_active_tab(t2.id).unwrap();

        let outcome = service.delete_tab(t2.id).unwrap();
        let promoted = outcome.promoted().expect("a tab should be promoted");

        assert!([t1.id, t3.id].contains(&promoted.id));
        // Lowest id wins
        assert_eq!(promoted.id, t1.id);
        assert!(promoted.is_active);
        assert_eq!(active_ids(&service), vec![promoted.id]);
        assert_eq!(service.count_tabs().unwrap(), 2);
    }

    #[test]
    fn test_delete_active_alone_empties() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::none()).unwrap();

        let outcome = service.delete_tab(tab.id).unwrap();
        assert_eq!(outcome, DeleteOutcome::Emptied);
        assert!(outcome.promoted().is_none());
        assert!(service.list_tabs().unwrap().is_empty());
        assert!(service.active_tab().unwrap().is_none());
    }

    #[test]
    fn test_delete_inactive_leaves_active() {
        let service = service();
        let t1 = service.create_tab(ConnectionRef::none()).unwrap();
        let t2 = service.create_tab(ConnectionRef::none()).unwrap();
        service.set_active_tab(t1.id).unwrap();

        let outcome = service.delete_tab(t2.id).unwrap();
        assert_eq!(outcome, DeleteOutcome::ActiveUnchanged);
        assert!(outcome.promoted().is_none());
        assert_eq!(active_ids(&service), vec![t1.id]);
    }

    #[test]
    fn test_delete_unknown_tab_is_not_found() {
        let service = service();
        service.create_tab(ConnectionRef::none()).unwrap();

        assert!(service.delete_tab(42).unwrap_err().is_not_found());
        assert_eq!(service.count_tabs().unwrap(), 1);
    }

    #[test]
    fn test_delete_with_corrupt_promotion_target_rolls_back() {
        let service = service();
        let t1 = service.create_tab(ConnectionRef::none()).unwrap();
        let t2 = service.create_tab(ConnectionRef::none()).unwrap();
        corrupt_output(&service, t1.id);

        let err = service.delete_tab(t2.id).unwrap_err();
        assert!(matches!(err, DbmxError::Deserialize { .. }));
        assert_eq!(service.count_tabs().unwrap(), 2);
        assert_eq!(active_ids(&service), vec![t2.id]);
    }

    #[test]
    fn test_single_active_invariant_over_operation_sequence() {
        let service = service();
        let mut ids = Vec::new();

        for _ in 0..4 {
            ids.push(service.create_tab(ConnectionRef::none()).unwrap().id);
            assert_single_active(&service);
        }
        service.set_active_tab(ids[1]).unwrap();
        assert_single_active(&service);
        service.delete_tab(ids[1]).unwrap();
        assert_single_active(&service);
        service.delete_tab(ids[3]).unwrap();
        assert_single_active(&service);
        service.set_active_tab(ids[2]).unwrap();
        assert_single_active(&service);
        service.delete_tab(ids[0]).unwrap();
        assert_single_active(&service);
        service.delete_tab(ids[2]).unwrap();
        assert_single_active(&service);
        assert_eq!(service.count_tabs().unwrap(), 0);
    }

    #[test]
    fn test_update_editor_content_has_no_activity_side_effects() {
        let service = service();
        let t1 = service.create_tab(ConnectionRef::none()).unwrap();
        let t2 = service.create_tab(ConnectionRef::none()).unwrap();

        service.update_editor_content(t1.id, "SELECT 1").unwrap();

        assert_eq!(service.get_tab(t1.id).unwrap().editor, "SELECT 1");
        assert_eq!(active_ids(&service), vec![t2.id]);
        assert!(service.update_editor_content(99, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_save_connection_reference_accepts_unknown_connection() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::none()).unwrap();

        let reference = ConnectionRef::new("no-such-connection", "gone", "");
        service.save_connection_reference(tab.id, &reference).unwrap();

        let stored = service.get_tab(tab.id).unwrap();
        assert_eq!(stored.connection, reference);
        assert_eq!(stored.connection.colour, None);

        // Clearing with empty strings stores absence
        service.save_connection_reference(tab.id, &ConnectionRef::new("", "", "")).unwrap();
        assert!(service.get_tab(tab.id).unwrap().connection.is_empty());
    }

    #[test]
    fn test_rename_tab() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::none()).unwrap();

        service.rename_tab(tab.id, "  Reports  ").unwrap();
        assert_eq!(service.get_tab(tab.id).unwrap().name, "Reports");

        assert!(matches!(service.rename_tab(tab.id, "   "), Err(DbmxError::Config { .. })));
        assert!(service.rename_tab(1000, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_connection_reference_ignores_corrupt_cache() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::new("c-9", "warehouse", "")).unwrap();
        service.storage.lock().execute("UPDATE tabs SET output = '{oops'", []).unwrap();

        let reference = service.connection_reference(tab.id).unwrap();
        assert_eq!(reference.id.as_deref(), Some("c-9"));
        assert_eq!(reference.colour, None);
        assert!(service.connection_reference(404).unwrap_err().is_not_found());
    }

    #[test]
    fn test_output_round_trip_through_storage() {
        let service = service();
        let tab = service.create_tab(ConnectionRef::none()).unwrap();
        let output = Output::new(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]],
        );

        service.save_tab_output(tab.id, &output).unwrap();
        let fetched = service.get_tab(tab.id).unwrap();

        let cached = fetched.result.unwrap();
        assert_eq!(cached.columns, vec!["a", "b"]);
        assert_eq!(cached.rows, vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]]);
    }
}
