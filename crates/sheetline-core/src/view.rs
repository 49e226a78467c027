//! Named views over a sheet. A view always shows its sheet's current table.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, SheetlineError};

/// Display kinds a view can take.
pub const VIEW_TYPES: [&str; 3] = ["table", "chart", "custom"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct View {
    pub id: i64,
    pub name: String,
    pub sheet_id: i64,
    pub view_type: String,
}

pub fn insert_view(conn: &Connection, name: &str, sheet_id: i64, view_type: &str) -> Result<View> {
    if !VIEW_TYPES.contains(&view_type) {
        return Err(SheetlineError::InvalidViewType(view_type.to_string()));
    }
    conn.execute(
        "INSERT INTO sheetline_view (name, sheet_id, view_type) VALUES (?1, ?2, ?3)",
        params![name, sheet_id, view_type],
    )?;
    Ok(View {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        sheet_id,
        view_type: view_type.to_string(),
    })
}

pub fn load_view(conn: &Connection, id: i64) -> Result<View> {
    conn.query_row(
        "SELECT name, sheet_id, view_type FROM sheetline_view WHERE id = ?1",
        params![id],
        |r| {
            Ok(View {
                id,
                name: r.get(0)?,
                sheet_id: r.get(1)?,
                view_type: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or(SheetlineError::UnknownView(id))
}

pub fn list_views(conn: &Connection, sheet_id: i64) -> Result<Vec<View>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, sheet_id, view_type FROM sheetline_view WHERE sheet_id = ?1 ORDER BY id",
    )?;
    let views = stmt
        .query_map(params![sheet_id], |r| {
            Ok(View {
                id: r.get(0)?,
                name: r.get(1)?,
                sheet_id: r.get(2)?,
                view_type: r.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(views)
}

/// Current table of the view's sheet.
pub fn view_table(conn: &Connection, view: &View) -> Result<Option<i64>> {
    let table = conn
        .query_row(
            "SELECT current_table FROM sheetline_sheet WHERE id = ?1",
            params![view.sheet_id],
            |r| r.get::<_, Option<i64>>(0),
        )
        .optional()?;
    Ok(table.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;
    use crate::sheet::{NewSheet, insert_sheet};

    #[test]
    fn test_views_follow_their_sheet() {
        let conn = Connection::open_in_memory().unwrap();
        metadata::init(&conn).unwrap();
        let sheet = insert_sheet(&conn, &NewSheet { name: "s".into(), ..Default::default() }, 60).unwrap();
        let view = insert_view(&conn, "All rows", sheet.id, "table").unwrap();
        assert_eq!(load_view(&conn, view.id).unwrap(), view);
        assert_eq!(list_views(&conn, sheet.id).unwrap(), vec![view.clone()]);
        assert_eq!(view_table(&conn, &view).unwrap(), None);
        assert!(insert_view(&conn, "x", sheet.id, "pivot").is_err());
        assert!(matches!(load_view(&conn, 99), Err(SheetlineError::UnknownView(99))));
    }
}
