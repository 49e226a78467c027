use rusqlite::Connection;

/// Create the metadata tables if they do not exist yet.
pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    // Ensure foreign keys are enforced (disabled by default in SQLite).
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        r#"
        -- Physical tables provisioned for sheet revisions
        CREATE TABLE IF NOT EXISTS sheetline_table (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          singleton INTEGER NOT NULL DEFAULT 0,
          create_date TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS sheetline_table_field (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          table_id INTEGER NOT NULL REFERENCES sheetline_table(id) ON DELETE CASCADE,
          sequence INTEGER NOT NULL,
          name TEXT NOT NULL,
          string TEXT NOT NULL,
          type TEXT,
          help TEXT,
          link_target TEXT,
          formula TEXT,
          store INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS sheetline_table_view (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          table_id INTEGER NOT NULL REFERENCES sheetline_table(id) ON DELETE CASCADE,
          view_type TEXT NOT NULL,
          arch TEXT,
          system INTEGER NOT NULL DEFAULT 0,
          field_names TEXT,
          field_childs TEXT
        );

        -- Sheet definitions
        CREATE TABLE IF NOT EXISTS sheetline_dataset (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          source TEXT NOT NULL CHECK (source IN ('model','sheet','sql')),
          model TEXT,
          domain TEXT,
          context TEXT,
          ordering TEXT,
          sheet_id INTEGER REFERENCES sheetline_sheet(id) ON DELETE SET NULL,
          query TEXT
        );

        CREATE TABLE IF NOT EXISTS sheetline_sheet (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          alias TEXT NOT NULL UNIQUE,
          revision INTEGER NOT NULL DEFAULT 1,
          singleton INTEGER NOT NULL DEFAULT 0,
          state TEXT NOT NULL DEFAULT 'draft' CHECK (state IN ('draft','active','canceled')),
          timeout INTEGER NOT NULL DEFAULT 60,
          dataset_id INTEGER REFERENCES sheetline_dataset(id) ON DELETE SET NULL,
          -- A referenced table cannot be deleted out from under its sheet.
          current_table INTEGER REFERENCES sheetline_table(id) ON DELETE RESTRICT
        );

        CREATE TABLE IF NOT EXISTS sheetline_formula (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          sheet_id INTEGER NOT NULL REFERENCES sheetline_sheet(id) ON DELETE CASCADE,
          sequence INTEGER NOT NULL,
          name TEXT NOT NULL,
          alias TEXT NOT NULL,
          expression TEXT,
          type TEXT,
          link_target TEXT,
          store INTEGER NOT NULL DEFAULT 1,
          UNIQUE (sheet_id, alias)
        );

        CREATE TABLE IF NOT EXISTS sheetline_sheet_tag (
          sheet_id INTEGER NOT NULL REFERENCES sheetline_sheet(id) ON DELETE CASCADE,
          tag TEXT NOT NULL,
          PRIMARY KEY (sheet_id, tag)
        );

        CREATE TABLE IF NOT EXISTS sheetline_view (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          sheet_id INTEGER NOT NULL REFERENCES sheetline_sheet(id) ON DELETE CASCADE,
          view_type TEXT NOT NULL DEFAULT 'table'
        );

        CREATE INDEX IF NOT EXISTS idx_formula_sheet ON sheetline_formula(sheet_id, sequence);
        CREATE INDEX IF NOT EXISTS idx_table_field_table ON sheetline_table_field(table_id, sequence);
        CREATE INDEX IF NOT EXISTS idx_sheet_current_table ON sheetline_sheet(current_table);
        "#,
    )?;

    Ok(())
}
