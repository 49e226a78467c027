//! End-to-end sheet scenarios against an in-memory database.

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sheetline_core::dataset::ModelQuery;
use sheetline_core::error::BoxError;
use sheetline_core::{
    ActiveContext, Config, DatasetSource, FieldType, Formula, MemoryProvider, ModelField, ModelProvider, NewSheet,
    RowValues, Session, SheetState, SheetlineError, Value, Warnings,
};

fn field(name: &str, kind: &str) -> ModelField {
    ModelField {
        name: name.to_string(),
        string: String::new(),
        kind: kind.to_string(),
        relation: None,
    }
}

fn products(values: &[i64]) -> MemoryProvider {
    let provider = MemoryProvider::new();
    provider.define("product", vec![field("x", "integer")]);
    for x in values {
        provider.insert("product", HashMap::from([("x".to_string(), Value::Integer(*x))]));
    }
    provider
}

fn session_with(provider: impl ModelProvider + 'static, config: Config) -> Session {
    Session::open_in_memory(config, Some(Arc::new(provider))).unwrap()
}

fn product_source() -> DatasetSource {
    DatasetSource::model("product", "", "", "").unwrap()
}

fn doubling_sheet(alias: &str) -> NewSheet {
    NewSheet {
        name: alias.to_string(),
        formulas: vec![
            Formula::new("x", FieldType::Integer),
            Formula::new("y", FieldType::Float).with_expression("=x*2"),
        ],
        ..Default::default()
    }
}

fn row(pairs: &[(&str, Value)]) -> RowValues {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn all_rows(session: &Session, alias: &str) -> Vec<RowValues> {
    let sheet = session.sheet(alias).unwrap();
    let ctx = ActiveContext::sheet(sheet.id);
    let conn = session.connection();
    let ids = session
        .records()
        .search(conn, &ctx, &Default::default(), 0, None, &[])
        .unwrap();
    session
        .records()
        .read(conn, &ctx, &ids, None)
        .unwrap()
        .into_iter()
        .map(|r| r.values)
        .collect()
}

fn count(session: &Session, alias: &str) -> i64 {
    let sheet = session.sheet(alias).unwrap();
    session
        .records()
        .count(session.connection(), &ActiveContext::sheet(sheet.id))
        .unwrap()
}

#[test]
fn test_direct_column_and_doubled_formula() {
    let session = session_with(products(&[3, 5]), Config::default());
    let sheet = session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
    assert_eq!(sheet.state, SheetState::Draft);

    let report = session.activate("items", &Warnings::new()).unwrap();
    assert_eq!(report.compute.unwrap().rows, 2);
    assert!(report.copy.is_none());

    assert_eq!(
        all_rows(&session, "items"),
        vec![
            row(&[("x", Value::Integer(3)), ("y", Value::Float(6.0))]),
            row(&[("x", Value::Integer(5)), ("y", Value::Float(10.0))]),
        ]
    );
}

#[test]
fn test_table_has_one_column_per_typed_formula_plus_audit() {
    let session = session_with(products(&[1]), Config::default());
    session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
    let report = session.activate("items", &Warnings::new()).unwrap();

    let mut stmt = session
        .connection()
        .prepare(&format!("SELECT name FROM pragma_table_info('{}')", report.table.name))
        .unwrap();
    let columns: Vec<String> = stmt
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(columns.len(), 1 + 2 + 4);
    for name in ["id", "create_uid", "write_uid", "create_date", "write_date", "x", "y"] {
        assert!(columns.iter().any(|c| c == name), "missing column {}", name);
    }
}

#[test]
fn test_compute_is_idempotent() {
    let session = session_with(products(&[3, 5, 7]), Config::default());
    session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
    session.activate("items", &Warnings::new()).unwrap();
    let first = all_rows(&session, "items");

    let report = session.compute("items").unwrap();
    assert_eq!(report.rows, 3);
    assert_eq!(all_rows(&session, "items"), first);
    assert_eq!(count(&session, "items"), 3);
}

#[test]
fn test_compute_requires_active_sheet() {
    let session = session_with(products(&[1]), Config::default());
    session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
    assert!(matches!(session.compute("items"), Err(SheetlineError::NotActive(_))));
}

#[test]
fn test_duplicate_alias_is_rejected() {
    let session = session_with(products(&[]), Config::default());
    let new = NewSheet {
        name: "dup".into(),
        formulas: vec![
            Formula::new("a", FieldType::Integer),
            Formula::new("A", FieldType::Text).with_alias("a"),
        ],
        ..Default::default()
    };
    let err = session.create_sheet(&new).unwrap_err();
    assert!(matches!(err, SheetlineError::DuplicateAlias { ref alias } if alias == "a"));
    assert!(session.sheets().unwrap().is_empty());
}

#[test]
fn test_forward_reference_warns_on_check_and_blocks_activation() {
    let session = session_with(products(&[]), Config::default());
    session
        .create_sheet(&NewSheet {
            name: "order".into(),
            formulas: vec![
                Formula::new("b", FieldType::Integer).with_expression("=a*2"),
                Formula::new("a", FieldType::Integer),
            ],
            ..Default::default()
        })
        .unwrap();

    let checks = session.check("order").unwrap();
    assert!(!checks[0].is_ordered());

    let err = session.activate("order", &Warnings::new()).unwrap_err();
    let SheetlineError::FormulaErrors(failing) = err else {
        panic!("expected formula errors, got {:?}", err);
    };
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].alias, "b");
    assert_eq!(session.sheet("order").unwrap().state, SheetState::Draft);
}

#[test]
fn test_migration_reports_lost_and_missing_columns() {
    let session = Session::open_in_memory(Config::default(), None).unwrap();
    session
        .create_sheet(&NewSheet {
            name: "m".into(),
            formulas: vec![Formula::new("a", FieldType::Integer), Formula::new("b", FieldType::Text)],
            ..Default::default()
        })
        .unwrap();
    let first = session.activate("m", &Warnings::new()).unwrap();
    let sheet = session.sheet("m").unwrap();
    let ctx = ActiveContext::sheet(sheet.id);
    session
        .create_records(
            &ctx,
            &[
                row(&[("a", Value::Integer(1)), ("b", Value::Text("one".into()))]),
                row(&[("a", Value::Integer(2)), ("b", Value::Text("two".into()))]),
            ],
        )
        .unwrap();

    session.draft("m").unwrap();
    session
        .set_formulas("m", vec![Formula::new("a", FieldType::Integer), Formula::new("c", FieldType::Text)])
        .unwrap();

    let err = session.activate("m", &Warnings::new()).unwrap_err();
    assert!(err.is_warning());
    let SheetlineError::UserWarning { key, message } = err else {
        unreachable!();
    };
    assert_eq!(key, "m.copy_from");
    assert!(message.contains("- b"), "{}", message);
    // Nothing was written.
    let sheet = session.sheet("m").unwrap();
    assert_eq!(sheet.state, SheetState::Draft);
    assert_eq!(sheet.current_table, Some(first.table.id));

    let mut warnings = Warnings::new();
    warnings.accept("m.copy_from");
    let report = session.activate("m", &warnings).unwrap();
    let copy = report.copy.unwrap();
    assert_eq!(copy.copied, vec!["a".to_string()]);
    assert_eq!(copy.lost, vec!["b".to_string()]);
    assert_eq!(copy.missing, vec!["c".to_string()]);
    assert_eq!(copy.rows, 2);

    assert_eq!(
        all_rows(&session, "m"),
        vec![
            row(&[("a", Value::Integer(1)), ("c", Value::Null)]),
            row(&[("a", Value::Integer(2)), ("c", Value::Null)]),
        ]
    );
}

#[test]
fn test_update_formulas_adds_dataset_fields() {
    let provider = MemoryProvider::new();
    provider.define(
        "party",
        vec![
            ModelField {
                name: "name".into(),
                string: "Name".into(),
                kind: "char".into(),
                relation: None,
            },
            field("age", "integer"),
            field("notes", "one2many"),
        ],
    );
    let session = session_with(provider, Config::default());
    let source = DatasetSource::model("party", "", "", "").unwrap();
    session
        .define(
            &NewSheet {
                name: "people".into(),
                formulas: vec![Formula::new("age", FieldType::Integer)],
                ..Default::default()
            },
            Some(("Parties", &source)),
        )
        .unwrap();

    assert_eq!(session.update_formulas("people").unwrap(), 1);
    let sheet = session.sheet("people").unwrap();
    let aliases: Vec<&str> = sheet.formulas.iter().map(|f| f.alias.as_str()).collect();
    assert_eq!(aliases, vec!["age", "name"]);
    let name = sheet.formula("name").unwrap();
    assert_eq!(name.name, "Name");
    assert_eq!(name.field_type, Some(FieldType::Text));
    assert!(name.is_direct());

    assert_eq!(session.update_formulas("people").unwrap(), 0);
}

#[test]
fn test_reaper_keeps_current_tables() {
    let session = session_with(products(&[1, 2]), Config::default());
    session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
    let first = session.activate("items", &Warnings::new()).unwrap();
    session.draft("items").unwrap();
    let second = session.activate("items", &Warnings::new()).unwrap();
    assert_ne!(first.table.id, second.table.id);
    assert_eq!(second.copy.unwrap().rows, 2);

    let cutoff = chrono::Utc::now().naive_utc() + chrono::TimeDelta::days(1);
    let removed = session.reap_before(cutoff).unwrap();
    assert_eq!(removed, vec![first.table.name.clone()]);
    assert_eq!(count(&session, "items"), 2);

    assert!(session.reap_before(cutoff).unwrap().is_empty());
    assert!(session.reap(30).unwrap().is_empty());
}

#[test]
fn test_sheet_lookup_reads_other_sheet() {
    let provider = MemoryProvider::new();
    provider.define("line", vec![field("code", "char"), field("qty", "integer")]);
    for (code, qty) in [("EUR", 2), ("USD", 3), ("XXX", 1)] {
        provider.insert(
            "line",
            HashMap::from([
                ("code".to_string(), Value::Text(code.into())),
                ("qty".to_string(), Value::Integer(qty)),
            ]),
        );
    }
    let session = session_with(provider, Config::default());

    session
        .create_sheet(&NewSheet {
            name: "rates".into(),
            formulas: vec![Formula::new("code", FieldType::Text), Formula::new("rate", FieldType::Float)],
            ..Default::default()
        })
        .unwrap();
    session.activate("rates", &Warnings::new()).unwrap();
    let rates = session.sheet("rates").unwrap();
    session
        .create_records(
            &ActiveContext::sheet(rates.id),
            &[
                row(&[("code", Value::Text("EUR".into())), ("rate", Value::Float(1.5))]),
                row(&[("code", Value::Text("USD".into())), ("rate", Value::Float(2.0))]),
            ],
        )
        .unwrap();

    let source = DatasetSource::model("line", "", "", "").unwrap();
    session
        .define(
            &NewSheet {
                name: "lines".into(),
                formulas: vec![
                    Formula::new("code", FieldType::Text),
                    Formula::new("qty", FieldType::Integer),
                    Formula::new("total", FieldType::Float)
                        .with_expression("=qty * SHEET_LOOKUP(\"rates\", \"code\", code, \"rate\")"),
                ],
                ..Default::default()
            },
            Some(("Lines", &source)),
        )
        .unwrap();
    session.activate("lines", &Warnings::new()).unwrap();

    let totals: Vec<Value> = all_rows(&session, "lines")
        .into_iter()
        .map(|r| r.get("total").cloned().unwrap())
        .collect();
    assert_eq!(totals, vec![Value::Float(3.0), Value::Float(6.0), Value::Null]);
}

/// Sleeps on every page after the first while `slow` is set.
struct SlowProvider {
    inner: MemoryProvider,
    slow: AtomicBool,
}

impl ModelProvider for SlowProvider {
    fn fields(&self, model: &str) -> Result<Vec<ModelField>, BoxError> {
        self.inner.fields(model)
    }

    fn search(&self, model: &str, query: &ModelQuery<'_>) -> Result<Vec<i64>, BoxError> {
        if query.offset > 0 && self.slow.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(2));
        }
        self.inner.search(model, query)
    }

    fn read(&self, model: &str, ids: &[i64], fields: &[String]) -> Result<Vec<HashMap<String, Value>>, BoxError> {
        self.inner.read(model, ids, fields)
    }
}

#[test]
fn test_timeout_restores_previous_rows() {
    let provider = Arc::new(SlowProvider {
        inner: products(&[1, 2, 3]),
        slow: AtomicBool::new(false),
    });
    let config = Config {
        cache_size: 2,
        ..Config::default()
    };
    let session = Session::open_in_memory(config, Some(provider.clone())).unwrap();
    session
        .define(
            &NewSheet {
                timeout: Some(1),
                ..doubling_sheet("items")
            },
            Some(("Products", &product_source())),
        )
        .unwrap();
    let report = session.activate("items", &Warnings::new()).unwrap();
    assert_eq!(report.compute.unwrap().batches, 2);
    assert_eq!(count(&session, "items"), 3);

    provider.slow.store(true, Ordering::SeqCst);
    let err = session.compute("items").unwrap_err();
    assert!(
        matches!(err, SheetlineError::Timeout { ref sheet, seconds: 1 } if sheet == "items"),
        "{:?}",
        err
    );
    assert_eq!(count(&session, "items"), 3);

    // Outside a session transaction the first page stays.
    let sheet = session.sheet("items").unwrap();
    let err = session.manager().compute(session.connection(), &sheet).unwrap_err();
    assert!(matches!(err, SheetlineError::Timeout { .. }));
    assert_eq!(count(&session, "items"), 2);
}

#[test]
fn test_canceled_sheet_can_be_deleted() {
    let session = Session::open_in_memory(Config::default(), None).unwrap();
    session
        .create_sheet(&NewSheet {
            name: "tmp".into(),
            formulas: vec![Formula::new("a", FieldType::Integer)],
            ..Default::default()
        })
        .unwrap();
    session.activate("tmp", &Warnings::new()).unwrap();
    assert!(session.delete_sheet("tmp").is_err());

    session.cancel("tmp").unwrap();
    assert!(matches!(
        session.activate("tmp", &Warnings::new()),
        Err(SheetlineError::InvalidTransition { .. })
    ));
    session.delete_sheet("tmp").unwrap();
    assert!(matches!(session.sheet("tmp"), Err(SheetlineError::UnknownSheet(_))));
}

#[test]
fn test_view_follows_sheet_table() {
    let session = session_with(products(&[4]), Config::default());
    session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
    let view = session.create_view("items", "All items", "table").unwrap();
    assert!(matches!(
        session.create_view("items", "Odd", "pivot"),
        Err(SheetlineError::InvalidViewType(_))
    ));
    assert_eq!(session.views("items").unwrap(), vec![view.clone()]);

    let ctx = ActiveContext::view(view.id);
    assert!(session.records().fields(session.connection(), &ctx).unwrap().is_empty());

    session.activate("items", &Warnings::new()).unwrap();
    let conn = session.connection();
    let descriptor = session
        .records()
        .view_descriptor(conn, &ctx, "table")
        .unwrap()
        .unwrap();
    let names: Vec<&str> = descriptor.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["x", "y"]);
    assert!(descriptor.fields[1].readonly);

    let ids = session.create_records(&ctx, &[row(&[("x", Value::Integer(10))])]).unwrap();
    let rows = session.records().read(conn, &ctx, &ids, None).unwrap();
    assert_eq!(rows[0].values.get("y"), Some(&Value::Float(20.0)));

    session
        .write_records(&ctx, &[(ids.clone(), row(&[("x", Value::Integer(1))]))])
        .unwrap();
    let rows = session.records().read(conn, &ctx, &ids, None).unwrap();
    assert_eq!(rows[0].values.get("y"), Some(&Value::Float(2.0)));
    assert_eq!(count(&session, "items"), 2);
}

#[test]
fn test_sheet_and_sql_datasets() {
    let session = session_with(products(&[3, 5]), Config::default());
    session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
    session.activate("items", &Warnings::new()).unwrap();
    let items = session.sheet("items").unwrap();

    session
        .define(
            &NewSheet {
                name: "big".into(),
                formulas: vec![
                    Formula::new("y", FieldType::Float),
                    Formula::new("half", FieldType::Float).with_expression("=y/4"),
                ],
                ..Default::default()
            },
            Some(("Items", &DatasetSource::Sheet { sheet_id: items.id })),
        )
        .unwrap();
    session.activate("big", &Warnings::new()).unwrap();
    let halves: Vec<Value> = all_rows(&session, "big")
        .into_iter()
        .map(|r| r.get("half").cloned().unwrap())
        .collect();
    assert_eq!(halves, vec![Value::Float(1.5), Value::Float(2.5)]);

    let query = format!("SELECT x * 10 AS tens FROM {} ORDER BY id", items.data_table_name());
    session
        .define(
            &NewSheet {
                name: "tens".into(),
                formulas: vec![Formula::new("tens", FieldType::Integer)],
                ..Default::default()
            },
            Some(("Tens", &DatasetSource::Sql { query })),
        )
        .unwrap();
    assert_eq!(session.update_formulas("tens").unwrap(), 0);
    session.activate("tens", &Warnings::new()).unwrap();
    assert_eq!(
        all_rows(&session, "tens"),
        vec![row(&[("tens", Value::Integer(30))]), row(&[("tens", Value::Integer(50))])]
    );
}

#[test]
fn test_sheets_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sheets.db");
    {
        let session = Session::open(&path, Config::default(), Some(Arc::new(products(&[2, 4])))).unwrap();
        session.define(&doubling_sheet("items"), Some(("Products", &product_source()))).unwrap();
        session.set_tags("items", ["daily".to_string()].into()).unwrap();
        session.activate("items", &Warnings::new()).unwrap();
    }

    let session = Session::open(&path, Config::default(), None).unwrap();
    let sheet = session.sheet("items").unwrap();
    assert_eq!(sheet.state, SheetState::Active);
    assert!(sheet.tags.contains("daily"));
    assert_eq!(count(&session, "items"), 2);
    // Model datasets need a provider to recompute.
    assert!(matches!(session.compute("items"), Err(SheetlineError::NoModelProvider)));
    assert_eq!(count(&session, "items"), 2);
}

#[test]
fn test_mixed_case_sql_columns_keep_their_values() {
    let session = Session::open_in_memory(Config::default(), None).unwrap();
    let query = "SELECT 3 AS Qty, 'a' AS \"Unit Name\"".to_string();
    session
        .define(
            &NewSheet {
                name: "stock".into(),
                ..Default::default()
            },
            Some(("Stock", &DatasetSource::Sql { query })),
        )
        .unwrap();
    assert_eq!(session.update_formulas("stock").unwrap(), 2);
    let aliases: Vec<String> = session
        .sheet("stock")
        .unwrap()
        .formulas
        .into_iter()
        .map(|f| f.alias)
        .collect();
    assert_eq!(aliases, vec!["qty".to_string(), "unit_name".to_string()]);

    session.activate("stock", &Warnings::new()).unwrap();
    assert_eq!(
        all_rows(&session, "stock"),
        vec![row(&[("qty", Value::Integer(3)), ("unit_name", Value::Text("a".into()))])]
    );
}

#[test]
fn test_more_rows_than_statement_parameters() {
    let session = Session::open_in_memory(Config::default(), None).unwrap();
    let query = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 40000) SELECT x FROM n"
        .to_string();
    session
        .define(&doubling_sheet("wide"), Some(("Numbers", &DatasetSource::Sql { query })))
        .unwrap();
    let report = session.activate("wide", &Warnings::new()).unwrap();
    assert_eq!(report.compute.unwrap().rows, 40_000);

    let ctx = ActiveContext::sheet(session.sheet("wide").unwrap().id);
    assert_eq!(session.update_record_formulas(&ctx, None).unwrap(), 40_000);

    let ids: Vec<i64> = (1..=40_000).collect();
    session
        .write_records(&ctx, &[(ids.clone(), row(&[("x", Value::Integer(1))]))])
        .unwrap();
    let rows = session
        .records()
        .read(session.connection(), &ctx, &ids, Some(&["y".to_string()]))
        .unwrap();
    assert_eq!(rows.len(), 40_000);
    assert_eq!(rows.last().map(|r| r.id), Some(40_000));
    assert!(rows.iter().all(|r| r.values.get("y") == Some(&Value::Float(2.0))));

    assert_eq!(session.delete_records(&ctx, &ids).unwrap(), 40_000);
    assert_eq!(count(&session, "wide"), 0);
}
