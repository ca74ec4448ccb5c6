//! SQL building helpers for the database source.
//!
//! The sharding view and its page queries are assembled from configured
//! identifiers. [`append_id_mod_clause`] is the fallback sharder for plain
//! queries without a materialised view: it conjoins `id % N = k` onto the
//! statement's WHERE clause through a real SQL AST so GROUP BY / ORDER BY
//! are preserved.

use snafu::prelude::*;
use sqlparser::ast::{BinaryOperator, Expr, Ident, SetExpr, Statement, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{SourceError, SqlParseSnafu, UnsupportedQuerySnafu};

/// Name of the scratch materialised view created for a run.
pub const VIEW_NAME: &str = "__mqpump_view";
/// Index supporting ordered range seeks per shard.
pub const VIEW_INDEX_NAME: &str = "__mqpump_view_index";
/// Dense row number column.
pub const VIEW_ROW_NUM: &str = "__mqpump_view_row_num";
/// `row_num MOD parallel` shard selector column.
pub const VIEW_MOD_ROW_NUM: &str = "__mqpump_view_mod_row_num";

/// Qualify each selected column with the table name; default to `table.*`
/// when nothing was selected.
pub fn qualify_selected_columns(table: &str, columns: &[String]) -> Vec<String> {
    if columns.is_empty() {
        return vec![format!("{table}.*")];
    }
    columns
        .iter()
        .map(|column| format!("{table}.{column}"))
        .collect()
}

/// Drop a leading `WHERE ` from a configured predicate.
pub fn strip_where_prefix(clause: &str) -> &str {
    let trimmed = clause.trim();
    if trimmed.len() >= 6 && trimmed[..6].eq_ignore_ascii_case("where ") {
        trimmed[6..].trim_start()
    } else {
        trimmed
    }
}

/// DDL for the sharding view: every matching row of `table` with a dense
/// row number, its shard selector, and the primary key columns.
pub fn create_view_sql(
    table: &str,
    where_clause: &str,
    primary_key: &[String],
    parallel: usize,
) -> String {
    let mut fields = vec![
        format!("ROW_NUMBER() OVER () AS {VIEW_ROW_NUM}"),
        format!("MOD(ROW_NUMBER() OVER (), {parallel}) AS {VIEW_MOD_ROW_NUM}"),
    ];
    fields.extend(primary_key.iter().cloned());

    let mut sql = format!(
        "CREATE MATERIALIZED VIEW {VIEW_NAME} AS SELECT {} FROM {table}",
        fields.join(", ")
    );
    if !where_clause.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(where_clause);
    }
    sql
}

/// DDL for the `(row_num, mod_row_num)` index on the view.
pub fn create_view_index_sql() -> String {
    format!("CREATE INDEX {VIEW_INDEX_NAME} ON {VIEW_NAME} ({VIEW_ROW_NUM}, {VIEW_MOD_ROW_NUM})")
}

/// Count of rows in the view, used as the progress denominator.
pub fn count_view_sql() -> String {
    format!("SELECT COUNT(1) FROM {VIEW_NAME}")
}

/// DDL dropping the view (the index goes with it).
pub fn drop_view_sql() -> String {
    format!("DROP MATERIALIZED VIEW IF EXISTS {VIEW_NAME} CASCADE")
}

/// One page of a shard: rows of this worker's shard past its high-water
/// mark, in row-number order. Binds `$1` = shard index, `$2` = max seen
/// row number.
pub fn shard_page_sql(
    table: &str,
    selected_columns: &[String],
    primary_key: &[String],
    batch_size: u64,
) -> String {
    format!(
        "SELECT {VIEW_ROW_NUM}, {} FROM {table} INNER JOIN {VIEW_NAME} USING ({}) \
         WHERE {VIEW_MOD_ROW_NUM} = $1 AND {VIEW_ROW_NUM} > $2 \
         ORDER BY {VIEW_ROW_NUM} LIMIT {batch_size}",
        selected_columns.join(", "),
        primary_key.join(",")
    )
}

/// Conjoin `id % modulus = equals_to` onto the query's WHERE clause.
///
/// Fallback sharder for sources without a materialised view; requires a
/// numeric `id` column. The query is parsed, mutated, and re-rendered, so
/// existing WHERE / GROUP BY / ORDER BY clauses survive.
pub fn append_id_mod_clause(
    query: &str,
    modulus: i64,
    equals_to: i64,
) -> Result<String, SourceError> {
    let mut statements =
        Parser::parse_sql(&PostgreSqlDialect {}, query).context(SqlParseSnafu)?;
    ensure!(
        statements.len() == 1,
        UnsupportedQuerySnafu {
            message: format!("expected a single statement, got {}", statements.len()),
        }
    );

    let Statement::Query(select_query) = &mut statements[0] else {
        return UnsupportedQuerySnafu {
            message: "expected a SELECT statement".to_string(),
        }
        .fail();
    };
    let SetExpr::Select(select) = select_query.body.as_mut() else {
        return UnsupportedQuerySnafu {
            message: "expected a plain SELECT body".to_string(),
        }
        .fail();
    };

    let mod_clause = Expr::BinaryOp {
        left: Box::new(Expr::BinaryOp {
            left: Box::new(Expr::Identifier(Ident::new("id"))),
            op: BinaryOperator::Modulo,
            right: Box::new(Expr::Value(Value::Number(modulus.to_string(), false))),
        }),
        op: BinaryOperator::Eq,
        right: Box::new(Expr::Value(Value::Number(equals_to.to_string(), false))),
    };

    select.selection = Some(match select.selection.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(existing),
            op: BinaryOperator::And,
            right: Box::new(mod_clause),
        },
        None => mod_clause,
    });

    Ok(statements[0].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify_columns() {
        assert_eq!(
            qualify_selected_columns("events", &["id".into(), "payload".into()]),
            vec!["events.id", "events.payload"]
        );
        assert_eq!(qualify_selected_columns("events", &[]), vec!["events.*"]);
    }

    #[test]
    fn test_strip_where_prefix() {
        assert_eq!(strip_where_prefix("WHERE id > 5"), "id > 5");
        assert_eq!(strip_where_prefix("where id > 5"), "id > 5");
        assert_eq!(strip_where_prefix("id > 5"), "id > 5");
        assert_eq!(strip_where_prefix(""), "");
    }

    #[test]
    fn test_create_view_sql() {
        let sql = create_view_sql("events", "kind = 'order'", &["id".into()], 4);
        assert_eq!(
            sql,
            "CREATE MATERIALIZED VIEW __mqpump_view AS SELECT \
             ROW_NUMBER() OVER () AS __mqpump_view_row_num, \
             MOD(ROW_NUMBER() OVER (), 4) AS __mqpump_view_mod_row_num, id \
             FROM events WHERE kind = 'order'"
        );
    }

    #[test]
    fn test_create_view_sql_without_predicate() {
        let sql = create_view_sql("events", "", &["a".into(), "b".into()], 2);
        assert!(sql.ends_with("a, b FROM events"));
    }

    #[test]
    fn test_shard_page_sql() {
        let sql = shard_page_sql(
            "events",
            &["events.id".into(), "events.payload".into()],
            &["id".into()],
            250,
        );
        assert_eq!(
            sql,
            "SELECT __mqpump_view_row_num, events.id, events.payload \
             FROM events INNER JOIN __mqpump_view USING (id) \
             WHERE __mqpump_view_mod_row_num = $1 AND __mqpump_view_row_num > $2 \
             ORDER BY __mqpump_view_row_num LIMIT 250"
        );
    }

    #[test]
    fn test_append_mod_clause_without_where() {
        let got = append_id_mod_clause("SELECT id FROM something", 5, 4).unwrap();
        assert_eq!(got, "SELECT id FROM something WHERE id % 5 = 4");
    }

    #[test]
    fn test_append_mod_clause_to_existing_where() {
        let got = append_id_mod_clause("SELECT id FROM something WHERE 5 > 0", 5, 4).unwrap();
        assert_eq!(got, "SELECT id FROM something WHERE 5 > 0 AND id % 5 = 4");
    }

    #[test]
    fn test_append_mod_clause_to_where_with_and() {
        let got =
            append_id_mod_clause("SELECT id FROM something WHERE 5 > 0 AND id > 2", 5, 4).unwrap();
        assert_eq!(
            got,
            "SELECT id FROM something WHERE 5 > 0 AND id > 2 AND id % 5 = 4"
        );
    }

    #[test]
    fn test_append_mod_clause_preserves_string_literals() {
        let got = append_id_mod_clause(
            "SELECT id, updated_at FROM something WHERE updated_at > '2019-10-15 09:28'",
            5,
            4,
        )
        .unwrap();
        assert_eq!(
            got,
            "SELECT id, updated_at FROM something WHERE updated_at > '2019-10-15 09:28' AND id % 5 = 4"
        );
    }

    #[test]
    fn test_append_mod_clause_preserves_group_by() {
        let got = append_id_mod_clause(
            "SELECT some_type, count(id) FROM something WHERE updated_at > '2019-10-15 09:28' GROUP BY some_type",
            2,
            0,
        )
        .unwrap();
        assert_eq!(
            got,
            "SELECT some_type, count(id) FROM something WHERE updated_at > '2019-10-15 09:28' AND id % 2 = 0 GROUP BY some_type"
        );
    }

    #[test]
    fn test_append_mod_clause_rejects_non_select() {
        assert!(append_id_mod_clause("DELETE FROM something", 2, 0).is_err());
        assert!(append_id_mod_clause("not sql at all", 2, 0).is_err());
    }
}
