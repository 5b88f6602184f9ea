use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::Column;
use crate::sync::EditRow;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectBookings {
        booking_no: Option<String>,
    },
    SelectYard {
        zone: Option<String>,
    },
    SelectZones,
    UpsertBookings {
        rows: Vec<EditRow>,
    },
    ReleaseBooking {
        booking_no: String,
    },
    AssignBay {
        booking_no: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(prefix) = trimmed.get(..7)
        && prefix.eq_ignore_ascii_case("ASSIGN ")
    {
        let booking_no = unquote(trimmed[7..].trim().trim_end_matches(';').trim())?;
        if booking_no.is_empty() {
            return Err(SqlError::MissingFilter("booking_no"));
        }
        return Ok(Command::AssignBay { booking_no });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `'B-1'` or a bare word. Doubled quotes inside a quoted value are unescaped.
fn unquote(raw: &str) -> Result<String, SqlError> {
    match raw.strip_prefix('\'') {
        Some(rest) => rest
            .strip_suffix('\'')
            .map(|inner| inner.replace("''", "'"))
            .ok_or_else(|| SqlError::Parse(format!("unterminated string: {raw}"))),
        None => Ok(raw.to_string()),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let columns: Vec<Column> = if insert.columns.is_empty() {
        Column::ALL.to_vec()
    } else {
        insert
            .columns
            .iter()
            .map(|c| {
                let name = c.to_string();
                let name = name.rsplit('.').next().unwrap_or(&name).trim_matches('"').to_string();
                Column::from_header(&name).ok_or(SqlError::UnknownColumn(name))
            })
            .collect::<Result<_, _>>()?
    };
    if !columns.contains(&Column::BookingNo) {
        return Err(SqlError::MissingFilter("booking_no"));
    }

    let all_rows = extract_all_insert_rows(insert)?;
    let mut rows = Vec::with_capacity(all_rows.len());
    for (i, values) in all_rows.iter().enumerate() {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity("bookings row", columns.len(), values.len()));
        }
        let mut row = EditRow::default();
        for (column, expr) in columns.iter().zip(values) {
            let value = parse_text(expr).map_err(|e| SqlError::Parse(format!("row {}: {e}", i + 1)))?;
            match column {
                Column::BookingNo => row.booking_no = value,
                Column::Zone => row.zone = Some(value),
                Column::Bay => row.bay = Some(value),
                Column::Time => row.time = Some(value),
                Column::Status => row.status = Some(value),
            }
        }
        rows.push(row);
    }
    Ok(Command::UpsertBookings { rows })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let booking_no =
        extract_where_eq(delete.selection.as_ref(), "booking_no")?.ok_or(SqlError::MissingFilter("booking_no"))?;
    Ok(Command::ReleaseBooking { booking_no })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let selection = select.selection.as_ref();

    match table.as_str() {
        "bookings" => Ok(Command::SelectBookings {
            booking_no: extract_where_eq(selection, "booking_no")?,
        }),
        "yard" => Ok(Command::SelectYard {
            zone: extract_where_eq(selection, "zone")?,
        }),
        "zones" => match selection {
            None => Ok(Command::SelectZones),
            Some(_) => Err(SqlError::Unsupported("WHERE on zones".into())),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// The value of a single `column = '...'` filter. Any other WHERE shape is
/// rejected rather than ignored.
fn extract_where_eq(selection: Option<&Expr>, column: &'static str) -> Result<Option<String>, SqlError> {
    let Some(sel) = selection else {
        return Ok(None);
    };
    match sel {
        Expr::Nested(inner) => extract_where_eq(Some(inner.as_ref()), column),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left) {
            Some(name) if name == column => Ok(Some(parse_text(right)?)),
            Some(name) => Err(SqlError::UnknownColumn(name)),
            None => Err(SqlError::MissingFilter(column)),
        },
        _ => Err(SqlError::Unsupported(format!("WHERE {sel}"))),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Any literal as text. `NULL` is the empty string, which clears a bay.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(s.clone()),
            Value::Boolean(b) => Ok(b.to_string()),
            Value::Null => Ok(String::new()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
