use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDoctor {
        id: Ulid,
        name: String,
    },
    InsertSlot {
        id: Ulid,
        doctor_id: Ulid,
        start: Ms,
        end: Ms,
        max_capacity: u32,
    },
    /// Closes the slot; its row stays visible in `slots`.
    DeleteSlot {
        id: Ulid,
    },
    InsertToken {
        patient_name: String,
        /// Raw category text, validated by the engine's priority policy.
        category: String,
        slot_id: Ulid,
    },
    InsertEmergencyToken {
        patient_name: String,
        slot_id: Ulid,
    },
    /// Cancels the token.
    DeleteToken {
        id: Ulid,
    },
    InsertNoShow {
        token_id: Ulid,
    },
    InsertCompletion {
        token_id: Ulid,
    },
    InsertReassignment {
        token_id: Ulid,
        slot_id: Ulid,
    },
    SelectDoctors,
    SelectSlots {
        doctor_id: Ulid,
    },
    SelectSchedule {
        doctor_id: Option<Ulid>,
    },
    SelectToken {
        id: Ulid,
    },
    SelectStrandedTokens,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = extract_insert_values(insert)?;

    match table.as_str() {
        "doctors" => {
            let v = row_by_columns("doctors", insert, row, &["id", "name"])?;
            Ok(Command::InsertDoctor {
                id: parse_ulid(&v[0])?,
                name: parse_string(&v[1])?,
            })
        }
        "slots" => {
            let v = row_by_columns(
                "slots",
                insert,
                row,
                &["id", "doctor_id", "start", "end", "max_capacity"],
            )?;
            Ok(Command::InsertSlot {
                id: parse_ulid(&v[0])?,
                doctor_id: parse_ulid(&v[1])?,
                start: parse_i64(&v[2])?,
                end: parse_i64(&v[3])?,
                max_capacity: parse_u32(&v[4])?,
            })
        }
        "tokens" => {
            let v = row_by_columns("tokens", insert, row, &["patient_name", "category", "slot_id"])?;
            Ok(Command::InsertToken {
                patient_name: parse_string(&v[0])?,
                category: parse_string(&v[1])?,
                slot_id: parse_ulid(&v[2])?,
            })
        }
        "emergency_tokens" => {
            let v = row_by_columns("emergency_tokens", insert, row, &["patient_name", "slot_id"])?;
            Ok(Command::InsertEmergencyToken {
                patient_name: parse_string(&v[0])?,
                slot_id: parse_ulid(&v[1])?,
            })
        }
        "no_shows" => {
            let v = row_by_columns("no_shows", insert, row, &["token_id"])?;
            Ok(Command::InsertNoShow {
                token_id: parse_ulid(&v[0])?,
            })
        }
        "completions" => {
            let v = row_by_columns("completions", insert, row, &["token_id"])?;
            Ok(Command::InsertCompletion {
                token_id: parse_ulid(&v[0])?,
            })
        }
        "reassignments" => {
            let v = row_by_columns("reassignments", insert, row, &["token_id", "slot_id"])?;
            Ok(Command::InsertReassignment {
                token_id: parse_ulid(&v[0])?,
                slot_id: parse_ulid(&v[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_eq(&delete.selection, "id")?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "tokens" => Ok(Command::DeleteToken { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    match table.as_str() {
        "doctors" => Ok(Command::SelectDoctors),
        "slots" => Ok(Command::SelectSlots {
            doctor_id: extract_where_eq(&select.selection, "doctor_id")?,
        }),
        "schedule" => {
            let doctor_id = match &select.selection {
                Some(_) => Some(extract_where_eq(&select.selection, "doctor_id")?),
                None => None,
            };
            Ok(Command::SelectSchedule { doctor_id })
        }
        "tokens" => Ok(Command::SelectToken {
            id: extract_where_eq(&select.selection, "id")?,
        }),
        "stranded_tokens" => Ok(Command::SelectStrandedTokens),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Put a VALUES row into `columns` order. Without a column list the row is
/// positional. With one, each of `columns` must be named exactly once.
fn row_by_columns(
    table: &'static str,
    insert: &ast::Insert,
    row: Vec<Expr>,
    columns: &[&str],
) -> Result<Vec<Expr>, SqlError> {
    if row.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    if insert.columns.is_empty() {
        return Ok(row);
    }
    if insert.columns.len() != row.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            insert.columns.len(),
            row.len()
        )));
    }

    let named: Vec<String> = insert
        .columns
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect();
    if let Some(unknown) = named.iter().find(|n| !columns.contains(&n.as_str())) {
        return Err(SqlError::Parse(format!("{table}: unknown column {unknown}")));
    }
    columns
        .iter()
        .map(|col| {
            let mut hits = named.iter().enumerate().filter(|(_, n)| n.as_str() == *col);
            match (hits.next(), hits.next()) {
                (Some((i, _)), None) => Ok(row[i].clone()),
                (Some(_), Some(_)) => Err(SqlError::Parse(format!("{table}: duplicate column {col}"))),
                (None, _) => Err(SqlError::Parse(format!("{table}: missing column {col}"))),
            }
        })
        .collect()
}

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

/// First row of a `VALUES` list. Multi-row inserts are not accepted.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// `WHERE <column> = <ulid>`.
fn extract_where_eq(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => parse_ulid(right),
        Expr::Nested(inner) => extract_where_eq(&Some((**inner).clone()), column),
        _ => Err(SqlError::MissingFilter(column)),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
