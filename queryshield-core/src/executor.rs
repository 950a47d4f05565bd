//! The data source seam. The driver only ever sees [`QueryExecutor`];
//! [`InMemoryExecutor`] backs tests, demos and the CLI.

use std::collections::BTreeMap;

use queryshield_mechanisms::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value as Cell;
use sqlparser::{
    ast::{
        BinaryOperator, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, SelectItem, SetExpr,
        Statement, TableFactor, UnaryOperator, Value,
    },
    dialect::GenericDialect,
    parser::Parser,
};
use thiserror::Error;
use tracing::debug;

use crate::analyzer::normalize_query;

/// The true, unprotected answer to a query.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryOutput {
    Scalar(f64),
    Vector(Vec<f64>),
    Rows(Vec<Row>),
}

impl QueryOutput {
    pub fn shape(&self) -> &'static str {
        match self {
            QueryOutput::Scalar(_) => "scalar",
            QueryOutput::Vector(_) => "vector",
            QueryOutput::Rows(_) => "rows",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor does not support this query: {0}")]
    Unsupported(String),
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("unknown column {0}")]
    UnknownColumn(String),
    #[error("executor backend failed: {0}")]
    Backend(String),
}

pub trait QueryExecutor: Send + Sync {
    fn execute(&self, sql: &str) -> Result<QueryOutput, ExecutorError>;
}

/// Serves canned fixtures first, then evaluates simple single-table
/// queries (projections, filters, GROUP BY and the five modelled
/// aggregates) over in-memory tables.
#[derive(Clone, Debug, Default)]
pub struct InMemoryExecutor {
    tables: BTreeMap<String, Vec<Row>>,
    fixtures: BTreeMap<String, QueryOutput>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, rows: Vec<Row>) -> Self {
        self.insert_table(name, rows);
        self
    }

    pub fn with_fixture(mut self, sql: &str, output: QueryOutput) -> Self {
        self.fixtures.insert(normalize_query(sql), output);
        self
    }

    /// Column names are lower-cased on the way in to match the analyzer.
    pub fn insert_table(&mut self, name: &str, rows: Vec<Row>) {
        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(column, value)| (column.to_lowercase(), value))
                    .collect()
            })
            .collect();
        self.tables.insert(name.to_lowercase(), rows);
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    fn evaluate(&self, sql: &str) -> Result<QueryOutput, ExecutorError> {
        let statements = Parser::parse_sql(&GenericDialect {}, sql)
            .map_err(|err| ExecutorError::Unsupported(err.to_string()))?;
        let [Statement::Query(query)] = statements.as_slice() else {
            return Err(ExecutorError::Unsupported("expected a single SELECT".into()));
        };
        if query.with.is_some() {
            return Err(ExecutorError::Unsupported("common table expressions".into()));
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(ExecutorError::Unsupported("set operations".into()));
        };
        let [from] = select.from.as_slice() else {
            return Err(ExecutorError::Unsupported("expected exactly one table".into()));
        };
        if !from.joins.is_empty() {
            return Err(ExecutorError::Unsupported("joins".into()));
        }
        let TableFactor::Table { name, .. } = &from.relation else {
            return Err(ExecutorError::Unsupported("derived tables".into()));
        };
        let table_name = name
            .0
            .last()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_default();
        let table = self
            .tables
            .get(&table_name)
            .ok_or_else(|| ExecutorError::UnknownTable(table_name.clone()))?;

        let mut rows: Vec<&Row> = Vec::new();
        for row in table {
            let keep = match &select.selection {
                Some(predicate) => truthy(&eval(predicate, row)?),
                None => true,
            };
            if keep {
                rows.push(row);
            }
        }

        let items = projection(&select.projection)?;
        let group_by: Vec<&Expr> = match &select.group_by {
            GroupByExpr::Expressions(exprs) => exprs.iter().collect(),
            GroupByExpr::All => {
                return Err(ExecutorError::Unsupported("GROUP BY ALL".into()));
            }
        };
        let aggregated = items.iter().any(|item| item.aggregate.is_some());
        let limit = match &query.limit {
            Some(expr) => Some(
                as_number(&eval(expr, &Row::new())?)
                    .filter(|limit| *limit >= 0.0)
                    .map(|limit| limit as usize)
                    .ok_or_else(|| ExecutorError::Unsupported("non-numeric LIMIT".into()))?,
            ),
            None => None,
        };

        let output = if !group_by.is_empty() {
            let mut groups: BTreeMap<String, (Row, Vec<&Row>)> = BTreeMap::new();
            for row in rows {
                let mut key = Row::new();
                for expr in &group_by {
                    key.insert(column_of(expr)?, eval(expr, row)?);
                }
                let sort_key = serde_json::to_string(&key)
                    .map_err(|err| ExecutorError::Backend(err.to_string()))?;
                groups.entry(sort_key).or_insert_with(|| (key, Vec::new())).1.push(row);
            }
            let mut out = Vec::new();
            for (_, (key, members)) in groups {
                let mut row = Row::new();
                for item in &items {
                    let value = match &item.aggregate {
                        Some(aggregate) => number_cell(aggregate.apply(&members)?),
                        None => key
                            .get(&item.source)
                            .cloned()
                            .ok_or_else(|| ExecutorError::Unsupported(format!(
                                "{} is neither grouped nor aggregated",
                                item.source
                            )))?,
                    };
                    row.insert(item.output.clone(), value);
                }
                out.push(row);
            }
            QueryOutput::Rows(truncate(out, limit))
        } else if aggregated {
            let mut values = Vec::with_capacity(items.len());
            for item in &items {
                let aggregate = item.aggregate.as_ref().ok_or_else(|| {
                    ExecutorError::Unsupported(format!(
                        "{} mixes with aggregates without GROUP BY",
                        item.source
                    ))
                })?;
                values.push(aggregate.apply(&rows)?);
            }
            match values.as_slice() {
                [single] => QueryOutput::Scalar(*single),
                _ => QueryOutput::Vector(values),
            }
        } else {
            let mut out = Vec::new();
            for row in rows {
                if items.iter().any(|item| item.source == "*") {
                    out.push(row.clone());
                    continue;
                }
                let mut projected = Row::new();
                for item in &items {
                    let value = row
                        .get(&item.source)
                        .cloned()
                        .ok_or_else(|| ExecutorError::UnknownColumn(item.source.clone()))?;
                    projected.insert(item.output.clone(), value);
                }
                out.push(projected);
            }
            QueryOutput::Rows(truncate(out, limit))
        };
        Ok(output)
    }
}

impl QueryExecutor for InMemoryExecutor {
    fn execute(&self, sql: &str) -> Result<QueryOutput, ExecutorError> {
        if let Some(fixture) = self.fixtures.get(&normalize_query(sql)) {
            debug!("executor fixture hit shape={}", fixture.shape());
            return Ok(fixture.clone());
        }
        self.evaluate(sql)
    }
}

struct Item {
    /// Column read, `*` for wildcards.
    source: String,
    /// Column name in the output row.
    output: String,
    aggregate: Option<Aggregate>,
}

#[derive(Clone, Copy, PartialEq)]
enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

struct Aggregate {
    function: AggregateFn,
    column: Option<String>,
}

impl Aggregate {
    fn apply(&self, rows: &[&Row]) -> Result<f64, ExecutorError> {
        let Some(column) = &self.column else {
            return Ok(rows.len() as f64);
        };
        let mut values = Vec::new();
        for row in rows {
            match row.get(column) {
                None => return Err(ExecutorError::UnknownColumn(column.clone())),
                Some(Cell::Null) => {}
                Some(cell) => values.push(cell),
            }
        }
        if self.function == AggregateFn::Count {
            return Ok(values.len() as f64);
        }
        let numbers = values
            .into_iter()
            .map(|cell| {
                as_number(cell).ok_or_else(|| {
                    ExecutorError::Backend(format!("{column} holds non-numeric data"))
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        let empty = || ExecutorError::Backend(format!("no values to aggregate in {column}"));
        match self.function {
            AggregateFn::Count => Ok(numbers.len() as f64),
            AggregateFn::Sum => Ok(numbers.iter().sum()),
            AggregateFn::Avg if numbers.is_empty() => Err(empty()),
            AggregateFn::Avg => Ok(numbers.iter().sum::<f64>() / numbers.len() as f64),
            AggregateFn::Min => numbers.into_iter().reduce(f64::min).ok_or_else(empty),
            AggregateFn::Max => numbers.into_iter().reduce(f64::max).ok_or_else(empty),
        }
    }
}

fn projection(items: &[SelectItem]) -> Result<Vec<Item>, ExecutorError> {
    items
        .iter()
        .map(|item| match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => Ok(Item {
                source: "*".into(),
                output: "*".into(),
                aggregate: None,
            }),
            SelectItem::UnnamedExpr(expr) => item_for(expr, None),
            SelectItem::ExprWithAlias { expr, alias } => item_for(expr, Some(&alias.value)),
        })
        .collect()
}

fn item_for(expr: &Expr, alias: Option<&str>) -> Result<Item, ExecutorError> {
    let output = alias
        .map(str::to_string)
        .unwrap_or_else(|| expr.to_string())
        .to_lowercase();
    if let Expr::Function(function) = expr {
        let name = function.name.to_string().to_uppercase();
        let kind = match name.as_str() {
            "COUNT" => AggregateFn::Count,
            "SUM" => AggregateFn::Sum,
            "AVG" => AggregateFn::Avg,
            "MIN" => AggregateFn::Min,
            "MAX" => AggregateFn::Max,
            other => return Err(ExecutorError::Unsupported(format!("function {other}"))),
        };
        if function.distinct || function.over.is_some() {
            return Err(ExecutorError::Unsupported(format!(
                "DISTINCT or windowed {name}"
            )));
        }
        let column = match function.args.as_slice() {
            [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] if kind == AggregateFn::Count => None,
            [FunctionArg::Unnamed(FunctionArgExpr::Expr(inner))] => Some(column_of(inner)?),
            _ => return Err(ExecutorError::Unsupported(format!("arguments of {name}"))),
        };
        return Ok(Item {
            source: column.clone().unwrap_or_else(|| "*".into()),
            output,
            aggregate: Some(Aggregate {
                function: kind,
                column,
            }),
        });
    }
    let source = column_of(expr)?;
    let output = if alias.is_some() { output } else { source.clone() };
    Ok(Item {
        source,
        output,
        aggregate: None,
    })
}

fn column_of(expr: &Expr) -> Result<String, ExecutorError> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|ident| ident.value.to_lowercase())
            .ok_or_else(|| ExecutorError::Unsupported(expr.to_string())),
        Expr::Nested(inner) => column_of(inner),
        other => Err(ExecutorError::Unsupported(format!("expression {other}"))),
    }
}

fn eval(expr: &Expr, row: &Row) -> Result<Cell, ExecutorError> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            let column = column_of(expr)?;
            row.get(&column)
                .cloned()
                .ok_or(ExecutorError::UnknownColumn(column))
        }
        Expr::Nested(inner) => eval(inner, row),
        Expr::Value(Value::Number(text, _)) => text
            .parse::<f64>()
            .map(number_cell)
            .map_err(|err| ExecutorError::Unsupported(err.to_string())),
        Expr::Value(Value::SingleQuotedString(text)) => Ok(Cell::String(text.clone())),
        Expr::Value(Value::Boolean(flag)) => Ok(Cell::Bool(*flag)),
        Expr::Value(Value::Null) => Ok(Cell::Null),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Cell::Bool(!truthy(&eval(expr, row)?))),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => as_number(&eval(expr, row)?)
            .map(|value| number_cell(-value))
            .ok_or_else(|| ExecutorError::Unsupported(format!("negating {expr}"))),
        Expr::IsNull(inner) => Ok(Cell::Bool(eval(inner, row)?.is_null())),
        Expr::IsNotNull(inner) => Ok(Cell::Bool(!eval(inner, row)?.is_null())),
        Expr::BinaryOp { left, op, right } => {
            let left = eval(left, row)?;
            let right = eval(right, row)?;
            let outcome = match op {
                BinaryOperator::And => truthy(&left) && truthy(&right),
                BinaryOperator::Or => truthy(&left) || truthy(&right),
                BinaryOperator::Eq => compare(&left, &right) == Some(std::cmp::Ordering::Equal),
                BinaryOperator::NotEq => matches!(
                    compare(&left, &right),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Greater)
                ),
                BinaryOperator::Lt => compare(&left, &right) == Some(std::cmp::Ordering::Less),
                BinaryOperator::LtEq => matches!(
                    compare(&left, &right),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                ),
                BinaryOperator::Gt => compare(&left, &right) == Some(std::cmp::Ordering::Greater),
                BinaryOperator::GtEq => matches!(
                    compare(&left, &right),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                ),
                other => return Err(ExecutorError::Unsupported(format!("operator {other}"))),
            };
            Ok(Cell::Bool(outcome))
        }
        other => Err(ExecutorError::Unsupported(format!("expression {other}"))),
    }
}

fn compare(left: &Cell, right: &Cell) -> Option<std::cmp::Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(left), Some(right)) => left.partial_cmp(&right),
        _ => match (left, right) {
            (Cell::String(left), Cell::String(right)) => Some(left.cmp(right)),
            (Cell::Bool(left), Cell::Bool(right)) => Some(left.cmp(right)),
            _ => None,
        },
    }
}

fn truthy(cell: &Cell) -> bool {
    match cell {
        Cell::Bool(flag) => *flag,
        Cell::Null => false,
        other => as_number(other).map(|value| value != 0.0).unwrap_or(true),
    }
}

fn as_number(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Number(number) => number.as_f64(),
        Cell::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn number_cell(value: f64) -> Cell {
    serde_json::Number::from_f64(value)
        .map(Cell::Number)
        .unwrap_or(Cell::Null)
}

fn truncate(mut rows: Vec<Row>, limit: Option<usize>) -> Vec<Row> {
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    rows
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    fn executor() -> InMemoryExecutor {
        InMemoryExecutor::new().with_table(
            "users",
            vec![
                row(json!({"id": 1, "name": "Ann", "age": 34, "dept": "ops"})),
                row(json!({"id": 2, "name": "Bo", "age": 41, "dept": "eng"})),
                row(json!({"id": 3, "Name": "Cy", "age": 29, "dept": "eng"})),
            ],
        )
    }

    #[test]
    fn scalar_and_vector_aggregates() {
        let executor = executor();
        assert_eq!(
            executor.execute("SELECT COUNT(*) FROM users").unwrap(),
            QueryOutput::Scalar(3.0)
        );
        assert_eq!(
            executor
                .execute("SELECT SUM(age), MAX(age) FROM users WHERE dept = 'eng'")
                .unwrap(),
            QueryOutput::Vector(vec![70.0, 41.0])
        );
    }

    #[test]
    fn grouped_rows_use_output_names() {
        let output = executor()
            .execute("SELECT dept, COUNT(*) AS n FROM users GROUP BY dept")
            .unwrap();
        assert_eq!(
            output,
            QueryOutput::Rows(vec![
                row(json!({"dept": "eng", "n": 2.0})),
                row(json!({"dept": "ops", "n": 1.0})),
            ])
        );
    }

    #[test]
    fn projections_filter_and_limit() {
        let output = executor()
            .execute("SELECT name FROM users WHERE age > 30 LIMIT 1")
            .unwrap();
        assert_eq!(output, QueryOutput::Rows(vec![row(json!({"name": "Ann"}))]));
        let QueryOutput::Rows(all) = executor().execute("SELECT * FROM users").unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(all.len(), 3);
        assert_eq!(all[2]["name"], json!("Cy"));
    }

    #[test]
    fn fixtures_take_precedence() {
        let executor = executor().with_fixture("SELECT COUNT(*) FROM users", QueryOutput::Scalar(1000.0));
        assert_eq!(
            executor.execute("select count(*)  from USERS;").unwrap(),
            QueryOutput::Scalar(1000.0)
        );
        assert_eq!(
            executor.execute("SELECT COUNT(id) FROM users").unwrap(),
            QueryOutput::Scalar(3.0)
        );
    }

    #[test]
    fn unsupported_shapes_fail() {
        let executor = executor();
        assert!(matches!(
            executor.execute("SELECT COUNT(*) FROM missing"),
            Err(ExecutorError::UnknownTable(_))
        ));
        assert!(matches!(
            executor.execute("SELECT u.name FROM users u JOIN orders o ON u.id = o.uid"),
            Err(ExecutorError::Unsupported(_))
        ));
    }
}
