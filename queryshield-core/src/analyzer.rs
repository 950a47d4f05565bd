//! Semantic query analysis. Only the features that drive method selection and
//! sensitivity are extracted: referenced tables and columns, aggregation
//! class, joins, nested queries, window functions and set operations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlparser::{
    ast::{
        Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, JoinConstraint, JoinOperator,
        Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, WindowType,
    },
    dialect::GenericDialect,
    parser::Parser,
};

use crate::error::{ShieldError, ShieldResult};

/// Aggregates the analyzer does not model. Releasing them unprotected would
/// bypass the sensitivity calculation, so queries using them are refused.
const UNMODELED_AGGREGATES: &[&str] = &[
    "STDDEV",
    "STDDEV_POP",
    "STDDEV_SAMP",
    "VARIANCE",
    "VAR_POP",
    "VAR_SAMP",
    "MEDIAN",
    "MODE",
    "PERCENTILE_CONT",
    "PERCENTILE_DISC",
    "ARRAY_AGG",
    "STRING_AGG",
    "GROUP_CONCAT",
    "LISTAGG",
    "JSON_AGG",
    "BIT_AND",
    "BIT_OR",
    "BOOL_AND",
    "BOOL_OR",
    "EVERY",
];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    pub fn from_function(name: &str) -> Option<Self> {
        match name {
            "COUNT" => Some(AggregateKind::Count),
            "SUM" => Some(AggregateKind::Sum),
            "AVG" => Some(AggregateKind::Avg),
            "MIN" => Some(AggregateKind::Min),
            "MAX" => Some(AggregateKind::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::Count => "COUNT",
            AggregateKind::Sum => "SUM",
            AggregateKind::Avg => "AVG",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateCall {
    pub kind: AggregateKind,
    /// First argument when it is a plain column; `*` for `COUNT(*)`.
    pub column: Option<String>,
    pub distinct: bool,
    pub windowed: bool,
    /// Lower-cased alias, or the rendered expression when unaliased.
    pub output_name: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
    Semi,
    Anti,
    Apply,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinDescriptor {
    pub kind: JoinKind,
    pub tables: Vec<String>,
    pub predicate: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowDescriptor {
    pub function: String,
    pub partition_by: Vec<String>,
    pub order_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_window: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "name", rename_all = "kebab-case")]
pub enum SubqueryOrigin {
    Cte(String),
    Derived(Option<String>),
    Scalar,
    InList,
    Exists,
    SetBranch,
}

/// Immutable description of one query level. Nested queries are analyzed
/// independently and owned by their parent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisResult {
    pub query_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<SubqueryOrigin>,
    pub tables: BTreeSet<String>,
    pub columns: Vec<String>,
    pub aggregations: BTreeSet<AggregateKind>,
    pub aggregate_calls: Vec<AggregateCall>,
    pub joins: Vec<JoinDescriptor>,
    pub subqueries: Vec<AnalysisResult>,
    pub windows: Vec<WindowDescriptor>,
    pub set_branches: Vec<AnalysisResult>,
    pub group_by: Vec<String>,
    /// Select-list alias to the columns its expression reads. Unaliased
    /// expressions are keyed by their lower-cased text.
    pub aliases: BTreeMap<String, Vec<String>>,
    /// Keys of `aliases` that came from unaliased expressions; a real
    /// executor may name these columns differently.
    #[serde(default)]
    pub unnamed_outputs: BTreeSet<String>,
    pub cte_names: BTreeSet<String>,
    pub has_filter: bool,
    pub has_limit: bool,
    pub is_export: bool,
}

impl AnalysisResult {
    fn node(query_text: String, origin: Option<SubqueryOrigin>) -> Self {
        Self {
            query_text,
            origin,
            ..Self::default()
        }
    }

    /// True when the released output itself is aggregated.
    pub fn has_aggregation(&self) -> bool {
        !self.aggregations.is_empty() || self.set_branches.iter().any(Self::has_aggregation)
    }

    /// True when this level or any nested level aggregates.
    pub fn aggregates_anywhere(&self) -> bool {
        self.has_aggregation() || self.subqueries.iter().any(Self::aggregates_anywhere)
    }

    /// Base tables read by this level and everything nested below it.
    pub fn base_tables(&self) -> BTreeSet<String> {
        let mut tables = self.tables.clone();
        for nested in self.subqueries.iter().chain(self.set_branches.iter()) {
            tables.extend(nested.base_tables());
        }
        tables
    }

    /// True when this level or any nested level combines relations.
    pub fn joins_anywhere(&self) -> bool {
        !self.joins.is_empty()
            || self
                .subqueries
                .iter()
                .chain(self.set_branches.iter())
                .any(Self::joins_anywhere)
    }

    /// Every column referenced anywhere in the query tree, de-duplicated.
    pub fn referenced_columns(&self) -> BTreeSet<String> {
        let mut columns: BTreeSet<String> = self.columns.iter().cloned().collect();
        for nested in self.subqueries.iter().chain(self.set_branches.iter()) {
            columns.extend(nested.referenced_columns());
        }
        columns
    }

    /// True when a `*` projection (not `COUNT(*)`) reaches the output.
    pub fn projects_wildcard(&self) -> bool {
        let stars = self.columns.iter().filter(|column| column.as_str() == "*").count();
        let counted = self
            .aggregate_calls
            .iter()
            .filter(|call| call.column.as_deref() == Some("*"))
            .count();
        if self.set_branches.is_empty() {
            stars > counted
        } else {
            self.set_branches.iter().any(Self::projects_wildcard)
        }
    }

    fn absorb(&mut self, other: AnalysisResult) {
        self.tables.extend(other.tables);
        self.columns.extend(other.columns);
        self.aggregations.extend(other.aggregations);
        self.aggregate_calls.extend(other.aggregate_calls);
        self.joins.extend(other.joins);
        self.subqueries.extend(other.subqueries);
        self.windows.extend(other.windows);
        self.set_branches.extend(other.set_branches);
        self.group_by.extend(other.group_by);
        self.aliases.extend(other.aliases);
        self.unnamed_outputs.extend(other.unnamed_outputs);
        self.cte_names.extend(other.cte_names);
        self.has_filter |= other.has_filter;
        self.has_limit |= other.has_limit;
    }

    fn summarize_branch(&mut self, branch: &AnalysisResult) {
        self.tables.extend(branch.tables.iter().cloned());
        self.columns.extend(branch.columns.iter().cloned());
        self.aggregations.extend(branch.aggregations.iter().copied());
        self.has_filter |= branch.has_filter;
    }
}

/// Lower-cases and collapses whitespace so trivially different spellings of
/// the same query share a fingerprint.
pub fn normalize_query(query_text: &str) -> String {
    query_text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .to_lowercase()
}

/// Short stable identifier of a query, used in ledger transactions and audit
/// entries.
pub fn query_fingerprint(query_text: &str) -> String {
    let digest = blake3::hash(normalize_query(query_text).as_bytes());
    digest.to_hex()[..16].to_string()
}

/// Parses `query_text` and extracts its semantic shape. Pure and
/// deterministic: identical text always yields an identical result.
pub fn analyze(query_text: &str) -> ShieldResult<AnalysisResult> {
    let dialect = GenericDialect {};
    let statements =
        Parser::parse_sql(&dialect, query_text).map_err(|err| ShieldError::Parse(err.to_string()))?;
    let statement = match statements.as_slice() {
        [] => return Err(ShieldError::Parse("empty query".into())),
        [single] => single,
        _ => {
            return Err(ShieldError::UnsupportedConstruct(
                "multiple statements in one request".into(),
            ))
        }
    };
    let Statement::Query(query) = statement else {
        return Err(ShieldError::UnsupportedConstruct(format!(
            "{} statements are not read-only queries",
            statement_keyword(statement)
        )));
    };
    let mut result = analyze_query(query, None, &BTreeSet::new())?;
    result.query_text = normalize_query(query_text);
    if result.base_tables().is_empty() {
        return Err(ShieldError::UnsupportedConstruct(
            "query does not read from any table".into(),
        ));
    }
    if result.columns.is_empty() {
        return Err(ShieldError::UnsupportedConstruct(
            "query does not reference any column".into(),
        ));
    }
    result.is_export = !result.has_aggregation() && !result.has_filter && !result.has_limit;
    Ok(result)
}

fn statement_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

fn unsupported(what: impl Into<String>) -> ShieldError {
    ShieldError::UnsupportedConstruct(what.into())
}

fn analyze_query(
    query: &Query,
    origin: Option<SubqueryOrigin>,
    scope: &BTreeSet<String>,
) -> ShieldResult<AnalysisResult> {
    let mut node = AnalysisResult::node(query.to_string(), origin);
    let mut scope = scope.clone();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            let name = cte.alias.name.value.to_lowercase();
            let origin = Some(SubqueryOrigin::Cte(name.clone()));
            let nested = analyze_query(&cte.query, origin, &scope)?;
            node.subqueries.push(nested);
            node.cte_names.insert(name.clone());
            scope.insert(name);
        }
    }
    visit_set_expr(&query.body, &mut node, &scope)?;
    for item in &query.order_by {
        visit_expr(&item.expr, &mut node, &scope, None)?;
    }
    node.has_limit |= query.limit.is_some() || query.fetch.is_some();
    Ok(node)
}

fn visit_set_expr(
    body: &SetExpr,
    node: &mut AnalysisResult,
    scope: &BTreeSet<String>,
) -> ShieldResult<()> {
    match body {
        SetExpr::Select(select) => visit_select(select, node, scope),
        SetExpr::Query(query) => {
            let inner = analyze_query(query, None, scope)?;
            node.absorb(inner);
            Ok(())
        }
        SetExpr::SetOperation { left, right, .. } => {
            for side in [left, right] {
                let mut branch =
                    AnalysisResult::node(side.to_string(), Some(SubqueryOrigin::SetBranch));
                visit_set_expr(side, &mut branch, scope)?;
                node.summarize_branch(&branch);
                node.set_branches.push(branch);
            }
            Ok(())
        }
        SetExpr::Values(_) => Err(unsupported("VALUES lists")),
        other => Err(unsupported(format!("query body `{other}`"))),
    }
}

fn visit_select(
    select: &Select,
    node: &mut AnalysisResult,
    scope: &BTreeSet<String>,
) -> ShieldResult<()> {
    if select.into.is_some() {
        return Err(unsupported("SELECT ... INTO writes a table"));
    }
    let mut previous: Option<String> = None;
    for from in &select.from {
        let left = visit_table_with_joins(from, node, scope)?;
        // `FROM a, b` is a cross join filtered by WHERE.
        if let Some(prior) = previous.replace(left.clone()) {
            node.joins.push(JoinDescriptor {
                kind: JoinKind::Cross,
                tables: vec![prior, left],
                predicate: None,
            });
        }
    }
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) if column_name(expr).is_some() => {
                visit_expr(expr, node, scope, None)?
            }
            SelectItem::UnnamedExpr(expr) => {
                // Executors commonly name the column after the expression text.
                let name = expr.to_string().to_lowercase();
                if visit_aliased(expr, &name, node, scope)? {
                    node.unnamed_outputs.insert(name);
                }
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                visit_aliased(expr, &alias.value.to_lowercase(), node, scope)?;
            }
            SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(_) => {
                node.columns.push("*".into())
            }
        }
    }
    if let Some(selection) = &select.selection {
        node.has_filter = true;
        visit_expr(selection, node, scope, None)?;
    }
    if let GroupByExpr::Expressions(exprs) = &select.group_by {
        for expr in exprs {
            node.group_by
                .push(column_name(expr).unwrap_or_else(|| expr.to_string().to_lowercase()));
            visit_expr(expr, node, scope, None)?;
        }
    }
    if let Some(having) = &select.having {
        visit_expr(having, node, scope, None)?;
    }
    Ok(())
}

/// Visits a select-list expression and maps `name` to the columns it reads.
/// Returns false when it reads none.
fn visit_aliased(
    expr: &Expr,
    name: &str,
    node: &mut AnalysisResult,
    scope: &BTreeSet<String>,
) -> ShieldResult<bool> {
    let start = node.columns.len();
    visit_expr(expr, node, scope, Some(name))?;
    let sources: Vec<String> = node.columns[start..]
        .iter()
        .filter(|column| column.as_str() != "*")
        .cloned()
        .collect();
    if sources.is_empty() {
        return Ok(false);
    }
    node.aliases.insert(name.to_string(), sources);
    Ok(true)
}

/// Records the relation and its joins, returning the name of the leftmost
/// relation.
fn visit_table_with_joins(
    from: &TableWithJoins,
    node: &mut AnalysisResult,
    scope: &BTreeSet<String>,
) -> ShieldResult<String> {
    let left = visit_factor(&from.relation, node, scope)?;
    for join in &from.joins {
        let right = visit_factor(&join.relation, node, scope)?;
        let (kind, constraint) = join_kind(&join.join_operator);
        let predicate = match constraint {
            Some(JoinConstraint::On(expr)) => {
                visit_expr(expr, node, scope, None)?;
                Some(expr.to_string())
            }
            Some(JoinConstraint::Using(idents)) => {
                let names: Vec<String> =
                    idents.iter().map(|ident| ident.value.to_lowercase()).collect();
                node.columns.extend(names.iter().cloned());
                Some(format!("USING ({})", names.join(", ")))
            }
            Some(JoinConstraint::Natural) => Some("NATURAL".into()),
            _ => None,
        };
        node.joins.push(JoinDescriptor {
            kind,
            tables: vec![left.clone(), right],
            predicate,
        });
    }
    Ok(left)
}

#[allow(unreachable_patterns)]
fn join_kind(operator: &JoinOperator) -> (JoinKind, Option<&JoinConstraint>) {
    match operator {
        JoinOperator::Inner(constraint) => (JoinKind::Inner, Some(constraint)),
        JoinOperator::LeftOuter(constraint) => (JoinKind::Left, Some(constraint)),
        JoinOperator::RightOuter(constraint) => (JoinKind::Right, Some(constraint)),
        JoinOperator::FullOuter(constraint) => (JoinKind::Full, Some(constraint)),
        JoinOperator::CrossJoin => (JoinKind::Cross, None),
        JoinOperator::LeftSemi(constraint) | JoinOperator::RightSemi(constraint) => {
            (JoinKind::Semi, Some(constraint))
        }
        JoinOperator::LeftAnti(constraint) | JoinOperator::RightAnti(constraint) => {
            (JoinKind::Anti, Some(constraint))
        }
        JoinOperator::CrossApply | JoinOperator::OuterApply => (JoinKind::Apply, None),
        _ => (JoinKind::Other, None),
    }
}

fn visit_factor(
    factor: &TableFactor,
    node: &mut AnalysisResult,
    scope: &BTreeSet<String>,
) -> ShieldResult<String> {
    match factor {
        TableFactor::Table { name, .. } => {
            let table = name
                .0
                .iter()
                .map(|ident| ident.value.to_lowercase())
                .collect::<Vec<_>>()
                .join(".");
            if !scope.contains(&table) {
                node.tables.insert(table.clone());
            }
            Ok(table)
        }
        TableFactor::Derived { subquery, alias, .. } => {
            let alias = alias.as_ref().map(|alias| alias.name.value.to_lowercase());
            let origin = Some(SubqueryOrigin::Derived(alias.clone()));
            let nested = analyze_query(subquery, origin, scope)?;
            node.subqueries.push(nested);
            Ok(alias.unwrap_or_else(|| "(derived)".into()))
        }
        TableFactor::NestedJoin { table_with_joins, .. } => {
            visit_table_with_joins(table_with_joins, node, scope)
        }
        other => Err(unsupported(format!("table source `{other}`"))),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|ident| ident.value.to_lowercase()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

fn visit_expr(
    expr: &Expr,
    node: &mut AnalysisResult,
    scope: &BTreeSet<String>,
    alias: Option<&str>,
) -> ShieldResult<()> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            if let Some(column) = column_name(expr) {
                node.columns.push(column);
            }
        }
        Expr::Function(function) => visit_function(function, expr, node, scope, alias)?,
        Expr::Subquery(query) => {
            let nested = analyze_query(query, Some(SubqueryOrigin::Scalar), scope)?;
            node.subqueries.push(nested);
        }
        Expr::InSubquery { expr, subquery, .. } => {
            visit_expr(expr, node, scope, None)?;
            let nested = analyze_query(subquery, Some(SubqueryOrigin::InList), scope)?;
            node.subqueries.push(nested);
        }
        Expr::Exists { subquery, .. } => {
            let nested = analyze_query(subquery, Some(SubqueryOrigin::Exists), scope)?;
            node.subqueries.push(nested);
        }
        Expr::BinaryOp { left, right, .. } => {
            visit_expr(left, node, scope, None)?;
            visit_expr(right, node, scope, None)?;
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::Cast { expr, .. } => visit_expr(expr, node, scope, alias)?,
        Expr::InList { expr, list, .. } => {
            visit_expr(expr, node, scope, None)?;
            for item in list {
                visit_expr(item, node, scope, None)?;
            }
        }
        Expr::Between { expr, low, high, .. } => {
            visit_expr(expr, node, scope, None)?;
            visit_expr(low, node, scope, None)?;
            visit_expr(high, node, scope, None)?;
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            visit_expr(expr, node, scope, None)?;
            visit_expr(pattern, node, scope, None)?;
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                visit_expr(operand, node, scope, None)?;
            }
            for item in conditions.iter().chain(results.iter()) {
                visit_expr(item, node, scope, None)?;
            }
            if let Some(else_result) = else_result {
                visit_expr(else_result, node, scope, None)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn visit_function(
    function: &Function,
    expr: &Expr,
    node: &mut AnalysisResult,
    scope: &BTreeSet<String>,
    alias: Option<&str>,
) -> ShieldResult<()> {
    let name = function.name.to_string().to_uppercase();
    if UNMODELED_AGGREGATES.contains(&name.as_str()) {
        return Err(unsupported(format!("aggregate function {name}")));
    }
    let mut first_column = None;
    for (position, arg) in function.args.iter().enumerate() {
        let arg = match arg {
            FunctionArg::Named { arg, .. } => arg,
            FunctionArg::Unnamed(arg) => arg,
        };
        match arg {
            FunctionArgExpr::Expr(inner) => {
                if position == 0 {
                    first_column = column_name(inner);
                }
                visit_expr(inner, node, scope, None)?;
            }
            FunctionArgExpr::Wildcard | FunctionArgExpr::QualifiedWildcard(_) => {
                if position == 0 {
                    first_column = Some("*".into());
                }
                node.columns.push("*".into());
            }
        }
    }
    if let Some(kind) = AggregateKind::from_function(&name) {
        node.aggregations.insert(kind);
        node.aggregate_calls.push(AggregateCall {
            kind,
            column: first_column,
            distinct: function.distinct,
            windowed: function.over.is_some(),
            output_name: alias
                .map(str::to_string)
                .unwrap_or_else(|| expr.to_string())
                .to_lowercase(),
        });
    }
    if let Some(over) = &function.over {
        let window = match over {
            WindowType::WindowSpec(spec) => {
                for item in &spec.partition_by {
                    visit_expr(item, node, scope, None)?;
                }
                for item in &spec.order_by {
                    visit_expr(&item.expr, node, scope, None)?;
                }
                WindowDescriptor {
                    function: name,
                    partition_by: spec
                        .partition_by
                        .iter()
                        .map(|item| column_name(item).unwrap_or_else(|| item.to_string()))
                        .collect(),
                    order_by: spec
                        .order_by
                        .iter()
                        .map(|item| {
                            column_name(&item.expr).unwrap_or_else(|| item.expr.to_string())
                        })
                        .collect(),
                    named_window: None,
                }
            }
            WindowType::NamedWindow(ident) => WindowDescriptor {
                function: name,
                partition_by: Vec::new(),
                order_by: Vec::new(),
                named_window: Some(ident.value.to_lowercase()),
            },
        };
        node.windows.push(window);
    }
    Ok(())
}
