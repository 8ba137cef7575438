//! The compiler's output contract.
//!
//! A [`QueryPlan`] is store-neutral: a predicate expression, a list of
//! relation traversals ([`Join`]) and a list of named subquery annotations.
//! Executors lower it to their native query API; [`QueryPlan::to_select`]
//! is the reference lowering for PostgreSQL via sea-query.

use sea_query::{Asterisk, Iden, JoinType, PostgresQueryBuilder, SelectStatement, SimpleExpr};

#[derive(Debug, Clone, PartialEq)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Rendered as a LEFT JOIN on the base query.
    ToOne,
    /// Collection fetch: either joined for aggregation (`on` set) or
    /// executed as a separate query keyed by `parent_key` (`plan` set).
    ToMany,
}

/// One physical relation traversal. Deduplicated by `path`, so every
/// relation is walked once no matter how many descriptors touch it.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Dotted relation path from the base entity, e.g. `customer.company`.
    pub path: String,
    pub alias: String,
    pub table: String,
    pub kind: JoinKind,
    /// Join condition, present when the traversal is rendered inline.
    pub on: Option<SimpleExpr>,
    /// Sub-plan for a separate eager-load query (to-many prefetch).
    pub plan: Option<Box<QueryPlan>>,
    /// Column in the sub-plan's rows that keys them back to parent ids.
    pub parent_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Exists,
    Scalar,
    JsonArray,
    /// Aggregate over an inline join; forces a GROUP BY on the base id.
    JoinAggregate,
}

/// A named expression selected alongside the base columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryAnnotation {
    pub alias: String,
    pub kind: AnnotationKind,
    pub expr: SimpleExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub entity: String,
    pub table: String,
    pub predicate: Option<SimpleExpr>,
    pub joins: Vec<Join>,
    pub annotations: Vec<SubqueryAnnotation>,
}

impl QueryPlan {
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            predicate: None,
            joins: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn join(&self, path: &str) -> Option<&Join> {
        self.joins.iter().find(|j| j.path == path)
    }

    pub fn annotation(&self, alias: &str) -> Option<&SubqueryAnnotation> {
        self.annotations.iter().find(|a| a.alias == alias)
    }

    /// Sub-plans are executed separately; everything else lowers to one
    /// SELECT.
    pub fn to_select(&self) -> SelectStatement {
        let mut select = SelectStatement::new();
        select.from(TableName(self.table.clone()));
        select.column(Asterisk);

        for join in &self.joins {
            if let Some(on) = &join.on {
                select.join_as(
                    JoinType::LeftJoin,
                    TableName(join.table.clone()),
                    TableName(join.alias.clone()),
                    on.clone(),
                );
            }
        }

        for annotation in &self.annotations {
            select.expr_as(
                annotation.expr.clone(),
                ColumnName(annotation.alias.clone()),
            );
        }

        if let Some(predicate) = &self.predicate {
            select.and_where(predicate.clone());
        }

        // Inline aggregates fan the base rows out; collapse them back
        if self
            .annotations
            .iter()
            .any(|a| a.kind == AnnotationKind::JoinAggregate)
        {
            select.group_by_col((
                TableName(self.table.clone()),
                ColumnName("id".to_string()),
            ));
        }

        select
    }

    pub fn to_sql(&self) -> String {
        self.to_select().to_string(PostgresQueryBuilder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::Expr;

    #[test]
    fn test_plain_plan_selects_star() {
        let plan = QueryPlan::new("customers", "customers");
        let sql = plan.to_sql();
        assert!(sql.contains(r#"SELECT *"#));
        assert!(sql.contains(r#"FROM "customers""#));
        assert!(!sql.contains("GROUP BY"));
    }

    #[test]
    fn test_to_one_join_is_rendered() {
        let mut plan = QueryPlan::new("orders", "orders");
        plan.joins.push(Join {
            path: "customer".to_string(),
            alias: "customer".to_string(),
            table: "customers".to_string(),
            kind: JoinKind::ToOne,
            on: Some(
                Expr::col((
                    TableName("customer".to_string()),
                    ColumnName("id".to_string()),
                ))
                .equals((
                    TableName("orders".to_string()),
                    ColumnName("customer_id".to_string()),
                )),
            ),
            plan: None,
            parent_key: None,
        });
        let sql = plan.to_sql();
        assert!(sql.contains(r#"LEFT JOIN "customers" AS "customer""#));
    }

    #[test]
    fn test_prefetch_join_is_not_rendered_inline() {
        let mut plan = QueryPlan::new("customers", "customers");
        plan.joins.push(Join {
            path: "orders".to_string(),
            alias: "orders".to_string(),
            table: "orders".to_string(),
            kind: JoinKind::ToMany,
            on: None,
            plan: Some(Box::new(QueryPlan::new("orders", "orders"))),
            parent_key: Some("customer_id".to_string()),
        });
        assert!(!plan.to_sql().contains("JOIN"));
    }

    #[test]
    fn test_join_aggregate_adds_group_by() {
        let mut plan = QueryPlan::new("customers", "customers");
        plan.annotations.push(SubqueryAnnotation {
            alias: "order_count".to_string(),
            kind: AnnotationKind::JoinAggregate,
            expr: Expr::cust("COUNT(1)"),
        });
        let sql = plan.to_sql();
        assert!(sql.contains(r#""order_count""#));
        assert!(sql.contains(r#"GROUP BY "customers"."id""#));
    }
}
