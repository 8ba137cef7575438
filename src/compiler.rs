//! Query compiler: condition tree + descriptor forest + context → QueryPlan.
//!
//! Predicates compile leaf by leaf. A leaf key walks relation segments
//! (separated by `__`) against the schema; relation hops become correlated
//! EXISTS subqueries so predicates stay relation-safe under OR. The terminal
//! segment dispatches on field type and lookup suffix.
//!
//! Descriptors compile per kind: to-one `Related` becomes an inline LEFT
//! JOIN, to-many a prefetch sub-plan, `Json` a correlated JSON-array
//! subquery, `Exists` a boolean EXISTS annotation, `ScalarSubquery` a
//! correlated scalar, `Aggregate` an inline join plus a grouped aggregate.
//! Joins are deduplicated by relation path so overlapping requests share
//! one traversal.

use std::collections::HashMap;

use sea_query::extension::postgres::{PgBinOper, PgExpr};
use sea_query::{
    Expr, Func, Order, SelectStatement, SimpleExpr, SubQueryStatement, Value,
};
use serde_json::Value as JsonValue;

use crate::condition::{ConditionLeaf, ConditionTree, NodeId, NodeView, QueryOp};
use crate::descriptor::{normalize, reduce, AggFunc, DescriptorKind, FieldDescriptor};
use crate::error::CompileError;
use crate::plan::{
    AnnotationKind, ColumnName, Join, JoinKind, QueryPlan, SubqueryAnnotation, TableName,
};
use crate::schema::{EntitySchema, FieldInfo, FieldType, RelationInfo, SchemaCache};

/// Caller-supplied values substituted into `$name` predicate placeholders.
pub type FilterContext = HashMap<String, JsonValue>;

pub struct QueryCompiler<'a> {
    schema: &'a SchemaCache,
}

/// Per-compilation scratch: the context map and a counter for unique
/// subquery aliases.
struct CompileState<'a> {
    context: &'a FilterContext,
    alias_seq: usize,
}

impl CompileState<'_> {
    fn subquery_alias(&mut self, table: &str) -> String {
        self.alias_seq += 1;
        format!("{table}_{}", self.alias_seq)
    }
}

fn col(table: &str, column: &str) -> Expr {
    Expr::col((
        TableName(table.to_string()),
        ColumnName(column.to_string()),
    ))
}

/// `''`, `'0'` and `'false'` are false, everything else is true.
fn truthy(value: &str) -> bool {
    !matches!(value, "" | "0" | "false")
}

fn join_path(prefix: &str, source: &str) -> String {
    if prefix.is_empty() {
        source.to_string()
    } else {
        format!("{prefix}.{source}")
    }
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a SchemaCache) -> Self {
        Self { schema }
    }

    /// Compile one request. Context keys required by the forest are
    /// validated up front so every missing key is reported at once.
    pub fn compile(
        &self,
        entity: &str,
        tree: &ConditionTree,
        descriptors: &[FieldDescriptor],
        context: &FilterContext,
    ) -> Result<QueryPlan, CompileError> {
        let schema = self.entity_schema(entity)?;

        let forest = reduce(normalize(descriptors.to_vec()))?;
        let mut missing = Vec::new();
        collect_missing_context(&forest, context, &mut missing);
        if !missing.is_empty() {
            return Err(CompileError::MissingContext { keys: missing });
        }

        let mut state = CompileState {
            context,
            alias_seq: 0,
        };
        let mut plan = QueryPlan::new(schema.entity.clone(), schema.table.clone());

        if let Some(root) = tree.root() {
            plan.predicate = self.compile_node(&schema, &schema.table, tree, root, &mut state)?;
        }
        for descriptor in &forest {
            self.compile_descriptor(&schema, &schema.table, "", descriptor, &mut state, &mut plan)?;
        }
        Ok(plan)
    }

    fn entity_schema(&self, entity: &str) -> Result<std::sync::Arc<EntitySchema>, CompileError> {
        self.schema.get(entity).ok_or_else(|| CompileError::UnknownEntity {
            entity: entity.to_string(),
        })
    }

    // ---- predicate compilation -------------------------------------

    /// Recurses over the condition tree. `None` means the subtree only
    /// referenced unknown fields and contributes nothing.
    fn compile_node(
        &self,
        schema: &EntitySchema,
        alias: &str,
        tree: &ConditionTree,
        id: NodeId,
        state: &mut CompileState,
    ) -> Result<Option<SimpleExpr>, CompileError> {
        match tree.node(id) {
            NodeView::Leaf(leaf) => self.compile_leaf(schema, alias, leaf, state),
            NodeView::Branch {
                left,
                op,
                right,
                negated,
            } => {
                let left = match left {
                    Some(l) => self.compile_node(schema, alias, tree, l, state)?,
                    None => None,
                };
                let right = match right {
                    Some(r) => self.compile_node(schema, alias, tree, r, state)?,
                    None => None,
                };
                let combined = match (left, right) {
                    (Some(l), Some(r)) => Some(match op {
                        Some(QueryOp::Or) => l.or(r),
                        _ => l.and(r),
                    }),
                    (Some(single), None) | (None, Some(single)) => Some(single),
                    (None, None) => None,
                };
                Ok(combined.map(|expr| if negated { expr.not() } else { expr }))
            }
        }
    }

    fn compile_leaf(
        &self,
        schema: &EntitySchema,
        alias: &str,
        leaf: &ConditionLeaf,
        state: &mut CompileState,
    ) -> Result<Option<SimpleExpr>, CompileError> {
        let value = resolve_value(&leaf.value, state.context);
        let expr = self.compile_key(schema, alias, &leaf.key, &value, state)?;
        Ok(expr.map(|e| if leaf.negated { e.not() } else { e }))
    }

    fn compile_key(
        &self,
        schema: &EntitySchema,
        alias: &str,
        key: &str,
        value: &str,
        state: &mut CompileState,
    ) -> Result<Option<SimpleExpr>, CompileError> {
        let segments: Vec<&str> = key.split("__").collect();
        let head = segments[0];

        if head == "$search" {
            return Ok(Some(self.search_expr(schema, alias, value)));
        }
        if let Some(rel) = schema.relation(head) {
            return self.compile_relation_key(alias, rel, &segments[1..], value, state);
        }
        let Some(field) = schema.field(head) else {
            // Unknown filter fields are skipped, not rejected
            return Ok(None);
        };

        match &segments[1..] {
            [] => Ok(Some(self.equality_expr(alias, field, value))),
            [suffix @ ("gt" | "gte" | "lt" | "lte")] => {
                Ok(Some(self.ordered_expr(alias, field, suffix, value)?))
            }
            ["isnull"] => {
                let column = col(alias, &field.name);
                Ok(Some(if truthy(value) {
                    column.is_null()
                } else {
                    column.is_not_null()
                }))
            }
            ["$search"] => Ok(Some(self.terms_expr(alias, field, value))),
            _ => Ok(None),
        }
    }

    fn compile_relation_key(
        &self,
        alias: &str,
        rel: &RelationInfo,
        rest: &[&str],
        value: &str,
        state: &mut CompileState,
    ) -> Result<Option<SimpleExpr>, CompileError> {
        let related = self.entity_schema(&rel.related_entity)?;

        match rest {
            ["exists"] => {
                let sub_alias = state.subquery_alias(&related.table);
                let select = self.correlated_select(alias, rel, &related.table, &sub_alias);
                let exists = Expr::exists(select);
                Ok(Some(if truthy(value) { exists } else { exists.not() }))
            }
            [] => {
                // Bare relation: match by related id
                if !rel.reverse && !rel.is_many_to_many {
                    let fk = col(alias, &rel.foreign_key);
                    if value == "null" {
                        return Ok(Some(fk.is_null()));
                    }
                    return Ok(Some(match value.parse::<i64>() {
                        Ok(id) => fk.eq(id),
                        Err(_) => fk.eq(value),
                    }));
                }
                let sub_alias = state.subquery_alias(&related.table);
                let mut select = self.correlated_select(alias, rel, &related.table, &sub_alias);
                if value == "null" {
                    return Ok(Some(Expr::exists(select).not()));
                }
                match value.parse::<i64>() {
                    Ok(id) => select.and_where(col(&sub_alias, "id").eq(id)),
                    Err(_) => select.and_where(col(&sub_alias, "id").eq(value)),
                };
                Ok(Some(Expr::exists(select)))
            }
            more => {
                // Deeper path: correlated EXISTS keeps the hop safe under OR
                let sub_alias = state.subquery_alias(&related.table);
                let inner_key = more.join("__");
                let Some(inner) =
                    self.compile_key(&related, &sub_alias, &inner_key, value, state)?
                else {
                    return Ok(None);
                };
                let mut select = self.correlated_select(alias, rel, &related.table, &sub_alias);
                select.and_where(inner);
                Ok(Some(Expr::exists(select)))
            }
        }
    }

    /// `SELECT 1 FROM related AS sub WHERE <correlation to outer row>`.
    fn correlated_select(
        &self,
        outer_alias: &str,
        rel: &RelationInfo,
        related_table: &str,
        sub_alias: &str,
    ) -> SelectStatement {
        let mut select = SelectStatement::new();
        select.from_as(
            TableName(related_table.to_string()),
            TableName(sub_alias.to_string()),
        );
        select.expr(Expr::val(1));
        select.and_where(self.correlation(outer_alias, rel, sub_alias));
        select
    }

    fn correlation(&self, outer_alias: &str, rel: &RelationInfo, target_alias: &str) -> SimpleExpr {
        if let (true, Some(through), Some(self_key), Some(related_key)) = (
            rel.is_many_to_many,
            &rel.through_table,
            &rel.through_self_key,
            &rel.through_related_key,
        ) {
            let mut link = SelectStatement::new();
            link.from(TableName(through.clone()));
            link.expr(Expr::val(1));
            link.and_where(col(through, self_key).equals((
                TableName(outer_alias.to_string()),
                ColumnName("id".to_string()),
            )));
            link.and_where(col(through, related_key).equals((
                TableName(target_alias.to_string()),
                ColumnName("id".to_string()),
            )));
            return Expr::exists(link);
        }
        if rel.reverse {
            col(target_alias, &rel.foreign_key).equals((
                TableName(outer_alias.to_string()),
                ColumnName("id".to_string()),
            ))
        } else {
            col(target_alias, "id").equals((
                TableName(outer_alias.to_string()),
                ColumnName(rel.foreign_key.clone()),
            ))
        }
    }

    fn equality_expr(&self, alias: &str, field: &FieldInfo, value: &str) -> SimpleExpr {
        let column = col(alias, &field.name);
        let textual = matches!(field.field_type, FieldType::String | FieldType::Text);
        // Literal null, or emptiness against a non-text field, means IS NULL
        if value == "null" || (value.is_empty() && !textual) {
            return column.is_null();
        }

        match &field.field_type {
            FieldType::Array(element) => {
                column.binary(PgBinOper::Overlap, Expr::val(array_value(element, value)))
            }
            FieldType::Boolean => column.eq(truthy(value)),
            FieldType::Text => column.ilike(format!("%{value}%")),
            FieldType::Integer => {
                // Uncastable equality means the row set is empty; a single
                // bad entry empties the whole list, it never shrinks the
                // match to the castable subset
                let parsed: Result<Vec<i64>, _> =
                    value.split(',').map(|v| v.trim().parse()).collect();
                match parsed {
                    Ok(values) if value.contains(',') => column.is_in(values),
                    Ok(values) => column.eq(values[0]),
                    Err(_) => Expr::val(false).into(),
                }
            }
            FieldType::Float => {
                let parsed: Result<Vec<f64>, _> =
                    value.split(',').map(|v| v.trim().parse()).collect();
                match parsed {
                    Ok(values) if value.contains(',') => column.is_in(values),
                    Ok(values) => column.eq(values[0]),
                    Err(_) => Expr::val(false).into(),
                }
            }
            FieldType::String | FieldType::Date | FieldType::DateTime => {
                if value.contains(',') {
                    column.is_in(value.split(',').map(str::trim).map(str::to_string))
                } else {
                    column.eq(value)
                }
            }
        }
    }

    fn ordered_expr(
        &self,
        alias: &str,
        field: &FieldInfo,
        suffix: &str,
        value: &str,
    ) -> Result<SimpleExpr, CompileError> {
        if !field.field_type.is_ordered() {
            return Err(CompileError::InvalidValue {
                field: field.name.clone(),
                value: value.to_string(),
                expected: "orderable value",
            });
        }
        let typed: Value = match field.field_type {
            FieldType::Integer => value
                .parse::<i64>()
                .map_err(|_| CompileError::InvalidValue {
                    field: field.name.clone(),
                    value: value.to_string(),
                    expected: "integer",
                })?
                .into(),
            FieldType::Float => value
                .parse::<f64>()
                .map_err(|_| CompileError::InvalidValue {
                    field: field.name.clone(),
                    value: value.to_string(),
                    expected: "number",
                })?
                .into(),
            _ => value.into(),
        };
        let column = col(alias, &field.name);
        Ok(match suffix {
            "gt" => column.gt(typed),
            "gte" => column.gte(typed),
            "lt" => column.lt(typed),
            _ => column.lte(typed),
        })
    }

    /// Whole-entity search: AND across terms, OR across searchable fields.
    fn search_expr(&self, schema: &EntitySchema, alias: &str, value: &str) -> SimpleExpr {
        let mut across_terms: Option<SimpleExpr> = None;
        for term in split_terms(value) {
            let mut across_fields: Option<SimpleExpr> = None;
            for field in schema.searchable_fields() {
                let hit = field_contains(alias, field, term);
                across_fields = Some(match across_fields {
                    Some(acc) => acc.or(hit),
                    None => hit,
                });
            }
            let Some(per_term) = across_fields else {
                continue;
            };
            across_terms = Some(match across_terms {
                Some(acc) => acc.and(per_term),
                None => per_term,
            });
        }
        across_terms.unwrap_or_else(|| Expr::val(true).into())
    }

    /// Single-field `$search`: AND across terms on one column.
    fn terms_expr(&self, alias: &str, field: &FieldInfo, value: &str) -> SimpleExpr {
        let mut acc: Option<SimpleExpr> = None;
        for term in split_terms(value) {
            let hit = field_contains(alias, field, term);
            acc = Some(match acc {
                Some(prev) => prev.and(hit),
                None => hit,
            });
        }
        acc.unwrap_or_else(|| Expr::val(true).into())
    }

    // ---- descriptor compilation ------------------------------------

    fn compile_descriptor(
        &self,
        schema: &EntitySchema,
        outer_alias: &str,
        path_prefix: &str,
        descriptor: &FieldDescriptor,
        state: &mut CompileState,
        plan: &mut QueryPlan,
    ) -> Result<(), CompileError> {
        match &descriptor.kind {
            DescriptorKind::Related { nested } => {
                self.compile_related(schema, outer_alias, path_prefix, descriptor, nested, state, plan)
            }
            DescriptorKind::Json { .. } => {
                let expr = self.json_array_expr(schema, outer_alias, descriptor, state)?;
                push_annotation(plan, descriptor.alias_or_default(), AnnotationKind::JsonArray, expr);
                Ok(())
            }
            DescriptorKind::Exists { .. } => {
                let expr = self.exists_expr(schema, outer_alias, descriptor, state)?;
                push_annotation(plan, descriptor.alias_or_default(), AnnotationKind::Exists, expr);
                Ok(())
            }
            DescriptorKind::ScalarSubquery { func, distinct } => {
                let expr =
                    self.scalar_expr(schema, outer_alias, descriptor, *func, *distinct, state)?;
                push_annotation(plan, descriptor.alias_or_default(), AnnotationKind::Scalar, expr);
                Ok(())
            }
            DescriptorKind::Aggregate { func, distinct } => self.compile_aggregate(
                schema,
                outer_alias,
                path_prefix,
                descriptor,
                *func,
                *distinct,
                state,
                plan,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_related(
        &self,
        schema: &EntitySchema,
        outer_alias: &str,
        path_prefix: &str,
        descriptor: &FieldDescriptor,
        nested: &[FieldDescriptor],
        state: &mut CompileState,
        plan: &mut QueryPlan,
    ) -> Result<(), CompileError> {
        let rel = self.relation_of(schema, &descriptor.source)?;
        let related = self.entity_schema(&rel.related_entity)?;
        let path = join_path(path_prefix, &descriptor.source);

        if !rel.to_many {
            let alias = path.replace('.', "__");
            if plan.join(&path).is_none() {
                let mut on = self.correlation(outer_alias, rel, &alias);
                // A predicate on a to-one relation narrows the join itself
                if let Some(tree) = &descriptor.predicate {
                    if let Some(root) = tree.root() {
                        if let Some(predicate) =
                            self.compile_node(&related, &alias, tree, root, state)?
                        {
                            on = on.and(predicate);
                        }
                    }
                }
                plan.joins.push(Join {
                    path: path.clone(),
                    alias: alias.clone(),
                    table: related.table.clone(),
                    kind: JoinKind::ToOne,
                    on: Some(on),
                    plan: None,
                    parent_key: None,
                });
            }
            for child in nested {
                self.compile_descriptor(&related, &alias, &path, child, state, plan)?;
            }
            return Ok(());
        }

        // To-many: separate eager-load query keyed by the parent id
        if plan.join(&path).is_some() {
            return Ok(());
        }
        let mut sub = QueryPlan::new(related.entity.clone(), related.table.clone());
        if let Some(tree) = &descriptor.predicate {
            if let Some(root) = tree.root() {
                sub.predicate = self.compile_node(&related, &related.table, tree, root, state)?;
            }
        }
        for child in nested {
            self.compile_descriptor(&related, &related.table, "", child, state, &mut sub)?;
        }
        let parent_key = if rel.is_many_to_many {
            rel.through_self_key.clone().unwrap_or_else(|| rel.foreign_key.clone())
        } else {
            rel.foreign_key.clone()
        };
        plan.joins.push(Join {
            path,
            alias: descriptor.alias_or_default(),
            table: related.table.clone(),
            kind: JoinKind::ToMany,
            on: None,
            plan: Some(Box::new(sub)),
            parent_key: Some(parent_key),
        });
        Ok(())
    }

    fn json_array_expr(
        &self,
        schema: &EntitySchema,
        outer_alias: &str,
        descriptor: &FieldDescriptor,
        state: &mut CompileState,
    ) -> Result<SimpleExpr, CompileError> {
        let DescriptorKind::Json {
            nested,
            fields,
            slice,
            order_by,
        } = &descriptor.kind
        else {
            unreachable!("json_array_expr on non-Json descriptor");
        };
        let rel = self.relation_of(schema, &descriptor.source)?;
        let related = self.entity_schema(&rel.related_entity)?;

        // M2M id-only projection never needs the related table itself
        if let Some(expr) = self.m2m_fast_path(outer_alias, rel, descriptor, fields) {
            return Ok(expr);
        }

        let sub_alias = state.subquery_alias(&related.table);
        let mut inner = SelectStatement::new();
        inner.from_as(
            TableName(related.table.clone()),
            TableName(sub_alias.clone()),
        );
        inner.and_where(self.correlation(outer_alias, rel, &sub_alias));

        if let Some(tree) = &descriptor.predicate {
            if let Some(root) = tree.root() {
                if let Some(predicate) =
                    self.compile_node(&related, &sub_alias, tree, root, state)?
                {
                    inner.and_where(predicate);
                }
            }
        }

        let mut generated: HashMap<String, SimpleExpr> = HashMap::new();
        for child in nested {
            let expr = self.nested_projection_expr(&related, &sub_alias, child, state)?;
            generated.insert(child.alias_or_default(), expr);
        }

        let mut pairs: Vec<SimpleExpr> = Vec::with_capacity(fields.len() * 2);
        for field in fields {
            pairs.push(Expr::val(field.clone()).into());
            pairs.push(match generated.remove(field) {
                Some(expr) => expr,
                None => {
                    if related.field(field).is_none() {
                        return Err(CompileError::UnknownField {
                            entity: related.entity.clone(),
                            field: field.clone(),
                        });
                    }
                    col(&sub_alias, field).into()
                }
            });
        }
        inner.expr_as(
            Func::cust(ColumnName("json_build_object".to_string())).args(pairs),
            ColumnName("j".to_string()),
        );

        for spec in order_by {
            let (column, order) = match spec.strip_prefix('-') {
                Some(column) => (column, Order::Desc),
                None => (spec.as_str(), Order::Asc),
            };
            inner.order_by(
                (
                    TableName(sub_alias.clone()),
                    ColumnName(column.to_string()),
                ),
                order,
            );
        }
        if let Some(range) = slice {
            if range.start > 0 {
                inner.offset(range.start);
            }
            // An inverted range selects nothing rather than panicking
            inner.limit(range.end.saturating_sub(range.start));
        }

        let mut outer = SelectStatement::new();
        outer.from_subquery(inner, TableName("q".to_string()));
        outer.expr(Func::coalesce([
            Func::cust(ColumnName("json_agg".to_string()))
                .arg(col("q", "j"))
                .into(),
            Expr::cust("'[]'::json"),
        ]));
        Ok(SimpleExpr::SubQuery(
            None,
            Box::new(SubQueryStatement::SelectStatement(outer)),
        ))
    }

    /// A `Json` on a pure M2M relation projecting only `id` can read the
    /// through table alone.
    fn m2m_fast_path(
        &self,
        outer_alias: &str,
        rel: &RelationInfo,
        descriptor: &FieldDescriptor,
        fields: &[String],
    ) -> Option<SimpleExpr> {
        let DescriptorKind::Json {
            nested,
            slice,
            order_by,
            ..
        } = &descriptor.kind
        else {
            return None;
        };
        let bare = descriptor.predicate.is_none()
            && nested.is_empty()
            && slice.is_none()
            && order_by.is_empty()
            && fields.iter().all(|f| f == "id");
        if !bare || !rel.is_many_to_many {
            return None;
        }
        let (through, self_key, related_key) = (
            rel.through_table.as_deref()?,
            rel.through_self_key.as_deref()?,
            rel.through_related_key.as_deref()?,
        );

        let mut inner = SelectStatement::new();
        inner.from(TableName(through.to_string()));
        inner.and_where(col(through, self_key).equals((
            TableName(outer_alias.to_string()),
            ColumnName("id".to_string()),
        )));
        inner.expr_as(
            Func::cust(ColumnName("json_build_object".to_string())).args([
                SimpleExpr::from(Expr::val("id")),
                col(through, related_key).into(),
            ]),
            ColumnName("j".to_string()),
        );

        let mut outer = SelectStatement::new();
        outer.from_subquery(inner, TableName("q".to_string()));
        outer.expr(Func::coalesce([
            Func::cust(ColumnName("json_agg".to_string()))
                .arg(col("q", "j"))
                .into(),
            Expr::cust("'[]'::json"),
        ]));
        Some(SimpleExpr::SubQuery(
            None,
            Box::new(SubQueryStatement::SelectStatement(outer)),
        ))
    }

    /// Expression for a nested descriptor inside a JSON projection,
    /// correlated to the projected row.
    fn nested_projection_expr(
        &self,
        schema: &EntitySchema,
        row_alias: &str,
        child: &FieldDescriptor,
        state: &mut CompileState,
    ) -> Result<SimpleExpr, CompileError> {
        match &child.kind {
            DescriptorKind::Json { .. } => self.json_array_expr(schema, row_alias, child, state),
            DescriptorKind::Exists { .. } => self.exists_expr(schema, row_alias, child, state),
            DescriptorKind::ScalarSubquery { func, distinct }
            | DescriptorKind::Aggregate { func, distinct } => {
                self.scalar_expr(schema, row_alias, child, *func, *distinct, state)
            }
            DescriptorKind::Related { .. } => {
                let rel = self.relation_of(schema, &child.source)?;
                if !rel.reverse && !rel.is_many_to_many {
                    // Forward to-one: the foreign key is the related id
                    Ok(col(row_alias, &rel.foreign_key).into())
                } else {
                    let related = self.entity_schema(&rel.related_entity)?;
                    let sub_alias = state.subquery_alias(&related.table);
                    let select =
                        self.correlated_select(row_alias, rel, &related.table, &sub_alias);
                    Ok(Expr::exists(select))
                }
            }
        }
    }

    fn exists_expr(
        &self,
        schema: &EntitySchema,
        outer_alias: &str,
        descriptor: &FieldDescriptor,
        state: &mut CompileState,
    ) -> Result<SimpleExpr, CompileError> {
        let rel = self.relation_of(schema, &descriptor.source)?;
        let related = self.entity_schema(&rel.related_entity)?;
        let sub_alias = state.subquery_alias(&related.table);
        let mut select = self.correlated_select(outer_alias, rel, &related.table, &sub_alias);

        if let Some(tree) = &descriptor.predicate {
            if let Some(root) = tree.root() {
                if let Some(predicate) =
                    self.compile_node(&related, &sub_alias, tree, root, state)?
                {
                    select.and_where(predicate);
                }
            }
        }
        // Multi-hop chains nest further EXISTS inside the same subquery
        for child in descriptor.nested() {
            if matches!(child.kind, DescriptorKind::Exists { .. }) {
                select.and_where(self.exists_expr(&related, &sub_alias, child, state)?);
            }
        }
        Ok(Expr::exists(select))
    }

    fn scalar_expr(
        &self,
        schema: &EntitySchema,
        outer_alias: &str,
        descriptor: &FieldDescriptor,
        func: AggFunc,
        distinct: bool,
        state: &mut CompileState,
    ) -> Result<SimpleExpr, CompileError> {
        let (rel_name, column) = split_agg_source(&descriptor.source);
        let rel = self.relation_of(schema, rel_name)?;
        let related = self.entity_schema(&rel.related_entity)?;
        if related.field(column).is_none() {
            return Err(CompileError::UnknownField {
                entity: related.entity.clone(),
                field: column.to_string(),
            });
        }
        let sub_alias = state.subquery_alias(&related.table);

        let mut select = SelectStatement::new();
        select.from_as(
            TableName(related.table.clone()),
            TableName(sub_alias.clone()),
        );
        select.and_where(self.correlation(outer_alias, rel, &sub_alias));
        if let Some(tree) = &descriptor.predicate {
            if let Some(root) = tree.root() {
                if let Some(predicate) =
                    self.compile_node(&related, &sub_alias, tree, root, state)?
                {
                    select.and_where(predicate);
                }
            }
        }
        select.expr(agg_call(func, distinct, col(&sub_alias, column).into()));
        Ok(SimpleExpr::SubQuery(
            None,
            Box::new(SubQueryStatement::SelectStatement(select)),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_aggregate(
        &self,
        schema: &EntitySchema,
        outer_alias: &str,
        path_prefix: &str,
        descriptor: &FieldDescriptor,
        func: AggFunc,
        distinct: bool,
        state: &mut CompileState,
        plan: &mut QueryPlan,
    ) -> Result<(), CompileError> {
        let (rel_name, column) = split_agg_source(&descriptor.source);
        let rel = self.relation_of(schema, rel_name)?;
        let related = self.entity_schema(&rel.related_entity)?;
        if related.field(column).is_none() {
            return Err(CompileError::UnknownField {
                entity: related.entity.clone(),
                field: column.to_string(),
            });
        }
        let path = join_path(path_prefix, rel_name);

        // Reuse an existing inline traversal of the same relation
        let alias = match plan.joins.iter().find(|j| j.path == path && j.on.is_some()) {
            Some(join) => join.alias.clone(),
            None => {
                let alias = path.replace('.', "__");
                let on = self.correlation(outer_alias, rel, &alias);
                plan.joins.push(Join {
                    path,
                    alias: alias.clone(),
                    table: related.table.clone(),
                    kind: JoinKind::ToMany,
                    on: Some(on),
                    plan: None,
                    parent_key: None,
                });
                alias
            }
        };

        let call = agg_call(func, distinct, col(&alias, column).into());
        let expr = match &descriptor.predicate {
            Some(tree) => match tree.root() {
                Some(root) => match self.compile_node(&related, &alias, tree, root, state)? {
                    Some(predicate) => {
                        Expr::cust_with_exprs("$1 FILTER (WHERE $2)", [call, predicate])
                    }
                    None => call,
                },
                None => call,
            },
            None => call,
        };
        push_annotation(
            plan,
            descriptor.alias_or_default(),
            AnnotationKind::JoinAggregate,
            expr,
        );
        Ok(())
    }

    fn relation_of<'s>(
        &self,
        schema: &'s EntitySchema,
        name: &str,
    ) -> Result<&'s RelationInfo, CompileError> {
        schema
            .relation(name)
            .ok_or_else(|| CompileError::UnknownRelation {
                entity: schema.entity.clone(),
                relation: name.to_string(),
            })
    }
}

fn push_annotation(plan: &mut QueryPlan, alias: String, kind: AnnotationKind, expr: SimpleExpr) {
    if plan.annotation(&alias).is_none() {
        plan.annotations.push(SubqueryAnnotation { alias, kind, expr });
    }
}

fn collect_missing_context(
    forest: &[FieldDescriptor],
    context: &FilterContext,
    missing: &mut Vec<String>,
) {
    for descriptor in forest {
        for key in &descriptor.context_keys {
            if !context.contains_key(key) && !missing.contains(key) {
                missing.push(key.clone());
            }
        }
        collect_missing_context(descriptor.nested(), context, missing);
    }
}

/// `$name` values resolve from the context map; unresolved ones pass
/// through literally.
fn resolve_value(value: &str, context: &FilterContext) -> String {
    if let Some(name) = value.strip_prefix('$') {
        if let Some(found) = context.get(name) {
            return match found {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
        }
    }
    value.to_string()
}

fn split_terms(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|term| !term.is_empty())
}

fn field_contains(alias: &str, field: &FieldInfo, term: &str) -> SimpleExpr {
    let pattern = format!("%{term}%");
    match field.field_type {
        FieldType::Integer => col(alias, &field.name)
            .cast_as(ColumnName("TEXT".to_string()))
            .ilike(pattern),
        _ => col(alias, &field.name).ilike(pattern),
    }
}

fn array_value(element: &FieldType, value: &str) -> Value {
    let parts = value.split(',').map(str::trim);
    match element {
        FieldType::Integer => parts
            .filter_map(|v| v.parse::<i64>().ok())
            .collect::<Vec<_>>()
            .into(),
        _ => parts.map(str::to_string).collect::<Vec<_>>().into(),
    }
}

fn split_agg_source(source: &str) -> (&str, &str) {
    source.split_once("__").unwrap_or((source, "id"))
}

fn agg_call(func: AggFunc, distinct: bool, target: SimpleExpr) -> SimpleExpr {
    if distinct {
        return match func {
            AggFunc::Count => Func::count_distinct(target).into(),
            AggFunc::Sum => Expr::cust_with_exprs("SUM(DISTINCT $1)", [target]),
            AggFunc::Avg => Expr::cust_with_exprs("AVG(DISTINCT $1)", [target]),
            AggFunc::Min => Expr::cust_with_exprs("MIN(DISTINCT $1)", [target]),
            AggFunc::Max => Expr::cust_with_exprs("MAX(DISTINCT $1)", [target]),
        };
    }
    match func {
        AggFunc::Count => Func::count(target),
        AggFunc::Sum => Func::sum(target),
        AggFunc::Avg => Func::avg(target),
        AggFunc::Min => Func::min(target),
        AggFunc::Max => Func::max(target),
    }
    .into()
}
