//! Computed-field descriptors and the normalize/reduce passes.
//!
//! A descriptor asks the compiler to materialize something next to the base
//! rows: a joined relation, a JSON array projection, an aggregate, or an
//! existence flag. Descriptors nest, and their `source` may be a dotted
//! relation path; [`normalize`] expands dotted paths into single-hop chains
//! and [`reduce`] merges overlapping requests so each relation is traversed
//! once.

use std::ops::Range;

use crate::condition::ConditionTree;
use crate::error::CompileError;

/// Aggregate functions recognized on `Aggregate`/`ScalarSubquery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn as_str(self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorKind {
    /// Follow a relation, optionally carrying a sub-forest.
    Related { nested: Vec<FieldDescriptor> },
    /// Materialize a to-many relation as a JSON array of objects.
    Json {
        nested: Vec<FieldDescriptor>,
        fields: Vec<String>,
        slice: Option<Range<u64>>,
        order_by: Vec<String>,
    },
    /// Aggregate over a joined relation column (`rel__col` source),
    /// emitted as join + group-by.
    Aggregate { func: AggFunc, distinct: bool },
    /// Same, but as a correlated scalar subquery.
    ScalarSubquery { func: AggFunc, distinct: bool },
    /// Boolean existence of related rows; nests for multi-hop chains.
    Exists { nested: Vec<FieldDescriptor> },
}

impl DescriptorKind {
    fn variant_name(&self) -> &'static str {
        match self {
            DescriptorKind::Related { .. } => "Related",
            DescriptorKind::Json { .. } => "Json",
            DescriptorKind::Aggregate { .. } => "Aggregate",
            DescriptorKind::ScalarSubquery { .. } => "ScalarSubquery",
            DescriptorKind::Exists { .. } => "Exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Relation path (`a.b.c`) for traversing kinds, `rel__col` for
    /// aggregating kinds.
    pub source: String,
    pub alias: Option<String>,
    pub predicate: Option<ConditionTree>,
    /// Names the predicate substitutes from the caller's context map.
    pub context_keys: Vec<String>,
    pub kind: DescriptorKind,
}

impl FieldDescriptor {
    pub fn related(source: impl Into<String>) -> Self {
        Self::bare(source, DescriptorKind::Related { nested: Vec::new() })
    }

    pub fn json(source: impl Into<String>, fields: Vec<String>) -> Self {
        Self::bare(
            source,
            DescriptorKind::Json {
                nested: Vec::new(),
                fields,
                slice: None,
                order_by: Vec::new(),
            },
        )
    }

    pub fn aggregate(source: impl Into<String>, func: AggFunc) -> Self {
        Self::bare(
            source,
            DescriptorKind::Aggregate {
                func,
                distinct: false,
            },
        )
    }

    pub fn scalar(source: impl Into<String>, func: AggFunc) -> Self {
        Self::bare(
            source,
            DescriptorKind::ScalarSubquery {
                func,
                distinct: false,
            },
        )
    }

    pub fn exists(source: impl Into<String>) -> Self {
        Self::bare(source, DescriptorKind::Exists { nested: Vec::new() })
    }

    fn bare(source: impl Into<String>, kind: DescriptorKind) -> Self {
        Self {
            source: source.into(),
            alias: None,
            predicate: None,
            context_keys: Vec::new(),
            kind,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_predicate(mut self, predicate: ConditionTree) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_context_keys(mut self, keys: Vec<String>) -> Self {
        self.context_keys = keys;
        self
    }

    pub fn with_nested(mut self, children: Vec<FieldDescriptor>) -> Self {
        match &mut self.kind {
            DescriptorKind::Related { nested }
            | DescriptorKind::Json { nested, .. }
            | DescriptorKind::Exists { nested } => *nested = children,
            DescriptorKind::Aggregate { .. } | DescriptorKind::ScalarSubquery { .. } => {}
        }
        self
    }

    pub fn with_slice(mut self, range: Range<u64>) -> Self {
        if let DescriptorKind::Json { slice, .. } = &mut self.kind {
            *slice = Some(range);
        }
        self
    }

    pub fn with_order_by(mut self, ordering: Vec<String>) -> Self {
        if let DescriptorKind::Json { order_by, .. } = &mut self.kind {
            *order_by = ordering;
        }
        self
    }

    pub fn with_distinct(mut self) -> Self {
        if let DescriptorKind::Aggregate { distinct, .. }
        | DescriptorKind::ScalarSubquery { distinct, .. } = &mut self.kind
        {
            *distinct = true;
        }
        self
    }

    /// Output name of this descriptor. `Json` defaults to `_{source}` so
    /// generated columns don't shadow real ones.
    pub fn alias_or_default(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.kind {
            DescriptorKind::Json { .. } => format!("_{}", self.source),
            _ => self.source.clone(),
        }
    }

    pub fn nested(&self) -> &[FieldDescriptor] {
        match &self.kind {
            DescriptorKind::Related { nested }
            | DescriptorKind::Json { nested, .. }
            | DescriptorKind::Exists { nested } => nested,
            DescriptorKind::Aggregate { .. } | DescriptorKind::ScalarSubquery { .. } => &[],
        }
    }

    fn describe(&self) -> String {
        format!("{}({})", self.kind.variant_name(), self.source)
    }
}

/// Declarative descriptor whose variant is inferred from which knobs were
/// set, for configuration surfaces that can't name a variant up front.
#[derive(Debug, Clone, Default)]
pub struct DynamicDescriptor {
    pub source: String,
    pub alias: Option<String>,
    pub predicate: Option<ConditionTree>,
    pub context_keys: Vec<String>,
    pub func: Option<AggFunc>,
    pub distinct: bool,
    pub fields: Option<Vec<String>>,
    pub slice: Option<Range<u64>>,
    pub order_by: Vec<String>,
    pub nested: Vec<FieldDescriptor>,
}

impl DynamicDescriptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Detection order: a `has_` alias wins over everything, then an
    /// aggregate function, then projected fields; the fallback is a
    /// plain relation.
    pub fn build(self) -> FieldDescriptor {
        let is_exists = self
            .alias
            .as_deref()
            .is_some_and(|alias| alias.starts_with("has_"));

        let kind = if is_exists {
            DescriptorKind::Exists {
                nested: self.nested,
            }
        } else if let Some(func) = self.func {
            DescriptorKind::ScalarSubquery {
                func,
                distinct: self.distinct,
            }
        } else if let Some(fields) = self.fields {
            DescriptorKind::Json {
                nested: self.nested,
                fields,
                slice: self.slice,
                order_by: self.order_by,
            }
        } else {
            DescriptorKind::Related {
                nested: self.nested,
            }
        };

        FieldDescriptor {
            source: self.source,
            alias: self.alias,
            predicate: self.predicate,
            context_keys: self.context_keys,
            kind,
        }
    }
}

/// Expands dotted sources into single-hop chains of the same variant.
///
/// Only the final link keeps the alias, predicate, context keys and the
/// type-specific knobs; intermediates exist purely to route the traversal.
/// Intermediate `Json` links project exactly their child's alias. The pass
/// is idempotent.
pub fn normalize(descriptors: Vec<FieldDescriptor>) -> Vec<FieldDescriptor> {
    descriptors.into_iter().map(normalize_one).collect()
}

fn normalize_one(mut descriptor: FieldDescriptor) -> FieldDescriptor {
    match &mut descriptor.kind {
        // Aggregating kinds keep their `rel__col` source untouched
        DescriptorKind::Aggregate { .. } | DescriptorKind::ScalarSubquery { .. } => {
            return descriptor;
        }
        DescriptorKind::Related { nested }
        | DescriptorKind::Json { nested, .. }
        | DescriptorKind::Exists { nested } => {
            let children = std::mem::take(nested);
            *nested = normalize(children);
        }
    }
    sync_json_fields(&mut descriptor);

    if !descriptor.source.contains('.') {
        return descriptor;
    }

    let segments: Vec<String> = descriptor.source.split('.').map(str::to_string).collect();
    let mut current = descriptor;
    current.source = segments.last().cloned().unwrap_or_default();

    for segment in segments[..segments.len() - 1].iter().rev() {
        let child_alias = current.alias_or_default();
        let kind = match &current.kind {
            DescriptorKind::Json { .. } => DescriptorKind::Json {
                nested: vec![current],
                fields: vec![child_alias],
                slice: None,
                order_by: Vec::new(),
            },
            DescriptorKind::Exists { .. } => DescriptorKind::Exists {
                nested: vec![current],
            },
            _ => DescriptorKind::Related {
                nested: vec![current],
            },
        };
        current = FieldDescriptor {
            source: segment.clone(),
            alias: None,
            predicate: None,
            context_keys: Vec::new(),
            kind,
        };
    }
    current
}

/// A `Json` descriptor must project the aliases of its nested children so
/// the generated objects carry them; appending is deduplicated to keep
/// normalization idempotent.
fn sync_json_fields(descriptor: &mut FieldDescriptor) {
    let DescriptorKind::Json { nested, fields, .. } = &mut descriptor.kind else {
        return;
    };
    for child in nested.iter() {
        let alias = child.alias_or_default();
        if !fields.contains(&alias) {
            fields.push(alias);
        }
    }
}

/// Merges descriptors that share `(variant, alias-or-source)`.
///
/// Similar descriptors (same source, predicate, and type-specific knobs)
/// union their nested forests; dissimilar ones sharing a key are a
/// configuration error. Runs on normalized input and recurses into nested
/// forests after the top-level merge.
pub fn reduce(descriptors: Vec<FieldDescriptor>) -> Result<Vec<FieldDescriptor>, CompileError> {
    let mut merged: Vec<FieldDescriptor> = Vec::new();

    'next: for descriptor in descriptors {
        let key = (
            descriptor.kind.variant_name(),
            descriptor.alias_or_default(),
        );
        for existing in &mut merged {
            if (existing.kind.variant_name(), existing.alias_or_default()) != key {
                continue;
            }
            if !is_similar(existing, &descriptor) {
                return Err(CompileError::DescriptorConflict {
                    alias: key.1,
                    first: existing.describe(),
                    second: descriptor.describe(),
                });
            }
            merge_into(existing, descriptor);
            continue 'next;
        }
        merged.push(descriptor);
    }

    for descriptor in &mut merged {
        reduce_nested(descriptor)?;
    }
    Ok(merged)
}

fn reduce_nested(descriptor: &mut FieldDescriptor) -> Result<(), CompileError> {
    match &mut descriptor.kind {
        DescriptorKind::Related { nested }
        | DescriptorKind::Json { nested, .. }
        | DescriptorKind::Exists { nested } => {
            let children = std::mem::take(nested);
            *nested = reduce(children)?;
        }
        DescriptorKind::Aggregate { .. } | DescriptorKind::ScalarSubquery { .. } => {}
    }
    Ok(())
}

fn is_similar(a: &FieldDescriptor, b: &FieldDescriptor) -> bool {
    if a.source != b.source || a.predicate != b.predicate {
        return false;
    }
    match (&a.kind, &b.kind) {
        (
            DescriptorKind::Json {
                slice: sa,
                order_by: oa,
                ..
            },
            DescriptorKind::Json {
                slice: sb,
                order_by: ob,
                ..
            },
        ) => sa == sb && oa == ob,
        (
            DescriptorKind::Aggregate {
                func: fa,
                distinct: da,
            },
            DescriptorKind::Aggregate {
                func: fb,
                distinct: db,
            },
        )
        | (
            DescriptorKind::ScalarSubquery {
                func: fa,
                distinct: da,
            },
            DescriptorKind::ScalarSubquery {
                func: fb,
                distinct: db,
            },
        ) => fa == fb && da == db,
        _ => true,
    }
}

fn merge_into(target: &mut FieldDescriptor, other: FieldDescriptor) {
    for key in other.context_keys {
        if !target.context_keys.contains(&key) {
            target.context_keys.push(key);
        }
    }
    match (&mut target.kind, other.kind) {
        (
            DescriptorKind::Json {
                nested, fields, ..
            },
            DescriptorKind::Json {
                nested: other_nested,
                fields: other_fields,
                ..
            },
        ) => {
            nested.extend(other_nested);
            for field in other_fields {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
        }
        (
            DescriptorKind::Related { nested } | DescriptorKind::Exists { nested },
            DescriptorKind::Related {
                nested: other_nested,
            }
            | DescriptorKind::Exists {
                nested: other_nested,
            },
        ) => nested.extend(other_nested),
        _ => {}
    }
    sync_json_fields(target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_dotted_related_expands_to_chain() {
        let forest = normalize(vec![
            FieldDescriptor::related("customer.company").with_alias("company")
        ]);
        assert_eq!(forest.len(), 1);
        let head = &forest[0];
        assert_eq!(head.source, "customer");
        assert!(head.alias.is_none());
        let tail = &head.nested()[0];
        assert_eq!(tail.source, "company");
        assert_eq!(tail.alias.as_deref(), Some("company"));
    }

    #[test]
    fn test_intermediate_json_projects_child_alias() {
        let forest = normalize(vec![FieldDescriptor::json(
            "orders.items",
            vec!["id".to_string(), "qty".to_string()],
        )]);
        let head = &forest[0];
        let DescriptorKind::Json { fields, nested, .. } = &head.kind else {
            panic!("expected Json head");
        };
        assert_eq!(fields, &vec!["_items".to_string()]);
        assert_eq!(nested[0].source, "items");
    }

    #[test]
    fn test_aggregate_source_passes_through() {
        let forest = normalize(vec![FieldDescriptor::aggregate(
            "orders__total",
            AggFunc::Sum,
        )]);
        assert_eq!(forest[0].source, "orders__total");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let forest = vec![
            FieldDescriptor::json("orders.items", vec!["id".to_string()])
                .with_order_by(vec!["-qty".to_string()]),
            FieldDescriptor::related("customer.company"),
            FieldDescriptor::exists("orders.payments").with_alias("has_payments"),
        ];
        let once = normalize(forest);
        let twice = normalize(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_json_default_alias_is_prefixed() {
        let d = FieldDescriptor::json("orders", vec!["id".to_string()]);
        assert_eq!(d.alias_or_default(), "_orders");
        assert_eq!(FieldDescriptor::related("orders").alias_or_default(), "orders");
    }

    #[test]
    fn test_dynamic_detects_variant_from_knobs() {
        let exists = DynamicDescriptor {
            alias: Some("has_orders".to_string()),
            ..DynamicDescriptor::new("orders")
        }
        .build();
        assert!(matches!(exists.kind, DescriptorKind::Exists { .. }));

        let scalar = DynamicDescriptor {
            func: Some(AggFunc::Max),
            ..DynamicDescriptor::new("orders__total")
        }
        .build();
        assert!(matches!(scalar.kind, DescriptorKind::ScalarSubquery { .. }));

        let json = DynamicDescriptor {
            fields: Some(vec!["id".to_string()]),
            ..DynamicDescriptor::new("orders")
        }
        .build();
        assert!(matches!(json.kind, DescriptorKind::Json { .. }));

        let related = DynamicDescriptor::new("customer").build();
        assert!(matches!(related.kind, DescriptorKind::Related { .. }));
    }

    #[test]
    fn test_similar_descriptors_union_nested() {
        let a = FieldDescriptor::related("orders")
            .with_nested(vec![FieldDescriptor::json("items", vec!["id".to_string()])]);
        let b = FieldDescriptor::related("orders")
            .with_nested(vec![FieldDescriptor::related("customer")]);
        let reduced = reduce(vec![a, b]).unwrap();
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].nested().len(), 2);
    }

    #[test]
    fn test_duplicate_nested_descriptors_merge_once() {
        let child = || FieldDescriptor::json("items", vec!["id".to_string()]);
        let a = FieldDescriptor::related("orders").with_nested(vec![child()]);
        let b = FieldDescriptor::related("orders").with_nested(vec![child()]);
        let reduced = reduce(vec![a, b]).unwrap();
        assert_eq!(reduced[0].nested().len(), 1);
    }

    #[test]
    fn test_dissimilar_descriptors_conflict() {
        let a = FieldDescriptor::json("orders", vec!["id".to_string()])
            .with_order_by(vec!["-total".to_string()]);
        let b = FieldDescriptor::json("orders", vec!["id".to_string()]);
        let err = reduce(vec![a, b]).unwrap_err();
        assert!(matches!(err, CompileError::DescriptorConflict { .. }));
    }

    #[test]
    fn test_different_predicates_conflict() {
        let active = ConditionTree::parse("state=active").unwrap();
        let a = FieldDescriptor::related("orders").with_predicate(active);
        let b = FieldDescriptor::related("orders");
        assert!(reduce(vec![a, b]).is_err());
    }

    #[test]
    fn test_exists_and_related_do_not_collide() {
        // Different variants may share a source; the compiler reuses the
        // traversal, reduction keeps both requests
        let a = FieldDescriptor::exists("orders").with_alias("has_orders");
        let b = FieldDescriptor::related("orders");
        let reduced = reduce(vec![a, b]).unwrap();
        assert_eq!(reduced.len(), 2);
    }

    fn canonical(mut forest: Vec<FieldDescriptor>) -> Vec<FieldDescriptor> {
        for descriptor in &mut forest {
            if let DescriptorKind::Related { nested }
            | DescriptorKind::Json { nested, .. }
            | DescriptorKind::Exists { nested } = &mut descriptor.kind
            {
                let children = std::mem::take(nested);
                *nested = canonical(children);
            }
        }
        forest.sort_by_key(|d| (d.kind.variant_name(), d.alias_or_default()));
        forest
    }

    fn sample_forest() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::related("orders")
                .with_nested(vec![FieldDescriptor::json("items", vec!["id".to_string()])]),
            FieldDescriptor::related("orders")
                .with_nested(vec![FieldDescriptor::related("customer")]),
            FieldDescriptor::exists("orders").with_alias("has_orders"),
            FieldDescriptor::json("tags", vec!["id".to_string(), "name".to_string()]),
            FieldDescriptor::scalar("orders__total", AggFunc::Sum),
        ]
    }

    proptest! {
        // reduce(P(F)) == reduce(F) as a set, for any permutation P
        #[test]
        fn prop_reduction_is_order_independent(
            permuted in Just(sample_forest()).prop_shuffle()
        ) {
            let baseline = canonical(reduce(sample_forest()).unwrap());
            let shuffled = canonical(reduce(permuted).unwrap());
            prop_assert_eq!(baseline, shuffled);
        }

        // normalize(normalize(F)) == normalize(F)
        #[test]
        fn prop_normalization_is_idempotent(
            forest in Just(sample_forest()).prop_shuffle()
        ) {
            let once = normalize(forest);
            let twice = normalize(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
