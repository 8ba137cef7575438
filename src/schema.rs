//! Entity metadata consumed by the compiler.
//!
//! The compiler never owns schema knowledge: it asks a [`SchemaSource`] for
//! an [`EntitySchema`] and reads fields and relations off it. Schemas are
//! built once through [`EntitySchemaBuilder`] and immutable afterwards;
//! [`SchemaCache`] memoizes lookups for the lifetime of the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Storage type of a scalar column, driving lookup dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Short string, matched exactly.
    String,
    /// Free text, matched by substring.
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Array(Box<FieldType>),
}

impl FieldType {
    /// Fields included in whole-entity `$search`. Integers are cast to
    /// text so identifiers can be searched too.
    pub fn is_searchable(&self) -> bool {
        matches!(self, FieldType::String | FieldType::Text | FieldType::Integer)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            FieldType::Integer
                | FieldType::Float
                | FieldType::Date
                | FieldType::DateTime
                | FieldType::String
                | FieldType::Text
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
}

/// One relation edge as reported by the introspector. Read-only for the
/// compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub name: String,
    pub related_entity: String,
    pub to_many: bool,
    /// True when the foreign key lives on the related table (a reverse
    /// edge); the correlation direction flips accordingly.
    pub reverse: bool,
    pub is_many_to_many: bool,
    pub through_table: Option<String>,
    /// Column holding the key: on this table for forward edges, on the
    /// related table for reverse edges, on the through table for M2M.
    pub foreign_key: String,
    pub through_self_key: Option<String>,
    pub through_related_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    pub entity: String,
    pub table: String,
    pub fields: Vec<FieldInfo>,
    pub relations: Vec<RelationInfo>,
}

impl EntitySchema {
    pub fn builder(entity: impl Into<String>, table: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            entity: entity.into(),
            table: table.into(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationInfo> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn searchable_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.field_type.is_searchable())
    }
}

/// Composes an immutable schema record per entity, once at startup.
pub struct EntitySchemaBuilder {
    entity: String,
    table: String,
    fields: Vec<FieldInfo>,
    relations: Vec<RelationInfo>,
}

impl EntitySchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldInfo {
            name: name.into(),
            field_type,
        });
        self
    }

    /// Forward to-one relation; the foreign key defaults to `{name}_id`
    /// on this table.
    pub fn to_one(mut self, name: impl Into<String>, related_entity: impl Into<String>) -> Self {
        let name = name.into();
        let foreign_key = format!("{name}_id");
        self.relations.push(RelationInfo {
            name,
            related_entity: related_entity.into(),
            to_many: false,
            reverse: false,
            is_many_to_many: false,
            through_table: None,
            foreign_key,
            through_self_key: None,
            through_related_key: None,
        });
        self
    }

    /// Reverse to-many relation; `foreign_key` is the column on the
    /// related table pointing back here.
    pub fn to_many(
        mut self,
        name: impl Into<String>,
        related_entity: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relations.push(RelationInfo {
            name: name.into(),
            related_entity: related_entity.into(),
            to_many: true,
            reverse: true,
            is_many_to_many: false,
            through_table: None,
            foreign_key: foreign_key.into(),
            through_self_key: None,
            through_related_key: None,
        });
        self
    }

    pub fn many_to_many(
        mut self,
        name: impl Into<String>,
        related_entity: impl Into<String>,
        through_table: impl Into<String>,
        through_self_key: impl Into<String>,
        through_related_key: impl Into<String>,
    ) -> Self {
        self.relations.push(RelationInfo {
            name: name.into(),
            related_entity: related_entity.into(),
            to_many: true,
            reverse: false,
            is_many_to_many: true,
            through_table: Some(through_table.into()),
            foreign_key: "id".to_string(),
            through_self_key: Some(through_self_key.into()),
            through_related_key: Some(through_related_key.into()),
        });
        self
    }

    pub fn build(self) -> EntitySchema {
        EntitySchema {
            entity: self.entity,
            table: self.table,
            fields: self.fields,
            relations: self.relations,
        }
    }
}

/// Where schemas come from. Implemented by the in-memory registry here
/// and by whatever introspector the embedding application provides.
pub trait SchemaSource: Send + Sync {
    fn load(&self, entity: &str) -> Option<EntitySchema>;
}

/// In-memory schema source, filled by the config loader or by hand in
/// tests.
#[derive(Default)]
pub struct SchemaRegistry {
    entries: HashMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: EntitySchema) {
        self.entries.insert(schema.entity.clone(), schema);
    }
}

impl SchemaSource for SchemaRegistry {
    fn load(&self, entity: &str) -> Option<EntitySchema> {
        self.entries.get(entity).cloned()
    }
}

/// Process-wide memoization of introspector lookups. Entries are
/// populated on first use and never invalidated; concurrent readers see
/// immutable `Arc`ed records.
pub struct SchemaCache {
    source: Box<dyn SchemaSource>,
    entries: RwLock<HashMap<String, Arc<EntitySchema>>>,
}

impl SchemaCache {
    pub fn new(source: Box<dyn SchemaSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, entity: &str) -> Option<Arc<EntitySchema>> {
        if let Some(schema) = self
            .entries
            .read()
            .expect("schema cache lock poisoned")
            .get(entity)
        {
            return Some(Arc::clone(schema));
        }
        let loaded = Arc::new(self.source.load(entity)?);
        let mut entries = self.entries.write().expect("schema cache lock poisoned");
        // A racing writer may have inserted meanwhile; keep the first.
        Some(Arc::clone(
            entries
                .entry(entity.to_string())
                .or_insert_with(|| Arc::clone(&loaded)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer_schema() -> EntitySchema {
        EntitySchema::builder("customers", "customers")
            .field("id", FieldType::Integer)
            .field("name", FieldType::Text)
            .field("active", FieldType::Boolean)
            .to_many("orders", "orders", "customer_id")
            .build()
    }

    #[test]
    fn test_builder_defaults_forward_fk() {
        let schema = EntitySchema::builder("orders", "orders")
            .to_one("customer", "customers")
            .build();
        let rel = schema.relation("customer").unwrap();
        assert_eq!(rel.foreign_key, "customer_id");
        assert!(!rel.to_many);
        assert!(!rel.reverse);
    }

    #[test]
    fn test_searchable_excludes_booleans() {
        let schema = customer_schema();
        let names: Vec<_> = schema.searchable_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["id", "name"]);
    }

    #[test]
    fn test_cache_memoizes_first_load() {
        let mut registry = SchemaRegistry::new();
        registry.register(customer_schema());
        let cache = SchemaCache::new(Box::new(registry));

        let first = cache.get("customers").unwrap();
        let second = cache.get("customers").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.get("missing").is_none());
    }
}
