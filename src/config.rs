//! 配置模块，负责从JSON文件加载实体的表结构描述
//!
//! 配置文件形如：
//!
//! ```json
//! {
//!   "customers": {
//!     "table": "customers",
//!     "fields": { "id": "integer", "name": "text", "active": "boolean" },
//!     "relations": {
//!       "orders": { "entity": "orders", "kind": "to_many", "foreign_key": "customer_id" },
//!       "tags": { "entity": "tags", "kind": "many_to_many",
//!                 "through": "customer_tags",
//!                 "self_key": "customer_id", "related_key": "tag_id" }
//!     }
//!   }
//! }
//! ```
//!
//! 字段类型写作 `string` / `text` / `integer` / `float` / `boolean` /
//! `date` / `datetime`，后缀 `[]` 表示数组类型。

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::schema::{EntitySchema, FieldType, SchemaRegistry};

/// 表结构配置错误
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "配置错误: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationConfig {
    pub entity: String,
    /// "to_one" / "to_many" / "many_to_many"
    pub kind: String,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub through: Option<String>,
    #[serde(default)]
    pub self_key: Option<String>,
    #[serde(default)]
    pub related_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    pub table: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub relations: HashMap<String, RelationConfig>,
}

/// 全部实体的表结构配置
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    #[serde(flatten)]
    pub entities: HashMap<String, EntityConfig>,
}

impl SchemaConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::new(format!(
                "配置文件不存在: {}",
                path_ref.display()
            )));
        }

        let content = fs::read_to_string(path_ref).map_err(|e| {
            ConfigError::new(format!("无法读取配置文件 {}: {}", path_ref.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            ConfigError::new(format!(
                "无法解析JSON配置文件 {}: {}",
                path_ref.display(),
                e
            ))
        })
    }

    /// 把配置物化为编译器使用的 SchemaRegistry
    pub fn into_registry(self) -> Result<SchemaRegistry, ConfigError> {
        let mut registry = SchemaRegistry::new();
        // HashMap 迭代顺序不定，按名字排序让错误信息可复现
        let mut entities: Vec<_> = self.entities.into_iter().collect();
        entities.sort_by(|a, b| a.0.cmp(&b.0));

        for (entity, config) in entities {
            let mut builder = EntitySchema::builder(&entity, &config.table);

            let mut fields: Vec<_> = config.fields.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, type_str) in fields {
                let field_type = parse_field_type(&type_str).ok_or_else(|| {
                    ConfigError::new(format!(
                        "实体 '{entity}' 的字段 '{name}' 类型无效: '{type_str}'"
                    ))
                })?;
                builder = builder.field(name, field_type);
            }

            let mut relations: Vec<_> = config.relations.into_iter().collect();
            relations.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, rel) in relations {
                builder = match rel.kind.as_str() {
                    "to_one" => builder.to_one(name, rel.entity),
                    "to_many" => {
                        let fk = rel.foreign_key.ok_or_else(|| {
                            ConfigError::new(format!(
                                "实体 '{entity}' 的 to_many 关系 '{name}' 缺少 foreign_key"
                            ))
                        })?;
                        builder.to_many(name, rel.entity, fk)
                    }
                    "many_to_many" => {
                        let (through, self_key, related_key) =
                            match (rel.through, rel.self_key, rel.related_key) {
                                (Some(t), Some(s), Some(r)) => (t, s, r),
                                _ => {
                                    return Err(ConfigError::new(format!(
                                        "实体 '{entity}' 的 many_to_many 关系 '{name}' \
                                         需要 through/self_key/related_key"
                                    )))
                                }
                            };
                        builder.many_to_many(name, rel.entity, through, self_key, related_key)
                    }
                    other => {
                        return Err(ConfigError::new(format!(
                            "实体 '{entity}' 的关系 '{name}' 类型无效: '{other}'"
                        )))
                    }
                };
            }

            registry.register(builder.build());
        }
        Ok(registry)
    }
}

fn parse_field_type(type_str: &str) -> Option<FieldType> {
    if let Some(element) = type_str.strip_suffix("[]") {
        return Some(FieldType::Array(Box::new(parse_field_type(element)?)));
    }
    match type_str {
        "string" => Some(FieldType::String),
        "text" => Some(FieldType::Text),
        "integer" | "int" => Some(FieldType::Integer),
        "float" => Some(FieldType::Float),
        "boolean" | "bool" => Some(FieldType::Boolean),
        "date" => Some(FieldType::Date),
        "datetime" => Some(FieldType::DateTime),
        _ => None,
    }
}

/// 演示用的默认表结构（配置文件缺失时的fallback，也供测试使用）
pub fn demo_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register(
        EntitySchema::builder("customers", "customers")
            .field("id", FieldType::Integer)
            .field("name", FieldType::Text)
            .field("email", FieldType::String)
            .field("active", FieldType::Boolean)
            .field("labels", FieldType::Array(Box::new(FieldType::String)))
            .to_one("company", "companies")
            .to_many("orders", "orders", "customer_id")
            .many_to_many("tags", "tags", "customer_tags", "customer_id", "tag_id")
            .build(),
    );
    registry.register(
        EntitySchema::builder("companies", "companies")
            .field("id", FieldType::Integer)
            .field("name", FieldType::Text)
            .build(),
    );
    registry.register(
        EntitySchema::builder("orders", "orders")
            .field("id", FieldType::Integer)
            .field("state", FieldType::String)
            .field("total", FieldType::Float)
            .field("placed_at", FieldType::DateTime)
            .to_one("customer", "customers")
            .to_many("items", "order_items", "order_id")
            .build(),
    );
    registry.register(
        EntitySchema::builder("order_items", "order_items")
            .field("id", FieldType::Integer)
            .field("qty", FieldType::Integer)
            .field("price", FieldType::Float)
            .to_one("order", "orders")
            .to_one("product", "products")
            .build(),
    );
    registry.register(
        EntitySchema::builder("products", "products")
            .field("id", FieldType::Integer)
            .field("name", FieldType::Text)
            .field("price", FieldType::Float)
            .build(),
    );
    registry.register(
        EntitySchema::builder("tags", "tags")
            .field("id", FieldType::Integer)
            .field("name", FieldType::String)
            .build(),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaSource;
    use std::io::Write;

    #[test]
    fn test_load_valid_json_config() {
        // 创建临时配置文件
        let temp_file = "test_schema_config.json";
        let mut file = fs::File::create(temp_file).unwrap();
        writeln!(
            file,
            r#"{{
            "customers": {{
                "table": "customers",
                "fields": {{ "id": "integer", "name": "text", "labels": "string[]" }},
                "relations": {{
                    "orders": {{ "entity": "orders", "kind": "to_many", "foreign_key": "customer_id" }}
                }}
            }},
            "orders": {{
                "table": "orders",
                "fields": {{ "id": "integer", "total": "float" }},
                "relations": {{
                    "customer": {{ "entity": "customers", "kind": "to_one" }}
                }}
            }}
        }}"#
        )
        .unwrap();

        let config = SchemaConfig::from_json_file(temp_file).unwrap();
        let registry = config.into_registry().unwrap();

        let customers = registry.load("customers").unwrap();
        assert_eq!(
            customers.field("labels").unwrap().field_type,
            FieldType::Array(Box::new(FieldType::String))
        );
        assert!(customers.relation("orders").unwrap().to_many);

        let orders = registry.load("orders").unwrap();
        assert_eq!(orders.relation("customer").unwrap().foreign_key, "customer_id");

        // 清理
        fs::remove_file(temp_file).ok();
    }

    #[test]
    fn test_invalid_field_type_is_rejected() {
        let temp_file = "test_bad_type.json";
        let mut file = fs::File::create(temp_file).unwrap();
        writeln!(
            file,
            r#"{{ "x": {{ "table": "x", "fields": {{ "a": "uuid" }} }} }}"#
        )
        .unwrap();

        let config = SchemaConfig::from_json_file(temp_file).unwrap();
        assert!(config.into_registry().is_err());

        fs::remove_file(temp_file).ok();
    }

    #[test]
    fn test_missing_file() {
        assert!(SchemaConfig::from_json_file("non_existent_file.json").is_err());
    }

    #[test]
    fn test_demo_registry_is_consistent() {
        let registry = demo_registry();
        let customers = registry.load("customers").unwrap();
        for relation in &customers.relations {
            assert!(
                registry.load(&relation.related_entity).is_some(),
                "关系 {} 指向未注册的实体",
                relation.name
            );
        }
    }
}
