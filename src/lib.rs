//! 声明式查询编译器
//!
//! 把URL风格的过滤表达式（如 `a=1&(b=2|c=3)`）和字段描述符编译为
//! 与存储无关的查询计划，再由 sea-query 渲染成 PostgreSQL 语句。
//!
//! 三个输入，一个输出：
//!
//! - 过滤字符串 → [`condition::ConditionTree`]（见 [`parser`]）
//! - 投影需求 → [`descriptor::FieldDescriptor`] 森林
//! - 调用方上下文 → [`compiler::FilterContext`]
//! - 输出 [`plan::QueryPlan`]

pub mod compiler;
pub mod condition;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod parser;
pub mod plan;
pub mod schema;

pub use compiler::{FilterContext, QueryCompiler};
pub use condition::{ConditionTree, QueryOp};
pub use descriptor::{normalize, reduce, AggFunc, DescriptorKind, DynamicDescriptor, FieldDescriptor};
pub use error::CompileError;
pub use plan::QueryPlan;
pub use schema::{EntitySchema, SchemaCache, SchemaRegistry, SchemaSource};
