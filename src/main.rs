use std::collections::HashMap;

use query_dispatcher::{
    AggFunc, ConditionTree, FieldDescriptor, FilterContext, QueryCompiler, SchemaCache,
};
use query_dispatcher::config::{demo_registry, SchemaConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// 创建SchemaCache，优先使用JSON配置，失败时使用内置演示表结构
fn create_schema_cache() -> SchemaCache {
    match SchemaConfig::from_json_file("schema_config.json") {
        Ok(config) => match config.into_registry() {
            Ok(registry) => {
                println!("✅ 成功从JSON配置文件加载表结构");
                SchemaCache::new(Box::new(registry))
            }
            Err(e) => {
                println!("⚠️ 配置文件无效 ({}), 使用演示表结构", e);
                SchemaCache::new(Box::new(demo_registry()))
            }
        },
        Err(e) => {
            println!("⚠️ 无法加载JSON配置文件 ({}), 使用演示表结构", e);
            SchemaCache::new(Box::new(demo_registry()))
        }
    }
}

fn main() -> anyhow::Result<()> {
    println!("--- Query Dispatcher: Filter 到查询计划编译器 ---");

    let cache = create_schema_cache();
    let compiler = QueryCompiler::new(&cache);

    // 1. 示例Filter
    let filter_string = "(price__gte=20&price__lt=50)|(price__gte=500&price__lt=550)";
    println!("\n[输入 Filter]:\n{}\n", filter_string);

    // 2. 解析为条件树
    println!("[步骤 1]: 解析 Filter 字符串...");
    let tree = match ConditionTree::parse(filter_string) {
        Ok(tree) => {
            println!("✓ 成功解析，结构哈希 {:016x}", tree.root_hash());
            println!("规范形式: {}", tree.dump());
            tree
        }
        Err(e) => {
            println!("✗ 解析失败: {}", e);
            return Ok(());
        }
    };

    // 3. 编译为查询计划
    println!("\n[步骤 2]: 编译为查询计划...");
    match compiler.compile("products", &tree, &[], &FilterContext::new()) {
        Ok(plan) => {
            println!("✅ 成功编译");
            println!("\n[生成的 SQL]:");
            println!("{}", plan.to_sql());
        }
        Err(e) => println!("✗ 编译失败: {}", e),
    }

    // 4. 演示字段描述符：JSON投影 + 聚合 + 存在性标注
    println!("\n[步骤 3]: 演示字段描述符...");
    let descriptors = vec![
        FieldDescriptor::json("orders", vec!["id".to_string(), "total".to_string()])
            .with_order_by(vec!["-total".to_string()])
            .with_slice(0..3),
        FieldDescriptor::aggregate("orders__total", AggFunc::Sum).with_alias("orders_total"),
        FieldDescriptor::exists("orders").with_alias("has_orders"),
    ];
    match compiler.compile(
        "customers",
        &ConditionTree::new(),
        &descriptors,
        &FilterContext::new(),
    ) {
        Ok(plan) => {
            println!("✅ 成功编译，{} 个连接，{} 个标注", plan.joins.len(), plan.annotations.len());
            println!("\n[生成的 SQL]:");
            println!("{}", plan.to_sql());
        }
        Err(e) => println!("✗ 编译失败: {}", e),
    }

    // 5. 交互式REPL：输入 "实体 filter串" 查看SQL
    println!("\n--- 交互模式 ---");
    println!("输入格式: <实体> <filter串>，例如: customers name=ann&active=true");
    println!("Ctrl-D 退出");

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline(">> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                editor.add_history_entry(line)?;
                let (entity, filter) = match line.split_once(char::is_whitespace) {
                    Some((entity, filter)) => (entity, filter.trim()),
                    None => (line, ""),
                };
                compile_line(&compiler, entity, filter);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                println!("✗ 读取输入失败: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn compile_line(compiler: &QueryCompiler, entity: &str, filter: &str) {
    let tree = match ConditionTree::parse(filter) {
        Ok(tree) => tree,
        Err(e) => {
            println!("✗ 解析失败: {}", e);
            return;
        }
    };
    match compiler.compile(entity, &tree, &[], &HashMap::new()) {
        Ok(plan) => println!("{}", plan.to_sql()),
        Err(e) => println!("✗ 编译失败: {}", e),
    }
}
