//! Filter表达式的语法分析器
//!
//! ## 解析流程图
//!
//! ```text
//! parse()
//!   ├─ 预处理
//!   │   ├─ '[' / ']' → '(' / ')'（方括号是圆括号的别名）
//!   │   └─ "|&" / "&|" → "|"（历史兼容行为，见 parse 内注释）
//!   │
//!   ├─ scan() （逐字符扫描，运算符之间没有优先级）
//!   │   ├─ '&' / '|' → 结束当前条件，记录运算符
//!   │   ├─ '~'       → 下一个条件/分组取反
//!   │   ├─ '('       → 压栈，开启嵌套层
//!   │   ├─ ')'       → 出栈，嵌套层折叠进父层
//!   │   ├─ '='       → 首个 '=' 分隔 key 与 value，其后的 '=' 属于 value
//!   │   └─ 其他      → 累积到 key 或 value
//!   │
//!   └─ fold() （把扁平的 条件/运算符 列表折叠成二叉树）
//!        ├─ 左结合：a&b&c → (a&b)&c
//!        └─ 单个条件不包装，直接成为该节点
//! ```
//!
//! ## 支持的语法
//!
//! ```text
//! expr := part (('&'|'|') part)*
//! part := ['~'] (key '=' value | '(' expr ')')
//! ```
//!
//! - key 用 `__` 级联关系并挂接末端 lookup 后缀，如 `author__age__gte`；
//! - value 先做百分号解码，再剥掉首尾成对的引号；
//! - 保留字符 `&|~()[]=` 出现在 value 中时需要百分号转义。
//!
//! 不匹配的括号、空分组、缺少 `=` 的条件都会立即返回
//! [`ParseError`]，错误信息带出出错的位置和片段。

use percent_encoding::percent_decode_str;

use crate::condition::{ConditionLeaf, ConditionTree, NodeId, NodeView, QueryOp};

/// 表达式文本中的一个区间（字节偏移）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

impl ParseError {
    fn new(message: String) -> Self {
        Self {
            message,
            span: None,
        }
    }

    fn at_position(message: String, span: Span) -> Self {
        Self {
            message,
            span: Some(span),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.span {
            Some(span) => write!(f, "{} (位置 {}..{})", self.message, span.start, span.end),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// 扫描产物：条件、运算符或嵌套分组
#[derive(Debug)]
enum Item {
    Leaf(ConditionLeaf),
    Op(QueryOp),
    Group(Expr),
}

#[derive(Debug, Default)]
struct Expr {
    items: Vec<Item>,
    negated: bool,
}

/// 把过滤表达式字符串解析为条件树
pub fn parse(text: &str) -> Result<ConditionTree, ParseError> {
    // 方括号是圆括号的别名。"|&"/"&|" 折叠为 "|" 是沿用已久的
    // 兼容行为：混写的运算符对按 OR 处理，AND 一侧被丢弃
    let text = text
        .replace('[', "(")
        .replace(']', ")")
        .replace("|&", "|")
        .replace("&|", "|");

    let expr = scan(&text)?;
    let mut tree = ConditionTree::new();
    if let Some(root) = fold(&mut tree, &expr)? {
        tree.set_root(root);
    }
    Ok(tree)
}

struct Scanner {
    stack: Vec<Expr>,
    key: String,
    value: Option<String>,
    negated: bool,
    term_start: usize,
}

impl Scanner {
    fn current(&mut self) -> &mut Expr {
        self.stack.last_mut().expect("scanner stack is never empty")
    }

    fn has_pending_term(&self) -> bool {
        !self.key.trim().is_empty() || self.value.is_some()
    }

    /// key/value 齐备时收集一个条件；有 key 没有 '=' 视为错误
    fn flush_term(&mut self, pos: usize) -> Result<(), ParseError> {
        let key = std::mem::take(&mut self.key);
        let key = key.trim();
        match self.value.take() {
            Some(value) => {
                if key.is_empty() {
                    return Err(ParseError::at_position(
                        format!("条件缺少字段名: '={value}'"),
                        Span::new(self.term_start, pos),
                    ));
                }
                let value = percent_decode_str(value.trim()).decode_utf8_lossy();
                let value = strip_outer_quotes(&value);
                let negated = std::mem::take(&mut self.negated);
                self.current()
                    .items
                    .push(Item::Leaf(ConditionLeaf::new(key, value, negated)));
            }
            None => {
                if !key.is_empty() {
                    return Err(ParseError::at_position(
                        format!("条件 '{key}' 缺少 '='"),
                        Span::new(self.term_start, pos),
                    ));
                }
                self.negated = false;
            }
        }
        self.term_start = pos;
        Ok(())
    }

    fn push_op(&mut self, op: QueryOp, pos: usize) -> Result<(), ParseError> {
        match self.current().items.last() {
            None | Some(Item::Op(_)) => Err(ParseError::at_position(
                format!("运算符 '{}' 前缺少条件", op_char(op)),
                Span::new(pos, pos + 1),
            )),
            Some(_) => {
                self.current().items.push(Item::Op(op));
                Ok(())
            }
        }
    }
}

fn op_char(op: QueryOp) -> char {
    match op {
        QueryOp::And => '&',
        QueryOp::Or => '|',
    }
}

fn strip_outer_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn scan(text: &str) -> Result<Expr, ParseError> {
    let mut scanner = Scanner {
        stack: vec![Expr::default()],
        key: String::new(),
        value: None,
        negated: false,
        term_start: 0,
    };

    for (i, ch) in text.char_indices() {
        match ch {
            '&' => {
                scanner.flush_term(i)?;
                scanner.push_op(QueryOp::And, i)?;
            }
            '|' => {
                scanner.flush_term(i)?;
                scanner.push_op(QueryOp::Or, i)?;
            }
            '~' => {
                // 取反只允许出现在条件或分组之前；混进 key/value 的
                // '~' 必须百分号转义
                if scanner.has_pending_term() {
                    return Err(ParseError::at_position(
                        "条件中间的 '~' 需要百分号转义".to_string(),
                        Span::new(i, i + 1),
                    ));
                }
                scanner.negated = true;
            }
            '(' => {
                if scanner.has_pending_term() {
                    return Err(ParseError::at_position(
                        "'(' 前缺少运算符".to_string(),
                        Span::new(i, i + 1),
                    ));
                }
                let negated = std::mem::take(&mut scanner.negated);
                scanner.key.clear();
                scanner.stack.push(Expr {
                    items: Vec::new(),
                    negated,
                });
                scanner.term_start = i + 1;
            }
            ')' => {
                scanner.flush_term(i)?;
                if scanner.stack.len() == 1 {
                    return Err(ParseError::at_position(
                        "多余的 ')'".to_string(),
                        Span::new(i, i + 1),
                    ));
                }
                let group = scanner.stack.pop().expect("stack checked above");
                if group.items.is_empty() {
                    return Err(ParseError::at_position(
                        "空的分组 '()'".to_string(),
                        Span::new(i, i + 1),
                    ));
                }
                if matches!(group.items.last(), Some(Item::Op(_))) {
                    return Err(ParseError::at_position(
                        "')' 前有悬空的运算符".to_string(),
                        Span::new(i, i + 1),
                    ));
                }
                scanner.current().items.push(Item::Group(group));
            }
            '=' => match &mut scanner.value {
                // 只有第一个 '=' 是分隔符
                None => scanner.value = Some(String::new()),
                Some(value) => value.push('='),
            },
            _ => match &mut scanner.value {
                Some(value) => value.push(ch),
                None => scanner.key.push(ch),
            },
        }
    }

    let end = text.len();
    scanner.flush_term(end)?;
    if scanner.stack.len() > 1 {
        return Err(ParseError::new("未闭合的 '('".to_string()));
    }
    let top = scanner.stack.pop().expect("stack holds the top level");
    if matches!(top.items.last(), Some(Item::Op(_))) {
        return Err(ParseError::new("表达式以运算符结尾".to_string()));
    }
    Ok(top)
}

/// 把扁平列表左结合地折叠成二叉树；单个条件直接返回该节点
fn fold(tree: &mut ConditionTree, expr: &Expr) -> Result<Option<NodeId>, ParseError> {
    let mut acc: Option<NodeId> = None;
    let mut pending: Option<QueryOp> = None;

    for item in &expr.items {
        let node = match item {
            Item::Op(op) => {
                pending = Some(*op);
                continue;
            }
            Item::Leaf(leaf) => tree.alloc_leaf(leaf.clone()),
            Item::Group(group) => {
                let Some(node) = fold(tree, group)? else {
                    continue;
                };
                node
            }
        };

        acc = Some(match acc {
            None => node,
            Some(prev) => {
                let op = pending
                    .take()
                    .ok_or_else(|| ParseError::new("相邻条件之间缺少运算符".to_string()))?;
                tree.alloc_branch(Some(prev), Some(op), Some(node), false)
            }
        });
    }

    if let (Some(node), true) = (acc, expr.negated) {
        // 分组前的 '~' 对折叠结果做取反翻转，双重否定相互抵消
        let flipped = match tree.node(node) {
            NodeView::Leaf(leaf) => !leaf.negated,
            NodeView::Branch { negated, .. } => !negated,
        };
        tree.set_negated(node, flipped);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf_of<'a>(tree: &'a ConditionTree, id: NodeId) -> &'a ConditionLeaf {
        tree.leaf(id).expect("expected leaf")
    }

    #[test]
    fn test_single_term_collapses_to_leaf() {
        let tree = parse("status=open").unwrap();
        let leaf = leaf_of(&tree, tree.root().unwrap());
        assert_eq!(leaf.key, "status");
        assert_eq!(leaf.value, "open");
        assert!(!leaf.negated);
    }

    #[test]
    fn test_empty_input_gives_empty_tree() {
        let tree = parse("").unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.root_hash(), 0);
    }

    #[test]
    fn test_negated_term() {
        let tree = parse("~state=one").unwrap();
        assert!(leaf_of(&tree, tree.root().unwrap()).negated);
    }

    #[test]
    fn test_value_is_unescaped_and_unquoted() {
        let tree = parse("name=%22a%26b%22").unwrap();
        assert_eq!(leaf_of(&tree, tree.root().unwrap()).value, "a&b");

        let tree = parse("name='x'").unwrap();
        assert_eq!(leaf_of(&tree, tree.root().unwrap()).value, "x");
    }

    #[test]
    fn test_second_equals_belongs_to_value() {
        let tree = parse("expr=a=b").unwrap();
        let leaf = leaf_of(&tree, tree.root().unwrap());
        assert_eq!(leaf.key, "expr");
        assert_eq!(leaf.value, "a=b");
    }

    #[test]
    fn test_left_associative_chain() {
        // a&b&c → (a&b)&c
        let tree = parse("a=1&b=2&c=3").unwrap();
        let root = tree.root().unwrap();
        let NodeView::Branch { left, right, op, .. } = tree.node(root) else {
            panic!("expected branch");
        };
        assert_eq!(op, Some(QueryOp::And));
        // 规范排序后孩子顺序不定，但恰有一侧是内部节点
        let inner = [left, right]
            .into_iter()
            .flatten()
            .filter(|id| tree.leaf(*id).is_none())
            .count();
        assert_eq!(inner, 1);
    }

    #[test]
    fn test_brackets_are_paren_aliases() {
        let paren = parse("(a=1|b=2)&c=3").unwrap();
        let bracket = parse("[a=1|b=2]&c=3").unwrap();
        assert_eq!(paren.root_hash(), bracket.root_hash());
    }

    #[test]
    fn test_mixed_operator_pair_collapses_to_or() {
        for mixed in ["a=1|&b=2", "a=1&|b=2"] {
            let collapsed = parse(mixed).unwrap();
            let or = parse("a=1|b=2").unwrap();
            assert_eq!(collapsed.root_hash(), or.root_hash());
        }
    }

    #[test]
    fn test_negated_group() {
        let tree = parse("~(state=one|state=two)").unwrap();
        let NodeView::Branch { op, negated, .. } = tree.node(tree.root().unwrap()) else {
            panic!("expected branch");
        };
        assert_eq!(op, Some(QueryOp::Or));
        assert!(negated);
    }

    #[test]
    fn test_double_negation_cancels() {
        let twice = parse("~(~a=1)").unwrap();
        let plain = parse("a=1").unwrap();
        assert_eq!(twice.root_hash(), plain.root_hash());
    }

    #[test]
    fn test_nested_groups() {
        let tree = parse("(price__gte=20&price__lt=50)|(price__gte=500&price__lt=550)").unwrap();
        let NodeView::Branch { left, right, op, .. } = tree.node(tree.root().unwrap()) else {
            panic!("expected branch");
        };
        assert_eq!(op, Some(QueryOp::Or));
        for child in [left.unwrap(), right.unwrap()] {
            let NodeView::Branch { op, .. } = tree.node(child) else {
                panic!("expected AND branch");
            };
            assert_eq!(op, Some(QueryOp::And));
        }
    }

    #[test]
    fn test_single_term_group_unwraps() {
        let grouped = parse("(a=1)").unwrap();
        let plain = parse("a=1").unwrap();
        assert_eq!(grouped.root_hash(), plain.root_hash());
        assert!(grouped.leaf(grouped.root().unwrap()).is_some());
    }

    #[test]
    fn test_unmatched_open_paren_is_rejected() {
        assert!(parse("(a=1&b=2").is_err());
    }

    #[test]
    fn test_unmatched_close_paren_is_rejected() {
        let err = parse("a=1)").unwrap_err();
        assert!(err.span.is_some());
    }

    #[test]
    fn test_empty_group_is_rejected() {
        assert!(parse("a=1&()").is_err());
    }

    #[test]
    fn test_dangling_operator_is_rejected() {
        assert!(parse("a=1&").is_err());
        assert!(parse("&a=1").is_err());
        assert!(parse("(a=1|)").is_err());
    }

    #[test]
    fn test_tilde_inside_term_is_rejected() {
        for input in ["a=b~c", "a~b=1"] {
            let err = parse(input).unwrap_err();
            assert!(err.span.is_some(), "{input} should fail with a position");
        }
        // 转义后的 '~' 是普通的 value 字符
        let tree = parse("a=b%7Ec").unwrap();
        assert_eq!(leaf_of(&tree, tree.root().unwrap()).value, "b~c");
    }

    #[test]
    fn test_term_without_equals_is_rejected() {
        let err = parse("a=1&bogus").unwrap_err();
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn test_group_without_operator_is_rejected() {
        assert!(parse("a=1(b=2)").is_err());
        assert!(parse("(a=1)b=2").is_err());
    }

    #[test]
    fn test_commutativity_example() {
        let ab = parse("a=1&b=2").unwrap();
        let ba = parse("b=2&a=1").unwrap();
        assert_eq!(ab.root_hash(), ba.root_hash());
    }

    #[test]
    fn test_dump_round_trip_shape() {
        let tree = parse("(a=1&~b=2)|c=3").unwrap();
        let dump = tree.dump();
        let arr = dump.as_array().unwrap();
        assert_eq!(arr[1], "or");
        // 一侧是 AND 三元组，另一侧是叶子对象
        let (mut ands, mut leaves) = (0, 0);
        for side in [&arr[0], &arr[2]] {
            match side {
                serde_json::Value::Array(t) => {
                    assert_eq!(t[1], "and");
                    ands += 1;
                }
                serde_json::Value::Object(_) => leaves += 1,
                other => panic!("unexpected dump node: {other}"),
            }
        }
        assert_eq!((ands, leaves), (1, 1));
    }

    fn term_strategy() -> impl Strategy<Value = (String, String)> {
        ("[a-z]{1,8}", "[a-z0-9]{1,8}")
    }

    proptest! {
        // A&B 与 B&A 结构哈希相同，OR 同理
        #[test]
        fn prop_and_or_commutativity(
            (ka, va) in term_strategy(),
            (kb, vb) in term_strategy(),
        ) {
            for op in ['&', '|'] {
                let ab = parse(&format!("{ka}={va}{op}{kb}={vb}")).unwrap();
                let ba = parse(&format!("{kb}={vb}{op}{ka}={va}")).unwrap();
                prop_assert_eq!(ab.root_hash(), ba.root_hash());
            }
        }

        // 同一运算符下，分组位置不影响叶子层面的交换律
        #[test]
        fn prop_three_way_commutativity(
            (ka, va) in term_strategy(),
            (kb, vb) in term_strategy(),
            (kc, vc) in term_strategy(),
        ) {
            let abc = parse(&format!("{ka}={va}&({kb}={vb}&{kc}={vc})")).unwrap();
            let cba = parse(&format!("({kc}={vc}&{kb}={vb})&{ka}={va}")).unwrap();
            prop_assert_eq!(abc.root_hash(), cba.root_hash());
        }

        // 解析后 dump 再对比：负号、引号剥离后的值都保留
        #[test]
        fn prop_leaf_survives_round_trip((k, v) in term_strategy()) {
            let tree = parse(&format!("~{k}='{v}'")).unwrap();
            let dump = tree.dump();
            prop_assert_eq!(dump["key"].as_str(), Some(k.as_str()));
            prop_assert_eq!(dump["value"].as_str(), Some(v.as_str()));
            prop_assert_eq!(dump["negated"].as_bool(), Some(true));
        }
    }
}
