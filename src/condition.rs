//! Filter条件树
//!
//! 将布尔过滤表达式表示为二叉树：叶子是 `key=value` 条件，内部节点是
//! AND/OR 组合。所有节点都保存在树拥有的 arena（`Vec<Node>`）中，
//! 父子关系用索引表示，避免弱引用。
//!
//! ## 规范化（rebalance）
//!
//! 每次结构变更后，受影响的节点会自底向上重新平衡：
//!
//! 1. 两个子节点都不存在 → 清空 `op`/`negated`/`parent`；
//! 2. 只有一个子节点 → `op` 置空，树退化为该子节点；
//! 3. 两个子节点都存在 → 按结构哈希排序（AND/OR 的交换律因此变成
//!    结构性的：`a&b` 与 `b&a` 哈希相同）；
//! 4. 节点哈希 = `H(hash(left) . op . hash(right) ? negated)`，
//!    自底向上重新计算。
//!
//! 哈希使用 xxh3_64，直接对标签联合的字段取哈希，不经过序列化。

use serde_json::{json, Value as JsonValue};
use xxhash_rust::xxh3::xxh3_64;

/// arena 中节点的索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// 逻辑运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    And,
    Or,
}

impl QueryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryOp::And => "and",
            QueryOp::Or => "or",
        }
    }
}

/// 单个 `field[__lookup]=value` 条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionLeaf {
    pub key: String,
    pub value: String,
    pub negated: bool,
}

impl ConditionLeaf {
    pub fn new(key: impl Into<String>, value: impl Into<String>, negated: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            negated,
        }
    }

    fn structural_hash(&self) -> u64 {
        let repr = format!("{}={}?{}", self.key, self.value, self.negated);
        xxh3_64(repr.as_bytes())
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf(ConditionLeaf),
    Branch {
        left: Option<NodeId>,
        op: Option<QueryOp>,
        right: Option<NodeId>,
        negated: bool,
    },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    hash: u64,
}

/// 遍历视图，编译器通过它递归下降条件树
#[derive(Debug, Clone, Copy)]
pub enum NodeView<'a> {
    Leaf(&'a ConditionLeaf),
    Branch {
        left: Option<NodeId>,
        op: Option<QueryOp>,
        right: Option<NodeId>,
        negated: bool,
    },
}

/// 二叉条件树。构造后不可变，除非通过显式的
/// `add`/`remove`/`replace`，它们都会触发到根的重新平衡。
#[derive(Debug, Clone, Default)]
pub struct ConditionTree {
    // 被 remove 摘除的节点仍留在 arena 中（孤儿），不再从根可达
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl PartialEq for ConditionTree {
    fn eq(&self, other: &Self) -> bool {
        self.root_hash() == other.root_hash()
    }
}

impl Eq for ConditionTree {}

impl ConditionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从过滤表达式字符串构建条件树
    pub fn parse(text: &str) -> Result<Self, crate::parser::ParseError> {
        crate::parser::parse(text)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// 整棵树的结构哈希，空树为 0
    pub fn root_hash(&self) -> u64 {
        self.root.map_or(0, |id| self.nodes[id.0].hash)
    }

    pub fn hash(&self, id: NodeId) -> u64 {
        self.nodes[id.0].hash
    }

    pub fn node(&self, id: NodeId) -> NodeView<'_> {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf(leaf) => NodeView::Leaf(leaf),
            NodeKind::Branch {
                left,
                op,
                right,
                negated,
            } => NodeView::Branch {
                left: *left,
                op: *op,
                right: *right,
                negated: *negated,
            },
        }
    }

    pub fn leaf(&self, id: NodeId) -> Option<&ConditionLeaf> {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf(leaf) => Some(leaf),
            NodeKind::Branch { .. } => None,
        }
    }

    pub(crate) fn set_root(&mut self, id: NodeId) {
        self.nodes[id.0].parent = None;
        self.root = Some(id);
    }

    pub(crate) fn alloc_leaf(&mut self, leaf: ConditionLeaf) -> NodeId {
        let hash = leaf.structural_hash();
        self.nodes.push(Node {
            kind: NodeKind::Leaf(leaf),
            parent: None,
            hash,
        });
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn alloc_branch(
        &mut self,
        left: Option<NodeId>,
        op: Option<QueryOp>,
        right: Option<NodeId>,
        negated: bool,
    ) -> NodeId {
        self.nodes.push(Node {
            kind: NodeKind::Branch {
                left,
                op,
                right,
                negated,
            },
            parent: None,
            hash: 0,
        });
        let id = NodeId(self.nodes.len() - 1);
        self.rebalance(id);
        id
    }

    /// 翻转/设置节点的取反标记并重算哈希
    pub(crate) fn set_negated(&mut self, id: NodeId, value: bool) {
        match &mut self.nodes[id.0].kind {
            NodeKind::Leaf(leaf) => {
                leaf.negated = value;
                self.nodes[id.0].hash = self.leaf_hash(id);
            }
            NodeKind::Branch { negated, .. } => {
                *negated = value;
                self.rebalance(id);
            }
        }
        self.rebalance_upwards(self.nodes[id.0].parent);
    }

    fn leaf_hash(&self, id: NodeId) -> u64 {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf(leaf) => leaf.structural_hash(),
            NodeKind::Branch { .. } => unreachable!("leaf_hash on branch"),
        }
    }

    /// 结构变更后恢复节点的规范形态，见模块文档
    fn rebalance(&mut self, id: NodeId) {
        let NodeKind::Branch {
            left,
            op,
            right,
            negated,
        } = self.nodes[id.0].kind
        else {
            return;
        };

        let (left, op, right, negated) = match (left, right) {
            (None, None) => {
                self.nodes[id.0].parent = None;
                (None, None, None, false)
            }
            (Some(l), None) => (Some(l), None, None, negated),
            (None, Some(r)) => (Some(r), None, None, negated),
            (Some(l), Some(r)) => {
                // 子节点按哈希排序，使 AND/OR 的交换律成为结构性的
                if self.nodes[l.0].hash <= self.nodes[r.0].hash {
                    (Some(l), op, Some(r), negated)
                } else {
                    (Some(r), op, Some(l), negated)
                }
            }
        };

        if let Some(l) = left {
            self.nodes[l.0].parent = Some(id);
        }
        if let Some(r) = right {
            self.nodes[r.0].parent = Some(id);
        }

        let left_hash = left.map_or_else(|| "0".to_string(), |l| format!("{:x}", self.nodes[l.0].hash));
        let right_hash = right.map_or_else(|| "0".to_string(), |r| format!("{:x}", self.nodes[r.0].hash));
        let op_repr = op.map_or("", QueryOp::as_str);
        let hash = if left.is_none() && right.is_none() {
            0
        } else {
            xxh3_64(format!("{left_hash}.{op_repr}.{right_hash}?{negated}").as_bytes())
        };

        self.nodes[id.0] = Node {
            kind: NodeKind::Branch {
                left,
                op,
                right,
                negated,
            },
            parent: self.nodes[id.0].parent,
            hash,
        };
    }

    /// 自底向上重平衡所有祖先
    fn rebalance_upwards(&mut self, from: Option<NodeId>) {
        let mut next = from;
        while let Some(id) = next {
            self.rebalance(id);
            next = self.nodes[id.0].parent;
        }
    }

    /// 把另一棵树的子树复制进本 arena，返回新的根索引
    fn import(&mut self, other: &ConditionTree, id: NodeId) -> NodeId {
        match other.node(id) {
            NodeView::Leaf(leaf) => self.alloc_leaf(leaf.clone()),
            NodeView::Branch {
                left,
                op,
                right,
                negated,
            } => {
                let left = left.map(|l| self.import(other, l));
                let right = right.map(|r| self.import(other, r));
                self.alloc_branch(left, op, right, negated)
            }
        }
    }

    /// 导入整棵树；单孩子的退化分支直接展开为其孩子
    fn import_root(&mut self, other: &ConditionTree) -> Option<NodeId> {
        let root = other.root()?;
        if let NodeView::Branch {
            left: Some(l),
            right: None,
            negated,
            ..
        } = other.node(root)
        {
            let id = self.import(other, l);
            if negated {
                let flipped = !self.negated(id);
                self.set_negated(id, flipped);
            }
            return Some(id);
        }
        Some(self.import(other, root))
    }

    fn negated(&self, id: NodeId) -> bool {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf(leaf) => leaf.negated,
            NodeKind::Branch { negated, .. } => *negated,
        }
    }

    /// 在根上合并另一棵树
    pub fn add(&mut self, other: &ConditionTree, op: QueryOp) {
        let Some(node) = self.import_root(other) else {
            return;
        };
        self.merge_at_root(node, op);
    }

    /// 合并单个条件的便捷入口
    pub fn add_leaf(&mut self, key: &str, value: &str, negated: bool, op: QueryOp) {
        let node = self.alloc_leaf(ConditionLeaf::new(key, value, negated));
        self.merge_at_root(node, op);
    }

    fn merge_at_root(&mut self, node: NodeId, op: QueryOp) {
        match self.root {
            None => {
                self.set_root(node);
            }
            Some(root) => {
                if let NodeKind::Branch {
                    left,
                    right: None,
                    ..
                } = self.nodes[root.0].kind
                {
                    // 退化分支：直接补上右孩子
                    if left.is_some() {
                        if let NodeKind::Branch { right, op: br_op, .. } = &mut self.nodes[root.0].kind {
                            *right = Some(node);
                            *br_op = Some(op);
                        }
                        self.rebalance(root);
                        return;
                    }
                    // 完全为空的分支：收养新节点
                    self.set_root(node);
                    return;
                }
                let union = self.alloc_branch(Some(root), Some(op), Some(node), false);
                self.set_root(union);
            }
        }
    }

    /// 在指定节点处并入一棵子树：新建 union 节点顶替原节点在父节点
    /// 中的位置，并重平衡所有祖先
    pub fn add_at(&mut self, at: NodeId, other: &ConditionTree, op: QueryOp) -> NodeId {
        let Some(node) = self.import_root(other) else {
            return at;
        };
        let parent = self.nodes[at.0].parent;
        let union = self.alloc_branch(Some(at), Some(op), Some(node), false);

        match parent {
            None => self.set_root(union),
            Some(p) => {
                self.replace_child(p, at, union);
                self.rebalance_upwards(Some(p));
            }
        }
        union
    }

    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        if let NodeKind::Branch { left, right, .. } = &mut self.nodes[parent.0].kind {
            if *left == Some(old) {
                *left = Some(new);
            } else if *right == Some(old) {
                *right = Some(new);
            }
        }
        self.rebalance(parent);
    }

    /// 摘除一个节点，其兄弟顶替父节点的位置
    pub fn remove(&mut self, id: NodeId) {
        let Some(parent) = self.nodes[id.0].parent else {
            // 摘除根：树清空
            self.root = None;
            return;
        };

        let sibling = match self.nodes[parent.0].kind {
            NodeKind::Branch { left, right, .. } => {
                if left == Some(id) {
                    right
                } else {
                    left
                }
            }
            NodeKind::Leaf(_) => None,
        };

        match sibling {
            Some(s) => {
                let grand = self.nodes[parent.0].parent;
                match grand {
                    None => self.set_root(s),
                    Some(g) => {
                        self.replace_child(g, parent, s);
                        self.rebalance_upwards(Some(g));
                    }
                }
            }
            // 父节点没有别的孩子：继续向上摘除父节点
            None => self.remove(parent),
        }
    }

    /// 原地替换叶子的内容并从父节点开始重平衡；
    /// 对分支节点调用时返回 false
    pub fn replace(&mut self, id: NodeId, key: &str, value: &str, negated: bool) -> bool {
        match &mut self.nodes[id.0].kind {
            NodeKind::Leaf(leaf) => {
                leaf.key = key.to_string();
                leaf.value = value.to_string();
                leaf.negated = negated;
            }
            NodeKind::Branch { .. } => return false,
        }
        self.nodes[id.0].hash = self.leaf_hash(id);
        self.rebalance_upwards(self.nodes[id.0].parent);
        true
    }

    /// 导出为嵌套 JSON 结构：分支是 `[left, op, right]`，
    /// 叶子是 `{key, value, negated}` 对象
    pub fn dump(&self) -> JsonValue {
        self.root.map_or(JsonValue::Null, |id| self.dump_node(id))
    }

    fn dump_node(&self, id: NodeId) -> JsonValue {
        match self.node(id) {
            NodeView::Leaf(leaf) => json!({
                "key": leaf.key,
                "value": leaf.value,
                "negated": leaf.negated,
            }),
            NodeView::Branch {
                left,
                op,
                right,
                negated,
            } => {
                let triple = json!([
                    left.map_or(JsonValue::Null, |l| self.dump_node(l)),
                    op.map_or(JsonValue::Null, |o| JsonValue::from(o.as_str())),
                    right.map_or(JsonValue::Null, |r| self.dump_node(r)),
                ]);
                if negated {
                    json!({ "negated": true, "expr": triple })
                } else {
                    triple
                }
            }
        }
    }
}
