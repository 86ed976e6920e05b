//! 规则引擎领域模型
//!
//! 决策表、条件树、逻辑流步骤以及执行日志的 JSON 契约都在这里定义。
//! 所有带标签的枚举在反序列化时对未知标签直接报错，不做静默忽略。

use crate::error::{Result, RuleError};
use crate::operators::{ArrayOpKind, ConditionOperator, HitPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ==================== 执行日志 ====================

/// 日志条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogKind {
    Info,
    Error,
    Result,
}

/// 单条执行日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
}

/// 执行日志栈 - 每次调用独享，只追加不修改
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: LogKind, message: impl Into<String>) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogKind::Info, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogKind::Error, message);
    }

    pub fn result(&mut self, message: impl Into<String>) {
        self.push(LogKind::Result, message);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }

    /// 是否存在包含指定文本的条目（测试断言用）
    pub fn contains_message(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }
}

// ==================== 审计信息 ====================

/// 定义的审计与版本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_actor")]
    pub created_by: String,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
    #[serde(default = "default_actor")]
    pub modified_by: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_version")]
    pub minor_version: u32,
}

fn default_actor() -> String {
    "SYSTEM".to_string()
}

fn default_version() -> u32 {
    1
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            created_by: default_actor(),
            modified_at: Utc::now(),
            modified_by: default_actor(),
            version: 1,
            minor_version: 1,
        }
    }
}

// ==================== 决策表 ====================

/// 决策表列定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub var_key: String,
    /// PRIORITY / OUTPUT_ORDER 策略依据此列的数值排序
    #[serde(default)]
    pub is_priority: bool,
}

impl ColumnDef {
    pub fn new(var_key: impl Into<String>) -> Self {
        Self {
            var_key: var_key.into(),
            is_priority: false,
        }
    }

    pub fn priority(var_key: impl Into<String>) -> Self {
        Self {
            var_key: var_key.into(),
            is_priority: true,
        }
    }
}

/// 决策表定义
///
/// 规则行按输入列在前、输出列在后的顺序排列，行顺序即顺序敏感策略的
/// 决胜依据。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTable {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub hit_policy: HitPolicy,
    pub input_columns: Vec<ColumnDef>,
    pub output_columns: Vec<ColumnDef>,
    pub rules: Vec<Vec<String>>,
    #[serde(default)]
    pub audit: Audit,
}

impl DecisionTable {
    pub fn new(name: impl Into<String>, hit_policy: HitPolicy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            hit_policy,
            input_columns: Vec::new(),
            output_columns: Vec::new(),
            rules: Vec::new(),
            audit: Audit::default(),
        }
    }

    /// 验证表结构：每行宽度必须等于输入列数 + 输出列数
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RuleError::InvalidAction("决策表名称不能为空".to_string()));
        }
        let width = self.input_columns.len() + self.output_columns.len();
        for (i, row) in self.rules.iter().enumerate() {
            if row.len() != width {
                return Err(RuleError::InvalidAction(format!(
                    "决策表 '{}' 第 {} 行宽度为 {}, 期望 {}",
                    self.name,
                    i + 1,
                    row.len(),
                    width
                )));
            }
        }
        Ok(())
    }
}

// ==================== 条件树 ====================

/// 条件节点（逻辑组或叶子比较）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionNode {
    And { children: Vec<ConditionNode> },
    Or { children: Vec<ConditionNode> },
    Not { children: Vec<ConditionNode> },
    Leaf(LeafCondition),
}

/// 叶子条件：路径 + 操作符 + 期望值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafCondition {
    pub var_key: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl ConditionNode {
    pub fn leaf(
        var_key: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<Value>,
    ) -> Self {
        Self::Leaf(LeafCondition {
            var_key: var_key.into(),
            operator,
            value: value.into(),
        })
    }

    pub fn and(children: Vec<ConditionNode>) -> Self {
        Self::And { children }
    }

    pub fn or(children: Vec<ConditionNode>) -> Self {
        Self::Or { children }
    }

    pub fn not(child: ConditionNode) -> Self {
        Self::Not {
            children: vec![child],
        }
    }
}

// ==================== 逻辑流 ====================

/// 赋值目标的声明类型，写入前做显式转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Float,
    Boolean,
}

/// 变量引用：路径 + 可选声明类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarRef {
    pub var_key: String,
    #[serde(default)]
    pub var_type: Option<ValueType>,
}

impl VarRef {
    pub fn new(var_key: impl Into<String>) -> Self {
        Self {
            var_key: var_key.into(),
            var_type: None,
        }
    }

    pub fn typed(var_key: impl Into<String>, var_type: ValueType) -> Self {
        Self {
            var_key: var_key.into(),
            var_type: Some(var_type),
        }
    }
}

/// 条件步骤的判断语句：条件树，或被真值化的路径
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionStatement {
    Path(String),
    Tree(ConditionNode),
}

/// 数组元素过滤器：属性 + 操作符 + 字面量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayFilter {
    /// 过滤器作用的数组名（为空时作用于所有层级）
    #[serde(default)]
    pub array_name: String,
    pub property: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// 赋值步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignStep {
    pub target: VarRef,
    #[serde(default)]
    pub value: Value,
    /// 为 true 时 value 是一条路径，写入前先解析
    #[serde(default)]
    pub value_is_path: bool,
}

/// 条件分支步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    pub statement: Option<ConditionStatement>,
    #[serde(default)]
    pub true_children: Vec<WorkflowStep>,
    #[serde(default)]
    pub false_children: Vec<WorkflowStep>,
}

/// 循环步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachStep {
    /// 被迭代的数组路径
    pub source: VarRef,
    /// 循环变量名；`{name}_index` 绑定当前下标
    pub context_var: String,
    #[serde(default)]
    pub children: Vec<WorkflowStep>,
}

/// 数组/变量变更步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayOpStep {
    pub target: VarRef,
    pub operation: ArrayOpKind,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub value_is_path: bool,
    #[serde(default)]
    pub filters: Vec<ArrayFilter>,
}

/// 外部调用步骤：结果绑定到命名上下文变量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCallStep {
    pub method: String,
    pub url: String,
    pub context_var: String,
    /// 缺省时把当前事实文档作为载荷
    #[serde(default)]
    pub payload: Option<Value>,
}

/// 逻辑流步骤节点
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStep {
    Assign(AssignStep),
    Condition(ConditionStep),
    ForEach(ForEachStep),
    ArrayOp(ArrayOpStep),
    ExternalCall(ExternalCallStep),
    Sequence {
        #[serde(default)]
        children: Vec<WorkflowStep>,
    },
}

/// 逻辑流元数据变量，执行前写入事实文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataVar {
    pub var_key: String,
    #[serde(default)]
    pub value: Value,
}

/// 逻辑流定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicFlow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub metadata: Vec<MetadataVar>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub audit: Audit,
}

fn default_active() -> bool {
    true
}

impl LogicFlow {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            active: true,
            metadata: Vec::new(),
            steps,
            audit: Audit::default(),
        }
    }
}
