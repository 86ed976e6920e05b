//! 规则操作符与命中策略定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 条件叶子节点操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    // 通用比较
    Eq,
    Neq,

    // 数值比较
    Gt,
    Lt,
    Gte,
    Lte,

    // 字符串操作
    Contains,
    StartsWith,
    EndsWith,
    Matches,

    // 集合检查
    InArray,
    NotInArray,

    // 空值检查
    Empty,
}

impl ConditionOperator {
    /// 数值操作符需要把两侧都强制转换为浮点数
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Gt | Self::Lt | Self::Gte | Self::Lte)
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Matches => "matches",
            Self::InArray => "inarray",
            Self::NotInArray => "notinarray",
            Self::Empty => "empty",
        };
        write!(f, "{}", s)
    }
}

/// 数组/变量变更操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArrayOpKind {
    Set,
    Add,
    Sub,
    Mult,
    Div,
    Push,
    Remove,
    Delete,
    Clear,
    Uppercase,
    Lowercase,
    Trim,
    Append,
    Prepend,
    Increment,
    Decrement,
    Toggle,
    Reverse,
    SortAsc,
    SortDesc,
    Collect,
    CollectSum,
    CollectCount,
}

impl fmt::Display for ArrayOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Set => "SET",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mult => "MULT",
            Self::Div => "DIV",
            Self::Push => "PUSH",
            Self::Remove => "REMOVE",
            Self::Delete => "DELETE",
            Self::Clear => "CLEAR",
            Self::Uppercase => "UPPERCASE",
            Self::Lowercase => "LOWERCASE",
            Self::Trim => "TRIM",
            Self::Append => "APPEND",
            Self::Prepend => "PREPEND",
            Self::Increment => "INCREMENT",
            Self::Decrement => "DECREMENT",
            Self::Toggle => "TOGGLE",
            Self::Reverse => "REVERSE",
            Self::SortAsc => "SORT_ASC",
            Self::SortDesc => "SORT_DESC",
            Self::Collect => "COLLECT",
            Self::CollectSum => "COLLECT_SUM",
            Self::CollectCount => "COLLECT_COUNT",
        };
        write!(f, "{}", s)
    }
}

/// 决策表命中策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitPolicy {
    First,
    Any,
    Unique,
    Priority,
    Sum,
    Min,
    Max,
    Count,
    Collect,
    All,
    RuleOrder,
    OutputOrder,
}

impl HitPolicy {
    /// 聚合类策略对每个输出列收集全部匹配行的值
    pub fn is_aggregating(self) -> bool {
        matches!(
            self,
            Self::Sum
                | Self::Min
                | Self::Max
                | Self::Count
                | Self::Collect
                | Self::All
                | Self::RuleOrder
                | Self::OutputOrder
        )
    }
}

impl fmt::Display for HitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::First => "FIRST",
            Self::Any => "ANY",
            Self::Unique => "UNIQUE",
            Self::Priority => "PRIORITY",
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
            Self::Collect => "COLLECT",
            Self::All => "ALL",
            Self::RuleOrder => "RULE_ORDER",
            Self::OutputOrder => "OUTPUT_ORDER",
        };
        write!(f, "{}", s)
    }
}
