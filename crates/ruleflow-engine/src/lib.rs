//! 业务规则执行引擎
//!
//! 提供规则平台的执行内核，支持：
//! - 通配符 JSON 路径解析与读写
//! - 决策表求值和命中策略
//! - 条件树与量化数组条件
//! - 逻辑流树遍历解释执行
//! - 逻辑流编译为脚本并在沙箱中限时执行

pub mod cell;
pub mod compiler;
pub mod error;
pub mod evaluator;
pub mod models;
pub mod operators;
pub mod path;
pub mod runtime;
pub mod store;
pub mod table;
pub mod workflow;

pub use compiler::{CompiledScript, ScriptCompiler};
pub use error::{Result, RuleError};
pub use evaluator::ConditionEvaluator;
pub use models::{
    ArrayFilter, ArrayOpStep, AssignStep, Audit, ColumnDef, ConditionNode, ConditionStatement,
    ConditionStep, DecisionTable, ExecutionLog, ExternalCallStep, ForEachStep, LeafCondition,
    LogEntry, LogKind, LogicFlow, MetadataVar, ValueType, VarRef, WorkflowStep,
};
pub use operators::{ArrayOpKind, ConditionOperator, HitPolicy};
pub use path::Path;
pub use runtime::SandboxRuntime;
pub use store::{RegexCache, ScriptCache};
pub use table::DecisionTableEngine;
pub use workflow::{ExternalCallHandler, WorkflowInterpreter};
