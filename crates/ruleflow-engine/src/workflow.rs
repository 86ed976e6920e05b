//! 逻辑流解释器
//!
//! 逻辑流是一棵步骤树，解释器直接在事实文档上遍历执行。循环通过
//! 路径替换实现：循环变量被映射到 `数组路径[下标]`，因此子步骤对
//! 循环变量的读写都落在真实文档上。

use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::models::{
    ArrayFilter, ArrayOpStep, AssignStep, ConditionNode, ConditionStatement, ConditionStep,
    ExecutionLog, ExternalCallStep, ForEachStep, LeafCondition, LogicFlow, ValueType, WorkflowStep,
};
use crate::operators::ArrayOpKind;
use crate::path::{self, Path};
use crate::store::RegexCache;
use serde_json::{Number, Value};
use std::sync::Arc;
use tracing::{info, instrument};

/// 外部调用处理器，由宿主注入
pub trait ExternalCallHandler: Send + Sync {
    fn invoke(&self, method: &str, url: &str, payload: &Value) -> Result<Value>;
}

/// 循环上下文帧：循环变量名与它指向的具体数组元素
#[derive(Debug, Clone)]
struct Frame {
    var: String,
    base_path: String,
    index: usize,
}

#[derive(Debug, Default)]
struct LoopContext {
    frames: Vec<Frame>,
}

impl LoopContext {
    /// 把路径中的循环变量前缀替换成具体下标路径
    ///
    /// 帧在压栈时 base_path 已经是替换过的具体路径，内层优先。
    fn substitute(&self, raw: &str) -> String {
        for f in self.frames.iter().rev() {
            if raw == f.var {
                return format!("{}[{}]", f.base_path, f.index);
            }
            let head = format!("{}.", f.var);
            if let Some(rest) = raw.strip_prefix(&head) {
                return format!("{}[{}].{}", f.base_path, f.index, rest);
            }
        }
        raw.to_string()
    }

    /// `{变量}_index` 解析成当前下标
    fn resolve_index(&self, raw: &str) -> Option<usize> {
        self.frames
            .iter()
            .rev()
            .find(|f| raw == format!("{}_index", f.var))
            .map(|f| f.index)
    }

    fn depth(&self) -> usize {
        self.frames.len()
    }

    fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    /// 条件树里的叶子路径同样做循环变量替换
    fn rewrite_node(&self, node: &ConditionNode) -> ConditionNode {
        match node {
            ConditionNode::And { children } => ConditionNode::And {
                children: children.iter().map(|c| self.rewrite_node(c)).collect(),
            },
            ConditionNode::Or { children } => ConditionNode::Or {
                children: children.iter().map(|c| self.rewrite_node(c)).collect(),
            },
            ConditionNode::Not { children } => ConditionNode::Not {
                children: children.iter().map(|c| self.rewrite_node(c)).collect(),
            },
            ConditionNode::Leaf(leaf) => ConditionNode::Leaf(LeafCondition {
                var_key: self.substitute(&leaf.var_key),
                operator: leaf.operator,
                value: leaf.value.clone(),
            }),
        }
    }
}

/// 逻辑流解释器
pub struct WorkflowInterpreter {
    evaluator: ConditionEvaluator,
    external: Option<Arc<dyn ExternalCallHandler>>,
}

impl WorkflowInterpreter {
    pub fn new(regex: Arc<RegexCache>) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(regex),
            external: None,
        }
    }

    pub fn with_external_handler(mut self, handler: Arc<dyn ExternalCallHandler>) -> Self {
        self.external = Some(handler);
        self
    }

    /// 执行逻辑流，事实文档就地更新
    #[instrument(skip(self, flow, fact, log), fields(flow = %flow.name))]
    pub fn execute(
        &self,
        flow: &LogicFlow,
        fact: &mut Value,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        if !flow.active {
            log.info(format!("Workflow '{}' is inactive, skipping", flow.name));
            return Ok(());
        }
        info!("开始执行逻辑流: {}", flow.name);
        log.info("Starting workflow execution");
        for var in &flow.metadata {
            path::set(fact, &Path::parse(&var.var_key)?, var.value.clone())?;
        }
        let mut ctx = LoopContext::default();
        self.run_steps(&flow.steps, fact, &mut ctx, log)?;
        log.info("Workflow execution completed");
        Ok(())
    }

    fn run_steps(
        &self,
        steps: &[WorkflowStep],
        fact: &mut Value,
        ctx: &mut LoopContext,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        for step in steps {
            self.run_step(step, fact, ctx, log)?;
        }
        Ok(())
    }

    fn run_step(
        &self,
        step: &WorkflowStep,
        fact: &mut Value,
        ctx: &mut LoopContext,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        match step {
            WorkflowStep::Assign(s) => self.run_assign(s, fact, ctx, log),
            WorkflowStep::Condition(s) => self.run_condition(s, fact, ctx, log),
            WorkflowStep::ForEach(s) => self.run_for_each(s, fact, ctx, log),
            WorkflowStep::ArrayOp(s) => self.run_array_op(s, fact, ctx, log),
            WorkflowStep::ExternalCall(s) => self.run_external_call(s, fact, log),
            WorkflowStep::Sequence { children } => self.run_steps(children, fact, ctx, log),
        }
    }

    fn run_assign(
        &self,
        step: &AssignStep,
        fact: &mut Value,
        ctx: &mut LoopContext,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        let target = ctx.substitute(&step.target.var_key);
        log.info(format!("Assignment step: targetPath={}", target));

        let value = self.resolve_value(&step.value, step.value_is_path, fact, ctx)?;
        let value = match step.target.var_type {
            Some(ty) => coerce(value, ty)?,
            None => value,
        };
        path::set(fact, &Path::parse(&target)?, value)?;
        log.info(format!("Value set at {}", target));
        Ok(())
    }

    /// value_is_path 为真时把字符串值当作路径解析
    fn resolve_value(
        &self,
        value: &Value,
        value_is_path: bool,
        fact: &Value,
        ctx: &LoopContext,
    ) -> Result<Value> {
        if !value_is_path {
            return Ok(value.clone());
        }
        let Value::String(raw) = value else {
            return Err(RuleError::InvalidAction(
                "value_is_path 要求值是字符串路径".to_string(),
            ));
        };
        if let Some(idx) = ctx.resolve_index(raw) {
            return Ok(Value::Number(Number::from(idx)));
        }
        let resolved = ctx.substitute(raw);
        path::get(fact, &Path::parse(&resolved)?)
    }

    fn run_condition(
        &self,
        step: &ConditionStep,
        fact: &mut Value,
        ctx: &mut LoopContext,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        let statement = step
            .statement
            .as_ref()
            .ok_or_else(|| RuleError::InvalidCondition("条件步骤缺少判断语句".to_string()))?;

        let result = match statement {
            ConditionStatement::Tree(node) => {
                let rewritten = ctx.rewrite_node(node);
                self.evaluator.evaluate(&rewritten, fact, log)?
            }
            ConditionStatement::Path(raw) => {
                let value = if let Some(idx) = ctx.resolve_index(raw) {
                    Some(Value::Number(Number::from(idx)))
                } else {
                    path::get(fact, &Path::parse(&ctx.substitute(raw))?).ok()
                };
                is_truthy(value.as_ref())
            }
        };
        log.info(format!("Condition result: {}", result));

        if result {
            log.info("Executing TrueChildren for condition");
            self.run_steps(&step.true_children, fact, ctx, log)
        } else {
            log.info("Executing FalseChildren for condition");
            self.run_steps(&step.false_children, fact, ctx, log)
        }
    }

    fn run_for_each(
        &self,
        step: &ForEachStep,
        fact: &mut Value,
        ctx: &mut LoopContext,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        let array_path = ctx.substitute(&step.source.var_key);
        log.info(format!("Executing for_each on array path: {}", array_path));

        let parsed = Path::parse(&array_path)?;
        let Value::Array(items) = path::get(fact, &parsed)? else {
            log.error(format!("for_each target is not an array: {}", array_path));
            return Err(RuleError::InvalidAction(format!(
                "for_each 目标不是数组: {}",
                array_path
            )));
        };
        // 迭代次数在进入循环时定死，体内追加的元素不参与本轮
        let count = items.len();
        let depth = ctx.depth();
        for i in 0..count {
            log.info(format!(
                "for_each iteration {}, contextVar: {}",
                i, step.context_var
            ));
            ctx.frames.push(Frame {
                var: step.context_var.clone(),
                base_path: array_path.clone(),
                index: i,
            });
            let r = self.run_steps(&step.children, fact, ctx, log);
            ctx.truncate(depth);
            r?;
        }
        log.info("for_each completed");
        Ok(())
    }

    fn run_array_op(
        &self,
        step: &ArrayOpStep,
        fact: &mut Value,
        ctx: &mut LoopContext,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        let target = ctx.substitute(&step.target.var_key);
        let value = self.resolve_value(&step.value, step.value_is_path, fact, ctx)?;

        if target.contains("[*]") {
            log.info(format!("Applying Array Operation on Variable: {}", target));
            let paths = self.expand_wildcard_paths(fact, &target, &step.filters, log)?;
            for p in paths {
                apply_op(fact, &p, step.operation, &value, log)?;
            }
        } else {
            log.info(format!("Applying Operation on Variable: {}", target));
            apply_op(fact, &target, step.operation, &value, log)?;
        }
        Ok(())
    }

    /// 展开通配目标为具体路径列表，过滤器在对应数组层级生效
    fn expand_wildcard_paths(
        &self,
        fact: &Value,
        raw: &str,
        filters: &[ArrayFilter],
        log: &mut ExecutionLog,
    ) -> Result<Vec<String>> {
        let parts: Vec<&str> = raw.split("[*]").collect();
        let mut out = Vec::new();
        self.walk_paths(fact, "", &parts, 0, filters, log, &mut out)?;
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_paths(
        &self,
        fact: &Value,
        prefix: &str,
        parts: &[&str],
        idx: usize,
        filters: &[ArrayFilter],
        log: &mut ExecutionLog,
        out: &mut Vec<String>,
    ) -> Result<()> {
        let segment = parts[idx].trim_matches('.');
        let full = if prefix.is_empty() {
            segment.to_string()
        } else if segment.is_empty() {
            prefix.to_string()
        } else {
            format!("{}.{}", prefix, segment)
        };

        if idx == parts.len() - 1 {
            out.push(full);
            return Ok(());
        }

        let Ok(Value::Array(items)) = path::get(fact, &Path::parse(&full)?) else {
            log.info(format!("Path '{}' is not an array. Skipping.", full));
            return Ok(());
        };
        for i in 0..items.len() {
            let item_path = format!("{}[{}]", full, i);
            if self.check_filters(fact, &item_path, segment, filters, log)? {
                self.walk_paths(fact, &item_path, parts, idx + 1, filters, log, out)?;
            }
        }
        Ok(())
    }

    fn check_filters(
        &self,
        fact: &Value,
        item_path: &str,
        segment: &str,
        filters: &[ArrayFilter],
        log: &mut ExecutionLog,
    ) -> Result<bool> {
        for f in filters {
            if !f.array_name.is_empty() && !segment.contains(&f.array_name) {
                continue;
            }
            log.info(format!(
                "Applying Filter: Property='{}' Operator='{}'",
                f.property, f.operator
            ));
            let prop_path = format!("{}.{}", item_path, f.property);
            let actual = path::get(fact, &Path::parse(&prop_path)?).ok();
            let leaf = LeafCondition {
                var_key: prop_path,
                operator: f.operator,
                value: f.value.clone(),
            };
            if !self.evaluator.compare_leaf(&leaf, actual.as_ref(), log)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run_external_call(
        &self,
        step: &ExternalCallStep,
        fact: &mut Value,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        let handler = self.external.as_ref().ok_or_else(|| {
            log.error("External call requested but no handler configured");
            RuleError::ExternalCallFailure("未配置外部调用处理器".to_string())
        })?;
        log.info(format!(
            "External call: {} {} -> {}",
            step.method, step.url, step.context_var
        ));
        let payload = step.payload.clone().unwrap_or_else(|| fact.clone());
        let result = handler.invoke(&step.method, &step.url, &payload)?;
        // 结果写入事实文档，对后续步骤可见
        path::set(fact, &Path::parse(&step.context_var)?, result)?;
        Ok(())
    }
}

/// 布尔真值化：非零数字、非空字符串、true、数组和对象为真
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// 按声明类型转换赋值
fn coerce(value: Value, ty: ValueType) -> Result<Value> {
    let fail = |value: &Value, expected: &str| RuleError::CoercionFailure {
        expected: expected.to_string(),
        actual: value.to_string(),
    };
    match ty {
        ValueType::String => Ok(Value::String(crate::cell::stringify(Some(&value)))),
        // number 截断小数部分，与 float 区分
        ValueType::Number => match &value {
            Value::Number(n) => {
                let f = n.as_f64().ok_or_else(|| fail(&value, "number"))?;
                Ok(Value::Number(Number::from(f as i64)))
            }
            Value::String(s) => {
                let f = s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| fail(&value, "number"))?;
                Ok(Value::Number(Number::from(f as i64)))
            }
            _ => Err(fail(&value, "number")),
        },
        ValueType::Float => match &value {
            Value::Number(n) => {
                let f = n.as_f64().ok_or_else(|| fail(&value, "float"))?;
                Ok(Number::from_f64(f).map_or(Value::Null, Value::Number))
            }
            Value::String(s) => {
                let f = s.trim().parse::<f64>().map_err(|_| fail(&value, "float"))?;
                Ok(Number::from_f64(f).map_or(Value::Null, Value::Number))
            }
            _ => Err(fail(&value, "float")),
        },
        ValueType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(fail(&value, "boolean")),
            },
            _ => Err(fail(&value, "boolean")),
        },
    }
}

/// 在具体路径上施加一个变更操作
fn apply_op(
    fact: &mut Value,
    raw_path: &str,
    op: ArrayOpKind,
    value: &Value,
    log: &mut ExecutionLog,
) -> Result<()> {
    let parsed = Path::parse(raw_path)?;
    let current = path::get(fact, &parsed).ok();
    let current_num = crate::cell::parse_number(current.as_ref()).unwrap_or(0.0);
    let current_str = crate::cell::stringify(current.as_ref());
    let value_num = crate::cell::parse_number(Some(value)).unwrap_or(0.0);
    let value_str = crate::cell::stringify(Some(value));

    let new_value = match op {
        ArrayOpKind::Set => value.clone(),
        ArrayOpKind::Add => crate::cell::number_value(current_num + value_num),
        ArrayOpKind::Sub => crate::cell::number_value(current_num - value_num),
        ArrayOpKind::Mult => crate::cell::number_value(current_num * value_num),
        ArrayOpKind::Div => {
            if value_num == 0.0 {
                return Err(RuleError::InvalidAction(format!(
                    "路径 {} 上除数为零",
                    raw_path
                )));
            }
            crate::cell::number_value(current_num / value_num)
        }
        ArrayOpKind::Push => {
            let mut arr = match current {
                Some(Value::Array(a)) => a,
                _ => Vec::new(),
            };
            // 字符串形态的 JSON 字面量入栈前先解析
            let item = if value_str.contains('{') || value_str.contains('[') {
                serde_json::from_str(&value_str).unwrap_or_else(|_| value.clone())
            } else {
                value.clone()
            };
            arr.push(item);
            Value::Array(arr)
        }
        ArrayOpKind::Remove | ArrayOpKind::Delete => {
            path::delete(fact, &parsed)?;
            return Ok(());
        }
        ArrayOpKind::Clear => {
            if matches!(current, Some(Value::Array(_))) {
                Value::Array(Vec::new())
            } else {
                path::delete(fact, &parsed)?;
                return Ok(());
            }
        }
        ArrayOpKind::Uppercase => Value::String(current_str.to_uppercase()),
        ArrayOpKind::Lowercase => Value::String(current_str.to_lowercase()),
        ArrayOpKind::Trim => Value::String(current_str.trim().to_string()),
        ArrayOpKind::Append => Value::String(format!("{}{}", current_str, value_str)),
        ArrayOpKind::Prepend => Value::String(format!("{}{}", value_str, current_str)),
        ArrayOpKind::Increment => crate::cell::number_value(current_num + 1.0),
        ArrayOpKind::Decrement => crate::cell::number_value(current_num - 1.0),
        ArrayOpKind::Toggle => Value::Bool(!matches!(current, Some(Value::Bool(true)))),
        ArrayOpKind::Reverse => {
            let Some(Value::Array(mut arr)) = current else {
                return Ok(());
            };
            arr.reverse();
            Value::Array(arr)
        }
        ArrayOpKind::SortAsc | ArrayOpKind::SortDesc => {
            let Some(Value::Array(arr)) = current else {
                return Ok(());
            };
            let mut nums: Vec<f64> = arr
                .iter()
                .map(|v| crate::cell::parse_number(Some(v)).unwrap_or(0.0))
                .collect();
            nums.sort_by(|a, b| a.total_cmp(b));
            if op == ArrayOpKind::SortDesc {
                nums.reverse();
            }
            Value::Array(nums.into_iter().map(crate::cell::number_value).collect())
        }
        ArrayOpKind::Collect => {
            let mut arr = match current {
                Some(Value::Array(a)) => a,
                _ => Vec::new(),
            };
            arr.push(value.clone());
            Value::Array(arr)
        }
        ArrayOpKind::CollectSum => {
            if crate::cell::parse_number(Some(value)).is_none() {
                return Err(RuleError::InvalidAction(format!(
                    "COLLECT_SUM 的值不是数字: {}",
                    value_str
                )));
            }
            crate::cell::number_value(current_num + value_num)
        }
        ArrayOpKind::CollectCount => crate::cell::number_value(current_num + 1.0),
    };

    path::set(fact, &parsed, new_value)?;
    log.info(format!("Applied {} at {}", op, raw_path));
    Ok(())
}
