//! 逻辑流编译器
//!
//! 把逻辑流步骤树翻译成脚本源码，交给沙箱运行时执行。编译是纯函数：
//! 同一定义永远产出字节相同的脚本，因此脚本可以按 `流程ID@版本` 缓存。
//!
//! 脚本约定：宿主把事实文档注入为 `data` 变量，脚本维护自己的 `log`
//! 数组，执行结束后宿主把两者读回。类型转换、正则、真值化和外部调用
//! 都通过宿主注册的函数完成。

use crate::error::{Result, RuleError};
use crate::models::{
    ArrayOpStep, AssignStep, ConditionNode, ConditionStatement, ConditionStep, ExternalCallStep,
    ForEachStep, LogicFlow, ValueType, WorkflowStep,
};
use crate::operators::{ArrayOpKind, ConditionOperator};
use serde_json::Value;
use tracing::{info, instrument};

/// 编译产物
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub flow_id: String,
    pub version: u32,
    pub source: String,
}

impl CompiledScript {
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.flow_id, self.version)
    }
}

/// 循环变量到具体表达式的编译期映射
struct Mapping {
    var: String,
    expr: String,
    index_var: String,
}

/// 逻辑流编译器
#[derive(Debug, Default)]
pub struct ScriptCompiler;

impl ScriptCompiler {
    pub fn new() -> Self {
        Self
    }

    /// 编译逻辑流为脚本源码
    #[instrument(skip(self, flow), fields(flow_id = %flow.id))]
    pub fn compile(&self, flow: &LogicFlow) -> Result<CompiledScript> {
        let mut out = String::new();
        out.push_str("let log = [];\n");

        for var in &flow.metadata {
            out.push_str(&format!(
                "data.{} = {};\n",
                var.var_key,
                value_to_rhai(&var.value)
            ));
        }

        let mut mappings: Vec<Mapping> = Vec::new();
        self.compile_steps(&flow.steps, 0, &mut mappings, &mut out)?;

        info!("逻辑流编译完成: {} ({} 字节)", flow.name, out.len());
        Ok(CompiledScript {
            flow_id: flow.id.clone(),
            version: flow.audit.version,
            source: out,
        })
    }

    fn compile_steps(
        &self,
        steps: &[WorkflowStep],
        indent: usize,
        mappings: &mut Vec<Mapping>,
        out: &mut String,
    ) -> Result<()> {
        for step in steps {
            match step {
                WorkflowStep::Assign(s) => self.compile_assign(s, indent, mappings, out)?,
                WorkflowStep::Condition(s) => self.compile_condition(s, indent, mappings, out)?,
                WorkflowStep::ForEach(s) => self.compile_for_each(s, indent, mappings, out)?,
                WorkflowStep::ArrayOp(s) => self.compile_array_op(s, indent, mappings, out)?,
                WorkflowStep::ExternalCall(s) => self.compile_external_call(s, indent, out)?,
                WorkflowStep::Sequence { children } => {
                    self.compile_steps(children, indent, mappings, out)?;
                }
            }
        }
        Ok(())
    }

    fn compile_assign(
        &self,
        step: &AssignStep,
        indent: usize,
        mappings: &[Mapping],
        out: &mut String,
    ) -> Result<()> {
        let pad = pad(indent);
        let target = path_expr(&step.target.var_key, mappings)?;
        let mut value = if step.value_is_path {
            let Value::String(raw) = &step.value else {
                return Err(RuleError::CompilationFailure(
                    "value_is_path 要求值是字符串路径".to_string(),
                ));
            };
            path_expr(raw, mappings)?
        } else {
            value_to_rhai(&step.value)
        };
        if let Some(ty) = step.target.var_type {
            let helper = match ty {
                ValueType::String => "as_string",
                ValueType::Number => "as_number",
                ValueType::Float => "as_float",
                ValueType::Boolean => "as_bool",
            };
            value = format!("{}({})", helper, value);
        }
        out.push_str(&format!(
            "{pad}log.push(\"Assigning {} to {}\");\n",
            escape(&value),
            escape(&target)
        ));
        out.push_str(&format!("{pad}{} = {};\n", target, value));
        Ok(())
    }

    fn compile_condition(
        &self,
        step: &ConditionStep,
        indent: usize,
        mappings: &mut Vec<Mapping>,
        out: &mut String,
    ) -> Result<()> {
        let pad = pad(indent);
        let statement = step.statement.as_ref().ok_or_else(|| {
            RuleError::CompilationFailure("条件步骤缺少判断语句".to_string())
        })?;
        let expr = match statement {
            ConditionStatement::Tree(node) => cond_to_rhai(node, mappings)?,
            ConditionStatement::Path(raw) => format!("is_truthy({})", path_expr(raw, mappings)?),
        };

        out.push_str(&format!(
            "{pad}log.push(\"Evaluating condition: {}\");\n",
            escape(&expr)
        ));
        out.push_str(&format!("{pad}if {} {{\n", expr));
        out.push_str(&format!(
            "{}log.push(\"Condition evaluated to true\");\n",
            pad_str(indent + 1)
        ));
        self.compile_steps(&step.true_children, indent + 1, mappings, out)?;
        if step.false_children.is_empty() {
            out.push_str(&format!("{pad}}}\n"));
        } else {
            out.push_str(&format!("{pad}}} else {{\n"));
            out.push_str(&format!(
                "{}log.push(\"Condition evaluated to false\");\n",
                pad_str(indent + 1)
            ));
            self.compile_steps(&step.false_children, indent + 1, mappings, out)?;
            out.push_str(&format!("{pad}}}\n"));
        }
        Ok(())
    }

    fn compile_for_each(
        &self,
        step: &ForEachStep,
        indent: usize,
        mappings: &mut Vec<Mapping>,
        out: &mut String,
    ) -> Result<()> {
        let pad = pad(indent);
        let array = path_expr(&step.source.var_key, mappings)?;
        let index_var = format!("i{}", mappings.len());

        out.push_str(&format!(
            "{pad}log.push(\"Iterating over array: {}\");\n",
            escape(&array)
        ));
        // 按下标循环，循环体内对元素的写入才会落回 data
        out.push_str(&format!(
            "{pad}for {} in 0..{}.len() {{\n",
            index_var, array
        ));
        mappings.push(Mapping {
            var: step.context_var.clone(),
            expr: format!("{}[{}]", array, index_var),
            index_var,
        });
        let r = self.compile_steps(&step.children, indent + 1, mappings, out);
        mappings.pop();
        r?;
        out.push_str(&format!("{pad}}}\n"));
        Ok(())
    }

    fn compile_array_op(
        &self,
        step: &ArrayOpStep,
        indent: usize,
        mappings: &[Mapping],
        out: &mut String,
    ) -> Result<()> {
        if step.target.var_key.contains("[*]") {
            return Err(RuleError::CompilationFailure(format!(
                "带通配符的目标无法编译, 请使用 for_each: {}",
                step.target.var_key
            )));
        }
        let pad = pad(indent);
        let target = path_expr(&step.target.var_key, mappings)?;
        let value = if step.value_is_path {
            let Value::String(raw) = &step.value else {
                return Err(RuleError::CompilationFailure(
                    "value_is_path 要求值是字符串路径".to_string(),
                ));
            };
            path_expr(raw, mappings)?
        } else {
            value_to_rhai(&step.value)
        };

        use ArrayOpKind as K;
        let stmt = match step.operation {
            K::Set => format!("{} = {};", target, value),
            K::Add => format!("{} += {};", target, value),
            K::Sub => format!("{} -= {};", target, value),
            K::Mult => format!("{} *= {};", target, value),
            K::Div => format!("{} /= {};", target, value),
            K::Push => format!("{}.push({});", target, value),
            K::Clear => format!("{} = [];", target),
            K::Uppercase => format!("{} = {}.to_upper();", target, target),
            K::Lowercase => format!("{} = {}.to_lower();", target, target),
            K::Trim => format!("{}.trim();", target),
            K::Append => format!("{} += {};", target, value),
            K::Prepend => format!("{} = {} + {};", target, value, target),
            K::Increment => format!("{} += 1;", target),
            K::Decrement => format!("{} -= 1;", target),
            K::Toggle => format!("{} = !{};", target, target),
            K::Reverse => format!("{}.reverse();", target),
            K::SortAsc => format!("{}.sort();", target),
            K::SortDesc => format!("{}.sort();\n{}{}.reverse();", target, pad, target),
            K::Remove | K::Delete | K::Collect | K::CollectSum | K::CollectCount => {
                return Err(RuleError::CompilationFailure(format!(
                    "操作 {} 只支持解释执行",
                    step.operation
                )));
            }
        };
        out.push_str(&format!(
            "{pad}log.push(\"Applying {} at {}\");\n",
            step.operation,
            escape(&target)
        ));
        out.push_str(&format!("{pad}{}\n", stmt));
        Ok(())
    }

    fn compile_external_call(
        &self,
        step: &ExternalCallStep,
        indent: usize,
        out: &mut String,
    ) -> Result<()> {
        let pad = pad(indent);
        let payload = match &step.payload {
            Some(v) => value_to_rhai(v),
            None => "data".to_string(),
        };
        out.push_str(&format!(
            "{pad}data.{} = external_call(\"{}\", \"{}\", {});\n",
            step.context_var,
            escape(&step.method),
            escape(&step.url),
            payload
        ));
        Ok(())
    }
}

fn pad(indent: usize) -> String {
    pad_str(indent)
}

fn pad_str(indent: usize) -> String {
    "    ".repeat(indent)
}

/// 把路径转成脚本表达式，循环变量按编译期映射替换，内层优先
fn path_expr(raw: &str, mappings: &[Mapping]) -> Result<String> {
    if raw.contains("[*]") {
        return Err(RuleError::CompilationFailure(format!(
            "带通配符的路径无法编译: {}",
            raw
        )));
    }
    for m in mappings.iter().rev() {
        if raw == m.var {
            return Ok(m.expr.clone());
        }
        if raw == format!("{}_index", m.var) {
            return Ok(m.index_var.clone());
        }
        if let Some(rest) = raw.strip_prefix(&format!("{}.", m.var)) {
            return Ok(format!("{}.{}", m.expr, rest));
        }
    }
    Ok(format!("data.{}", raw))
}

/// 条件树到脚本布尔表达式
fn cond_to_rhai(node: &ConditionNode, mappings: &[Mapping]) -> Result<String> {
    match node {
        ConditionNode::And { children } => join_children(children, " && ", mappings),
        ConditionNode::Or { children } => join_children(children, " || ", mappings),
        ConditionNode::Not { children } => {
            if children.len() != 1 {
                return Err(RuleError::CompilationFailure(format!(
                    "NOT 节点必须恰好有一个子节点, 实际 {}",
                    children.len()
                )));
            }
            Ok(format!("!({})", cond_to_rhai(&children[0], mappings)?))
        }
        ConditionNode::Leaf(leaf) => {
            let lhs = path_expr(&leaf.var_key, mappings)?;
            let rhs = value_to_rhai(&leaf.value);
            use ConditionOperator as Op;
            Ok(match leaf.operator {
                Op::Eq => format!("{} == {}", lhs, rhs),
                Op::Neq => format!("{} != {}", lhs, rhs),
                Op::Gt => format!("{} > {}", lhs, rhs),
                Op::Lt => format!("{} < {}", lhs, rhs),
                Op::Gte => format!("{} >= {}", lhs, rhs),
                Op::Lte => format!("{} <= {}", lhs, rhs),
                Op::Contains => format!("{}.contains({})", lhs, rhs),
                Op::StartsWith => format!("{}.starts_with({})", lhs, rhs),
                Op::EndsWith => format!("{}.ends_with({})", lhs, rhs),
                Op::Matches => format!("regex_match({}, {})", lhs, rhs),
                Op::InArray => format!("{}.contains({})", rhs, lhs),
                Op::NotInArray => format!("!({}.contains({}))", rhs, lhs),
                Op::Empty => format!("is_empty_value({})", lhs),
            })
        }
    }
}

fn join_children(
    children: &[ConditionNode],
    sep: &str,
    mappings: &[Mapping],
) -> Result<String> {
    let parts: Vec<String> = children
        .iter()
        .map(|c| cond_to_rhai(c, mappings))
        .collect::<Result<_>>()?;
    Ok(format!("({})", parts.join(sep)))
}

/// JSON 值到脚本字面量
fn value_to_rhai(value: &Value) -> String {
    match value {
        Value::Null => "()".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                if f.fract() == 0.0 {
                    format!("{:.1}", f)
                } else {
                    format!("{}", f)
                }
            }
        }
        Value::String(s) => format!("\"{}\"", escape(s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(value_to_rhai).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("\"{}\": {}", escape(k), value_to_rhai(v)))
                .collect();
            format!("#{{{}}}", items.join(", "))
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
