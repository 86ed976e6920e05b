//! 决策表引擎
//!
//! 规则行自上而下求值，行内单元格按与连接。输入列带 `[*]` 时引擎
//! 对对应数组逐元素递归处理，每个元素独立走一遍命中策略并把带前缀
//! 的输出写回该元素。

use crate::cell;
use crate::error::{Result, RuleError};
use crate::models::{DecisionTable, ExecutionLog};
use crate::operators::HitPolicy;
use crate::path::{self, Path};
use crate::store::RegexCache;
use serde_json::{Number, Value};
use std::sync::Arc;
use tracing::{info, instrument};

/// 决策表引擎
#[derive(Debug, Clone)]
pub struct DecisionTableEngine {
    regex: Arc<RegexCache>,
}

impl DecisionTableEngine {
    pub fn new(regex: Arc<RegexCache>) -> Self {
        Self { regex }
    }

    /// 对事实文档执行决策表，输出就地写回
    #[instrument(skip(self, table, fact, log), fields(table = %table.name))]
    pub fn evaluate(
        &self,
        table: &DecisionTable,
        fact: &mut Value,
        log: &mut ExecutionLog,
    ) -> Result<()> {
        table.validate()?;
        info!("开始执行决策表: {}", table.name);
        let output = self.process_scope(table, fact.clone(), "", log)?;
        *fact = output;
        Ok(())
    }

    /// 处理一个作用域（整个文档，或某个数组元素）
    fn process_scope(
        &self,
        table: &DecisionTable,
        data: Value,
        prefix: &str,
        log: &mut ExecutionLog,
    ) -> Result<Value> {
        // 当前层级涉及的数组键：输入列中 [*] 之前的部分
        let mut array_inputs: Vec<String> = Vec::new();
        for col in &table.input_columns {
            if let Some(pos) = col.var_key.find("[*]") {
                let mut arr_key = col.var_key[..pos].to_string();
                if !prefix.is_empty() {
                    let scoped = format!("{}.", prefix);
                    if let Some(stripped) = arr_key.strip_prefix(&scoped) {
                        arr_key = stripped.to_string();
                    }
                }
                if !arr_key.is_empty() && !array_inputs.contains(&arr_key) {
                    array_inputs.push(arr_key);
                }
            }
        }

        if array_inputs.is_empty() {
            return self.match_object(table, data, None, log);
        }

        // 逐数组递归：先处理元素内部的嵌套数组，再对元素本身跑规则行
        let mut output = data;
        for arr_key in &array_inputs {
            let arr_path = Path::parse(arr_key)?;
            let Ok(Value::Array(items)) = path::get(&output, &arr_path) else {
                continue;
            };
            let mut new_items = Vec::with_capacity(items.len());
            for item in items {
                let processed = self.process_scope(table, item, arr_key, log)?;
                let processed = self.match_object(table, processed, Some(arr_key), log)?;
                new_items.push(processed);
            }
            path::set(&mut output, &arr_path, Value::Array(new_items))?;
        }
        Ok(output)
    }

    /// 在单个对象上匹配规则行并应用命中策略
    ///
    /// `array_scope` 为 Some 时，只有 `{arr_key}[*].` 前缀的列参与匹配，
    /// 输出也只写回带该前缀的列。
    fn match_object(
        &self,
        table: &DecisionTable,
        data: Value,
        array_scope: Option<&str>,
        log: &mut ExecutionLog,
    ) -> Result<Value> {
        let scope_prefix = array_scope.map(|k| format!("{}[*].", k));
        let mut matched: Vec<&Vec<String>> = Vec::new();

        for row in &table.rules {
            let mut is_match = true;
            for (i, col) in table.input_columns.iter().enumerate() {
                let rel_key = match &scope_prefix {
                    Some(p) => match col.var_key.strip_prefix(p.as_str()) {
                        Some(rel) => rel,
                        // 非本层级的列不参与元素匹配
                        None => continue,
                    },
                    None => col.var_key.as_str(),
                };
                log.info(format!("Evaluating Input Column: {}", col.var_key));
                let actual = Path::parse(rel_key)
                    .ok()
                    .and_then(|p| path::get(&data, &p).ok());
                if !cell::evaluate_cell(&row[i], actual.as_ref(), &self.regex, log) {
                    is_match = false;
                    break;
                }
            }
            if is_match {
                log.info(format!("Rule Matched: {:?}", row));
                matched.push(row);
                if table.hit_policy == HitPolicy::First {
                    log.info("Hit Policy FIRST - stopping after first match");
                    break;
                }
            }
        }

        let final_values = self.apply_hit_policy(table, &matched, log)?;

        let mut output = data;
        for (var_key, value) in final_values {
            let rel_key = match &scope_prefix {
                Some(p) => match var_key.strip_prefix(p.as_str()) {
                    Some(rel) => rel.to_string(),
                    None => continue,
                },
                None => var_key,
            };
            path::set(&mut output, &Path::parse(&rel_key)?, value)?;
        }
        Ok(output)
    }

    /// 把命中行集合归并成最终输出值
    fn apply_hit_policy(
        &self,
        table: &DecisionTable,
        matched: &[&Vec<String>],
        log: &mut ExecutionLog,
    ) -> Result<Vec<(String, Value)>> {
        log.info(format!("Applying Hit Policy: {}", table.hit_policy));
        if matched.is_empty() {
            log.info("No matching rules found");
            return Ok(Vec::new());
        }
        log.info(format!("Total Matched Rows: {}", matched.len()));

        match table.hit_policy {
            HitPolicy::First => {
                log.info("Hit Policy FIRST - returning first matched row");
                Ok(extract_row_values(table, matched[0], log))
            }
            HitPolicy::Any => {
                log.info("Hit Policy ANY - validating all matched rows are identical");
                let first = extract_row_values(table, matched[0], log);
                for row in &matched[1..] {
                    let vals = extract_row_values(table, row, log);
                    if vals != first {
                        log.error("Hit Policy ANY violated: conflicting outputs found");
                        return Err(RuleError::HitPolicyViolation(format!(
                            "表 '{}' 的 ANY 策略命中了不一致的输出",
                            table.name
                        )));
                    }
                }
                Ok(first)
            }
            HitPolicy::Unique => {
                if matched.len() > 1 {
                    log.error("Hit Policy UNIQUE violated: multiple rules matched");
                    return Err(RuleError::HitPolicyViolation(format!(
                        "表 '{}' 的 UNIQUE 策略命中了 {} 行",
                        table.name,
                        matched.len()
                    )));
                }
                Ok(extract_row_values(table, matched[0], log))
            }
            HitPolicy::Priority => {
                log.info("Hit Policy PRIORITY - selecting highest priority row");
                let mut best = matched[0];
                for row in &matched[1..] {
                    if is_higher_priority(table, row, best) {
                        best = row;
                    }
                }
                Ok(extract_row_values(table, best, log))
            }
            _ => self.aggregate(table, matched, log),
        }
    }

    fn aggregate(
        &self,
        table: &DecisionTable,
        matched: &[&Vec<String>],
        log: &mut ExecutionLog,
    ) -> Result<Vec<(String, Value)>> {
        let mut ordered: Vec<&Vec<String>> = matched.to_vec();
        if table.hit_policy == HitPolicy::OutputOrder {
            // 稳定排序，优先级相同的行保持规则行顺序
            ordered.sort_by(|a, b| {
                if is_higher_priority(table, a, b) {
                    std::cmp::Ordering::Less
                } else if is_higher_priority(table, b, a) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            });
        }

        let per_row: Vec<Vec<(String, Value)>> = ordered
            .iter()
            .map(|row| extract_row_values(table, row, log))
            .collect();

        let mut results = Vec::new();
        for (i, out_col) in table.output_columns.iter().enumerate() {
            let column: Vec<&Value> = per_row.iter().map(|vals| &vals[i].1).collect();
            let value = match table.hit_policy {
                HitPolicy::Sum => {
                    let sum: f64 = column.iter().map(|v| to_float(v)).sum();
                    cell::number_value(sum)
                }
                HitPolicy::Min => {
                    let min = column.iter().map(|v| to_float(v)).fold(f64::MAX, f64::min);
                    cell::number_value(min)
                }
                HitPolicy::Max => {
                    let max = column.iter().map(|v| to_float(v)).fold(f64::MIN, f64::max);
                    cell::number_value(max)
                }
                HitPolicy::Count => Value::Number(Number::from(column.len())),
                HitPolicy::Collect
                | HitPolicy::All
                | HitPolicy::RuleOrder
                | HitPolicy::OutputOrder => {
                    Value::Array(column.into_iter().cloned().collect())
                }
                _ => unreachable!("non-aggregating policies handled earlier"),
            };
            results.push((out_col.var_key.clone(), value));
        }
        Ok(results)
    }
}

/// 输出单元格的类型推断：数字优先，其次布尔，最后原样字符串
fn extract_row_values(
    table: &DecisionTable,
    row: &[String],
    log: &mut ExecutionLog,
) -> Vec<(String, Value)> {
    let mut res = Vec::with_capacity(table.output_columns.len());
    for (i, out_col) in table.output_columns.iter().enumerate() {
        let raw = &row[table.input_columns.len() + i];
        let value = if let Ok(n) = raw.parse::<f64>() {
            cell::number_value(n)
        } else if raw.eq_ignore_ascii_case("true") {
            Value::Bool(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Value::Bool(false)
        } else {
            Value::String(raw.clone())
        };
        res.push((out_col.var_key.clone(), value));
    }
    log.info(format!("Extracted Values: {:?}", res));
    res
}

/// 按优先级列比较两行，数值大者胜出
fn is_higher_priority(table: &DecisionTable, a: &[String], b: &[String]) -> bool {
    for (i, out_col) in table.output_columns.iter().enumerate() {
        if out_col.is_priority {
            let idx = table.input_columns.len() + i;
            let pa = a[idx].parse::<f64>().unwrap_or(0.0);
            let pb = b[idx].parse::<f64>().unwrap_or(0.0);
            if pa != pb {
                return pa > pb;
            }
        }
    }
    false
}

fn to_float(v: &Value) -> f64 {
    cell::parse_number(Some(v)).unwrap_or(0.0)
}
