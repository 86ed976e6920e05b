//! 条件树求值器
//!
//! 叶子条件的路径可以带通配符，量化语义由所处的逻辑组决定：
//! AND 组内的通配叶子要求所有元素满足（且集合非空），OR 组和根位置
//! 只要求存在一个满足，NOT 表示没有任何元素满足。

use crate::cell;
use crate::error::{Result, RuleError};
use crate::models::{ConditionNode, ExecutionLog, LeafCondition};
use crate::path::{Path, Segment, SegmentIndex};
use crate::store::RegexCache;
use serde_json::Value;
use std::sync::Arc;

/// 通配叶子的量化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quantifier {
    Exists,
    ForAll,
}

/// 条件树求值器
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    regex: Arc<RegexCache>,
}

impl ConditionEvaluator {
    pub fn new(regex: Arc<RegexCache>) -> Self {
        Self { regex }
    }

    /// 对整棵条件树求值，根位置按存在量化
    pub fn evaluate(
        &self,
        node: &ConditionNode,
        doc: &Value,
        log: &mut ExecutionLog,
    ) -> Result<bool> {
        self.eval_node(node, doc, Quantifier::Exists, log)
    }

    fn eval_node(
        &self,
        node: &ConditionNode,
        doc: &Value,
        quant: Quantifier,
        log: &mut ExecutionLog,
    ) -> Result<bool> {
        match node {
            ConditionNode::And { children } => {
                for child in children {
                    if !self.eval_node(child, doc, Quantifier::ForAll, log)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionNode::Or { children } => {
                for child in children {
                    if self.eval_node(child, doc, Quantifier::Exists, log)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConditionNode::Not { children } => {
                if children.len() != 1 {
                    return Err(RuleError::InvalidCondition(format!(
                        "NOT 节点必须恰好有一个子节点, 实际 {}",
                        children.len()
                    )));
                }
                // 取反存在量化：没有任何元素满足
                Ok(!self.eval_node(&children[0], doc, Quantifier::Exists, log)?)
            }
            ConditionNode::Leaf(leaf) => self.eval_leaf(leaf, doc, quant, log),
        }
    }

    fn eval_leaf(
        &self,
        leaf: &LeafCondition,
        doc: &Value,
        quant: Quantifier,
        log: &mut ExecutionLog,
    ) -> Result<bool> {
        let path = Path::parse(&leaf.var_key)?;
        if path.has_wildcard() {
            return self.walk_quantified(leaf, doc, &path.segments, quant, log);
        }
        let actual = crate::path::get(doc, &path).ok();
        self.compare_leaf(leaf, actual.as_ref(), log)
    }

    /// 沿通配路径递归下探，在每层通配数组上应用量化
    fn walk_quantified(
        &self,
        leaf: &LeafCondition,
        doc: &Value,
        segments: &[Segment],
        quant: Quantifier,
        log: &mut ExecutionLog,
    ) -> Result<bool> {
        let Some((seg, rest)) = segments.split_first() else {
            return self.compare_leaf(leaf, Some(doc), log);
        };
        let inner = doc.get(&seg.key);
        match seg.index {
            SegmentIndex::None => match inner {
                Some(v) => self.walk_quantified(leaf, v, rest, quant, log),
                None => self.compare_leaf(leaf, None, log),
            },
            SegmentIndex::Fixed(n) => match inner.and_then(|v| v.get(n)) {
                Some(v) => self.walk_quantified(leaf, v, rest, quant, log),
                None => self.compare_leaf(leaf, None, log),
            },
            SegmentIndex::Wildcard => {
                let Some(Value::Array(arr)) = inner else {
                    log.info(format!(
                        "Array condition on non-array path: {}",
                        leaf.var_key
                    ));
                    return Ok(false);
                };
                match quant {
                    Quantifier::ForAll => {
                        if arr.is_empty() {
                            return Ok(false);
                        }
                        for elem in arr {
                            if !self.walk_quantified(leaf, elem, rest, quant, log)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    Quantifier::Exists => {
                        for elem in arr {
                            if self.walk_quantified(leaf, elem, rest, quant, log)? {
                                return Ok(true);
                            }
                        }
                        Ok(false)
                    }
                }
            }
        }
    }

    /// 叶子比较，操作符语义与数组过滤器共用
    pub(crate) fn compare_leaf(
        &self,
        leaf: &LeafCondition,
        actual: Option<&Value>,
        log: &mut ExecutionLog,
    ) -> Result<bool> {
        use crate::operators::ConditionOperator as Op;

        let expected = &leaf.value;
        if leaf.operator.is_numeric() {
            let (Some(a), Some(e)) = (
                cell::parse_number(actual),
                cell::parse_number(Some(expected)),
            ) else {
                log.error(format!(
                    "Numeric comparison failed for '{}': non-numeric operand",
                    leaf.var_key
                ));
                return Ok(false);
            };
            return Ok(match leaf.operator {
                Op::Gt => a > e,
                Op::Lt => a < e,
                Op::Gte => a >= e,
                Op::Lte => a <= e,
                _ => unreachable!("is_numeric covers comparison operators"),
            });
        }

        let actual_str = cell::stringify(actual);
        let expected_str = cell::stringify(Some(expected));

        Ok(match leaf.operator {
            Op::Eq => actual_str == expected_str,
            Op::Neq => actual_str != expected_str,
            Op::Contains => match actual {
                Some(Value::Array(arr)) => arr
                    .iter()
                    .any(|v| cell::stringify(Some(v)) == expected_str),
                _ => actual_str.contains(&expected_str),
            },
            Op::StartsWith => actual_str.starts_with(&expected_str),
            Op::EndsWith => actual_str.ends_with(&expected_str),
            Op::Matches => match self.regex.get_or_compile(&expected_str) {
                Ok(re) => re.is_match(&actual_str),
                Err(e) => {
                    log.error(format!("Regex compile failed: {}", e));
                    false
                }
            },
            Op::InArray | Op::NotInArray => {
                let Value::Array(candidates) = expected else {
                    return Err(RuleError::InvalidCondition(format!(
                        "操作符 {} 的期望值必须是数组",
                        leaf.operator
                    )));
                };
                let found = candidates
                    .iter()
                    .any(|v| cell::stringify(Some(v)) == actual_str);
                if leaf.operator == Op::InArray {
                    found
                } else {
                    !found
                }
            }
            Op::Empty => cell::is_empty_value(actual),
            Op::Gt | Op::Lt | Op::Gte | Op::Lte => {
                unreachable!("handled by numeric branch")
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::ConditionOperator;
    use serde_json::json;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new(Arc::new(RegexCache::new()))
    }

    fn eval(node: &ConditionNode, doc: &Value) -> bool {
        let mut log = ExecutionLog::new();
        evaluator().evaluate(node, doc, &mut log).unwrap()
    }

    #[test]
    fn test_leaf_operators() {
        let doc = json!({"name": "alice", "age": 30, "tags": ["vip", "beta"]});

        assert!(eval(
            &ConditionNode::leaf("name", ConditionOperator::Eq, "alice"),
            &doc
        ));
        assert!(eval(
            &ConditionNode::leaf("age", ConditionOperator::Gte, 30),
            &doc
        ));
        assert!(!eval(
            &ConditionNode::leaf("age", ConditionOperator::Lt, 30),
            &doc
        ));
        assert!(eval(
            &ConditionNode::leaf("tags", ConditionOperator::Contains, "vip"),
            &doc
        ));
        assert!(eval(
            &ConditionNode::leaf("name", ConditionOperator::StartsWith, "al"),
            &doc
        ));
        assert!(eval(
            &ConditionNode::leaf("name", ConditionOperator::Matches, "^a.*e$"),
            &doc
        ));
        assert!(eval(
            &ConditionNode::leaf("name", ConditionOperator::InArray, json!(["bob", "alice"])),
            &doc
        ));
        assert!(eval(
            &ConditionNode::leaf("missing", ConditionOperator::Empty, Value::Null),
            &doc
        ));
    }

    #[test]
    fn test_numeric_coercion_failure_is_false() {
        let doc = json!({"age": "abc"});
        let node = ConditionNode::leaf("age", ConditionOperator::Gt, 10);
        let mut log = ExecutionLog::new();
        assert!(!evaluator().evaluate(&node, &doc, &mut log).unwrap());
        assert!(log.contains_message("Numeric comparison failed"));
    }

    #[test]
    fn test_and_or_short_circuit() {
        let doc = json!({"a": 1, "b": 2});
        let node = ConditionNode::and(vec![
            ConditionNode::leaf("a", ConditionOperator::Eq, 1),
            ConditionNode::leaf("b", ConditionOperator::Eq, 2),
        ]);
        assert!(eval(&node, &doc));

        let node = ConditionNode::or(vec![
            ConditionNode::leaf("a", ConditionOperator::Eq, 99),
            ConditionNode::leaf("b", ConditionOperator::Eq, 2),
        ]);
        assert!(eval(&node, &doc));
    }

    #[test]
    fn test_not_requires_single_child() {
        let node = ConditionNode::Not { children: vec![] };
        let mut log = ExecutionLog::new();
        assert!(
            evaluator()
                .evaluate(&node, &json!({}), &mut log)
                .is_err()
        );
    }

    #[test]
    fn test_wildcard_forall_under_and() {
        let doc = json!({"items": [{"qty": 5}, {"qty": 7}]});
        let all_positive = ConditionNode::and(vec![ConditionNode::leaf(
            "items[*].qty",
            ConditionOperator::Gt,
            0,
        )]);
        assert!(eval(&all_positive, &doc));

        let doc_mixed = json!({"items": [{"qty": 5}, {"qty": -1}]});
        assert!(!eval(&all_positive, &doc_mixed));

        // 空集合不满足全称量化
        let doc_empty = json!({"items": []});
        assert!(!eval(&all_positive, &doc_empty));
    }

    #[test]
    fn test_wildcard_exists_at_root_and_under_or() {
        let doc = json!({"items": [{"qty": 0}, {"qty": 7}]});
        let any_positive = ConditionNode::leaf("items[*].qty", ConditionOperator::Gt, 0);
        assert!(eval(&any_positive, &doc));

        let under_or = ConditionNode::or(vec![any_positive]);
        assert!(eval(&under_or, &doc));
    }

    #[test]
    fn test_not_over_wildcard_means_none_match() {
        let none_negative = ConditionNode::not(ConditionNode::leaf(
            "items[*].qty",
            ConditionOperator::Lt,
            0,
        ));
        assert!(eval(&none_negative, &json!({"items": [{"qty": 1}, {"qty": 2}]})));
        assert!(!eval(&none_negative, &json!({"items": [{"qty": 1}, {"qty": -2}]})));
    }

    #[test]
    fn test_wildcard_on_non_array_is_false() {
        let doc = json!({"items": "oops"});
        let node = ConditionNode::leaf("items[*].qty", ConditionOperator::Gt, 0);
        assert!(!eval(&node, &doc));
    }

    #[test]
    fn test_missing_path_compares_as_absent() {
        let doc = json!({});
        assert!(!eval(
            &ConditionNode::leaf("nope", ConditionOperator::Eq, "x"),
            &doc
        ));
        assert!(eval(
            &ConditionNode::leaf("nope", ConditionOperator::Neq, "x"),
            &doc
        ));
    }
}
