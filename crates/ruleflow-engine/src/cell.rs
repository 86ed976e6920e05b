//! 决策表单元格表达式求值
//!
//! 单元格是一门小型匹配语言，按固定优先级逐层判断：
//! 通配（空 / `-`）、`NULL` / `EMPTY` 关键字、`!` 字符串不等、逗号析取、
//! 数值比较（`a..b` / `>=` / `<=` / `>` / `<`）、`~正则`、
//! `^前缀` / `$后缀`，最后回退到精确字符串匹配。

use crate::models::ExecutionLog;
use crate::store::RegexCache;
use serde_json::{Number, Value};

/// 把 JSON 值转成单元格比较用的字符串
///
/// null 与缺失值转成空串；整数值不带小数点，与数值面值的书写习惯一致。
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => format_number(n.as_f64().unwrap_or(0.0)),
        Some(other) => other.to_string(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// 把 f64 收敛回 JSON 数值，整数值落为整型
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

pub(crate) fn parse_number(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub(crate) fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => {
            let t = s.trim();
            t.is_empty() || t == "null" || t == "undefined"
        }
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        _ => false,
    }
}

/// 对单个单元格表达式求值
pub fn evaluate_cell(
    expr: &str,
    actual: Option<&Value>,
    regex: &RegexCache,
    log: &mut ExecutionLog,
) -> bool {
    let expr = expr.trim();
    let actual_str = stringify(actual);
    log.info(format!(
        "Evaluating Cell: Expr='{}' Actual='{}'",
        expr, actual_str
    ));

    // 通配：空单元格和 "-" 匹配一切
    if expr.is_empty() || expr == "-" {
        return true;
    }

    if expr.eq_ignore_ascii_case("NULL") {
        return matches!(actual, None | Some(Value::Null));
    }
    if expr.eq_ignore_ascii_case("EMPTY") {
        return is_empty_value(actual);
    }

    // 取反只做字符串不等比较，不递归解析剩余表达式
    if let Some(rest) = expr.strip_prefix('!') {
        return actual_str != rest.trim();
    }

    // 逗号析取；括号内的逗号不是分隔符
    if expr.contains(',') && !expr.contains(['[', ']', '{', '}', '(', ')']) {
        return expr
            .split(',')
            .any(|alt| evaluate_cell(alt, actual, regex, log));
    }

    // 数值分支：实际值是数字，或表达式带比较/区间符号
    let numeric_expr = expr.contains(['>', '<', '=']) || expr.contains("..");
    if matches!(actual, Some(Value::Number(_))) || numeric_expr {
        if let Some(result) = evaluate_numeric(expr, actual, log) {
            return result;
        }
    }

    // ~ 正则
    if let Some(pattern) = expr.strip_prefix('~') {
        match regex.get_or_compile(pattern) {
            Ok(re) => return re.is_match(&actual_str),
            Err(e) => {
                log.error(format!("Regex compile failed: {}", e));
                return false;
            }
        }
    }

    // ^ 前缀 / $ 后缀
    if let Some(prefix) = expr.strip_prefix('^') {
        return actual_str.starts_with(prefix.trim());
    }
    if let Some(suffix) = expr.strip_prefix('$') {
        return actual_str.ends_with(suffix.trim());
    }

    // 精确匹配
    expr == actual_str
}

/// 数值区间与比较；表达式不是数值语法时返回 None 继续走后续分支
fn evaluate_numeric(expr: &str, actual: Option<&Value>, log: &mut ExecutionLog) -> Option<bool> {
    if let Some((lo, hi)) = expr.split_once("..") {
        let lo = lo.trim().parse::<f64>().ok()?;
        let hi = hi.trim().parse::<f64>().ok()?;
        let Some(n) = parse_number(actual) else {
            return Some(false);
        };
        let matched = n >= lo && n <= hi;
        if matched {
            log.info(format!("Matched Range check: {} in {}", n, expr));
        }
        return Some(matched);
    }

    for (op, cmp) in [
        (">=", f64::ge as fn(&f64, &f64) -> bool),
        ("<=", f64::le),
        (">", f64::gt),
        ("<", f64::lt),
    ] {
        if let Some(rest) = expr.strip_prefix(op) {
            let bound = rest.trim().parse::<f64>().ok()?;
            let Some(n) = parse_number(actual) else {
                return Some(false);
            };
            return Some(cmp(&n, &bound));
        }
    }

    // 纯数字面值：按数值相等比较，吸收 18 与 18.0 的差异
    if let Ok(expected) = expr.parse::<f64>() {
        let Some(n) = parse_number(actual) else {
            return Some(false);
        };
        return Some(n == expected);
    }

    None
}
