//! 规则引擎集成测试
//!
//! 覆盖决策表、条件树、逻辑流解释执行以及编译 + 沙箱执行的完整链路，
//! 定义一律走 JSON 反序列化，贴近线上加载方式。

use ruleflow::{
    DecisionTable, DecisionTableEngine, ExecutionLog, LogicFlow, RegexCache, RuleError,
    SandboxRuntime, ScriptCache, ScriptCompiler, WorkflowInterpreter,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn table_engine() -> DecisionTableEngine {
    DecisionTableEngine::new(Arc::new(RegexCache::new()))
}

fn interpreter() -> WorkflowInterpreter {
    WorkflowInterpreter::new(Arc::new(RegexCache::new()))
}

/// 创建订单事实文档
fn create_order_fact() -> Value {
    json!({
        "customer": {
            "age": 34,
            "level": "gold",
            "blacklisted": false
        },
        "order": {
            "id": "ORD-20260830-001",
            "amount": 1500,
            "items": [
                {"sku": "TICKET-001", "price": 3, "qty": 2},
                {"sku": "FOOD-001", "price": 4, "qty": 1},
                {"sku": "GIFT-001", "price": 5, "qty": 8}
            ]
        }
    })
}

#[test]
fn test_decision_table_first_policy_end_to_end() {
    let table: DecisionTable = serde_json::from_value(json!({
        "id": "dt-age",
        "name": "age_gate",
        "hit_policy": "FIRST",
        "input_columns": [{"var_key": "customer.age"}],
        "output_columns": [{"var_key": "customer.segment"}],
        "rules": [
            [">=60", "senior"],
            [">=18", "adult"],
            ["-", "minor"]
        ]
    }))
    .unwrap();

    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    table_engine().evaluate(&table, &mut fact, &mut log).unwrap();

    assert_eq!(fact["customer"]["segment"], json!("adult"));
    assert!(log.contains_message("Hit Policy FIRST"));
}

#[test]
fn test_decision_table_any_conflict() {
    let table: DecisionTable = serde_json::from_value(json!({
        "id": "dt-any",
        "name": "conflicting",
        "hit_policy": "ANY",
        "input_columns": [{"var_key": "order.amount"}],
        "output_columns": [{"var_key": "order.tier"}],
        "rules": [
            [">=1000", "high"],
            [">=500", "low"]
        ]
    }))
    .unwrap();

    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    let err = table_engine()
        .evaluate(&table, &mut fact, &mut log)
        .unwrap_err();
    assert!(matches!(err, RuleError::HitPolicyViolation(_)));
}

#[test]
fn test_decision_table_priority_beats_row_order() {
    let table: DecisionTable = serde_json::from_value(json!({
        "id": "dt-prio",
        "name": "discount",
        "hit_policy": "PRIORITY",
        "input_columns": [{"var_key": "customer.level"}],
        "output_columns": [
            {"var_key": "order.discount"},
            {"var_key": "order.rank", "is_priority": true}
        ],
        "rules": [
            ["-", "0.05", "1"],
            ["gold", "0.20", "5"]
        ]
    }))
    .unwrap();

    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    table_engine().evaluate(&table, &mut fact, &mut log).unwrap();
    assert_eq!(fact["order"]["discount"], json!(0.2));
}

#[test]
fn test_decision_table_wildcard_rows_per_element() {
    let table: DecisionTable = serde_json::from_value(json!({
        "id": "dt-items",
        "name": "item_classifier",
        "hit_policy": "FIRST",
        "input_columns": [{"var_key": "order.items[*].qty"}],
        "output_columns": [{"var_key": "order.items[*].bulk"}],
        "rules": [
            [">=5", "true"],
            ["-", "false"]
        ]
    }))
    .unwrap();

    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    table_engine().evaluate(&table, &mut fact, &mut log).unwrap();

    assert_eq!(fact["order"]["items"][0]["bulk"], json!(false));
    assert_eq!(fact["order"]["items"][1]["bulk"], json!(false));
    assert_eq!(fact["order"]["items"][2]["bulk"], json!(true));
}

#[test]
fn test_quantified_wildcard_condition_in_workflow() {
    // AND 组内的通配叶子要求所有元素满足
    let flow: LogicFlow = serde_json::from_value(json!({
        "id": "wf-quant",
        "name": "qty_check",
        "steps": [{
            "type": "condition",
            "statement": {
                "type": "and",
                "children": [
                    {"type": "leaf", "var_key": "order.items[*].qty", "operator": "gt", "value": 0}
                ]
            },
            "true_children": [
                {"type": "assign", "target": {"var_key": "order.all_positive"}, "value": true}
            ],
            "false_children": [
                {"type": "assign", "target": {"var_key": "order.all_positive"}, "value": false}
            ]
        }]
    }))
    .unwrap();

    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    interpreter().execute(&flow, &mut fact, &mut log).unwrap();
    assert_eq!(fact["order"]["all_positive"], json!(true));

    let mut bad = create_order_fact();
    bad["order"]["items"][1]["qty"] = json!(0);
    interpreter().execute(&flow, &mut bad, &mut log).unwrap();
    assert_eq!(bad["order"]["all_positive"], json!(false));
}

fn sum_flow() -> LogicFlow {
    serde_json::from_value(json!({
        "id": "wf-sum",
        "name": "order_total",
        "steps": [
            {"type": "assign", "target": {"var_key": "order.total"}, "value": 0},
            {
                "type": "for_each",
                "source": {"var_key": "order.items"},
                "context_var": "it",
                "children": [{
                    "type": "array_op",
                    "target": {"var_key": "order.total"},
                    "operation": "ADD",
                    "value": "it.price",
                    "value_is_path": true
                }]
            }
        ]
    }))
    .unwrap()
}

#[test]
fn test_workflow_for_each_sum() {
    let flow = sum_flow();
    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    interpreter().execute(&flow, &mut fact, &mut log).unwrap();
    assert_eq!(fact["order"]["total"], json!(12));
    assert!(log.contains_message("for_each completed"));
}

#[test]
fn test_loop_context_restored_between_steps() {
    let flow: LogicFlow = serde_json::from_value(json!({
        "id": "wf-ctx",
        "name": "ctx_restore",
        "steps": [
            {
                "type": "for_each",
                "source": {"var_key": "order.items"},
                "context_var": "it",
                "children": [
                    {"type": "assign", "target": {"var_key": "it.touched"}, "value": true}
                ]
            },
            {"type": "assign", "target": {"var_key": "it"}, "value": "no longer a loop var"}
        ]
    }))
    .unwrap();

    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    interpreter().execute(&flow, &mut fact, &mut log).unwrap();

    for item in fact["order"]["items"].as_array().unwrap() {
        assert_eq!(item["touched"], json!(true));
    }
    assert_eq!(fact["it"], json!("no longer a loop var"));
}

#[test]
fn test_compile_is_byte_identical_and_cached() {
    let flow = sum_flow();
    let compiler = ScriptCompiler::new();

    let a = compiler.compile(&flow).unwrap();
    let b = compiler.compile(&flow).unwrap();
    assert_eq!(a.source, b.source);

    let cache = ScriptCache::new();
    let first = cache.get_or_compile(&compiler, &flow).unwrap();
    let second = cache.get_or_compile(&compiler, &flow).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_compiled_flow_matches_interpreter() {
    let flow = sum_flow();
    let fact = create_order_fact();

    let mut interpreted = fact.clone();
    let mut log = ExecutionLog::new();
    interpreter()
        .execute(&flow, &mut interpreted, &mut log)
        .unwrap();

    let script = ScriptCompiler::new().compile(&flow).unwrap();
    let runtime = SandboxRuntime::new(Arc::new(RegexCache::new()));
    let mut log = ExecutionLog::new();
    let compiled = runtime.execute(&script, fact, &mut log).unwrap();

    assert_eq!(interpreted["order"]["total"], compiled["order"]["total"]);
}

#[test]
fn test_sandbox_timeout_on_runaway_script() {
    let script = ruleflow::CompiledScript {
        flow_id: "runaway".to_string(),
        version: 1,
        source: "let log = [];\nlet n = 0;\nwhile true { n += 1; }\n".to_string(),
    };
    let runtime =
        SandboxRuntime::new(Arc::new(RegexCache::new())).with_timeout(Duration::from_millis(50));
    let mut log = ExecutionLog::new();
    let err = runtime.execute(&script, json!({}), &mut log).unwrap_err();
    assert!(matches!(err, RuleError::ExecutionTimeout(50)));
}

#[test]
fn test_execution_log_captures_cell_evaluations() {
    let table: DecisionTable = serde_json::from_value(json!({
        "id": "dt-log",
        "name": "logged",
        "hit_policy": "FIRST",
        "input_columns": [{"var_key": "customer.age"}],
        "output_columns": [{"var_key": "ok"}],
        "rules": [["18..65", "true"]]
    }))
    .unwrap();

    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    table_engine().evaluate(&table, &mut fact, &mut log).unwrap();

    assert!(log.contains_message("Evaluating Cell"));
    assert!(log.contains_message("Applying Hit Policy: FIRST"));
    // 时间戳单调：日志按发生顺序追加
    let entries = log.entries();
    for pair in entries.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn test_pipeline_table_then_workflow() {
    // 先用决策表定分层，再用逻辑流按分层算折扣
    let table: DecisionTable = serde_json::from_value(json!({
        "id": "dt-tier",
        "name": "tiering",
        "hit_policy": "FIRST",
        "input_columns": [{"var_key": "order.amount"}],
        "output_columns": [{"var_key": "order.tier"}],
        "rules": [
            [">=1000", "vip"],
            ["-", "standard"]
        ]
    }))
    .unwrap();

    let flow: LogicFlow = serde_json::from_value(json!({
        "id": "wf-discount",
        "name": "discounting",
        "steps": [{
            "type": "condition",
            "statement": {"type": "leaf", "var_key": "order.tier", "operator": "eq", "value": "vip"},
            "true_children": [
                {"type": "assign", "target": {"var_key": "order.discount"}, "value": 0.2}
            ],
            "false_children": [
                {"type": "assign", "target": {"var_key": "order.discount"}, "value": 0.0}
            ]
        }]
    }))
    .unwrap();

    let regex = Arc::new(RegexCache::new());
    let mut fact = create_order_fact();
    let mut log = ExecutionLog::new();
    DecisionTableEngine::new(regex.clone())
        .evaluate(&table, &mut fact, &mut log)
        .unwrap();
    WorkflowInterpreter::new(regex)
        .execute(&flow, &mut fact, &mut log)
        .unwrap();

    assert_eq!(fact["order"]["tier"], json!("vip"));
    assert_eq!(fact["order"]["discount"], json!(0.2));
}
