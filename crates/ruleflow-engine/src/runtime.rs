//! 沙箱运行时
//!
//! 每次执行创建全新的 rhai 引擎，脚本之间零共享。宿主通过 `on_progress`
//! 钩子检查墙钟超时，超出预算立即中断脚本并返回 `ExecutionTimeout`。
//! 事实文档以 `data` 变量注入，脚本自带 `log` 数组，两者在执行后读回。

use crate::compiler::CompiledScript;
use crate::error::{Result, RuleError};
use crate::models::ExecutionLog;
use crate::store::RegexCache;
use crate::workflow::ExternalCallHandler;
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// 脚本沙箱运行时
pub struct SandboxRuntime {
    timeout: Duration,
    regex: Arc<RegexCache>,
    external: Option<Arc<dyn ExternalCallHandler>>,
}

impl SandboxRuntime {
    pub fn new(regex: Arc<RegexCache>) -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            regex,
            external: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_external_handler(mut self, handler: Arc<dyn ExternalCallHandler>) -> Self {
        self.external = Some(handler);
        self
    }

    /// 在沙箱中执行编译脚本，返回更新后的事实文档
    ///
    /// 脚本自身的日志在执行后并入 `log`，即便脚本报错也不丢弃。
    #[instrument(skip(self, script, fact, log), fields(key = %script.cache_key()))]
    pub fn execute(
        &self,
        script: &CompiledScript,
        fact: Value,
        log: &mut ExecutionLog,
    ) -> Result<Value> {
        let engine = self.build_engine();

        let ast = engine
            .compile(&script.source)
            .map_err(|e| RuleError::CompilationFailure(e.to_string()))?;

        let data = to_dynamic(&fact).map_err(|e| RuleError::ExecutionError(e.to_string()))?;
        let mut scope = Scope::new();
        scope.push_dynamic("data", data);

        let started = Instant::now();
        let run_result = engine.run_ast_with_scope(&mut scope, &ast);
        drain_script_log(&scope, log);

        if let Err(e) = run_result {
            return Err(match *e {
                EvalAltResult::ErrorTerminated(..) => {
                    warn!(
                        "脚本执行超时: key={}, 预算 {} 毫秒",
                        script.cache_key(),
                        self.timeout.as_millis()
                    );
                    log.error(format!(
                        "Script terminated after exceeding {}ms timeout",
                        self.timeout.as_millis()
                    ));
                    RuleError::ExecutionTimeout(self.timeout.as_millis() as u64)
                }
                other => {
                    log.error(format!("Script execution failed: {}", other));
                    RuleError::ExecutionError(other.to_string())
                }
            });
        }
        info!(
            "脚本执行完成: key={}, 耗时 {:?}",
            script.cache_key(),
            started.elapsed()
        );

        let data = scope
            .get_value::<Dynamic>("data")
            .ok_or_else(|| RuleError::ExecutionError("脚本丢失了 data 变量".to_string()))?;
        from_dynamic(&data).map_err(|e| RuleError::ExecutionError(e.to_string()))
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();

        let deadline = Instant::now() + self.timeout;
        engine.on_progress(move |_| {
            if Instant::now() > deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        let regex = self.regex.clone();
        engine.register_fn("regex_match", move |s: &str, pattern: &str| {
            match regex.get_or_compile(pattern) {
                Ok(re) => re.is_match(s),
                Err(_) => false,
            }
        });

        engine.register_fn("is_truthy", |v: Dynamic| -> bool {
            if v.is_unit() {
                false
            } else if let Ok(b) = v.as_bool() {
                b
            } else if let Ok(i) = v.as_int() {
                i != 0
            } else if let Ok(f) = v.as_float() {
                f != 0.0
            } else if let Some(s) = v.read_lock::<rhai::ImmutableString>() {
                !s.is_empty()
            } else {
                true
            }
        });

        engine.register_fn("is_empty_value", |v: Dynamic| -> bool {
            if v.is_unit() {
                return true;
            }
            if let Some(s) = v.read_lock::<rhai::ImmutableString>() {
                let t = s.trim();
                return t.is_empty() || t == "null" || t == "undefined";
            }
            if let Some(arr) = v.read_lock::<rhai::Array>() {
                return arr.is_empty();
            }
            if let Some(map) = v.read_lock::<rhai::Map>() {
                return map.is_empty();
            }
            false
        });

        engine.register_fn("as_string", |v: Dynamic| -> String {
            if v.is_unit() { String::new() } else { v.to_string() }
        });

        engine.register_fn(
            "as_number",
            |v: Dynamic| -> std::result::Result<i64, Box<EvalAltResult>> {
                if let Ok(i) = v.as_int() {
                    return Ok(i);
                }
                if let Ok(f) = v.as_float() {
                    return Ok(f as i64);
                }
                if let Some(s) = v.read_lock::<rhai::ImmutableString>() {
                    if let Ok(f) = s.trim().parse::<f64>() {
                        return Ok(f as i64);
                    }
                }
                Err(format!("无法转换为 number: {}", v).into())
            },
        );

        engine.register_fn(
            "as_float",
            |v: Dynamic| -> std::result::Result<f64, Box<EvalAltResult>> {
                if let Ok(f) = v.as_float() {
                    return Ok(f);
                }
                if let Ok(i) = v.as_int() {
                    return Ok(i as f64);
                }
                if let Some(s) = v.read_lock::<rhai::ImmutableString>() {
                    if let Ok(f) = s.trim().parse::<f64>() {
                        return Ok(f);
                    }
                }
                Err(format!("无法转换为 float: {}", v).into())
            },
        );

        engine.register_fn(
            "as_bool",
            |v: Dynamic| -> std::result::Result<bool, Box<EvalAltResult>> {
                if let Ok(b) = v.as_bool() {
                    return Ok(b);
                }
                if let Some(s) = v.read_lock::<rhai::ImmutableString>() {
                    match s.trim().to_ascii_lowercase().as_str() {
                        "true" | "1" => return Ok(true),
                        "false" | "0" => return Ok(false),
                        _ => {}
                    }
                }
                Err(format!("无法转换为 boolean: {}", v).into())
            },
        );

        let external = self.external.clone();
        engine.register_fn(
            "external_call",
            move |method: &str,
                  url: &str,
                  payload: Dynamic|
                  -> std::result::Result<Dynamic, Box<EvalAltResult>> {
                let Some(handler) = &external else {
                    return Err("未配置外部调用处理器".to_string().into());
                };
                let payload: Value = from_dynamic(&payload)?;
                let result = handler
                    .invoke(method, url, &payload)
                    .map_err(|e| Box::<EvalAltResult>::from(e.to_string()))?;
                to_dynamic(&result)
            },
        );

        engine
    }
}

/// 把脚本内部的 log 数组并入执行日志
fn drain_script_log(scope: &Scope, log: &mut ExecutionLog) {
    let Some(entries) = scope.get_value::<rhai::Array>("log") else {
        return;
    };
    for entry in entries {
        log.info(entry.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ScriptCompiler;
    use crate::models::{AssignStep, ForEachStep, LogicFlow, VarRef, WorkflowStep};
    use crate::operators::ArrayOpKind;
    use serde_json::json;

    fn runtime() -> SandboxRuntime {
        SandboxRuntime::new(Arc::new(RegexCache::new()))
    }

    fn raw_script(source: &str) -> CompiledScript {
        CompiledScript {
            flow_id: "test".to_string(),
            version: 1,
            source: source.to_string(),
        }
    }

    #[test]
    fn test_executes_compiled_flow() {
        let flow = LogicFlow::new(
            "f",
            vec![WorkflowStep::Assign(AssignStep {
                target: VarRef::new("answer"),
                value: json!(42),
                value_is_path: false,
            })],
        );
        let script = ScriptCompiler::new().compile(&flow).unwrap();
        let mut log = ExecutionLog::new();
        let out = runtime().execute(&script, json!({}), &mut log).unwrap();
        assert_eq!(out["answer"], json!(42));
    }

    #[test]
    fn test_for_each_sum_matches_interpreter_semantics() {
        let flow = LogicFlow::new(
            "f",
            vec![
                WorkflowStep::Assign(AssignStep {
                    target: VarRef::new("total"),
                    value: json!(0),
                    value_is_path: false,
                }),
                WorkflowStep::ForEach(ForEachStep {
                    source: VarRef::new("items"),
                    context_var: "it".to_string(),
                    children: vec![WorkflowStep::ArrayOp(crate::models::ArrayOpStep {
                        target: VarRef::new("total"),
                        operation: ArrayOpKind::Add,
                        value: json!("it.price"),
                        value_is_path: true,
                        filters: vec![],
                    })],
                }),
            ],
        );
        let script = ScriptCompiler::new().compile(&flow).unwrap();
        let mut log = ExecutionLog::new();
        let fact = json!({"items": [{"price": 3}, {"price": 4}, {"price": 5}]});
        let out = runtime().execute(&script, fact, &mut log).unwrap();
        assert_eq!(out["total"], json!(12));
    }

    #[test]
    fn test_infinite_loop_hits_timeout() {
        let script = raw_script("let log = [];\nwhile true {}\n");
        let rt = runtime().with_timeout(Duration::from_millis(50));
        let mut log = ExecutionLog::new();
        let err = rt.execute(&script, json!({}), &mut log).unwrap_err();
        assert!(matches!(err, RuleError::ExecutionTimeout(50)));
    }

    #[test]
    fn test_syntax_error_is_compilation_failure() {
        let script = raw_script("let log = [;\n");
        let mut log = ExecutionLog::new();
        assert!(matches!(
            runtime().execute(&script, json!({}), &mut log),
            Err(RuleError::CompilationFailure(_))
        ));
    }

    #[test]
    fn test_script_log_merged_even_on_error() {
        let script = raw_script(
            "let log = [];\nlog.push(\"before failure\");\ndata.missing.deep = 1;\n",
        );
        let mut log = ExecutionLog::new();
        let result = runtime().execute(&script, json!({}), &mut log);
        assert!(matches!(result, Err(RuleError::ExecutionError(_))));
        assert!(log.contains_message("before failure"));
    }

    #[test]
    fn test_registered_helpers() {
        let script = raw_script(
            "let log = [];\n\
             data.re = regex_match(\"abc123\", \"^[a-z]+\\\\d+$\");\n\
             data.empty = is_empty_value(\"\");\n\
             data.truthy = is_truthy(5);\n\
             data.n = as_number(\"42.9\");\n",
        );
        let mut log = ExecutionLog::new();
        let out = runtime().execute(&script, json!({}), &mut log).unwrap();
        assert_eq!(out["re"], json!(true));
        assert_eq!(out["empty"], json!(true));
        assert_eq!(out["truthy"], json!(true));
        assert_eq!(out["n"], json!(42));
    }

    #[test]
    fn test_external_call_through_sandbox() {
        struct FakeHandler;
        impl ExternalCallHandler for FakeHandler {
            fn invoke(
                &self,
                _method: &str,
                _url: &str,
                payload: &Value,
            ) -> crate::error::Result<Value> {
                Ok(json!({"echo": payload["input"]}))
            }
        }
        let script = raw_script(
            "let log = [];\ndata.reply = external_call(\"POST\", \"http://x\", data);\n",
        );
        let rt = runtime().with_external_handler(Arc::new(FakeHandler));
        let mut log = ExecutionLog::new();
        let out = rt
            .execute(&script, json!({"input": "hi"}), &mut log)
            .unwrap();
        assert_eq!(out["reply"]["echo"], json!("hi"));
    }

    #[test]
    fn test_external_call_without_handler_fails_script() {
        let script = raw_script(
            "let log = [];\ndata.reply = external_call(\"GET\", \"http://x\", data);\n",
        );
        let mut log = ExecutionLog::new();
        assert!(matches!(
            runtime().execute(&script, json!({}), &mut log),
            Err(RuleError::ExecutionError(_))
        ));
    }
}
