//! 正则与编译脚本缓存
//!
//! 两个缓存都是进程内并发安全结构：正则按模式串缓存，脚本按
//! `流程ID@版本` 缓存。定义变更后提升版本号即可使旧条目自然失效。

use crate::compiler::{CompiledScript, ScriptCompiler};
use crate::error::{Result, RuleError};
use crate::models::LogicFlow;
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 正则缓存 - 同一模式只编译一次
#[derive(Debug, Default)]
pub struct RegexCache {
    patterns: DashMap<String, Arc<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或编译正则，编译失败返回 `InvalidCondition`
    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Some(re) = self.patterns.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern).map_err(|e| {
            warn!("正则编译失败: pattern={}, error={}", pattern, e);
            RuleError::InvalidCondition(format!("无效的正则表达式 '{}': {}", pattern, e))
        })?;
        let re = Arc::new(re);
        self.patterns.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// 脚本缓存统计
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// 编译脚本缓存
#[derive(Debug, Default)]
pub struct ScriptCache {
    scripts: DashMap<String, Arc<CompiledScript>>,
    stats: RwLock<CacheStats>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CompiledScript>> {
        let hit = self.scripts.get(key).map(|s| s.clone());
        let mut stats = self.stats.write();
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    pub fn insert(&self, script: CompiledScript) -> Arc<CompiledScript> {
        let key = script.cache_key();
        let script = Arc::new(script);
        self.scripts.insert(key, script.clone());
        script
    }

    /// 取缓存脚本，未命中时编译并写入
    #[instrument(skip(self, compiler, flow), fields(flow_id = %flow.id))]
    pub fn get_or_compile(
        &self,
        compiler: &ScriptCompiler,
        flow: &LogicFlow,
    ) -> Result<Arc<CompiledScript>> {
        let key = format!("{}@{}", flow.id, flow.audit.version);
        if let Some(script) = self.get(&key) {
            return Ok(script);
        }
        info!("脚本缓存未命中，开始编译: {}", key);
        let script = compiler.compile(flow)?;
        Ok(self.insert(script))
    }

    pub fn remove(&self, key: &str) -> bool {
        self.scripts.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn clear(&self) {
        self.scripts.clear();
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_cache_reuses_compiled_pattern() {
        let cache = RegexCache::new();
        let a = cache.get_or_compile(r"^\d+$").unwrap();
        let b = cache.get_or_compile(r"^\d+$").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(a.is_match("12345"));
    }

    #[test]
    fn test_regex_cache_invalid_pattern() {
        let cache = RegexCache::new();
        let result = cache.get_or_compile(r"[unclosed");
        assert!(matches!(result, Err(RuleError::InvalidCondition(_))));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_script_cache_versioned_keys() {
        let cache = ScriptCache::new();
        let compiler = ScriptCompiler::new();
        let mut flow = LogicFlow::new("f", vec![]);
        flow.id = "flow-1".to_string();

        let first = cache.get_or_compile(&compiler, &flow).unwrap();
        let second = cache.get_or_compile(&compiler, &flow).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        // 版本提升后旧条目不再命中
        flow.audit.version = 2;
        let third = cache.get_or_compile(&compiler, &flow).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(cache.len(), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_script_cache_remove() {
        let cache = ScriptCache::new();
        let compiler = ScriptCompiler::new();
        let flow = LogicFlow::new("f", vec![]);
        let script = cache.get_or_compile(&compiler, &flow).unwrap();
        assert!(cache.remove(&script.cache_key()));
        assert!(cache.is_empty());
    }
}
