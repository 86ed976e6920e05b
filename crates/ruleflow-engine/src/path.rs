//! 路径解析与文档读写
//!
//! 路径语法：点分段，每段可带一个 `[n]` 或 `[*]` 下标，例如
//! `order.items[*].price`。空串与 `$` 表示文档根。
//! 通配符读取收集所有命中元素，写入广播到所有元素。

use crate::error::{Result, RuleError};
use serde_json::Value;

/// 段下标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentIndex {
    /// 无下标，普通对象键
    None,
    /// 固定下标
    Fixed(usize),
    /// 通配符 `[*]`
    Wildcard,
}

/// 单个路径段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub key: String,
    pub index: SegmentIndex,
}

/// 解析后的路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub segments: Vec<Segment>,
    pub raw: String,
}

impl Path {
    /// 解析路径表达式
    pub fn parse(raw: &str) -> Result<Path> {
        if raw.is_empty() || raw == "$" {
            return Ok(Path {
                segments: Vec::new(),
                raw: raw.to_string(),
            });
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(RuleError::InvalidPath(raw.to_string()));
            }
            let (key, index) = match part.find('[') {
                Some(open) => {
                    if !part.ends_with(']') || open == 0 {
                        return Err(RuleError::InvalidPath(raw.to_string()));
                    }
                    let key = &part[..open];
                    let inner = &part[open + 1..part.len() - 1];
                    if inner.contains('[') || key.contains(']') {
                        return Err(RuleError::InvalidPath(raw.to_string()));
                    }
                    let index = if inner == "*" {
                        SegmentIndex::Wildcard
                    } else {
                        let n = inner
                            .parse::<usize>()
                            .map_err(|_| RuleError::InvalidPath(raw.to_string()))?;
                        SegmentIndex::Fixed(n)
                    };
                    (key.to_string(), index)
                }
                None => {
                    if part.contains(']') {
                        return Err(RuleError::InvalidPath(raw.to_string()));
                    }
                    (part.to_string(), SegmentIndex::None)
                }
            };
            segments.push(Segment { key, index });
        }

        Ok(Path {
            segments,
            raw: raw.to_string(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.index == SegmentIndex::Wildcard)
    }
}

/// 读取路径指向的值
///
/// 通配符路径返回命中元素组成的数组，解析失败的元素被跳过；
/// 普通路径在第一处缺失段返回 `PathNotFound`。
pub fn get(doc: &Value, path: &Path) -> Result<Value> {
    if path.is_root() {
        return Ok(doc.clone());
    }
    if path.has_wildcard() {
        let mut out = Vec::new();
        collect(doc, &path.segments, &mut out);
        return Ok(Value::Array(out));
    }
    get_concrete(doc, &path.segments, &path.raw).cloned()
}

fn get_concrete<'a>(doc: &'a Value, segments: &[Segment], raw: &str) -> Result<&'a Value> {
    let mut cur = doc;
    for seg in segments {
        cur = cur
            .get(&seg.key)
            .ok_or_else(|| RuleError::PathNotFound(raw.to_string()))?;
        if let SegmentIndex::Fixed(n) = seg.index {
            cur = cur
                .get(n)
                .ok_or_else(|| RuleError::PathNotFound(raw.to_string()))?;
        }
    }
    Ok(cur)
}

fn collect(doc: &Value, segments: &[Segment], out: &mut Vec<Value>) {
    let Some((seg, rest)) = segments.split_first() else {
        out.push(doc.clone());
        return;
    };
    let Some(inner) = doc.get(&seg.key) else {
        return;
    };
    match seg.index {
        SegmentIndex::None => collect(inner, rest, out),
        SegmentIndex::Fixed(n) => {
            if let Some(elem) = inner.get(n) {
                collect(elem, rest, out);
            }
        }
        SegmentIndex::Wildcard => {
            if let Value::Array(arr) = inner {
                for elem in arr {
                    collect(elem, rest, out);
                }
            }
        }
    }
}

/// 写入路径指向的位置
///
/// 中间对象不存在时自动创建；固定下标超出数组长度时用 null 填充；
/// 通配符广播到所有元素，对应数组缺失时静默跳过。根路径不可写。
pub fn set(doc: &mut Value, path: &Path, value: Value) -> Result<()> {
    if path.is_root() {
        return Err(RuleError::InvalidPath("不能对根路径赋值".to_string()));
    }
    set_inner(doc, &path.segments, &value, &path.raw)
}

fn set_inner(doc: &mut Value, segments: &[Segment], value: &Value, raw: &str) -> Result<()> {
    let (seg, rest) = segments
        .split_first()
        .ok_or_else(|| RuleError::InvalidPath(raw.to_string()))?;

    if !doc.is_object() {
        *doc = Value::Object(serde_json::Map::new());
    }
    let map = doc
        .as_object_mut()
        .ok_or_else(|| RuleError::InvalidPath(raw.to_string()))?;

    match seg.index {
        SegmentIndex::None => {
            if rest.is_empty() {
                map.insert(seg.key.clone(), value.clone());
                return Ok(());
            }
            let child = map
                .entry(seg.key.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            set_inner(child, rest, value, raw)
        }
        SegmentIndex::Fixed(n) => {
            let child = map
                .entry(seg.key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !child.is_array() {
                *child = Value::Array(Vec::new());
            }
            let arr = child
                .as_array_mut()
                .ok_or_else(|| RuleError::InvalidPath(raw.to_string()))?;
            while arr.len() <= n {
                arr.push(Value::Null);
            }
            if rest.is_empty() {
                arr[n] = value.clone();
                Ok(())
            } else {
                set_inner(&mut arr[n], rest, value, raw)
            }
        }
        SegmentIndex::Wildcard => {
            let Some(child) = map.get_mut(&seg.key) else {
                return Ok(());
            };
            let Some(arr) = child.as_array_mut() else {
                return Ok(());
            };
            for elem in arr {
                if rest.is_empty() {
                    *elem = value.clone();
                } else {
                    set_inner(elem, rest, value, raw)?;
                }
            }
            Ok(())
        }
    }
}

/// 删除路径指向的键
///
/// 普通路径目标缺失时返回 `PathNotFound`；通配符路径跳过缺失分支，
/// 末段带通配符时清空目标数组。
pub fn delete(doc: &mut Value, path: &Path) -> Result<()> {
    if path.is_root() {
        return Err(RuleError::InvalidPath("不能删除根路径".to_string()));
    }
    if path.has_wildcard() {
        delete_wildcard(doc, &path.segments);
        return Ok(());
    }

    let (last, prefix) = path
        .segments
        .split_last()
        .ok_or_else(|| RuleError::InvalidPath(path.raw.clone()))?;
    let parent = get_mut_concrete(doc, prefix, &path.raw)?;
    match last.index {
        SegmentIndex::None => {
            let map = parent
                .as_object_mut()
                .ok_or_else(|| RuleError::PathNotFound(path.raw.clone()))?;
            map.remove(&last.key)
                .ok_or_else(|| RuleError::PathNotFound(path.raw.clone()))?;
            Ok(())
        }
        SegmentIndex::Fixed(n) => {
            let arr = parent
                .get_mut(&last.key)
                .and_then(Value::as_array_mut)
                .ok_or_else(|| RuleError::PathNotFound(path.raw.clone()))?;
            if n >= arr.len() {
                return Err(RuleError::PathNotFound(path.raw.clone()));
            }
            arr.remove(n);
            Ok(())
        }
        SegmentIndex::Wildcard => unreachable!("wildcard handled above"),
    }
}

fn delete_wildcard(doc: &mut Value, segments: &[Segment]) {
    let Some((seg, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        match seg.index {
            SegmentIndex::None => {
                if let Some(map) = doc.as_object_mut() {
                    map.remove(&seg.key);
                }
            }
            SegmentIndex::Fixed(n) => {
                if let Some(arr) = doc.get_mut(&seg.key).and_then(Value::as_array_mut)
                    && n < arr.len()
                {
                    arr.remove(n);
                }
            }
            SegmentIndex::Wildcard => {
                if let Some(arr) = doc.get_mut(&seg.key).and_then(Value::as_array_mut) {
                    arr.clear();
                }
            }
        }
        return;
    }
    let Some(inner) = doc.get_mut(&seg.key) else {
        return;
    };
    match seg.index {
        SegmentIndex::None => delete_wildcard(inner, rest),
        SegmentIndex::Fixed(n) => {
            if let Some(elem) = inner.get_mut(n) {
                delete_wildcard(elem, rest);
            }
        }
        SegmentIndex::Wildcard => {
            if let Some(arr) = inner.as_array_mut() {
                for elem in arr {
                    delete_wildcard(elem, rest);
                }
            }
        }
    }
}

/// 获取普通路径指向值的可变引用（不支持通配符）
pub fn get_mut<'a>(doc: &'a mut Value, path: &Path) -> Result<&'a mut Value> {
    if path.has_wildcard() {
        return Err(RuleError::InvalidPath(path.raw.clone()));
    }
    get_mut_concrete(doc, &path.segments, &path.raw)
}

fn get_mut_concrete<'a>(
    doc: &'a mut Value,
    segments: &[Segment],
    raw: &str,
) -> Result<&'a mut Value> {
    let mut cur = doc;
    for seg in segments {
        cur = cur
            .get_mut(&seg.key)
            .ok_or_else(|| RuleError::PathNotFound(raw.to_string()))?;
        if let SegmentIndex::Fixed(n) = seg.index {
            cur = cur
                .get_mut(n)
                .ok_or_else(|| RuleError::PathNotFound(raw.to_string()))?;
        }
    }
    Ok(cur)
}
