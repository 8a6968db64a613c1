//! 响应归一化服务 - 业务能力层
//!
//! 把提供商千奇百怪的输出统一成规范的逐题答案列表。模型对格式指令的
//! 遵循度参差不齐，同一个提供商也会在数组、数字键对象、扁平对象、
//! 规范形态之间摇摆，这里按固定顺序逐一尝试：
//!
//! 1. 已是规范形态 `{"answers": [...]}` → 透传
//! 2. 普通数组 → 下标 + 1 映射为题号
//! 3. 全数字键对象 → 键映射为题号
//! 4. 非数字键扁平对象 → 按题号构造候选键查找
//!    （`question_<n>` / `q<n>` / `pregunta_<n>` / `<n>`）
//! 5. JSON 字符串 → 剥围栏后解析并递归
//!
//! 全部落空时每题补一条 `{answer: null, error: "no valid response"}`——
//! 归一化保证每道输入题都有且只有一条输出，绝不静默丢题。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::models::{AnswerValue, NormalizedAnswer, Question};

/// 全部落空时的兜底错误文案
const NO_VALID_RESPONSE: &str = "no valid response";

/// 递归解析 JSON 字符串的最大深度
const MAX_RECURSE: usize = 2;

/// 归一化提供商返回的原始文本
///
/// 文本先剥掉 markdown 代码围栏再按 JSON 解析；解析失败直接走兜底。
pub fn normalize_text(raw_text: &str, questions: &[Question]) -> Vec<NormalizedAnswer> {
    let stripped = strip_code_fences(raw_text);
    match serde_json::from_str::<Value>(stripped.trim()) {
        Ok(value) => normalize(&value, questions),
        Err(e) => {
            debug!("响应文本非 JSON ({}), 逐题兜底", e);
            all_null(questions, NO_VALID_RESPONSE)
        }
    }
}

/// 归一化任意形态的原始响应
///
/// 输出保证与 `questions` 等长且同序。
pub fn normalize(raw: &Value, questions: &[Question]) -> Vec<NormalizedAnswer> {
    let extracted = extract_answers(raw, questions, 0);
    reconcile(extracted, questions)
}

/// 依次尝试各形态，返回 题号 → (答案, 错误) 映射
fn extract_answers(
    raw: &Value,
    questions: &[Question],
    depth: usize,
) -> HashMap<u32, (AnswerValue, Option<String>)> {
    match raw {
        // 形态 1: 规范形态透传
        Value::Object(map) if map.contains_key("answers") => {
            let mut out = HashMap::new();
            if let Some(entries) = map.get("answers").and_then(|a| a.as_array()) {
                for entry in entries {
                    let number = entry
                        .get("question_number")
                        .or_else(|| entry.get("number"))
                        .and_then(|n| n.as_u64());
                    if let Some(number) = number {
                        let answer = entry.get("answer").map(value_to_answer).unwrap_or(AnswerValue::Null);
                        let error = entry
                            .get("error")
                            .and_then(|e| e.as_str())
                            .map(|s| s.to_string());
                        out.insert(number as u32, (answer, error));
                    }
                }
            }
            out
        }

        // 形态 2: 普通数组，下标 + 1 即题号——但要对齐到输入题号序列
        Value::Array(items) => {
            let mut out = HashMap::new();
            for (idx, item) in items.iter().enumerate() {
                let number = questions
                    .get(idx)
                    .map(|q| q.number)
                    .unwrap_or((idx + 1) as u32);
                out.insert(number, (value_to_answer(item), None));
            }
            out
        }

        Value::Object(map) => {
            // 形态 3: 全数字键对象
            let numeric: Option<Vec<(u32, &Value)>> = map
                .iter()
                .map(|(k, v)| k.trim().parse::<u32>().ok().map(|n| (n, v)))
                .collect();
            if let Some(pairs) = numeric {
                return pairs
                    .into_iter()
                    .map(|(n, v)| (n, (value_to_answer(v), None)))
                    .collect();
            }

            // 形态 4: 扁平对象，按题号构造候选键
            let mut out = HashMap::new();
            for q in questions {
                for key in [
                    format!("question_{}", q.number),
                    format!("q{}", q.number),
                    format!("pregunta_{}", q.number),
                    format!("{}", q.number),
                ] {
                    if let Some(v) = map.get(&key) {
                        out.insert(q.number, (value_to_answer(v), None));
                        break;
                    }
                }
            }
            out
        }

        // 形态 5: JSON 字符串，剥围栏后递归
        Value::String(text) if depth < MAX_RECURSE => {
            let stripped = strip_code_fences(text);
            match serde_json::from_str::<Value>(stripped.trim()) {
                Ok(inner) => extract_answers(&inner, questions, depth + 1),
                Err(_) => HashMap::new(),
            }
        }

        _ => HashMap::new(),
    }
}

/// 对齐输出：每道输入题恰好一条，顺序与输入一致
fn reconcile(
    mut extracted: HashMap<u32, (AnswerValue, Option<String>)>,
    questions: &[Question],
) -> Vec<NormalizedAnswer> {
    if extracted.is_empty() {
        return all_null(questions, NO_VALID_RESPONSE);
    }

    questions
        .iter()
        .map(|q| match extracted.remove(&q.number) {
            Some((answer, error)) => NormalizedAnswer {
                question_number: q.number,
                answer,
                error,
                shape_note: None,
            },
            None => NormalizedAnswer::null_with_error(q.number, "missing from response"),
        })
        .collect()
}

fn all_null(questions: &[Question], error: &str) -> Vec<NormalizedAnswer> {
    questions
        .iter()
        .map(|q| NormalizedAnswer::null_with_error(q.number, error))
        .collect()
}

/// JSON 值 → 答案值
///
/// 只做宽松转换；题型相关的形状纠偏在校验器里做。
fn value_to_answer(v: &Value) -> AnswerValue {
    match v {
        Value::Null => AnswerValue::Null,
        Value::String(s) => AnswerValue::Text(s.trim().to_string()),
        Value::Number(n) => AnswerValue::Text(n.to_string()),
        Value::Bool(b) => AnswerValue::Text(b.to_string()),
        Value::Array(items) => {
            let strings: Option<Vec<String>> = items
                .iter()
                .map(|i| i.as_str().map(|s| s.trim().to_string()))
                .collect();
            match strings {
                Some(list) => AnswerValue::Many(list),
                None => AnswerValue::Other(v.clone()),
            }
        }
        Value::Object(_) => AnswerValue::Other(v.clone()),
    }
}

/// 剥掉 markdown 代码围栏（```json ... ```）
fn strip_code_fences(text: &str) -> &str {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let re = FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").unwrap()
    });
    match re.captures(text) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(text),
        None => text.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn questions(n: u32) -> Vec<Question> {
        (1..=n)
            .map(|i| Question {
                number: i,
                qtype: "shortanswer".to_string(),
                text: format!("Q{}", i),
                options: vec![],
                images: vec![],
                placeholders: vec![],
            })
            .collect()
    }

    #[test]
    fn test_canonical_passthrough() {
        let qs = questions(2);
        let raw = json!({"answers": [
            {"question_number": 1, "answer": "four"},
            {"question_number": 2, "answer": "six"},
        ]});
        let out = normalize(&raw, &qs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].answer, AnswerValue::Text("four".into()));
        assert_eq!(out[1].answer, AnswerValue::Text("six".into()));
    }

    #[test]
    fn test_plain_array() {
        let qs = questions(2);
        let raw = json!(["four", "six"]);
        let out = normalize(&raw, &qs);
        assert_eq!(out[0].question_number, 1);
        assert_eq!(out[0].answer, AnswerValue::Text("four".into()));
        assert_eq!(out[1].question_number, 2);
    }

    #[test]
    fn test_numeric_keyed_object() {
        let qs = questions(2);
        let raw = json!({"1": "four", "2": "six"});
        let out = normalize(&raw, &qs);
        assert_eq!(out[0].answer, AnswerValue::Text("four".into()));
        assert_eq!(out[1].answer, AnswerValue::Text("six".into()));
    }

    #[test]
    fn test_flat_object_key_candidates() {
        let qs = questions(3);
        let raw = json!({"question_1": "a", "q2": "b", "pregunta_3": "c"});
        let out = normalize(&raw, &qs);
        assert_eq!(out[0].answer, AnswerValue::Text("a".into()));
        assert_eq!(out[1].answer, AnswerValue::Text("b".into()));
        assert_eq!(out[2].answer, AnswerValue::Text("c".into()));
    }

    #[test]
    fn test_json_string_recursion() {
        let qs = questions(1);
        let raw = json!("{\"answers\": [{\"question_number\": 1, \"answer\": \"four\"}]}");
        let out = normalize(&raw, &qs);
        assert_eq!(out[0].answer, AnswerValue::Text("four".into()));
    }

    #[test]
    fn test_fenced_text() {
        let qs = questions(1);
        let text = "```json\n{\"answers\": [{\"question_number\": 1, \"answer\": \"four\"}]}\n```";
        let out = normalize_text(text, &qs);
        assert_eq!(out[0].answer, AnswerValue::Text("four".into()));
    }

    #[test]
    fn test_garbage_falls_back_per_question() {
        let qs = questions(3);
        let out = normalize_text("I cannot answer that.", &qs);
        assert_eq!(out.len(), 3);
        for (i, a) in out.iter().enumerate() {
            assert_eq!(a.question_number, (i + 1) as u32);
            assert!(a.answer.is_null());
            assert_eq!(a.error.as_deref(), Some("no valid response"));
        }
    }

    #[test]
    fn test_missing_question_filled_in() {
        let qs = questions(3);
        let raw = json!({"answers": [
            {"question_number": 1, "answer": "a"},
            {"question_number": 3, "answer": "c"},
        ]});
        let out = normalize(&raw, &qs);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].question_number, 2);
        assert!(out[1].answer.is_null());
        assert!(out[1].error.is_some());
    }

    #[test]
    fn test_array_answer_becomes_many() {
        let qs = questions(1);
        let raw = json!({"answers": [{"question_number": 1, "answer": ["A", "B"]}]});
        let out = normalize(&raw, &qs);
        assert_eq!(out[0].answer, AnswerValue::Many(vec!["A".into(), "B".into()]));
    }

    #[test]
    fn test_loose_object_kept_for_validator() {
        let qs = questions(1);
        let raw = json!({"answers": [{"question_number": 1, "answer": [{"placeholder_number": 1, "answer_text": "x"}]}]});
        let out = normalize(&raw, &qs);
        assert!(matches!(out[0].answer, AnswerValue::Other(_)));
    }

    #[test]
    fn test_extra_answers_dropped() {
        let qs = questions(1);
        let raw = json!({"answers": [
            {"question_number": 1, "answer": "a"},
            {"question_number": 99, "answer": "ghost"},
        ]});
        let out = normalize(&raw, &qs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].question_number, 1);
    }
}
