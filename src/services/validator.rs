//! 答案形状校验/纠偏服务 - 业务能力层
//!
//! 按题型强制答案的容器形状：能修则修（记 shape_note），不能修则置
//! null（记失效原因）。校验永不抛错——这是管线的最后一道防线，
//! 输出要么是该题型的合法形状，要么是显式的 null。
//!
//! 题型先过别名表解析为规范 [`QuestionKind`]，再查一次性构建的
//! 校验函数分发表。

use std::collections::HashMap;

use serde_json::Value;

use crate::models::{AnswerValue, GapFill, MatchPair, NormalizedAnswer, Question, QuestionKind};

/// 校验结论
enum Verdict {
    /// 形状正确，原样保留
    Valid(AnswerValue),
    /// 修复后的形状 + 纠偏说明
    Coerced(AnswerValue, &'static str),
    /// 无法修复，置 null
    Invalid(&'static str),
}

type ValidateFn = fn(&Question, AnswerValue) -> Verdict;

/// 答案形状校验器
pub struct AnswerValidator {
    table: HashMap<QuestionKind, ValidateFn>,
    answer_max_len: usize,
}

impl AnswerValidator {
    /// 构建分发表（每个进程一次）
    pub fn new(answer_max_len: usize) -> Self {
        let mut table: HashMap<QuestionKind, ValidateFn> = HashMap::new();
        table.insert(QuestionKind::Multichoice, validate_multichoice);
        table.insert(QuestionKind::Radio, validate_scalar);
        table.insert(QuestionKind::TrueFalse, validate_scalar);
        table.insert(QuestionKind::ShortAnswer, validate_scalar);
        table.insert(QuestionKind::Ordering, validate_ordering);
        table.insert(QuestionKind::Matching, validate_matching);
        table.insert(QuestionKind::GapSelect, validate_fixed_length);
        table.insert(QuestionKind::Ddwtos, validate_fixed_length);
        table.insert(QuestionKind::Cloze, validate_cloze);

        Self {
            table,
            answer_max_len,
        }
    }

    /// 校验一条归一化答案
    pub fn validate(&self, question: &Question, normalized: NormalizedAnswer) -> NormalizedAnswer {
        // null 答案（上游已兜底）原样保留
        if normalized.answer.is_null() {
            return normalized;
        }

        let kind = question.kind();
        let validate_fn = match self.table.get(&kind) {
            Some(f) => f,
            // 未知题型：放行，不校验
            None => return normalized,
        };

        let NormalizedAnswer {
            question_number,
            answer,
            error,
            ..
        } = normalized;

        match validate_fn(question, answer) {
            Verdict::Valid(answer) => NormalizedAnswer {
                question_number,
                answer: self.cap(answer),
                error,
                shape_note: None,
            },
            Verdict::Coerced(answer, note) => NormalizedAnswer {
                question_number,
                answer: self.cap(answer),
                error,
                shape_note: Some(note.to_string()),
            },
            Verdict::Invalid(note) => NormalizedAnswer {
                question_number,
                answer: AnswerValue::Null,
                error,
                shape_note: Some(note.to_string()),
            },
        }
    }

    /// 修剪并截断字符串字段，约束回传体积
    fn cap(&self, answer: AnswerValue) -> AnswerValue {
        let max = self.answer_max_len;
        match answer {
            AnswerValue::Text(s) => AnswerValue::Text(cap_string(s, max)),
            AnswerValue::Many(list) => {
                AnswerValue::Many(list.into_iter().map(|s| cap_string(s, max)).collect())
            }
            AnswerValue::Gaps(gaps) => AnswerValue::Gaps(
                gaps.into_iter()
                    .map(|g| GapFill {
                        placeholder_number: g.placeholder_number,
                        answer_text: cap_string(g.answer_text, max),
                    })
                    .collect(),
            ),
            AnswerValue::Pairs(pairs) => AnswerValue::Pairs(
                pairs
                    .into_iter()
                    .map(|p| MatchPair {
                        sub_question_text: cap_string(p.sub_question_text, max),
                        sub_answer_text: cap_string(p.sub_answer_text, max),
                    })
                    .collect(),
            ),
            other => other,
        }
    }
}

fn cap_string(s: String, max_len: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() > max_len {
        trimmed.chars().take(max_len).collect::<String>() + "…"
    } else {
        trimmed.to_string()
    }
}

/// 答案值 → 字符串数组（多选/排序/定长题共用）
fn as_string_list(answer: &AnswerValue) -> Option<Vec<String>> {
    match answer {
        AnswerValue::Many(list) => Some(list.clone()),
        AnswerValue::Other(Value::Array(items)) => items
            .iter()
            .map(|i| i.as_str().map(|s| s.trim().to_string()))
            .collect(),
        _ => None,
    }
}

// ========== 各题型校验函数 ==========

/// multichoice: 字符串数组；裸字符串包成单元素数组
fn validate_multichoice(_q: &Question, answer: AnswerValue) -> Verdict {
    match &answer {
        AnswerValue::Text(s) => Verdict::Coerced(
            AnswerValue::Many(vec![s.clone()]),
            "coerced_string_to_array",
        ),
        _ => match as_string_list(&answer) {
            Some(list) => Verdict::Valid(AnswerValue::Many(list)),
            None => Verdict::Invalid("invalid_shape"),
        },
    }
}

/// radio/truefalse/shortanswer: 单个字符串；数组取首元素
fn validate_scalar(_q: &Question, answer: AnswerValue) -> Verdict {
    match &answer {
        AnswerValue::Text(_) => Verdict::Valid(answer),
        _ => match as_string_list(&answer) {
            Some(list) => match list.into_iter().next() {
                Some(first) => {
                    Verdict::Coerced(AnswerValue::Text(first), "took_first_array_item")
                }
                None => Verdict::Invalid("invalid_shape"),
            },
            None => Verdict::Invalid("invalid_shape"),
        },
    }
}

/// ordering: 字符串数组，非数组即失效
fn validate_ordering(_q: &Question, answer: AnswerValue) -> Verdict {
    match as_string_list(&answer) {
        Some(list) if !list.is_empty() => Verdict::Valid(AnswerValue::Many(list)),
        _ => Verdict::Invalid("invalid_shape"),
    }
}

/// matching: 配对记录数组，非数组即失效
fn validate_matching(_q: &Question, answer: AnswerValue) -> Verdict {
    match &answer {
        AnswerValue::Pairs(_) => Verdict::Valid(answer),
        AnswerValue::Other(Value::Array(items)) => {
            let pairs: Option<Vec<MatchPair>> = items.iter().map(loose_pair).collect();
            match pairs {
                Some(pairs) if !pairs.is_empty() => Verdict::Valid(AnswerValue::Pairs(pairs)),
                _ => Verdict::Invalid("invalid_shape"),
            }
        }
        _ => Verdict::Invalid("invalid_shape"),
    }
}

/// 宽松对象 → 配对记录
fn loose_pair(v: &Value) -> Option<MatchPair> {
    let obj = v.as_object()?;
    let sub_question = obj
        .get("sub_question_text")
        .or_else(|| obj.get("question"))
        .or_else(|| obj.get("left"))?
        .as_str()?;
    let sub_answer = obj
        .get("sub_answer_text")
        .or_else(|| obj.get("answer"))
        .or_else(|| obj.get("right"))?
        .as_str()?;
    Some(MatchPair {
        sub_question_text: sub_question.trim().to_string(),
        sub_answer_text: sub_answer.trim().to_string(),
    })
}

/// gapselect/ddwtos: 字符串数组且长度 == 占位符数
fn validate_fixed_length(q: &Question, answer: AnswerValue) -> Verdict {
    match as_string_list(&answer) {
        Some(list) => {
            if list.len() == q.placeholders.len() {
                Verdict::Valid(AnswerValue::Many(list))
            } else {
                Verdict::Invalid("length_mismatch")
            }
        }
        None => Verdict::Invalid("invalid_shape"),
    }
}

/// cloze: 填空记录数组，可由字符串或宽松对象构造；长度必须对齐占位符
fn validate_cloze(q: &Question, answer: AnswerValue) -> Verdict {
    let gaps: Option<Vec<GapFill>> = match &answer {
        AnswerValue::Gaps(gaps) => Some(gaps.clone()),
        AnswerValue::Many(list) => Some(
            list.iter()
                .enumerate()
                .map(|(idx, s)| GapFill {
                    placeholder_number: (idx + 1) as u32,
                    answer_text: s.clone(),
                })
                .collect(),
        ),
        AnswerValue::Other(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| loose_gap(idx, item))
            .collect(),
        _ => None,
    };

    match gaps {
        Some(gaps) => {
            if gaps.len() == q.placeholders.len() {
                Verdict::Valid(AnswerValue::Gaps(gaps))
            } else {
                Verdict::Invalid("length_mismatch")
            }
        }
        None => Verdict::Invalid("invalid_shape"),
    }
}

/// 宽松元素 → 填空记录（字符串按位置编号，对象按常见键取值）
fn loose_gap(idx: usize, v: &Value) -> Option<GapFill> {
    if let Some(s) = v.as_str() {
        return Some(GapFill {
            placeholder_number: (idx + 1) as u32,
            answer_text: s.trim().to_string(),
        });
    }
    let obj = v.as_object()?;
    let number = obj
        .get("placeholder_number")
        .or_else(|| obj.get("placeholder"))
        .or_else(|| obj.get("number"))
        .and_then(|n| n.as_u64())
        .unwrap_or((idx + 1) as u64);
    let text = obj
        .get("answer_text")
        .or_else(|| obj.get("answer"))
        .or_else(|| obj.get("text"))?
        .as_str()?;
    Some(GapFill {
        placeholder_number: number as u32,
        answer_text: text.trim().to_string(),
    })
}
