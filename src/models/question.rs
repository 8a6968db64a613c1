//! 题目与答案数据模型
//!
//! `Question` 一经提交即不可变；`NormalizedAnswer` 是归一化与校验之后的
//! 规范形态：`answer` 要么是该题型的合法形状，要么为 `Null` 并带 `shape_note`。

use phf::phf_map;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 题目
///
/// `number` 是稳定的排序键，在一次请求内唯一。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub number: u32,
    /// 原始题型字符串（经别名表解析为 [`QuestionKind`]）
    #[serde(rename = "type")]
    pub qtype: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub placeholders: Vec<String>,
}

impl Question {
    /// 解析后的规范题型
    pub fn kind(&self) -> QuestionKind {
        QuestionKind::resolve(&self.qtype)
    }
}

/// 规范题型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionKind {
    Multichoice,
    Radio,
    TrueFalse,
    ShortAnswer,
    Ordering,
    Matching,
    GapSelect,
    Ddwtos,
    Cloze,
    /// 未知题型：校验器直接放行
    Unknown,
}

/// 题型别名表（别名 → 规范名）
///
/// 先查别名，再按规范名匹配。表在编译期构建。
static TYPE_ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "checkbox" => "multichoice",
    "multiselect" => "multichoice",
    "multi_choice" => "multichoice",
    "select" => "radio",
    "single_choice" => "radio",
    "true_false" => "truefalse",
    "short_text" => "shortanswer",
    "shorttext" => "shortanswer",
    "short_answer" => "shortanswer",
    "text" => "shortanswer",
    "order" => "ordering",
    "match" => "matching",
    "gap_select" => "gapselect",
    "dragdrop" => "ddwtos",
    "draganddrop" => "ddwtos",
    "multianswer" => "cloze",
};

impl QuestionKind {
    /// 别名解析 + 规范名匹配
    pub fn resolve(qtype: &str) -> Self {
        let normalized = qtype.trim().to_lowercase();
        let canonical = TYPE_ALIASES
            .get(normalized.as_str())
            .copied()
            .unwrap_or(normalized.as_str());

        match canonical {
            "multichoice" => QuestionKind::Multichoice,
            "radio" => QuestionKind::Radio,
            "truefalse" => QuestionKind::TrueFalse,
            "shortanswer" => QuestionKind::ShortAnswer,
            "ordering" => QuestionKind::Ordering,
            "matching" => QuestionKind::Matching,
            "gapselect" => QuestionKind::GapSelect,
            "ddwtos" => QuestionKind::Ddwtos,
            "cloze" => QuestionKind::Cloze,
            _ => QuestionKind::Unknown,
        }
    }
}

/// 填空记录（cloze 题型）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapFill {
    pub placeholder_number: u32,
    pub answer_text: String,
}

/// 配对记录（matching 题型）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    pub sub_question_text: String,
    pub sub_answer_text: String,
}

/// 答案值（按题型取不同容器形状）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Null,
    Text(String),
    Many(Vec<String>),
    Gaps(Vec<GapFill>),
    Pairs(Vec<MatchPair>),
    /// 未知题型放行的原始值，或待校验器纠偏的松散形状
    Other(Value),
}

impl AnswerValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AnswerValue::Null)
    }
}

/// 规范化后的单题答案
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedAnswer {
    pub question_number: u32,
    pub answer: AnswerValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_note: Option<String>,
}

impl NormalizedAnswer {
    /// 无有效响应时的兜底答案
    pub fn null_with_error(question_number: u32, error: impl Into<String>) -> Self {
        Self {
            question_number,
            answer: AnswerValue::Null,
            error: Some(error.into()),
            shape_note: None,
        }
    }
}

/// 批次：一次外呼携带的有序题目子列表
///
/// 仅在派发期间存在，受最大题数与估算 token 上限双重约束。
#[derive(Debug, Clone)]
pub struct Batch {
    pub questions: Vec<Question>,
    pub estimated_tokens: u32,
}

impl Batch {
    pub fn singleton(question: Question, estimated_tokens: u32) -> Self {
        Self {
            questions: vec![question],
            estimated_tokens,
        }
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_resolution() {
        assert_eq!(QuestionKind::resolve("checkbox"), QuestionKind::Multichoice);
        assert_eq!(QuestionKind::resolve("short_text"), QuestionKind::ShortAnswer);
        assert_eq!(QuestionKind::resolve("multichoice"), QuestionKind::Multichoice);
        assert_eq!(QuestionKind::resolve("TRUE_FALSE"), QuestionKind::TrueFalse);
        assert_eq!(QuestionKind::resolve("  radio  "), QuestionKind::Radio);
        assert_eq!(QuestionKind::resolve("essay"), QuestionKind::Unknown);
    }

    #[test]
    fn test_answer_value_serialization() {
        let null = serde_json::to_value(AnswerValue::Null).unwrap();
        assert!(null.is_null());

        let text = serde_json::to_value(AnswerValue::Text("A".into())).unwrap();
        assert_eq!(text, serde_json::json!("A"));

        let many = serde_json::to_value(AnswerValue::Many(vec!["A".into(), "B".into()])).unwrap();
        assert_eq!(many, serde_json::json!(["A", "B"]));

        let gaps = serde_json::to_value(AnswerValue::Gaps(vec![GapFill {
            placeholder_number: 1,
            answer_text: "x".into(),
        }]))
        .unwrap();
        assert_eq!(
            gaps,
            serde_json::json!([{"placeholder_number": 1, "answer_text": "x"}])
        );
    }

    #[test]
    fn test_question_deserialization_defaults() {
        let q: Question =
            serde_json::from_str(r#"{"number": 3, "type": "radio", "text": "2+2?"}"#).unwrap();
        assert_eq!(q.number, 3);
        assert!(q.options.is_empty());
        assert!(q.placeholders.is_empty());
        assert_eq!(q.kind(), QuestionKind::Radio);
    }
}
