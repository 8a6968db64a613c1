//! 外部协作者接口 - 业务能力层
//!
//! 这些能力由外部系统提供，本服务只消费其接口：
//! 凭据查询（持久层）、报表/指标存储（持久层）、图片压缩（原语）。
//! 生产部署把真实实现注入编排层；内存实现用于测试与单机运行。

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

/// 凭据查询结果
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
}

/// 凭据查询：不透明 bearer token -> 用户记录或 None
pub trait CredentialLookup: Send + Sync {
    fn lookup(&self, token: &str) -> Option<UserRecord>;
}

/// 内存凭据表
#[derive(Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<String, UserRecord>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, token: impl Into<String>, user: UserRecord) -> Self {
        self.users.insert(token.into(), user);
        self
    }
}

impl CredentialLookup for StaticCredentials {
    fn lookup(&self, token: &str) -> Option<UserRecord> {
        self.users.get(token).cloned()
    }
}

/// 报表/指标持久化：按不透明 id 增查改
pub trait ReportStore: Send + Sync {
    fn create(&self, id: &str, value: Value);
    fn read(&self, id: &str) -> Option<Value>;
    fn update(&self, id: &str, value: Value);
}

/// 内存报表存储
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportStore for MemoryReportStore {
    fn create(&self, id: &str, value: Value) {
        self.entries.lock().unwrap().insert(id.to_string(), value);
    }

    fn read(&self, id: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    fn update(&self, id: &str, value: Value) {
        self.entries.lock().unwrap().insert(id.to_string(), value);
    }
}

/// 图片压缩原语：超限图片 -> 阈值以下的小图（黑盒）
pub trait ImageShrinker: Send + Sync {
    fn shrink(&self, image_b64: &str) -> String;
}

/// 透传实现：仅告警，不做真实压缩
///
/// 真实部署注入外部压缩服务的客户端。
#[derive(Debug, Default)]
pub struct PassthroughShrinker;

impl ImageShrinker for PassthroughShrinker {
    fn shrink(&self, image_b64: &str) -> String {
        warn!(
            "图片压缩协作者未配置，{} 字节的图片原样透传",
            image_b64.len()
        );
        image_b64.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials::new().with_user(
            "tok-1",
            UserRecord {
                id: "u1".into(),
                name: "tester".into(),
            },
        );
        assert_eq!(creds.lookup("tok-1").unwrap().id, "u1");
        assert!(creds.lookup("tok-2").is_none());
    }

    #[test]
    fn test_memory_report_store_roundtrip() {
        let store = MemoryReportStore::new();
        store.create("r1", json!({"sessions": 1}));
        assert_eq!(store.read("r1").unwrap()["sessions"], 1);

        store.update("r1", json!({"sessions": 2}));
        assert_eq!(store.read("r1").unwrap()["sessions"], 2);
        assert!(store.read("r2").is_none());
    }
}
