//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_TURNS=40`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::OrchestratorError;
use crate::hydration::{HydrationWindow, DEFAULT_WINDOW};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub hydration: HydrationSection,
    pub delegation: DelegationSection,
    pub persistence: PersistenceSection,
    pub tools: ToolsSection,
}

/// [orchestrator] 段：回合上限、缓存窗口、基础 system prompt
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 每条语句的回合上限
    pub max_turns: u32,
    /// 每次请求后宣告的提示缓存有效期（秒）
    pub prompt_cache_secs: u64,
    pub system_prompt: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_turns: 25,
            prompt_cache_secs: 300,
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are Hive, a careful assistant. Use the available tools when they help, \
     and answer directly once the task is done."
        .to_string()
}

/// [hydration] 段：每个资源保留完整内容的次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HydrationSection {
    /// 按原始数值读入（整数或浮点），0、负数与小数在 validate 中拒绝
    pub resource_window: serde_json::Number,
}

impl Default for HydrationSection {
    fn default() -> Self {
        Self {
            resource_window: DEFAULT_WINDOW.into(),
        }
    }
}

impl HydrationSection {
    pub fn window(&self) -> Result<HydrationWindow, OrchestratorError> {
        let raw = &self.resource_window;
        if let Some(value) = raw.as_i64() {
            return HydrationWindow::try_from(value);
        }
        if let Some(value) = raw.as_u64() {
            return HydrationWindow::new(value as usize);
        }
        match raw.as_f64() {
            Some(value) => HydrationWindow::try_from(value),
            None => Err(OrchestratorError::InvalidInput(format!(
                "hydration window must be a positive integer, got {}",
                raw
            ))),
        }
    }
}

/// [delegation] 段：子代理批次
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelegationSection {
    pub max_concurrent: usize,
    /// 子代理语句的回合上限
    pub max_turns: u32,
    /// 收集结果后移除子代理交互
    pub cleanup_completed: bool,
}

impl Default for DelegationSection {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_turns: 10,
            cleanup_completed: true,
        }
    }
}

/// [persistence] 段：未设置 data_dir 时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PersistenceSection {
    pub data_dir: Option<PathBuf>,
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 反馈语句中单个工具响应的最大字符数
    pub max_result_chars: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            max_result_chars: 8000,
        }
    }
}

impl AppConfig {
    /// 校验并返回水合窗口
    pub fn validate(&self) -> Result<HydrationWindow, OrchestratorError> {
        if self.orchestrator.max_turns == 0 {
            return Err(OrchestratorError::InvalidInput(
                "orchestrator.max_turns must be at least 1".to_string(),
            ));
        }
        if self.delegation.max_turns == 0 {
            return Err(OrchestratorError::InvalidInput(
                "delegation.max_turns must be at least 1".to_string(),
            ));
        }
        self.hydration.window()
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
