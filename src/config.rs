//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NECTAR__*` 覆盖（双下划线表示嵌套，
//! 如 `NECTAR__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub llm: LlmSection,
    pub search: SearchSection,
    pub fetch: FetchSection,
    pub agent: AgentSection,
}

/// [server] 段：监听端口
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点与模型
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 未设置时走官方端点
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

/// [search] 段：SERP API 端点、密钥与超时
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_search_endpoint() -> String {
    "https://google.serper.dev/search".to_string()
}

fn default_search_timeout_secs() -> u64 {
    30
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key: None,
            timeout_secs: default_search_timeout_secs(),
        }
    }
}

/// [fetch] 段：页面抓取超时与正文上限
#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

fn default_max_content_chars() -> usize {
    40_000
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

/// [agent] 段：步间退避与调试快照目录
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 相邻两步之间的退避毫秒数，缓解上游限流
    #[serde(default = "default_step_sleep_ms")]
    pub step_sleep_ms: u64,
    /// 设置后每步把 prompt / Schema / 消息写到该目录（仅排查用）
    #[serde(default)]
    pub debug_dir: Option<PathBuf>,
}

fn default_step_sleep_ms() -> u64 {
    100
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            step_sleep_ms: default_step_sleep_ms(),
            debug_dir: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 NECTAR__* 可覆盖
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{name}.toml");
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
        config::Environment::with_prefix("NECTAR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
