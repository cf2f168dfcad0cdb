use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// 配置文件路径环境变量
pub const CONFIG_ENV: &str = "GATEWAY_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "gateway.toml";

/// 网关配置
///
/// 从 TOML 文件加载，缺失的字段使用默认值；时间字段单位为毫秒。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// 发送给浏览器的显示名称
    pub title: String,
    /// RUST_LOG 未设置时使用的日志级别
    pub log_level: String,
    pub cameras_file: PathBuf,
    /// 未配置摄像头时自动发现 /dev/video*
    pub discover_v4l2: bool,
    /// 帧率检测结果出来之前假定的源帧率
    pub default_fps: u32,
    pub default_max_update_rate: f64,
    pub ping_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    /// 优雅终止子进程后等待多久再强制杀死
    pub termination_grace_ms: u64,
    /// 子进程崩溃后重启的基础退避时间
    pub restart_cooldown_ms: u64,
    pub max_restart_attempts: u32,
    pub probe_timeout_ms: u64,
    /// 每个客户端出站队列深度，满了直接丢弃
    pub client_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            title: "gateway".to_string(),
            log_level: "info".to_string(),
            cameras_file: PathBuf::from("cameras.toml"),
            discover_v4l2: true,
            default_fps: 30,
            default_max_update_rate: common::DEFAULT_MAX_UPDATE_RATE,
            ping_interval_ms: 1000,
            reconcile_interval_ms: 1000,
            termination_grace_ms: 2000,
            restart_cooldown_ms: 2000,
            max_restart_attempts: 5,
            probe_timeout_ms: 5000,
            client_queue_depth: 256,
        }
    }
}

impl Config {
    /// 加载配置：优先读取环境变量指定的文件，其次当前目录下的 gateway.toml
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            info!("No config file at {}, using defaults", path.display());
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_fps == 0 {
            bail!("default_fps must be greater than 0");
        }
        if self.default_max_update_rate.is_nan() || self.default_max_update_rate <= 0.0 {
            bail!("default_max_update_rate must be greater than 0");
        }
        if self.ping_interval_ms == 0 || self.reconcile_interval_ms == 0 {
            bail!("ping and reconcile intervals must be greater than 0");
        }
        if self.client_queue_depth == 0 {
            bail!("client_queue_depth must be greater than 0");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
