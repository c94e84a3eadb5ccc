//! 适配器配置。
//!
//! # 教案式说明
//! - **意图（Why）**：把“跨线程同步等待是否设上限”“是否捕获排队动作的 panic”等开放决策
//!   收拢为显式配置，而不是散落在调用点的魔法常量；
//! - **契约（What）**：所有字段均有默认值，`#[serde(default)]` 允许配置文件只写需要覆盖的键；
//!   `send_timeout_ms` 缺省表示无限等待。

use std::{borrow::Cow, time::Duration};

use serde::Deserialize;

#[cfg(feature = "config-file")]
use crate::error::AdapterError;

/// 执行适配器的运行参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterOptions {
    /// 诊断用名称，出现在日志字段 `adapter` 中。
    pub label: Cow<'static, str>,
    /// 非拥有线程发起同步请求时的最长等待毫秒数；`None` 表示无限等待。
    pub send_timeout_ms: Option<u64>,
    /// 是否把排队动作中的 panic 捕获为 `Fault`。关闭后 panic 将直接在拥有线程上展开。
    pub capture_panics: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            label: Cow::Borrowed("strand"),
            send_timeout_ms: None,
            capture_panics: true,
        }
    }
}

impl AdapterOptions {
    /// 以默认值构造。
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置诊断名称。
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    /// 为跨线程同步等待设置上限；传入 `None` 恢复无限等待。
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout_ms = timeout.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// 控制是否捕获排队动作中的 panic。
    pub fn with_capture_panics(mut self, capture: bool) -> Self {
        self.capture_panics = capture;
        self
    }

    /// 跨线程同步等待上限。
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    /// 从 TOML 文本解析配置。
    ///
    /// - **契约 (What)**：未知键视为参数错误；空文本得到默认配置。
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(text: &str) -> Result<Self, AdapterError> {
        toml::from_str(text).map_err(|err| AdapterError::InvalidArgument {
            name: "options",
            reason: Cow::Owned(err.to_string()),
        })
    }
}
