//! # ContextRegistry：宿主对象标识到执行上下文的映射
//!
//! ## 核心意图（Why）
//! - 以显式句柄 [`CmdletId`] 代替“按对象身份弱引用关联”，生命周期完全显式：
//!   首次使用时构造，宿主对象拆除时由 [`ExecutionAdapterContext::dispose`] 移除；
//!
//! ## 行为契约（What）
//! - `context_for`：存在即返回，不存在则原子地创建并登记；
//! - 上下文只持有注册表的 `Weak` 引用，注册表析构不会被上下文延长；
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` 条目守卫在持有期间会阻塞同分片写操作，本模块只在内部短暂持有。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;

use crate::{
    cancellation::CancellationToken, context::ExecutionAdapterContext, options::AdapterOptions,
};

static NEXT_CMDLET_ID: AtomicU64 = AtomicU64::new(1);

/// 宿主对象实例的稳定标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdletId(u64);

impl CmdletId {
    /// 分配进程内唯一的新标识。
    pub fn next() -> Self {
        Self(NEXT_CMDLET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 以外部给定的数值构造标识，调用方负责唯一性。
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 原始数值。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CmdletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmdlet#{}", self.0)
    }
}

/// 执行上下文注册表。
pub struct ContextRegistry {
    contexts: DashMap<CmdletId, Arc<ExecutionAdapterContext>>,
    options: AdapterOptions,
    parent: CancellationToken,
}

impl ContextRegistry {
    /// 创建注册表，新上下文沿用 `options`。
    pub fn new(options: AdapterOptions) -> Arc<Self> {
        Self::with_parent(options, CancellationToken::none())
    }

    /// 创建注册表，新上下文的作用域均链接到 `parent`。
    pub fn with_parent(options: AdapterOptions, parent: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            contexts: DashMap::new(),
            options,
            parent,
        })
    }

    /// 取得 `id` 对应的上下文，不存在时创建并登记。
    pub fn context_for(self: &Arc<Self>, id: CmdletId) -> Arc<ExecutionAdapterContext> {
        let entry = self.contexts.entry(id).or_insert_with(|| {
            tracing::debug!(cmdlet = %id, "execution adapter context created");
            Arc::new(ExecutionAdapterContext::build(
                id,
                self.options.clone(),
                self.parent.clone(),
                Arc::downgrade(self),
            ))
        });
        Arc::clone(entry.value())
    }

    /// 查询已登记的上下文。
    pub fn get(&self, id: CmdletId) -> Option<Arc<ExecutionAdapterContext>> {
        self.contexts.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// 是否登记了 `id`。
    pub fn contains(&self, id: CmdletId) -> bool {
        self.contexts.contains_key(&id)
    }

    /// 已登记的上下文数量。
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// 注册表是否为空。
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub(crate) fn forget(&self, id: CmdletId) {
        self.contexts.remove(&id);
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("contexts", &self.contexts.len())
            .field("label", &self.options.label)
            .finish()
    }
}
