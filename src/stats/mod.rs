//! 统计层：回合/语句计数、Token 用量、工具使用统计与全局汇总
//!
//! 三个嵌套计数器（语句内回合数、交互累计回合数、语句数）+ 累计 Token 用量。
//! StatsAggregator 是计数的唯一权威来源；Interaction 上的 stats 字段只是它写回的缓存。
//! 全局视图每次变化后对所有已跟踪交互重新求和，而非增量累加，移除交互后不会漂移。

use std::collections::{BTreeMap, HashMap};
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// 单个交互的计数器快照（随每条 Message 一起保存）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionStats {
    /// 已处理的语句数
    pub statement_count: u32,
    /// 当前语句内已进行的回合数（每条新语句归零）
    pub statement_turn_count: u32,
    /// 交互累计回合数
    pub interaction_turn_count: u32,
}

/// Token 用量；cache/thought 字段仅在后端提供时出现
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, creation: u64, read: u64) -> Self {
        self.cache_creation_input_tokens = Some(creation);
        self.cache_read_input_tokens = Some(read);
        self
    }

    pub fn with_thought_tokens(mut self, thought: u64) -> Self {
        self.thought_tokens = Some(thought);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn add_optional(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

impl AddAssign<&TokenUsage> for TokenUsage {
    fn add_assign(&mut self, rhs: &TokenUsage) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.total_tokens += rhs.total_tokens;
        self.cache_creation_input_tokens =
            add_optional(self.cache_creation_input_tokens, rhs.cache_creation_input_tokens);
        self.cache_read_input_tokens =
            add_optional(self.cache_read_input_tokens, rhs.cache_read_input_tokens);
        self.thought_tokens = add_optional(self.thought_tokens, rhs.thought_tokens);
    }
}

impl Add<&TokenUsage> for TokenUsage {
    type Output = TokenUsage;

    fn add(mut self, rhs: &TokenUsage) -> TokenUsage {
        self += rhs;
        self
    }
}

/// 单个工具的调用计数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTally {
    pub invocations: u32,
    pub successes: u32,
    pub failures: u32,
}

/// 按工具名统计调用/成功/失败次数，并记录最近一次调用
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsageStats {
    pub tools: BTreeMap<String, ToolTally>,
    pub last_tool: Option<String>,
    pub last_success: Option<bool>,
}

impl ToolUsageStats {
    pub fn record(&mut self, tool: &str, success: bool) {
        let tally = self.tools.entry(tool.to_string()).or_default();
        tally.invocations += 1;
        if success {
            tally.successes += 1;
        } else {
            tally.failures += 1;
        }
        self.last_tool = Some(tool.to_string());
        self.last_success = Some(success);
    }

    pub fn total_invocations(&self) -> u32 {
        self.tools.values().map(|t| t.invocations).sum()
    }

    /// 进度头中的工具统计行，如 `echo: 3 calls (2 ok, 1 failed)`
    pub fn summary(&self) -> String {
        if self.tools.is_empty() {
            return "none".to_string();
        }
        self.tools
            .iter()
            .map(|(name, t)| {
                format!(
                    "{}: {} calls ({} ok, {} failed)",
                    name, t.invocations, t.successes, t.failures
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 资源访问计数（uri -> 次数）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAccessStats {
    pub accesses: BTreeMap<String, u32>,
}

impl ResourceAccessStats {
    pub fn record(&mut self, uri: &str) {
        *self.accesses.entry(uri.to_string()).or_insert(0) += 1;
    }

    pub fn summary(&self) -> String {
        if self.accesses.is_empty() {
            return "none".to_string();
        }
        self.accesses
            .iter()
            .map(|(uri, n)| format!("{} ({})", uri, n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// 单个交互在汇总器中的记录
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InteractionUsage {
    pub stats: InteractionStats,
    pub token_usage: TokenUsage,
}

/// 全局（编排器级）汇总：对所有跟踪中的交互求和
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorTotals {
    pub interaction_count: usize,
    pub statement_count: u64,
    pub interaction_turn_count: u64,
    pub token_usage: TokenUsage,
}

/// 计数与用量汇总器：回合/语句计数的唯一权威来源
#[derive(Debug, Default)]
pub struct StatsAggregator {
    per_interaction: HashMap<String, InteractionUsage>,
    totals: OrchestratorTotals,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始跟踪一个交互（新建时为零值，加载时为持久化的快照）
    pub fn track(&mut self, id: &str, stats: InteractionStats, token_usage: TokenUsage) {
        self.per_interaction
            .insert(id.to_string(), InteractionUsage { stats, token_usage });
        self.recompute();
    }

    /// 新语句：语句数 +1，语句内回合数归零
    pub fn begin_statement(&mut self, id: &str) -> InteractionStats {
        let entry = self.per_interaction.entry(id.to_string()).or_default();
        entry.stats.statement_count += 1;
        entry.stats.statement_turn_count = 0;
        let stats = entry.stats;
        self.recompute();
        stats
    }

    /// 一个回合：语句内回合数与交互累计回合数各 +1
    pub fn record_turn(&mut self, id: &str) -> InteractionStats {
        let entry = self.per_interaction.entry(id.to_string()).or_default();
        entry.stats.statement_turn_count += 1;
        entry.stats.interaction_turn_count += 1;
        let stats = entry.stats;
        self.recompute();
        stats
    }

    /// 累加一次 LLM 响应的 Token 用量，返回该交互的累计值
    pub fn record_usage(&mut self, id: &str, usage: &TokenUsage) -> TokenUsage {
        let entry = self.per_interaction.entry(id.to_string()).or_default();
        entry.token_usage += usage;
        let total = entry.token_usage.clone();
        self.recompute();
        total
    }

    pub fn forget(&mut self, id: &str) {
        if self.per_interaction.remove(id).is_some() {
            self.recompute();
        }
    }

    pub fn get(&self, id: &str) -> Option<&InteractionUsage> {
        self.per_interaction.get(id)
    }

    pub fn totals(&self) -> &OrchestratorTotals {
        &self.totals
    }

    fn recompute(&mut self) {
        let mut totals = OrchestratorTotals {
            interaction_count: self.per_interaction.len(),
            ..OrchestratorTotals::default()
        };
        for usage in self.per_interaction.values() {
            totals.statement_count += u64::from(usage.stats.statement_count);
            totals.interaction_turn_count += u64::from(usage.stats.interaction_turn_count);
            totals.token_usage += &usage.token_usage;
        }
        self.totals = totals;
    }
}
