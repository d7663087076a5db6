//! 编排事件：阶段变化、工具调用、回答、缓存计时器
//!
//! 每个事件包装为带序号的 EventEnvelope 发往通道；序号在编排器内单调递增，
//! 下游据此发现丢失或乱序。发送即忘：没有订阅者或接收端关闭都不影响编排。

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::interaction::InteractionKind;
use crate::stats::{InteractionStats, TokenUsage};

/// 回合循环阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Requesting,
    ToolHandling,
    Done,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// 首条语句生成标题后
    NewInteraction {
        interaction_id: String,
        kind: InteractionKind,
        parent_id: Option<String>,
        title: Option<String>,
    },
    /// 语句计数已更新，即将发出首个请求
    Ready {
        interaction_id: String,
        stats: InteractionStats,
    },
    Status {
        interaction_id: String,
        phase: RunPhase,
        turn: u32,
        max_turns: u32,
    },
    ToolInvoked {
        interaction_id: String,
        tool: String,
        invocation_id: String,
        args: serde_json::Value,
    },
    ToolCompleted {
        interaction_id: String,
        tool: String,
        invocation_id: String,
        success: bool,
        preview: String,
    },
    Answer {
        interaction_id: String,
        answer: String,
        stats: InteractionStats,
        token_usage: TokenUsage,
    },
    Cancelled {
        interaction_id: String,
        turn: u32,
    },
    /// 每次 LLM 请求后：提示缓存在此窗口内有效
    CacheTimer {
        interaction_id: String,
        valid_for_secs: u64,
    },
    InteractionDeleted {
        interaction_id: String,
        removed: Vec<String>,
    },
    Error {
        interaction_id: Option<String>,
        kind: String,
        message: String,
    },
}

impl OrchestratorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewInteraction { .. } => "new_interaction",
            Self::Ready { .. } => "ready",
            Self::Status { .. } => "status",
            Self::ToolInvoked { .. } => "tool_invoked",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::Answer { .. } => "answer",
            Self::Cancelled { .. } => "cancelled",
            Self::CacheTimer { .. } => "cache_timer",
            Self::InteractionDeleted { .. } => "interaction_deleted",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OrchestratorEvent,
}

pub type EventReceiver = mpsc::UnboundedReceiver<EventEnvelope>;

/// 事件发送端；并发的子代理共享同一序号空间
#[derive(Debug)]
pub struct EventEmitter {
    /// 上一个已分配的序号；分配与发送在同一把锁内，通道内顺序与序号一致
    last_seq: Mutex<u64>,
    sink: Option<mpsc::UnboundedSender<EventEnvelope>>,
}

impl EventEmitter {
    pub fn new(sink: Option<mpsc::UnboundedSender<EventEnvelope>>) -> Self {
        Self {
            last_seq: Mutex::new(0),
            sink,
        }
    }

    /// 创建发送端与对应的接收端
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Some(tx)), rx)
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// 发出事件并返回其序号
    pub fn emit(&self, event: OrchestratorEvent) -> u64 {
        let mut last = match self.last_seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last += 1;
        let seq = *last;
        tracing::debug!(seq, event = event.name(), "event");
        if let Some(sink) = &self.sink {
            let envelope = EventEnvelope {
                seq,
                timestamp: Utc::now(),
                event,
            };
            if sink.send(envelope).is_err() {
                tracing::debug!(seq, "event receiver dropped");
            }
        }
        seq
    }

    pub fn last_seq(&self) -> u64 {
        match self.last_seq.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let (emitter, mut rx) = EventEmitter::channel();
        for turn in 0..3 {
            emitter.emit(OrchestratorEvent::Status {
                interaction_id: "i".to_string(),
                phase: RunPhase::Requesting,
                turn,
                max_turns: 25,
            });
        }
        let mut seqs = Vec::new();
        while let Ok(env) = rx.try_recv() {
            seqs.push(env.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(emitter.last_seq(), 3);
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = EventEnvelope {
            seq: 7,
            timestamp: Utc::now(),
            event: OrchestratorEvent::CacheTimer {
                interaction_id: "i".to_string(),
                valid_for_secs: 300,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "cache_timer");
        assert_eq!(json["valid_for_secs"], 300);
    }

    #[test]
    fn test_disabled_emitter_still_counts() {
        let emitter = EventEmitter::disabled();
        assert_eq!(
            emitter.emit(OrchestratorEvent::Cancelled {
                interaction_id: "i".to_string(),
                turn: 1
            }),
            1
        );
    }
}
