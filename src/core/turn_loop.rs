//! 语句状态机：一条语句 = 首个请求 + 若干回合（工具执行 → 反馈请求）
//!
//! 流程：
//! 1. 空语句直接拒绝（只发 error 事件，不动计数）
//! 2. 新对话首条语句：辅助调用生成标题
//! 3. 首条语句生成对话级目标；之后每条语句生成语句级目标
//! 4. 语句数 +1、语句内回合数归零，发 ready 事件
//! 5. 首个请求携带原始语句，失败即整条语句失败
//! 6. 首个响应后立刻持久化
//! 7. 有界循环：串行执行工具 → 组装反馈 → 下一请求；中途请求失败按 RecoveryEngine 降级或终止
//! 8. 结束时持久化，提取回答与 thinking 段
//!
//! 取消只在循环迭代边界检查，进行中的请求与工具不会被抢占。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::core::events::{OrchestratorEvent, RunPhase};
use crate::core::orchestrator::{Orchestrator, StatementResult};
use crate::core::recovery::DEGRADED_RESPONSE;
use crate::core::{OrchestratorError, RecoveryAction};
use crate::interaction::{
    resource_placeholder, ContentPart, Interaction, InteractionKind, Message, Role,
};
use crate::llm::{LlmRequest, LlmResponse, RequestOptions, RequestPurpose};
use crate::tools::{AgentDelegator, ToolContext, ToolOutcome};

const TITLE_SYSTEM_PROMPT: &str = "You name conversations. Reply with a short title only.";
const OBJECTIVE_SYSTEM_PROMPT: &str =
    "You state objectives. Reply with a single sentence describing the goal, nothing else.";
const MAX_TITLE_CHARS: usize = 80;

/// 进行中的一条语句（每条语句一个，语句结束即丢弃）
struct OrchestrationRun {
    statement: String,
    max_turns: u32,
    /// 语句内已完成的回合数
    turn: u32,
    cancel: CancellationToken,
    /// 降级继续时待写入下一条反馈的提示
    pending_notice: Option<String>,
    cancelled: bool,
}

impl Orchestrator {
    /// top_level 为 false 时（委派的子语句）沿用当前取消令牌，不重置
    pub(crate) async fn run_statement(
        &self,
        text: &str,
        interaction_id: &str,
        max_turns: u32,
        top_level: bool,
    ) -> Result<StatementResult, OrchestratorError> {
        let events = &self.inner.events;
        if text.trim().is_empty() {
            let err = OrchestratorError::empty_statement();
            events.emit(OrchestratorEvent::Error {
                interaction_id: Some(interaction_id.to_string()),
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
            return Err(err);
        }
        if max_turns == 0 {
            return Err(OrchestratorError::InvalidInput(
                "max_turns must be at least 1".to_string(),
            ));
        }
        let Some(shared) = self.inner.manager.get(interaction_id).await else {
            let err = OrchestratorError::not_found("interaction", interaction_id);
            tracing::warn!(interaction_id = %interaction_id, "statement for unknown interaction");
            events.emit(OrchestratorEvent::Error {
                interaction_id: Some(interaction_id.to_string()),
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
            return Err(err);
        };

        let cancel = if top_level {
            self.inner.supervisor.begin_operation()
        } else {
            self.inner.supervisor.current_token()
        };
        let mut run = OrchestrationRun {
            statement: text.to_string(),
            max_turns,
            turn: 0,
            cancel,
            pending_notice: None,
            cancelled: false,
        };

        // 整条语句期间独占该交互
        let mut interaction = shared.lock().await;
        tracing::info!(interaction_id = %interaction_id, max_turns, "statement started");

        if interaction.kind == InteractionKind::Conversation {
            if interaction.is_fresh() {
                self.synthesize_title(&mut interaction, &run.statement).await;
            }
            self.synthesize_objective(&mut interaction, &run.statement).await;
        }

        let stats = self.inner.stats.write().await.begin_statement(interaction_id);
        interaction.stats = stats;
        events.emit(OrchestratorEvent::Ready {
            interaction_id: interaction_id.to_string(),
            stats,
        });

        interaction.append_message(Message::user(vec![ContentPart::text(text)], stats));
        self.emit_status(interaction_id, RunPhase::Requesting, &run);
        let mut response = match self.request(&mut interaction, RequestPurpose::Statement).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(
                    interaction_id = %interaction_id,
                    error = %e,
                    "first request failed"
                );
                events.emit(OrchestratorEvent::Error {
                    interaction_id: Some(interaction_id.to_string()),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        let stats = interaction.stats;
        interaction.append_message(Message::assistant(response.to_message_content(), stats));
        self.persist(&interaction).await?;

        loop {
            if run.cancel.is_cancelled() {
                tracing::info!(
                    interaction_id = %interaction_id,
                    turn = run.turn,
                    "statement cancelled"
                );
                run.cancelled = true;
                events.emit(OrchestratorEvent::Cancelled {
                    interaction_id: interaction_id.to_string(),
                    turn: run.turn,
                });
                break;
            }
            if response.tool_invocations.is_empty() && run.pending_notice.is_none() {
                break;
            }
            if run.turn >= run.max_turns {
                tracing::warn!(
                    interaction_id = %interaction_id,
                    max_turns = run.max_turns,
                    "turn budget exhausted"
                );
                break;
            }
            run.turn += 1;

            self.emit_status(interaction_id, RunPhase::ToolHandling, &run);
            let feedback_id = uuid::Uuid::new_v4().to_string();
            let outcomes = self
                .run_tools(&mut interaction, &response, &run, &feedback_id)
                .await?;

            let stats = self.inner.stats.write().await.record_turn(interaction_id);
            interaction.stats = stats;

            let feedback =
                build_feedback(&interaction, &run, &outcomes, run.pending_notice.as_deref());
            run.pending_notice = None;
            let mut parts: Vec<ContentPart> =
                outcomes.iter().map(ToolOutcome::to_result_part).collect();
            parts.push(ContentPart::text(feedback));
            interaction.append_message(Message::with_id(feedback_id, Role::User, parts, stats));

            self.emit_status(interaction_id, RunPhase::Requesting, &run);
            response = match self.request(&mut interaction, RequestPurpose::ToolFeedback).await {
                Ok(resp) => resp,
                Err(e) => match self.inner.recovery.handle(&e, run.turn, run.max_turns) {
                    RecoveryAction::ContinueWithNotice(notice) => {
                        tracing::warn!(
                            interaction_id = %interaction_id,
                            turn = run.turn,
                            error = %e,
                            "request failed, continuing degraded"
                        );
                        run.pending_notice = Some(notice);
                        LlmResponse::from_text(DEGRADED_RESPONSE)
                    }
                    RecoveryAction::Abort => {
                        tracing::error!(
                            interaction_id = %interaction_id,
                            turn = run.turn,
                            error = %e,
                            "request failed on last turn"
                        );
                        events.emit(OrchestratorEvent::Error {
                            interaction_id: Some(interaction_id.to_string()),
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        });
                        // 已完成的回合仍需落盘，调用方收到的是原始错误
                        if let Err(pe) = self.persist(&interaction).await {
                            tracing::error!(error = %pe, "failed to persist after abort");
                        }
                        return Err(e);
                    }
                },
            };
            let stats = interaction.stats;
            interaction.append_message(Message::assistant(response.to_message_content(), stats));
        }

        self.emit_status(interaction_id, RunPhase::Done, &run);
        if let Some(usage) = self.inner.stats.read().await.get(interaction_id) {
            interaction.stats = usage.stats;
            interaction.token_usage = usage.token_usage.clone();
        }
        self.persist(&interaction).await?;

        let (answer, thinking) = extract_thinking(&response.text());
        let result = StatementResult {
            interaction_id: interaction_id.to_string(),
            answer,
            thinking,
            stats: interaction.stats,
            token_usage: interaction.token_usage.clone(),
            cancelled: run.cancelled,
        };
        events.emit(OrchestratorEvent::Answer {
            interaction_id: interaction_id.to_string(),
            answer: result.answer.clone(),
            stats: result.stats,
            token_usage: result.token_usage.clone(),
        });
        tracing::info!(
            interaction_id = %interaction_id,
            turns = result.stats.statement_turn_count,
            cancelled = result.cancelled,
            "statement finished"
        );
        Ok(result)
    }

    /// 按返回顺序串行执行本轮的全部工具调用
    async fn run_tools(
        &self,
        interaction: &mut Interaction,
        response: &LlmResponse,
        run: &OrchestrationRun,
        feedback_id: &str,
    ) -> Result<Vec<ToolOutcome>, OrchestratorError> {
        let delegator: Arc<dyn AgentDelegator> = Arc::new(self.clone());
        let ctx = ToolContext::new(interaction.id.clone(), run.turn)
            .with_cancel(run.cancel.clone())
            .with_delegator(delegator);

        let mut outcomes = Vec::with_capacity(response.tool_invocations.len());
        for invocation in &response.tool_invocations {
            tracing::info!(
                interaction_id = %interaction.id,
                tool = %invocation.name,
                turn = run.turn,
                "invoking tool"
            );
            self.inner.events.emit(OrchestratorEvent::ToolInvoked {
                interaction_id: interaction.id.clone(),
                tool: invocation.name.clone(),
                invocation_id: invocation.id.clone(),
                args: invocation.input.clone(),
            });

            let mut outcome = self.inner.executor.execute(interaction, invocation, &ctx).await;
            interaction.tool_usage.record(&invocation.name, outcome.success());

            // 工具产出的资源以反馈消息 id 为修订号，占位符嵌在 tool_result 中
            for attachment in std::mem::take(&mut outcome.result.attachments) {
                self.inner
                    .persistence
                    .store_resource_revision(
                        &interaction.id,
                        &attachment.uri,
                        feedback_id,
                        &attachment.content,
                    )
                    .await?;
                interaction.add_resource_revision(attachment.revision_metadata(feedback_id));
                outcome.result.result_parts.push(resource_placeholder(&attachment.uri));
            }

            tracing::info!(
                interaction_id = %interaction.id,
                tool = %invocation.name,
                success = outcome.success(),
                duration_ms = outcome.duration_ms,
                "tool finished"
            );
            self.inner.events.emit(OrchestratorEvent::ToolCompleted {
                interaction_id: interaction.id.clone(),
                tool: invocation.name.clone(),
                invocation_id: invocation.id.clone(),
                success: outcome.success(),
                preview: preview(&outcome.result.response_text),
            });
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// 经钩子准备并发出一次请求；成功后累计用量并发出缓存计时事件
    async fn request(
        &self,
        interaction: &mut Interaction,
        purpose: RequestPurpose,
    ) -> Result<LlmResponse, OrchestratorError> {
        let base = match purpose {
            RequestPurpose::Title => TITLE_SYSTEM_PROMPT,
            RequestPurpose::ConversationObjective | RequestPurpose::StatementObjective => {
                OBJECTIVE_SYSTEM_PROMPT
            }
            RequestPurpose::Statement | RequestPurpose::ToolFeedback => {
                self.inner.config.orchestrator.system_prompt.as_str()
            }
        };
        let hooks = interaction.kind.hooks();
        let request = LlmRequest {
            interaction_id: interaction.id.clone(),
            purpose,
            system: hooks.prepare_system_prompt(interaction, base),
            messages: hooks
                .prepare_messages(interaction, self.inner.persistence.as_ref(), self.inner.window)
                .await,
            tools: hooks.prepare_tools(interaction, self.inner.executor.definitions()),
            options: RequestOptions::default(),
        };
        tracing::debug!(
            interaction_id = %interaction.id,
            purpose = %purpose,
            client = self.inner.llm.name(),
            messages = request.messages.len(),
            "sending LLM request"
        );

        let response = self.inner.llm.send(&request).await?;
        interaction.token_usage = self
            .inner
            .stats
            .write()
            .await
            .record_usage(&interaction.id, &response.usage);
        self.inner.events.emit(OrchestratorEvent::CacheTimer {
            interaction_id: interaction.id.clone(),
            valid_for_secs: self.inner.config.orchestrator.prompt_cache_secs,
        });
        Ok(response)
    }

    /// 辅助调用：在对话的聊天子交互中发出一次请求，失败只记日志
    async fn secondary_call(
        &self,
        parent: &mut Interaction,
        purpose: RequestPurpose,
        prompt: String,
    ) -> Option<String> {
        let chat = match parent.chat_interaction_id.clone() {
            Some(id) => self.inner.manager.get(&id).await,
            None => None,
        };
        let chat = match chat {
            Some(chat) => chat,
            None => match self
                .create_interaction(InteractionKind::Chat, Some(&parent.id), Some("Assistant chat"))
                .await
            {
                Ok(chat) => {
                    parent.chat_interaction_id = Some(chat.lock().await.id.clone());
                    chat
                }
                Err(e) => {
                    tracing::warn!(
                        interaction_id = %parent.id,
                        error = %e,
                        "failed to create chat interaction"
                    );
                    return None;
                }
            },
        };

        let mut chat = chat.lock().await;
        let stats = chat.stats;
        chat.append_message(Message::user(vec![ContentPart::text(prompt)], stats));
        let response = match self.request(&mut chat, purpose).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(
                    interaction_id = %parent.id,
                    purpose = %purpose,
                    error = %e,
                    "secondary call failed"
                );
                return None;
            }
        };
        chat.append_message(Message::assistant(response.to_message_content(), stats));
        if let Err(e) = self.persist(&chat).await {
            tracing::warn!(
                interaction_id = %chat.id,
                error = %e,
                "failed to persist chat interaction"
            );
        }
        let text = clean_line(&response.text());
        (!text.is_empty()).then_some(text)
    }

    async fn synthesize_title(&self, interaction: &mut Interaction, statement: &str) {
        let prompt = format!(
            "Write a short title (at most six words) for a conversation \
             that begins with the statement below. Reply with the title only.\n\n{}",
            statement.trim()
        );
        let title = self
            .secondary_call(interaction, RequestPurpose::Title, prompt)
            .await
            .map(|t| t.chars().take(MAX_TITLE_CHARS).collect::<String>());
        if let Some(title) = &title {
            interaction.title = Some(title.clone());
        }
        self.inner.events.emit(OrchestratorEvent::NewInteraction {
            interaction_id: interaction.id.clone(),
            kind: interaction.kind,
            parent_id: interaction.parent_id.clone(),
            title,
        });
    }

    /// 首条语句生成对话级目标，之后每条语句生成语句级目标
    async fn synthesize_objective(&self, interaction: &mut Interaction, statement: &str) {
        if interaction.stats.statement_count == 0 {
            let prompt = format!(
                "State the overall objective of a conversation \
                 that begins with the statement below.\n\n{}",
                statement.trim()
            );
            if let Some(objective) = self
                .secondary_call(interaction, RequestPurpose::ConversationObjective, prompt)
                .await
            {
                interaction.objectives.conversation = Some(objective);
            }
            return;
        }

        let previous_answer = interaction
            .last_assistant_text()
            .map(|t| t.chars().take(500).collect::<String>())
            .unwrap_or_else(|| "none".to_string());
        let prompt = format!(
            "State the objective of the user's latest statement, given this context.\n\n\
             Conversation objective: {}\n\
             Previous statement objective: {}\n\
             Previous answer: {}\n\n{}",
            interaction.objectives.conversation.as_deref().unwrap_or("none"),
            interaction.objectives.current_statement().unwrap_or("none"),
            previous_answer,
            statement.trim()
        );
        if let Some(objective) = self
            .secondary_call(interaction, RequestPurpose::StatementObjective, prompt)
            .await
        {
            interaction.objectives.statements.push(objective);
        }
    }

    fn emit_status(&self, interaction_id: &str, phase: RunPhase, run: &OrchestrationRun) {
        self.inner.events.emit(OrchestratorEvent::Status {
            interaction_id: interaction_id.to_string(),
            phase,
            turn: run.turn,
            max_turns: run.max_turns,
        });
    }
}

/// 反馈语句：进度头（回合、目标、工具统计、资源统计）+ 各工具响应
fn build_feedback(
    interaction: &Interaction,
    run: &OrchestrationRun,
    outcomes: &[ToolOutcome],
    notice: Option<&str>,
) -> String {
    let mut s = format!("[Turn {}/{}]\n", run.turn, run.max_turns);
    s.push_str(&interaction.objectives.to_prompt_section());
    s.push_str(&format!("Tool usage: {}\n", interaction.tool_usage.summary()));
    s.push_str(&format!("Resources accessed: {}\n", interaction.resource_access.summary()));
    if let Some(notice) = notice {
        s.push('\n');
        s.push_str(notice);
        s.push('\n');
    }
    for outcome in outcomes {
        s.push_str(&format!(
            "\n--- {} ---\n{}\n",
            outcome.invocation.name, outcome.result.response_text
        ));
    }
    if run.turn >= run.max_turns {
        s.push_str("\nThis is the last turn; answer without calling more tools.\n");
    }
    s
}

fn thinking_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)<thinking>(.*?)</thinking>").ok())
        .as_ref()
}

/// 拆出全部 <thinking>…</thinking> 段：返回 (去掉 thinking 段后的回答, 拼接的 thinking)
pub fn extract_thinking(text: &str) -> (String, Option<String>) {
    let Some(pattern) = thinking_pattern() else {
        return (text.trim().to_string(), None);
    };
    let sections: Vec<String> = pattern
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let answer = pattern.replace_all(text, "").trim().to_string();
    let thinking = (!sections.is_empty()).then(|| sections.join("\n\n"));
    (answer, thinking)
}

fn clean_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

fn preview(text: &str) -> String {
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text.to_string()
    }
}
