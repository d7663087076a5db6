//! Hive 命令行入口
//!
//! 初始化日志、加载配置、组装编排器，然后逐行读取 stdin 作为语句处理（使用回显 LLM 客户端）。
//! 特殊命令：`:attach <path>` 附加文件资源，`:stats` 打印全局统计，`:quit` 退出。

use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{EventEnvelope, OrchestratorBuilder, StatementOptions};
use hive::interaction::ResourceAttachment;
use hive::llm::MockLlmClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EventEnvelope>();
    let orchestrator = OrchestratorBuilder::new(config)
        .with_llm(Arc::new(MockLlmClient))
        .with_event_sink(event_tx)
        .build()
        .context("Failed to build orchestrator")?;

    tokio::spawn(async move {
        while let Some(envelope) = event_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&envelope) {
                tracing::debug!(target: "events", "{}", json);
            }
        }
    });

    let conversation = orchestrator
        .create_conversation(None)
        .await
        .context("Failed to create conversation")?;
    let conversation_id = conversation.lock().await.id.clone();
    println!("conversation {} ready; type a statement (:quit to exit)", conversation_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            ":quit" | ":q" => break,
            ":stats" => {
                let totals = orchestrator.totals().await;
                println!("{}", serde_json::to_string_pretty(&totals)?);
                continue;
            }
            _ => {}
        }
        if let Some(path) = line.strip_prefix(":attach ") {
            let path = path.trim();
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let attachment = ResourceAttachment::text(path, content);
                    orchestrator
                        .attach_resources(&conversation_id, vec![attachment])
                        .await
                        .context("Failed to attach resource")?;
                    println!("attached {}", path);
                }
                Err(e) => eprintln!("cannot read {}: {}", path, e),
            }
            continue;
        }

        match orchestrator
            .handle_statement(line, &conversation_id, StatementOptions::default())
            .await
        {
            Ok(result) => {
                if let Some(thinking) = &result.thinking {
                    println!("(thinking) {}", thinking);
                }
                println!("{}", result.answer);
                println!(
                    "[statements: {}, turns: {}/{}, tokens: {}]",
                    result.stats.statement_count,
                    result.stats.statement_turn_count,
                    result.stats.interaction_turn_count,
                    result.token_usage.total_tokens
                );
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }

    Ok(())
}
