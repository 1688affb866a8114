//! Conversational retrieval over the document store.
//!
//! Each question goes through three steps:
//!
//! 1. With prior turns in memory, the model rewrites the follow-up into a
//!    standalone question.
//! 2. The standalone question retrieves `retrieval.final_limit` chunks.
//! 3. The model answers from those chunks, and the exchange is appended
//!    to memory.
//!
//! `dchat chat` drives this from the terminal; `POST /chat` drives it with
//! history sent by the client.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::config::Config;
use crate::db;
use crate::migrate::migrate_pool;
use crate::llm::{ChatModel, OpenAiChat};
use crate::search::{retrieve_chunks, RetrievedChunk, SearchFilter, SearchMode};

pub use crate::llm::{ChatMessage, Role};

const CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language.\n\n\
Chat History:\n{chat_history}\nFollow Up Input: {question}\nStandalone question:";

const QA_SYSTEM_PROMPT: &str = "Use the following pieces of context to answer the user's \
question. If you don't know the answer, just say that you don't know, don't try to make up \
an answer.\n----------------\n{context}";

/// The last `max_turns` question/answer pairs.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    turns: VecDeque<(String, String)>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns,
        }
    }

    /// Rebuild memory from a client-side transcript. Each user message is
    /// paired with the assistant message that follows it; system messages
    /// and unanswered questions are ignored.
    pub fn from_history(history: &[ChatMessage], max_turns: usize) -> Self {
        let mut memory = Self::new(max_turns);
        let mut pending: Option<&str> = None;
        for message in history {
            match message.role {
                Role::User => pending = Some(&message.content),
                Role::Assistant => {
                    if let Some(question) = pending.take() {
                        memory.push(question, &message.content);
                    }
                }
                Role::System => {}
            }
        }
        memory
    }

    pub fn push(&mut self, question: &str, answer: &str) {
        if self.max_turns == 0 {
            return;
        }
        while self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back((question.to_string(), answer.to_string()));
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// `Human: …` / `Assistant: …` lines, oldest first.
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .map(|(q, a)| format!("Human: {}\nAssistant: {}", q, a))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>>;
}

/// Hybrid retrieval from the SQLite store.
pub struct StoreRetriever {
    pool: SqlitePool,
    config: Config,
    pub mode: SearchMode,
    pub filter: SearchFilter,
}

impl StoreRetriever {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        Self {
            pool,
            config,
            mode: SearchMode::Hybrid,
            filter: SearchFilter::default(),
        }
    }
}

#[async_trait]
impl Retriever for StoreRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>> {
        let k = self.config.retrieval.final_limit.max(1) as usize;
        retrieve_chunks(&self.pool, &self.config, query, self.mode, &self.filter, k).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSource {
    pub document_id: String,
    pub title: Option<String>,
    pub source_id: String,
    pub source_url: Option<String>,
    pub doc_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub standalone_question: String,
    pub sources: Vec<ChatSource>,
}

pub struct ConversationalRetrieval {
    model: Arc<dyn ChatModel>,
    retriever: Arc<dyn Retriever>,
    memory: ConversationMemory,
}

impl ConversationalRetrieval {
    pub fn new(
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        memory: ConversationMemory,
    ) -> Self {
        Self {
            model,
            retriever,
            memory,
        }
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub async fn ask(&mut self, question: &str) -> Result<ChatAnswer> {
        let standalone = if self.memory.is_empty() {
            question.to_string()
        } else {
            let prompt = CONDENSE_PROMPT
                .replace("{chat_history}", &self.memory.transcript())
                .replace("{question}", question);
            let rewritten = self.model.complete(&[ChatMessage::user(prompt)]).await?;
            tracing::debug!(%rewritten, "condensed follow-up question");
            match rewritten.trim() {
                "" => question.to_string(),
                q => q.to_string(),
            }
        };

        let chunks = self.retriever.retrieve(&standalone).await?;
        let context = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = [
            ChatMessage::system(QA_SYSTEM_PROMPT.replace("{context}", &context)),
            ChatMessage::user(standalone.clone()),
        ];
        let answer = self.model.complete(&messages).await?;

        self.memory.push(question, &answer);
        Ok(ChatAnswer {
            answer,
            standalone_question: standalone,
            sources: sources_of(&chunks),
        })
    }
}

/// One source per document, in retrieval order.
fn sources_of(chunks: &[RetrievedChunk]) -> Vec<ChatSource> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|c| seen.insert(c.document_id.as_str()))
        .map(|c| ChatSource {
            document_id: c.document_id.clone(),
            title: c.title.clone(),
            source_id: c.source_id.clone(),
            source_url: c.source_url.clone(),
            doc_type: c.doc_type.clone(),
        })
        .collect()
}

pub async fn count_documents(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?)
}

pub async fn run_chat(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    println!("Documents in store: {}", count_documents(&pool).await?);

    let model: Arc<dyn ChatModel> = Arc::new(OpenAiChat::from_config(&config.llm)?);
    let retriever = Arc::new(StoreRetriever::new(pool.clone(), config.clone()));
    let mut chain = ConversationalRetrieval::new(
        model,
        retriever,
        ConversationMemory::new(config.chat.max_history_turns),
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    chat_loop(&mut chain, stdin, &mut std::io::stdout()).await?;
    pool.close().await;
    Ok(())
}

/// Read questions line by line until `exit`, `quit` or end of input.
/// A failed question is reported and the loop continues.
pub async fn chat_loop<R, W>(
    chain: &mut ConversationalRetrieval,
    input: R,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    loop {
        write!(out, "> ")?;
        out.flush()?;
        let Some(line) = lines.next_line().await? else {
            writeln!(out)?;
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") || question.eq_ignore_ascii_case("quit") {
            break;
        }

        match chain.ask(question).await {
            Ok(reply) => {
                writeln!(out, "{}", reply.answer.trim())?;
                if !reply.sources.is_empty() {
                    writeln!(out, "sources:")?;
                    for source in &reply.sources {
                        match &source.source_url {
                            Some(url) => writeln!(out, "  - {} ({})", source.source_id, url)?,
                            None => writeln!(out, "  - {}", source.source_id)?,
                        }
                    }
                }
                writeln!(out)?;
            }
            Err(e) => writeln!(out, "error: {:#}", e)?,
        }
    }
    Ok(())
}
