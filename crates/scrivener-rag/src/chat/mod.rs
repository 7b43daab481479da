//! Query/chat surface: binds one user turn to cache-fronted retrieval
//! and grounded generation, then persists the conversation turn.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::CachedRetrieval;
use crate::error::{RagError, Result};
use crate::generation::{GenerationEngine, GenerationEvent, GenerationRequest, GenerationResult, Source};
use crate::storage::MetadataStore;
use crate::telemetry::Telemetry;
use crate::types::{Conversation, ConversationContext, Message, MessageRole};

const DEFAULT_AUDIENCE: &str = "Foundation";
const DEFAULT_SECTION: &str = "Narrative";
const DEFAULT_TONE: &str = "Professional";

pub struct TurnRequest {
    /// Existing conversation to continue, or None to start a new one.
    pub conversation_id: Option<Uuid>,
    pub query: String,
    pub top_k: Option<usize>,
    pub recency_weight: Option<f32>,
    /// Request-level overrides merged over the stored context blob.
    pub context: ConversationContext,
    pub custom_instructions: Option<String>,
    pub principal: String,
}

pub struct TurnOutcome {
    pub conversation_id: Uuid,
    pub sources: Vec<Source>,
    pub result: GenerationResult,
}

pub struct StreamingTurn {
    pub conversation_id: Uuid,
    pub sources: Vec<Source>,
    pub events: mpsc::Receiver<GenerationEvent>,
}

pub struct QueryService {
    retrieval: CachedRetrieval,
    generation: GenerationEngine,
    store: Arc<dyn MetadataStore>,
    telemetry: Arc<dyn Telemetry>,
    default_top_k: usize,
}

impl QueryService {
    pub fn new(
        retrieval: CachedRetrieval,
        generation: GenerationEngine,
        store: Arc<dyn MetadataStore>,
        telemetry: Arc<dyn Telemetry>,
        default_top_k: usize,
    ) -> Self {
        Self {
            retrieval,
            generation,
            store,
            telemetry,
            default_top_k,
        }
    }

    pub fn retrieval(&self) -> &CachedRetrieval {
        &self.retrieval
    }

    async fn load_or_create_conversation(&self, request: &TurnRequest) -> Result<Conversation> {
        if let Some(id) = request.conversation_id {
            return self
                .store
                .get_conversation(id)
                .await?
                .ok_or(RagError::NotFound {
                    resource: "conversation",
                    id: id.to_string(),
                });
        }
        let title = derive_title(&request.query);
        self.store
            .create_conversation(&title, &request.principal, &request.context)
            .await
    }

    /// Retrieval half of a turn, shared by both generation modes.
    async fn prepare(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<(Conversation, ConversationContext, Vec<Source>, GenerationRequest)> {
        self.telemetry.incr("chat.turns", 1);
        let conversation = self.load_or_create_conversation(request).await?;
        let context = conversation.context.merged_with(&request.context);

        let top_k = request.top_k.unwrap_or(self.default_top_k);
        let recency_weight = request.recency_weight.unwrap_or(0.0);
        let candidates = self
            .retrieval
            .retrieve(
                &request.query,
                top_k,
                context.filters.as_ref(),
                recency_weight,
                cancel,
            )
            .await?;

        if candidates.is_empty() {
            return Err(RagError::validation_field(
                "query",
                "No sources matched this query",
                "Broaden the query or relax the document filters",
            ));
        }

        let sources = Source::from_candidates(&candidates);
        let generation_request = GenerationRequest {
            query: request.query.clone(),
            audience: context.audience.clone().unwrap_or_else(|| DEFAULT_AUDIENCE.into()),
            section: context.section.clone().unwrap_or_else(|| DEFAULT_SECTION.into()),
            tone: context.tone.clone().unwrap_or_else(|| DEFAULT_TONE.into()),
            custom_instructions: request.custom_instructions.clone(),
        };
        Ok((conversation, context, sources, generation_request))
    }

    async fn persist_turn(
        &self,
        conversation_id: Uuid,
        query: &str,
        sources: &[Source],
        result: &GenerationResult,
    ) -> Result<()> {
        let now = Utc::now();
        let source_chunk_ids: Vec<String> = sources.iter().map(|s| s.chunk_id.clone()).collect();

        self.store
            .append_message(&Message {
                message_id: Uuid::new_v4(),
                conversation_id,
                role: MessageRole::User,
                content: query.to_string(),
                citations: Vec::new(),
                source_chunk_ids: Vec::new(),
                created_at: now,
            })
            .await?;
        self.store
            .append_message(&Message {
                message_id: Uuid::new_v4(),
                conversation_id,
                role: MessageRole::Assistant,
                content: result.text.clone(),
                citations: result.citations.cited_sources.clone(),
                source_chunk_ids,
                created_at: Utc::now(),
            })
            .await?;
        self.store.touch_conversation(conversation_id).await?;
        Ok(())
    }

    /// One non-streaming turn: retrieve, generate, persist both
    /// messages, bump the conversation.
    pub async fn run_turn(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let (conversation, _context, sources, generation_request) =
            self.prepare(request, cancel).await?;

        if cancel.is_cancelled() {
            return Err(RagError::cancelled("chat_turn"));
        }
        let result = self.generation.generate(&generation_request, &sources).await?;

        self.persist_turn(conversation.conversation_id, &request.query, &sources, &result)
            .await?;

        Ok(TurnOutcome {
            conversation_id: conversation.conversation_id,
            sources,
            result,
        })
    }

    /// Streaming turn: deltas flow through as they arrive; the turn is
    /// persisted when the terminal `Done` event passes through.
    pub async fn stream_turn(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<StreamingTurn> {
        let (conversation, _context, sources, generation_request) =
            self.prepare(request, cancel).await?;

        let mut inner = self
            .generation
            .stream(&generation_request, &sources, cancel.clone())
            .await?;

        let (tx, rx) = mpsc::channel(256);
        let store = Arc::clone(&self.store);
        let conversation_id = conversation.conversation_id;
        let query = request.query.clone();
        let persist_sources = sources.clone();

        tokio::spawn(async move {
            while let Some(event) = inner.recv().await {
                let done = matches!(event, GenerationEvent::Done(_));
                if let GenerationEvent::Done(result) = &event {
                    persist_streamed(&store, conversation_id, &query, &persist_sources, result).await;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
                if done {
                    return;
                }
            }
        });

        Ok(StreamingTurn {
            conversation_id,
            sources,
            events: rx,
        })
    }
}

async fn persist_streamed(
    store: &Arc<dyn MetadataStore>,
    conversation_id: Uuid,
    query: &str,
    sources: &[Source],
    result: &GenerationResult,
) {
    let now = Utc::now();
    let user = Message {
        message_id: Uuid::new_v4(),
        conversation_id,
        role: MessageRole::User,
        content: query.to_string(),
        citations: Vec::new(),
        source_chunk_ids: Vec::new(),
        created_at: now,
    };
    let assistant = Message {
        message_id: Uuid::new_v4(),
        conversation_id,
        role: MessageRole::Assistant,
        content: result.text.clone(),
        citations: result.citations.cited_sources.clone(),
        source_chunk_ids: sources.iter().map(|s| s.chunk_id.clone()).collect(),
        created_at: Utc::now(),
    };
    if let Err(e) = store.append_message(&user).await {
        tracing::warn!(error = %e, "failed to persist user message");
    }
    if let Err(e) = store.append_message(&assistant).await {
        tracing::warn!(error = %e, "failed to persist assistant message");
    }
    store.touch_conversation(conversation_id).await.ok();
}

/// First words of the query, capped, as the conversation title.
fn derive_title(query: &str) -> String {
    let title: String = query.split_whitespace().take(8).collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        "New conversation".to_string()
    } else if title.chars().count() > 60 {
        title.chars().take(57).collect::<String>() + "..."
    } else {
        title
    }
}
