//! `search_messages`: hybrid retrieval over the current chat's turn log.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext, ToolResult};

const EXCERPT_CHARS: usize = 200;

pub struct SearchMessages;

#[async_trait]
impl Tool for SearchMessages {
    fn name(&self) -> &'static str {
        "search_messages"
    }

    fn description(&self) -> &'static str {
        "Search earlier messages in this chat by meaning and keywords."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What to look for" },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum results, between 1 and 20 (default 5)"
                    }
                },
                "required": ["query"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(query) = args["query"].as_str() else {
            return ToolResult::error("query is required");
        };
        let limit = args["limit"].as_u64().unwrap_or(5).clamp(1, 20) as usize;

        let scored = match ctx
            .retriever
            .retrieve(ctx.chat_id, query, None, ctx.now_ts, limit)
        {
            Ok(s) => s,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        let ids: Vec<i64> = scored.iter().map(|s| s.turn_id).collect();
        let turns = match ctx.turns.get_turns(&ids) {
            Ok(t) => t,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        let results: Vec<Value> = scored
            .iter()
            .filter_map(|s| {
                let turn = turns.iter().find(|t| t.id == s.turn_id)?;
                let excerpt: String = turn.text.chars().take(EXCERPT_CHARS).collect();
                Some(json!({
                    "turn_id": turn.id,
                    "user_id": turn.user_id,
                    "timestamp": turn.ts,
                    "score": (s.score * 1000.0).round() / 1000.0,
                    "excerpt": excerpt,
                }))
            })
            .collect();

        ToolResult::ok(json!({ "status": "ok", "results": results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_context;
    use gryag_context::{NewTurn, Role};

    #[tokio::test]
    async fn finds_matching_messages() {
        let ctx = test_context();
        ctx.turns
            .add_turn(&NewTurn::text_only(
                ctx.chat_id,
                42,
                Role::User,
                "the deploy pipeline broke again",
                100,
            ))
            .unwrap();
        ctx.turns
            .add_turn(&NewTurn::text_only(ctx.chat_id, 42, Role::User, "lunch?", 101))
            .unwrap();

        let r = SearchMessages
            .execute(json!({ "query": "deploy pipeline" }), &ctx)
            .await;
        assert!(!r.is_error);
        let results = r.payload["results"].as_array().unwrap();
        assert!(!results.is_empty());
        assert!(results[0]["excerpt"].as_str().unwrap().contains("deploy"));
    }

    #[tokio::test]
    async fn missing_query_is_an_error() {
        let ctx = test_context();
        let r = SearchMessages.execute(json!({}), &ctx).await;
        assert!(r.is_error);
    }
}
