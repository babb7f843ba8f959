//! First-class memory tools: the model reads and writes the fact store
//! through these. Entity scoping rule: a negative `user_id` argument targets
//! chat-scoped facts (group knowledge), a positive one targets user facts.

use async_trait::async_trait;
use serde_json::{json, Value};

use gryag_memory::{EntityType, FactCategory, ForgetReason, ForgetStatus};

use crate::tool::{Tool, ToolContext, ToolResult};

fn entity_for(user_id: i64) -> (EntityType, i64) {
    if user_id < 0 {
        (EntityType::Chat, user_id)
    } else {
        (EntityType::User, user_id)
    }
}

fn parse_category(raw: Option<&str>) -> Result<FactCategory, ToolResult> {
    let raw = raw.unwrap_or("personal");
    raw.parse()
        .map_err(|_| ToolResult::error(format!("unknown fact_type '{raw}'")))
}

pub struct RememberFact;

#[async_trait]
impl Tool for RememberFact {
    fn name(&self) -> &'static str {
        "remember_fact"
    }

    fn description(&self) -> &'static str {
        "Store a new fact about a user or about this chat. Use when someone \
         states something durable about themselves or the group."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "user_id": {
                        "type": "integer",
                        "description": "Target user id; pass the chat id (negative) for chat-level facts"
                    },
                    "fact_type": {
                        "type": "string",
                        "enum": ["personal", "preference", "skill", "trait", "opinion",
                                 "relationship", "rule", "culture", "tradition", "norm",
                                 "topic", "event", "shared_knowledge"],
                        "description": "Category of the fact"
                    },
                    "fact_key": { "type": "string", "description": "Short normalised key, e.g. 'location'" },
                    "fact_value": { "type": "string", "description": "The fact itself" },
                    "confidence": {
                        "type": "number",
                        "description": "How certain you are, between 0.0 and 1.0"
                    },
                    "evidence": { "type": "string", "description": "Short quote supporting the fact" }
                },
                "required": ["user_id", "fact_type", "fact_key", "fact_value"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let user_id = args["user_id"].as_i64().unwrap_or(ctx.user_id);
        let (entity, entity_id) = entity_for(user_id);
        let category = match parse_category(args["fact_type"].as_str()) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let Some(key) = args["fact_key"].as_str() else {
            return ToolResult::error("fact_key is required");
        };
        let Some(value) = args["fact_value"].as_str() else {
            return ToolResult::error("fact_value is required");
        };
        let confidence = args["confidence"].as_f64().unwrap_or(0.8).clamp(0.0, 1.0);
        let evidence = args["evidence"].as_str();

        match ctx.facts.add_fact(
            entity,
            entity_id,
            &ctx.chat_id.to_string(),
            category,
            key,
            value,
            confidence,
            evidence,
            ctx.current_turn_id,
        ) {
            Ok(id) => ToolResult::ok(json!({ "status": "ok", "fact_id": id })),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

pub struct RecallFacts;

#[async_trait]
impl Tool for RecallFacts {
    fn name(&self) -> &'static str {
        "recall_facts"
    }

    fn description(&self) -> &'static str {
        "Retrieve stored facts about a user or this chat."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "user_id": {
                        "type": "integer",
                        "description": "Target user id; pass the chat id (negative) for chat-level facts"
                    },
                    "fact_types": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Optional category filter"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum facts to return, between 1 and 50 (default 10)"
                    }
                },
                "required": ["user_id"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let user_id = args["user_id"].as_i64().unwrap_or(ctx.user_id);
        let (entity, entity_id) = entity_for(user_id);
        let limit = args["limit"].as_u64().unwrap_or(10).clamp(1, 50) as usize;

        let categories: Option<Vec<FactCategory>> = args["fact_types"].as_array().map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse().ok())
                .collect()
        });

        match ctx.facts.get_facts(
            entity,
            entity_id,
            &ctx.chat_id.to_string(),
            categories.as_deref(),
            0.0,
            limit,
        ) {
            Ok(facts) => {
                let items: Vec<Value> = facts
                    .iter()
                    .map(|f| {
                        json!({
                            "fact_id": f.id,
                            "fact_type": f.category.to_string(),
                            "key": f.key,
                            "value": f.value,
                            "confidence": f.confidence,
                        })
                    })
                    .collect();
                ToolResult::ok(json!({ "status": "ok", "facts": items }))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

pub struct UpdateFact;

#[async_trait]
impl Tool for UpdateFact {
    fn name(&self) -> &'static str {
        "update_fact"
    }

    fn description(&self) -> &'static str {
        "Change the value or confidence of an existing fact by id."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "fact_id": { "type": "integer", "description": "Id returned by recall_facts" },
                    "new_value": { "type": "string", "description": "Replacement value" },
                    "new_confidence": {
                        "type": "number",
                        "description": "Replacement confidence, between 0.0 and 1.0"
                    },
                    "reason": { "type": "string", "description": "Why the fact changed" }
                },
                "required": ["fact_id", "reason"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(fact_id) = args["fact_id"].as_i64() else {
            return ToolResult::error("fact_id is required");
        };
        let new_value = args["new_value"].as_str();
        let new_confidence = args["new_confidence"].as_f64();
        if new_value.is_none() && new_confidence.is_none() {
            return ToolResult::error("provide new_value or new_confidence");
        }
        let reason = args["reason"].as_str().unwrap_or("updated by model");

        match ctx.facts.update_fact(fact_id, new_value, new_confidence, reason) {
            Ok(ForgetStatus::Success) => ToolResult::ok(json!({ "status": "ok" })),
            Ok(ForgetStatus::NotFound) => ToolResult::ok(json!({ "status": "not_found" })),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

pub struct ForgetFact;

#[async_trait]
impl Tool for ForgetFact {
    fn name(&self) -> &'static str {
        "forget_fact"
    }

    fn description(&self) -> &'static str {
        "Soft-delete a stored fact when it is wrong, outdated, or the user \
         asks to be forgotten."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "user_id": {
                        "type": "integer",
                        "description": "Target user id; pass the chat id (negative) for chat-level facts"
                    },
                    "fact_type": { "type": "string", "description": "Category of the fact to forget" },
                    "fact_key": { "type": "string", "description": "Key of the fact to forget" },
                    "reason": {
                        "type": "string",
                        "enum": ["outdated", "incorrect", "superseded", "user_requested"],
                        "description": "Why the fact is being forgotten"
                    }
                },
                "required": ["user_id", "fact_type", "fact_key", "reason"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let user_id = args["user_id"].as_i64().unwrap_or(ctx.user_id);
        let (entity, entity_id) = entity_for(user_id);
        let category = match parse_category(args["fact_type"].as_str()) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let Some(key) = args["fact_key"].as_str() else {
            return ToolResult::error("fact_key is required");
        };
        let reason: ForgetReason = args["reason"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(ForgetReason::Outdated);

        // Resolve the active fact for this key, then forget it.
        let found = ctx.facts.get_facts(
            entity,
            entity_id,
            &ctx.chat_id.to_string(),
            Some(&[category]),
            0.0,
            50,
        );
        let facts = match found {
            Ok(f) => f,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        let Some(target) = facts.iter().find(|f| f.key == key && !f.legacy) else {
            return ToolResult::ok(json!({ "status": "not_found" }));
        };

        match ctx.facts.forget_fact(target.id, reason) {
            Ok(ForgetStatus::Success) => {
                ToolResult::ok(json!({ "status": "ok", "fact_id": target.id }))
            }
            Ok(ForgetStatus::NotFound) => ToolResult::ok(json!({ "status": "not_found" })),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_context;

    #[tokio::test]
    async fn remember_then_recall() {
        let ctx = test_context();
        let r = RememberFact
            .execute(
                json!({
                    "user_id": 42,
                    "fact_type": "preference",
                    "fact_key": "location",
                    "fact_value": "kyiv",
                    "confidence": 0.9,
                    "evidence": "я живу в Києві"
                }),
                &ctx,
            )
            .await;
        assert!(!r.is_error, "{:?}", r.payload);
        assert_eq!(r.payload["status"], "ok");

        let r = RecallFacts
            .execute(json!({ "user_id": 42 }), &ctx)
            .await;
        assert_eq!(r.payload["facts"][0]["key"], "location");
        assert_eq!(r.payload["facts"][0]["value"], "kyiv");
    }

    #[tokio::test]
    async fn negative_user_id_targets_chat_facts() {
        let ctx = test_context();
        RememberFact
            .execute(
                json!({
                    "user_id": ctx.chat_id,
                    "fact_type": "rule",
                    "fact_key": "language policy",
                    "fact_value": "ukrainian only"
                }),
                &ctx,
            )
            .await;
        // Chat-scope recall sees it; user-scope does not.
        let chat = RecallFacts.execute(json!({ "user_id": ctx.chat_id }), &ctx).await;
        assert_eq!(chat.payload["facts"].as_array().unwrap().len(), 1);
        let user = RecallFacts.execute(json!({ "user_id": 42 }), &ctx).await;
        assert!(user.payload["facts"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forget_fact_matches_scenario() {
        let ctx = test_context();
        RememberFact
            .execute(
                json!({
                    "user_id": 42,
                    "fact_type": "preference",
                    "fact_key": "location",
                    "fact_value": "kyiv",
                    "confidence": 0.9
                }),
                &ctx,
            )
            .await;

        let args = json!({
            "user_id": 42,
            "fact_type": "preference",
            "fact_key": "location",
            "reason": "user_requested"
        });
        let first = ForgetFact.execute(args.clone(), &ctx).await;
        assert_eq!(first.payload["status"], "ok");

        // Repeat call: the row is already inactive.
        let second = ForgetFact.execute(args, &ctx).await;
        assert_eq!(second.payload["status"], "not_found");
    }

    #[tokio::test]
    async fn update_fact_not_found_status() {
        let ctx = test_context();
        let r = UpdateFact
            .execute(json!({ "fact_id": 999, "new_value": "x", "reason": "test" }), &ctx)
            .await;
        assert_eq!(r.payload["status"], "not_found");
    }

    #[tokio::test]
    async fn unknown_category_is_an_error() {
        let ctx = test_context();
        let r = RememberFact
            .execute(
                json!({ "user_id": 42, "fact_type": "vibes", "fact_key": "k", "fact_value": "v" }),
                &ctx,
            )
            .await;
        assert!(r.is_error);
    }

    #[test]
    fn declarations_use_primitive_schema_only() {
        for tool in [
            RememberFact.declaration(),
            RecallFacts.declaration(),
            UpdateFact.declaration(),
            ForgetFact.declaration(),
        ] {
            let text = tool.to_string();
            assert!(!text.contains("minimum"), "range keywords are rejected: {text}");
            assert!(!text.contains("maximum"), "range keywords are rejected: {text}");
        }
    }
}
