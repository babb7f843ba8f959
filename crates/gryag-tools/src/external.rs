//! External HTTP tool integrations.
//!
//! Each tool has a narrow JSON contract and returns a JSON payload to the
//! model; failures are classified into the uniform error shape so the model
//! can respond gracefully. Image generation charges its per-user quota only
//! when a generation actually succeeds.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::tool::{PendingPoll, Tool, ToolContext, ToolResult};

fn http_error(tool: &str, e: &reqwest::Error) -> ToolResult {
    warn!(tool, error = %e, "external tool request failed");
    let reason = if e.is_timeout() {
        "upstream timed out"
    } else if e.is_connect() {
        "network error"
    } else {
        "upstream request failed"
    };
    ToolResult::error(reason)
}

// --- weather -----------------------------------------------------------------

pub struct Weather;

#[async_trait]
impl Tool for Weather {
    fn name(&self) -> &'static str {
        "weather"
    }

    fn description(&self) -> &'static str {
        "Current weather and a short forecast for a named place."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "location": { "type": "string", "description": "City or place name" }
                },
                "required": ["location"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(location) = args["location"].as_str() else {
            return ToolResult::error("location is required");
        };

        // Geocode, then fetch the forecast. Open-Meteo needs no API key.
        let geo_url = format!(
            "https://geocoding-api.open-meteo.com/v1/search?name={}&count=1",
            urlencode(location)
        );
        let geo: Value = match ctx.http.get(&geo_url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => return http_error(self.name(), &e),
            },
            Err(e) => return http_error(self.name(), &e),
        };
        let Some(place) = geo["results"].get(0) else {
            return ToolResult::error(format!("unknown location '{location}'"));
        };
        let (lat, lon) = (place["latitude"].clone(), place["longitude"].clone());

        let forecast_url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={lat}&longitude={lon}\
             &current=temperature_2m,apparent_temperature,precipitation,wind_speed_10m\
             &daily=temperature_2m_max,temperature_2m_min&forecast_days=2&timezone=auto"
        );
        let forecast: Value = match ctx.http.get(&forecast_url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => return http_error(self.name(), &e),
            },
            Err(e) => return http_error(self.name(), &e),
        };

        ToolResult::ok(json!({
            "status": "ok",
            "location": place["name"],
            "country": place["country"],
            "current": forecast["current"],
            "daily": forecast["daily"],
        }))
    }
}

// --- currency ----------------------------------------------------------------

pub struct Currency;

#[async_trait]
impl Tool for Currency {
    fn name(&self) -> &'static str {
        "currency"
    }

    fn description(&self) -> &'static str {
        "Convert an amount between two currencies at the current rate."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "from": { "type": "string", "description": "ISO code, e.g. USD" },
                    "to": { "type": "string", "description": "ISO code, e.g. UAH" },
                    "amount": { "type": "number", "description": "Amount to convert (default 1), must be positive" }
                },
                "required": ["from", "to"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let (Some(from), Some(to)) = (args["from"].as_str(), args["to"].as_str()) else {
            return ToolResult::error("from and to are required");
        };
        let amount = args["amount"].as_f64().unwrap_or(1.0);
        if amount <= 0.0 {
            return ToolResult::error("amount must be positive");
        }
        let from = from.to_uppercase();
        let to = to.to_uppercase();

        let url = format!("https://open.er-api.com/v6/latest/{}", urlencode(&from));
        let body: Value = match ctx.http.get(&url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => return http_error(self.name(), &e),
            },
            Err(e) => return http_error(self.name(), &e),
        };
        let Some(rate) = body["rates"][&to].as_f64() else {
            return ToolResult::error(format!("no rate for {from} → {to}"));
        };

        ToolResult::ok(json!({
            "status": "ok",
            "from": from,
            "to": to,
            "rate": rate,
            "amount": amount,
            "converted": amount * rate,
        }))
    }
}

// --- web search --------------------------------------------------------------

pub struct SearchWeb;

#[async_trait]
impl Tool for SearchWeb {
    fn name(&self) -> &'static str {
        "search_web"
    }

    fn description(&self) -> &'static str {
        "Search the web and return titles, links, and snippets."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "count": {
                        "type": "integer",
                        "description": "Result count, between 1 and 10 (default 5)"
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
        let count = args["count"].as_u64().unwrap_or(5).clamp(1, 10);
        let Some(key) = ctx.search_api_key.as_deref() else {
            return ToolResult::error("web search is not configured");
        };

        let url = format!(
            "https://api.search.brave.com/res/v1/web/search?q={}&count={count}",
            urlencode(query)
        );
        let resp = match ctx
            .http
            .get(&url)
            .header("X-Subscription-Token", key)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return http_error(self.name(), &e),
        };
        if resp.status().as_u16() == 429 {
            return ToolResult::error("search rate limit reached");
        }
        if !resp.status().is_success() {
            return ToolResult::error(format!("search failed with status {}", resp.status()));
        }
        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return http_error(self.name(), &e),
        };

        let results: Vec<Value> = body["web"]["results"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .take(count as usize)
                    .map(|r| {
                        json!({
                            "title": r["title"],
                            "url": r["url"],
                            "snippet": r["description"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        ToolResult::ok(json!({ "status": "ok", "results": results }))
    }
}

// --- image generation --------------------------------------------------------

pub struct GenerateImage;

#[async_trait]
impl Tool for GenerateImage {
    fn name(&self) -> &'static str {
        "generate_image"
    }

    fn description(&self) -> &'static str {
        "Generate an image from a text prompt and attach it to the reply."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "What the image should show" }
                },
                "required": ["prompt"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(prompt) = args["prompt"].as_str() else {
            return ToolResult::error("prompt is required");
        };
        let Some(key) = ctx.image_api_key.as_deref() else {
            return ToolResult::error("image generation is not configured");
        };

        // Quota gate (admins bypass); consumed only after a successful
        // generation so failures never burn the user's allowance.
        if !ctx.is_admin {
            if let Some(quota) = &ctx.image_quota {
                match quota.check(ctx.user_id, ctx.now_ts) {
                    Ok(decision) if !decision.allowed => {
                        return ToolResult::error(format!(
                            "image quota exhausted, retry in {}s",
                            decision.retry_after_secs
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => return ToolResult::error(e.to_string()),
                }
            }
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/imagen-3.0-generate-002:predict?key={key}"
        );
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": { "sampleCount": 1 },
        });
        let resp = match ctx.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return http_error(self.name(), &e),
        };
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let reason = if text.to_lowercase().contains("safety") {
                "prompt was blocked by safety filters".to_string()
            } else {
                format!("image generation failed with status {status}")
            };
            return ToolResult::error(reason);
        }
        let parsed: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return http_error(self.name(), &e),
        };
        let Some(b64) = parsed["predictions"][0]["bytesBase64Encoded"].as_str() else {
            return ToolResult::error("empty image response");
        };

        // Success: stash the image for the pipeline to attach, then charge.
        ctx.scratch
            .lock()
            .expect("scratch mutex poisoned")
            .pending_images
            .push(("image/png".to_string(), b64.to_string()));
        if !ctx.is_admin {
            if let Some(quota) = &ctx.image_quota {
                if let Err(e) = quota.consume(ctx.user_id, ctx.now_ts) {
                    warn!(error = %e, "image quota consume failed after success");
                }
            }
        }
        ToolResult::ok(json!({ "status": "ok", "note": "image generated and attached to the reply" }))
    }
}

// --- image editing -----------------------------------------------------------

pub struct EditImage;

#[async_trait]
impl Tool for EditImage {
    fn name(&self) -> &'static str {
        "edit_image"
    }

    fn description(&self) -> &'static str {
        "Edit the image attached to the current message according to a text \
         instruction, and attach the result to the reply."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "What to change in the image" }
                },
                "required": ["prompt"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(prompt) = args["prompt"].as_str() else {
            return ToolResult::error("prompt is required");
        };
        let Some(key) = ctx.image_api_key.as_deref() else {
            return ToolResult::error("image generation is not configured");
        };
        let Some((mime, data)) = ctx.current_images.first() else {
            return ToolResult::error("the current message has no image to edit");
        };

        if !ctx.is_admin {
            if let Some(quota) = &ctx.image_quota {
                match quota.check(ctx.user_id, ctx.now_ts) {
                    Ok(decision) if !decision.allowed => {
                        return ToolResult::error(format!(
                            "image quota exhausted, retry in {}s",
                            decision.retry_after_secs
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => return ToolResult::error(e.to_string()),
                }
            }
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-image:generateContent?key={key}"
        );
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": mime, "data": data } },
                ],
            }],
            "generationConfig": { "responseModalities": ["IMAGE", "TEXT"] },
        });
        let resp = match ctx.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return http_error(self.name(), &e),
        };
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let reason = if text.to_lowercase().contains("safety") {
                "edit was blocked by safety filters".to_string()
            } else {
                format!("image edit failed with status {status}")
            };
            return ToolResult::error(reason);
        }
        let parsed: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return http_error(self.name(), &e),
        };
        let edited = parsed["candidates"][0]["content"]["parts"]
            .as_array()
            .and_then(|parts| {
                parts
                    .iter()
                    .find_map(|p| p["inlineData"]["data"].as_str().map(String::from))
            });
        let Some(b64) = edited else {
            return ToolResult::error("empty edit response");
        };

        ctx.scratch
            .lock()
            .expect("scratch mutex poisoned")
            .pending_images
            .push(("image/png".to_string(), b64));
        if !ctx.is_admin {
            if let Some(quota) = &ctx.image_quota {
                if let Err(e) = quota.consume(ctx.user_id, ctx.now_ts) {
                    warn!(error = %e, "image quota consume failed after success");
                }
            }
        }
        ToolResult::ok(json!({ "status": "ok", "note": "edited image attached to the reply" }))
    }
}

// --- polls -------------------------------------------------------------------

pub struct Polls;

#[async_trait]
impl Tool for Polls {
    fn name(&self) -> &'static str {
        "polls"
    }

    fn description(&self) -> &'static str {
        "Create a poll in this chat."
    }

    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": {
                "type": "object",
                "properties": {
                    "question": { "type": "string", "description": "Poll question" },
                    "options": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Between 2 and 10 answer options"
                    },
                    "anonymous": { "type": "boolean", "description": "Hide voter identities (default true)" }
                },
                "required": ["question", "options"]
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(question) = args["question"].as_str() else {
            return ToolResult::error("question is required");
        };
        let options: Vec<String> = args["options"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if options.len() < 2 || options.len() > 10 {
            return ToolResult::error("a poll needs between 2 and 10 options");
        }

        ctx.scratch
            .lock()
            .expect("scratch mutex poisoned")
            .pending_poll = Some(PendingPoll {
            question: question.to_string(),
            options,
            is_anonymous: args["anonymous"].as_bool().unwrap_or(true),
        });
        ToolResult::ok(json!({ "status": "ok", "note": "poll will be sent after the reply" }))
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
