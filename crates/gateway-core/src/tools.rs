//! C7: Tool Runtime. Catalogue of MCP tool definitions and the `tools/call`
//! algorithm: bearer validation, upstream-token refresh, handler dispatch,
//! progress publication (spec §4.7).

use chrono::{Datelike, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::categorize::{normalise, NormalisedTransaction};
use crate::error::GatewayError;
use crate::model::{now, TokenExtra, UpstreamTokens};
use crate::server::AppState;
use crate::session::Session;
use crate::upstream::UpstreamClient;

const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 200;
const DEFAULT_QUERY_LIMIT: usize = 100;
const MAX_QUERY_LIMIT: usize = 500;
const DEFAULT_DAILY_BUDGET: f64 = 50.0;
const DEFAULT_MONTHLY_BUDGET: f64 = 1500.0;

pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub protected: bool,
}

pub fn catalogue() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "echo",
            description: "Echoes a message back. Useful for connectivity checks.",
            input_schema: json!({
                "type": "object",
                "properties": { "message": { "type": "string" } }
            }),
            protected: false,
        },
        ToolDefinition {
            name: "search",
            description: "Searches transactions by merchant or description text.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "maximum": 200 }
                }
            }),
            protected: true,
        },
        ToolDefinition {
            name: "fetch",
            description: "Fetches a single transaction by id.",
            input_schema: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"]
            }),
            protected: true,
        },
        ToolDefinition {
            name: "summary.today",
            description: "Summarises today's spending against a daily budget.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "currency": { "type": "string" },
                    "budget": { "type": "number" }
                }
            }),
            protected: true,
        },
        ToolDefinition {
            name: "projection.month",
            description: "Projects this month's spend against a monthly budget.",
            input_schema: json!({
                "type": "object",
                "properties": { "budget": { "type": "number" } }
            }),
            protected: true,
        },
        ToolDefinition {
            name: "transactions.query",
            description: "Lists transactions, optionally scoped to an account and date range.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "account_id": { "type": "string" },
                    "since": { "type": "string" },
                    "until": { "type": "string" },
                    "limit": { "type": "integer", "maximum": 500 }
                }
            }),
            protected: true,
        },
    ]
}

pub fn find(name: &str) -> Option<ToolDefinition> {
    catalogue().into_iter().find(|t| t.name == name)
}

pub fn list_json() -> Value {
    let tools: Vec<Value> = catalogue()
        .into_iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "inputSchema": t.input_schema }))
        .collect();
    json!({ "tools": tools })
}

/// Resolves the caller's upstream tokens from a bearer access token, refreshing
/// them in place if they are within 30s of expiry (spec §3, §4.7 step 3-4).
async fn resolve_upstream_tokens(
    state: &AppState,
    bearer: &str,
) -> Result<UpstreamTokens, GatewayError> {
    let production = state.config.enable_env.is_production();

    // Sandbox escape hatch (spec: development-mode accepts opaque
    // `eb_session_…` tokens with a synthetic `{client_id:"enable-sandbox",…}`
    // identity): the bearer itself becomes the upstream access token, with no
    // refresh token, so it is passed straight through to the sandbox ASPSP.
    if !production && bearer.starts_with("eb_session_") {
        tracing::debug!(target = "tools", client_id = "enable-sandbox", "sandbox escape hatch accepted");
        return Ok(UpstreamTokens { access_token: bearer.to_string(), refresh_token: None, expires_at: None });
    }

    let access = state
        .store
        .get_access_token(bearer)
        .ok_or_else(|| GatewayError::InvalidToken("invalid or expired access token".into()))?;

    let mut tokens = access
        .extra
        .enable_banking_tokens()
        .ok_or_else(|| {
            GatewayError::InvalidToken(
                "No Enable Banking consent found; re-run the OAuth connection flow".into(),
            )
        })?;

    if tokens.needs_refresh(now()) {
        let upstream = state
            .upstream
            .as_ref()
            .ok_or_else(|| GatewayError::Config("upstream banking client is not configured".into()))?;
        let refresh_token = tokens.refresh_token.clone().expect("needs_refresh implies refresh_token is Some");
        let refreshed = upstream.refresh(&refresh_token).await?;
        let extra = TokenExtra(access.extra.0.clone()).with_upstream_tokens(&refreshed);
        state.store.update_token_extra(bearer, extra).ok();
        tokens = refreshed;
    }

    Ok(tokens)
}

fn extract_bearer(auth_header: Option<&str>) -> Option<&str> {
    auth_header.and_then(|h| h.strip_prefix("Bearer "))
}

/// `tools/call` algorithm (spec §4.7).
pub async fn call_tool(
    state: &AppState,
    session: &Session,
    name: &str,
    arguments: Value,
    auth_header: Option<&str>,
) -> Result<Value, GatewayError> {
    let tool = find(name).ok_or(GatewayError::MethodNotFound)?;

    if !tool.protected {
        return run_unprotected(name, arguments);
    }

    let bearer = extract_bearer(auth_header).ok_or(GatewayError::AuthorizationRequired)?;
    let tokens = resolve_upstream_tokens(state, bearer).await?;
    let upstream = state
        .upstream
        .as_ref()
        .ok_or_else(|| GatewayError::Config("upstream banking client is not configured".into()))?;

    run_protected(state, bearer, session, name, arguments, upstream, &tokens).await
}

/// Persists a reactive mid-call refresh (triggered by `get_with_retry`'s
/// 401-then-refresh-then-retry-once) back onto the stored token pair, the
/// same way the proactive refresh in `resolve_upstream_tokens` does.
fn persist_refreshed_tokens(state: &AppState, bearer: &str, refreshed: &UpstreamTokens) {
    if let Some(access) = state.store.get_access_token(bearer) {
        let extra = access.extra.with_upstream_tokens(refreshed);
        state.store.update_token_extra(bearer, extra).ok();
    }
}

fn run_unprotected(name: &str, arguments: Value) -> Result<Value, GatewayError> {
    match name {
        "echo" => {
            let message = arguments
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("pong")
                .to_string();
            Ok(json!({ "content": [{ "type": "text", "text": message }] }))
        }
        _ => Err(GatewayError::MethodNotFound),
    }
}

async fn run_protected(
    state: &AppState,
    bearer: &str,
    session: &Session,
    name: &str,
    arguments: Value,
    upstream: &UpstreamClient,
    tokens: &UpstreamTokens,
) -> Result<Value, GatewayError> {
    match name {
        "search" => tool_search(state, bearer, session, arguments, upstream, tokens).await,
        "fetch" => tool_fetch(state, bearer, arguments, upstream, tokens).await,
        "summary.today" => tool_summary_today(state, bearer, arguments, upstream, tokens).await,
        "projection.month" => tool_projection_month(state, bearer, arguments, upstream, tokens).await,
        "transactions.query" => tool_transactions_query(state, bearer, session, arguments, upstream, tokens).await,
        _ => Err(GatewayError::MethodNotFound),
    }
}

async fn fetch_all_transactions(
    state: &AppState,
    bearer: &str,
    upstream: &UpstreamClient,
    tokens: &UpstreamTokens,
    account_id: Option<&str>,
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> Result<Vec<NormalisedTransaction>, GatewayError> {
    let mut current = tokens.clone();

    let account_ids: Vec<String> = match account_id {
        Some(id) => vec![id.to_string()],
        None => {
            let (accounts, refreshed) = upstream.list_accounts(&current).await?;
            if let Some(r) = refreshed {
                persist_refreshed_tokens(state, bearer, &r);
                current = r;
            }
            accounts
                .iter()
                .filter_map(|a| {
                    a.get("resourceId")
                        .or_else(|| a.get("id"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                })
                .collect()
        }
    };

    let mut all = Vec::new();
    for id in account_ids {
        let (raw, refreshed) = upstream.list_transactions(&id, date_from, date_to, &current).await?;
        if let Some(r) = refreshed {
            persist_refreshed_tokens(state, bearer, &r);
            current = r;
        }
        all.extend(raw.into_iter().map(normalise));
    }
    Ok(all)
}

fn clamp_limit(requested: Option<u64>, default: usize, max: usize) -> usize {
    requested.map(|v| v as usize).unwrap_or(default).min(max)
}

async fn tool_search(
    state: &AppState,
    bearer: &str,
    session: &Session,
    arguments: Value,
    upstream: &UpstreamClient,
    tokens: &UpstreamTokens,
) -> Result<Value, GatewayError> {
    let query = arguments.get("query").and_then(|v| v.as_str()).map(|s| s.to_lowercase());
    let limit = clamp_limit(arguments.get("limit").and_then(|v| v.as_u64()), DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT);

    publish_progress(session, "search", "started", None);
    let all = fetch_all_transactions(state, bearer, upstream, tokens, None, None, None).await?;
    publish_progress(session, "search", "completed", Some(all.len()));

    let filtered: Vec<&NormalisedTransaction> = all
        .iter()
        .filter(|t| match &query {
            Some(q) => t.merchant.to_lowercase().contains(q.as_str())
                || t.description.as_deref().unwrap_or("").to_lowercase().contains(q.as_str()),
            None => true,
        })
        .take(limit)
        .collect();

    Ok(json!({ "results": filtered, "query": query }))
}

async fn tool_fetch(
    state: &AppState,
    bearer: &str,
    arguments: Value,
    upstream: &UpstreamClient,
    tokens: &UpstreamTokens,
) -> Result<Value, GatewayError> {
    let id = arguments
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::InvalidParams("id is required".into()))?;
    let all = fetch_all_transactions(state, bearer, upstream, tokens, None, None, None).await?;
    match all.into_iter().find(|t| t.id == id) {
        Some(resource) => Ok(json!({ "resource": resource })),
        None => Err(GatewayError::NotFound(format!("transaction {id} not found"))),
    }
}

fn today_str() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

async fn tool_summary_today(
    state: &AppState,
    bearer: &str,
    arguments: Value,
    upstream: &UpstreamClient,
    tokens: &UpstreamTokens,
) -> Result<Value, GatewayError> {
    let currency = arguments.get("currency").and_then(|v| v.as_str());
    let budget = arguments.get("budget").and_then(|v| v.as_f64()).unwrap_or(DEFAULT_DAILY_BUDGET);
    let today = today_str();

    let all = fetch_all_transactions(state, bearer, upstream, tokens, None, Some(&today), Some(&today)).await?;
    let todays: Vec<&NormalisedTransaction> = all
        .iter()
        .filter(|t| t.date == today)
        .filter(|t| currency.map_or(true, |c| t.currency.eq_ignore_ascii_case(c)))
        .collect();

    let total_spent: f64 = todays.iter().filter(|t| t.amount < 0.0).map(|t| t.amount.abs()).sum();
    let mut categories: std::collections::HashMap<&'static str, f64> = std::collections::HashMap::new();
    for t in todays.iter().filter(|t| t.amount < 0.0) {
        *categories.entry(t.category.as_str()).or_insert(0.0) += t.amount.abs();
    }
    let variance = budget - total_spent;
    let status = if total_spent > budget { "over" } else { "under" };

    Ok(json!({
        "summary": {
            "date": today,
            "transactions": todays.len(),
            "total_spent": total_spent,
            "categories": categories,
            "daily_budget": budget,
            "variance": variance,
            "status": status,
        }
    }))
}

async fn tool_projection_month(
    state: &AppState,
    bearer: &str,
    arguments: Value,
    upstream: &UpstreamClient,
    tokens: &UpstreamTokens,
) -> Result<Value, GatewayError> {
    let budget = arguments.get("budget").and_then(|v| v.as_f64()).unwrap_or(DEFAULT_MONTHLY_BUDGET);
    let today = Utc::now().date_naive();
    let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).expect("valid calendar date");
    let days_in_month = days_in_month(today.year(), today.month());
    let day_of_month = today.day() as i64;

    let all = fetch_all_transactions(
        state,
        bearer,
        upstream,
        tokens,
        None,
        Some(&month_start.format("%Y-%m-%d").to_string()),
        Some(&today.format("%Y-%m-%d").to_string()),
    )
    .await?;
    let current_spend: f64 = all.iter().filter(|t| t.amount < 0.0).map(|t| t.amount.abs()).sum();

    let projected_spend = current_spend * days_in_month as f64 / day_of_month.max(1) as f64;
    let variance = budget - projected_spend;
    let pace = if budget > 0.0 { projected_spend / budget } else { 0.0 };
    let days_remaining = days_in_month as i64 - day_of_month;

    Ok(json!({
        "projection": {
            "month": today.format("%Y-%m").to_string(),
            "current_spend": current_spend,
            "projected_spend": projected_spend,
            "budget": budget,
            "variance": variance,
            "pace": pace,
            "days_remaining": days_remaining,
        }
    }))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid calendar date")
        .signed_duration_since(NaiveDate::from_ymd_opt(year, month, 1).expect("valid calendar date"))
        .num_days() as u32
}

async fn tool_transactions_query(
    state: &AppState,
    bearer: &str,
    session: &Session,
    arguments: Value,
    upstream: &UpstreamClient,
    tokens: &UpstreamTokens,
) -> Result<Value, GatewayError> {
    let account_id = arguments.get("account_id").and_then(|v| v.as_str());
    let since = arguments.get("since").and_then(|v| v.as_str());
    let until = arguments.get("until").and_then(|v| v.as_str());
    let limit = clamp_limit(arguments.get("limit").and_then(|v| v.as_u64()), DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT);

    publish_progress(session, "transactions.query", "started", None);
    let all = fetch_all_transactions(state, bearer, upstream, tokens, account_id, since, until).await?;
    publish_progress(session, "transactions.query", "completed", Some(all.len()));

    let limited: Vec<&NormalisedTransaction> = all.iter().take(limit).collect();

    Ok(json!({
        "transactions": limited,
        "count": limited.len(),
        "since": since,
        "until": until,
        "limit": limit,
        "account_id": account_id,
    }))
}

/// Publishes a `progress` frame to the session's SSE queue. Best-effort: a
/// vanished session (no live SSE consumer) must not fail the tool call.
fn publish_progress(session: &Session, tool: &str, phase: &str, count: Option<usize>) {
    let _ = session.publish(json!({
        "event": "progress",
        "tool": tool,
        "phase": phase,
        "count": count,
        "timestamp": now(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_marks_only_echo_unprotected() {
        let tools = catalogue();
        assert!(tools.iter().find(|t| t.name == "echo").map(|t| !t.protected).unwrap_or(false));
        for t in tools.iter().filter(|t| t.name != "echo") {
            assert!(t.protected, "{} should be protected", t.name);
        }
    }

    #[test]
    fn days_in_month_handles_year_rollover() {
        assert_eq!(days_in_month(2026, 12), 31);
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2026, 2), 28);
    }

    #[test]
    fn clamp_limit_respects_max_and_default() {
        assert_eq!(clamp_limit(None, 50, 200), 50);
        assert_eq!(clamp_limit(Some(10_000), 50, 200), 200);
        assert_eq!(clamp_limit(Some(10), 50, 200), 10);
    }

    #[tokio::test]
    async fn echo_returns_text_content() {
        let result = run_unprotected("echo", json!({ "message": "hi" })).unwrap();
        assert_eq!(result["content"][0]["text"], "hi");
    }

    fn test_state() -> AppState {
        AppState::new(crate::config::GatewayConfig {
            enable_app_id: None,
            enable_private_key_path: None,
            enable_env: crate::config::EnableEnv::Sandbox,
            aspsp_id: None,
            aspsp_country: None,
            oauth_redirect_url: None,
            oauth_issuer: None,
            host: "127.0.0.1".into(),
            port: 0,
            enable_base_url: None,
        })
    }

    #[test]
    fn persist_refreshed_tokens_rewrites_the_stored_pair() {
        let state = test_state();
        let original = UpstreamTokens {
            access_token: "eb-access-old".into(),
            refresh_token: Some("eb-refresh-old".into()),
            expires_at: Some(now() + 3600),
        };
        let extra = TokenExtra::default().with_upstream_tokens(&original);
        state.store.issue_token_pair(
            "local-access".into(),
            "local-refresh".into(),
            "client-1".into(),
            "accounts".into(),
            None,
            extra,
        );

        let refreshed = UpstreamTokens {
            access_token: "eb-access-new".into(),
            refresh_token: Some("eb-refresh-new".into()),
            expires_at: Some(now() + 3600),
        };
        persist_refreshed_tokens(&state, "local-access", &refreshed);

        let stored = state.store.get_access_token("local-access").unwrap();
        let stored_tokens = stored.extra.enable_banking_tokens().unwrap();
        assert_eq!(stored_tokens.access_token, "eb-access-new");
        assert_eq!(stored_tokens.refresh_token.as_deref(), Some("eb-refresh-new"));
    }

    #[test]
    fn persist_refreshed_tokens_is_a_noop_for_an_unknown_bearer() {
        let state = test_state();
        let refreshed = UpstreamTokens { access_token: "x".into(), refresh_token: None, expires_at: None };
        // Must not panic even though "missing" was never issued.
        persist_refreshed_tokens(&state, "missing", &refreshed);
    }
}
