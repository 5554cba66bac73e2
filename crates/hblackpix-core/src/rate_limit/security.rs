//! Server-side rate limiting with an audit trail.
//!
//! Counters live in a SQLite table next to `security_audit_log`. Every refusal
//! and every block transition is audited, and identifiers that keep getting
//! blocked escalate to [`RiskLevel::High`].

use super::counter::{RateLimitCounter, RateLimitDecision};
use super::policy::RateLimitPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitDefaults;
use crate::error::{CoreError, Result};
use crate::storage::sqlite::{format_timestamp, lock_conn, open_connection, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for [`SecurityService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub login: RateLimitPolicy,
    pub signup: RateLimitPolicy,
    pub notification: RateLimitPolicy,
    /// Blocks within `escalation_window` that make an identifier high risk.
    pub escalation_threshold: u32,
    pub escalation_window: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            login: RateLimitPolicy::login(),
            signup: RateLimitPolicy::signup(),
            notification: RateLimitPolicy::notification(),
            escalation_threshold: RateLimitDefaults::ESCALATION_THRESHOLD,
            escalation_window: RateLimitDefaults::ESCALATION_WINDOW,
        }
    }
}

impl SecurityConfig {
    /// Configured policy for a named action, falling back to the presets.
    pub fn policy_for(&self, action: &str) -> Option<RateLimitPolicy> {
        match action {
            "login" => Some(self.login),
            "signup" => Some(self.signup),
            "notification" | "create_notification" => Some(self.notification),
            other => RateLimitPolicy::preset(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(CoreError::Validation {
                field: "risk_level".to_string(),
                message: format!("unknown risk level '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Refused while a block was active.
    Refused,
    /// This attempt put the identifier into a block.
    Blocked,
    /// Counter cleared by an operator or a successful login.
    Reset,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Refused => "refused",
            AuditOutcome::Blocked => "blocked",
            AuditOutcome::Reset => "reset",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOutcome {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "refused" => Ok(AuditOutcome::Refused),
            "blocked" => Ok(AuditOutcome::Blocked),
            "reset" => Ok(AuditOutcome::Reset),
            other => Err(CoreError::Validation {
                field: "outcome".to_string(),
                message: format!("unknown audit outcome '{}'", other),
            }),
        }
    }
}

/// A row of `security_audit_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub risk_level: RiskLevel,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Database-backed limiter with audit logging.
pub struct SecurityService {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    config: SecurityConfig,
}

impl SecurityService {
    /// Open (or create) the security tables at `db_path`.
    pub fn open(db_path: impl AsRef<Path>, config: SecurityConfig) -> Result<Self> {
        let conn = open_connection(db_path.as_ref())?;
        Self::from_connection(conn, config, Arc::new(SystemClock))
    }

    pub fn open_in_memory(config: SecurityConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config, Arc::new(SystemClock))
    }

    pub fn from_connection(
        conn: Connection,
        config: SecurityConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let service = Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            config,
        };
        service.initialize_schema()?;
        Ok(service)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = lock_conn(&self.conn)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_counters (
                identifier TEXT NOT NULL,
                action TEXT NOT NULL,
                window_start TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                blocked_until TEXT,
                PRIMARY KEY (identifier, action)
            );

            CREATE TABLE IF NOT EXISTS security_audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                outcome TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                details TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_actor
                ON security_audit_log(actor, outcome, created_at);
            "#,
        )
        .map_err(|e| CoreError::Database {
            message: format!("Failed to create security tables: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// `true` if the attempt is allowed.
    pub fn check_rate_limit(
        &self,
        identifier: &str,
        action: &str,
        max_attempts: u32,
        window: Duration,
    ) -> Result<bool> {
        let policy = RateLimitPolicy::new(max_attempts, window);
        Ok(self.check(identifier, action, &policy)?.allowed)
    }

    /// Check against the configured policy for `action`.
    pub fn check_action(&self, identifier: &str, action: &str) -> Result<RateLimitDecision> {
        let policy = self
            .config
            .policy_for(action)
            .ok_or_else(|| CoreError::Validation {
                field: "action".to_string(),
                message: format!("no rate-limit policy for '{}'", action),
            })?;
        self.check(identifier, action, &policy)
    }

    /// Count one attempt, auditing refusals and block transitions.
    pub fn check(
        &self,
        identifier: &str,
        action: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision> {
        let now = self.clock.now();
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction()?;

        let mut counter = load_counter(&tx, identifier, action)?
            .unwrap_or_else(|| RateLimitCounter::new(identifier, action, now));
        let decision = counter.register_attempt(policy, now);
        save_counter(&tx, &counter)?;

        if !decision.allowed {
            let outcome = if decision.newly_blocked {
                AuditOutcome::Blocked
            } else {
                AuditOutcome::Refused
            };
            let blocks = self.recent_block_count(&tx, identifier, now)?
                + u32::from(decision.newly_blocked);
            let risk_level = self.risk_for_blocks(blocks);

            let details = json!({
                "attempts": decision.attempts,
                "max_attempts": policy.max_attempts,
                "window_ms": policy.window.as_millis() as u64,
                "retry_after_ms": decision.retry_after.map(|d| d.as_millis() as u64),
                "recent_blocks": blocks,
            });
            insert_audit(&tx, identifier, action, outcome, risk_level, Some(&details), now)?;

            if decision.newly_blocked {
                if risk_level == RiskLevel::High {
                    warn!(
                        "Identifier '{}' escalated to high risk after {} blocks on '{}'",
                        identifier, blocks, action
                    );
                } else {
                    info!("Blocked '{}' on '{}' for {:?}", identifier, action, policy.block_duration);
                }
            }
        }

        tx.commit()?;
        Ok(decision)
    }

    /// Clear a counter and audit the reset.
    pub fn reset(&self, identifier: &str, action: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM rate_limit_counters WHERE identifier = ?1 AND action = ?2",
            params![identifier, action],
        )? > 0;
        let blocks = self.recent_block_count(&tx, identifier, now)?;
        insert_audit(
            &tx,
            identifier,
            action,
            AuditOutcome::Reset,
            self.risk_for_blocks(blocks),
            None,
            now,
        )?;

        tx.commit()?;
        Ok(removed)
    }

    /// Current counter without counting an attempt.
    pub fn counter(&self, identifier: &str, action: &str) -> Result<Option<RateLimitCounter>> {
        let conn = lock_conn(&self.conn)?;
        load_counter(&conn, identifier, action)
    }

    /// Risk level derived from blocks within the escalation window.
    pub fn risk_level(&self, identifier: &str) -> Result<RiskLevel> {
        let conn = lock_conn(&self.conn)?;
        let blocks = self.recent_block_count(&conn, identifier, self.clock.now())?;
        Ok(self.risk_for_blocks(blocks))
    }

    /// Most recent audit events first.
    pub fn recent_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, actor, action, outcome, risk_level, details, created_at
             FROM security_audit_log ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, actor, action, outcome, risk_level, details, created_at) = row?;
            events.push(AuditEvent {
                id,
                actor,
                action,
                outcome: outcome.parse()?,
                risk_level: risk_level.parse()?,
                details: details.map(|d| serde_json::from_str(&d)).transpose()?,
                created_at: parse_timestamp(&created_at).ok_or_else(|| CoreError::Database {
                    message: format!("Invalid audit timestamp '{}'", created_at),
                    source: None,
                })?,
            });
        }
        Ok(events)
    }

    fn recent_block_count(
        &self,
        conn: &Connection,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let window = chrono::Duration::from_std(self.config.escalation_window)
            .unwrap_or(chrono::Duration::MAX);
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM security_audit_log
             WHERE actor = ?1 AND outcome = 'blocked' AND created_at >= ?2",
            params![identifier, format_timestamp(since)],
            |row| row.get(0),
        )?;
        Ok(count.clamp(0, u32::MAX as i64) as u32)
    }

    fn risk_for_blocks(&self, blocks: u32) -> RiskLevel {
        if blocks >= self.config.escalation_threshold {
            RiskLevel::High
        } else if blocks > 0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

fn load_counter(
    conn: &Connection,
    identifier: &str,
    action: &str,
) -> Result<Option<RateLimitCounter>> {
    let row = conn
        .query_row(
            "SELECT window_start, attempts, blocked_until FROM rate_limit_counters
             WHERE identifier = ?1 AND action = ?2",
            params![identifier, action],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((window_start, attempts, blocked_until)) = row else {
        return Ok(None);
    };

    let invalid = |value: &str| CoreError::Database {
        message: format!("Invalid counter timestamp '{}'", value),
        source: None,
    };

    Ok(Some(RateLimitCounter {
        identifier: identifier.to_string(),
        action: action.to_string(),
        window_start: parse_timestamp(&window_start).ok_or_else(|| invalid(&window_start))?,
        attempts: attempts.clamp(0, u32::MAX as i64) as u32,
        blocked_until: match blocked_until {
            Some(value) => Some(parse_timestamp(&value).ok_or_else(|| invalid(&value))?),
            None => None,
        },
    }))
}

fn save_counter(conn: &Connection, counter: &RateLimitCounter) -> Result<()> {
    conn.execute(
        "INSERT INTO rate_limit_counters (identifier, action, window_start, attempts, blocked_until)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(identifier, action) DO UPDATE SET
            window_start = excluded.window_start,
            attempts = excluded.attempts,
            blocked_until = excluded.blocked_until",
        params![
            counter.identifier,
            counter.action,
            format_timestamp(counter.window_start),
            counter.attempts,
            counter.blocked_until.map(format_timestamp),
        ],
    )?;
    Ok(())
}

fn insert_audit(
    conn: &Connection,
    actor: &str,
    action: &str,
    outcome: AuditOutcome,
    risk_level: RiskLevel,
    details: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO security_audit_log (actor, action, outcome, risk_level, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            actor,
            action,
            outcome.as_str(),
            risk_level.as_str(),
            details.map(Value::to_string),
            format_timestamp(now),
        ],
    )?;
    Ok(())
}
