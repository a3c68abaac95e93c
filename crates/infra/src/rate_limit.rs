//! Fixed-window rate limiting for protected actions (e.g. job submission).
//!
//! State is kept per `(identifier, action_key)`. A window opens on the first
//! attempt and closes `window` later; the next attempt after that opens a
//! fresh window. Window starts are only ever set to "now", never backdated.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use bulkops_core::{ActorId, SessionId};

/// Limit for one action key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            limit: 5,
            window: Duration::from_secs(15 * 60),
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Rule used for action keys without an explicit entry.
    pub default_rule: RateLimitRule,
    /// Per-action overrides, keyed by action key (e.g. `submit:csv_import`).
    #[serde(default)]
    pub rules: HashMap<String, RateLimitRule>,
    /// Closed windows are swept when a new key arrives and the map holds at
    /// least this many records.
    #[serde(default = "default_sweep_above")]
    pub sweep_above: usize,
}

fn default_sweep_above() -> usize {
    1024
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_rule: RateLimitRule::default(),
            rules: HashMap::new(),
            sweep_above: default_sweep_above(),
        }
    }
}

impl RateLimitSettings {
    pub fn rule_for(&self, action_key: &str) -> RateLimitRule {
        self.rules.get(action_key).copied().unwrap_or(self.default_rule)
    }

    pub fn with_rule(mut self, action_key: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(action_key.into(), rule);
        self
    }
}

/// Counter state for one `(identifier, action_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub identifier: String,
    pub action_key: String,
    pub window_start: DateTime<Utc>,
    pub attempts: u32,
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRecord {
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now < self.window_end()
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Blocked { time_until_unblock: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("no identifier could be resolved for the request")]
    NoIdentity,
    #[error("rate limiter lock poisoned")]
    Poisoned,
}

/// Who is asking. Resolution precedence: actor, then session, then network origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub actor_id: Option<ActorId>,
    pub session_id: Option<SessionId>,
    pub remote_addr: Option<IpAddr>,
}

impl RequestIdentity {
    pub fn actor(actor_id: ActorId) -> Self {
        Self {
            actor_id: Some(actor_id),
            ..Default::default()
        }
    }

    /// First available identity wins.
    pub fn resolve(&self) -> Option<String> {
        if let Some(actor) = self.actor_id {
            return Some(format!("actor:{actor}"));
        }
        if let Some(session) = self.session_id {
            return Some(format!("session:{session}"));
        }
        self.remote_addr.map(|addr| format!("ip:{addr}"))
    }
}

/// In-process fixed-window rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    records: RwLock<HashMap<(String, String), RateLimitRecord>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Check (and count) an attempt now.
    pub fn check(
        &self,
        identity: &RequestIdentity,
        action_key: &str,
    ) -> Result<RateLimitDecision, RateLimitError> {
        self.check_at(identity, action_key, Utc::now())
    }

    pub fn check_at(
        &self,
        identity: &RequestIdentity,
        action_key: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let identifier = identity.resolve().ok_or(RateLimitError::NoIdentity)?;
        self.check_key_at(&identifier, action_key, now)
    }

    /// Check an already-resolved identifier.
    pub fn check_key_at(
        &self,
        identifier: &str,
        action_key: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let rule = self.settings.rule_for(action_key);
        let mut records = self.records.write().map_err(|_| RateLimitError::Poisoned)?;
        let key = (identifier.to_string(), action_key.to_string());

        let fresh = || RateLimitRecord {
            identifier: identifier.to_string(),
            action_key: action_key.to_string(),
            window_start: now,
            attempts: 1,
            limit: rule.limit,
            window: rule.window,
        };

        let decision = match records.get_mut(&key) {
            Some(record) if record.is_open_at(now) => {
                if record.attempts < record.limit {
                    record.attempts += 1;
                    RateLimitDecision::Allowed {
                        remaining: record.limit - record.attempts,
                    }
                } else {
                    let wait = (record.window_end() - now).to_std().unwrap_or(Duration::ZERO);
                    RateLimitDecision::Blocked {
                        time_until_unblock: wait,
                    }
                }
            }
            _ => {
                if rule.limit == 0 {
                    RateLimitDecision::Blocked {
                        time_until_unblock: rule.window,
                    }
                } else {
                    if records.len() >= self.settings.sweep_above {
                        let before = records.len();
                        records.retain(|_, r| r.is_open_at(now));
                        debug!(swept = before - records.len(), "rate limit records swept");
                    }
                    let record = fresh();
                    let remaining = record.limit - record.attempts;
                    records.insert(key, record);
                    RateLimitDecision::Allowed { remaining }
                }
            }
        };

        debug!(identifier, action_key, ?decision, "rate limit check");
        Ok(decision)
    }

    /// Current record for an identifier/action, if any.
    pub fn record(&self, identifier: &str, action_key: &str) -> Option<RateLimitRecord> {
        let records = self.records.read().ok()?;
        records
            .get(&(identifier.to_string(), action_key.to_string()))
            .cloned()
    }

    /// Forget the counter (e.g. after a successful operator override).
    pub fn reset(&self, identifier: &str, action_key: &str) {
        if let Ok(mut records) = self.records.write() {
            records.remove(&(identifier.to_string(), action_key.to_string()));
        }
    }

    /// Number of tracked `(identifier, action)` records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records whose window has closed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut records) = self.records.write() else {
            return 0;
        };
        let before = records.len();
        records.retain(|_, r| r.is_open_at(now));
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            default_rule: RateLimitRule::new(5, Duration::from_secs(15 * 60)),
            ..Default::default()
        })
    }

    #[test]
    fn sixth_attempt_in_window_is_blocked() {
        let limiter = limiter();
        let who = RequestIdentity::actor(ActorId::new());
        let t0 = Utc::now();

        for i in 0..5 {
            let decision = limiter
                .check_at(&who, "submit", t0 + chrono::Duration::seconds(i))
                .unwrap();
            assert_eq!(decision, RateLimitDecision::Allowed { remaining: 4 - i as u32 });
        }

        let sixth = limiter
            .check_at(&who, "submit", t0 + chrono::Duration::minutes(1))
            .unwrap();
        match sixth {
            RateLimitDecision::Blocked { time_until_unblock } => {
                assert!(time_until_unblock > Duration::ZERO);
                assert_eq!(time_until_unblock, Duration::from_secs(14 * 60));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn fresh_window_after_expiry() {
        let limiter = limiter();
        let who = RequestIdentity::actor(ActorId::new());
        let t0 = Utc::now();

        for _ in 0..6 {
            limiter.check_at(&who, "submit", t0).unwrap();
        }
        let later = t0 + chrono::Duration::minutes(15);
        let decision = limiter.check_at(&who, "submit", later).unwrap();
        assert_eq!(decision, RateLimitDecision::Allowed { remaining: 4 });

        let record = limiter
            .record(&who.resolve().unwrap(), "submit")
            .unwrap();
        assert_eq!(record.window_start, later);
        assert_eq!(record.attempts, 1);
    }

    #[test]
    fn actions_and_identifiers_are_independent() {
        let limiter = RateLimiter::new(RateLimitSettings {
            default_rule: RateLimitRule::new(1, Duration::from_secs(60)),
            ..Default::default()
        });
        let a = RequestIdentity::actor(ActorId::new());
        let b = RequestIdentity::actor(ActorId::new());
        let now = Utc::now();

        assert!(limiter.check_at(&a, "submit:import", now).unwrap().is_allowed());
        assert!(!limiter.check_at(&a, "submit:import", now).unwrap().is_allowed());
        assert!(limiter.check_at(&a, "submit:migration", now).unwrap().is_allowed());
        assert!(limiter.check_at(&b, "submit:import", now).unwrap().is_allowed());
    }

    #[test]
    fn per_action_rules_override_default() {
        let settings = RateLimitSettings::default()
            .with_rule("rollback", RateLimitRule::new(1, Duration::from_secs(3600)));
        let limiter = RateLimiter::new(settings);
        let who = RequestIdentity::actor(ActorId::new());
        let now = Utc::now();

        assert!(limiter.check_at(&who, "rollback", now).unwrap().is_allowed());
        assert!(!limiter.check_at(&who, "rollback", now).unwrap().is_allowed());
    }

    #[test]
    fn identity_precedence() {
        let actor = ActorId::new();
        let session = SessionId::new();
        let addr: IpAddr = "10.0.0.7".parse().unwrap();

        let full = RequestIdentity {
            actor_id: Some(actor),
            session_id: Some(session),
            remote_addr: Some(addr),
        };
        assert_eq!(full.resolve(), Some(format!("actor:{actor}")));

        let anon = RequestIdentity {
            actor_id: None,
            session_id: Some(session),
            remote_addr: Some(addr),
        };
        assert_eq!(anon.resolve(), Some(format!("session:{session}")));

        let bare = RequestIdentity {
            remote_addr: Some(addr),
            ..Default::default()
        };
        assert_eq!(bare.resolve(), Some("ip:10.0.0.7".to_string()));

        let limiter = limiter();
        assert_eq!(
            limiter.check(&RequestIdentity::default(), "submit"),
            Err(RateLimitError::NoIdentity)
        );
    }

    #[test]
    fn purge_drops_closed_windows() {
        let limiter = limiter();
        let who = RequestIdentity::actor(ActorId::new());
        let t0 = Utc::now();
        limiter.check_at(&who, "submit", t0).unwrap();
        assert_eq!(limiter.purge_expired(t0 + chrono::Duration::minutes(16)), 1);
    }

    #[test]
    fn new_keys_sweep_closed_windows_once_the_map_is_large() {
        let limiter = RateLimiter::new(RateLimitSettings {
            default_rule: RateLimitRule::new(5, Duration::from_secs(60)),
            sweep_above: 3,
            ..Default::default()
        });
        let t0 = Utc::now();
        for n in 0..3 {
            limiter.check_key_at(&format!("ip:10.0.0.{n}"), "submit", t0).unwrap();
        }
        assert_eq!(limiter.len(), 3);

        let later = t0 + chrono::Duration::minutes(2);
        limiter.check_key_at("ip:10.0.0.99", "submit", later).unwrap();
        assert_eq!(limiter.len(), 1);
        assert!(limiter.record("ip:10.0.0.0", "submit").is_none());
        assert!(limiter.record("ip:10.0.0.99", "submit").is_some());
    }
}
