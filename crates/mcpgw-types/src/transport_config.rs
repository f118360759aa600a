use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire-level transport configuration, tagged by `kind`. Mirrors spec.md §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default, rename = "apiKey")]
        api_key: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Enables ModelScope-flavored session-expiry recovery (spec.md §4.1).
        #[serde(default)]
        modelscope: bool,
    },
    StreamableHttp {
        url: String,
        #[serde(default, rename = "apiKey")]
        api_key: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Websocket {
        url: String,
        #[serde(default)]
        mode: WebsocketMode,
        #[serde(default)]
        reconnect: Option<ReconnectPolicy>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebsocketMode {
    #[default]
    Client,
    Server,
}

impl TransportConfig {
    pub fn label(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::StreamableHttp { .. } => "streamable-http",
            TransportConfig::Websocket { .. } => "websocket",
        }
    }

    /// Misconfiguration that must fail synchronously before any I/O
    /// (spec.md §4.1: "stdio with empty command fails with ConfigError").
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                Err("stdio transport requires a non-empty command".to_string())
            }
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                if url.trim().is_empty() {
                    Err("transport requires a non-empty url".to_string())
                } else {
                    Ok(())
                }
            }
            TransportConfig::Websocket { url, .. } if url.trim().is_empty() => {
                Err("websocket transport requires a non-empty url".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Linear,
    Exponential,
    Fixed,
}

impl Default for BackoffKind {
    fn default() -> Self {
        BackoffKind::Exponential
    }
}

/// Reconnection policy, defaults per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// 0 = unlimited.
    pub max_attempts: u32,
    pub initial_interval_ms: u32,
    pub backoff: BackoffKind,
    pub max_interval_ms: u32,
    pub multiplier: f32,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_interval_ms: 2_000,
            backoff: BackoffKind::Exponential,
            max_interval_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay for reconnect attempt `n` (1-indexed), per the
    /// formulas in spec.md §4.3. Jitter is applied by the caller, since it
    /// requires a source of randomness this crate deliberately doesn't carry.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1) as f64;
        let initial = self.initial_interval_ms as f64;
        let max = self.max_interval_ms as f64;
        let ms = match self.backoff {
            BackoffKind::Exponential => initial * (self.multiplier as f64).powf(n - 1.0),
            BackoffKind::Linear => initial * n,
            BackoffKind::Fixed => initial,
        };
        Duration::from_millis(ms.min(max).max(0.0) as u64)
    }

    /// Whether another attempt is permitted given attempts made so far.
    pub fn allows_attempt(&self, attempts_made: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts_made < self.max_attempts)
    }

    /// Merge a partial patch into this policy (used by
    /// `updateReconnectOptions`); `None` fields keep their current value.
    pub fn merged_with(&self, patch: ReconnectPolicyPatch) -> Self {
        Self {
            enabled: patch.enabled.unwrap_or(self.enabled),
            max_attempts: patch.max_attempts.unwrap_or(self.max_attempts),
            initial_interval_ms: patch.initial_interval_ms.unwrap_or(self.initial_interval_ms),
            backoff: patch.backoff.unwrap_or(self.backoff),
            max_interval_ms: patch.max_interval_ms.unwrap_or(self.max_interval_ms),
            multiplier: patch.multiplier.unwrap_or(self.multiplier),
            jitter: patch.jitter.unwrap_or(self.jitter),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicyPatch {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_interval_ms: Option<u32>,
    pub backoff: Option<BackoffKind>,
    pub max_interval_ms: Option<u32>,
    pub multiplier: Option<f32>,
    pub jitter: Option<bool>,
}

/// One upstream server's configuration. Mirrors spec.md §3 `ServiceConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_validate_rejects_empty_command() {
        let cfg = TransportConfig::Stdio {
            command: "".into(),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn exponential_backoff_matches_spec_formula() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4_000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(8_000));
    }

    #[test]
    fn exponential_backoff_caps_at_max_interval() {
        let policy = ReconnectPolicy::default();
        // 2000 * 2^9 = 1,024,000ms, capped to 60,000ms.
        assert_eq!(policy.base_delay(10), Duration::from_millis(60_000));
    }

    #[test]
    fn linear_backoff_matches_spec_formula() {
        let policy = ReconnectPolicy {
            backoff: BackoffKind::Linear,
            initial_interval_ms: 1_000,
            max_interval_ms: 10_000,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(3_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = ReconnectPolicy {
            backoff: BackoffKind::Fixed,
            initial_interval_ms: 500,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(7), Duration::from_millis(500));
    }

    #[test]
    fn allows_attempt_respects_max_attempts_and_unlimited() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(policy.allows_attempt(0));
        assert!(policy.allows_attempt(2));
        assert!(!policy.allows_attempt(3));

        let unlimited = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(unlimited.allows_attempt(1_000));
    }

    #[test]
    fn merged_with_is_idempotent_for_identical_patch() {
        let policy = ReconnectPolicy::default();
        let patch = ReconnectPolicyPatch {
            max_attempts: Some(5),
            ..Default::default()
        };
        let once = policy.merged_with(patch);
        let twice = once.merged_with(patch);
        assert_eq!(once, twice);
    }
}
