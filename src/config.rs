//! Engine configuration.
//!
//! Every knob is explicit: the engine supplies no implicit defaults, so the
//! calling layer must decide timeouts and budgets for its deployment. There
//! is deliberately no `Default` impl.

use std::time::Duration;

use crate::error::EngineError;

/// Configuration for a single engine session.
///
/// All fields are required. `validate()` is called by
/// [`Engine::new`](crate::engine::Engine::new) and rejects configurations
/// that would silently misbehave (empty URL, zero budgets or intervals).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// WebSocket endpoint. `http(s)://` URLs are normalized to `ws(s)://`.
    pub url: String,
    /// Maximum automatic reconnect attempts after an unexpected close.
    pub reconnect_attempts: u32,
    /// Fixed wait between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Interval between liveness probes while connected.
    pub heartbeat_interval: Duration,
    /// Silence window after which the connection is treated as dead.
    ///
    /// Catches half-open TCP/proxy-dropped connections that never deliver a
    /// close frame. Must exceed `heartbeat_interval`, otherwise a healthy
    /// but quiet connection would be torn down between probes.
    pub heartbeat_grace: Duration,
    /// Bound for the initial open and for correlated request responses.
    pub timeout: Duration,
}

impl EngineConfig {
    /// Check the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Connection` describing the first invalid field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.url.trim().is_empty() {
            return Err(EngineError::Connection("url must not be empty".to_string()));
        }
        if self.reconnect_attempts == 0 {
            return Err(EngineError::Connection(
                "reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(EngineError::Connection(
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_grace <= self.heartbeat_interval {
            return Err(EngineError::Connection(
                "heartbeat_grace must exceed heartbeat_interval".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::Connection("timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}
