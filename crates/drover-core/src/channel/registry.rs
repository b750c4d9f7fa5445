//! Per-process provider and listener tables.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Answers `query` for one channel.
pub type Provider = Arc<dyn Fn() -> Value + Send + Sync>;

/// Receives `dispatch` broadcasts for one channel.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Channel name to provider / listeners.
///
/// Registration is additive: a channel has at most one provider (the latest
/// registration wins) and any number of listeners, called in registration
/// order.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    providers: HashMap<String, Provider>,
    listeners: HashMap<String, Vec<Listener>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&mut self, channel: impl Into<String>, provider: Provider) {
        self.providers.insert(channel.into(), provider);
    }

    pub fn register_listener(&mut self, channel: impl Into<String>, listener: Listener) {
        self.listeners.entry(channel.into()).or_default().push(listener);
    }

    pub fn provider(&self, channel: &str) -> Option<Provider> {
        self.providers.get(channel).cloned()
    }

    pub fn listeners(&self, channel: &str) -> Vec<Listener> {
        self.listeners.get(channel).cloned().unwrap_or_default()
    }

    /// This process's answer for `channel`, if it provides one.
    pub fn answer(&self, channel: &str) -> Option<Value> {
        self.providers.get(channel).map(|provider| provider())
    }

    /// Run every local listener for `channel`. Returns how many ran.
    pub fn dispatch(&self, channel: &str, data: &Value) -> usize {
        let listeners = self.listeners(channel);
        for listener in &listeners {
            listener(data);
        }
        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_provider_answers() {
        let mut registry = ChannelRegistry::new();
        assert!(registry.answer("count").is_none());

        registry.register_provider("count", Arc::new(|| json!(1)));
        assert_eq!(registry.answer("count"), Some(json!(1)));

        registry.register_provider("count", Arc::new(|| json!(2)));
        assert_eq!(registry.answer("count"), Some(json!(2)));
    }

    #[test]
    fn test_listeners_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ChannelRegistry::new();
        for tag in ["a", "b"] {
            let seen = seen.clone();
            registry.register_listener(
                "events",
                Arc::new(move |data: &Value| seen.lock().unwrap().push(format!("{}:{}", tag, data))),
            );
        }

        assert_eq!(registry.dispatch("events", &json!(7)), 2);
        assert_eq!(registry.dispatch("other", &json!(7)), 0);
        assert_eq!(*seen.lock().unwrap(), vec!["a:7".to_string(), "b:7".to_string()]);
    }
}
