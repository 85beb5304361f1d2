//! Consumer-set monitors.
//!
//! A monitor watches one topic expression and wants to know when the set of
//! consumers matching it becomes non-empty or empty. The registry keeps, for
//! every monitored expression, its callbacks and the consumers currently
//! matching it; each consumer keeps back-references to the expressions it
//! matches so that removal touches only those rows.
//!
//! Callers serialize access (the engine holds its registry lock); callback
//! delivery itself happens on the [`CallbackDispatcher`] pool.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{KyroError, KyroResult, RegistrationError};
use crate::target::RegistrationKey;
use crate::topic::TopicPattern;

use super::callback::{ConnectionId, ConsumerSetChangeCallback, WrappedCallback};
use super::dispatcher::CallbackDispatcher;
use super::registrar::{entry_matches, SubscriptionRegistrar, TopicExpressionCategory};

#[derive(Debug)]
struct MonitoredExpression {
    topic_space: String,
    discriminator: Option<String>,
    pattern: TopicPattern,
    callbacks: Vec<Arc<WrappedCallback>>,
    consumers: Vec<RegistrationKey>,
    registered_at: DateTime<Utc>,
}

/// Point-in-time view of one monitored expression.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub expression: String,
    pub topic_space: String,
    pub discriminator: Option<String>,
    pub wildcarded: bool,
    pub consumer_count: usize,
    pub callback_count: usize,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ConnectionEntry {
    callback: Arc<WrappedCallback>,
    expression: String,
    wildcarded: bool,
}

/// A consumer's back-references into the monitor tables.
#[derive(Debug, Clone)]
struct ConsumerMatchLists {
    expression: String,
    category: TopicExpressionCategory,
    exact: Vec<String>,
    wildcard: Vec<String>,
}

/// Monitors, their matching consumers and the per-connection index.
#[derive(Debug)]
pub struct ConsumerMonitorRegistry {
    exact: HashMap<String, MonitoredExpression>,
    wildcard: HashMap<String, MonitoredExpression>,
    connections: HashMap<ConnectionId, Vec<ConnectionEntry>>,
    consumers: HashMap<RegistrationKey, ConsumerMatchLists>,
    registrar: SubscriptionRegistrar,
    dispatcher: CallbackDispatcher,
}

fn schedule_all(
    dispatcher: &CallbackDispatcher,
    callbacks: &[Arc<WrappedCallback>],
    is_empty: bool,
) {
    for wrapped in callbacks {
        wrapped.transition_event(is_empty);
        dispatcher.schedule(Arc::clone(wrapped));
    }
}

impl ConsumerMonitorRegistry {
    /// Creates an empty registry delivering through `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: CallbackDispatcher) -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            connections: HashMap::new(),
            consumers: HashMap::new(),
            registrar: SubscriptionRegistrar::new(),
            dispatcher,
        }
    }

    /// The consumer categorizer.
    #[must_use]
    pub const fn registrar(&self) -> &SubscriptionRegistrar {
        &self.registrar
    }

    /// Registers a consumer and fires 0→1 transitions on the monitors it
    /// matches.
    pub fn add_consumer(
        &mut self,
        key: RegistrationKey,
        pattern: &TopicPattern,
        has_selector: bool,
    ) -> KyroResult<()> {
        if self.consumers.contains_key(&key) {
            return Err(KyroError::inconsistency(format!("{key} is already a monitored consumer")));
        }

        let expression = pattern.expression();
        let category = TopicExpressionCategory::classify(pattern.is_wildcarded(), has_selector);

        // Consumers on the same expression and category match the same monitors.
        let known = if self.registrar.is_known_expression(expression, category) {
            self.registrar
                .consumers_on(expression, category)
                .first()
                .and_then(|sibling| self.consumers.get(sibling))
                .map(|lists| (lists.exact.clone(), lists.wildcard.clone()))
        } else {
            None
        };
        let (exact, wildcard) = known.unwrap_or_else(|| self.match_monitors(pattern));

        for expr in &exact {
            let Some(monitor) = self.exact.get_mut(expr) else {
                return Err(KyroError::inconsistency(format!("exact monitor '{expr}' vanished")));
            };
            monitor.consumers.push(key.clone());
            if monitor.consumers.len() == 1 {
                schedule_all(&self.dispatcher, &monitor.callbacks, false);
            }
        }
        for expr in &wildcard {
            let Some(monitor) = self.wildcard.get_mut(expr) else {
                return Err(KyroError::inconsistency(format!("wildcard monitor '{expr}' vanished")));
            };
            monitor.consumers.push(key.clone());
            if monitor.consumers.len() == 1 {
                schedule_all(&self.dispatcher, &monitor.callbacks, false);
            }
        }

        debug!(
            consumer = %key,
            expression,
            ?category,
            exact_monitors = exact.len(),
            wildcard_monitors = wildcard.len(),
            "monitored consumer added"
        );

        self.registrar.add_consumer(pattern, category, key.clone());
        self.consumers.insert(
            key,
            ConsumerMatchLists {
                expression: expression.to_string(),
                category,
                exact,
                wildcard,
            },
        );
        Ok(())
    }

    fn match_monitors(&self, consumer: &TopicPattern) -> (Vec<String>, Vec<String>) {
        let collect = |table: &HashMap<String, MonitoredExpression>| {
            table
                .iter()
                .filter(|(_, m)| entry_matches(&m.pattern, consumer))
                .map(|(expr, _)| expr.clone())
                .collect::<Vec<_>>()
        };
        (collect(&self.exact), collect(&self.wildcard))
    }

    /// Removes a consumer and fires 1→0 transitions on the monitors it
    /// leaves empty.
    pub fn remove_consumer(&mut self, key: &RegistrationKey) -> KyroResult<()> {
        let Some(lists) = self.consumers.remove(key) else {
            return Err(KyroError::inconsistency(format!("{key} is not a monitored consumer")));
        };

        let tables = [
            (&mut self.exact, &lists.exact),
            (&mut self.wildcard, &lists.wildcard),
        ];
        for (table, exprs) in tables {
            for expr in exprs {
                let Some(monitor) = table.get_mut(expr) else {
                    return Err(KyroError::inconsistency(format!(
                        "monitor '{expr}' referenced by {key} does not exist"
                    )));
                };
                let Some(pos) = monitor.consumers.iter().position(|c| c == key) else {
                    return Err(KyroError::inconsistency(format!(
                        "{key} missing from consumers of monitor '{expr}'"
                    )));
                };
                monitor.consumers.remove(pos);
                if monitor.consumers.is_empty() {
                    schedule_all(&self.dispatcher, &monitor.callbacks, true);
                }
            }
        }

        self.registrar.remove_consumer(&lists.expression, lists.category, key)?;
        debug!(consumer = %key, expression = %lists.expression, "monitored consumer removed");
        Ok(())
    }

    /// Registers `callback` on a monitored expression. Returns whether
    /// consumers currently match it.
    ///
    /// Registering the same callback for the same connection and expression
    /// again changes nothing.
    pub fn register_monitor(
        &mut self,
        connection: ConnectionId,
        topic_space: &str,
        discriminator: Option<&str>,
        pattern: TopicPattern,
        callback: Arc<dyn ConsumerSetChangeCallback>,
    ) -> KyroResult<bool> {
        let wildcarded = pattern.is_wildcarded();
        let expression = pattern.expression().to_string();

        let existing = if wildcarded {
            self.wildcard.get_mut(&expression)
        } else {
            self.exact.get_mut(&expression)
        };
        if let Some(monitor) = existing {
            let present = !monitor.consumers.is_empty();
            if monitor.callbacks.iter().any(|w| w.is_same(connection, &callback)) {
                debug!(%connection, expression, "monitor already registered");
                return Ok(present);
            }
            let wrapped = Arc::new(WrappedCallback::new(connection, callback));
            monitor.callbacks.push(Arc::clone(&wrapped));
            self.connections.entry(connection).or_default().push(ConnectionEntry {
                callback: wrapped,
                expression,
                wildcarded,
            });
            return Ok(present);
        }

        let candidates = self.registrar.find_candidates(&pattern, false);
        for candidate in &candidates {
            let Some(lists) = self.consumers.get_mut(candidate) else {
                return Err(KyroError::inconsistency(format!(
                    "categorized consumer {candidate} has no match lists"
                )));
            };
            if wildcarded {
                lists.wildcard.push(expression.clone());
            } else {
                lists.exact.push(expression.clone());
            }
        }

        let present = !candidates.is_empty();
        let wrapped = Arc::new(WrappedCallback::new(connection, callback));
        let monitor = MonitoredExpression {
            topic_space: topic_space.to_string(),
            discriminator: discriminator.map(str::to_string),
            pattern,
            callbacks: vec![Arc::clone(&wrapped)],
            consumers: candidates,
            registered_at: Utc::now(),
        };
        if wildcarded {
            self.wildcard.insert(expression.clone(), monitor);
        } else {
            self.exact.insert(expression.clone(), monitor);
        }
        debug!(%connection, expression, wildcarded, present, "monitored expression created");

        self.connections.entry(connection).or_default().push(ConnectionEntry {
            callback: wrapped,
            expression,
            wildcarded,
        });
        Ok(present)
    }

    /// Removes every registration of `callback` by `connection`.
    ///
    /// Fails with `NotPossibleInCurrentConfiguration`, changing nothing, if
    /// the pair is not registered.
    pub fn deregister_monitor(
        &mut self,
        connection: ConnectionId,
        callback: &Arc<dyn ConsumerSetChangeCallback>,
    ) -> KyroResult<()> {
        let not_registered = || {
            KyroError::Registration(RegistrationError::NotPossibleInCurrentConfiguration {
                reason: format!("callback is not registered for connection {connection}"),
            })
        };

        let Some(entries) = self.connections.get_mut(&connection) else {
            return Err(not_registered());
        };
        if !entries.iter().any(|e| e.callback.is_same(connection, callback)) {
            return Err(not_registered());
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(entries)
            .into_iter()
            .partition(|e| e.callback.is_same(connection, callback));
        if kept.is_empty() {
            self.connections.remove(&connection);
        } else {
            *entries = kept;
        }

        for entry in &removed {
            self.remove_wrapped(entry)?;
        }
        Ok(())
    }

    /// Removes all monitors owned by `connection`. Unknown connections are
    /// ignored.
    pub fn remove_all(&mut self, connection: ConnectionId) -> KyroResult<()> {
        let Some(entries) = self.connections.remove(&connection) else {
            return Ok(());
        };
        debug!(%connection, monitors = entries.len(), "removing all monitors for connection");
        for entry in &entries {
            self.remove_wrapped(entry)?;
        }
        Ok(())
    }

    fn remove_wrapped(&mut self, entry: &ConnectionEntry) -> KyroResult<()> {
        let table = if entry.wildcarded {
            &mut self.wildcard
        } else {
            &mut self.exact
        };
        let expr = &entry.expression;

        let Some(monitor) = table.get_mut(expr) else {
            return Err(KyroError::inconsistency(format!(
                "monitored expression '{expr}' missing for connection {}",
                entry.callback.connection()
            )));
        };
        let Some(pos) = monitor
            .callbacks
            .iter()
            .position(|w| Arc::ptr_eq(w, &entry.callback))
        else {
            return Err(KyroError::inconsistency(format!(
                "callback missing from monitored expression '{expr}'"
            )));
        };
        monitor.callbacks.remove(pos);
        if !monitor.callbacks.is_empty() {
            return Ok(());
        }

        // Last callback gone: drop the row and every back-reference to it.
        let Some(monitor) = table.remove(expr) else {
            return Err(KyroError::inconsistency(format!("monitored expression '{expr}' vanished")));
        };
        for consumer in &monitor.consumers {
            let Some(lists) = self.consumers.get_mut(consumer) else {
                return Err(KyroError::inconsistency(format!(
                    "consumer {consumer} of '{expr}' has no match lists"
                )));
            };
            let refs = if entry.wildcarded {
                &mut lists.wildcard
            } else {
                &mut lists.exact
            };
            let Some(pos) = refs.iter().position(|e| e == expr) else {
                return Err(KyroError::inconsistency(format!(
                    "consumer {consumer} does not reference '{expr}'"
                )));
            };
            refs.remove(pos);
        }
        debug!(expression = %expr, "monitored expression removed");
        Ok(())
    }

    /// Consumers registered without a selector that may match `pattern`.
    #[must_use]
    pub fn non_selector_consumers(&self, pattern: &TopicPattern) -> Vec<RegistrationKey> {
        self.registrar.find_candidates(pattern, true)
    }

    /// Snapshots of the expressions `connection` monitors.
    #[must_use]
    pub fn snapshots(&self, connection: ConnectionId) -> Vec<MonitorSnapshot> {
        let Some(entries) = self.connections.get(&connection) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let table = if entry.wildcarded { &self.wildcard } else { &self.exact };
                table.get(&entry.expression).map(|m| MonitorSnapshot {
                    expression: entry.expression.clone(),
                    topic_space: m.topic_space.clone(),
                    discriminator: m.discriminator.clone(),
                    wildcarded: entry.wildcarded,
                    consumer_count: m.consumers.len(),
                    callback_count: m.callbacks.len(),
                    registered_at: m.registered_at,
                })
            })
            .collect()
    }

    /// Number of monitored expressions.
    #[must_use]
    pub fn monitored_expression_count(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    /// Number of monitored consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}
