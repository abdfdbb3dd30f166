use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

#[cfg(test)]
use mockall::automock;

use crate::{error::ServerError, matcher::Matcher};

// The registry's view of an upstream. Mocked in tests; implemented by
// `Upstream` in production.
#[cfg_attr(test, automock)]
pub(crate) trait TunnelHandler {
    // The id of the SSH connection that owns this upstream.
    fn connection_id(&self) -> usize;
    // Starts tearing the upstream down. Must not block.
    fn close(&self);
    fn set_proxy_protocol(&self, enabled: bool);
}

struct ConnectionEntry {
    // Patterns currently bound by this connection.
    owned: HashSet<String>,
    // Snapshot of the patterns this connection is permitted to bind,
    // taken from its credentials at registration time.
    allowed: Matcher<()>,
}

struct RegistryState<H> {
    bindings: Matcher<Arc<H>>,
    connections: HashMap<usize, ConnectionEntry>,
}

// Hostname pattern -> upstream, with per-connection ownership. All
// operations are serialized by one reader/writer lock; none of them
// performs I/O while holding it.
//
// Invariants at lock release: every pattern in `bindings` appears in
// exactly one connection's owned set, and every owned pattern is a key
// in `bindings`.
pub(crate) struct BindingRegistry<H> {
    state: RwLock<RegistryState<H>>,
}

impl<H: TunnelHandler> BindingRegistry<H> {
    pub(crate) fn new() -> Self {
        BindingRegistry {
            state: RwLock::new(RegistryState {
                bindings: Matcher::new(),
                connections: HashMap::new(),
            }),
        }
    }

    // Records a connection and snapshots its allowed patterns into a
    // dedicated matcher.
    pub(crate) fn add_connection(
        &self,
        connection: usize,
        allowed_patterns: &[String],
    ) -> Result<(), ServerError> {
        let mut state = self.state.write().expect("not poisoned");
        if state.connections.contains_key(&connection) {
            return Err(ServerError::ConnectionAlreadyExists);
        }
        let allowed = Matcher::new();
        for pattern in allowed_patterns {
            let _ = allowed.insert(pattern, ());
        }
        state.connections.insert(
            connection,
            ConnectionEntry {
                owned: HashSet::new(),
                allowed,
            },
        );
        Ok(())
    }

    // Removes a connection and asynchronously closes every upstream it
    // owns. Idempotent for unknown connections.
    pub(crate) fn remove_connection(&self, connection: usize) {
        let mut state = self.state.write().expect("not poisoned");
        let RegistryState {
            bindings,
            connections,
        } = &mut *state;
        let Some(entry) = connections.remove(&connection) else {
            return;
        };
        for pattern in entry.owned {
            if let Some(upstream) = bindings.get(&pattern) {
                upstream.close();
                bindings.remove(&pattern);
            }
        }
    }

    pub(crate) fn add_binding(
        &self,
        connection: usize,
        pattern: &str,
        upstream: Arc<H>,
    ) -> Result<(), ServerError> {
        let mut state = self.state.write().expect("not poisoned");
        let RegistryState {
            bindings,
            connections,
        } = &mut *state;
        let Some(entry) = connections.get_mut(&connection) else {
            return Err(ServerError::ConnectionNotFound);
        };
        if !entry.allowed.match_pattern(pattern) {
            return Err(ServerError::BindingNotAllowed);
        }
        if bindings.contains(pattern) {
            return Err(ServerError::BindingAlreadyExists);
        }
        bindings
            .insert(pattern, upstream)
            .map_err(|_| ServerError::BindingAlreadyExists)?;
        entry.owned.insert(pattern.into());
        Ok(())
    }

    pub(crate) fn has_binding(&self, pattern: &str) -> bool {
        self.state
            .read()
            .expect("not poisoned")
            .bindings
            .contains(pattern)
    }

    // Wildcard match of a concrete domain against the bound patterns.
    pub(crate) fn resolve(&self, domain: &str) -> Option<Arc<H>> {
        self.state
            .read()
            .expect("not poisoned")
            .bindings
            .match_domain(domain)
    }

    // Detaches a binding from both the registry and its owning
    // connection, closing the upstream asynchronously. Reports whether
    // the binding existed.
    pub(crate) fn remove_binding(&self, pattern: &str) -> bool {
        let mut state = self.state.write().expect("not poisoned");
        let RegistryState {
            bindings,
            connections,
        } = &mut *state;
        let Some(upstream) = bindings.get(pattern) else {
            return false;
        };
        upstream.close();
        bindings.remove(pattern);
        if let Some(entry) = connections.get_mut(&upstream.connection_id()) {
            entry.owned.remove(pattern);
        }
        true
    }

    // Toggles the PROXY protocol flag on a bound upstream. Requires the
    // calling connection and the binding to exist, but does not require
    // the binding to be owned by the caller.
    pub(crate) fn set_proxy_protocol(
        &self,
        connection: usize,
        pattern: &str,
        enabled: bool,
    ) -> Result<(), ServerError> {
        let state = self.state.write().expect("not poisoned");
        if !state.connections.contains_key(&connection) {
            return Err(ServerError::ConnectionNotFound);
        }
        let Some(upstream) = state.bindings.get(pattern) else {
            return Err(ServerError::BindingNotFound);
        };
        upstream.set_proxy_protocol(enabled);
        Ok(())
    }

    // Read-locked iteration over a connection's owned upstreams,
    // short-circuiting on the first callback error.
    pub(crate) fn each_binding<E>(
        &self,
        connection: usize,
        mut callback: impl FnMut(&str, &Arc<H>) -> Result<(), E>,
    ) -> Result<(), E> {
        let state = self.state.read().expect("not poisoned");
        let Some(entry) = state.connections.get(&connection) else {
            return Ok(());
        };
        for pattern in entry.owned.iter() {
            if let Some(upstream) = state.bindings.get(pattern) {
                callback(pattern, &upstream)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod binding_registry_tests {
    use std::sync::Arc;

    use crate::error::ServerError;

    use super::{BindingRegistry, MockTunnelHandler};

    fn upstream_owned_by(connection: usize) -> Arc<MockTunnelHandler> {
        let mut mock = MockTunnelHandler::new();
        mock.expect_connection_id().return_const(connection);
        mock.expect_close().never();
        Arc::new(mock)
    }

    fn closable_upstream(connection: usize) -> Arc<MockTunnelHandler> {
        let mut mock = MockTunnelHandler::new();
        mock.expect_connection_id().return_const(connection);
        mock.expect_close().once().return_const(());
        Arc::new(mock)
    }

    #[test]
    fn binding_ownership_is_exclusive() {
        let registry = BindingRegistry::new();
        registry
            .add_connection(1, &["**.example.com".into()])
            .unwrap();
        registry
            .add_connection(2, &["**.example.com".into()])
            .unwrap();
        registry
            .add_binding(1, "play.example.com", upstream_owned_by(1))
            .unwrap();
        assert!(matches!(
            registry.add_binding(2, "play.example.com", upstream_owned_by(2)),
            Err(ServerError::BindingAlreadyExists)
        ));
    }

    #[test]
    fn allowance_uses_pattern_matching() {
        let registry = BindingRegistry::new();
        registry
            .add_connection(1, &["*.example.com".into()])
            .unwrap();
        assert!(matches!(
            registry.add_binding(1, "example.net", upstream_owned_by(1)),
            Err(ServerError::BindingNotAllowed)
        ));
        registry
            .add_binding(1, "foo.example.com", upstream_owned_by(1))
            .unwrap();
        assert!(registry.has_binding("foo.example.com"));
    }

    #[test]
    fn unknown_connections_cannot_bind() {
        let registry = BindingRegistry::new();
        assert!(matches!(
            registry.add_binding(7, "foo.example.com", upstream_owned_by(7)),
            Err(ServerError::ConnectionNotFound)
        ));
    }

    #[test]
    fn duplicate_connections_are_rejected() {
        let registry = BindingRegistry::<MockTunnelHandler>::new();
        registry.add_connection(1, &[]).unwrap();
        assert!(matches!(
            registry.add_connection(1, &[]),
            Err(ServerError::ConnectionAlreadyExists)
        ));
    }

    #[test]
    fn resolve_expands_wildcards() {
        let registry = BindingRegistry::new();
        registry
            .add_connection(1, &["**.example.com".into()])
            .unwrap();
        registry
            .add_binding(1, "*.example.com", upstream_owned_by(1))
            .unwrap();
        assert!(registry.resolve("play.example.com").is_some());
        assert!(registry.resolve("example.com").is_none());
        assert!(registry.resolve("play.example.net").is_none());
    }

    #[test]
    fn removing_a_connection_closes_and_detaches_everything() {
        let registry = BindingRegistry::new();
        registry
            .add_connection(1, &["**.example.com".into()])
            .unwrap();
        registry
            .add_binding(1, "foo.example.com", closable_upstream(1))
            .unwrap();
        registry
            .add_binding(1, "bar.example.com", closable_upstream(1))
            .unwrap();
        registry.remove_connection(1);
        assert!(!registry.has_binding("foo.example.com"));
        assert!(!registry.has_binding("bar.example.com"));
        assert!(registry.resolve("foo.example.com").is_none());
        assert!(registry.resolve("bar.example.com").is_none());
        // Idempotent for connections that are already gone.
        registry.remove_connection(1);
    }

    #[test]
    fn removed_bindings_can_be_bound_again() {
        let registry = BindingRegistry::new();
        registry
            .add_connection(1, &["**.example.com".into()])
            .unwrap();
        registry
            .add_binding(1, "foo.example.com", closable_upstream(1))
            .unwrap();
        assert!(registry.remove_binding("foo.example.com"));
        assert!(!registry.remove_binding("foo.example.com"));
        assert!(!registry.has_binding("foo.example.com"));
        registry
            .add_binding(1, "foo.example.com", upstream_owned_by(1))
            .unwrap();
    }

    #[test]
    fn proxy_protocol_toggle_checks_existence_only() {
        let registry = BindingRegistry::new();
        registry
            .add_connection(1, &["**.example.com".into()])
            .unwrap();
        registry.add_connection(2, &[]).unwrap();
        let mut mock = MockTunnelHandler::new();
        mock.expect_connection_id().return_const(1usize);
        mock.expect_close().never();
        mock.expect_set_proxy_protocol().once().return_const(());
        registry
            .add_binding(1, "foo.example.com", Arc::new(mock))
            .unwrap();
        assert!(matches!(
            registry.set_proxy_protocol(9, "foo.example.com", true),
            Err(ServerError::ConnectionNotFound)
        ));
        assert!(matches!(
            registry.set_proxy_protocol(1, "bar.example.com", true),
            Err(ServerError::BindingNotFound)
        ));
        // A connection that does not own the binding may still toggle it.
        registry
            .set_proxy_protocol(2, "foo.example.com", true)
            .unwrap();
    }

    #[test]
    fn each_binding_visits_only_owned_upstreams() {
        let registry = BindingRegistry::new();
        registry
            .add_connection(1, &["**.example.com".into()])
            .unwrap();
        registry
            .add_connection(2, &["**.example.net".into()])
            .unwrap();
        registry
            .add_binding(1, "foo.example.com", upstream_owned_by(1))
            .unwrap();
        registry
            .add_binding(1, "bar.example.com", upstream_owned_by(1))
            .unwrap();
        registry
            .add_binding(2, "foo.example.net", upstream_owned_by(2))
            .unwrap();
        let mut visited = Vec::new();
        let _: Result<(), ()> = registry.each_binding(1, |pattern, _| {
            visited.push(pattern.to_string());
            Ok(())
        });
        visited.sort();
        assert_eq!(visited, vec!["bar.example.com", "foo.example.com"]);
        // Short-circuits on the first callback error.
        let mut seen = 0;
        let result: Result<(), &str> = registry.each_binding(1, |_, _| {
            seen += 1;
            Err("stop")
        });
        assert_eq!(result, Err("stop"));
        assert_eq!(seen, 1);
    }
}
