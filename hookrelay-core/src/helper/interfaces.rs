//! Interfaces a helper answers calls for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::message::{Call, Interface, Reply};

/// Server side of one RPC interface. Argument and result bodies are
/// opaque to the relay.
#[async_trait]
pub trait InterfaceHandler: Send + Sync + 'static {
    async fn handle(&self, operation: u32, args: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// Maps interface tags to their handlers.
#[derive(Clone, Default)]
pub struct InterfaceRegistry {
    handlers: HashMap<Interface, Arc<dyn InterfaceHandler>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `interface`, returning the handler it
    /// replaced.
    pub fn register(
        &mut self,
        interface: Interface,
        handler: Arc<dyn InterfaceHandler>,
    ) -> Option<Arc<dyn InterfaceHandler>> {
        self.handlers.insert(interface, handler)
    }

    pub fn with(mut self, interface: Interface, handler: Arc<dyn InterfaceHandler>) -> Self {
        self.register(interface, handler);
        self
    }

    pub fn contains(&self, interface: Interface) -> bool {
        self.handlers.contains_key(&interface)
    }

    /// Registered interfaces, sorted; announced in `Hello`.
    pub fn interfaces(&self) -> Vec<Interface> {
        let mut out: Vec<Interface> = self.handlers.keys().copied().collect();
        out.sort();
        out
    }

    /// Answer one call. Unknown interfaces get an error reply.
    pub async fn dispatch(&self, call: Call) -> Reply {
        let Call {
            call_id,
            interface,
            operation,
            args,
        } = call;
        let result = match self.handlers.get(&interface) {
            Some(handler) => handler.handle(operation, args).await,
            None => {
                debug!(%interface, operation, "call for unregistered interface");
                Err(format!("interface {interface} is not served by this helper"))
            }
        };
        Reply { call_id, result }
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("interfaces", &self.interfaces())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl InterfaceHandler for Echo {
        async fn handle(&self, operation: u32, mut args: Vec<u8>) -> Result<Vec<u8>, String> {
            args.push(operation as u8);
            Ok(args)
        }
    }

    fn call(interface: Interface) -> Call {
        Call {
            call_id: 9,
            interface,
            operation: 3,
            args: vec![1],
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let registry = InterfaceRegistry::new().with(Interface::VirtualBuffer, Arc::new(Echo));
        let reply = registry.dispatch(call(Interface::VirtualBuffer)).await;
        assert_eq!(reply.call_id, 9);
        assert_eq!(reply.result, Ok(vec![1, 3]));
    }

    #[tokio::test]
    async fn unknown_interface_gets_error_reply() {
        let registry = InterfaceRegistry::new();
        let reply = registry.dispatch(call(Interface::Audio)).await;
        assert!(reply.result.is_err());
    }

    #[test]
    fn interfaces_are_sorted() {
        let registry = InterfaceRegistry::new()
            .with(Interface::DisplayModel, Arc::new(Echo))
            .with(Interface::VirtualBuffer, Arc::new(Echo));
        assert_eq!(
            registry.interfaces(),
            vec![Interface::VirtualBuffer, Interface::DisplayModel]
        );
    }
}
