//! Type registry: maps a textual type name to a vtable of node callbacks.
//!
//! This crate defines the vtable trait ([`NodeType`]) and the port the
//! callbacks call back through ([`NodeOps`]) but does not implement either
//! the graph or any concrete node type — that keeps this crate leaf-like
//! (depends only on the frame/message/error crates) while `dimmon-graph`
//! implements [`NodeOps`] and `dimmon-nodes` implements [`NodeType`].

use dimmon_error::{DmmError, DmmResult, HookDirection, HookId, NodeId};
use dimmon_frame::DataFrame;
use dimmon_message::ControlMessage;
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

/// Per-node opaque state, owned by whatever [`NodeType`] constructed it.
pub type PrivateState = Box<dyn Any>;

/// The operations a node's callbacks may perform on the surrounding graph.
/// Implemented by `dimmon-graph`'s runtime context; this crate only
/// describes the shape (the "port" half of a ports-and-adapters split that
/// avoids a registry → graph dependency cycle).
pub trait NodeOps {
    /// Sends `frame` along `node`'s out-hook named `out_hook`, fanning out to
    /// every peer in-hook.
    fn send_data(&mut self, node: NodeId, out_hook: &str, frame: DataFrame) -> DmmResult<()>;

    /// Resolves `addr` (an `[id]` or a name) and delivers `msg` to it,
    /// consuming `msg` on success. Does not consume `msg` if resolution
    /// fails.
    fn send_message(&mut self, addr: &str, msg: ControlMessage) -> DmmResult<()>;

    /// Sends `msg` directly to an already-resolved node id, consuming it.
    fn send_message_to(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()>;

    /// Creates a node of the named registered type directly, bypassing the
    /// `NODE_CREATE` generic command. For bootstrap-style callers (the
    /// starter) that build several nodes up front and would otherwise need
    /// to observe a `NODE_CREATE` response addressed back to their own,
    /// already-in-progress callback — which this runtime does not support,
    /// since a node's private state is checked out for the duration of the
    /// callback that is sending the command.
    fn create_node(&mut self, type_name: &str) -> DmmResult<NodeId>;

    /// Connects `src`'s out-hook to `dst_addr`'s in-hook directly, bypassing
    /// `NODE_CONNECT`, for the same reason as [`NodeOps::create_node`].
    fn connect_hooks(
        &mut self,
        src: NodeId,
        out_hook: &str,
        dst_addr: &str,
        in_hook: &str,
    ) -> DmmResult<()>;

    /// Convenience: builds a response to `req` from this node and delivers it
    /// to `req.src`.
    fn reply(&mut self, node: NodeId, req: &ControlMessage, payload: Vec<u8>) -> DmmResult<()> {
        let resp = ControlMessage::create_resp(node, req, payload);
        self.send_message_to(req.src, resp)
    }

    /// The wave currently in progress, for node types that want to log or
    /// correlate by wave id.
    fn current_wave(&self) -> u64;
}

/// The vtable a registered type provides. Every method is optional in
/// spirit — the default implementation is exactly the "callback absent"
/// behavior from the contract, so a type only overrides what it supports.
pub trait NodeType {
    /// Called once, right after id/hook-list/subscription-list
    /// initialization, before the node is made visible on the global list.
    /// Default: trivial success with no private state.
    fn construct(&self, _ops: &mut dyn NodeOps, _node: NodeId) -> DmmResult<PrivateState> {
        Ok(Box::new(()))
    }

    /// Called once the node's reference count reaches zero. Default: no-op.
    fn destruct(&self, _ops: &mut dyn NodeOps, _node: NodeId, _state: &mut PrivateState) {}

    /// Delivers a data frame received on an in-hook that has no per-hook
    /// override. Default: not supported.
    fn receive_data(
        &self,
        _ops: &mut dyn NodeOps,
        _node: NodeId,
        _state: &mut PrivateState,
        _hook: HookId,
        _frame: DataFrame,
    ) -> DmmResult<()> {
        Err(DmmError::NotSupported)
    }

    /// Delivers a non-generic or response control message. Default: rejected.
    fn receive_message(
        &self,
        _ops: &mut dyn NodeOps,
        _node: NodeId,
        _state: &mut PrivateState,
        _msg: ControlMessage,
    ) -> DmmResult<()> {
        Err(DmmError::InvalidArgument)
    }

    /// Called after a hook is created on a node of this type, before it is
    /// considered usable. Returning an error rolls back the hook creation.
    /// Default: accept.
    fn new_hook(
        &self,
        _ops: &mut dyn NodeOps,
        _node: NodeId,
        _state: &mut PrivateState,
        _hook: HookId,
        _name: &str,
        _direction: HookDirection,
    ) -> DmmResult<()> {
        Ok(())
    }

    /// Called as a hook's last reference drops, before it is unlinked.
    /// Default: no-op.
    fn remove_hook(
        &self,
        _ops: &mut dyn NodeOps,
        _node: NodeId,
        _state: &mut PrivateState,
        _hook: HookId,
    ) {
    }
}

/// Module-scoped singleton state: types live for the process lifetime, there
/// is no unregister.
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<String, Rc<dyn NodeType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            types: HashMap::new(),
        }
    }

    /// Registers `type_impl` under `name`. Fails with
    /// [`DmmError::InvalidArgument`] if the name is empty or overlong, or
    /// [`DmmError::AlreadyExists`] if the name is taken.
    pub fn register(&mut self, name: &str, type_impl: Rc<dyn NodeType>) -> DmmResult<()> {
        dimmon_error::validate_type_name(name)?;
        if self.types.contains_key(name) {
            return Err(DmmError::AlreadyExists);
        }
        tracing::debug!(type_name = name, "registering node type");
        self.types.insert(name.to_string(), type_impl);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<dyn NodeType>> {
        self.types.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl NodeType for Noop {}

    #[test]
    fn register_then_lookup() {
        let mut reg = TypeRegistry::new();
        reg.register("noop", Rc::new(Noop)).unwrap();
        assert!(reg.lookup("noop").is_some());
        assert!(reg.lookup("missing").is_none());
    }

    #[test]
    fn duplicate_register_is_already_exists() {
        let mut reg = TypeRegistry::new();
        reg.register("noop", Rc::new(Noop)).unwrap();
        assert_eq!(
            reg.register("noop", Rc::new(Noop)),
            Err(DmmError::AlreadyExists)
        );
    }

    #[test]
    fn overlong_name_is_invalid_argument() {
        let mut reg = TypeRegistry::new();
        let name = "a".repeat(dimmon_error::NAME_LIMIT);
        assert_eq!(
            reg.register(&name, Rc::new(Noop)),
            Err(DmmError::InvalidArgument)
        );
    }

    #[test]
    fn default_callbacks_match_absent_callback_contract() {
        struct Ctx;
        impl NodeOps for Ctx {
            fn send_data(&mut self, _: NodeId, _: &str, _: DataFrame) -> DmmResult<()> {
                unreachable!()
            }
            fn send_message(&mut self, _: &str, _: ControlMessage) -> DmmResult<()> {
                unreachable!()
            }
            fn send_message_to(&mut self, _: NodeId, _: ControlMessage) -> DmmResult<()> {
                unreachable!()
            }
            fn create_node(&mut self, _: &str) -> DmmResult<NodeId> {
                unreachable!()
            }
            fn connect_hooks(&mut self, _: NodeId, _: &str, _: &str, _: &str) -> DmmResult<()> {
                unreachable!()
            }
            fn current_wave(&self) -> u64 {
                0
            }
        }
        let noop = Noop;
        let mut ctx = Ctx;
        let mut state: PrivateState = Box::new(());
        let frame = DataFrame::with_capacity(0, 0);
        assert_eq!(
            noop.receive_data(&mut ctx, NodeId::from_raw(1), &mut state, HookId::from_raw(1), frame),
            Err(DmmError::NotSupported)
        );
        let msg = ControlMessage::create(
            NodeId::from_raw(1),
            0,
            0,
            0,
            dimmon_message::MessageFlags::empty(),
            Vec::new(),
        );
        assert_eq!(
            noop.receive_message(&mut ctx, NodeId::from_raw(1), &mut state, msg),
            Err(DmmError::InvalidArgument)
        );
    }
}
