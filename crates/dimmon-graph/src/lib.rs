//! The node & hook object graph: construction, addressing, connection and
//! the data-frame / generic-control-message delivery paths.
//!
//! References are modeled as an arena keyed by [`NodeId`]/[`HookId`] rather
//! than as `Rc<RefCell<_>>` cycles — nodes, hooks and peer records form
//! cycles by nature (a hook points at its owner, peer records point at each
//! other), and an id-handle arena makes the "liveness checked on dereference"
//! discipline explicit instead of leaning on Rust's own reference counting to
//! break them.

use dimmon_error::{DmmError, DmmResult, EventId, HookDirection, HookId, IdAllocator, NodeId};
use dimmon_events::{Delivery, EventRuntime};
use dimmon_frame::DataFrame;
use dimmon_message::{
    generic, ControlMessage, MessageFlags, NodeCreatePayload, NodePeeringPayload,
    ReadinessFlags, SockeventFdPayload, SockeventSubscribePayload, TimerIdPayload,
    TimerSetPayload, TYPE_GENERIC,
};
use dimmon_registry::{NodeOps, NodeType, PrivateState, TypeRegistry};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;

type HookReceiver =
    Rc<dyn Fn(&mut dyn NodeOps, NodeId, &mut PrivateState, HookId, DataFrame) -> DmmResult<()>>;

struct PeerRecord {
    hook: HookId,
}

struct Hook {
    id: HookId,
    owner: NodeId,
    name: String,
    direction: HookDirection,
    receiver_override: Option<HookReceiver>,
    peers: Vec<PeerRecord>,
    valid: bool,
    /// 1 (owner's hook-list entry) + one per connected peer + one per
    /// outstanding external reference from [`GraphRuntime::get_or_create_hook`].
    refcount: u32,
}

struct Node {
    id: NodeId,
    name: Option<String>,
    type_impl: Rc<dyn NodeType>,
    state: PrivateState,
    in_hooks: Vec<HookId>,
    out_hooks: Vec<HookId>,
    subscribed_events: Vec<EventId>,
    valid: bool,
    /// 1 (creation reference) + one per hook this node owns + one per
    /// outstanding external reference from [`GraphRuntime::resolve_addr`].
    refcount: u32,
}

/// Owns the node/hook arena, the type registry, and implements [`NodeOps`]
/// so node callbacks can send data and messages back into the graph.
pub struct GraphRuntime {
    registry: Rc<RefCell<TypeRegistry>>,
    nodes: HashMap<NodeId, Node>,
    hooks: HashMap<HookId, Hook>,
    names: HashMap<String, NodeId>,
    node_ids: IdAllocator,
    hook_ids: IdAllocator,
    current_wave: u64,
    events: EventRuntime,
}

impl GraphRuntime {
    /// Fails only if the underlying event runtime cannot be constructed
    /// (the OS multiplexer could not be created).
    pub fn new(registry: Rc<RefCell<TypeRegistry>>) -> DmmResult<Self> {
        Ok(GraphRuntime {
            registry,
            nodes: HashMap::new(),
            hooks: HashMap::new(),
            names: HashMap::new(),
            node_ids: IdAllocator::new(),
            hook_ids: IdAllocator::new(),
            current_wave: 0,
            events: EventRuntime::new()?,
        })
    }

    pub fn set_current_wave(&mut self, wave: u64) {
        self.current_wave = wave;
    }

    fn node_mut(&mut self, id: NodeId) -> DmmResult<&mut Node> {
        self.nodes.get_mut(&id).filter(|n| n.valid).ok_or(DmmError::NotFound)
    }

    fn node(&self, id: NodeId) -> DmmResult<&Node> {
        self.nodes.get(&id).filter(|n| n.valid).ok_or(DmmError::NotFound)
    }

    /// Creates a node of the named registered type. On constructor failure
    /// the partial node is discarded and never made visible.
    pub fn create_node(&mut self, type_name: &str) -> DmmResult<NodeId> {
        let type_impl = self
            .registry
            .borrow()
            .lookup(type_name)
            .ok_or(DmmError::NotFound)?;
        let id = NodeId::from_raw(self.node_ids.alloc());

        let mut state: PrivateState = Box::new(());
        let construct_result = type_impl.construct(self, id);
        match construct_result {
            Ok(built_state) => state = built_state,
            Err(e) => {
                tracing::warn!(node = %id, type_name, error = %e, "node construction failed");
                return Err(e);
            }
        }

        self.nodes.insert(
            id,
            Node {
                id,
                name: None,
                type_impl,
                state,
                in_hooks: Vec::new(),
                out_hooks: Vec::new(),
                subscribed_events: Vec::new(),
                valid: true,
                refcount: 1,
            },
        );
        tracing::debug!(node = %id, type_name, "node created");
        Ok(id)
    }

    /// Assigns (or clears, with `None`) the node's human name. Fails if the
    /// name is already taken by another live node.
    pub fn set_node_name(&mut self, id: NodeId, name: Option<String>) -> DmmResult<()> {
        if let Some(ref n) = name {
            dimmon_error::validate_name(n)?;
            if self.names.contains_key(n) {
                return Err(DmmError::AlreadyExists);
            }
        }
        let old_name = self.node_mut(id)?.name.take();
        if let Some(old) = old_name {
            self.names.remove(&old);
        }
        if let Some(ref n) = name {
            self.names.insert(n.clone(), id);
        }
        self.node_mut(id)?.name = name;
        Ok(())
    }

    /// Resolves `[<id>]` or a bare name to a node id, bumping its reference
    /// count. The caller owns the returned reference and must release it.
    pub fn resolve_addr(&mut self, addr: &str) -> DmmResult<NodeId> {
        let id = if let Some(inner) = addr.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let raw: u64 = inner.parse().map_err(|_| DmmError::InvalidArgument)?;
            NodeId::from_raw(raw)
        } else {
            *self.names.get(addr).ok_or(DmmError::NotFound)?
        };
        self.add_node_ref(id)?;
        Ok(id)
    }

    pub fn add_node_ref(&mut self, id: NodeId) -> DmmResult<()> {
        self.node_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Releases one reference; destroys the node (invoking the type
    /// destructor) once the count reaches zero.
    pub fn release_node(&mut self, id: NodeId) -> DmmResult<()> {
        let node = self.nodes.get_mut(&id).ok_or(DmmError::NotFound)?;
        assert!(node.refcount > 0, "node {id} refcount underflow");
        node.refcount -= 1;
        if node.refcount == 0 {
            debug_assert!(node.in_hooks.is_empty() && node.out_hooks.is_empty());
            let mut node = self.nodes.remove(&id).unwrap();
            if let Some(name) = node.name.take() {
                self.names.remove(&name);
            }
            let type_impl = node.type_impl.clone();
            type_impl.destruct(self, id, &mut node.state);
            tracing::debug!(node = %id, "node destroyed");
        }
        Ok(())
    }

    /// Invalidates the node, unsubscribes it from every event it still
    /// listens to, tears down every hook it owns, and releases the creation
    /// reference.
    pub fn remove_node(&mut self, id: NodeId) -> DmmResult<()> {
        let node = self.node_mut(id)?;
        node.valid = false;
        let hooks: Vec<HookId> = node.in_hooks.iter().chain(node.out_hooks.iter()).copied().collect();
        let events = std::mem::take(&mut self.nodes.get_mut(&id).unwrap().subscribed_events);

        for event in events {
            self.events.unsubscribe_any(event, id);
        }
        for hook_id in hooks {
            self.teardown_hook(hook_id)?;
        }
        self.release_node(id)?;
        Ok(())
    }

    pub fn record_subscription(&mut self, node: NodeId, event: EventId) -> DmmResult<()> {
        self.node_mut(node)?.subscribed_events.push(event);
        Ok(())
    }

    pub fn forget_subscription(&mut self, node: NodeId, event: EventId) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.subscribed_events.retain(|e| *e != event);
        }
    }

    pub fn node_exists_and_valid(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|n| n.valid).unwrap_or(false)
    }

    /// Finds a live hook of the given direction and name on `node`, or
    /// creates one (invoking the type's `new_hook` callback). A freshly
    /// returned hook's reference is owned by the caller.
    pub fn get_or_create_hook(
        &mut self,
        node: NodeId,
        name: &str,
        direction: HookDirection,
    ) -> DmmResult<HookId> {
        dimmon_error::validate_name(name)?;
        let list = match direction {
            HookDirection::In => &self.node(node)?.in_hooks,
            HookDirection::Out => &self.node(node)?.out_hooks,
        };
        if let Some(&existing) = list.iter().find(|h| self.hooks[*h].name == name) {
            let hook = self.hooks.get_mut(&existing).unwrap();
            if !hook.valid {
                return Err(DmmError::NotFound);
            }
            hook.refcount += 1;
            return Ok(existing);
        }

        let hook_id = HookId::from_raw(self.hook_ids.alloc());
        self.hooks.insert(
            hook_id,
            Hook {
                id: hook_id,
                owner: node,
                name: name.to_string(),
                direction,
                receiver_override: None,
                peers: Vec::new(),
                valid: true,
                refcount: 2, // owner's hook-list entry + this call's returned reference
            },
        );
        let type_impl = self.node(node)?.type_impl.clone();
        let mut state = std::mem::replace(&mut self.nodes.get_mut(&node).unwrap().state, Box::new(()));
        let result = type_impl.new_hook(self, node, &mut state, hook_id, name, direction);
        self.nodes.get_mut(&node).unwrap().state = state;

        if let Err(e) = result {
            self.hooks.remove(&hook_id);
            return Err(e);
        }

        let node_mut = self.node_mut(node)?;
        match direction {
            HookDirection::In => node_mut.in_hooks.push(hook_id),
            HookDirection::Out => node_mut.out_hooks.push(hook_id),
        }
        node_mut.refcount += 1; // hook's strong reference to its owner
        Ok(hook_id)
    }

    pub fn release_hook(&mut self, id: HookId) -> DmmResult<()> {
        let hook = self.hooks.get_mut(&id).ok_or(DmmError::NotFound)?;
        assert!(hook.refcount > 0, "hook {id} refcount underflow");
        hook.refcount -= 1;
        if hook.refcount == 0 {
            self.destroy_hook(id)?;
        }
        Ok(())
    }

    /// Installs a per-hook data-receiver override. Rejected on out-hooks.
    pub fn set_hook_override(&mut self, id: HookId, receiver: HookReceiver) -> DmmResult<()> {
        let hook = self.hooks.get_mut(&id).ok_or(DmmError::NotFound)?;
        if hook.direction == HookDirection::Out {
            return Err(DmmError::InvalidArgument);
        }
        hook.receiver_override = Some(receiver);
        Ok(())
    }

    fn find_hook(&self, node: NodeId, name: &str, direction: HookDirection) -> DmmResult<HookId> {
        let n = self.node(node)?;
        let list = match direction {
            HookDirection::In => &n.in_hooks,
            HookDirection::Out => &n.out_hooks,
        };
        list.iter()
            .copied()
            .find(|h| self.hooks.get(h).map(|hk| hk.name == name && hk.valid).unwrap_or(false))
            .ok_or(DmmError::NotFound)
    }

    /// Connects `src`'s out-hook to `dst`'s in-hook, creating either hook on
    /// demand. Duplicate peering of the same ordered pair fails with
    /// `AlreadyExists`; failure of the second peer record rolls back the
    /// first.
    pub fn connect(
        &mut self,
        src: NodeId,
        out_name: &str,
        dst: NodeId,
        in_name: &str,
    ) -> DmmResult<()> {
        let out_hook = self.get_or_create_hook(src, out_name, HookDirection::Out)?;
        let in_hook = match self.get_or_create_hook(dst, in_name, HookDirection::In) {
            Ok(h) => h,
            Err(e) => {
                self.release_hook(out_hook)?;
                return Err(e);
            }
        };

        if self.hooks[&out_hook].peers.iter().any(|p| p.hook == in_hook) {
            self.release_hook(out_hook)?;
            self.release_hook(in_hook)?;
            return Err(DmmError::AlreadyExists);
        }

        self.hooks.get_mut(&out_hook).unwrap().peers.push(PeerRecord { hook: in_hook });
        self.hooks.get_mut(&in_hook).unwrap().refcount += 1;

        self.hooks.get_mut(&in_hook).unwrap().peers.push(PeerRecord { hook: out_hook });
        self.hooks.get_mut(&out_hook).unwrap().refcount += 1;

        self.release_hook(out_hook)?;
        self.release_hook(in_hook)?;
        Ok(())
    }

    /// Removes the (out_hook, in_hook) peering. Both hooks must already
    /// exist; the symmetric removal is attempted on both sides even if one
    /// side is missing, and the first error encountered is returned.
    pub fn disconnect(
        &mut self,
        src: NodeId,
        out_name: &str,
        dst: NodeId,
        in_name: &str,
    ) -> DmmResult<()> {
        let out_hook = self.find_hook(src, out_name, HookDirection::Out)?;
        let in_hook = self.find_hook(dst, in_name, HookDirection::In)?;

        let forward = self.remove_peer_record(out_hook, in_hook);
        let backward = self.remove_peer_record(in_hook, out_hook);
        forward.and(backward)
    }

    fn remove_peer_record(&mut self, from: HookId, to: HookId) -> DmmResult<()> {
        let hook = self.hooks.get_mut(&from).ok_or(DmmError::NotFound)?;
        let before = hook.peers.len();
        hook.peers.retain(|p| p.hook != to);
        if hook.peers.len() == before {
            return Err(DmmError::NotFound);
        }
        self.release_hook(to)
    }

    fn teardown_hook(&mut self, id: HookId) -> DmmResult<()> {
        let hook = self.hooks.get_mut(&id).ok_or(DmmError::NotFound)?;
        hook.valid = false;
        let peers: Vec<HookId> = hook.peers.drain(..).map(|p| p.hook).collect();
        for peer in peers {
            if let Some(peer_hook) = self.hooks.get_mut(&peer) {
                peer_hook.peers.retain(|p| p.hook != id);
            }
            self.release_hook(peer)?;
            self.release_hook(id)?; // the peer record's reference to `id` itself
        }
        self.release_hook(id)
    }

    fn destroy_hook(&mut self, id: HookId) -> DmmResult<()> {
        let hook = self.hooks.remove(&id).ok_or(DmmError::NotFound)?;
        debug_assert!(hook.peers.is_empty(), "hook {id} destroyed with live peers");
        let owner = hook.owner;
        if let Some(node) = self.nodes.get(&owner) {
            let type_impl = node.type_impl.clone();
            let mut state = std::mem::replace(&mut self.nodes.get_mut(&owner).unwrap().state, Box::new(()));
            type_impl.remove_hook(self, owner, &mut state, id);
            let node_mut = self.nodes.get_mut(&owner).unwrap();
            node_mut.state = state;
            match hook.direction {
                HookDirection::In => node_mut.in_hooks.retain(|h| *h != id),
                HookDirection::Out => node_mut.out_hooks.retain(|h| *h != id),
            }
        }
        // the hook's own reference to its owner
        if self.nodes.contains_key(&owner) {
            self.release_node(owner)?;
        }
        Ok(())
    }

    /// Delivers `frame` along `node`'s out-hook named `hook_name`: fans out
    /// to every peer in-hook, via its per-hook override when set, else the
    /// type-level default. One peer's failure does not stop delivery to the
    /// rest.
    pub fn send_data_on(&mut self, node: NodeId, hook_name: &str, frame: DataFrame) -> DmmResult<()> {
        let out_hook = match self.find_hook(node, hook_name, HookDirection::Out) {
            Ok(h) => h,
            Err(_) => return Ok(()), // invalid/absent hook: short-circuit per contract
        };
        self.hooks.get_mut(&out_hook).unwrap().refcount += 1; // temporary keep-alive across fan-out

        let peers: Vec<HookId> = self.hooks[&out_hook].peers.iter().map(|p| p.hook).collect();
        for peer in peers {
            let Some(peer_hook) = self.hooks.get(&peer) else { continue };
            if !peer_hook.valid {
                continue;
            }
            let owner = peer_hook.owner;
            let override_fn = peer_hook.receiver_override.clone();
            let peer_frame = frame.clone();

            let result = if let Some(f) = override_fn {
                let mut state = std::mem::replace(&mut self.nodes.get_mut(&owner).unwrap().state, Box::new(()));
                let r = f(self, owner, &mut state, peer, peer_frame);
                self.nodes.get_mut(&owner).unwrap().state = state;
                r
            } else {
                match self.node(owner) {
                    Ok(n) => {
                        let type_impl = n.type_impl.clone();
                        let mut state = std::mem::replace(&mut self.nodes.get_mut(&owner).unwrap().state, Box::new(()));
                        let r = type_impl.receive_data(self, owner, &mut state, peer, peer_frame);
                        self.nodes.get_mut(&owner).unwrap().state = state;
                        r
                    }
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                tracing::debug!(hook = %peer, error = %e, "peer receive_data failed");
            }
        }

        self.release_hook(out_hook)?;
        Ok(())
    }

    /// The runtime's central handling of the `generic` command namespace
    /// (§4.4). Non-generic and response messages fall through to the
    /// node's own `receive_message`.
    pub fn dispatch_message(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        if msg.msg_type != TYPE_GENERIC || msg.is_response() {
            return self.forward_to_node(node, msg);
        }

        match msg.cmd {
            generic::STARTUP | generic::TIMER_TRIGGER | generic::SOCKEVENT_TRIGGER | generic::WAVEFINISH => {
                self.forward_to_node(node, msg)
            }
            generic::NODE_CREATE => self.handle_node_create(node, msg),
            generic::NODE_REMOVE => self.handle_node_remove(node, msg),
            generic::NODE_CONNECT => self.handle_node_peering(node, msg, true),
            generic::NODE_DISCONNECT => self.handle_node_peering(node, msg, false),
            generic::TIMER_CREATE => self.handle_timer_create(node, msg),
            generic::TIMER_SET => self.handle_timer_set(node, msg),
            generic::TIMER_SUBSCRIBE => self.handle_timer_subscribe(node, msg),
            generic::TIMER_UNSUBSCRIBE => self.handle_timer_unsubscribe(node, msg),
            generic::TIMER_REMOVE => self.handle_timer_remove(node, msg),
            generic::SOCKEVENT_SUBSCRIBE => self.handle_sockevent_subscribe(node, msg),
            generic::SOCKEVENT_UNSUBSCRIBE => self.handle_sockevent_unsubscribe(node, msg),
            generic::WAVEFINISH_SUBSCRIBE => self.handle_wavefinish_subscribe(node, msg),
            _ => self.respond(node, &msg, Vec::new(), Some(DmmError::InvalidArgument)),
        }
    }

    fn handle_timer_create(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let id = self.events.timer_create();
        self.respond(node, &msg, TimerIdPayload { id: id.get() }.encode(), None)
    }

    fn handle_timer_set(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = TimerSetPayload::decode(&msg.payload).and_then(|p| {
            let id = EventId::from_raw(p.id);
            self.events.timer_set(id, &p)
        });
        match outcome {
            Ok(()) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_timer_subscribe(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = TimerIdPayload::decode(&msg.payload).and_then(|p| {
            let id = EventId::from_raw(p.id);
            self.events.timer_subscribe(id, node)?;
            self.record_subscription(node, id)
        });
        match outcome {
            Ok(()) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_timer_unsubscribe(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = TimerIdPayload::decode(&msg.payload).and_then(|p| {
            let id = EventId::from_raw(p.id);
            self.events.timer_unsubscribe(id, node)?;
            self.forget_subscription(node, id);
            Ok(())
        });
        match outcome {
            Ok(()) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_timer_remove(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = TimerIdPayload::decode(&msg.payload).and_then(|p| {
            let id = EventId::from_raw(p.id);
            let former = self.events.timer_remove(id)?;
            for n in former {
                self.forget_subscription(n, id);
            }
            Ok(())
        });
        match outcome {
            Ok(()) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_sockevent_subscribe(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = SockeventSubscribePayload::decode(&msg.payload)
            .and_then(|p| self.events.sockevent_subscribe(node, p.fd as RawFd, p.events).map(|()| p.fd));
        match outcome {
            Ok(_fd) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_sockevent_unsubscribe(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = SockeventFdPayload::decode(&msg.payload)
            .and_then(|p| self.events.sockevent_unsubscribe(node, p.fd as RawFd));
        match outcome {
            Ok(()) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_wavefinish_subscribe(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let id = self.events.wavefinish_subscribe(node);
        let _ = self.record_subscription(node, id);
        self.respond(node, &msg, Vec::new(), None)
    }

    /// Delivers every `(node, message)` pair, silently dropping any whose
    /// target is no longer a valid node (it may have been removed between
    /// subscribing and the event firing).
    fn deliver_all(&mut self, deliveries: Vec<Delivery>) -> DmmResult<()> {
        for (node, msg) in deliveries {
            if !self.node_exists_and_valid(node) {
                continue;
            }
            self.add_node_ref(node)?;
            if let Err(e) = self.send_message_to(node, msg) {
                tracing::debug!(node = %node, error = %e, "event delivery failed");
            }
            self.release_node(node)?;
        }
        Ok(())
    }

    /// Starts a new wave, returning its id.
    pub fn wave_start(&mut self) -> u64 {
        let wave = self.events.wave_start();
        self.current_wave = wave;
        wave
    }

    /// Fires the current wave's wave-finish event (if any node joined it)
    /// and delivers it.
    pub fn wave_finish(&mut self) -> DmmResult<()> {
        let (deliveries, _former) = self.events.wave_finish();
        self.deliver_all(deliveries)
    }

    /// Fires and delivers every timer due by now (plus the coalesce
    /// window), or just the head timer if `force` is set.
    pub fn timers_trigger(&mut self, force: bool) -> DmmResult<()> {
        let deliveries = self.events.timers_trigger(force);
        self.deliver_all(deliveries)
    }

    /// The next timer deadline in absolute runtime-clock milliseconds, if
    /// any timer is armed.
    pub fn next_deadline(&mut self) -> DmmResult<i64> {
        self.events.next_deadline()
    }

    /// Milliseconds elapsed since the event runtime started, the same clock
    /// `next_deadline` reports against.
    pub fn now_ms(&self) -> i64 {
        self.events.now_ms()
    }

    /// Blocks on the OS multiplexer for up to `timeout_ms`; `None` blocks
    /// indefinitely.
    pub fn poll(&mut self, timeout_ms: Option<u64>) -> DmmResult<Vec<(RawFd, ReadinessFlags)>> {
        self.events.poll(timeout_ms)
    }

    /// Translates one observed `(fd, readiness)` pair into `SOCKEVENT_TRIGGER`
    /// deliveries and sends them.
    pub fn socket_event_process(&mut self, fd: RawFd, readiness: ReadinessFlags) -> DmmResult<()> {
        let deliveries = self.events.socket_event_process(fd, readiness);
        self.deliver_all(deliveries)
    }

    fn forward_to_node(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let n = self.node(node)?;
        let type_impl = n.type_impl.clone();
        let mut state = std::mem::replace(&mut self.nodes.get_mut(&node).unwrap().state, Box::new(()));
        let result = type_impl.receive_message(self, node, &mut state, msg);
        self.nodes.get_mut(&node).unwrap().state = state;
        result
    }

    fn handle_node_create(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = NodeCreatePayload::decode(&msg.payload)
            .and_then(|p| self.create_node(&p.type_name));
        match outcome {
            // Response source = new node id, empty payload (dmm_message.h:
            // "response is src of response message").
            Ok(new_id) => self.respond(new_id, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_node_remove(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        let outcome = self.remove_node(node);
        match outcome {
            Ok(()) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    fn handle_node_peering(&mut self, node: NodeId, msg: ControlMessage, connect: bool) -> DmmResult<()> {
        let outcome = NodePeeringPayload::decode(&msg.payload).and_then(|p| {
            let dst = self.resolve_addr(&p.dst_addr)?;
            let r = if connect {
                self.connect(node, &p.src_hook, dst, &p.dst_hook)
            } else {
                self.disconnect(node, &p.src_hook, dst, &p.dst_hook)
            };
            self.release_node(dst)?;
            r
        });
        match outcome {
            Ok(()) => self.respond(node, &msg, Vec::new(), None),
            Err(e) => self.respond(node, &msg, Vec::new(), Some(e)),
        }
    }

    /// Builds and sends a response for a runtime-handled generic command.
    /// On `error`, the RESPONSE carries the ERROR flag but the send itself
    /// still reports success (the error travels in-band, per contract).
    /// Delivering the response can itself fail — e.g. the requester has no
    /// `receive_message` and the default handler rejects it with
    /// `InvalidArgument` — but that is not a failure of the command the
    /// response answers, so it is logged and swallowed rather than
    /// propagated.
    fn respond(
        &mut self,
        resp_src: NodeId,
        req: &ControlMessage,
        payload: Vec<u8>,
        error: Option<DmmError>,
    ) -> DmmResult<()> {
        let mut resp = ControlMessage::create_resp(resp_src, req, payload);
        if error.is_some() {
            resp.flags.insert(MessageFlags::ERROR);
        }
        if let Err(e) = self.send_message_to(req.src, resp) {
            tracing::warn!(cmd = req.cmd, error = %e, "failed to deliver response to runtime-handled command");
        }
        Ok(())
    }
}

impl NodeOps for GraphRuntime {
    fn send_data(&mut self, node: NodeId, out_hook: &str, frame: DataFrame) -> DmmResult<()> {
        self.send_data_on(node, out_hook, frame)
    }

    fn send_message(&mut self, addr: &str, msg: ControlMessage) -> DmmResult<()> {
        let node = self.resolve_addr(addr)?;
        let result = self.dispatch_message(node, msg);
        self.release_node(node)?;
        result
    }

    fn send_message_to(&mut self, node: NodeId, msg: ControlMessage) -> DmmResult<()> {
        self.dispatch_message(node, msg)
    }

    fn create_node(&mut self, type_name: &str) -> DmmResult<NodeId> {
        GraphRuntime::create_node(self, type_name)
    }

    fn connect_hooks(
        &mut self,
        src: NodeId,
        out_hook: &str,
        dst_addr: &str,
        in_hook: &str,
    ) -> DmmResult<()> {
        let dst = self.resolve_addr(dst_addr)?;
        let result = self.connect(src, out_hook, dst, in_hook);
        self.release_node(dst)?;
        result
    }

    fn current_wave(&self) -> u64 {
        self.current_wave
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dimmon_message::MessageFlags;
    use std::cell::Cell;

    struct RecordingSink {
        received: Rc<Cell<u32>>,
    }
    impl NodeType for RecordingSink {
        fn construct(&self, _ops: &mut dyn NodeOps, _node: NodeId) -> DmmResult<PrivateState> {
            Ok(Box::new(self.received.clone()))
        }
        fn receive_data(
            &self,
            _ops: &mut dyn NodeOps,
            _node: NodeId,
            state: &mut PrivateState,
            _hook: HookId,
            _frame: DataFrame,
        ) -> DmmResult<()> {
            let counter = state.downcast_ref::<Rc<Cell<u32>>>().unwrap();
            counter.set(counter.get() + 1);
            Ok(())
        }
    }

    struct PlainSource;
    impl NodeType for PlainSource {}

    struct RecordingRequester {
        last: Rc<RefCell<Option<ControlMessage>>>,
    }
    impl NodeType for RecordingRequester {
        fn construct(&self, _ops: &mut dyn NodeOps, _node: NodeId) -> DmmResult<PrivateState> {
            Ok(Box::new(self.last.clone()))
        }
        fn receive_message(
            &self,
            _ops: &mut dyn NodeOps,
            _node: NodeId,
            state: &mut PrivateState,
            msg: ControlMessage,
        ) -> DmmResult<()> {
            let last = state.downcast_ref::<Rc<RefCell<Option<ControlMessage>>>>().unwrap();
            *last.borrow_mut() = Some(msg);
            Ok(())
        }
    }

    fn registry_with_types() -> Rc<RefCell<TypeRegistry>> {
        Rc::new(RefCell::new(TypeRegistry::new()))
    }

    #[test]
    fn create_connect_send_disconnect_round_trip() {
        let registry = registry_with_types();
        let received = Rc::new(Cell::new(0u32));
        registry
            .borrow_mut()
            .register("source", Rc::new(PlainSource))
            .unwrap();
        registry
            .borrow_mut()
            .register(
                "sink",
                Rc::new(RecordingSink {
                    received: received.clone(),
                }),
            )
            .unwrap();

        let mut graph = GraphRuntime::new(registry).unwrap();
        let src = graph.create_node("source").unwrap();
        let dst = graph.create_node("sink").unwrap();

        graph.connect(src, "out", dst, "in").unwrap();
        assert_eq!(
            graph.connect(src, "out", dst, "in"),
            Err(DmmError::AlreadyExists)
        );

        let frame = DataFrame::with_capacity(1, 2);
        frame.push(42, b"hi".to_vec()).unwrap();
        graph.send_data_on(src, "out", frame).unwrap();
        assert_eq!(received.get(), 1);

        graph.disconnect(src, "out", dst, "in").unwrap();
        assert_eq!(
            graph.disconnect(src, "out", dst, "in"),
            Err(DmmError::NotFound)
        );
    }

    #[test]
    fn node_create_generic_command_returns_new_id_in_response() {
        let registry = registry_with_types();
        registry.borrow_mut().register("source", Rc::new(PlainSource)).unwrap();
        let last = Rc::new(RefCell::new(None));
        registry
            .borrow_mut()
            .register("requester", Rc::new(RecordingRequester { last: last.clone() }))
            .unwrap();
        let mut graph = GraphRuntime::new(registry).unwrap();
        let starter = graph.create_node("requester").unwrap();

        let msg = ControlMessage::create(
            starter,
            generic::NODE_CREATE,
            TYPE_GENERIC,
            7,
            MessageFlags::empty(),
            NodeCreatePayload {
                type_name: "source".into(),
            }
            .encode(),
        );
        graph.dispatch_message(starter, msg).unwrap();

        let resp = last.borrow_mut().take().expect("response delivered");
        assert!(resp.is_response());
        assert_ne!(resp.src, starter, "response source must be the new node, not the requester");
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn unknown_generic_command_yields_invalid_argument_response_with_error_flag() {
        let registry = registry_with_types();
        registry.borrow_mut().register("source", Rc::new(PlainSource)).unwrap();
        let mut graph = GraphRuntime::new(registry).unwrap();
        let node = graph.create_node("source").unwrap();
        let msg = ControlMessage::create(node, 9999, TYPE_GENERIC, 1, MessageFlags::empty(), Vec::new());
        graph.dispatch_message(node, msg).unwrap();
    }
}
