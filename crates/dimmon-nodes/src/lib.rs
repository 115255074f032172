//! Built-in node types: a timer-driven sensor source, a frame-recording
//! sink, a wave-buffering aggregator, and a pipeline starter that builds a
//! node graph from a small line-oriented descriptor on `STARTUP`.
//!
//! None of these rely on reading back a synchronous response to a request
//! the node's own callback just sent — a node's private state is swapped
//! out for the duration of its own callback, so a response that loops back
//! to the same node before that callback returns arrives with a stand-in
//! state rather than the real one. `WaveBuf`'s self-subscribe and
//! `Starter`'s node creation sidestep this by treating such responses as
//! fire-and-forget (`WaveBuf`) or by calling the graph directly through
//! [`NodeOps::create_node`]/[`NodeOps::connect_hooks`] instead of the
//! message path (`Starter`).

use dimmon_error::{DmmError, DmmResult, HookDirection, HookId, NodeId};
use dimmon_frame::DataFrame;
use dimmon_message::{generic, ControlMessage, MessageFlags, StartupPayload, TYPE_GENERIC};
use dimmon_registry::{NodeOps, NodeType, PrivateState};
use std::cell::RefCell;
use std::rc::Rc;

/// Sensor-style source: on every `TIMER_TRIGGER` it receives, emits one
/// frame on its `out` hook carrying a single fixed datanode. Grounded in the
/// original's `sensors/dummy` module — a source with no real hardware behind
/// it, used to exercise the pipeline.
pub struct Source {
    pub sensor_id: u32,
    pub payload: Vec<u8>,
}

impl Source {
    pub fn new(sensor_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Source {
            sensor_id,
            payload: payload.into(),
        }
    }
}

impl NodeType for Source {
    fn receive_message(
        &self,
        ops: &mut dyn NodeOps,
        node: NodeId,
        _state: &mut PrivateState,
        msg: ControlMessage,
    ) -> DmmResult<()> {
        if msg.msg_type != TYPE_GENERIC || msg.cmd != generic::TIMER_TRIGGER {
            return Ok(());
        }
        let frame = DataFrame::with_capacity(1, self.payload.len());
        frame.push(self.sensor_id, self.payload.clone())?;
        ops.send_data(node, "out", frame)
    }
}

/// Accepts any number of `in` hooks and records every frame it receives, in
/// arrival order. Grounded in the original's `blackhole` (accept-any-in,
/// discard) and `dbgprinter` (records for inspection instead of discarding).
pub struct Sink {
    received: Rc<RefCell<Vec<DataFrame>>>,
}

impl Sink {
    pub fn new() -> Self {
        Sink {
            received: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// A handle the test or embedder can poll independently of the graph.
    pub fn received(&self) -> Rc<RefCell<Vec<DataFrame>>> {
        self.received.clone()
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeType for Sink {
    fn construct(&self, _ops: &mut dyn NodeOps, _node: NodeId) -> DmmResult<PrivateState> {
        Ok(Box::new(self.received.clone()))
    }

    fn new_hook(
        &self,
        _ops: &mut dyn NodeOps,
        _node: NodeId,
        _state: &mut PrivateState,
        _hook: HookId,
        _name: &str,
        direction: HookDirection,
    ) -> DmmResult<()> {
        if direction == HookDirection::Out {
            return Err(DmmError::InvalidArgument);
        }
        Ok(())
    }

    fn receive_data(
        &self,
        _ops: &mut dyn NodeOps,
        _node: NodeId,
        state: &mut PrivateState,
        _hook: HookId,
        frame: DataFrame,
    ) -> DmmResult<()> {
        let received = state
            .downcast_ref::<Rc<RefCell<Vec<DataFrame>>>>()
            .expect("Sink private state always holds its recording buffer");
        received.borrow_mut().push(frame);
        Ok(())
    }
}

/// Wave-buffering aggregator: on the first frame of a wave it subscribes to
/// `WAVEFINISH`; at wave end it concatenates every datanode received this
/// wave into one outgoing frame on `out` and clears its buffer. Grounded in
/// the original's `wavebuf` module.
pub struct WaveBuf;

struct WaveBufState {
    buffered: Vec<DataFrame>,
    subscribed: bool,
}

impl NodeType for WaveBuf {
    fn construct(&self, _ops: &mut dyn NodeOps, _node: NodeId) -> DmmResult<PrivateState> {
        Ok(Box::new(WaveBufState {
            buffered: Vec::new(),
            subscribed: false,
        }))
    }

    fn new_hook(
        &self,
        _ops: &mut dyn NodeOps,
        _node: NodeId,
        _state: &mut PrivateState,
        _hook: HookId,
        name: &str,
        direction: HookDirection,
    ) -> DmmResult<()> {
        match (direction, name) {
            (HookDirection::In, _) => Ok(()),
            (HookDirection::Out, "out") => Ok(()),
            (HookDirection::Out, _) => Err(DmmError::InvalidArgument),
        }
    }

    fn receive_data(
        &self,
        ops: &mut dyn NodeOps,
        node: NodeId,
        state: &mut PrivateState,
        _hook: HookId,
        frame: DataFrame,
    ) -> DmmResult<()> {
        let pvt = state
            .downcast_mut::<WaveBufState>()
            .expect("WaveBuf private state always holds WaveBufState");
        if !pvt.subscribed {
            let sub = ControlMessage::create(
                node,
                generic::WAVEFINISH_SUBSCRIBE,
                TYPE_GENERIC,
                0,
                MessageFlags::empty(),
                Vec::new(),
            );
            // Fire-and-forget: the subscribe itself lands synchronously below,
            // before this call returns, so the effect is already in place
            // regardless of whether the confirmation response makes it back.
            if let Err(e) = ops.send_message_to(node, sub) {
                tracing::debug!(node = %node, error = %e, "wavefinish self-subscribe response lost");
            }
            pvt.subscribed = true;
        }
        pvt.buffered.push(frame);
        Ok(())
    }

    fn receive_message(
        &self,
        ops: &mut dyn NodeOps,
        node: NodeId,
        state: &mut PrivateState,
        msg: ControlMessage,
    ) -> DmmResult<()> {
        if msg.is_response() || msg.msg_type != TYPE_GENERIC || msg.cmd != generic::WAVEFINISH {
            return Ok(());
        }
        let pvt = state
            .downcast_mut::<WaveBufState>()
            .expect("WaveBuf private state always holds WaveBufState");
        if pvt.buffered.is_empty() {
            pvt.subscribed = false;
            return Ok(());
        }
        let total: usize = pvt.buffered.iter().map(|f| f.datanode_count()).sum();
        let out = DataFrame::with_capacity(total, 0);
        for buffered in pvt.buffered.drain(..) {
            buffered.for_each(|dn| {
                let _ = out.push(dn.sensor_id, dn.payload.clone());
            });
        }
        pvt.subscribed = false;
        ops.send_data(node, "out", out)
    }
}

/// Builds a pipeline from a small line-oriented descriptor delivered on
/// `STARTUP` (§6's verbatim remainder after the starter-type line). Each
/// non-blank, non-`#` line is one of:
///
/// ```text
/// create <local-name> <type>
/// connect <local-name>:<out-hook> -> <local-name>:<in-hook>
/// ```
///
/// `<local-name>` only needs to be unique within the descriptor — it is not
/// the node's registry name, just a label this node uses to remember which
/// id it created for which line. Unlike the original's hardcoded,
/// application-specific starter, this one is a generic pipeline builder; the
/// original's command-queue bootstrapping (creating one fixed topology of
/// sensor/buffer/network nodes) is exactly what a descriptor like this one
/// expresses declaratively instead.
pub struct Starter;

impl NodeType for Starter {
    fn receive_message(
        &self,
        ops: &mut dyn NodeOps,
        node: NodeId,
        _state: &mut PrivateState,
        msg: ControlMessage,
    ) -> DmmResult<()> {
        if msg.msg_type != TYPE_GENERIC || msg.cmd != generic::STARTUP {
            return Ok(());
        }
        let payload = StartupPayload::decode(&msg.payload)?;
        run_descriptor(ops, node, &payload.descriptor)
    }
}

fn run_descriptor(ops: &mut dyn NodeOps, _node: NodeId, descriptor: &str) -> DmmResult<()> {
    use std::collections::HashMap;
    let mut created: HashMap<String, NodeId> = HashMap::new();

    for (lineno, raw_line) in descriptor.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("create") => {
                let local_name = words.next().ok_or(DmmError::InvalidArgument)?;
                let type_name = words.next().ok_or(DmmError::InvalidArgument)?;
                let id = ops.create_node(type_name)?;
                created.insert(local_name.to_string(), id);
            }
            Some("connect") => {
                let rest: Vec<&str> = words.collect();
                let joined = rest.join(" ");
                let (left, right) = joined
                    .split_once("->")
                    .ok_or(DmmError::InvalidArgument)?;
                let (src_name, src_hook) =
                    left.trim().split_once(':').ok_or(DmmError::InvalidArgument)?;
                let (dst_name, dst_hook) =
                    right.trim().split_once(':').ok_or(DmmError::InvalidArgument)?;
                let src_id = *created.get(src_name).ok_or(DmmError::NotFound)?;
                let dst_id = *created.get(dst_name).ok_or(DmmError::NotFound)?;
                let dst_addr = format!("[{}]", dst_id.get());
                ops.connect_hooks(src_id, src_hook, &dst_addr, dst_hook)?;
            }
            _ => {
                tracing::warn!(lineno, line, "unrecognized starter descriptor line");
                return Err(DmmError::InvalidArgument);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dimmon_error::IdAllocator;
    use std::cell::Cell;

    /// A minimal in-memory `NodeOps` stand-in, just enough to drive
    /// `Starter` without pulling in `dimmon-graph` (which already depends on
    /// this crate's sibling `dimmon-registry`, so depending on it back here
    /// would cycle).
    struct FakeOps {
        ids: IdAllocator,
        created: Vec<(NodeId, String)>,
        connected: Vec<(NodeId, String, String, String)>,
        fail_unknown_type: bool,
    }

    impl NodeOps for FakeOps {
        fn send_data(&mut self, _: NodeId, _: &str, _: DataFrame) -> DmmResult<()> {
            Ok(())
        }
        fn send_message(&mut self, _: &str, _: ControlMessage) -> DmmResult<()> {
            Ok(())
        }
        fn send_message_to(&mut self, _: NodeId, _: ControlMessage) -> DmmResult<()> {
            Ok(())
        }
        fn create_node(&mut self, type_name: &str) -> DmmResult<NodeId> {
            if self.fail_unknown_type && type_name == "bogus" {
                return Err(DmmError::NotFound);
            }
            let id = NodeId::from_raw(self.ids.alloc());
            self.created.push((id, type_name.to_string()));
            Ok(id)
        }
        fn connect_hooks(
            &mut self,
            src: NodeId,
            out_hook: &str,
            dst_addr: &str,
            in_hook: &str,
        ) -> DmmResult<()> {
            self.connected
                .push((src, out_hook.to_string(), dst_addr.to_string(), in_hook.to_string()));
            Ok(())
        }
        fn current_wave(&self) -> u64 {
            0
        }
    }

    fn fake_ops() -> FakeOps {
        FakeOps {
            ids: IdAllocator::new(),
            created: Vec::new(),
            connected: Vec::new(),
            fail_unknown_type: true,
        }
    }

    #[test]
    fn source_emits_one_fixed_frame_on_timer_trigger() {
        struct CaptureOps {
            sent: Vec<DataFrame>,
        }
        impl NodeOps for CaptureOps {
            fn send_data(&mut self, _: NodeId, out_hook: &str, frame: DataFrame) -> DmmResult<()> {
                assert_eq!(out_hook, "out");
                self.sent.push(frame);
                Ok(())
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
        let source = Source::new(42, b"hi".to_vec());
        let mut capture = CaptureOps { sent: Vec::new() };
        let mut state: PrivateState = Box::new(());
        let trigger = ControlMessage::create(
            NodeId::from_raw(1),
            generic::TIMER_TRIGGER,
            TYPE_GENERIC,
            0,
            MessageFlags::empty(),
            dimmon_message::TimerIdPayload { id: 1 }.encode(),
        );
        source
            .receive_message(&mut capture, NodeId::from_raw(1), &mut state, trigger)
            .unwrap();
        assert_eq!(capture.sent.len(), 1);
        let nodes = capture.sent[0].nodes_snapshot();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].sensor_id, 42);
        assert_eq!(nodes[0].payload, b"hi");
    }

    #[test]
    fn sink_rejects_out_hooks_and_records_in_order() {
        let sink = Sink::new();
        let mut ops = fake_ops();
        let mut state = sink.construct(&mut ops, NodeId::from_raw(1)).unwrap();
        assert_eq!(
            sink.new_hook(
                &mut ops,
                NodeId::from_raw(1),
                &mut state,
                HookId::from_raw(1),
                "out",
                HookDirection::Out
            ),
            Err(DmmError::InvalidArgument)
        );

        let frame = DataFrame::with_capacity(1, 2);
        frame.push(42, b"hi".to_vec()).unwrap();
        sink.receive_data(&mut ops, NodeId::from_raw(1), &mut state, HookId::from_raw(2), frame)
            .unwrap();
        assert_eq!(sink.received().borrow().len(), 1);
    }

    #[test]
    fn wavebuf_concatenates_buffered_frames_on_wavefinish() {
        let wavebuf = WaveBuf;
        let mut ops = fake_ops();
        let node = NodeId::from_raw(1);
        let mut state = wavebuf.construct(&mut ops, node).unwrap();

        let a = DataFrame::with_capacity(1, 2);
        a.push(1, b"a".to_vec()).unwrap();
        let b = DataFrame::with_capacity(1, 2);
        b.push(2, b"b".to_vec()).unwrap();
        wavebuf
            .receive_data(&mut ops, node, &mut state, HookId::from_raw(10), a)
            .unwrap();
        wavebuf
            .receive_data(&mut ops, node, &mut state, HookId::from_raw(11), b)
            .unwrap();

        let finish = ControlMessage::create(
            node,
            generic::WAVEFINISH,
            TYPE_GENERIC,
            0,
            MessageFlags::empty(),
            Vec::new(),
        );

        struct CaptureOne {
            sent: Cell<Option<DataFrame>>,
        }
        impl NodeOps for CaptureOne {
            fn send_data(&mut self, _: NodeId, out_hook: &str, frame: DataFrame) -> DmmResult<()> {
                assert_eq!(out_hook, "out");
                self.sent.set(Some(frame));
                Ok(())
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
        let mut capture = CaptureOne { sent: Cell::new(None) };
        wavebuf
            .receive_message(&mut capture, node, &mut state, finish)
            .unwrap();

        let sent = capture.sent.into_inner().expect("one concatenated frame sent");
        assert_eq!(sent.datanode_count(), 2);
    }

    #[test]
    fn starter_creates_and_connects_from_descriptor() {
        let mut ops = fake_ops();
        let descriptor = "\
# comment line, ignored
create src source
create dst sink
connect src:out -> dst:in
";
        run_descriptor(&mut ops, NodeId::from_raw(99), descriptor).unwrap();
        assert_eq!(ops.created.len(), 2);
        assert_eq!(ops.connected.len(), 1);
        let (_, out_hook, dst_addr, in_hook) = &ops.connected[0];
        assert_eq!(out_hook, "out");
        assert_eq!(in_hook, "in");
        assert!(dst_addr.starts_with('[') && dst_addr.ends_with(']'));
    }

    #[test]
    fn starter_propagates_unknown_type_error() {
        let mut ops = fake_ops();
        let descriptor = "create x bogus\n";
        assert_eq!(
            run_descriptor(&mut ops, NodeId::from_raw(1), descriptor),
            Err(DmmError::NotFound)
        );
    }

    #[test]
    fn starter_rejects_connect_to_unknown_local_name() {
        let mut ops = fake_ops();
        let descriptor = "create src source\nconnect src:out -> missing:in\n";
        assert_eq!(
            run_descriptor(&mut ops, NodeId::from_raw(1), descriptor),
            Err(DmmError::NotFound)
        );
    }

}
