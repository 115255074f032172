//! Event base, timer, socket-event and wave subsystems.
//!
//! All three concrete event kinds share one id space and the same
//! subscribe/unsubscribe/broadcast discipline (§4.5); [`EventBase`] factors
//! that out. This crate is deliberately pure bookkeeping: subscribing,
//! firing and tearing down events never call into the graph directly.
//! Instead the triggering calls ([`EventRuntime::timers_trigger`],
//! [`EventRuntime::socket_event_process`], [`EventRuntime::wave_finish`])
//! return the `(NodeId, ControlMessage)` pairs that still need delivering,
//! and the unsubscribe/removal calls return the `(EventId, NodeId)` pairs
//! whose node-side mirror the caller (`dimmon-graph`) needs to forget. That
//! keeps this crate free of a dependency on the graph, which is what
//! actually knows whether a node is still valid and owns the send path.

use dimmon_error::{DmmError, DmmResult, EventId, IdAllocator, NodeId};
use dimmon_message::{
    generic, ControlMessage, MessageFlags, ReadinessFlags, SockeventTriggerPayload, TimerIdPayload,
    TimerSetFlags, TimerSetPayload, TYPE_GENERIC,
};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::RawFd;
use std::time::Instant;

/// The coalescing window timers in the near future are batched into the
/// current wave with (§4.6).
pub const COALESCE_INTERVAL_MS: i64 = 1;

/// A delivery the caller still owes a subscriber: one message, addressed to
/// one node, not yet reference-counted or sent.
pub type Delivery = (NodeId, ControlMessage);

/// Subscriber bookkeeping shared by every concrete event kind.
struct EventBase {
    id: EventId,
    subscribers: Vec<NodeId>,
}

impl EventBase {
    fn new(id: EventId) -> Self {
        EventBase {
            id,
            subscribers: Vec::new(),
        }
    }

    fn subscribe(&mut self, node: NodeId) {
        self.subscribers.push(node);
    }

    fn checked_subscribe(&mut self, node: NodeId) {
        if !self.subscribers.contains(&node) {
            self.subscribe(node);
        }
    }

    fn unsubscribe(&mut self, node: NodeId) -> DmmResult<()> {
        let before = self.subscribers.len();
        self.subscribers.retain(|n| *n != node);
        if self.subscribers.len() == before {
            return Err(DmmError::NotFound);
        }
        Ok(())
    }

    fn unsubscribe_all(&mut self) -> Vec<NodeId> {
        self.subscribers.drain(..).collect()
    }

    /// `send_subscribed`: builds one copy of the message per current
    /// subscriber. Validity filtering and actual delivery happen on the
    /// caller's side (it alone knows node liveness).
    fn broadcast(&self, mut build: impl FnMut() -> ControlMessage) -> Vec<Delivery> {
        self.subscribers.iter().map(|&node| (node, build())).collect()
    }
}

struct Timer {
    base: EventBase,
    next: i64,
    interval: i64,
    registered: bool,
}

struct SockEvent {
    base: EventBase,
    fd: RawFd,
    mask: ReadinessFlags,
}

struct WaveFinish {
    base: EventBase,
}

/// Owns the timer trigger queue, the per-fd socket-event map and the OS
/// multiplexer, and the wave counter with its single-shot wave-finish
/// events. One instance per running kernel.
pub struct EventRuntime {
    ids: IdAllocator,
    clock: Instant,

    timers: HashMap<EventId, Timer>,
    timer_queue: BinaryHeap<Reverse<(i64, EventId)>>,

    poll: Poll,
    sockevents: HashMap<EventId, SockEvent>,
    fd_index: HashMap<RawFd, EventId>,

    wave: u64,
    wavefinish_by_wave: HashMap<u64, EventId>,
    wavefinish: HashMap<EventId, WaveFinish>,
}

impl EventRuntime {
    /// Fails only if the OS multiplexer cannot be created — a fatal
    /// initialization error by contract (§7).
    pub fn new() -> DmmResult<Self> {
        let poll = Poll::new().map_err(|_| DmmError::NotSupported)?;
        Ok(EventRuntime {
            ids: IdAllocator::new(),
            clock: Instant::now(),
            timers: HashMap::new(),
            timer_queue: BinaryHeap::new(),
            poll,
            sockevents: HashMap::new(),
            fd_index: HashMap::new(),
            wave: 0,
            wavefinish_by_wave: HashMap::new(),
            wavefinish: HashMap::new(),
        })
    }

    /// Milliseconds elapsed since this runtime was created — the clock
    /// `next_deadline`/`timer_set` schedule against.
    pub fn now_ms(&self) -> i64 {
        self.clock.elapsed().as_millis() as i64
    }

    fn alloc_event_id(&mut self) -> EventId {
        EventId::from_raw(self.ids.alloc())
    }

    /// Unsubscribes `node` from `id` regardless of which concrete event kind
    /// it names, tearing a socket-event down if that was its last
    /// subscriber. Used when a node is removed while still subscribed to
    /// events it never explicitly left. No-op if `id` names nothing live.
    pub fn unsubscribe_any(&mut self, id: EventId, node: NodeId) {
        if let Some(timer) = self.timers.get_mut(&id) {
            let _ = timer.base.unsubscribe(node);
            return;
        }
        if let Some(se) = self.sockevents.get_mut(&id) {
            let _ = se.base.unsubscribe(node);
            if se.base.subscribers.is_empty() {
                self.destroy_sockevent(id);
            }
            return;
        }
        if let Some(wf) = self.wavefinish.get_mut(&id) {
            let _ = wf.base.unsubscribe(node);
        }
    }

    // ---- Timers (§4.6) ----

    pub fn timer_create(&mut self) -> EventId {
        let id = self.alloc_event_id();
        self.timers.insert(
            id,
            Timer {
                base: EventBase::new(id),
                next: 0,
                interval: 0,
                registered: false,
            },
        );
        id
    }

    /// `timer_set(timer, next, interval, flags)` per the arming rules in
    /// §4.6. `next`/`interval` are milliseconds; `ABSOLUTE` makes `next` an
    /// absolute deadline on this runtime's own clock rather than an offset
    /// from now.
    pub fn timer_set(&mut self, id: EventId, payload: &TimerSetPayload) -> DmmResult<()> {
        let now = self.now_ms();
        let timer = self.timers.get_mut(&id).ok_or(DmmError::NotFound)?;

        if payload.next == 0 && payload.interval == 0 {
            return Err(DmmError::InvalidArgument);
        }

        if payload.next == 0 {
            // interval > 0 here, since the all-zero case was rejected above.
            if !payload.flags.contains(TimerSetFlags::CHANGE_INTERVAL_ONLY) {
                timer.next = now + payload.interval;
            }
            timer.interval = payload.interval;
        } else {
            timer.next = if payload.flags.contains(TimerSetFlags::ABSOLUTE) {
                payload.next
            } else {
                now + payload.next
            };
            timer.interval = payload.interval;
        }

        self.requeue(id);
        Ok(())
    }

    fn requeue(&mut self, id: EventId) {
        let timer = match self.timers.get_mut(&id) {
            Some(t) => t,
            None => return,
        };
        timer.registered = true;
        self.timer_queue.push(Reverse((timer.next, id)));
    }

    pub fn timer_subscribe(&mut self, id: EventId, node: NodeId) -> DmmResult<()> {
        self.timers.get_mut(&id).ok_or(DmmError::NotFound)?.base.subscribe(node);
        Ok(())
    }

    pub fn timer_unsubscribe(&mut self, id: EventId, node: NodeId) -> DmmResult<()> {
        self.timers.get_mut(&id).ok_or(DmmError::NotFound)?.base.unsubscribe(node)
    }

    /// Deregisters from the trigger queue (lazily — entries for
    /// removed/stale ids are dropped as they're popped) and unsubscribes
    /// all. Returns the former subscribers so the caller can forget its own
    /// mirror of the subscription link.
    pub fn timer_remove(&mut self, id: EventId) -> DmmResult<Vec<NodeId>> {
        let mut timer = self.timers.remove(&id).ok_or(DmmError::NotFound)?;
        timer.registered = false;
        Ok(timer.base.unsubscribe_all())
    }

    /// Returns the head timer's `next`, or `NotFound` if the queue is empty.
    /// The main loop converts this into an epoll timeout.
    pub fn next_deadline(&mut self) -> DmmResult<i64> {
        self.prune_stale_head();
        self.timer_queue.peek().map(|Reverse((next, _))| *next).ok_or(DmmError::NotFound)
    }

    fn prune_stale_head(&mut self) {
        while let Some(Reverse((_, id))) = self.timer_queue.peek() {
            match self.timers.get(id) {
                Some(t) if t.registered => break,
                _ => {
                    self.timer_queue.pop();
                }
            }
        }
    }

    /// Pops and fires every timer whose deadline has passed (plus the
    /// coalesce window), or just the head if `force` is set (the main loop
    /// woke from I/O before any timer was due). Returns the deliveries the
    /// caller must send on.
    pub fn timers_trigger(&mut self, force: bool) -> Vec<Delivery> {
        let deadline = self.now_ms() + COALESCE_INTERVAL_MS;
        let mut deliveries = Vec::new();
        let mut first = true;
        loop {
            self.prune_stale_head();
            let Some(Reverse((next, id))) = self.timer_queue.peek().copied() else {
                break;
            };
            let due = next <= deadline || (force && first);
            if !due {
                break;
            }
            first = false;
            self.timer_queue.pop();

            let Some(timer) = self.timers.get_mut(&id) else { continue };
            timer.registered = false;

            let msg = ControlMessage::create(
                dimmon_message::SYSTEM_SRC,
                generic::TIMER_TRIGGER,
                TYPE_GENERIC,
                0,
                MessageFlags::empty(),
                TimerIdPayload { id: id.get() }.encode(),
            );
            deliveries.extend(self.timers[&id].base.broadcast(|| msg.clone()));

            if let Some(timer) = self.timers.get_mut(&id) {
                if timer.interval > 0 {
                    timer.next += timer.interval;
                    self.requeue(id);
                }
                // interval == 0: one-shot, stays deregistered.
            }
        }
        deliveries
    }

    // ---- Socket events (§4.7) ----

    pub fn sockevent_subscribe(
        &mut self,
        node: NodeId,
        fd: RawFd,
        requested: ReadinessFlags,
    ) -> DmmResult<()> {
        if let Some(&id) = self.fd_index.get(&fd) {
            let existing_mask = self.sockevents[&id].mask;
            if existing_mask != requested {
                let interest = readiness_to_interest(requested);
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                    .map_err(|_| DmmError::NotConnected)?;
                self.sockevents.get_mut(&id).unwrap().mask = requested;
            }
            self.sockevents.get_mut(&id).unwrap().base.checked_subscribe(node);
            return Ok(());
        }

        let interest = readiness_to_interest(requested);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
            .map_err(|_| DmmError::NotConnected)?;

        let id = self.alloc_event_id();
        let mut se = SockEvent {
            base: EventBase::new(id),
            fd,
            mask: requested,
        };
        se.base.subscribe(node);
        self.sockevents.insert(id, se);
        self.fd_index.insert(fd, id);
        Ok(())
    }

    /// Unsubscribes `node` from `fd`'s readiness; tears the socket-event
    /// object down (deregistering from the OS multiplexer) once its last
    /// subscriber drops. Returns the event id if it was torn down, so the
    /// caller can forget any lingering mirror entries (there are none besides
    /// `node` itself, since the last unsubscribe and the teardown are the
    /// same call here).
    pub fn sockevent_unsubscribe(&mut self, node: NodeId, fd: RawFd) -> DmmResult<()> {
        let id = *self.fd_index.get(&fd).ok_or(DmmError::NotFound)?;
        let se = self.sockevents.get_mut(&id).ok_or(DmmError::NotFound)?;
        se.base.unsubscribe(node)?;
        if se.base.subscribers.is_empty() {
            self.destroy_sockevent(id);
        }
        Ok(())
    }

    fn destroy_sockevent(&mut self, id: EventId) {
        if let Some(se) = self.sockevents.remove(&id) {
            // tolerate "not present": the fd may already be closed.
            let _ = self.poll.registry().deregister(&mut SourceFd(&se.fd));
            self.fd_index.remove(&se.fd);
        }
    }

    /// Blocks on the OS multiplexer for up to `timeout_ms` (`None` = block
    /// indefinitely). Returns the raw `(fd, readiness)` pairs observed;
    /// interruptions are reported as [`DmmError::Interrupted`] so the main
    /// loop can retry.
    pub fn poll(&mut self, timeout_ms: Option<u64>) -> DmmResult<Vec<(RawFd, ReadinessFlags)>> {
        let mut events = Events::with_capacity(16);
        let timeout = timeout_ms.map(std::time::Duration::from_millis);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Err(DmmError::Interrupted),
            Err(_) => return Err(DmmError::NotConnected),
        }
        Ok(events
            .iter()
            .map(|e| (e.token().0 as RawFd, event_to_readiness(e)))
            .collect())
    }

    /// Translates the OS readiness back into the runtime bitmask and builds
    /// the `SOCKEVENT_TRIGGER` deliveries for the fd's subscribers.
    pub fn socket_event_process(&mut self, fd: RawFd, events: ReadinessFlags) -> Vec<Delivery> {
        let Some(&id) = self.fd_index.get(&fd) else {
            return Vec::new();
        };
        let msg = ControlMessage::create(
            dimmon_message::SYSTEM_SRC,
            generic::SOCKEVENT_TRIGGER,
            TYPE_GENERIC,
            0,
            MessageFlags::empty(),
            SockeventTriggerPayload { fd: fd as i32, events }.encode(),
        );
        self.sockevents[&id].base.broadcast(|| msg.clone())
    }

    // ---- Wave subsystem (§4.8) ----

    pub fn wave_start(&mut self) -> u64 {
        self.wave += 1;
        self.wave
    }

    pub fn current_wave(&self) -> u64 {
        self.wave
    }

    /// Looks up the current wave's wave-finish event (if any subscriber
    /// joined it), builds its deliveries, and tears it down. Returns the
    /// deliveries plus the former subscribers (for the caller's mirror).
    pub fn wave_finish(&mut self) -> (Vec<Delivery>, Vec<NodeId>) {
        let Some(id) = self.wavefinish_by_wave.remove(&self.wave) else {
            return (Vec::new(), Vec::new());
        };
        let mut wf = self.wavefinish.remove(&id).unwrap();
        let msg = ControlMessage::create(
            dimmon_message::SYSTEM_SRC,
            generic::WAVEFINISH,
            TYPE_GENERIC,
            0,
            MessageFlags::empty(),
            Vec::new(),
        );
        let deliveries = wf.base.broadcast(|| msg.clone());
        let former = wf.base.unsubscribe_all();
        (deliveries, former)
    }

    /// Joins the current wave's wave-finish event, creating it if this is
    /// the first subscriber this wave. The event is single-shot: it is torn
    /// down in [`EventRuntime::wave_finish`].
    pub fn wavefinish_subscribe(&mut self, node: NodeId) -> EventId {
        let wave = self.wave;
        let id = if let Some(&id) = self.wavefinish_by_wave.get(&wave) {
            id
        } else {
            let id = self.alloc_event_id();
            self.wavefinish_by_wave.insert(wave, id);
            self.wavefinish.insert(id, WaveFinish { base: EventBase::new(id) });
            id
        };
        self.wavefinish.get_mut(&id).unwrap().base.subscribe(node);
        id
    }
}

fn readiness_to_interest(mask: ReadinessFlags) -> Interest {
    let mut interest = None;
    if mask.contains(ReadinessFlags::IN) {
        interest = Some(Interest::READABLE);
    }
    if mask.contains(ReadinessFlags::OUT) {
        interest = Some(match interest {
            Some(i) => i.add(Interest::WRITABLE),
            None => Interest::WRITABLE,
        });
    }
    interest.unwrap_or(Interest::READABLE)
}

fn event_to_readiness(event: &mio::event::Event) -> ReadinessFlags {
    let mut flags = ReadinessFlags::empty();
    if event.is_readable() {
        flags |= ReadinessFlags::IN;
    }
    if event.is_writable() {
        flags |= ReadinessFlags::OUT;
    }
    if event.is_error() || event.is_read_closed() || event.is_write_closed() {
        flags |= ReadinessFlags::ERR;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_set_rejects_all_zero() {
        let mut events = EventRuntime::new().unwrap();
        let id = events.timer_create();
        let payload = TimerSetPayload {
            id: id.get(),
            next: 0,
            interval: 0,
            flags: TimerSetFlags::empty(),
        };
        assert_eq!(events.timer_set(id, &payload), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn timer_set_relative_arms_and_is_queued() {
        let mut events = EventRuntime::new().unwrap();
        let id = events.timer_create();
        let payload = TimerSetPayload {
            id: id.get(),
            next: 100,
            interval: 0,
            flags: TimerSetFlags::empty(),
        };
        events.timer_set(id, &payload).unwrap();
        let deadline = events.next_deadline().unwrap();
        assert!(deadline >= 100);
    }

    #[test]
    fn one_shot_timer_does_not_requeue_after_firing() {
        let mut events = EventRuntime::new().unwrap();
        let id = events.timer_create();
        let node = NodeId::from_raw(1);
        events
            .timer_set(
                id,
                &TimerSetPayload {
                    id: id.get(),
                    next: 1,
                    interval: 0,
                    flags: TimerSetFlags::empty(),
                },
            )
            .unwrap();
        events.timer_subscribe(id, node).unwrap();
        let deliveries = events.timers_trigger(true);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(events.next_deadline(), Err(DmmError::NotFound));
    }

    #[test]
    fn periodic_timer_requeues_after_firing() {
        let mut events = EventRuntime::new().unwrap();
        let id = events.timer_create();
        let node = NodeId::from_raw(1);
        events
            .timer_set(
                id,
                &TimerSetPayload {
                    id: id.get(),
                    next: 1,
                    interval: 50,
                    flags: TimerSetFlags::empty(),
                },
            )
            .unwrap();
        events.timer_subscribe(id, node).unwrap();
        events.timers_trigger(true);
        assert!(events.next_deadline().is_ok());
    }

    #[test]
    fn wavefinish_subscribers_receive_exactly_one_message_at_wave_end() {
        let mut events = EventRuntime::new().unwrap();
        let node = NodeId::from_raw(1);
        events.wave_start();
        events.wavefinish_subscribe(node);
        let (deliveries, former) = events.wave_finish();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(former, vec![node]);
        // second wave_finish on the same wave id is a no-op: already torn down.
        let (deliveries, _) = events.wave_finish();
        assert!(deliveries.is_empty());
    }
}
