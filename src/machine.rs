//! The stack-based protocol dispatcher driving one logical actor.
//!
//! A [`Machine`] holds a bounded stack of [`State`]s. The top of the
//! stack is the current state; it receives every [`Event`] first.
//! Pushing enters a sub-dialogue (say, a trade negotiation) while
//! remembering exactly where to resume; popping re-enters the frame
//! underneath. Inbound lines are offered to the current state, then to
//! an optional global handler, then to an optional "unhandled"
//! fallback, with the parse cursor reset before each offer.
//!
//! A machine is created detached and attached to a [`Session`] either
//! by [`Machine::connect`] or by [`set_session`](Machine::set_session)
//! plus [`Session::attach`] (reconnect hand-off). [`MachineDriver`]
//! translates session notifications into events, locking the machine so
//! delivery stays serialized.

use crate::codec::{self, Value};
use crate::session::{ConnectError, Session, SessionHandler, SharedHandler};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Maximum state stack depth. Exceeding it is a configuration error,
/// diagnosed with a stack dump and an abort.
pub const STACK_LIMIT: usize = 16;

/// The event kinds a [`State`] can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The state became the top of the stack.
    Enter,
    /// Settle pass after `Enter`, and after any network transition.
    Init,
    /// A line is available; decode it with [`Machine::recv`] or
    /// [`Machine::recv_prefix`].
    Recv,
    /// The machine's session connected.
    NetConnect,
    /// An outbound connection attempt failed.
    NetConnectFail,
    /// The machine's session closed.
    NetClose,
    /// Final teardown notice, delivered only to the global handler.
    Free,
}

/// A shared handle to a [`State`].
pub type SharedState = Arc<dyn State>;

/// A handler for one phase of the protocol.
///
/// The return value only matters for [`Event::Recv`], where `true`
/// means "I recognized and fully processed this line"; an unconsumed
/// line is offered to the next handler in the chain.
pub trait State: Send + Sync + 'static {
    fn handle(&self, machine: &mut Machine, event: Event) -> bool;
}

struct Frame {
    state: SharedState,
    name: &'static str,
}

/// A stack of protocol states for one logical actor. See the module
/// documentation.
pub struct Machine {
    label: String,
    stack: Vec<Frame>,
    global: Option<SharedState>,
    unhandled: Option<SharedState>,
    session: Option<Session>,
    line: Option<String>,
    cursor: usize,
    use_count: u32,
    dead: bool,
    freed: bool,
}

impl Machine {
    /// Creates a detached machine with an empty stack. `label`
    /// identifies the actor in diagnostics.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stack: Vec::with_capacity(STACK_LIMIT),
            global: None,
            unhandled: None,
            session: None,
            line: None,
            cursor: 0,
            use_count: 0,
            dead: false,
            freed: false,
        }
    }

    /// Sets the handler offered every event after the current state.
    pub fn set_global_handler(&mut self, state: SharedState) {
        self.global = Some(state);
    }

    /// Sets the fallback offered lines no other handler consumed.
    pub fn set_unhandled_handler(&mut self, state: SharedState) {
        self.unhandled = Some(state);
    }

    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Name of the current state, if any.
    pub fn current_name(&self) -> Option<&'static str> {
        self.stack.last().map(|frame| frame.name)
    }

    fn current_state(&self) -> Option<SharedState> {
        self.stack.last().map(|frame| frame.state.clone())
    }

    /// Delivers an event to the current state, then to the global
    /// handler. Dead machines ignore everything except the final
    /// [`Event::Free`], which is delivered internally.
    pub fn event(&mut self, event: Event) {
        if self.dead {
            return;
        }
        self.use_count += 1;
        if let Some(state) = self.current_state() {
            state.handle(self, event);
        }
        if !self.dead {
            if let Some(global) = self.global.clone() {
                global.handle(self, event);
            }
        }
        self.release();
    }

    /// Routes an inbound line: current state first, then the global
    /// handler, then the unhandled fallback, resetting the parse cursor
    /// before each offer. Nested calls (a handler re-dispatching the
    /// remainder of a chained line) are safe.
    pub fn demux(&mut self, text: &str) {
        if self.dead {
            return;
        }
        self.use_count += 1;
        let saved_line = self.line.take();
        let saved_cursor = self.cursor;
        self.line = Some(text.to_owned());
        self.cursor = 0;

        let mut consumed = false;
        if let Some(state) = self.current_state() {
            consumed = state.handle(self, Event::Recv);
        }
        if !consumed && !self.dead {
            if let Some(global) = self.global.clone() {
                self.cursor = 0;
                consumed = global.handle(self, Event::Recv);
            }
        }
        if !consumed && !self.dead {
            if let Some(unhandled) = self.unhandled.clone() {
                self.cursor = 0;
                consumed = unhandled.handle(self, Event::Recv);
            }
        }
        if !consumed && !self.dead {
            tracing::debug!(machine = %self.label(), line = text, "line not handled by any state");
        }

        self.line = saved_line;
        self.cursor = saved_cursor;
        self.release();
    }

    /// Replaces the top frame in place; on an empty stack this starts
    /// it. The new state receives `Enter` then `Init`.
    pub fn goto(&mut self, state: SharedState, name: &'static str) {
        if self.dead {
            return;
        }
        self.stack.pop();
        self.stack.push(Frame { state, name });
        self.enter();
    }

    /// Grows the stack by one frame, so a later [`pop`](Machine::pop)
    /// restores the exact previous frame.
    pub fn push(&mut self, state: SharedState, name: &'static str) {
        if self.dead {
            return;
        }
        if self.stack.len() == STACK_LIMIT {
            self.dump_stack();
            panic!("{}: state stack overflow pushing {name}", self.label());
        }
        self.stack.push(Frame { state, name });
        self.enter();
    }

    /// Removes the top frame and re-enters the one underneath.
    pub fn pop(&mut self) {
        self.multipop(1);
    }

    /// Removes `depth` frames at once and re-enters the exposed frame.
    /// At least one frame must remain.
    pub fn multipop(&mut self, depth: usize) {
        if self.dead {
            return;
        }
        if depth == 0 || depth >= self.stack.len() {
            self.dump_stack();
            panic!(
                "{}: cannot pop {depth} of {} frames",
                self.label(),
                self.stack.len()
            );
        }
        self.stack.truncate(self.stack.len() - depth);
        self.enter();
    }

    /// Discards the whole stack and starts a fresh single-frame stack;
    /// the hard reset used when returning to a lobby.
    pub fn pop_all_and_goto(&mut self, state: SharedState, name: &'static str) {
        if self.dead {
            return;
        }
        self.stack.clear();
        self.stack.push(Frame { state, name });
        self.enter();
    }

    fn enter(&mut self) {
        // A fresh decode attempt always starts at the line's beginning.
        self.cursor = 0;
        self.event(Event::Enter);
        self.event(Event::Init);
    }

    /// Logs every frame by name, top first, for postmortems.
    pub fn dump_stack(&self) {
        tracing::error!(
            machine = %self.label(),
            depth = self.stack.len(),
            "state stack dump"
        );
        for (index, frame) in self.stack.iter().enumerate().rev() {
            tracing::error!(machine = %self.label(), index, name = frame.name, "frame");
        }
    }

    /// Strict decode of the rest of the current line: succeeds only if
    /// `fmt` consumes everything from the parse cursor to the end.
    pub fn recv(&mut self, fmt: &str) -> Option<Vec<Value>> {
        let line = self.line.as_deref()?;
        codec::decode_line(&line[self.cursor..], fmt)
    }

    /// Prefix decode: on success the parse cursor advances past the
    /// consumed characters, so further `recv`/`recv_prefix` calls in
    /// the same handler continue from there.
    pub fn recv_prefix(&mut self, fmt: &str) -> Option<Vec<Value>> {
        let line = self.line.as_deref()?;
        let (values, consumed) = codec::decode(&line[self.cursor..], fmt)?;
        self.cursor += consumed;
        Some(values)
    }

    /// The unparsed remainder of the current line. A handler that
    /// consumed a routing prefix can capture this, transition, and
    /// re-dispatch it with [`demux`](Machine::demux) to delegate the
    /// rest of the line to the new state without re-parsing the prefix.
    pub fn line_remainder(&self) -> Option<&str> {
        self.line.as_deref().map(|line| &line[self.cursor..])
    }

    /// Encodes a command and sends it through the attached session.
    pub fn send(&self, fmt: &str, args: &[Value]) {
        match &self.session {
            Some(session) => session.send(fmt, args),
            None => tracing::error!(machine = %self.label(), fmt, "send with no attached session"),
        }
    }

    pub fn send_line(&self, line: &str) {
        match &self.session {
            Some(session) => session.send_line(line),
            None => tracing::error!(machine = %self.label(), line, "send with no attached session"),
        }
    }

    /// Requests destruction. If the machine is currently delivering an
    /// event (a state may destroy its own machine mid-transition), the
    /// final `Free` notice is deferred until delivery unwinds; either
    /// way the global handler sees `Free` exactly once, and the machine
    /// ignores everything afterwards.
    pub fn destroy(&mut self) {
        self.dead = true;
        if self.use_count == 0 {
            self.deliver_free();
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    fn release(&mut self) {
        self.use_count -= 1;
        if self.use_count == 0 && self.dead {
            self.deliver_free();
        }
    }

    fn deliver_free(&mut self) {
        if self.freed {
            return;
        }
        self.freed = true;
        if let Some(global) = self.global.clone() {
            global.handle(self, Event::Free);
        }
    }

    /// Opens an outbound connection driven by `machine`. The machine
    /// receives `NetConnect` (or `NetConnectFail`) followed by `Init`,
    /// then `Recv` per line, and `NetClose` when the connection ends.
    pub async fn connect(
        machine: Arc<Mutex<Machine>>,
        host: &str,
        port: u16,
    ) -> Result<Session, ConnectError> {
        let driver: SharedHandler = Arc::new(MachineDriver::new(machine));
        Session::connect(host, port, driver).await
    }
}

/// Adapts a shared [`Machine`] to the [`SessionHandler`] interface.
/// The mutex serializes delivery, so one machine never processes two
/// events concurrently.
pub struct MachineDriver {
    machine: Arc<Mutex<Machine>>,
}

impl MachineDriver {
    pub fn new(machine: Arc<Mutex<Machine>>) -> Self {
        Self { machine }
    }

    pub fn machine(&self) -> Arc<Mutex<Machine>> {
        self.machine.clone()
    }
}

#[async_trait::async_trait]
impl SessionHandler for MachineDriver {
    async fn on_connect(&self, session: &Session) {
        let mut machine = self.machine.lock().await;
        machine.set_session(session.clone());
        machine.event(Event::NetConnect);
        machine.event(Event::Init);
    }

    async fn on_connect_fail(&self) {
        let mut machine = self.machine.lock().await;
        machine.event(Event::NetConnectFail);
        machine.event(Event::Init);
    }

    async fn on_close(&self, _session: &Session) {
        let mut machine = self.machine.lock().await;
        machine.event(Event::NetClose);
        machine.event(Event::Init);
    }

    async fn on_line(&self, _session: &Session, line: &str) {
        let mut machine = self.machine.lock().await;
        machine.demux(line);
    }
}
