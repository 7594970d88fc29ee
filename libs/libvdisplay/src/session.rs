//! Command Lifecycle Manager
//!
//! Execution contexts belonging to one process share a session: a single
//! notification event, one FIFO of pending commands, and a list of control
//! records to run on the next retrieval. User commands live in the shared
//! heap; the consumer drains them with [`CommandManager::retrieve`], which
//! copies whole records out:
//!
//! ```text
//! +0  u64 echo   +8  u32 kind   +12 u32 size   +16 payload[size]
//! ```
//!
//! Lock order: registry, then session. Commands move between lists by
//! ownership; nothing is freed or invoked while a lock is held. Visitors
//! see copies of the queued payloads and never hold the queue.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::heap::{HeapBlock, SharedHeap};
use crate::host::{channel, CompletionEvent, SessionEvent};

/// Size of the header preceding each retrieved command
pub const RECORD_HEADER_SIZE: u32 = 16;

/// Record kind of a user command
pub const RECORD_KIND_USER: u32 = 1;

/// Command payloads are allocated in multiples of this
const COMMAND_ALIGN: u32 = 8;

/// Execution context handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);

impl ContextId {
    /// Raw id
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

/// Identity of a session's notification primitive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey(pub u64);

bitflags::bitflags! {
    /// What a visitor wants done with the command it was shown
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VisitAction: u32 {
        /// Remove (cancel) the command
        const REMOVE = 1 << 0;
        /// Stop visiting
        const BREAK = 1 << 1;
    }
}

/// When a control record runs relative to retrieval
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStage {
    /// While the retrieval that dequeues it is running
    PreInvoke,
    /// On the following retrieval, once the consumer handled the batch
    PostInvoke,
}

/// Control record callback, given the context that queued it
pub type ControlCallback = Box<dyn FnOnce(ContextId) + Send>;

/// Heap-backed payload; returned to the heap on drop
struct Payload {
    heap: Arc<SharedHeap>,
    block: HeapBlock,
}

impl Payload {
    fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.heap.region().read(self.block.data_offset(), buf)
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Err(err) = self.heap.free(self.block) {
            log::warn!("command {:#x}: free failed: {}", self.block.offset(), err);
        }
    }
}

enum Body {
    User {
        payload: Payload,
        len: u32,
    },
    Control {
        stage: ControlStage,
        callback: ControlCallback,
    },
}

struct Command {
    seq: u64,
    context: ContextId,
    echo: u64,
    body: Body,
}

impl Command {
    /// Bytes the record occupies in a retrieval buffer
    fn retrieve_size(&self) -> u32 {
        match &self.body {
            Body::User { len, .. } => RECORD_HEADER_SIZE + len,
            Body::Control { .. } => 0,
        }
    }

    fn stage(&self) -> Option<ControlStage> {
        match &self.body {
            Body::User { .. } => None,
            Body::Control { stage, .. } => Some(*stage),
        }
    }

    fn run_control(self) {
        if let Body::Control { callback, .. } = self.body {
            callback(self.context);
        }
    }
}

struct SessionInner {
    contexts: Vec<ContextId>,
    commands: VecDeque<Command>,
    post_process: VecDeque<Command>,
    signal_needed: bool,
    next_seq: u64,
}

struct Session {
    key: SessionKey,
    event: Arc<dyn SessionEvent>,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(key: SessionKey, event: Arc<dyn SessionEvent>) -> Self {
        Self {
            key,
            event,
            inner: Mutex::new(SessionInner {
                contexts: Vec::new(),
                commands: VecDeque::new(),
                post_process: VecDeque::new(),
                signal_needed: true,
                next_seq: 0,
            }),
        }
    }

    fn enqueue(&self, mut command: Command) -> Result<()> {
        let signal = {
            let mut inner = self.inner.lock();
            if !inner.contexts.contains(&command.context) {
                drop(inner);
                return Err(Error::InvalidHandle);
            }
            command.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.commands.push_back(command);
            core::mem::replace(&mut inner.signal_needed, false)
        };
        if signal {
            self.event.signal();
        }
        Ok(())
    }
}

struct ContextEntry {
    session: Arc<Session>,
    echo: u64,
}

struct Registry {
    sessions: HashMap<SessionKey, Arc<Session>>,
    contexts: HashMap<ContextId, ContextEntry>,
    next_id: u32,
}

/// Outcome of a retrieval
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetrieveStatus {
    /// Bytes written to the output buffer
    pub bytes: u32,
    /// User commands returned
    pub commands: u32,
    /// Size of the first command that did not fit, 0 if all fit
    pub first_remaining: u32,
    /// Total size of the commands left queued
    pub remaining: u32,
}

/// A user command being filled before submission
pub struct PendingCommand {
    session: Arc<Session>,
    context: ContextId,
    echo: u64,
    heap: Arc<SharedHeap>,
    block: Option<HeapBlock>,
    capacity: u32,
}

impl PendingCommand {
    /// Usable payload size
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Context the command belongs to
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Write payload bytes at `at`
    pub fn write(&mut self, at: u32, bytes: &[u8]) -> Result<()> {
        let block = self.block.ok_or(Error::InvalidHandle)?;
        if at as u64 + bytes.len() as u64 > self.capacity as u64 {
            return Err(Error::OutOfBounds {
                offset: block.data_offset() + at,
                len: bytes.len() as u32,
            });
        }
        self.heap.region().write(block.data_offset() + at, bytes)
    }

    /// Queue the command; `size` trims the payload, `None` keeps all of it
    pub fn submit(mut self, size: Option<u32>) -> Result<()> {
        let block = self.block.take().ok_or(Error::InvalidHandle)?;
        let len = size.unwrap_or(self.capacity).min(self.capacity);
        let command = Command {
            seq: 0,
            context: self.context,
            echo: self.echo,
            body: Body::User {
                payload: Payload {
                    heap: self.heap.clone(),
                    block,
                },
                len,
            },
        };
        self.session.enqueue(command)
    }
}

impl Drop for PendingCommand {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            let _ = self.heap.free(block);
        }
    }
}

/// Read-only view handed to a visitor
pub struct CommandView<'a> {
    /// Issuing context
    pub context: ContextId,
    /// Context echo value
    pub echo: u64,
    /// Payload bytes
    pub payload: &'a [u8],
}

// ============================================================================
// Command manager
// ============================================================================

/// Session and context registry
pub struct CommandManager {
    heap: Arc<SharedHeap>,
    registry: Mutex<Registry>,
}

impl CommandManager {
    /// Manager allocating command payloads from `heap`
    pub fn new(heap: Arc<SharedHeap>) -> Self {
        Self {
            heap,
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                contexts: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn session_of(&self, context: ContextId) -> Result<(Arc<Session>, u64)> {
        let registry = self.registry.lock();
        let entry = registry.contexts.get(&context).ok_or(Error::InvalidHandle)?;
        Ok((entry.session.clone(), entry.echo))
    }

    /// Add a context to the session identified by `key`, creating the
    /// session (with `event`) if this is its first member
    pub fn join(&self, key: SessionKey, event: Arc<dyn SessionEvent>, echo: u64) -> ContextId {
        let mut registry = self.registry.lock();
        let id = ContextId(registry.next_id);
        registry.next_id = registry.next_id.wrapping_add(1).max(1);

        let session = registry
            .sessions
            .entry(key)
            .or_insert_with(|| {
                log::debug!("session {:?} created", key);
                Arc::new(Session::new(key, event))
            })
            .clone();
        session.inner.lock().contexts.push(id);
        registry.contexts.insert(id, ContextEntry { session, echo });

        log::trace!("context {:?} joined session {:?}", id, key);
        id
    }

    /// Remove a context; returns whether its session was destroyed
    ///
    /// The last member takes every queued command with it. Otherwise only
    /// the leaving context's commands are detached. Detached queued
    /// commands, user and control alike, are cancelled; control records
    /// already retrieved and waiting for post-processing still run.
    pub fn leave(&self, context: ContextId) -> Result<bool> {
        let (session, detached, post, destroyed) = {
            let mut registry = self.registry.lock();
            let entry = registry
                .contexts
                .remove(&context)
                .ok_or(Error::InvalidHandle)?;
            let session = entry.session;

            let (detached, post, destroyed) = {
                let mut inner = session.inner.lock();
                inner.contexts.retain(|id| *id != context);

                if inner.contexts.is_empty() {
                    let detached = core::mem::take(&mut inner.commands);
                    let post = core::mem::take(&mut inner.post_process);
                    (detached, post, true)
                } else {
                    let (detached, others): (VecDeque<_>, VecDeque<_>) = inner
                        .commands
                        .drain(..)
                        .partition(|cmd| cmd.context == context);
                    inner.commands = others;

                    let (post, others): (VecDeque<_>, VecDeque<_>) = inner
                        .post_process
                        .drain(..)
                        .partition(|cmd| cmd.context == context);
                    inner.post_process = others;
                    (detached, post, false)
                }
            };

            if destroyed {
                registry.sessions.remove(&session.key);
            }
            (session, detached, post, destroyed)
        };

        let cancelled = detached.len();
        drop(detached);
        for command in post {
            command.run_control();
        }

        log::debug!(
            "context {:?} left session {:?} ({} cancelled{})",
            context,
            session.key,
            cancelled,
            if destroyed { ", session destroyed" } else { "" }
        );

        if destroyed {
            session.event.signal();
        }
        Ok(destroyed)
    }

    /// Allocate a user command of `size` payload bytes for `context`
    pub fn create(&self, context: ContextId, size: u32) -> Result<PendingCommand> {
        let (session, echo) = self.session_of(context)?;
        let capacity = size
            .checked_add(COMMAND_ALIGN - 1)
            .ok_or(Error::ResourceExhausted)?
            & !(COMMAND_ALIGN - 1);
        let block = self.heap.allocate(capacity, channel::RESERVED, 0)?;
        self.heap.region().fill(block.data_offset(), capacity, 0)?;

        Ok(PendingCommand {
            session,
            context,
            echo,
            heap: self.heap.clone(),
            block: Some(block),
            capacity,
        })
    }

    /// Queue a control record for `context`
    pub fn submit_control(
        &self,
        context: ContextId,
        stage: ControlStage,
        callback: ControlCallback,
    ) -> Result<()> {
        let (session, echo) = self.session_of(context)?;
        session.enqueue(Command {
            seq: 0,
            context,
            echo,
            body: Body::Control { stage, callback },
        })
    }

    /// Signal `event` once the consumer has handled everything queued
    /// before this call
    pub fn submit_completion_event(
        &self,
        context: ContextId,
        event: Arc<dyn CompletionEvent>,
    ) -> Result<()> {
        self.submit_control(
            context,
            ControlStage::PostInvoke,
            Box::new(move |_| event.signal()),
        )
    }

    /// Copy as many whole commands as fit into `out`, oldest first
    pub fn retrieve(&self, context: ContextId, out: &mut [u8]) -> Result<RetrieveStatus> {
        let (session, _) = self.session_of(context)?;
        let mut status = RetrieveStatus::default();
        let mut room = out.len() as u32;

        let (deferred, batch) = {
            let mut inner = session.inner.lock();

            let (deferred, keep): (VecDeque<_>, VecDeque<_>) = inner
                .post_process
                .drain(..)
                .partition(|cmd| cmd.context == context);
            inner.post_process = keep;

            let mut batch = Vec::new();
            while let Some(command) = inner.commands.front() {
                let size = command.retrieve_size();
                if size > room {
                    break;
                }
                room -= size;
                if let Some(command) = inner.commands.pop_front() {
                    batch.push(command);
                }
            }

            if let Some(first) = inner.commands.front() {
                status.first_remaining = first.retrieve_size();
            }
            status.remaining = inner.commands.iter().map(Command::retrieve_size).sum();
            if inner.commands.is_empty() {
                inner.signal_needed = true;
            }
            (deferred, batch)
        };

        for command in deferred {
            command.run_control();
        }

        let mut post = Vec::new();
        let mut cursor = 0usize;
        for command in batch {
            match command.stage() {
                Some(ControlStage::PreInvoke) => command.run_control(),
                Some(ControlStage::PostInvoke) => post.push(command),
                None => {
                    if let Body::User { payload, len } = &command.body {
                        let end = cursor + (RECORD_HEADER_SIZE + len) as usize;
                        let record = &mut out[cursor..end];
                        record[0..8].copy_from_slice(&command.echo.to_le_bytes());
                        record[8..12].copy_from_slice(&RECORD_KIND_USER.to_le_bytes());
                        record[12..16].copy_from_slice(&len.to_le_bytes());
                        payload.read(&mut record[RECORD_HEADER_SIZE as usize..])?;
                        cursor = end;
                        status.commands += 1;
                    }
                }
            }
        }
        status.bytes = cursor as u32;

        if !post.is_empty() {
            session.inner.lock().post_process.extend(post);
        }

        log::trace!("context {:?} retrieved {:?}", context, status);
        Ok(status)
    }

    /// Show queued user commands to `visitor`, oldest first
    ///
    /// With `whole_session` every context's commands are visited, otherwise
    /// only those of `context`. The visitor sees copies taken under the
    /// session lock and runs without it; commands it asks to remove are
    /// cancelled if still queued. Returns the number of removed commands.
    pub fn visit(
        &self,
        context: ContextId,
        whole_session: bool,
        mut visitor: impl FnMut(&CommandView<'_>) -> VisitAction,
    ) -> Result<usize> {
        let (session, _) = self.session_of(context)?;

        let snapshot = {
            let inner = session.inner.lock();
            let mut snapshot = Vec::new();
            for command in &inner.commands {
                if !whole_session && command.context != context {
                    continue;
                }
                if let Body::User { payload, len } = &command.body {
                    let mut bytes = alloc::vec![0u8; *len as usize];
                    payload.read(&mut bytes)?;
                    snapshot.push((command.seq, command.context, command.echo, bytes));
                }
            }
            snapshot
        };

        let mut doomed = Vec::new();
        for (seq, context, echo, bytes) in &snapshot {
            let action = visitor(&CommandView {
                context: *context,
                echo: *echo,
                payload: bytes,
            });
            if action.contains(VisitAction::REMOVE) {
                doomed.push(*seq);
            }
            if action.contains(VisitAction::BREAK) {
                break;
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let removed: Vec<Command> = {
            let mut inner = session.inner.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = inner
                .commands
                .drain(..)
                .partition(|cmd| doomed.contains(&cmd.seq));
            inner.commands = VecDeque::from(kept);
            if inner.commands.is_empty() {
                inner.signal_needed = true;
            }
            removed
        };

        Ok(removed.len())
    }

    /// Wake every session
    pub fn signal_all(&self) {
        let sessions: Vec<Arc<Session>> = self.registry.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.event.signal();
        }
    }

    /// Whether any session has queued commands
    pub fn has_pending(&self) -> bool {
        let registry = self.registry.lock();
        registry
            .sessions
            .values()
            .any(|session| !session.inner.lock().commands.is_empty())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    /// Commands queued in the session of `context`
    pub fn queued(&self, context: ContextId) -> Result<usize> {
        let (session, _) = self.session_of(context)?;
        let count = session.inner.lock().commands.len();
        Ok(count)
    }
}
