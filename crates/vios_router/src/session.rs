use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::error::RouterError;
use crate::message::{CHOICE_SEPARATOR, InstanceId, Message, MessageId, kind, validate_choices};
use crate::router::Router;

/// Where a session is in its lifecycle.
///
/// Whether an initialized session is `Active` or `Backgrounded` is derived
/// from the grammar mapper's single active reference, so two sessions can
/// never both report `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Backgrounded,
    Interrupted,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Running,
    Exited,
}

#[derive(Debug)]
struct SessionState {
    instance_id: Option<InstanceId>,
    phase: Phase,
    choices: Vec<String>,
    disabled_choices: Vec<String>,
    last_synthesis: String,
}

/// One application's connection to the router.
///
/// A session registers itself on [`start`](Session::start), owns a
/// vocabulary, speaks through the engine, and blocks on its inbound buffer
/// for replies and recognized phrases. The owning shell moves it between
/// foreground and background and interrupts it on shutdown.
///
/// All methods take `&self`; a session is shared between the task that runs
/// the application and the shell that controls it.
pub struct Session {
    router: Router,
    name: String,
    state: Mutex<SessionState>,
    interrupted: AtomicBool,
    // Serializes vocabulary changes with their announcement.
    grammar_lock: tokio::sync::Mutex<()>,
    // Set by `foreground`; the session's own reader repeats the last
    // announcement so no other task reads this session's buffer.
    repeat: tokio::sync::Notify,
}

impl Session {
    pub fn new(router: Router, name: impl Into<String>) -> Self {
        Self {
            router,
            name: name.into(),
            state: Mutex::new(SessionState {
                instance_id: None,
                phase: Phase::Uninitialized,
                choices: Vec::new(),
                disabled_choices: Vec::new(),
                last_synthesis: String::new(),
            }),
            interrupted: AtomicBool::new(false),
            grammar_lock: tokio::sync::Mutex::new(()),
            repeat: tokio::sync::Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.state().instance_id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let (phase, id) = {
            let state = self.state();
            (state.phase, state.instance_id)
        };
        match (phase, id) {
            (Phase::Uninitialized, _) | (Phase::Running, None) => Lifecycle::Uninitialized,
            (Phase::Exited, _) => Lifecycle::Exited,
            (Phase::Running, Some(_)) if self.is_interrupted() => Lifecycle::Interrupted,
            (Phase::Running, Some(id)) if self.router.grammar().active() == Some(id) => {
                Lifecycle::Active
            }
            (Phase::Running, Some(_)) => Lifecycle::Backgrounded,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state().phase == Phase::Running
    }

    pub fn is_active(&self) -> bool {
        let state = self.state();
        state.phase == Phase::Running
            && state.instance_id.is_some()
            && self.router.grammar().active() == state.instance_id
    }

    /// Active, or the root session. The root's vocabulary is part of every
    /// effective grammar and it is never backgrounded, so it always
    /// announces and speaks.
    pub fn in_foreground(&self) -> bool {
        self.is_active() || self.instance_id() == Some(self.router.grammar().root())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// The vocabulary this session last set.
    pub fn choices(&self) -> Vec<String> {
        self.state().choices.clone()
    }

    pub fn last_synthesis(&self) -> String {
        self.state().last_synthesis.clone()
    }

    /// Register with the router and become the active session.
    pub fn start(&self) -> InstanceId {
        let id = self.router.register_instance();
        {
            let mut state = self.state();
            state.instance_id = Some(id);
            state.phase = Phase::Running;
            state.choices.clear();
            state.disabled_choices.clear();
            state.last_synthesis.clear();
        }
        self.interrupted.store(false, Ordering::Release);
        self.router.grammar().set_active(Some(id));

        info!(session = %self.name, instance_id = %id, "Session started");
        id
    }

    /// Leave the foreground. The session keeps running; its vocabulary is no
    /// longer announced and its speech is rate-limited.
    pub fn background(&self) {
        let Some(id) = self.instance_id() else {
            return;
        };
        let grammar = self.router.grammar();
        if grammar.active() == Some(id) {
            grammar.set_active(None);
        }
        info!(session = %self.name, instance_id = %id, "Session backgrounded");
    }

    /// Become the active session again and re-announce the vocabulary.
    ///
    /// The last announcement is repeated by the session's own task, on its
    /// current or next [`read`](Session::read).
    pub async fn foreground(&self) -> Result<(), RouterError> {
        let id = self.require_id()?;
        self.router.grammar().set_active(Some(id));
        info!(session = %self.name, instance_id = %id, "Session foregrounded");

        self.set_choices(self.choices()).await?;
        self.repeat.notify_one();
        Ok(())
    }

    /// Suppress this session's vocabulary until [`reenable_grammar`](Session::reenable_grammar).
    ///
    /// A disabled empty vocabulary does not put the recognizer into dictation.
    pub async fn disable_grammar(&self) -> Result<MessageId, RouterError> {
        let id = self.require_id()?;
        if self.router.grammar().is_disabled(id) {
            return Ok(self.router.next_message_id());
        }
        {
            let mut state = self.state();
            state.disabled_choices = state.choices.clone();
        }
        self.router.grammar().set_disabled(id, true);
        debug!(session = %self.name, instance_id = %id, "Grammar disabled");
        self.set_choices(Vec::<String>::new()).await
    }

    /// Restore the vocabulary saved by [`disable_grammar`](Session::disable_grammar).
    pub async fn reenable_grammar(&self) -> Result<MessageId, RouterError> {
        let id = self.require_id()?;
        let restore = std::mem::take(&mut self.state().disabled_choices);
        self.router.grammar().set_disabled(id, false);
        debug!(session = %self.name, instance_id = %id, "Grammar re-enabled");
        self.set_choices(restore).await
    }

    /// Replace this session's vocabulary. An empty list requests dictation.
    ///
    /// Entries that cannot be announced (containing `|`, `,`, a frame marker
    /// or non-ASCII text) are rejected before any state changes.
    ///
    /// The effective grammar is announced to the engine while this session
    /// is active, and always for the root session, whose vocabulary is part
    /// of every effective grammar. The returned id is fresh and may be used
    /// to correlate a subsequent read.
    pub async fn set_choices<I, S>(&self, choices: I) -> Result<MessageId, RouterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.require_id()?;
        let choices: Vec<String> = choices.into_iter().map(Into::into).collect();
        validate_choices(&choices)?;

        let _guard = self.grammar_lock.lock().await;
        self.state().choices = choices.clone();
        self.router.grammar().set_grammar(id, choices);

        if self.in_foreground() {
            self.trigger_grammar_update().await?;
        }

        Ok(self.router.next_message_id())
    }

    /// Announce the current effective grammar to the engine.
    ///
    /// Nothing is sent until the root session has registered.
    pub async fn trigger_grammar_update(&self) -> Result<Option<Message>, RouterError> {
        let id = self.require_id()?;
        let grammar = self.router.grammar();
        if !self.router.registry().contains(grammar.root()) {
            return Ok(None);
        }

        let choices = grammar.effective_grammar();
        let message = Message::new(
            id,
            kind::GRAMMAR_SET,
            self.router.next_message_id(),
            choices.join(CHOICE_SEPARATOR),
        );
        self.router.write(&message).await?;
        Ok(Some(message))
    }

    /// Send a command to the engine. A fresh message id is used unless one
    /// is given.
    pub async fn send(
        &self,
        kind: &str,
        args: &str,
        message_id: Option<MessageId>,
    ) -> Result<Message, RouterError> {
        let id = self.require_id()?;
        let message_id = message_id.unwrap_or_else(|| self.router.next_message_id());
        let message = Message::new(id, kind, message_id, args);
        self.router.write(&message).await?;
        Ok(message)
    }

    /// Read from this session's buffer. See [`Router::read`].
    ///
    /// Only the task that owns the session may read. Once interrupted, reads
    /// no longer block. A pending repeat from [`foreground`](Session::foreground)
    /// is spoken before the read resumes.
    pub async fn read(
        &self,
        message_id: Option<MessageId>,
        block: bool,
    ) -> Result<Option<Message>, RouterError> {
        let id = self.require_id()?;
        loop {
            let block = block && !self.is_interrupted();
            tokio::select! {
                biased;
                () = self.repeat.notified() => self.repeat_last_synthesis(id).await?,
                result = self.router.read(id, message_id, block) => return result,
            }
        }
    }

    /// Block for the next message and return its payload.
    pub async fn read_args(&self) -> Result<String, RouterError> {
        Ok(self
            .read(None, true)
            .await?
            .map(|message| message.args)
            .unwrap_or_default())
    }

    /// Speak `text` through the engine.
    ///
    /// Waits until the engine reports the synthesizer is free before sending.
    /// A backgrounded session does not speak; it waits out the background
    /// interval so it can keep making slow progress.
    pub async fn synthesize(&self, text: &str) -> Result<(), RouterError> {
        let id = self.require_id()?;
        self.state().last_synthesis = text.to_string();

        if !self.in_foreground() {
            tokio::time::sleep(self.router.config().background_synthesis_interval).await;
            return Ok(());
        }
        self.speak(id, text).await
    }

    async fn repeat_last_synthesis(&self, id: InstanceId) -> Result<(), RouterError> {
        let last = self.last_synthesis();
        if last.is_empty() || !self.in_foreground() || self.is_interrupted() {
            return Ok(());
        }
        debug!(session = %self.name, instance_id = %id, "Repeating last announcement");
        self.speak(id, &last).await
    }

    // Waits for the synthesizer to be free, then speaks.
    async fn speak(&self, id: InstanceId, text: &str) -> Result<(), RouterError> {
        let ticket = self.router.next_message_id();
        self.send(kind::SYNTHESIS_DONE, "", Some(ticket)).await?;
        self.router
            .read(id, Some(ticket), !self.is_interrupted())
            .await?;

        if self.is_interrupted() {
            debug!(session = %self.name, instance_id = %id, "Synthesis skipped, interrupted");
            return Ok(());
        }

        self.send(kind::SPEECH_SYNTH, text, None).await?;
        Ok(())
    }

    /// Optionally replace the vocabulary, optionally speak a prompt, then
    /// block for input. `Some(vec![])` requests dictation; `None` keeps the
    /// current vocabulary.
    pub async fn grammar_prompt_and_read(
        &self,
        choices: Option<Vec<String>>,
        prompt: &str,
    ) -> Result<String, RouterError> {
        self.require_id()?;

        if let Some(choices) = choices {
            self.set_choices(choices).await?;
        }
        if !prompt.is_empty() {
            self.synthesize(prompt).await?;
        }

        let result = self.read_args().await?;

        if !prompt.is_empty() {
            self.send(kind::BREAK, "", None).await?;
        }

        debug!(session = %self.name, result = %result, "grammar_prompt_and_read");
        Ok(result)
    }

    /// Start free-form dictation that the engine ends when it hears
    /// `end_token`, and block for the result.
    pub async fn start_dictation(&self, end_token: &str, prompt: &str) -> Result<String, RouterError> {
        self.require_id()?;

        if !prompt.is_empty() {
            self.synthesize(prompt).await?;
        }
        if self.is_interrupted() {
            return Ok(String::new());
        }
        self.send(kind::START_DICTATION, end_token, None).await?;

        let result = self.read_args().await?;
        debug!(session = %self.name, result = %result, "start_dictation");
        Ok(result)
    }

    /// Ask the session to stop and release any read it is blocked in.
    pub fn interrupt(&self) -> Result<(), RouterError> {
        self.interrupted.store(true, Ordering::Release);
        if let Ok(id) = self.require_id() {
            info!(session = %self.name, instance_id = %id, "Session interrupted");
            self.router.wakeup(id)?;
        }
        Ok(())
    }

    /// Exit and unregister, dropping the buffer and vocabulary so nothing
    /// routes here any more.
    pub fn cleanup(&self) {
        let id = {
            let mut state = self.state();
            state.phase = Phase::Exited;
            state.choices.clear();
            state.disabled_choices.clear();
            state.last_synthesis.clear();
            state.instance_id
        };

        if let Some(id) = id {
            self.router.unregister_instance(id);
            info!(session = %self.name, instance_id = %id, "Session exited");
        }
    }

    fn require_id(&self) -> Result<InstanceId, RouterError> {
        let state = self.state();
        match (state.phase, state.instance_id) {
            (Phase::Running, Some(id)) => Ok(id),
            _ => Err(RouterError::NotInitialized(self.name.clone())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
