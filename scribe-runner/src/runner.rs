//! The runner control loop.
//!
//! The runner drives every configured template to a rendered steady state:
//! it evaluates templates against the brain, subscribes the watcher to the
//! dependencies evaluation discovers, absorbs watcher updates, dampens
//! bursts through quiescence records, writes destinations through the file
//! sink, executes post-render commands, and supervises the optional child
//! process. Exactly one render pass is in flight at any time; collaborators
//! only talk to the loop through channels.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use scribe_core::brain::Brain;
use scribe_core::config::{Config, ExecConfig, TemplateConfig};
use scribe_core::dependency::{DepKey, Dependency, FetchError};
use scribe_core::signal::Signal;
use scribe_template::{sink, ExecuteInput, NewTemplateInput, RenderInput, Template, TemplateId};
use scribe_watch::{DataEvent, DependencySource, Watcher};

use crate::child::{Child, SpawnInput};
use crate::command::{self, CommandInput};
use crate::dedup::DedupManager;
use crate::env;
use crate::error::RunnerError;
use crate::pid;
use crate::quiescence::Quiescence;

/// Subscription count above which the runner warns that the agent may be
/// hammering its coordination services.
const SANE_VIEW_LIMIT: usize = 128;

// ---------------------------------------------------------------------------
// Render events
// ---------------------------------------------------------------------------

/// Render bookkeeping for one template. Created on first observation and
/// kept for the life of the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderEvent {
    /// Last time the template was fully evaluated and a write was attempted.
    pub last_would_render: Option<DateTime<Utc>>,
    /// Last time the destination's bytes actually changed.
    pub last_did_render: Option<DateTime<Utc>>,
}

type RenderEvents = Arc<StdRwLock<HashMap<TemplateId, RenderEvent>>>;
type ChildSlot = Arc<RwLock<Option<Child>>>;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap clone of the runner's shared surface, usable while the loop runs.
#[derive(Clone)]
pub struct RunnerHandle {
    stop: CancellationToken,
    done: CancellationToken,
    child: ChildSlot,
    render_events: RenderEvents,
    ctemplates: Arc<HashMap<TemplateId, Vec<TemplateConfig>>>,
}

impl RunnerHandle {
    /// Request shutdown. Returns immediately; [`RunnerHandle::done`] resolves
    /// once cleanup has finished. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves after the runner has fully stopped and cleaned up.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// Forward a signal to the supervised child. A no-op without a child.
    pub async fn signal(&self, signal: Signal) -> Result<(), RunnerError> {
        match self.child.read().await.as_ref() {
            Some(child) => child.signal(signal),
            None => Ok(()),
        }
    }

    /// Snapshot of per-template render events.
    pub fn render_events(&self) -> HashMap<TemplateId, RenderEvent> {
        self.render_events
            .read()
            .expect("render events lock poisoned")
            .clone()
    }

    /// Snapshot of the template-id to configuration mapping.
    pub fn template_config_mapping(&self) -> HashMap<TemplateId, Vec<TemplateConfig>> {
        self.ctemplates.as_ref().clone()
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

enum Wake {
    Data(DataEvent),
    Dedup,
    WatchErr(FetchError),
    Quiescence(TemplateId),
    ChildExit(i32),
    Shutdown,
}

/// The reactive core. Construct with [`Runner::new`], take the error and
/// rendered channels, grab a [`RunnerHandle`], then drive [`Runner::start`]
/// on a task.
pub struct Runner {
    config: Config,
    dry: bool,
    once: bool,

    templates: Vec<Arc<Template>>,
    ctemplates: Arc<HashMap<TemplateId, Vec<TemplateConfig>>>,

    render_events: RenderEvents,
    rendered_tx: mpsc::Sender<()>,
    rendered_rx: Option<mpsc::Receiver<()>>,
    err_tx: mpsc::Sender<RunnerError>,
    err_rx: Option<mpsc::Receiver<RunnerError>>,

    /// Dependencies tracked as of the end of the last render pass.
    dependencies: HashMap<DepKey, Dependency>,
    watcher: Watcher,
    data_rx: mpsc::Receiver<DataEvent>,
    watch_err_rx: mpsc::Receiver<FetchError>,
    brain: Arc<Brain>,

    child: ChildSlot,

    quiescence_map: HashMap<TemplateId, Quiescence>,
    quiescence_tx: mpsc::Sender<TemplateId>,
    quiescence_rx: mpsc::Receiver<TemplateId>,

    dedup: Option<Box<dyn DedupManager>>,

    env: HashMap<String, String>,
    dry_stream: Box<dyn Write + Send>,

    stop: CancellationToken,
    done: CancellationToken,
}

impl Runner {
    /// Build a runner over `source`. Validates the config, parses every
    /// template, and wires the channels; nothing runs until
    /// [`Runner::start`].
    pub fn new(
        config: Config,
        source: Arc<dyn DependencySource>,
        dry: bool,
        once: bool,
    ) -> Result<Self, RunnerError> {
        tracing::info!(dry, once, "creating runner");
        config.validate()?;

        let mut templates = Vec::new();
        let mut ctemplates: HashMap<TemplateId, Vec<TemplateConfig>> = HashMap::new();
        for tconfig in &config.templates {
            let template = Template::new(NewTemplateInput {
                source: tconfig.source.clone(),
                contents: tconfig.contents.clone(),
                left_delim: tconfig.left_delim.clone(),
                right_delim: tconfig.right_delim.clone(),
            })?;
            let id = template.id().clone();
            if !ctemplates.contains_key(&id) {
                templates.push(Arc::new(template));
            }
            ctemplates.entry(id).or_default().push(tconfig.clone());
        }

        let (watcher, data_rx, watch_err_rx) = Watcher::new(source, config.retry());
        let (rendered_tx, rendered_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (quiescence_tx, quiescence_rx) = mpsc::channel(templates.len().max(1));

        Ok(Self {
            config,
            dry,
            once,
            templates,
            ctemplates: Arc::new(ctemplates),
            render_events: Arc::new(StdRwLock::new(HashMap::new())),
            rendered_tx,
            rendered_rx: Some(rendered_rx),
            err_tx,
            err_rx: Some(err_rx),
            dependencies: HashMap::new(),
            watcher,
            data_rx,
            watch_err_rx,
            brain: Arc::new(Brain::new()),
            child: Arc::new(RwLock::new(None)),
            quiescence_map: HashMap::new(),
            quiescence_tx,
            quiescence_rx,
            dedup: None,
            env: HashMap::new(),
            dry_stream: Box::new(std::io::stdout()),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// Programmatic environment for templates and subprocesses; overrides
    /// both the injected connection variables and the config-level env.
    pub fn set_env(&mut self, env: HashMap<String, String>) {
        self.env = env;
    }

    /// Stream receiving would-be contents in dry mode. Defaults to stdout.
    pub fn set_dry_stream(&mut self, stream: Box<dyn Write + Send>) {
        self.dry_stream = stream;
    }

    /// Install a dedup manager. Ignored unless `dedup.enabled` is set, and
    /// always ignored in once-mode.
    pub fn set_dedup(&mut self, dedup: Box<dyn DedupManager>) {
        if self.once {
            tracing::info!("disabling de-duplication in once mode");
            return;
        }
        if !self.config.dedup.enabled {
            tracing::debug!("de-duplication not enabled in config");
            return;
        }
        self.dedup = Some(dedup);
    }

    /// Receiver for terminal errors. Takeable once.
    pub fn error_ch(&mut self) -> Option<mpsc::Receiver<RunnerError>> {
        self.err_rx.take()
    }

    /// Coalesced render notifications: at most one is buffered between two
    /// reads. Takeable once.
    pub fn rendered_ch(&mut self) -> Option<mpsc::Receiver<()>> {
        self.rendered_rx.take()
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            stop: self.stop.clone(),
            done: self.done.clone(),
            child: Arc::clone(&self.child),
            render_events: Arc::clone(&self.render_events),
            ctemplates: Arc::clone(&self.ctemplates),
        }
    }

    /// Snapshot of per-template render events.
    pub fn render_events(&self) -> HashMap<TemplateId, RenderEvent> {
        self.render_events
            .read()
            .expect("render events lock poisoned")
            .clone()
    }

    /// Snapshot of the template-id to configuration mapping.
    pub fn template_config_mapping(&self) -> HashMap<TemplateId, Vec<TemplateConfig>> {
        self.ctemplates.as_ref().clone()
    }

    /// Run until shutdown, once-mode completion, or a terminal error.
    /// Terminal errors are pushed onto the error channel; cleanup always
    /// runs before the done token resolves.
    pub async fn start(mut self) {
        tracing::info!("runner starting");
        if let Err(err) = self.run_loop().await {
            tracing::error!(error = %err, "runner terminating");
            if self.err_tx.send(err).await.is_err() {
                tracing::warn!("error channel dropped before terminal error delivery");
            }
        }
        self.cleanup().await;
        self.done.cancel();
    }

    // -- the loop ----------------------------------------------------------

    async fn run_loop(&mut self) -> Result<(), RunnerError> {
        if let Some(path) = self.config.pid_file.clone() {
            pid::store(&path)?;
        }

        let mut dedup_rx = match self.dedup.as_mut() {
            Some(dedup) => {
                dedup.start()?;
                Some(dedup.update_ch())
            }
            None => None,
        };

        tracing::debug!("running initial render pass");
        self.run().await?;

        loop {
            self.enable_quiescence();

            let size = self.watcher.size();
            if size > SANE_VIEW_LIMIT {
                tracing::warn!(
                    dependencies = size,
                    "watching this many dependencies may overload the coordination services",
                );
            } else {
                tracing::info!(dependencies = size, "watching dependencies");
            }

            if self.all_templates_rendered() {
                if let Some(exec) = self.config.exec.clone() {
                    self.ensure_child(&exec).await?;
                }

                if self.once {
                    tracing::info!("once mode and all templates rendered");
                    if let Some(dedup) = self.dedup.as_mut() {
                        dedup.stop();
                    }
                    self.watcher.stop();

                    let exit_rx = self.child.read().await.as_ref().map(Child::exit_rx);
                    if let Some(mut exit_rx) = exit_rx {
                        tracing::info!("waiting for child process to exit");
                        tokio::select! {
                            code = wait_exit(&mut exit_rx) => {
                                return Err(RunnerError::ChildDied(code));
                            }
                            _ = self.stop.cancelled() => {}
                        }
                    }
                    return Ok(());
                }
            }

            let mut child_exit_rx = self.child.read().await.as_ref().map(Child::exit_rx);

            let wake = {
                let data_rx = &mut self.data_rx;
                let watch_err_rx = &mut self.watch_err_rx;
                let quiescence_rx = &mut self.quiescence_rx;
                let stop = &self.stop;

                tokio::select! {
                    Some(event) = data_rx.recv() => Wake::Data(event),
                    _ = dedup_update(&mut dedup_rx) => Wake::Dedup,
                    Some(err) = watch_err_rx.recv() => Wake::WatchErr(err),
                    Some(id) = quiescence_rx.recv() => Wake::Quiescence(id),
                    code = child_exit(&mut child_exit_rx) => Wake::ChildExit(code),
                    _ = stop.cancelled() => Wake::Shutdown,
                }
            };

            match wake {
                Wake::Data(event) => {
                    self.receive(event);
                    // Drain everything else the views buffered: rendering
                    // with a partial view of a multi-dependency update is
                    // both wasted work and wrong output.
                    while let Ok(event) = self.data_rx.try_recv() {
                        self.receive(event);
                    }
                }
                Wake::Dedup => {
                    tracing::info!("triggered by de-duplication manager");
                }
                Wake::WatchErr(err) => {
                    if err.should_exit() {
                        tracing::debug!("watcher error asked for hard exit");
                        return Err(RunnerError::Fetch(err));
                    }
                    tracing::error!(error = %err, "watcher reported error");
                    if self.once {
                        return Err(RunnerError::Fetch(err));
                    }
                }
                Wake::Quiescence(id) => {
                    tracing::info!(template = %id, "quiescence window closed");
                    self.quiescence_map.remove(&id);
                }
                Wake::ChildExit(code) => {
                    tracing::info!(code, "child process died");
                    return Err(RunnerError::ChildDied(code));
                }
                Wake::Shutdown => {
                    tracing::info!("received stop request");
                    return Ok(());
                }
            }

            self.run().await?;
        }
    }

    // -- render pass -------------------------------------------------------

    /// One full sweep over all templates: evaluate, subscribe, dampen,
    /// write, then reconcile subscriptions and execute accumulated commands.
    async fn run(&mut self) -> Result<(), RunnerError> {
        tracing::debug!("initiating render pass");

        let mut would_render_any = false;
        let mut rendered_any = false;
        let mut commands: Vec<TemplateConfig> = Vec::new();
        let mut deps_map: HashMap<DepKey, Dependency> = HashMap::new();

        let run_env = self.child_env();

        for template in self.templates.clone() {
            let id = template.id().clone();
            tracing::debug!(template = %id, "checking template");

            let is_leader = self
                .dedup
                .as_ref()
                .map(|dedup| dedup.is_leader(&id))
                .unwrap_or(true);

            if self.once && self.has_render_event(&id) {
                tracing::debug!(template = %id, "once mode and already rendered");
                continue;
            }

            let result = template.execute(&ExecuteInput {
                brain: &self.brain,
                env: &run_env,
            })?;
            let output = result.output;
            let used = result.used;
            let mut missing = result.missing;

            for dep in &used {
                // A freshly-elected leader may hold cached data without the
                // watch; treat those as missing so its own views start.
                if is_leader && !self.watcher.watching(dep) {
                    missing.push(dep.clone());
                }
                deps_map.entry(dep.key()).or_insert_with(|| dep.clone());
            }

            let unwatched: Vec<Dependency> = missing
                .iter()
                .filter(|dep| !self.watcher.watching(dep))
                .cloned()
                .collect();
            if !unwatched.is_empty() {
                tracing::info!(
                    template = %id,
                    count = unwatched.len(),
                    "was not watching dependencies",
                );
                for dep in unwatched {
                    // Followers still fetch unshareable dependencies locally.
                    if is_leader || !dep.can_share() {
                        self.watcher.add(dep);
                    }
                }
                continue;
            }

            if !missing.is_empty() {
                tracing::info!(
                    template = %id,
                    count = missing.len(),
                    "missing data for dependencies",
                );
                continue;
            }

            if is_leader {
                if let Some(dedup) = self.dedup.as_mut() {
                    if let Err(err) = dedup.update_deps(&id, &used) {
                        tracing::error!(
                            error = %err,
                            "failed to update dependency data for de-duplication",
                        );
                    }
                }
            }

            if let Some(quiescence) = self.quiescence_map.get_mut(&id) {
                quiescence.tick();
                continue;
            }

            let configs = self.ctemplates.get(&id).cloned().unwrap_or_default();
            for tconfig in configs {
                let result = sink::render(
                    &RenderInput {
                        contents: &output,
                        path: &tconfig.destination,
                        perms: tconfig.perms,
                        backup: tconfig.backup,
                        dry: self.dry,
                    },
                    self.dry_stream.as_mut(),
                )?;
                tracing::debug!(
                    template = %id,
                    would_render = result.would_render,
                    did_render = result.did_render,
                    "sink result",
                );

                if result.would_render {
                    self.mark_render_time(&id, false);
                    would_render_any = true;
                }

                if result.did_render {
                    rendered_any = true;
                    self.mark_render_time(&id, true);

                    if !self.dry {
                        if let Some(command) = tconfig.command.as_deref() {
                            let duplicate = commands
                                .iter()
                                .any(|c| c.command.as_deref() == Some(command));
                            if !command.is_empty() && !duplicate {
                                tracing::trace!(command, "appending command");
                                commands.push(tconfig.clone());
                            }
                        }
                    }
                }
            }
        }

        if would_render_any || rendered_any {
            // Single-slot channel: concurrent renders coalesce into at most
            // one pending notification.
            let _ = self.rendered_tx.try_send(());
        }

        self.diff_and_update_deps(deps_map);

        // Execute every command even when an earlier one fails.
        let mut errs: Vec<RunnerError> = Vec::new();
        for tconfig in &commands {
            let command = tconfig.command.clone().unwrap_or_default();
            let mut cmd_env = run_env.clone();
            cmd_env.extend(tconfig.env.clone());
            let outcome = command::run(&CommandInput {
                command: &command,
                env: cmd_env,
                timeout: Some(tconfig.command_timeout()),
                kill_signal: tconfig.kill_signal,
                kill_timeout: tconfig.kill_timeout(),
                splay: tconfig.splay(),
            })
            .await;
            if let Err(err) = outcome {
                errs.push(err);
            }
        }

        if rendered_any {
            if let Some(child) = self.child.read().await.as_ref() {
                if let Err(err) = child.reload().await {
                    errs.push(err);
                }
            }
        }

        match RunnerError::aggregate(errs) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    // -- helpers -----------------------------------------------------------

    /// Cache a watcher delivery, unless the dependency was retired while the
    /// event sat in the channel pool. Stale values must never re-enter the
    /// brain.
    fn receive(&mut self, event: DataEvent) {
        let key = event.dependency.key();
        if self.dependencies.contains_key(&key) {
            tracing::debug!(dependency = %key, "receiving dependency");
            self.brain.remember(key, event.value);
        } else {
            tracing::debug!(dependency = %key, "ignoring retired dependency");
        }
    }

    /// Install quiescence records for templates that declare (or inherit) a
    /// wait window and do not have one active. Idempotent per iteration.
    fn enable_quiescence(&mut self) {
        for template in &self.templates {
            let id = template.id();
            if self.quiescence_map.contains_key(id) {
                continue;
            }
            let wait = self
                .ctemplates
                .get(id)
                .and_then(|configs| configs.iter().find_map(|c| c.wait))
                .or(self.config.wait);
            if let Some(wait) = wait {
                tracing::debug!(template = %id, "enabling quiescence");
                self.quiescence_map.insert(
                    id.clone(),
                    Quiescence::new(
                        self.quiescence_tx.clone(),
                        wait.min(),
                        wait.max(),
                        id.clone(),
                    ),
                );
            }
        }
    }

    /// Unsubscribe and forget every dependency the pass no longer uses, then
    /// adopt the fresh set.
    fn diff_and_update_deps(&mut self, deps_map: HashMap<DepKey, Dependency>) {
        tracing::debug!("diffing and updating dependencies");
        for (key, dep) in &self.dependencies {
            if !deps_map.contains_key(key) {
                tracing::debug!(dependency = %key, "no longer needed");
                self.watcher.remove(dep);
                self.brain.forget(key);
            }
        }
        self.dependencies = deps_map;
    }

    async fn ensure_child(&mut self, exec: &ExecConfig) -> Result<(), RunnerError> {
        let mut slot = self.child.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut child_env = self.child_env();
        child_env.extend(exec.env.clone());
        let child = Child::spawn(&SpawnInput {
            command: &exec.command,
            env: child_env,
            reload_signal: exec.reload_signal,
            kill_signal: exec.kill_signal,
            kill_timeout: exec.kill_timeout(),
            splay: exec.splay(),
        })?;
        *slot = Some(child);
        Ok(())
    }

    fn child_env(&self) -> HashMap<String, String> {
        env::child_env(&self.config, &self.env)
    }

    fn has_render_event(&self, id: &TemplateId) -> bool {
        self.render_events
            .read()
            .expect("render events lock poisoned")
            .contains_key(id)
    }

    fn all_templates_rendered(&self) -> bool {
        let events = self
            .render_events
            .read()
            .expect("render events lock poisoned");
        self.templates
            .iter()
            .all(|template| events.contains_key(template.id()))
    }

    fn mark_render_time(&self, id: &TemplateId, did_render: bool) {
        let mut events = self
            .render_events
            .write()
            .expect("render events lock poisoned");
        let event = events.entry(id.clone()).or_default();
        let now = Utc::now();
        if did_render {
            event.last_did_render = Some(now);
        } else {
            event.last_would_render = Some(now);
        }
    }

    /// Teardown order matters: dedup first (release leadership), then the
    /// watcher, then the child, then the pid file.
    async fn cleanup(&mut self) {
        tracing::info!("runner stopping");
        if let Some(dedup) = self.dedup.as_mut() {
            dedup.stop();
        }
        self.watcher.stop();

        if let Some(child) = self.child.write().await.take() {
            child.stop().await;
        }

        if let Some(path) = &self.config.pid_file {
            if let Err(err) = pid::remove(path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "could not remove pid file",
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Select helpers
// ---------------------------------------------------------------------------

/// Resolves on the next dedup generation bump; pends forever without a
/// manager or after the manager goes away.
async fn dedup_update(rx: &mut Option<watch::Receiver<u64>>) {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

/// Resolves with the child's exit code; pends forever without a child.
async fn child_exit(rx: &mut Option<watch::Receiver<Option<i32>>>) -> i32 {
    match rx {
        Some(rx) => wait_exit(rx).await,
        None => std::future::pending().await,
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<i32>>) -> i32 {
    let result = rx
        .wait_for(|code| code.is_some())
        .await
        .map(|code| code.unwrap_or(-1));
    match result {
        Ok(code) => code,
        // waiter gone without reporting: treat as unknowable, stay pending
        Err(_) => std::future::pending().await,
    }
}
