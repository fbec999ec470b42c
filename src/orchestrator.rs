//! # Update Orchestrator
//!
//! Runs one refresh cycle per user action:
//!
//! ```text
//! Idle -> Executing(op) -> FetchingRegisters -> FetchingMemory -> FetchingBacktrace
//!      -> Rendering -> Idle
//! ```
//!
//! Any fetching state can end in `ErrorHandling`. A sync failure (busy target, no target, an
//! unclassified backend failure) produces a diagnostic and defers one refresh until the backend
//! answers again. Failures local to one step (a short read, a missing section) only produce a
//! diagnostic, and what was shown before stays on screen.
//!
//! Nothing but the stack watermark, the register history, the execution classifier and the
//! sync session outlives a cycle.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::addr::Addr;
use crate::analysis::StaticAnalysis;
use crate::classifier::{ExecutionClassifier, Location};
use crate::client::{ExecOp, LiveBackend, SyncClient};
use crate::config::LiveConfig;
use crate::diagnostic::Diagnostic;
use crate::errors::{FailureKind, LiveError};
use crate::memorymap::{ProcessLocator, ProcessMemoryMap};
use crate::registers::{RegisterSnapshot, RegisterTracker};
use crate::retaddr::{estimate_return_slot, Estimate, LiveFrame, UnknownReason};
use crate::session::DeferredTask;
use crate::stack::{StackWatermark, StackWindowManager};
use crate::surface::AnalysisSurface;
use crate::ui::{Action, Presenter};
use crate::window::{HighlightRole, MemoryWindow};

pub const STACK_WINDOW: &str = "stack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Executing(ExecOp),
    FetchingRegisters,
    FetchingMemory,
    FetchingBacktrace,
    Rendering,
    ErrorHandling,
}

/// How a refresh cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    /// The backend could not answer, a refresh is deferred until it does
    Deferred(FailureKind),
    /// A step failed locally, the cycle was dropped
    Aborted,
}

pub struct Orchestrator<B: LiveBackend, P: Presenter> {
    client: SyncClient<B>,
    presenter: P,
    analysis: Box<dyn StaticAnalysis>,
    locator: Box<dyn ProcessLocator>,
    config: LiveConfig,
    process_name: String,
    state: CycleState,
    windows: StackWindowManager,
    classifier: ExecutionClassifier,
    registers: RegisterTracker,
    return_address: Option<Addr>,
}

impl<B: LiveBackend, P: Presenter> Orchestrator<B, P> {
    /// The process is looked up by the file name of the analysed binary, see
    /// [`Self::set_process_name`] to attach to something else.
    pub fn new(
        backend: B,
        presenter: P,
        analysis: Box<dyn StaticAnalysis>,
        locator: Box<dyn ProcessLocator>,
        config: LiveConfig,
    ) -> Self {
        let process_name =
            crate::memorymap::process_name_for(Path::new(analysis.file_name()), None);
        Self {
            client: SyncClient::new(backend, config.connect_policy()),
            presenter,
            analysis,
            locator,
            process_name,
            state: CycleState::Idle,
            windows: StackWindowManager::new(config.alignment),
            classifier: ExecutionClassifier::new(),
            registers: RegisterTracker::new(),
            return_address: None,
            config,
        }
    }

    pub fn set_process_name(&mut self, name: impl Into<String>) {
        self.process_name = name.into();
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn watermark(&self) -> StackWatermark {
        self.windows.watermark()
    }

    pub fn classifier(&self) -> &ExecutionClassifier {
        &self.classifier
    }

    pub fn client(&self) -> &SyncClient<B> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut SyncClient<B> {
        &mut self.client
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    /// The last return address that could be read from the stack
    pub fn return_address(&self) -> Option<Addr> {
        self.return_address
    }

    pub fn attach_secondary_surface(&mut self, surface: Box<dyn AnalysisSurface>) {
        self.classifier.attach_secondary_surface(surface);
    }

    /// Establishes the live session
    ///
    /// Connects to the backend, stops at `main` if configured, and routes the target's
    /// standard streams to `tty`. Returns `false` if the backend could not be reached.
    pub fn enable(&mut self, tty: Option<&Path>) -> bool {
        if !self.client.connect() {
            self.report(Diagnostic::ConnectionFailed);
            return false;
        }

        if self.config.break_at_main {
            match self.analysis.function_by_name("main") {
                Some(main) => {
                    if let Err(e) = self.client.set_breakpoint(main.start) {
                        warn!("could not stop at main: {e}");
                        self.report(Diagnostic::ExecutionFailed(e.to_string()));
                    }
                }
                None => self.report(Diagnostic::NoMainFunction),
            }
        }

        if let Some(tty) = tty {
            if let Err(e) = self.client.redirect_io(tty) {
                self.report(Diagnostic::ExecutionFailed(e.to_string()));
            }
        }
        true
    }

    pub fn set_arguments(&mut self, args: &[String]) {
        if let Err(e) = self.client.set_arguments(args) {
            self.report(Diagnostic::ExecutionFailed(e.to_string()));
        }
    }

    /// Carries out a user action, `false` means the user wants to quit
    pub fn handle(&mut self, action: Action) -> bool {
        trace!("handling {action:?}");
        match action {
            Action::Exec(op) => {
                self.execute(op);
            }
            Action::SetBreakpoint(addr) => {
                if let Err(e) = self.client.set_breakpoint(addr) {
                    self.report(Diagnostic::ExecutionFailed(e.to_string()));
                }
            }
            Action::SetTty(tty) => {
                if let Err(e) = self.client.redirect_io(&tty) {
                    self.report(Diagnostic::ExecutionFailed(e.to_string()));
                }
            }
            Action::SetArguments(args) => self.set_arguments(&args),
            Action::Refresh => {
                self.refresh();
            }
            Action::Poll => {
                self.poll();
            }
            Action::Quit => return false,
        }
        true
    }

    /// Hands `op` to the backend, then refreshes
    pub fn execute(&mut self, op: ExecOp) -> CycleOutcome {
        self.transition(CycleState::Executing(op));
        if op == ExecOp::Run {
            self.begin_process();
        }
        if let Err(e) = self.client.execution_control(op) {
            warn!("{op:?} failed: {e}");
            let diagnostic = match e.failure_kind() {
                Some(kind @ (FailureKind::Busy | FailureKind::NoTarget)) => {
                    Diagnostic::for_failure(kind, &e)
                }
                _ => Diagnostic::ExecutionFailed(e.to_string()),
            };
            self.report(diagnostic);
            self.transition(CycleState::Idle);
            return CycleOutcome::Aborted;
        }
        self.refresh()
    }

    /// Runs one refresh cycle, then the refreshes that were released by it
    pub fn refresh(&mut self) -> CycleOutcome {
        let outcome = self.cycle();
        self.run_deferred();
        outcome
    }

    /// Checks whether deferred refreshes can run now, and runs them
    ///
    /// Returns the number of refreshes that ran.
    pub fn poll(&mut self) -> usize {
        self.client.pump_signals();
        if self.client.session().has_pending() {
            self.client.sync();
        }
        self.run_deferred()
    }

    fn run_deferred(&mut self) -> usize {
        let tasks = self.client.take_ready();
        for task in &tasks {
            match task {
                DeferredTask::Refresh { after } => {
                    debug!("running the refresh deferred after {after:?}");
                    self.cycle();
                }
            }
        }
        tasks.len()
    }

    /// Forget everything learned about the previous process
    fn begin_process(&mut self) {
        let generation = self.client.session_mut().begin_generation();
        info!("starting session generation {generation}");
        self.windows.reset();
        self.classifier.reset();
        self.registers.reset();
        self.return_address = None;
    }

    fn cycle(&mut self) -> CycleOutcome {
        let outcome = self.run_cycle();
        self.transition(CycleState::Idle);
        outcome
    }

    fn run_cycle(&mut self) -> CycleOutcome {
        self.transition(CycleState::FetchingRegisters);
        let snapshot = match self.client.fetch_registers() {
            Ok(s) => s,
            Err(e) => return self.sync_failure(&e),
        };
        let frame = match self.live_frame(&snapshot) {
            Ok(f) => f,
            Err(e) => {
                self.report(Diagnostic::SyncFailed(e.to_string()));
                return CycleOutcome::Aborted;
            }
        };
        let mut view = self.registers.render(&snapshot, self.analysis.arch());

        self.transition(CycleState::FetchingMemory);
        let windows = match self.fetch_windows(&frame) {
            Ok(w) => w,
            Err(outcome) => {
                self.presenter.update_registers(&view);
                return outcome;
            }
        };
        view.resolve_derefs(&windows, self.analysis.arch().pointer_width);
        self.presenter.update_registers(&view);
        self.presenter.redraw();

        self.transition(CycleState::FetchingBacktrace);
        match self.client.fetch_backtrace() {
            Ok(frames) => self.presenter.update_frames(&frames),
            Err(e) if e.failure_kind().is_some() => return self.sync_failure(&e),
            Err(e) => self.report(Diagnostic::ReadFailure(e.to_string())),
        }

        self.transition(CycleState::Rendering);
        self.render_return_address(&frame, &windows[0]);
        CycleOutcome::Completed
    }

    fn live_frame(&self, snapshot: &RegisterSnapshot) -> crate::errors::Result<LiveFrame> {
        let arch = self.analysis.arch();
        Ok(LiveFrame {
            ip: snapshot.require(&arch.ip)?,
            sp: snapshot.require(&arch.sp)?,
            fp: snapshot.require(&arch.fp)?,
        })
    }

    /// Fetches and shows the stack window and every further configured segment
    ///
    /// The stack window comes first in the returned windows.
    fn fetch_windows(&mut self, frame: &LiveFrame) -> Result<Vec<MemoryWindow>, CycleOutcome> {
        let map = match self.locator.memory_map(&self.process_name) {
            Ok(Some(map)) => map,
            Ok(None) => {
                return Err(self.abort(Diagnostic::NoMemory(format!(
                    "no running process is called {}",
                    self.process_name
                ))))
            }
            Err(e) => return Err(self.abort(Diagnostic::NoMemory(e.to_string()))),
        };
        trace!("memory map of {}:\n{map}", self.process_name);
        self.analysis.relocate(&map);

        let Some(region) = map.region(STACK_WINDOW) else {
            return Err(self.abort(Diagnostic::NoMemory(format!(
                "process {} has no stack mapping",
                map.pid
            ))));
        };
        let (low, high) = (region.start_address, region.end_address);
        let Some(span) = self.windows.update(frame.sp, low, high) else {
            return Err(self.abort(Diagnostic::ReadFailure(format!(
                "the stack pointer {} is outside of the stack",
                frame.sp
            ))));
        };
        trace!("stack window is {}..{}", span.base, span.end);

        let window = self.fetch_window(STACK_WINDOW, span.base, span.len())?;
        self.presenter.update_memory(&window);

        let width = self.analysis.arch().pointer_width;
        for (role, addr) in [
            (HighlightRole::StackPointer, frame.sp),
            (HighlightRole::FramePointer, frame.fp),
        ] {
            match window.highlight(role, addr, width) {
                Some(h) => self.presenter.highlight(STACK_WINDOW, h),
                None => debug!("{role:?} at {addr} is not inside the stack window"),
            }
        }

        let classification = self
            .classifier
            .classify(frame.ip, &window, self.analysis.arch());
        if classification.location == Location::InWindow {
            if let Some(h) = window.highlight(HighlightRole::InstructionPointer, frame.ip, width) {
                self.presenter.highlight(STACK_WINDOW, h);
            }
        }

        let segments: Vec<String> = self
            .config
            .segments
            .iter()
            .filter(|s| s.as_str() != STACK_WINDOW)
            .cloned()
            .collect();
        let mut windows = vec![window];
        for name in segments {
            windows.extend(self.show_segment(&name, &map)?);
        }
        Ok(windows)
    }

    /// Shows a further named region, a static section or a named mapping
    fn show_segment(
        &mut self,
        name: &str,
        map: &ProcessMemoryMap,
    ) -> Result<Option<MemoryWindow>, CycleOutcome> {
        let span = match self.analysis.section(name) {
            Some(section) => Some((section.start, section.len)),
            None => map.region(name).map(|r| (r.start_address, r.size)),
        };
        let Some((base, len)) = span.filter(|(_, len)| *len > 0) else {
            self.report(Diagnostic::NoMemoryRegion(name.to_string()));
            return Ok(None);
        };
        match self.fetch_window(name, base, len) {
            Ok(window) => {
                self.presenter.update_memory(&window);
                Ok(Some(window))
            }
            Err(CycleOutcome::Aborted) => Ok(None),
            Err(outcome) => Err(outcome),
        }
    }

    fn fetch_window(
        &mut self,
        name: &str,
        base: Addr,
        len: usize,
    ) -> Result<MemoryWindow, CycleOutcome> {
        let bytes = match self.client.fetch_memory(base, len) {
            Ok(b) => b,
            Err(e) if e.failure_kind().is_some() => return Err(self.sync_failure(&e)),
            Err(e) => return Err(self.abort(Diagnostic::ReadFailure(e.to_string()))),
        };
        let max = self.analysis.arch().max_address();
        MemoryWindow::new(name, base, bytes, len, max)
            .map_err(|e| self.abort(Diagnostic::ReadFailure(e.to_string())))
    }

    fn render_return_address(&mut self, frame: &LiveFrame, stack: &MemoryWindow) {
        let width = self.analysis.arch().pointer_width;
        let estimate = estimate_return_slot(self.analysis.as_ref(), frame);
        match &estimate {
            Estimate::Exact(slot) => trace!("return address is stored at {slot}"),
            Estimate::Ambiguous { chosen, candidates } => {
                self.report(Diagnostic::AmbiguousReturn {
                    chosen: *chosen,
                    candidates: candidates.clone(),
                });
            }
            Estimate::Unknown(UnknownReason::UnresolvedFunction) => {
                self.report(Diagnostic::UnresolvedFunction(frame.ip));
            }
            Estimate::Unknown(UnknownReason::NoReturnSites) => {
                debug!("no return sites are known here, using the frame pointer");
            }
        }

        let Some(slot) = estimate.location_or_fallback(frame, width) else {
            self.report(Diagnostic::ReturnAddressUnresolved(frame.fp));
            return;
        };
        let highlight = stack.highlight(HighlightRole::ReturnAddress, slot, width);
        match (highlight, stack.read_pointer(slot, width)) {
            (Some(h), Some(value)) => {
                let value = Addr::from(value);
                self.presenter.highlight(STACK_WINDOW, h);
                self.presenter.update_return_address(value);
                self.return_address = Some(value);
            }
            // the previous value stays on display
            _ => self.report(Diagnostic::ReturnAddressUnresolved(slot)),
        }
    }

    /// The backend could not answer: report it and defer a refresh
    fn sync_failure(&mut self, e: &LiveError) -> CycleOutcome {
        self.transition(CycleState::ErrorHandling);
        let kind = e.failure_kind().unwrap_or(FailureKind::Unknown);
        self.report(Diagnostic::for_failure(kind, e));
        if kind == FailureKind::Busy {
            self.presenter.focus_terminal();
        }
        if self.client.session().has_pending() {
            debug!("a refresh is already deferred");
        } else {
            self.client
                .register_one_shot_retry(DeferredTask::Refresh { after: kind });
        }
        CycleOutcome::Deferred(kind)
    }

    fn abort(&mut self, diagnostic: Diagnostic) -> CycleOutcome {
        self.transition(CycleState::ErrorHandling);
        self.report(diagnostic);
        CycleOutcome::Aborted
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        self.presenter.diagnostic(&diagnostic);
    }

    fn transition(&mut self, next: CycleState) {
        trace!("{:?} -> {next:?}", self.state);
        self.state = next;
    }
}
